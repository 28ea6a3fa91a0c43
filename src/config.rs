//! Configuration of a token context.
//!
//! A [`Config`] always selects exactly one token. Configuration read from a
//! file is first deserialized into a [`ConfigFile`] and then checked when it
//! is converted, so an invalid file is rejected before the token library is
//! touched.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::Error;

//------------ Constants -----------------------------------------------------

/// The session ceiling used when no maximum is configured.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

//------------ TokenSelector -------------------------------------------------

/// How to pick the token to use out of the slots the library reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenSelector {
    /// The slot with this number (the PKCS#11 slot ID).
    Slot(u64),

    /// The token with this label.
    Label(String),

    /// The token with this serial number.
    Serial(String),
}

impl fmt::Display for TokenSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenSelector::Slot(slot) => write!(f, "slot number {}", slot),
            TokenSelector::Label(label) => write!(f, "token label '{}'", label),
            TokenSelector::Serial(serial) => write!(f, "token serial '{}'", serial),
        }
    }
}

//------------ Config --------------------------------------------------------

#[derive(Debug)]
pub struct Config {
    path: PathBuf,
    selector: TokenSelector,

    // The PIN is optional: a token with a protected authentication path expects C_Login to be called without one.
    pin: Option<SecretString>,

    max_sessions: usize,
    pool_wait_timeout: Option<Duration>,
    login_not_supported: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>, selector: TokenSelector) -> Self {
        Config {
            path: path.into(),
            selector,
            pin: None,
            max_sessions: 0,
            pool_wait_timeout: None,
            login_not_supported: false,
        }
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(SecretString::new(pin.into()));
        self
    }

    /// Sets the maximum number of sessions, including the anchor session. Zero means the default.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Sets how long to wait for a session before giving up. A zero duration waits forever.
    pub fn with_pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool_wait_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn with_login_not_supported(mut self, login_not_supported: bool) -> Self {
        self.login_not_supported = login_not_supported;
        self
    }

    /// Reads a JSON config file, or a TOML config file if the file name ends in `.toml`.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Config::try_from(ConfigFile::read(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn selector(&self) -> &TokenSelector {
        &self.selector
    }

    pub fn pin(&self) -> Option<&SecretString> {
        self.pin.as_ref()
    }

    /// The configured session maximum with zero resolved to the default.
    pub fn max_sessions(&self) -> usize {
        match self.max_sessions {
            0 => DEFAULT_MAX_SESSIONS,
            max => max,
        }
    }

    pub fn pool_wait_timeout(&self) -> Option<Duration> {
        self.pool_wait_timeout
    }

    pub fn login_not_supported(&self) -> bool {
        self.login_not_supported
    }

    /// Identifies the library in the library registry.
    pub fn library_id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Checks what the builder methods cannot: the path and the selector must not be empty.
    pub fn validate(&self) -> Result<(), Error> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::invalid_config("the library path must not be empty"));
        }
        match &self.selector {
            TokenSelector::Label(label) if label.is_empty() => {
                Err(Error::invalid_config("the token label must not be empty"))
            }
            TokenSelector::Serial(serial) if serial.is_empty() => {
                Err(Error::invalid_config("the token serial must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

//------------ ConfigFile ----------------------------------------------------

/// The raw configuration as found in a config file.
///
/// Every key may also be spelled in upper camel case (`TokenLabel`,
/// `MaxSessions` and so on). Note that `PoolWaitTimeout` is given in
/// nanoseconds while `pool_wait_timeout` is given in seconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(alias = "Path")]
    pub path: PathBuf,

    #[serde(default, alias = "TokenSerial")]
    pub token_serial: Option<String>,

    #[serde(default, alias = "TokenLabel")]
    pub token_label: Option<String>,

    #[serde(default, alias = "SlotNumber")]
    pub slot_number: Option<u64>,

    #[serde(default, alias = "Pin")]
    pub pin: Option<SecretString>,

    #[serde(default, alias = "MaxSessions")]
    pub max_sessions: usize,

    /// Seconds to wait for a free session, zero for no limit.
    #[serde(default)]
    pub pool_wait_timeout: Option<u64>,

    /// Nanoseconds to wait for a free session, zero for no limit.
    #[serde(default, rename = "PoolWaitTimeout")]
    pub pool_wait_timeout_nanos: Option<u64>,

    #[serde(default, alias = "LoginNotSupported")]
    pub login_not_supported: bool,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, Error> {
        let config_err = |reason: String| Error::ConfigFile {
            path: path.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content).map_err(|e| config_err(e.to_string()))
        } else {
            serde_json::from_str(&content).map_err(|e| config_err(e.to_string()))
        }
    }
}

impl TryFrom<ConfigFile> for Config {
    type Error = Error;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());

        let mut selectors = vec![];
        if let Some(slot) = file.slot_number {
            selectors.push(TokenSelector::Slot(slot));
        }
        if let Some(label) = non_empty(file.token_label) {
            selectors.push(TokenSelector::Label(label));
        }
        if let Some(serial) = non_empty(file.token_serial) {
            selectors.push(TokenSelector::Serial(serial));
        }

        if selectors.len() != 1 {
            return Err(Error::invalid_config(format!(
                "exactly one of token_serial, token_label and slot_number must be given, found {}",
                selectors.len()
            )));
        }

        let pool_wait_timeout = match (file.pool_wait_timeout, file.pool_wait_timeout_nanos) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_config(
                    "pool_wait_timeout and PoolWaitTimeout must not both be given",
                ));
            }
            (Some(secs), None) => Duration::from_secs(secs),
            (None, Some(nanos)) => Duration::from_nanos(nanos),
            (None, None) => Duration::ZERO,
        };

        let selector = selectors.remove(0);

        let config = Config {
            path: file.path,
            selector,
            pin: file.pin,
            max_sessions: file.max_sessions,
            pool_wait_timeout: Some(pool_wait_timeout).filter(|timeout| !timeout.is_zero()),
            login_not_supported: file.login_not_supported,
        };
        config.validate()?;
        Ok(config)
    }
}

//------------ Tests ---------------------------------------------------------
