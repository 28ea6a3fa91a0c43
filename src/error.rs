//! Errors reported by contexts, pools and key handles.

use std::{fmt, path::PathBuf, time::Duration};

use openssl::error::ErrorStack;

//------------ TokenErrorKind ------------------------------------------------

/// The class of failure reported by a token call.
///
/// Only the return values that this crate acts upon, or that are useful to
/// tell apart when reporting, get their own kind. Everything else is `Other`
/// and the details live in the message of the [`TokenError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenErrorKind {
    AlreadyInitialized,
    NotInitialized,
    UserAlreadyLoggedIn,
    UserNotLoggedIn,
    PinIncorrect,
    SessionCount,
    ObjectHandleInvalid,
    KeyTypeInconsistent,
    MechanismInvalid,
    TemplateIncomplete,
    TokenNotPresent,
    FunctionFailed,
    Other,
}

//------------ TokenError ----------------------------------------------------

/// A failed call into the token API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenError {
    function: &'static str,
    kind: TokenErrorKind,
    message: String,
}

impl TokenError {
    pub fn new(function: &'static str, kind: TokenErrorKind, message: impl Into<String>) -> Self {
        TokenError {
            function,
            kind,
            message: message.into(),
        }
    }

    /// The name of the token API function that failed, e.g. `C_Login`.
    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn kind(&self) -> TokenErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} failed: {}", self.function, self.message)
    }
}

impl std::error::Error for TokenError {}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// The configuration does not select exactly one token, or is otherwise unusable.
    InvalidConfig(String),

    /// A configuration file could not be read or parsed.
    ConfigFile { path: PathBuf, reason: String },

    /// No slot holds a token matching the configured selector.
    TokenNotFound(String),

    /// The token provider library could not be loaded.
    LibraryLoadFailed { path: PathBuf, reason: String },

    /// The token provider library could not be initialized.
    InitializeFailed(TokenError),

    /// A session could not be opened.
    SessionOpenFailed(String),

    /// Logging in to the token failed.
    LoginFailed(TokenError),

    /// No session became available within the configured time.
    PoolTimeout(Duration),

    /// The context (or its pool) has been closed.
    Closed,

    /// A token object could not be destroyed.
    DestroyFailed(TokenError),

    /// A caller supplied argument was rejected before reaching the token.
    InvalidArgument(String),

    /// A key object that was expected to exist could not be found.
    KeyNotFound(String),

    /// A search for a single key matched more than one key.
    DuplicateKey(String),

    /// Key material reported by the token could not be decoded.
    KeyDecode(String),

    /// A token operation failed.
    Token { operation: String, error: TokenError },

    OpenSslError(ErrorStack),
}

impl Error {
    /// Wraps a token failure with a description of the operation that was attempted.
    pub fn token(operation: impl Into<String>, error: TokenError) -> Self {
        Error::Token {
            operation: operation.into(),
            error,
        }
    }

    pub fn invalid_config(msg: impl fmt::Display) -> Self {
        Error::InvalidConfig(msg.to_string())
    }

    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    /// Returns the underlying token failure, if there is one.
    pub fn token_error(&self) -> Option<&TokenError> {
        match self {
            Error::InitializeFailed(err)
            | Error::LoginFailed(err)
            | Error::DestroyFailed(err)
            | Error::Token { error: err, .. } => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidConfig(e) => write!(f, "Invalid configuration: {}", e),
            Error::ConfigFile { path, reason } => {
                write!(f, "Cannot use config file '{}': {}", path.display(), reason)
            }
            Error::TokenNotFound(selector) => write!(f, "Could not find PKCS#11 token with {}", selector),
            Error::LibraryLoadFailed { path, reason } => {
                write!(f, "Failed to load PKCS#11 library '{}': {}", path.display(), reason)
            }
            Error::InitializeFailed(e) => write!(f, "Failed to initialize PKCS#11 library: {}", e),
            Error::SessionOpenFailed(e) => write!(f, "Failed to open PKCS#11 session: {}", e),
            Error::LoginFailed(e) => write!(f, "Failed to log in to PKCS#11 token: {}", e),
            Error::PoolTimeout(waited) => {
                write!(f, "Timed out after {}ms waiting for a PKCS#11 session", waited.as_millis())
            }
            Error::Closed => write!(f, "Cannot use a closed context"),
            Error::DestroyFailed(e) => write!(f, "Failed to destroy key: {}", e),
            Error::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            Error::KeyNotFound(e) => write!(f, "Could not find key: {}", e),
            Error::DuplicateKey(e) => write!(f, "More than one key found: {}", e),
            Error::KeyDecode(e) => write!(f, "Could not decode key: {}", e),
            Error::Token { operation, error } => write!(f, "{}: {}", operation, error),
            Error::OpenSslError(e) => write!(f, "OpenSsl Error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        let operation = e.function().to_string();
        Error::Token { operation, error: e }
    }
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSslError(e)
    }
}

//------------ Tests ---------------------------------------------------------
