//! A shared connection to a single token.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    config::{Config, TokenSelector},
    error::{Error, TokenErrorKind},
    pool::{PoolState, SessionFactory, SessionPool},
    provider::{Provider, TokenInfo, TokenSession},
    registry::LibraryRegistry,
};

#[cfg(feature = "pkcs11")]
use crate::provider::pkcs11::Pkcs11Provider;

/// A context talking to a native PKCS#11 library.
#[cfg(feature = "pkcs11")]
pub type Pkcs11Context = Context<Pkcs11Provider>;

//------------ Context -------------------------------------------------------

/// One logical connection to one token.
///
/// A context keeps a single session open and logged in for as long as it
/// lives. The token remembers the login for all other sessions of the
/// process, which are leased from a pool for the duration of one operation
/// each through [`Context::with_session`].
///
/// A context can be shared by any number of threads. It is closed by
/// [`Context::close`], or when dropped.
pub struct Context<P: Provider> {
    config: Config,
    registry: Arc<LibraryRegistry>,
    library: String,

    // Taken, and released, when the context is closed.
    provider: Mutex<Option<Arc<P>>>,

    token: TokenInfo,
    pool: SessionPool<SessionFactory<P>>,

    // Keeps the login state of the token alive.
    anchor: Mutex<Option<P::Session>>,

    closed: AtomicBool,
}

impl<P: Provider> fmt::Debug for Context<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("library", &self.library)
            .field("token", &self.token)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<P: Provider> Context<P> {
    /// Opens a context using the process wide library registry.
    pub fn open(config: Config) -> Result<Self, Error> {
        Self::open_with_registry(config, LibraryRegistry::global())
    }

    /// Opens a context with the configuration read from a JSON or TOML file.
    pub fn open_from_file(path: &Path) -> Result<Self, Error> {
        Self::open(Config::from_file(path)?)
    }

    /// Opens a context that keeps track of its library in the given registry.
    pub fn open_with_registry(config: Config, registry: Arc<LibraryRegistry>) -> Result<Self, Error> {
        config.validate()?;
        let library = config.library_id();

        // No other context may initialize or finalize the library until this one is done opening.
        let mut usage = registry.lock();

        let provider = Arc::new(P::load(config.path())?);

        let initialized_here = if usage.is_in_use(&library) {
            debug!("PKCS#11: Library '{}' is already initialized", library);
            false
        } else {
            info!("PKCS#11: Initializing library '{}'", library);
            provider.initialize().map_err(Error::InitializeFailed)?;
            true
        };

        let (token, pool, anchor) = match Self::connect(&config, &provider) {
            Ok(connected) => connected,
            Err(err) => {
                if initialized_here {
                    info!("PKCS#11: Finalizing library '{}' after failing to open a context", library);
                    if let Err(finalize_err) = provider.finalize() {
                        warn!("PKCS#11: Failed to finalize library '{}': {}", library, finalize_err);
                    }
                }
                return Err(err);
            }
        };

        usage.acquire(&library);
        drop(usage);

        info!(
            "PKCS#11: Using token {} with up to {} pooled session(s)",
            token,
            pool.max_size()
        );

        Ok(Context {
            config,
            registry,
            library,
            provider: Mutex::new(Some(provider)),
            token,
            pool,
            anchor: Mutex::new(Some(anchor)),
            closed: AtomicBool::new(false),
        })
    }

    /// Selects the token, opens and logs in the anchor session and sets up the pool.
    ///
    /// Anything opened here is closed again when this fails.
    #[allow(clippy::type_complexity)]
    fn connect(
        config: &Config,
        provider: &Arc<P>,
    ) -> Result<(TokenInfo, SessionPool<SessionFactory<P>>, P::Session), Error> {
        let (slot, token) = Self::find_token(provider, config.selector())?;

        let ceiling = token.max_rw_sessions.ceiling(config.max_sessions());
        if ceiling < 2 {
            return Err(Error::SessionOpenFailed(format!(
                "token {} allows {} read/write session(s) but at least 2 are needed",
                token, ceiling
            )));
        }

        let anchor = provider
            .open_session(slot)
            .map_err(|err| Error::SessionOpenFailed(err.to_string()))?;
        debug!("PKCS#11: Opened anchor session on slot {}", token.slot_id);

        if config.login_not_supported() {
            debug!("PKCS#11: Not logging in, the token does not support it");
        } else {
            match anchor.login(config.pin()) {
                Ok(()) => info!("PKCS#11: Logged in to token '{}'", token.label),
                Err(err) if err.kind() == TokenErrorKind::UserAlreadyLoggedIn => {
                    warn!(
                        "PKCS#11: Ignoring error {} because another context is logged in to the same token",
                        err
                    );
                }
                Err(err) => return Err(Error::LoginFailed(err)),
            }
        }

        let factory = SessionFactory::new(provider.clone(), slot);
        let pool = SessionPool::new(factory, ceiling - 1, config.pool_wait_timeout())?;

        Ok((token, pool, anchor))
    }

    /// Returns the first slot, in the order the library reports them, with a matching token.
    fn find_token(provider: &P, selector: &TokenSelector) -> Result<(P::Slot, TokenInfo), Error> {
        let slots = provider
            .slots_with_token()
            .map_err(|err| Error::token("Listing slots with a token", err))?;

        for slot in slots {
            let info = provider
                .token_info(slot)
                .map_err(|err| Error::token("Getting token info", err))?;

            let matches = match selector {
                TokenSelector::Slot(slot_id) => info.slot_id == *slot_id,
                TokenSelector::Label(label) => !info.label.is_empty() && &info.label == label,
                TokenSelector::Serial(serial) => !info.serial_number.is_empty() && &info.serial_number == serial,
            };

            if matches {
                return Ok((slot, info));
            }
        }

        Err(Error::TokenNotFound(selector.to_string()))
    }

    /// Runs `op` with a session leased from the pool.
    ///
    /// Blocks until a session is available, or until the configured pool wait
    /// timeout passes. The session is returned to the pool however `op` ends
    /// and the outcome of `op` is returned as is.
    pub fn with_session<T, F>(&self, desc: &str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&P::Session) -> Result<T, Error>,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let session = self.pool.acquire()?;
        trace!("PKCS#11: {}", desc);
        op(&session)
    }

    /// Closes the context.
    ///
    /// Waits for all leased sessions to be returned, closes all sessions and
    /// finalizes the library if this was its last user. Fails with
    /// [`Error::Closed`] if the context was closed before.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        debug!("PKCS#11: Closing context for token '{}'", self.token.label);

        if let Err(err) = self.pool.close() {
            warn!("PKCS#11: Failed to close session pool: {}", err);
        }

        // Closing a session cannot be reported back, the binding logs any failure to do so.
        drop(self.anchor.lock().unwrap().take());

        let provider = self.provider.lock().unwrap().take();

        let mut usage = self.registry.lock();
        let res = if usage.release(&self.library) {
            info!("PKCS#11: Finalizing library '{}'", self.library);
            match provider.as_ref().map(|provider| provider.finalize()) {
                Some(Err(err)) => {
                    error!("PKCS#11: Failed to finalize library '{}': {}", self.library, err);
                    Err(Error::token("Finalizing library", err))
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        };

        // Released while other contexts are still kept from initializing the library again.
        drop(provider);
        drop(usage);

        res
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The selected token and the slot it is in.
    pub fn token(&self) -> &TokenInfo {
        &self.token
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// Returns `len` random bytes generated by the token.
    pub fn generate_random(&self, len: usize) -> Result<Vec<u8>, Error> {
        let desc = "Generating random bytes";
        self.with_session(desc, |session| {
            session.generate_random(len).map_err(|err| Error::token(desc, err))
        })
    }
}

impl<P: Provider> Drop for Context<P> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                warn!("PKCS#11: Failed to close context on drop: {}", err);
            }
        }
    }
}
