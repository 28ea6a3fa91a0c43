//! Shared, pooled access to a PKCS#11 token.
//!
//! A [`Context`] is one logical connection to one token. It initializes the
//! PKCS#11 library on first use within the process, logs in once, and hands
//! out sessions from a bounded pool for the duration of a single operation
//! through [`Context::with_session`]. The library is finalized again when the
//! last context using it is closed.
//!
//! Keys generated on, or found on, the token are represented by handles that
//! borrow their context, see the [`keys`] module.

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

#[cfg(feature = "pkcs11")]
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod keys;
pub mod pool;
pub mod provider;
pub mod registry;

pub use self::{
    config::{Config, TokenSelector},
    context::Context,
    error::{Error, TokenError, TokenErrorKind},
    hash::HashAlgorithm,
    keys::{DecryptPadding, Decrypter, KeyPair, Signer},
    registry::LibraryRegistry,
};

#[cfg(feature = "pkcs11")]
pub use self::context::Pkcs11Context;
