#![allow(dead_code)] // Different tests use different parts.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use pkcs11_context::{
    Config, Context, TokenSelector,
    provider::{
        SessionLimit,
        mock::{MockLibrary, MockProvider, MockToken},
    },
};

pub type MockContext = Context<MockProvider>;

pub const TOKEN_LABEL: &str = "test-token";
pub const TOKEN_SERIAL: &str = "0123456789";
pub const PIN: &str = "1234";

pub fn init_logging() {
    let _ = stderrlog::new().module("pkcs11_context").verbosity(4).init();
}

/// Returns a library path no other test uses.
pub fn unique_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    PathBuf::from(format!(
        "/mock/{}/{}",
        name,
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// A token that needs the test PIN and allows the given number of r/w sessions.
pub fn test_token(max_rw_sessions: SessionLimit) -> MockToken {
    MockToken::new(1, TOKEN_LABEL)
        .with_serial(TOKEN_SERIAL)
        .with_pin(PIN)
        .with_max_rw_sessions(max_rw_sessions)
}

/// Installs a library with a single test token under a fresh path.
pub fn install(name: &str, max_rw_sessions: SessionLimit) -> (PathBuf, Arc<MockLibrary>) {
    init_logging();
    let path = unique_path(name);
    let library = MockLibrary::new()
        .with_token(test_token(max_rw_sessions))
        .install(path.clone());
    (path, library)
}

pub fn config(path: &PathBuf) -> Config {
    Config::new(path.clone(), TokenSelector::Label(TOKEN_LABEL.to_string())).with_pin(PIN)
}

/// Opens a context on a fresh library with a single test token.
pub fn open(name: &str, max_rw_sessions: SessionLimit) -> (MockContext, Arc<MockLibrary>) {
    let (path, library) = install(name, max_rw_sessions);
    let context = MockContext::open(config(&path)).unwrap();
    (context, library)
}
