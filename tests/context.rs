//! Opening and closing contexts.

mod common;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use pkcs11_context::{
    Config, Error, LibraryRegistry, TokenErrorKind, TokenSelector,
    provider::{
        SessionLimit,
        mock::{MockFn, MockLibrary, MockToken},
    },
};

use common::{MockContext, PIN, TOKEN_LABEL, TOKEN_SERIAL};

#[test]
fn open_selects_token_by_label_serial_or_slot() {
    common::init_logging();
    let path = common::unique_path("select");
    let library = MockLibrary::new()
        .with_token(MockToken::new(3, "other").with_serial("999"))
        .with_token(common::test_token(SessionLimit::Infinite))
        .install(path.clone());

    let selectors = [
        TokenSelector::Label(TOKEN_LABEL.to_string()),
        TokenSelector::Serial(TOKEN_SERIAL.to_string()),
        TokenSelector::Slot(1),
    ];
    for selector in selectors {
        let context = MockContext::open(Config::new(path.clone(), selector).with_pin(PIN)).unwrap();
        assert_eq!(TOKEN_LABEL, context.token().label);
        assert_eq!(1, context.token().slot_id);
        context.close().unwrap();
    }

    assert_eq!(3, library.initialize_calls());
    assert_eq!(3, library.finalize_calls());
    assert!(!library.is_initialized());
}

#[test]
fn open_fails_when_token_is_missing_and_finalizes() {
    let (path, library) = common::install("missing", SessionLimit::Infinite);

    let config = Config::new(path, TokenSelector::Label("nope".to_string())).with_pin(PIN);
    let err = MockContext::open(config).unwrap_err();
    assert!(matches!(err, Error::TokenNotFound(_)));

    assert_eq!(1, library.initialize_calls());
    assert_eq!(1, library.finalize_calls());
    assert!(!library.is_initialized());
}

#[test]
fn config_file_with_two_selectors_fails_before_loading() {
    let (path, library) = common::install("two-selectors", SessionLimit::Infinite);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("token.toml");
    std::fs::write(
        &file,
        format!(
            "path = \"{}\"\ntoken_label = \"{}\"\nslot_number = 1\n",
            path.display(),
            TOKEN_LABEL
        ),
    )
    .unwrap();

    let err = MockContext::open_from_file(&file).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(0, library.loads());
    assert_eq!(0, library.calls().total());
}

#[test]
fn empty_selector_fails_before_loading() {
    let (path, library) = common::install("empty-selector", SessionLimit::Infinite);

    for selector in [TokenSelector::Label(String::new()), TokenSelector::Serial(String::new())] {
        let err = MockContext::open(Config::new(path.clone(), selector).with_pin(PIN)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
    assert_eq!(0, library.loads());
    assert_eq!(0, library.initialize_calls());
    assert_eq!(0, library.calls().total());
}

#[test]
fn open_from_file_with_upper_camel_case_keys() {
    let (path, _library) = common::install("camel-case", SessionLimit::Infinite);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("token.json");
    std::fs::write(
        &file,
        format!(
            r#"{{ "Path": "{}", "TokenLabel": "{}", "Pin": "{}", "MaxSessions": 4, "PoolWaitTimeout": 2000000000 }}"#,
            path.display(),
            TOKEN_LABEL,
            PIN
        ),
    )
    .unwrap();

    let context = MockContext::open_from_file(&file).unwrap();
    assert_eq!(3, context.pool_state().max);
    assert_eq!(Some(Duration::from_secs(2)), context.config().pool_wait_timeout());
    context.close().unwrap();
}

#[test]
fn open_from_json_file() {
    let (path, library) = common::install("json", SessionLimit::Infinite);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("token.json");
    std::fs::write(
        &file,
        format!(
            r#"{{ "path": "{}", "token_serial": "{}", "pin": "{}", "max_sessions": 3 }}"#,
            path.display(),
            TOKEN_SERIAL,
            PIN
        ),
    )
    .unwrap();

    let context = MockContext::open_from_file(&file).unwrap();
    assert_eq!(2, context.pool_state().max);
    assert!(library.token(TOKEN_LABEL).unwrap().is_logged_in());
    context.close().unwrap();
}

#[test]
fn library_that_cannot_be_loaded() {
    common::init_logging();
    let config = Config::new(common::unique_path("absent"), TokenSelector::Slot(0));
    assert!(matches!(
        MockContext::open(config),
        Err(Error::LibraryLoadFailed { .. })
    ));
}

#[test]
fn failing_initialize_is_reported() {
    common::init_logging();
    let path = common::unique_path("init-fails");
    let library = MockLibrary::new()
        .with_token(common::test_token(SessionLimit::Infinite))
        .with_failing_initialize()
        .install(path.clone());

    let err = MockContext::open(common::config(&path)).unwrap_err();
    match err {
        Error::InitializeFailed(err) => assert_eq!("C_Initialize", err.function()),
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(0, library.finalize_calls());
}

#[test]
fn wrong_pin_fails_login() {
    let (path, library) = common::install("wrong-pin", SessionLimit::Infinite);

    let err = MockContext::open(common::config(&path).with_pin("0000")).unwrap_err();
    match err {
        Error::LoginFailed(err) => assert_eq!(TokenErrorKind::PinIncorrect, err.kind()),
        other => panic!("unexpected error {}", other),
    }

    // The anchor session is closed again and the library finalized.
    let token = library.token(TOKEN_LABEL).unwrap();
    assert_eq!(0, token.open_sessions());
    assert_eq!(1, library.finalize_calls());
}

#[test]
fn login_can_be_skipped() {
    let (path, library) = common::install("no-login", SessionLimit::Infinite);

    let context = MockContext::open(common::config(&path).with_login_not_supported(true)).unwrap();
    assert_eq!(0, library.calls().get(MockFn::Login));
    assert!(!library.token(TOKEN_LABEL).unwrap().is_logged_in());
    context.close().unwrap();
}

#[test]
fn too_few_sessions_fail_to_open() {
    let (path, library) = common::install("one-session", SessionLimit::Max(1));

    let err = MockContext::open(common::config(&path)).unwrap_err();
    assert!(matches!(err, Error::SessionOpenFailed(_)));
    assert_eq!(0, library.calls().get(MockFn::OpenSession));
    assert_eq!(1, library.finalize_calls());

    let (path, _library) = common::install("one-configured", SessionLimit::Infinite);
    let err = MockContext::open(common::config(&path).with_max_sessions(1)).unwrap_err();
    assert!(matches!(err, Error::SessionOpenFailed(_)));
}

#[test]
fn two_contexts_share_one_initialization() {
    let (path, library) = common::install("shared", SessionLimit::Infinite);
    let token = library.token(TOKEN_LABEL).unwrap().clone();

    // Both close orders.
    for first_closes_first in [true, false] {
        let first = MockContext::open(common::config(&path)).unwrap();
        let second = MockContext::open(common::config(&path)).unwrap();
        assert_eq!(2, LibraryRegistry::global().usage_count(&common::config(&path).library_id()));

        // The second anchor finds the token logged in already.
        assert!(token.is_logged_in());

        let (a, b) = if first_closes_first {
            (first, second)
        } else {
            (second, first)
        };
        a.close().unwrap();
        assert!(library.is_initialized());
        b.generate_random(8).unwrap();
        b.close().unwrap();
        assert!(!library.is_initialized());
    }

    assert_eq!(2, library.initialize_calls());
    assert_eq!(2, library.finalize_calls());
    assert_eq!(0, token.open_sessions());
}

#[test]
fn separate_registries_track_usage_separately() {
    let (path, library) = common::install("registries", SessionLimit::Infinite);
    let registry = Arc::new(LibraryRegistry::new());

    let context = MockContext::open_with_registry(common::config(&path), registry.clone()).unwrap();
    assert_eq!(1, registry.usage_count(&common::config(&path).library_id()));
    assert_eq!(0, LibraryRegistry::global().usage_count(&common::config(&path).library_id()));

    context.close().unwrap();
    assert_eq!(0, registry.usage_count(&common::config(&path).library_id()));
    assert_eq!(1, library.finalize_calls());
}

#[test]
fn closed_context_makes_no_native_calls() {
    let (context, library) = common::open("closed", SessionLimit::Infinite);
    context.generate_random(16).unwrap();
    context.close().unwrap();

    let calls = library.calls().total();
    assert!(matches!(context.generate_random(16), Err(Error::Closed)));
    assert!(matches!(
        context.with_session("Doing nothing", |_| Ok(())),
        Err(Error::Closed)
    ));
    assert!(matches!(context.close(), Err(Error::Closed)));
    assert_eq!(calls, library.calls().total());
    assert!(context.is_closed());
}

#[test]
fn dropping_context_closes_it() {
    let (context, library) = common::open("drop", SessionLimit::Infinite);
    context.generate_random(4).unwrap();
    drop(context);

    assert!(!library.is_initialized());
    assert_eq!(0, library.token(TOKEN_LABEL).unwrap().open_sessions());
}

#[test]
fn close_waits_for_leased_sessions() {
    let (context, library) = common::open("close-waits", SessionLimit::Infinite);
    let token = library.token(TOKEN_LABEL).unwrap().clone();
    let context = Arc::new(context);

    let done = Arc::new(AtomicBool::new(false));

    let (leased_tx, leased_rx) = std::sync::mpsc::channel();
    let worker = {
        let context = context.clone();
        let done = done.clone();
        thread::spawn(move || {
            context
                .with_session("Holding a session", |_| {
                    leased_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(300));
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        })
    };

    leased_rx.recv().unwrap();
    assert_eq!(1, context.pool_state().leased);
    context.close().unwrap();

    // The operation finished before close returned.
    assert!(done.load(Ordering::SeqCst));
    worker.join().unwrap();
    assert_eq!(0, token.open_sessions());
    assert!(!library.is_initialized());
}

#[test]
fn operation_errors_are_returned_unchanged() {
    let (context, _library) = common::open("outcome", SessionLimit::Infinite);

    let res: Result<(), Error> = context.with_session("Failing", |_| Err(Error::KeyNotFound("x".to_string())));
    assert!(matches!(res, Err(Error::KeyNotFound(_))));

    // The session went back to the pool.
    let state = context.pool_state();
    assert_eq!(0, state.leased);
    assert_eq!(state.sessions, state.idle);

    context.close().unwrap();
}

#[test]
fn panicking_operation_returns_its_session() {
    let (context, library) = common::open("panic", SessionLimit::Infinite);

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        context.with_session("Panicking", |_| -> Result<(), Error> { panic!("operation failed") })
    }));
    assert!(res.is_err());

    let state = context.pool_state();
    assert_eq!(0, state.leased);
    assert!(state.idle >= 1);
    assert_eq!(state.sessions, state.idle);

    // The session can be leased again and close does not wait for it.
    context.generate_random(8).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    thread::scope(|s| {
        s.spawn(|| tx.send(context.close()).unwrap());
        let res = rx.recv_timeout(Duration::from_secs(5)).expect("close did not return");
        assert!(res.is_ok());
    });
    assert_eq!(0, library.token(TOKEN_LABEL).unwrap().open_sessions());
}
