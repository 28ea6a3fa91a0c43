//! An in-memory software token.
//!
//! The mock behaves like a token library closely enough for contexts and key
//! handles to be tested without a native library: it needs to be initialized
//! before use, keeps per token login state, limits the number of sessions
//! and really generates, signs and decrypts with its keys (using OpenSSL).
//! It also records how it was used so tests can check on the callers.
//!
//! A mock library is made available under a path with [`MockLibrary::install`],
//! after which [`MockProvider::load`] finds it under that path.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use openssl::{
    bn::BigNum,
    dsa::{Dsa, DsaSig},
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    encrypt::Decrypter,
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{Error, TokenError, TokenErrorKind},
    keys::ec::{Curve, wrap_ec_point},
    provider::{
        Attribute, AttributeType, KeyType, Mechanism, ObjectClass, Provider, SessionLimit, TokenInfo, TokenSession,
    },
};

lazy_static! {
    static ref LIBRARIES: Mutex<HashMap<PathBuf, Arc<MockLibrary>>> = Mutex::new(HashMap::new());
}

//------------ MockFn --------------------------------------------------------

/// The token API functions the mock counts calls of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MockFn {
    Initialize,
    Finalize,
    GetSlotList,
    GetTokenInfo,
    OpenSession,
    CloseSession,
    Login,
    FindObjects,
    GenerateKeyPair,
    GetAttributeValue,
    Sign,
    Decrypt,
    GenerateRandom,
    DestroyObject,
    Count,
}

#[derive(Debug)]
pub struct MockCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl MockCallCounts {
    fn new() -> Self {
        MockCallCounts {
            call_counts: RwLock::new(vec![0; MockFn::Count as usize]),
        }
    }

    pub fn get(&self, fn_idx: MockFn) -> u32 {
        self.call_counts.read().unwrap()[fn_idx as usize]
    }

    /// The number of calls made to any function.
    pub fn total(&self) -> u32 {
        self.call_counts.read().unwrap().iter().sum()
    }

    fn inc(&self, fn_idx: MockFn) {
        self.call_counts.write().unwrap()[fn_idx as usize] += 1;
    }
}

//------------ MockLibrary ---------------------------------------------------

pub struct MockLibrary {
    tokens: Vec<Arc<MockToken>>,
    initialized: AtomicBool,
    fail_initialize: bool,
    loads: AtomicU32,
    calls: MockCallCounts,
}

impl fmt::Debug for MockLibrary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MockLibrary")
            .field("tokens", &self.tokens.len())
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl MockLibrary {
    pub fn new() -> Self {
        MockLibrary {
            tokens: vec![],
            initialized: AtomicBool::new(false),
            fail_initialize: false,
            loads: AtomicU32::new(0),
            calls: MockCallCounts::new(),
        }
    }

    /// Adds a token. Tokens are reported in the order they were added.
    pub fn with_token(mut self, token: MockToken) -> Self {
        self.tokens.push(Arc::new(token));
        self
    }

    /// Makes every attempt to initialize the library fail.
    pub fn with_failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Makes the library loadable from `path`, replacing any library installed there before.
    pub fn install(self, path: impl Into<PathBuf>) -> Arc<MockLibrary> {
        let library = Arc::new(self);
        LIBRARIES.lock().unwrap().insert(path.into(), library.clone());
        library
    }

    pub fn uninstall(path: &Path) {
        LIBRARIES.lock().unwrap().remove(path);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> &MockCallCounts {
        &self.calls
    }

    pub fn initialize_calls(&self) -> u32 {
        self.calls.get(MockFn::Initialize)
    }

    pub fn finalize_calls(&self) -> u32 {
        self.calls.get(MockFn::Finalize)
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn token(&self, label: &str) -> Option<&Arc<MockToken>> {
        self.tokens.iter().find(|token| token.info.label == label)
    }

    fn check_initialized(&self, function: &'static str) -> Result<(), TokenError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(TokenError::new(
                function,
                TokenErrorKind::NotInitialized,
                "CKR_CRYPTOKI_NOT_INITIALIZED",
            ))
        }
    }
}

impl Default for MockLibrary {
    fn default() -> Self {
        Self::new()
    }
}

//------------ MockToken -----------------------------------------------------

pub struct MockToken {
    info: TokenInfo,
    pin: Option<String>,
    login_required: bool,
    operation_delay: Option<Duration>,
    state: Mutex<TokenState>,
    concurrent_use: AtomicU32,
}

#[derive(Default)]
struct TokenState {
    logged_in: bool,
    open_sessions: usize,
    peak_sessions: usize,
    next_handle: u64,
    objects: HashMap<u64, MockObject>,
    fail_destroy: HashSet<ObjectClass>,
    fail_get_attributes: bool,
}

struct MockObject {
    class: ObjectClass,
    key_type: KeyType,
    id: Vec<u8>,
    label: Vec<u8>,
    key: PKey<Private>,
    curve: Option<Curve>,
}

impl MockObject {
    fn matches(&self, attr: &Attribute) -> bool {
        match attr {
            Attribute::Class(class) => self.class == *class,
            Attribute::KeyType(key_type) => self.key_type == *key_type,
            Attribute::Id(id) => &self.id == id,
            Attribute::Label(label) => &self.label == label,
            _ => true,
        }
    }
}

impl fmt::Debug for MockToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MockToken").field("info", &self.info).finish()
    }
}

impl MockToken {
    /// Creates a token that does not need a login and allows any number of sessions.
    pub fn new(slot_id: u64, label: &str) -> Self {
        MockToken {
            info: TokenInfo {
                slot_id,
                label: label.to_string(),
                serial_number: String::new(),
                model: "Mock".to_string(),
                manufacturer: "NLnet Labs".to_string(),
                max_rw_sessions: SessionLimit::Infinite,
            },
            pin: None,
            login_required: false,
            operation_delay: None,
            state: Mutex::new(TokenState {
                next_handle: 1,
                ..Default::default()
            }),
            concurrent_use: AtomicU32::new(0),
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.info.serial_number = serial.to_string();
        self
    }

    pub fn with_max_rw_sessions(mut self, limit: SessionLimit) -> Self {
        self.info.max_rw_sessions = limit;
        self
    }

    /// Requires a login with this PIN before objects can be used.
    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self.login_required = true;
        self
    }

    /// Makes every session operation take at least this long.
    pub fn with_operation_delay(mut self, delay: Duration) -> Self {
        self.operation_delay = Some(delay);
        self
    }

    pub fn info(&self) -> &TokenInfo {
        &self.info
    }

    pub fn is_logged_in(&self) -> bool {
        self.state().logged_in
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// The highest number of sessions that were open at the same time.
    pub fn peak_sessions(&self) -> usize {
        self.state().peak_sessions
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// The number of times a session was used by two threads at once.
    pub fn concurrent_use_violations(&self) -> u32 {
        self.concurrent_use.load(Ordering::SeqCst)
    }

    /// Makes destroying objects of the given class fail, or succeed again.
    pub fn set_fail_destroy(&self, class: ObjectClass, fail: bool) {
        let mut state = self.state();
        if fail {
            state.fail_destroy.insert(class);
        } else {
            state.fail_destroy.remove(&class);
        }
    }

    /// Makes reading object attributes fail, or succeed again.
    pub fn set_fail_get_attributes(&self, fail: bool) {
        self.state().fail_get_attributes = fail;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.state.lock().unwrap()
    }

    fn open_session(&self) -> Result<(), TokenError> {
        let mut state = self.state();
        if let SessionLimit::Max(max) = self.info.max_rw_sessions {
            if state.open_sessions as u64 >= max {
                return Err(TokenError::new(
                    "C_OpenSession",
                    TokenErrorKind::SessionCount,
                    "CKR_SESSION_COUNT",
                ));
            }
        }
        state.open_sessions += 1;
        state.peak_sessions = state.peak_sessions.max(state.open_sessions);
        Ok(())
    }

    fn close_session(&self) {
        let mut state = self.state();
        state.open_sessions -= 1;

        // The login state is shared by all sessions of an application and ends with the last of them.
        if state.open_sessions == 0 {
            state.logged_in = false;
        }
    }

    fn reset(&self) {
        self.state().logged_in = false;
    }

    fn check_logged_in(&self, state: &TokenState, function: &'static str) -> Result<(), TokenError> {
        if self.login_required && !state.logged_in {
            Err(TokenError::new(
                function,
                TokenErrorKind::UserNotLoggedIn,
                "CKR_USER_NOT_LOGGED_IN",
            ))
        } else {
            Ok(())
        }
    }
}

//------------ MockProvider --------------------------------------------------

#[derive(Clone, Debug)]
pub struct MockProvider {
    library: Arc<MockLibrary>,
}

impl MockProvider {
    pub fn library(&self) -> &Arc<MockLibrary> {
        &self.library
    }
}

impl Provider for MockProvider {
    type Slot = usize;
    type Object = u64;
    type Session = MockSession;

    fn load(path: &Path) -> Result<Self, Error> {
        let library = LIBRARIES
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::LibraryLoadFailed {
                path: path.to_path_buf(),
                reason: "no mock library installed at this path".to_string(),
            })?;
        library.loads.fetch_add(1, Ordering::SeqCst);
        Ok(MockProvider { library })
    }

    fn initialize(&self) -> Result<(), TokenError> {
        self.library.calls.inc(MockFn::Initialize);
        if self.library.fail_initialize {
            return Err(TokenError::new(
                "C_Initialize",
                TokenErrorKind::FunctionFailed,
                "CKR_FUNCTION_FAILED",
            ));
        }
        if self.library.initialized.swap(true, Ordering::SeqCst) {
            return Err(TokenError::new(
                "C_Initialize",
                TokenErrorKind::AlreadyInitialized,
                "CKR_CRYPTOKI_ALREADY_INITIALIZED",
            ));
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), TokenError> {
        self.library.calls.inc(MockFn::Finalize);
        if !self.library.initialized.swap(false, Ordering::SeqCst) {
            return Err(TokenError::new(
                "C_Finalize",
                TokenErrorKind::NotInitialized,
                "CKR_CRYPTOKI_NOT_INITIALIZED",
            ));
        }
        for token in &self.library.tokens {
            token.reset();
        }
        Ok(())
    }

    fn slots_with_token(&self) -> Result<Vec<usize>, TokenError> {
        self.library.calls.inc(MockFn::GetSlotList);
        self.library.check_initialized("C_GetSlotList")?;
        Ok((0..self.library.tokens.len()).collect())
    }

    fn token_info(&self, slot: usize) -> Result<TokenInfo, TokenError> {
        self.library.calls.inc(MockFn::GetTokenInfo);
        self.library.check_initialized("C_GetTokenInfo")?;
        self.library
            .tokens
            .get(slot)
            .map(|token| token.info.clone())
            .ok_or_else(|| TokenError::new("C_GetTokenInfo", TokenErrorKind::Other, "CKR_SLOT_ID_INVALID"))
    }

    fn open_session(&self, slot: usize) -> Result<MockSession, TokenError> {
        self.library.calls.inc(MockFn::OpenSession);
        self.library.check_initialized("C_OpenSession")?;
        let token = self
            .library
            .tokens
            .get(slot)
            .cloned()
            .ok_or_else(|| TokenError::new("C_OpenSession", TokenErrorKind::Other, "CKR_SLOT_ID_INVALID"))?;
        token.open_session()?;
        Ok(MockSession {
            library: self.library.clone(),
            token,
            busy: AtomicBool::new(false),
        })
    }
}

//------------ MockSession ---------------------------------------------------

pub struct MockSession {
    library: Arc<MockLibrary>,
    token: Arc<MockToken>,
    busy: AtomicBool,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MockSession").field("token", &self.token.info.label).finish()
    }
}

/// Marks a session as in use for as long as it lives.
struct InUse<'a> {
    busy: &'a AtomicBool,
    claimed: bool,
}

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        if self.claimed {
            self.busy.store(false, Ordering::SeqCst);
        }
    }
}

impl MockSession {
    fn enter(&self, fn_idx: MockFn) -> InUse<'_> {
        self.library.calls.inc(fn_idx);

        let claimed = self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            self.token.concurrent_use.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(delay) = self.token.operation_delay {
            thread::sleep(delay);
        }

        InUse {
            busy: &self.busy,
            claimed,
        }
    }

    fn with_key<T>(
        &self,
        function: &'static str,
        key: u64,
        op: impl FnOnce(&MockObject) -> Result<T, TokenError>,
    ) -> Result<T, TokenError> {
        let state = self.token.state();
        self.token.check_logged_in(&state, function)?;
        let object = state.objects.get(&key).ok_or_else(|| invalid_handle(function))?;
        if object.class != ObjectClass::PrivateKey {
            return Err(TokenError::new(
                function,
                TokenErrorKind::KeyTypeInconsistent,
                "CKR_KEY_TYPE_INCONSISTENT",
            ));
        }
        op(object)
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.library.calls.inc(MockFn::CloseSession);
        self.token.close_session();
    }
}

impl TokenSession for MockSession {
    type Object = u64;

    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError> {
        let _in_use = self.enter(MockFn::Login);
        let mut state = self.token.state();

        if state.logged_in {
            return Err(TokenError::new(
                "C_Login",
                TokenErrorKind::UserAlreadyLoggedIn,
                "CKR_USER_ALREADY_LOGGED_IN",
            ));
        }

        if let Some(expected) = &self.token.pin {
            let given = pin.map(|pin| pin.expose_secret().as_str());
            if given != Some(expected.as_str()) {
                return Err(TokenError::new("C_Login", TokenErrorKind::PinIncorrect, "CKR_PIN_INCORRECT"));
            }
        }

        state.logged_in = true;
        Ok(())
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<u64>, TokenError> {
        let _in_use = self.enter(MockFn::FindObjects);
        let state = self.token.state();
        self.token.check_logged_in(&state, "C_FindObjects")?;

        let mut found: Vec<u64> = state
            .objects
            .iter()
            .filter(|(_, object)| template.iter().all(|attr| object.matches(attr)))
            .map(|(handle, _)| *handle)
            .collect();
        found.sort_unstable();
        Ok(found)
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(u64, u64), TokenError> {
        const FN: &str = "C_GenerateKeyPair";

        let _in_use = self.enter(MockFn::GenerateKeyPair);
        {
            let state = self.token.state();
            self.token.check_logged_in(&state, FN)?;
        }

        let (key_type, key, curve) = match mechanism {
            Mechanism::RsaPkcsKeyPairGen => {
                let bits = public_template
                    .iter()
                    .find_map(|attr| match attr {
                        Attribute::ModulusBits(bits) => Some(*bits),
                        _ => None,
                    })
                    .ok_or_else(|| template_incomplete(FN))?;
                let exponent = Attribute::find_bytes(public_template, AttributeType::PublicExponent)
                    .unwrap_or(&[0x01, 0x00, 0x01]);
                let bits = u32::try_from(bits).map_err(|_| template_incomplete(FN))?;
                let exponent = BigNum::from_slice(exponent).map_err(|e| failed(FN, e))?;
                let rsa = Rsa::generate_with_e(bits, &exponent).map_err(|e| failed(FN, e))?;
                (KeyType::Rsa, PKey::from_rsa(rsa).map_err(|e| failed(FN, e))?, None)
            }
            Mechanism::EcKeyPairGen => {
                let curve = Attribute::find_bytes(public_template, AttributeType::EcParams)
                    .and_then(Curve::from_params)
                    .ok_or_else(|| {
                        TokenError::new(FN, TokenErrorKind::TemplateIncomplete, "CKR_CURVE_NOT_SUPPORTED")
                    })?;
                let group = EcGroup::from_curve_name(curve.nid()).map_err(|e| failed(FN, e))?;
                let ec = EcKey::generate(&group).map_err(|e| failed(FN, e))?;
                (KeyType::Ec, PKey::from_ec_key(ec).map_err(|e| failed(FN, e))?, Some(curve))
            }
            Mechanism::DsaKeyPairGen => {
                let component = |attr_type| {
                    Attribute::find_bytes(public_template, attr_type)
                        .ok_or_else(|| template_incomplete(FN))
                        .and_then(|value| BigNum::from_slice(value).map_err(|e| failed(FN, e)))
                };
                let params = Dsa::from_pqg(
                    component(AttributeType::Prime)?,
                    component(AttributeType::Subprime)?,
                    component(AttributeType::Base)?,
                )
                .map_err(|e| failed(FN, e))?;
                let dsa = params.generate_key().map_err(|e| failed(FN, e))?;
                (KeyType::Dsa, PKey::from_dsa(dsa).map_err(|e| failed(FN, e))?, None)
            }
            _ => return Err(mechanism_invalid(FN)),
        };

        let attr_bytes = |template: &[Attribute], attr_type| {
            Attribute::find_bytes(template, attr_type)
                .map(|v| v.to_vec())
                .unwrap_or_default()
        };

        let public = MockObject {
            class: ObjectClass::PublicKey,
            key_type,
            id: attr_bytes(public_template, AttributeType::Id),
            label: attr_bytes(public_template, AttributeType::Label),
            key: key.clone(),
            curve,
        };
        let private = MockObject {
            class: ObjectClass::PrivateKey,
            key_type,
            id: attr_bytes(private_template, AttributeType::Id),
            label: attr_bytes(private_template, AttributeType::Label),
            key,
            curve,
        };

        let mut state = self.token.state();
        let public_handle = state.next_handle;
        let private_handle = public_handle + 1;
        state.next_handle += 2;
        state.objects.insert(public_handle, public);
        state.objects.insert(private_handle, private);

        Ok((public_handle, private_handle))
    }

    fn get_attributes(&self, object: u64, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError> {
        const FN: &str = "C_GetAttributeValue";

        let _in_use = self.enter(MockFn::GetAttributeValue);
        let state = self.token.state();
        self.token.check_logged_in(&state, FN)?;
        if state.fail_get_attributes {
            return Err(TokenError::new(FN, TokenErrorKind::FunctionFailed, "CKR_DEVICE_ERROR"));
        }
        let object = state.objects.get(&object).ok_or_else(|| invalid_handle(FN))?;

        let mut attributes = vec![];
        for attr_type in types {
            let attr = match (attr_type, object.key_type) {
                (AttributeType::Class, _) => Attribute::Class(object.class),
                (AttributeType::KeyType, _) => Attribute::KeyType(object.key_type),
                (AttributeType::Id, _) => Attribute::Id(object.id.clone()),
                (AttributeType::Label, _) => Attribute::Label(object.label.clone()),
                (AttributeType::Modulus, KeyType::Rsa) => {
                    let rsa = object.key.rsa().map_err(|e| failed(FN, e))?;
                    Attribute::Modulus(rsa.n().to_vec())
                }
                (AttributeType::PublicExponent, KeyType::Rsa) => {
                    let rsa = object.key.rsa().map_err(|e| failed(FN, e))?;
                    Attribute::PublicExponent(rsa.e().to_vec())
                }
                (AttributeType::EcParams, KeyType::Ec) => match object.curve {
                    Some(curve) => Attribute::EcParams(curve.params().to_vec()),
                    None => continue,
                },
                (AttributeType::EcPoint, KeyType::Ec) if object.class == ObjectClass::PublicKey => {
                    let ec = object.key.ec_key().map_err(|e| failed(FN, e))?;
                    let mut ctx = openssl::bn::BigNumContext::new().map_err(|e| failed(FN, e))?;
                    let point = ec
                        .public_key()
                        .to_bytes(ec.group(), openssl::ec::PointConversionForm::UNCOMPRESSED, &mut ctx)
                        .map_err(|e| failed(FN, e))?;
                    Attribute::EcPoint(wrap_ec_point(&point))
                }
                (AttributeType::Prime, KeyType::Dsa) => {
                    Attribute::Prime(object.key.dsa().map_err(|e| failed(FN, e))?.p().to_vec())
                }
                (AttributeType::Subprime, KeyType::Dsa) => {
                    Attribute::Subprime(object.key.dsa().map_err(|e| failed(FN, e))?.q().to_vec())
                }
                (AttributeType::Base, KeyType::Dsa) => {
                    Attribute::Base(object.key.dsa().map_err(|e| failed(FN, e))?.g().to_vec())
                }
                (AttributeType::Value, KeyType::Dsa) if object.class == ObjectClass::PublicKey => {
                    Attribute::Value(object.key.dsa().map_err(|e| failed(FN, e))?.pub_key().to_vec())
                }
                _ => {
                    return Err(TokenError::new(
                        FN,
                        TokenErrorKind::Other,
                        "CKR_ATTRIBUTE_TYPE_INVALID",
                    ));
                }
            };
            attributes.push(attr);
        }
        Ok(attributes)
    }

    fn sign(&self, mechanism: &Mechanism, key: u64, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        const FN: &str = "C_Sign";

        let _in_use = self.enter(MockFn::Sign);
        self.with_key(FN, key, |object| match (mechanism, object.key_type) {
            (Mechanism::RsaPkcs, KeyType::Rsa) => {
                let rsa = object.key.rsa().map_err(|e| failed(FN, e))?;
                let mut signature = vec![0; rsa.size() as usize];
                let len = rsa
                    .private_encrypt(data, &mut signature, Padding::PKCS1)
                    .map_err(|e| failed(FN, e))?;
                signature.truncate(len);
                Ok(signature)
            }
            (Mechanism::Ecdsa, KeyType::Ec) => {
                let ec = object.key.ec_key().map_err(|e| failed(FN, e))?;
                let field_len = ec.group().degree().div_ceil(8) as i32;
                let sig = EcdsaSig::sign(data, &ec).map_err(|e| failed(FN, e))?;
                let mut signature = sig.r().to_vec_padded(field_len).map_err(|e| failed(FN, e))?;
                signature.extend(sig.s().to_vec_padded(field_len).map_err(|e| failed(FN, e))?);
                Ok(signature)
            }
            (Mechanism::Dsa, KeyType::Dsa) => {
                let q_len = object.key.dsa().map_err(|e| failed(FN, e))?.q().num_bytes();
                if data.len() > q_len as usize {
                    return Err(TokenError::new(FN, TokenErrorKind::Other, "CKR_DATA_LEN_RANGE"));
                }
                let mut ctx = PkeyCtx::new(&object.key).map_err(|e| failed(FN, e))?;
                ctx.sign_init().map_err(|e| failed(FN, e))?;
                let mut der = vec![];
                ctx.sign_to_vec(data, &mut der).map_err(|e| failed(FN, e))?;
                let sig = DsaSig::from_der(&der).map_err(|e| failed(FN, e))?;
                let mut signature = sig.r().to_vec_padded(q_len).map_err(|e| failed(FN, e))?;
                signature.extend(sig.s().to_vec_padded(q_len).map_err(|e| failed(FN, e))?);
                Ok(signature)
            }
            (Mechanism::RsaPkcs, _) | (Mechanism::Ecdsa, _) | (Mechanism::Dsa, _) => Err(TokenError::new(
                FN,
                TokenErrorKind::KeyTypeInconsistent,
                "CKR_KEY_TYPE_INCONSISTENT",
            )),
            _ => Err(mechanism_invalid(FN)),
        })
    }

    fn decrypt(&self, mechanism: &Mechanism, key: u64, ciphertext: &[u8]) -> Result<Vec<u8>, TokenError> {
        const FN: &str = "C_Decrypt";

        let _in_use = self.enter(MockFn::Decrypt);
        self.with_key(FN, key, |object| {
            if object.key_type != KeyType::Rsa {
                return Err(TokenError::new(
                    FN,
                    TokenErrorKind::KeyTypeInconsistent,
                    "CKR_KEY_TYPE_INCONSISTENT",
                ));
            }
            let mut decrypter = Decrypter::new(&object.key).map_err(|e| failed(FN, e))?;
            match mechanism {
                Mechanism::RsaPkcs => {
                    decrypter.set_rsa_padding(Padding::PKCS1).map_err(|e| failed(FN, e))?;
                }
                Mechanism::RsaPkcsOaep(hash) => {
                    decrypter
                        .set_rsa_padding(Padding::PKCS1_OAEP)
                        .map_err(|e| failed(FN, e))?;
                    decrypter
                        .set_rsa_oaep_md(hash.message_digest())
                        .map_err(|e| failed(FN, e))?;
                    decrypter
                        .set_rsa_mgf1_md(hash.message_digest())
                        .map_err(|e| failed(FN, e))?;
                }
                _ => return Err(mechanism_invalid(FN)),
            }
            let len = decrypter.decrypt_len(ciphertext).map_err(|e| failed(FN, e))?;
            let mut plaintext = vec![0; len];
            let len = decrypter
                .decrypt(ciphertext, &mut plaintext)
                .map_err(|_| TokenError::new(FN, TokenErrorKind::Other, "CKR_ENCRYPTED_DATA_INVALID"))?;
            plaintext.truncate(len);
            Ok(plaintext)
        })
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError> {
        let _in_use = self.enter(MockFn::GenerateRandom);
        let mut buf = vec![0; len];
        openssl::rand::rand_bytes(&mut buf).map_err(|e| failed("C_GenerateRandom", e))?;
        Ok(buf)
    }

    fn destroy_object(&self, object: u64) -> Result<(), TokenError> {
        const FN: &str = "C_DestroyObject";

        let _in_use = self.enter(MockFn::DestroyObject);
        let mut state = self.token.state();
        self.token.check_logged_in(&state, FN)?;

        let class = state
            .objects
            .get(&object)
            .map(|object| object.class)
            .ok_or_else(|| invalid_handle(FN))?;
        if state.fail_destroy.contains(&class) {
            return Err(TokenError::new(FN, TokenErrorKind::FunctionFailed, "CKR_FUNCTION_FAILED"));
        }
        state.objects.remove(&object);
        Ok(())
    }
}

//------------ Helpers -------------------------------------------------------

fn failed(function: &'static str, err: impl fmt::Display) -> TokenError {
    TokenError::new(function, TokenErrorKind::FunctionFailed, err.to_string())
}

fn invalid_handle(function: &'static str) -> TokenError {
    TokenError::new(function, TokenErrorKind::ObjectHandleInvalid, "CKR_OBJECT_HANDLE_INVALID")
}

fn template_incomplete(function: &'static str) -> TokenError {
    TokenError::new(function, TokenErrorKind::TemplateIncomplete, "CKR_TEMPLATE_INCOMPLETE")
}

fn mechanism_invalid(function: &'static str) -> TokenError {
    TokenError::new(function, TokenErrorKind::MechanismInvalid, "CKR_MECHANISM_INVALID")
}

//------------ Tests ---------------------------------------------------------
