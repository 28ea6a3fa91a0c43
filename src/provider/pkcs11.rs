//! Access to native PKCS#11 libraries through the `cryptoki` crate.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Mutex,
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    mechanism::{
        Mechanism as CkMechanism, MechanismType,
        rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource},
    },
    object::{
        Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType, ObjectClass as CkObjectClass,
        ObjectHandle,
    },
    session::{Session, UserType},
    slot::{Limit, Slot},
    types::AuthPin,
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{Error, TokenError, TokenErrorKind},
    hash::HashAlgorithm,
    provider::{Attribute, AttributeType, KeyType, Mechanism, ObjectClass, Provider, SessionLimit, TokenInfo, TokenSession},
};

//------------ Loaded libraries ----------------------------------------------

// Dropping the last `Pkcs11` handle of a library calls C_Finalize, so every user of a library in this process must
// share the one handle that was loaded for it, rather than loading the library again.
lazy_static! {
    static ref LIBRARIES: Mutex<HashMap<PathBuf, Pkcs11>> = Mutex::new(HashMap::new());
}

//------------ Pkcs11Provider ------------------------------------------------

#[derive(Clone)]
pub struct Pkcs11Provider {
    path: PathBuf,
    pkcs11: Pkcs11,
}

impl fmt::Debug for Pkcs11Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Provider").field("path", &self.path).finish()
    }
}

impl Provider for Pkcs11Provider {
    type Slot = Slot;
    type Object = ObjectHandle;
    type Session = Pkcs11Session;

    fn load(path: &Path) -> Result<Self, Error> {
        let mut libraries = LIBRARIES.lock().unwrap();

        let pkcs11 = match libraries.get(path) {
            Some(pkcs11) => pkcs11.clone(),
            None => {
                debug!("PKCS#11: Loading library '{}'", path.display());
                let pkcs11 = Pkcs11::new(path).map_err(|err| Error::LibraryLoadFailed {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
                libraries.insert(path.to_path_buf(), pkcs11.clone());
                pkcs11
            }
        };

        Ok(Pkcs11Provider {
            path: path.to_path_buf(),
            pkcs11,
        })
    }

    fn initialize(&self) -> Result<(), TokenError> {
        match self.pkcs11.initialize(CInitializeArgs::OsThreads) {
            Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                warn!(
                    "PKCS#11: Library '{}' was already initialized by another user in this process",
                    self.path.display()
                );
                Ok(())
            }
            res => res.map_err(|err| token_error("C_Initialize", err)),
        }
    }

    fn finalize(&self) -> Result<(), TokenError> {
        // C_Finalize is called by cryptoki when the last handle to the library is dropped. Forgetting the shared
        // handle here leaves only the handles of the caller, which are dropped right after.
        let mut libraries = LIBRARIES.lock().unwrap();
        libraries.remove(&self.path);
        Ok(())
    }

    fn slots_with_token(&self) -> Result<Vec<Slot>, TokenError> {
        self.pkcs11
            .get_slots_with_token()
            .map_err(|err| token_error("C_GetSlotList", err))
    }

    fn token_info(&self, slot: Slot) -> Result<TokenInfo, TokenError> {
        let info = self
            .pkcs11
            .get_token_info(slot)
            .map_err(|err| token_error("C_GetTokenInfo", err))?;

        let max_rw_sessions = match info.max_rw_session_count() {
            Limit::Max(max) => SessionLimit::Max(max),
            Limit::Infinite => SessionLimit::Infinite,
            Limit::Unavailable => SessionLimit::Unavailable,
        };

        Ok(TokenInfo {
            slot_id: slot.id(),
            label: info.label().trim_end().to_string(),
            serial_number: info.serial_number().trim_end().to_string(),
            model: info.model().trim_end().to_string(),
            manufacturer: info.manufacturer_id().trim_end().to_string(),
            max_rw_sessions,
        })
    }

    fn open_session(&self, slot: Slot) -> Result<Pkcs11Session, TokenError> {
        let session = self
            .pkcs11
            .open_rw_session(slot)
            .map_err(|err| token_error("C_OpenSession", err))?;
        Ok(Pkcs11Session { session })
    }
}

//------------ Pkcs11Session -------------------------------------------------

/// A cryptoki session, closed by cryptoki when dropped.
pub struct Pkcs11Session {
    session: Session,
}

impl fmt::Debug for Pkcs11Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Pkcs11Session")
    }
}

impl TokenSession for Pkcs11Session {
    type Object = ObjectHandle;

    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError> {
        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().clone().into()));
        self.session
            .login(UserType::User, pin.as_ref())
            .map_err(|err| token_error("C_Login", err))
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, TokenError> {
        let template = to_cryptoki_template(template);
        self.session
            .find_objects(&template)
            .map_err(|err| token_error("C_FindObjects", err))
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        let mechanism = to_cryptoki_mechanism(mechanism);
        self.session
            .generate_key_pair(
                &mechanism,
                &to_cryptoki_template(public_template),
                &to_cryptoki_template(private_template),
            )
            .map_err(|err| token_error("C_GenerateKeyPair", err))
    }

    fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError> {
        let types: Vec<CkAttributeType> = types.iter().map(|t| to_cryptoki_attribute_type(*t)).collect();
        let attributes = self
            .session
            .get_attributes(object, &types)
            .map_err(|err| token_error("C_GetAttributeValue", err))?;
        Ok(attributes.into_iter().filter_map(from_cryptoki_attribute).collect())
    }

    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.session
            .sign(&to_cryptoki_mechanism(mechanism), key, data)
            .map_err(|err| token_error("C_Sign", err))
    }

    fn decrypt(&self, mechanism: &Mechanism, key: ObjectHandle, ciphertext: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.session
            .decrypt(&to_cryptoki_mechanism(mechanism), key, ciphertext)
            .map_err(|err| token_error("C_Decrypt", err))
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError> {
        let len = u32::try_from(len).map_err(|_| {
            TokenError::new(
                "C_GenerateRandom",
                TokenErrorKind::Other,
                format!("cannot request {} random bytes at once", len),
            )
        })?;
        self.session
            .generate_random_vec(len)
            .map_err(|err| token_error("C_GenerateRandom", err))
    }

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), TokenError> {
        self.session
            .destroy_object(object)
            .map_err(|err| token_error("C_DestroyObject", err))
    }
}

//------------ Conversions ---------------------------------------------------

fn token_error(function: &'static str, err: CryptokiError) -> TokenError {
    let kind = match &err {
        CryptokiError::Pkcs11(rv, _) => match rv {
            RvError::CryptokiAlreadyInitialized => TokenErrorKind::AlreadyInitialized,
            RvError::CryptokiNotInitialized => TokenErrorKind::NotInitialized,
            RvError::UserAlreadyLoggedIn => TokenErrorKind::UserAlreadyLoggedIn,
            RvError::UserNotLoggedIn => TokenErrorKind::UserNotLoggedIn,
            RvError::PinIncorrect => TokenErrorKind::PinIncorrect,
            RvError::SessionCount => TokenErrorKind::SessionCount,
            RvError::ObjectHandleInvalid => TokenErrorKind::ObjectHandleInvalid,
            RvError::KeyTypeInconsistent => TokenErrorKind::KeyTypeInconsistent,
            RvError::MechanismInvalid => TokenErrorKind::MechanismInvalid,
            RvError::TemplateIncomplete => TokenErrorKind::TemplateIncomplete,
            RvError::TokenNotPresent => TokenErrorKind::TokenNotPresent,
            RvError::FunctionFailed => TokenErrorKind::FunctionFailed,
            _ => TokenErrorKind::Other,
        },
        _ => TokenErrorKind::Other,
    };
    TokenError::new(function, kind, err.to_string())
}

fn to_cryptoki_template(template: &[Attribute]) -> Vec<CkAttribute> {
    template.iter().map(to_cryptoki_attribute).collect()
}

fn to_cryptoki_attribute(attr: &Attribute) -> CkAttribute {
    match attr {
        Attribute::Class(ObjectClass::PublicKey) => CkAttribute::Class(CkObjectClass::PUBLIC_KEY),
        Attribute::Class(ObjectClass::PrivateKey) => CkAttribute::Class(CkObjectClass::PRIVATE_KEY),
        Attribute::KeyType(KeyType::Rsa) => CkAttribute::KeyType(CkKeyType::RSA),
        Attribute::KeyType(KeyType::Ec) => CkAttribute::KeyType(CkKeyType::EC),
        Attribute::KeyType(KeyType::Dsa) => CkAttribute::KeyType(CkKeyType::DSA),
        Attribute::Id(id) => CkAttribute::Id(id.clone()),
        Attribute::Label(label) => CkAttribute::Label(label.clone()),
        Attribute::Token(b) => CkAttribute::Token(*b),
        Attribute::Private(b) => CkAttribute::Private(*b),
        Attribute::Sensitive(b) => CkAttribute::Sensitive(*b),
        Attribute::Extractable(b) => CkAttribute::Extractable(*b),
        Attribute::Sign(b) => CkAttribute::Sign(*b),
        Attribute::Verify(b) => CkAttribute::Verify(*b),
        Attribute::Encrypt(b) => CkAttribute::Encrypt(*b),
        Attribute::Decrypt(b) => CkAttribute::Decrypt(*b),
        Attribute::ModulusBits(bits) => CkAttribute::ModulusBits((*bits).into()),
        Attribute::PublicExponent(e) => CkAttribute::PublicExponent(e.clone()),
        Attribute::Modulus(n) => CkAttribute::Modulus(n.clone()),
        Attribute::EcParams(p) => CkAttribute::EcParams(p.clone()),
        Attribute::EcPoint(p) => CkAttribute::EcPoint(p.clone()),
        Attribute::Prime(p) => CkAttribute::Prime(p.clone()),
        Attribute::Subprime(q) => CkAttribute::Subprime(q.clone()),
        Attribute::Base(g) => CkAttribute::Base(g.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.clone()),
    }
}

fn to_cryptoki_attribute_type(attr_type: AttributeType) -> CkAttributeType {
    match attr_type {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
        AttributeType::Prime => CkAttributeType::Prime,
        AttributeType::Subprime => CkAttributeType::Subprime,
        AttributeType::Base => CkAttributeType::Base,
        AttributeType::Value => CkAttributeType::Value,
    }
}

fn from_cryptoki_attribute(attr: CkAttribute) -> Option<Attribute> {
    match attr {
        CkAttribute::Class(class) if class == CkObjectClass::PUBLIC_KEY => Some(Attribute::Class(ObjectClass::PublicKey)),
        CkAttribute::Class(class) if class == CkObjectClass::PRIVATE_KEY => {
            Some(Attribute::Class(ObjectClass::PrivateKey))
        }
        CkAttribute::KeyType(key_type) if key_type == CkKeyType::RSA => Some(Attribute::KeyType(KeyType::Rsa)),
        CkAttribute::KeyType(key_type) if key_type == CkKeyType::EC => Some(Attribute::KeyType(KeyType::Ec)),
        CkAttribute::KeyType(key_type) if key_type == CkKeyType::DSA => Some(Attribute::KeyType(KeyType::Dsa)),
        CkAttribute::Id(id) => Some(Attribute::Id(id)),
        CkAttribute::Label(label) => Some(Attribute::Label(label)),
        CkAttribute::Modulus(n) => Some(Attribute::Modulus(n)),
        CkAttribute::PublicExponent(e) => Some(Attribute::PublicExponent(e)),
        CkAttribute::EcParams(p) => Some(Attribute::EcParams(p)),
        CkAttribute::EcPoint(p) => Some(Attribute::EcPoint(p)),
        CkAttribute::Prime(p) => Some(Attribute::Prime(p)),
        CkAttribute::Subprime(q) => Some(Attribute::Subprime(q)),
        CkAttribute::Base(g) => Some(Attribute::Base(g)),
        CkAttribute::Value(v) => Some(Attribute::Value(v)),
        _ => None,
    }
}

fn to_cryptoki_mechanism(mechanism: &Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::RsaPkcsKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::EcKeyPairGen => CkMechanism::EccKeyPairGen,
        Mechanism::DsaKeyPairGen => CkMechanism::DsaKeyPairGen,
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
        Mechanism::Dsa => CkMechanism::Dsa,
        Mechanism::RsaPkcsOaep(hash) => {
            let (hash_alg, mgf) = match hash {
                HashAlgorithm::Sha1 => (MechanismType::SHA1, PkcsMgfType::MGF1_SHA1),
                HashAlgorithm::Sha224 => (MechanismType::SHA224, PkcsMgfType::MGF1_SHA224),
                HashAlgorithm::Sha256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
                HashAlgorithm::Sha384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
                HashAlgorithm::Sha512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
            };
            CkMechanism::RsaPkcsOaep(PkcsOaepParams::new(hash_alg, mgf, PkcsOaepSource::empty()))
        }
    }
}

//------------ Tests ---------------------------------------------------------
