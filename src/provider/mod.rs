//! The interface to token libraries.
//!
//! A [`Provider`] stands for a loaded token library, a [`TokenSession`] for
//! a session opened on one of its tokens. Contexts and key handles only ever
//! talk to a token through these traits, which keeps them independent of the
//! binding used to reach the native library.

use std::{fmt, path::Path};

use secrecy::SecretString;

use crate::{
    error::{Error, TokenError},
    hash::HashAlgorithm,
};

pub mod mock;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

//------------ Provider ------------------------------------------------------

pub trait Provider: Sized + Send + Sync + 'static {
    type Slot: Copy + fmt::Debug + Send + Sync + 'static;
    type Object: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    type Session: TokenSession<Object = Self::Object>;

    /// Loads the library at the given path without initializing it.
    fn load(path: &Path) -> Result<Self, Error>;

    /// Initializes the library for use by multiple threads (C_Initialize).
    fn initialize(&self) -> Result<(), TokenError>;

    /// Finalizes the library (C_Finalize).
    fn finalize(&self) -> Result<(), TokenError>;

    /// Returns the slots that hold a token, in the order the library reports them.
    fn slots_with_token(&self) -> Result<Vec<Self::Slot>, TokenError>;

    fn token_info(&self, slot: Self::Slot) -> Result<TokenInfo, TokenError>;

    /// Opens a read/write session on the token in the given slot.
    fn open_session(&self, slot: Self::Slot) -> Result<Self::Session, TokenError>;
}

//------------ TokenSession --------------------------------------------------

/// An open session with a token.
///
/// A session must only ever be used by one thread at a time. It is closed
/// when dropped.
pub trait TokenSession: Send + 'static {
    type Object: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// Logs the normal user in, with the PIN if one is given.
    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError>;

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<Self::Object>, TokenError>;

    /// Generates a key pair and returns the (public, private) key objects.
    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(Self::Object, Self::Object), TokenError>;

    fn get_attributes(&self, object: Self::Object, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError>;

    fn sign(&self, mechanism: &Mechanism, key: Self::Object, data: &[u8]) -> Result<Vec<u8>, TokenError>;

    fn decrypt(&self, mechanism: &Mechanism, key: Self::Object, ciphertext: &[u8]) -> Result<Vec<u8>, TokenError>;

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError>;

    fn destroy_object(&self, object: Self::Object) -> Result<(), TokenError>;
}

//------------ TokenInfo -----------------------------------------------------

/// Description of a token and the slot it sits in.
///
/// Text fields have the blank padding used by the token API removed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenInfo {
    pub slot_id: u64,
    pub label: String,
    pub serial_number: String,
    pub model: String,
    pub manufacturer: String,
    pub max_rw_sessions: SessionLimit,
}

impl fmt::Display for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "slot {} label '{}' serial '{}' model '{}' manufacturer '{}'",
            self.slot_id, self.label, self.serial_number, self.model, self.manufacturer
        )
    }
}

/// The number of read/write sessions a token allows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionLimit {
    Max(u64),
    Infinite,
    Unavailable,
}

impl SessionLimit {
    /// Applies this limit to a configured maximum.
    pub fn ceiling(self, configured: usize) -> usize {
        match self {
            SessionLimit::Max(max) => usize::try_from(max).map_or(configured, |max| configured.min(max)),
            SessionLimit::Infinite | SessionLimit::Unavailable => configured,
        }
    }
}

impl fmt::Display for SessionLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionLimit::Max(max) => write!(f, "{}", max),
            SessionLimit::Infinite => write!(f, "infinite"),
            SessionLimit::Unavailable => write!(f, "unavailable"),
        }
    }
}

//------------ Attributes ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Ec,
    Dsa,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    Class,
    KeyType,
    Id,
    Label,
    Modulus,
    PublicExponent,
    EcParams,
    EcPoint,
    Prime,
    Subprime,
    Base,
    Value,
}

/// An object attribute with its value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Id(Vec<u8>),
    Label(Vec<u8>),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Sign(bool),
    Verify(bool),
    Encrypt(bool),
    Decrypt(bool),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    Modulus(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),

    // DSA domain parameters p, q and g.
    Prime(Vec<u8>),
    Subprime(Vec<u8>),
    Base(Vec<u8>),

    /// The key value, for a DSA public key the public value y.
    Value(Vec<u8>),
}

impl Attribute {
    /// Returns the byte value of the first attribute of the given type.
    pub fn find_bytes(attributes: &[Attribute], attr_type: AttributeType) -> Option<&[u8]> {
        attributes.iter().find_map(|attr| match (attr, attr_type) {
            (Attribute::Id(v), AttributeType::Id)
            | (Attribute::Label(v), AttributeType::Label)
            | (Attribute::Modulus(v), AttributeType::Modulus)
            | (Attribute::PublicExponent(v), AttributeType::PublicExponent)
            | (Attribute::EcParams(v), AttributeType::EcParams)
            | (Attribute::EcPoint(v), AttributeType::EcPoint)
            | (Attribute::Prime(v), AttributeType::Prime)
            | (Attribute::Subprime(v), AttributeType::Subprime)
            | (Attribute::Base(v), AttributeType::Base)
            | (Attribute::Value(v), AttributeType::Value) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn find_key_type(attributes: &[Attribute]) -> Option<KeyType> {
        attributes.iter().find_map(|attr| match attr {
            Attribute::KeyType(key_type) => Some(*key_type),
            _ => None,
        })
    }
}

//------------ Mechanism -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,
    EcKeyPairGen,
    DsaKeyPairGen,

    /// Raw PKCS#1 v1.5, the caller provides the DigestInfo to sign.
    RsaPkcs,

    /// RSA OAEP with the given hash for both the label hash and MGF1.
    RsaPkcsOaep(HashAlgorithm),

    /// Raw ECDSA, the signature is the concatenation of r and s.
    Ecdsa,

    /// Raw DSA over a digest of at most q bytes, the signature is r and s of q bytes each.
    Dsa,
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_limit_ceiling() {
        assert_eq!(10, SessionLimit::Max(10).ceiling(1024));
        assert_eq!(4, SessionLimit::Max(10).ceiling(4));
        assert_eq!(1024, SessionLimit::Infinite.ceiling(1024));
        assert_eq!(1024, SessionLimit::Unavailable.ceiling(1024));
        assert_eq!(0, SessionLimit::Max(0).ceiling(1024));
    }

    #[test]
    fn find_attribute_values() {
        let attrs = vec![
            Attribute::KeyType(KeyType::Ec),
            Attribute::Id(vec![1, 2]),
            Attribute::EcPoint(vec![4, 5]),
        ];
        assert_eq!(Some(&[1u8, 2][..]), Attribute::find_bytes(&attrs, AttributeType::Id));
        assert_eq!(Some(&[4u8, 5][..]), Attribute::find_bytes(&attrs, AttributeType::EcPoint));
        assert_eq!(None, Attribute::find_bytes(&attrs, AttributeType::Label));
        assert_eq!(Some(KeyType::Ec), Attribute::find_key_type(&attrs));
    }
}
