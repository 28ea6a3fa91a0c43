//! Handles to keys held by a token.
//!
//! Key handles borrow the [`Context`] they were created by and run every
//! operation through [`Context::with_session`]. The public half of a key pair
//! is read from the token once and kept, so [`Signer::public_key`] never
//! talks to the token.

use std::fmt;

use openssl::pkey::{PKey, Public};

use crate::{
    context::Context,
    error::Error,
    hash::HashAlgorithm,
    provider::{Attribute, AttributeType, KeyType, Mechanism, ObjectClass, Provider, TokenSession},
};

pub mod dsa;
pub mod ec;
pub mod rsa;

use self::{
    dsa::{DsaKeyPair, DsaParameters},
    ec::{Curve, EcKeyPair},
    rsa::RsaKeyPair,
};

/// The smallest RSA modulus, in bits, keys are generated with.
pub const MIN_RSA_BITS: u32 = 1024;

const DSA_PUBLIC_ATTRIBUTES: [AttributeType; 4] = [
    AttributeType::Prime,
    AttributeType::Subprime,
    AttributeType::Base,
    AttributeType::Value,
];

//------------ Signer and Decrypter ------------------------------------------

pub trait Signer {
    /// The public key, as read from the token when the handle was created.
    fn public_key(&self) -> &PKey<Public>;

    /// Signs a digest that was produced by the given hash algorithm.
    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>, Error>;

    /// Destroys the key pair on the token.
    fn delete(self) -> Result<(), Error>
    where
        Self: Sized;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecryptPadding {
    Pkcs1v15,

    /// OAEP with the given hash for both the label and MGF1.
    Oaep(HashAlgorithm),
}

pub trait Decrypter: Signer {
    fn decrypt(&self, ciphertext: &[u8], padding: DecryptPadding) -> Result<Vec<u8>, Error>;
}

//------------ Object --------------------------------------------------------

/// A token object and the context it belongs to.
pub struct Object<'c, P: Provider> {
    context: &'c Context<P>,
    handle: P::Object,
}

impl<P: Provider> fmt::Debug for Object<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Object").field("handle", &self.handle).finish()
    }
}

impl<'c, P: Provider> Object<'c, P> {
    pub fn new(context: &'c Context<P>, handle: P::Object) -> Self {
        Object { context, handle }
    }

    pub fn handle(&self) -> P::Object {
        self.handle
    }

    pub fn context(&self) -> &'c Context<P> {
        self.context
    }

    /// Destroys the object on the token.
    pub fn delete(self) -> Result<(), Error> {
        let handle = self.handle;
        trace!("PKCS#11: Destroying object with handle {:?}", handle);
        self.context.with_session("Destroying object", |session| {
            session.destroy_object(handle).map_err(Error::DestroyFailed)
        })
    }
}

//------------ PrivateKey ----------------------------------------------------

/// A private key together with its public key object.
pub struct PrivateKey<'c, P: Provider> {
    object: Object<'c, P>,
    public_object: Object<'c, P>,
    public_key: PKey<Public>,
    id: Vec<u8>,
}

impl<P: Provider> fmt::Debug for PrivateKey<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("id", &hex::encode(&self.id))
            .field("handle", &self.object.handle)
            .field("public_handle", &self.public_object.handle)
            .finish()
    }
}

impl<'c, P: Provider> PrivateKey<'c, P> {
    fn new(context: &'c Context<P>, found: FoundKeyPair<P::Object>) -> Self {
        PrivateKey {
            object: Object::new(context, found.private),
            public_object: Object::new(context, found.public),
            public_key: found.public_key,
            id: found.id,
        }
    }

    pub fn handle(&self) -> P::Object {
        self.object.handle()
    }

    pub fn public_handle(&self) -> P::Object {
        self.public_object.handle()
    }

    pub fn context(&self) -> &'c Context<P> {
        self.object.context()
    }

    /// The CKA_ID shared by both objects of the key pair.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    /// Destroys the private key, and then the public key.
    ///
    /// If destroying the private key fails, the public key is left alone. If
    /// only destroying the public key fails, the private key is gone already.
    pub fn delete(self) -> Result<(), Error> {
        self.object.delete()?;
        self.public_object.delete()
    }
}

//------------ KeyPair -------------------------------------------------------

/// A key pair of any supported type.
#[derive(Debug)]
pub enum KeyPair<'c, P: Provider> {
    Rsa(RsaKeyPair<'c, P>),
    Ec(EcKeyPair<'c, P>),
    Dsa(DsaKeyPair<'c, P>),
}

impl<'c, P: Provider> KeyPair<'c, P> {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyPair::Rsa(_) => KeyType::Rsa,
            KeyPair::Ec(_) => KeyType::Ec,
            KeyPair::Dsa(_) => KeyType::Dsa,
        }
    }

    pub fn private_key(&self) -> &PrivateKey<'c, P> {
        match self {
            KeyPair::Rsa(key) => key.private_key(),
            KeyPair::Ec(key) => key.private_key(),
            KeyPair::Dsa(key) => key.private_key(),
        }
    }

    /// Returns the key as a decrypter, if it can decrypt.
    pub fn as_decrypter(&self) -> Option<&RsaKeyPair<'c, P>> {
        match self {
            KeyPair::Rsa(key) => Some(key),
            KeyPair::Ec(_) | KeyPair::Dsa(_) => None,
        }
    }
}

impl<P: Provider> Signer for KeyPair<'_, P> {
    fn public_key(&self) -> &PKey<Public> {
        self.private_key().public_key()
    }

    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>, Error> {
        match self {
            KeyPair::Rsa(key) => key.sign(digest, hash),
            KeyPair::Ec(key) => key.sign(digest, hash),
            KeyPair::Dsa(key) => key.sign(digest, hash),
        }
    }

    fn delete(self) -> Result<(), Error> {
        match self {
            KeyPair::Rsa(key) => key.delete(),
            KeyPair::Ec(key) => key.delete(),
            KeyPair::Dsa(key) => key.delete(),
        }
    }
}

//------------ Key generation and lookup -------------------------------------

/// The objects of a key pair as found on, or generated by, a token.
struct FoundKeyPair<O> {
    private: O,
    public: O,
    public_key: PKey<Public>,
    id: Vec<u8>,
}

impl<P: Provider> Context<P> {
    /// Generates an RSA key pair with the given CKA_ID and optional CKA_LABEL.
    pub fn generate_rsa_key_pair(&self, id: &[u8], label: Option<&[u8]>, bits: u32) -> Result<RsaKeyPair<'_, P>, Error> {
        check_id_and_label(id, label)?;
        if bits < MIN_RSA_BITS {
            return Err(Error::invalid_argument(format!(
                "RSA keys need at least {} bits, {} requested",
                MIN_RSA_BITS, bits
            )));
        }

        let mut public_template = key_template(ObjectClass::PublicKey, KeyType::Rsa, id, label);
        public_template.extend([
            Attribute::Verify(true),
            Attribute::Encrypt(true),
            Attribute::Private(false),
            Attribute::ModulusBits(u64::from(bits)),
            Attribute::PublicExponent(rsa::PUBLIC_EXPONENT.to_vec()),
        ]);

        let mut private_template = key_template(ObjectClass::PrivateKey, KeyType::Rsa, id, label);
        private_template.extend(private_key_usage());
        private_template.push(Attribute::Decrypt(true));

        let found = self.generate_key_pair(
            "Generating RSA key pair",
            Mechanism::RsaPkcsKeyPairGen,
            id,
            &public_template,
            &private_template,
            &[AttributeType::Modulus, AttributeType::PublicExponent],
            |attributes| rsa::public_key_from_attributes(attributes),
        )?;

        info!("PKCS#11: Generated {} bit RSA key pair with id {}", bits, hex::encode(id));
        Ok(RsaKeyPair::new(PrivateKey::new(self, found)))
    }

    /// Generates an EC key pair on the given curve with the given CKA_ID and optional CKA_LABEL.
    pub fn generate_ec_key_pair(&self, id: &[u8], label: Option<&[u8]>, curve: Curve) -> Result<EcKeyPair<'_, P>, Error> {
        check_id_and_label(id, label)?;

        let mut public_template = key_template(ObjectClass::PublicKey, KeyType::Ec, id, label);
        public_template.extend([
            Attribute::Verify(true),
            Attribute::Private(false),
            Attribute::EcParams(curve.params().to_vec()),
        ]);

        let mut private_template = key_template(ObjectClass::PrivateKey, KeyType::Ec, id, label);
        private_template.extend(private_key_usage());

        let found = self.generate_key_pair(
            "Generating EC key pair",
            Mechanism::EcKeyPairGen,
            id,
            &public_template,
            &private_template,
            &[AttributeType::EcParams, AttributeType::EcPoint],
            |attributes| ec::public_key_from_attributes(attributes).map(|(_, public_key)| public_key),
        )?;

        info!("PKCS#11: Generated {} key pair with id {}", curve, hex::encode(id));
        Ok(EcKeyPair::new(PrivateKey::new(self, found), curve))
    }

    /// Generates a DSA key pair with the given domain parameters, CKA_ID and optional CKA_LABEL.
    pub fn generate_dsa_key_pair(
        &self,
        id: &[u8],
        label: Option<&[u8]>,
        params: &DsaParameters,
    ) -> Result<DsaKeyPair<'_, P>, Error> {
        check_id_and_label(id, label)?;

        let mut public_template = key_template(ObjectClass::PublicKey, KeyType::Dsa, id, label);
        public_template.extend([Attribute::Verify(true), Attribute::Private(false)]);
        public_template.extend(params.attributes());

        let mut private_template = key_template(ObjectClass::PrivateKey, KeyType::Dsa, id, label);
        private_template.extend(private_key_usage());

        let found = self.generate_key_pair(
            "Generating DSA key pair",
            Mechanism::DsaKeyPairGen,
            id,
            &public_template,
            &private_template,
            &DSA_PUBLIC_ATTRIBUTES,
            |attributes| dsa::public_key_from_attributes(attributes),
        )?;

        info!("PKCS#11: Generated {} DSA key pair with id {}", params, hex::encode(id));
        Ok(DsaKeyPair::new(PrivateKey::new(self, found)))
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_key_pair(
        &self,
        desc: &str,
        mechanism: Mechanism,
        id: &[u8],
        public_template: &[Attribute],
        private_template: &[Attribute],
        public_attributes: &[AttributeType],
        decode: impl FnOnce(&[Attribute]) -> Result<PKey<Public>, Error>,
    ) -> Result<FoundKeyPair<P::Object>, Error> {
        self.with_session(desc, |session| {
            let (public, private) = session
                .generate_key_pair(&mechanism, public_template, private_template)
                .map_err(|err| Error::token(desc, err))?;

            let public_key = session
                .get_attributes(public, public_attributes)
                .map_err(|err| Error::token(desc, err))
                .and_then(|attributes| decode(&attributes));

            match public_key {
                Ok(public_key) => Ok(FoundKeyPair {
                    private,
                    public,
                    public_key,
                    id: id.to_vec(),
                }),
                Err(err) => {
                    // No handle to the new objects reaches the caller.
                    for object in [private, public] {
                        if let Err(destroy_err) = session.destroy_object(object) {
                            warn!(
                                "PKCS#11: Failed to destroy object {:?} of key pair with id {}: {}",
                                object,
                                hex::encode(id),
                                destroy_err
                            );
                        }
                    }
                    Err(err)
                }
            }
        })
    }

    /// Finds a key pair by CKA_ID, CKA_LABEL or both.
    ///
    /// Returns `Ok(None)` if there is no matching private key. The public key
    /// is looked up by the CKA_ID of the private key. Fails if more than one
    /// private key matches, or if the public key cannot be found.
    pub fn find_key_pair(&self, id: Option<&[u8]>, label: Option<&[u8]>) -> Result<Option<KeyPair<'_, P>>, Error> {
        if id.is_none() && label.is_none() {
            return Err(Error::invalid_argument("a key pair is found by id, label or both"));
        }
        let wanted = describe_key(id, label);

        let desc = "Finding key pair";
        let found = self.with_session(desc, |session| {
            let mut template = vec![Attribute::Class(ObjectClass::PrivateKey)];
            template.extend(id.map(|id| Attribute::Id(id.to_vec())));
            template.extend(label.map(|label| Attribute::Label(label.to_vec())));

            let private = match session
                .find_objects(&template)
                .map_err(|err| Error::token(desc, err))?
                .as_slice()
            {
                [] => return Ok(None),
                [private] => *private,
                found => {
                    return Err(Error::DuplicateKey(format!(
                        "{} private keys found with {}",
                        found.len(),
                        wanted
                    )));
                }
            };

            let attributes = session
                .get_attributes(private, &[AttributeType::KeyType, AttributeType::Id])
                .map_err(|err| Error::token(desc, err))?;
            let key_type = Attribute::find_key_type(&attributes)
                .ok_or_else(|| Error::KeyDecode(format!("unsupported type of private key with {}", wanted)))?;
            let private_id = Attribute::find_bytes(&attributes, AttributeType::Id)
                .map(|id| id.to_vec())
                .unwrap_or_default();

            let mut template = vec![Attribute::Class(ObjectClass::PublicKey), Attribute::KeyType(key_type)];
            if private_id.is_empty() {
                template.extend(label.map(|label| Attribute::Label(label.to_vec())));
            } else {
                template.push(Attribute::Id(private_id.clone()));
            }

            let public = match session
                .find_objects(&template)
                .map_err(|err| Error::token(desc, err))?
                .as_slice()
            {
                [] => return Err(Error::KeyNotFound(format!("no public key for private key with {}", wanted))),
                [public] => *public,
                found => {
                    return Err(Error::DuplicateKey(format!(
                        "{} public keys found for private key with {}",
                        found.len(),
                        wanted
                    )));
                }
            };

            let (public_key, curve) = match key_type {
                KeyType::Rsa => {
                    let attributes = session
                        .get_attributes(public, &[AttributeType::Modulus, AttributeType::PublicExponent])
                        .map_err(|err| Error::token(desc, err))?;
                    (rsa::public_key_from_attributes(&attributes)?, None)
                }
                KeyType::Ec => {
                    let attributes = session
                        .get_attributes(public, &[AttributeType::EcParams, AttributeType::EcPoint])
                        .map_err(|err| Error::token(desc, err))?;
                    let (curve, public_key) = ec::public_key_from_attributes(&attributes)?;
                    (public_key, Some(curve))
                }
                KeyType::Dsa => {
                    let attributes = session
                        .get_attributes(public, &DSA_PUBLIC_ATTRIBUTES)
                        .map_err(|err| Error::token(desc, err))?;
                    (dsa::public_key_from_attributes(&attributes)?, None)
                }
            };

            let found = FoundKeyPair {
                private,
                public,
                public_key,
                id: private_id,
            };
            Ok(Some((found, key_type, curve)))
        })?;

        Ok(found.map(|(found, key_type, curve)| {
            debug!("PKCS#11: Found key pair with {}", wanted);
            let key = PrivateKey::new(self, found);
            match (key_type, curve) {
                (KeyType::Ec, Some(curve)) => KeyPair::Ec(EcKeyPair::new(key, curve)),
                (KeyType::Dsa, _) => KeyPair::Dsa(DsaKeyPair::new(key)),
                _ => KeyPair::Rsa(RsaKeyPair::new(key)),
            }
        }))
    }
}

fn check_id_and_label(id: &[u8], label: Option<&[u8]>) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::invalid_argument("a key pair needs a non-empty id"));
    }
    if label.is_some_and(|label| label.is_empty()) {
        return Err(Error::invalid_argument("a key pair label must not be empty"));
    }
    Ok(())
}

fn key_template(class: ObjectClass, key_type: KeyType, id: &[u8], label: Option<&[u8]>) -> Vec<Attribute> {
    let mut template = vec![
        Attribute::Class(class),
        Attribute::KeyType(key_type),
        Attribute::Token(true),
        Attribute::Id(id.to_vec()),
    ];
    template.extend(label.map(|label| Attribute::Label(label.to_vec())));
    template
}

fn private_key_usage() -> [Attribute; 4] {
    [
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Sign(true),
    ]
}

fn describe_key(id: Option<&[u8]>, label: Option<&[u8]>) -> String {
    match (id, label) {
        (Some(id), Some(label)) => format!("id {} and label '{}'", hex::encode(id), String::from_utf8_lossy(label)),
        (Some(id), None) => format!("id {}", hex::encode(id)),
        (None, Some(label)) => format!("label '{}'", String::from_utf8_lossy(label)),
        (None, None) => "no id or label".to_string(),
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_and_label_checks() {
        assert!(check_id_and_label(b"id", None).is_ok());
        assert!(check_id_and_label(b"id", Some(b"label")).is_ok());
        assert!(matches!(check_id_and_label(b"", None), Err(Error::InvalidArgument(_))));
        assert!(matches!(check_id_and_label(b"id", Some(b"")), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn templates_carry_id_and_label() {
        let template = key_template(ObjectClass::PublicKey, KeyType::Ec, b"\x01\x02", Some(b"signing"));
        assert_eq!(Some(&b"\x01\x02"[..]), Attribute::find_bytes(&template, AttributeType::Id));
        assert_eq!(Some(&b"signing"[..]), Attribute::find_bytes(&template, AttributeType::Label));
        assert!(template.contains(&Attribute::Token(true)));

        let template = key_template(ObjectClass::PrivateKey, KeyType::Rsa, b"\x01", None);
        assert_eq!(None, Attribute::find_bytes(&template, AttributeType::Label));
    }

    #[test]
    fn key_descriptions() {
        assert_eq!("id 0102", describe_key(Some(&[1, 2]), None));
        assert_eq!("label 'k'", describe_key(None, Some(b"k")));
        assert_eq!("id 01 and label 'k'", describe_key(Some(&[1]), Some(b"k")));
    }
}
