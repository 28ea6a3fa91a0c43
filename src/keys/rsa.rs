//! RSA keys.

use openssl::{
    bn::BigNum,
    pkey::{PKey, Public},
    rsa::Rsa,
};

use crate::{
    error::Error,
    hash::HashAlgorithm,
    keys::{DecryptPadding, Decrypter, PrivateKey, Signer},
    provider::{Attribute, AttributeType, Mechanism, Provider, TokenSession},
};

/// The public exponent of generated keys, 65537.
pub(crate) const PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Decodes an RSA public key from its CKA_MODULUS and CKA_PUBLIC_EXPONENT values.
pub(crate) fn public_key_from_attributes(attributes: &[Attribute]) -> Result<PKey<Public>, Error> {
    let modulus = Attribute::find_bytes(attributes, AttributeType::Modulus)
        .ok_or_else(|| Error::KeyDecode("missing RSA modulus".to_string()))?;
    let exponent = Attribute::find_bytes(attributes, AttributeType::PublicExponent)
        .ok_or_else(|| Error::KeyDecode("missing RSA public exponent".to_string()))?;

    if modulus.is_empty() || exponent.is_empty() {
        return Err(Error::KeyDecode("empty RSA modulus or public exponent".to_string()));
    }

    let rsa = Rsa::from_public_components(BigNum::from_slice(modulus)?, BigNum::from_slice(exponent)?)?;
    Ok(PKey::from_rsa(rsa)?)
}

//------------ RsaKeyPair ----------------------------------------------------

/// An RSA key pair held by a token.
#[derive(Debug)]
pub struct RsaKeyPair<'c, P: Provider> {
    key: PrivateKey<'c, P>,
}

impl<'c, P: Provider> RsaKeyPair<'c, P> {
    pub(crate) fn new(key: PrivateKey<'c, P>) -> Self {
        RsaKeyPair { key }
    }

    /// The modulus size in bits.
    pub fn bits(&self) -> u32 {
        self.key.public_key().bits()
    }

    pub fn private_key(&self) -> &PrivateKey<'c, P> {
        &self.key
    }
}

impl<P: Provider> Signer for RsaKeyPair<'_, P> {
    fn public_key(&self) -> &PKey<Public> {
        self.key.public_key()
    }

    /// Signs a digest with PKCS #1 v1.5 padding.
    ///
    /// The DigestInfo is put together here and signed with the raw
    /// CKM_RSA_PKCS mechanism, so the token never needs to know the hash.
    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>, Error> {
        let digest_info = hash.digest_info(digest)?;

        let desc = "Signing with RSA key";
        let handle = self.key.handle();
        self.key.context().with_session(desc, |session| {
            session
                .sign(&Mechanism::RsaPkcs, handle, &digest_info)
                .map_err(|err| Error::token(desc, err))
        })
    }

    fn delete(self) -> Result<(), Error> {
        self.key.delete()
    }
}

impl<P: Provider> Decrypter for RsaKeyPair<'_, P> {
    fn decrypt(&self, ciphertext: &[u8], padding: DecryptPadding) -> Result<Vec<u8>, Error> {
        let mechanism = match padding {
            DecryptPadding::Pkcs1v15 => Mechanism::RsaPkcs,
            DecryptPadding::Oaep(hash) => Mechanism::RsaPkcsOaep(hash),
        };

        let desc = "Decrypting with RSA key";
        let handle = self.key.handle();
        self.key.context().with_session(desc, |session| {
            session
                .decrypt(&mechanism, handle, ciphertext)
                .map_err(|err| Error::token(desc, err))
        })
    }
}

//------------ Tests ---------------------------------------------------------
