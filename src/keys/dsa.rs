//! DSA keys.

use std::fmt;

use openssl::{
    bn::{BigNum, BigNumRef},
    dsa::{Dsa, DsaSig},
    pkey::{PKey, Params, Public},
};

use crate::{
    error::Error,
    hash::HashAlgorithm,
    keys::{PrivateKey, Signer},
    provider::{Attribute, AttributeType, Mechanism, Provider, TokenSession},
};

//------------ DsaParameters -------------------------------------------------

/// The domain parameters p, q and g keys are generated with.
#[derive(Clone)]
pub struct DsaParameters {
    params: Dsa<Params>,
}

impl DsaParameters {
    pub fn from_components(p: BigNum, q: BigNum, g: BigNum) -> Result<Self, Error> {
        Ok(DsaParameters {
            params: Dsa::from_pqg(p, q, g)?,
        })
    }

    /// Generates new parameters with a prime p of the given size.
    ///
    /// This takes a while for larger sizes.
    pub fn generate(bits: u32) -> Result<Self, Error> {
        Ok(DsaParameters {
            params: Dsa::generate_params(bits)?,
        })
    }

    pub fn p(&self) -> &BigNumRef {
        self.params.p()
    }

    pub fn q(&self) -> &BigNumRef {
        self.params.q()
    }

    pub fn g(&self) -> &BigNumRef {
        self.params.g()
    }

    /// The size of p and q in bits, the L and N of FIPS 186.
    pub fn sizes(&self) -> (u32, u32) {
        (self.p().num_bits() as u32, self.q().num_bits() as u32)
    }

    pub(crate) fn attributes(&self) -> [Attribute; 3] {
        [
            Attribute::Prime(self.p().to_vec()),
            Attribute::Subprime(self.q().to_vec()),
            Attribute::Base(self.g().to_vec()),
        ]
    }
}

impl fmt::Debug for DsaParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (l, n) = self.sizes();
        f.debug_struct("DsaParameters").field("l", &l).field("n", &n).finish()
    }
}

impl fmt::Display for DsaParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (l, n) = self.sizes();
        write!(f, "L{}N{}", l, n)
    }
}

/// Decodes a DSA public key from its domain parameters and CKA_VALUE.
pub(crate) fn public_key_from_attributes(attributes: &[Attribute]) -> Result<PKey<Public>, Error> {
    let component = |attr_type, name| {
        Attribute::find_bytes(attributes, attr_type)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::KeyDecode(format!("missing DSA {}", name)))
            .and_then(|value| Ok(BigNum::from_slice(value)?))
    };

    let dsa = Dsa::from_public_components(
        component(AttributeType::Prime, "prime")?,
        component(AttributeType::Subprime, "subprime")?,
        component(AttributeType::Base, "base")?,
        component(AttributeType::Value, "public value")?,
    )?;
    Ok(PKey::from_dsa(dsa)?)
}

//------------ DsaKeyPair ----------------------------------------------------

/// A DSA key pair held by a token.
#[derive(Debug)]
pub struct DsaKeyPair<'c, P: Provider> {
    key: PrivateKey<'c, P>,
}

impl<'c, P: Provider> DsaKeyPair<'c, P> {
    pub(crate) fn new(key: PrivateKey<'c, P>) -> Self {
        DsaKeyPair { key }
    }

    /// The size of the subprime q in bytes.
    pub fn q_len(&self) -> usize {
        match self.key.public_key().dsa() {
            Ok(dsa) => dsa.q().num_bytes() as usize,
            Err(_) => 0,
        }
    }

    pub fn private_key(&self) -> &PrivateKey<'c, P> {
        &self.key
    }
}

impl<P: Provider> Signer for DsaKeyPair<'_, P> {
    fn public_key(&self) -> &PKey<Public> {
        self.key.public_key()
    }

    /// Signs a digest with DSA, returning the DER encoded signature.
    ///
    /// A digest longer than q is cut down to its leftmost q bytes first.
    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>, Error> {
        hash.check_digest(digest)?;
        let q_len = self.q_len();
        if q_len == 0 {
            return Err(Error::KeyDecode("DSA public key without subprime".to_string()));
        }
        let digest = &digest[..digest.len().min(q_len)];

        let desc = "Signing with DSA key";
        let handle = self.key.handle();
        let raw = self.key.context().with_session(desc, |session| {
            session
                .sign(&Mechanism::Dsa, handle, digest)
                .map_err(|err| Error::token(desc, err))
        })?;

        if raw.len() != 2 * q_len {
            return Err(Error::KeyDecode(format!(
                "DSA signature of length {} for a {} byte subprime",
                raw.len(),
                q_len
            )));
        }
        let (r, s) = raw.split_at(q_len);
        let sig = DsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
        Ok(sig.to_der()?)
    }

    fn delete(self) -> Result<(), Error> {
        self.key.delete()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_public_key() {
        let dsa = Dsa::generate(1024).unwrap();
        let mut attrs = vec![
            Attribute::Prime(dsa.p().to_vec()),
            Attribute::Subprime(dsa.q().to_vec()),
            Attribute::Base(dsa.g().to_vec()),
            Attribute::Value(dsa.pub_key().to_vec()),
        ];
        let public_key = public_key_from_attributes(&attrs).unwrap();
        assert_eq!(dsa.pub_key().to_vec(), public_key.dsa().unwrap().pub_key().to_vec());

        attrs.pop();
        assert!(matches!(public_key_from_attributes(&attrs), Err(Error::KeyDecode(_))));
    }

    #[test]
    fn parameter_sizes() {
        let dsa = Dsa::generate(1024).unwrap();
        let params = DsaParameters::from_components(
            dsa.p().to_owned().unwrap(),
            dsa.q().to_owned().unwrap(),
            dsa.g().to_owned().unwrap(),
        )
        .unwrap();
        assert_eq!((1024, 160), params.sizes());
        assert_eq!("L1024N160", params.to_string());
        assert_eq!(Some(&dsa.q().to_vec()[..]), Attribute::find_bytes(&params.attributes(), AttributeType::Subprime));
    }
}
