//! Elliptic curve keys.

use std::{fmt, str::FromStr};

use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey, EcPoint},
    ecdsa::EcdsaSig,
    nid::Nid,
    pkey::{PKey, Public},
};

use crate::{
    error::Error,
    hash::HashAlgorithm,
    keys::{PrivateKey, Signer},
    provider::{Attribute, AttributeType, Mechanism, Provider, TokenSession},
};

//------------ Curve ---------------------------------------------------------

/// The named curves keys can be generated on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Curve {
    P256,
    P384,
    P521,
}

impl Curve {
    /// The DER encoded object identifier of the curve, as used for CKA_EC_PARAMS.
    pub fn params(self) -> &'static [u8] {
        match self {
            Curve::P256 => &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
            Curve::P384 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22],
            Curve::P521 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23],
        }
    }

    pub fn from_params(params: &[u8]) -> Option<Curve> {
        [Curve::P256, Curve::P384, Curve::P521]
            .into_iter()
            .find(|curve| curve.params() == params)
    }

    pub fn nid(self) -> Nid {
        match self {
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Curve::P256 => write!(f, "P-256"),
            Curve::P384 => write!(f, "P-384"),
            Curve::P521 => write!(f, "P-521"),
        }
    }
}

impl FromStr for Curve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "P256" | "PRIME256V1" | "SECP256R1" => Ok(Curve::P256),
            "P384" | "SECP384R1" => Ok(Curve::P384),
            "P521" | "SECP521R1" => Ok(Curve::P521),
            _ => Err(Error::invalid_argument(format!("unsupported curve '{}'", s))),
        }
    }
}

//------------ EC point encoding ---------------------------------------------

/// Wraps an encoded curve point in a DER OCTET STRING, the form of CKA_EC_POINT.
pub(crate) fn wrap_ec_point(point: &[u8]) -> Vec<u8> {
    let mut der = Vec::with_capacity(point.len() + 4);
    der.push(0x04);
    match point.len() {
        len if len < 0x80 => der.push(len as u8),
        len if len < 0x100 => der.extend_from_slice(&[0x81, len as u8]),
        len => der.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
    }
    der.extend_from_slice(point);
    der
}

/// Returns the content of a DER OCTET STRING, if `der` is exactly that.
fn unwrap_ec_point(der: &[u8]) -> Option<&[u8]> {
    let (&tag, rest) = der.split_first()?;
    if tag != 0x04 {
        return None;
    }
    let (&first, rest) = rest.split_first()?;
    let (len, content) = match first {
        len if len < 0x80 => (len as usize, rest),
        0x81 => {
            let (&len, rest) = rest.split_first()?;
            (len as usize, rest)
        }
        0x82 => {
            if rest.len() < 2 {
                return None;
            }
            ((rest[0] as usize) << 8 | rest[1] as usize, &rest[2..])
        }
        _ => return None,
    };
    (content.len() == len).then_some(content)
}

/// Decodes the public key of a curve from its CKA_EC_PARAMS and CKA_EC_POINT values.
pub(crate) fn public_key_from_attributes(attributes: &[Attribute]) -> Result<(Curve, PKey<Public>), Error> {
    let params = Attribute::find_bytes(attributes, AttributeType::EcParams)
        .ok_or_else(|| Error::KeyDecode("missing EC parameters".to_string()))?;
    let curve = Curve::from_params(params)
        .ok_or_else(|| Error::KeyDecode(format!("unsupported EC parameters {}", hex::encode(params))))?;
    let ec_point = Attribute::find_bytes(attributes, AttributeType::EcPoint)
        .ok_or_else(|| Error::KeyDecode("missing EC point".to_string()))?;

    let group = EcGroup::from_curve_name(curve.nid())?;
    let mut ctx = BigNumContext::new()?;

    // Some tokens return the bare point rather than the DER OCTET STRING the standard asks for.
    let point = match unwrap_ec_point(ec_point) {
        Some(inner) => EcPoint::from_bytes(&group, inner, &mut ctx)
            .or_else(|_| EcPoint::from_bytes(&group, ec_point, &mut ctx)),
        None => EcPoint::from_bytes(&group, ec_point, &mut ctx),
    }
    .map_err(|err| Error::KeyDecode(format!("invalid {} point: {}", curve, err)))?;

    let ec_key = EcKey::from_public_key(&group, &point)?;
    ec_key
        .check_key()
        .map_err(|err| Error::KeyDecode(format!("invalid {} public key: {}", curve, err)))?;

    Ok((curve, PKey::from_ec_key(ec_key)?))
}

//------------ EcKeyPair -----------------------------------------------------

/// An EC key pair held by a token.
#[derive(Debug)]
pub struct EcKeyPair<'c, P: Provider> {
    key: PrivateKey<'c, P>,
    curve: Curve,
}

impl<'c, P: Provider> EcKeyPair<'c, P> {
    pub(crate) fn new(key: PrivateKey<'c, P>, curve: Curve) -> Self {
        EcKeyPair { key, curve }
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn private_key(&self) -> &PrivateKey<'c, P> {
        &self.key
    }
}

impl<P: Provider> Signer for EcKeyPair<'_, P> {
    fn public_key(&self) -> &PKey<Public> {
        self.key.public_key()
    }

    /// Signs a digest with ECDSA, returning the DER encoded signature.
    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>, Error> {
        hash.check_digest(digest)?;

        let desc = "Signing with EC key";
        let handle = self.key.handle();
        let raw = self.key.context().with_session(desc, |session| {
            session
                .sign(&Mechanism::Ecdsa, handle, digest)
                .map_err(|err| Error::token(desc, err))
        })?;

        // The token returns r and s as two equally long big endian numbers.
        if raw.is_empty() || raw.len() % 2 != 0 {
            return Err(Error::KeyDecode(format!("ECDSA signature of odd length {}", raw.len())));
        }
        let (r, s) = raw.split_at(raw.len() / 2);
        let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
        Ok(sig.to_der()?)
    }

    fn delete(self) -> Result<(), Error> {
        self.key.delete()
    }
}

//------------ Tests ---------------------------------------------------------
