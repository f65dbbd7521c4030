//! Core types for the Li24 protocol

use crate::{Error, Result};
use elliptic_curve::{
    bigint::U256,
    ops::Reduce,
    scalar::IsHigh,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    PrimeField,
};
use k256::{ecdsa, AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Unique identifier for a party in the MPC network
pub type PartyId = usize;

/// Length of random identifiers, PRG seeds and chain keys
pub const RID_BYTES: usize = 32;

/// Identifier of one protocol run, agreed on by its parties beforehand
pub type SessionId = [u8; 32];

/// Session id for an operator-chosen label
pub fn session_id_from_label(label: &str) -> SessionId {
    Sha256::digest(label.as_bytes()).into()
}

/// Elliptic curve a configuration lives on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    #[default]
    Secp256k1,
}

/// Field element a party is evaluated at. Never zero.
pub fn party_scalar(id: PartyId) -> Scalar {
    Scalar::from(id as u64 + 1)
}

/// Hash arbitrary bytes to a scalar (SHA-256, reduced mod n)
pub fn hash_to_scalar(bytes: &[u8]) -> Scalar {
    let digest = Sha256::digest(bytes);
    <Scalar as Reduce<U256>>::reduce_bytes(&digest)
}

/// Reduce a 32-byte digest to a scalar
pub fn reduce_to_scalar(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(bytes))
}

/// Affine x-coordinate of a point reduced mod n, `None` for the identity
pub fn x_coordinate(point: &ProjectivePoint) -> Option<Scalar> {
    let encoded = point.to_affine().to_encoded_point(false);
    encoded
        .x()
        .map(|x| <Scalar as Reduce<U256>>::reduce_bytes(x))
}

/// Decode a canonical big-endian scalar
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != 32 {
        return Err(Error::Serialization(format!(
            "Invalid scalar length: {}",
            bytes.len()
        )));
    }
    Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(bytes)))
        .ok_or_else(|| Error::Serialization("Non-canonical scalar".into()))
}

/// Encode a point in compressed SEC1 form (identity encodes as a single zero byte)
pub fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a SEC1 point
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        EncodedPoint::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
    let affine: AffinePoint = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::Serialization("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Fixed-length random identifier
///
/// Used as pairwise PRG seed, PRG nonce and chain key.
#[derive(Clone, Copy, Default, Zeroize, Serialize, Deserialize)]
pub struct Rid([u8; RID_BYTES]);

impl Rid {
    /// Sample a fresh identifier
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; RID_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a received identifier, rejecting wrong lengths and all-zero values
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; RID_BYTES] = bytes.try_into().map_err(|_| {
            Error::Serialization(format!(
                "expected {} bytes, found {}",
                RID_BYTES,
                bytes.len()
            ))
        })?;
        if array.iter().all(|b| *b == 0) {
            return Err(Error::Serialization("identifier is zero".into()));
        }
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; RID_BYTES] {
        &self.0
    }

    /// XOR another identifier into this one
    pub fn xor(&mut self, other: &Rid) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }
}

impl From<[u8; RID_BYTES]> for Rid {
    fn from(bytes: [u8; RID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl ConstantTimeEq for Rid {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for Rid {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl Eq for Rid {}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rid([redacted])")
    }
}

/// ECDSA signature with the full nonce point
///
/// `s` is always in low form; when it had to be negated the nonce point is
/// negated with it, so `R` stays consistent with `s` for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "point_serde")]
    big_r: ProjectivePoint,
    #[serde(with = "scalar_serde")]
    r: Scalar,
    #[serde(with = "scalar_serde")]
    s: Scalar,
}

impl Signature {
    /// Create a signature from the nonce point and `s`
    pub fn new(big_r: ProjectivePoint, s: Scalar) -> Result<Self> {
        let r = x_coordinate(&big_r)
            .ok_or_else(|| Error::Crypto("Nonce point is the identity".into()))?;
        if bool::from(s.is_high()) {
            return Ok(Self {
                big_r: -big_r,
                r,
                s: -s,
            });
        }
        Ok(Self { big_r, r, s })
    }

    /// Nonce point R
    pub fn big_r(&self) -> &ProjectivePoint {
        &self.big_r
    }

    /// r = R.x mod n
    pub fn r(&self) -> &Scalar {
        &self.r
    }

    pub fn s(&self) -> &Scalar {
        &self.s
    }

    /// Recovery ID (0 or 1), from the parity of R.y
    pub fn recovery_id(&self) -> u8 {
        let encoded = self.big_r.to_affine().to_encoded_point(true);
        if encoded.as_bytes()[0] == 0x03 {
            1
        } else {
            0
        }
    }

    /// Verify against a public key and the raw message (hashed with SHA-256)
    pub fn verify(&self, public_key: &ProjectivePoint, message: &[u8]) -> bool {
        if bool::from(self.r.is_zero()) || bool::from(self.s.is_zero()) {
            return false;
        }
        let s_inv = match Option::<Scalar>::from(self.s.invert()) {
            Some(s_inv) => s_inv,
            None => return false,
        };
        let m = hash_to_scalar(message);
        let candidate = ProjectivePoint::GENERATOR * (m * s_inv) + *public_key * (self.r * s_inv);
        match x_coordinate(&candidate) {
            Some(x) => x == self.r,
            None => false,
        }
    }

    /// Convert to a `k256` ECDSA signature
    pub fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        ecdsa::Signature::from_scalars(self.r.to_bytes(), self.s.to_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    /// Convert to DER format
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_ecdsa()?.to_der().as_bytes().to_vec())
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r.to_bytes());
        bytes[32..].copy_from_slice(&self.s.to_bytes());
        bytes
    }
}

pub(crate) mod scalar_serde {
    use k256::Scalar;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(scalar.to_bytes().as_slice())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        super::scalar_from_bytes(&bytes).map_err(D::Error::custom)
    }
}

pub(crate) mod point_serde {
    use k256::ProjectivePoint;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(point: &ProjectivePoint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&super::point_to_bytes(point))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ProjectivePoint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        super::point_from_bytes(&bytes).map_err(D::Error::custom)
    }
}

pub(crate) mod point_vec_serde {
    use k256::ProjectivePoint;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(points: &[ProjectivePoint], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Vec<Vec<u8>> = points.iter().map(super::point_to_bytes).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<ProjectivePoint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Vec<Vec<u8>> = Vec::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|bytes| super::point_from_bytes(bytes).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elliptic_curve::Field;
    use k256::ecdsa::signature::Verifier;
    use rand::rngs::OsRng;

    #[test]
    fn test_party_scalar_is_never_zero() {
        assert_eq!(party_scalar(0), Scalar::ONE);
        assert_eq!(party_scalar(4), Scalar::from(5u64));
    }

    #[test]
    fn test_scalar_encoding_rejects_bad_input() {
        let x = Scalar::random(&mut OsRng);
        assert_eq!(scalar_from_bytes(&x.to_bytes()).unwrap(), x);
        assert!(scalar_from_bytes(&[1u8; 31]).is_err());
        // values above the group order are not canonical
        assert!(scalar_from_bytes(&[0xff; 32]).is_err());
    }

    #[test]
    fn test_point_encoding() {
        let p = ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
        let bytes = point_to_bytes(&p);
        assert_eq!(bytes.len(), 33);
        assert_eq!(point_from_bytes(&bytes).unwrap(), p);
        assert_eq!(
            point_from_bytes(&point_to_bytes(&ProjectivePoint::IDENTITY)).unwrap(),
            ProjectivePoint::IDENTITY
        );
        assert!(point_from_bytes(&[2u8; 12]).is_err());
    }

    #[test]
    fn test_session_ids_differ_per_label() {
        assert_eq!(session_id_from_label("run-1"), session_id_from_label("run-1"));
        assert_ne!(session_id_from_label("run-1"), session_id_from_label("run-2"));
    }

    #[test]
    fn test_rid_validation() {
        assert!(Rid::from_slice(&[7u8; 32]).is_ok());
        assert!(Rid::from_slice(&[7u8; 31]).is_err());
        assert!(Rid::from_slice(&[0u8; 32]).is_err());

        let mut a = Rid::random(&mut OsRng);
        let b = Rid::random(&mut OsRng);
        let original = a;
        a.xor(&b);
        assert_ne!(a, original);
        a.xor(&b);
        assert_eq!(a, original);
    }

    #[test]
    fn test_signature_matches_k256_verifier() {
        let x = Scalar::random(&mut OsRng);
        let k = Scalar::random(&mut OsRng);
        let public_key = ProjectivePoint::GENERATOR * x;
        let big_r = ProjectivePoint::GENERATOR * k;
        let r = x_coordinate(&big_r).unwrap();
        let message = b"hello";
        let s = k.invert().unwrap() * (hash_to_scalar(message) + r * x);

        let signature = Signature::new(big_r, s).unwrap();
        assert!(!bool::from(signature.s().is_high()));
        assert!(signature.verify(&public_key, message));
        assert!(!signature.verify(&public_key, b"other"));

        let verifying_key = ecdsa::VerifyingKey::from_affine(public_key.to_affine()).unwrap();
        assert!(verifying_key
            .verify(message, &signature.to_ecdsa().unwrap())
            .is_ok());
        assert!(!signature.to_der().unwrap().is_empty());
    }
}
