//! Persistent per-party key material

use crate::math::lagrange_coefficients;
use crate::round::validate_threshold;
use crate::types::{point_from_bytes, point_to_bytes, scalar_from_bytes};
use crate::{Curve, Error, PartyId, Result, Rid};
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

fn encoding() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// A party's share of a threshold key
///
/// Produced by keygen, replaced wholesale by refresh, signing (ratcheted
/// seeds) and derivation. The invariant tying it together: Lagrange
/// interpolation of `public_shares` at zero gives the group public key, and
/// `public_shares[self_id] = secret_share·G`.
#[derive(Clone)]
pub struct ThresholdConfig {
    pub curve: Curve,
    pub self_id: PartyId,
    pub threshold: usize,
    /// xᵢ, this party's share of the group secret
    pub secret_share: Scalar,
    /// Xⱼ = xⱼ·G for every party, self included
    pub public_shares: BTreeMap<PartyId, ProjectivePoint>,
    /// One pairwise PRG seed per other party
    pub rid_seeds: BTreeMap<PartyId, Rid>,
    /// Chain key for unhardened derivation
    pub chain_key: Rid,
}

/// Wire layout of a persisted config. The threshold leads so that a
/// corrupted header is caught before anything else is parsed.
#[derive(Serialize, Deserialize)]
struct ConfigRecord {
    threshold: u32,
    curve: Curve,
    self_id: u64,
    secret_share: [u8; 32],
    public_shares: Vec<(u64, Vec<u8>)>,
    rid_seeds: Vec<(u64, [u8; 32])>,
    chain_key: [u8; 32],
}

impl Drop for ConfigRecord {
    fn drop(&mut self) {
        self.secret_share.zeroize();
        for (_, seed) in self.rid_seeds.iter_mut() {
            seed.zeroize();
        }
        self.chain_key.zeroize();
    }
}

impl ThresholdConfig {
    /// Number of parties holding a share
    pub fn n(&self) -> usize {
        self.public_shares.len()
    }

    /// Sorted ids of every party holding a share
    pub fn party_ids(&self) -> Vec<PartyId> {
        self.public_shares.keys().copied().collect()
    }

    /// Group public key, interpolated from all verification shares
    pub fn public_point(&self) -> ProjectivePoint {
        let lambdas = lagrange_coefficients(&self.party_ids());
        self.public_shares
            .iter()
            .fold(ProjectivePoint::IDENTITY, |acc, (id, share)| {
                acc + *share * lambdas.get(id).copied().unwrap_or(Scalar::ZERO)
            })
    }

    /// Compressed SEC1 encoding of the group public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        point_to_bytes(&self.public_point())
    }

    /// Whether `signers` is a set this config can sign with
    pub fn can_sign(&self, signers: &[PartyId]) -> bool {
        let mut sorted = signers.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.len() == signers.len()
            && sorted.len() > self.threshold
            && sorted.binary_search(&self.self_id).is_ok()
            && sorted.iter().all(|id| self.public_shares.contains_key(id))
    }

    /// Check every structural invariant of the config
    pub fn validate(&self) -> Result<()> {
        if !validate_threshold(self.threshold, self.n()) {
            return Err(Error::Serialization(format!(
                "Threshold {} is invalid for {} parties",
                self.threshold,
                self.n()
            )));
        }
        let own = self.public_shares.get(&self.self_id).ok_or_else(|| {
            Error::Serialization(format!("Party {} has no public share", self.self_id))
        })?;
        if let Some((id, _)) = self
            .public_shares
            .iter()
            .find(|(_, point)| **point == ProjectivePoint::IDENTITY)
        {
            return Err(Error::Serialization(format!(
                "Public share of party {} is the identity",
                id
            )));
        }
        if bool::from(self.secret_share.is_zero()) {
            return Err(Error::Serialization("Secret share is zero".into()));
        }
        let others: Vec<PartyId> = self
            .public_shares
            .keys()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect();
        if !self.rid_seeds.keys().copied().eq(others.iter().copied()) {
            return Err(Error::Serialization(
                "PRG seeds do not match the other parties".into(),
            ));
        }
        if ProjectivePoint::GENERATOR * self.secret_share != *own {
            return Err(Error::ShareVerification { from: self.self_id });
        }
        Ok(())
    }

    /// Deterministic binary encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let threshold = u32::try_from(self.threshold)
            .map_err(|_| Error::Serialization("Threshold does not fit in 32 bits".into()))?;
        let record = ConfigRecord {
            threshold,
            curve: self.curve,
            self_id: self.self_id as u64,
            secret_share: self.secret_share.to_bytes().into(),
            public_shares: self
                .public_shares
                .iter()
                .map(|(id, point)| (*id as u64, point_to_bytes(point)))
                .collect(),
            rid_seeds: self
                .rid_seeds
                .iter()
                .map(|(id, seed)| (*id as u64, *seed.as_bytes()))
                .collect(),
            chain_key: *self.chain_key.as_bytes(),
        };
        Ok(bincode::serde::encode_to_vec(&record, encoding())?)
    }

    /// Decode and re-validate a config produced by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (record, read): (ConfigRecord, usize) =
            bincode::serde::decode_from_slice(bytes, encoding())?;
        if read != bytes.len() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }

        let public_shares = record
            .public_shares
            .iter()
            .map(|(id, bytes)| Ok((party_id(*id)?, point_from_bytes(bytes)?)))
            .collect::<Result<Vec<_>>>()?;
        let rid_seeds = record
            .rid_seeds
            .iter()
            .map(|(id, seed)| Ok((party_id(*id)?, Rid::from(*seed))))
            .collect::<Result<Vec<_>>>()?;
        if !strictly_ascending(public_shares.iter().map(|(id, _)| *id))
            || !strictly_ascending(rid_seeds.iter().map(|(id, _)| *id))
        {
            return Err(Error::Serialization(
                "Party ids are duplicated or out of order".into(),
            ));
        }

        let config = Self {
            curve: record.curve,
            self_id: party_id(record.self_id)?,
            threshold: record.threshold as usize,
            secret_share: scalar_from_bytes(&record.secret_share)?,
            public_shares: public_shares.into_iter().collect(),
            rid_seeds: rid_seeds.into_iter().collect(),
            chain_key: Rid::from(record.chain_key),
        };
        config.validate()?;
        Ok(config)
    }
}

fn party_id(id: u64) -> Result<PartyId> {
    PartyId::try_from(id).map_err(|_| Error::Serialization(format!("Party id {} out of range", id)))
}

fn strictly_ascending(ids: impl Iterator<Item = PartyId>) -> bool {
    let ids: Vec<PartyId> = ids.collect();
    ids.windows(2).all(|w| w[0] < w[1])
}

impl PartialEq for ThresholdConfig {
    fn eq(&self, other: &Self) -> bool {
        let secret_eq: bool = self.secret_share.ct_eq(&other.secret_share).into();
        secret_eq
            && self.curve == other.curve
            && self.self_id == other.self_id
            && self.threshold == other.threshold
            && self.public_shares == other.public_shares
            && self.rid_seeds == other.rid_seeds
            && self.chain_key == other.chain_key
    }
}

impl Eq for ThresholdConfig {}

impl fmt::Debug for ThresholdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdConfig")
            .field("curve", &self.curve)
            .field("self_id", &self.self_id)
            .field("threshold", &self.threshold)
            .field("parties", &self.party_ids())
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .field("secret_share", &"[redacted]")
            .finish_non_exhaustive()
    }
}

impl Drop for ThresholdConfig {
    fn drop(&mut self) {
        self.secret_share = Scalar::ZERO;
        for seed in self.rid_seeds.values_mut() {
            seed.zeroize();
        }
        self.chain_key.zeroize();
    }
}
