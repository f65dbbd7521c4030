//! Pairwise pseudorandom chains
//!
//! Every pair of parties shares a seed from keygen. Both ends run the same
//! hash chain over it, so each can derive the other's masking pads without
//! talking. A chain only moves forward; after a successful signing session
//! the last nonce replaces the stored seed.

use crate::types::{reduce_to_scalar, Rid};
use crate::{Error, PartyId, Result};
use k256::Scalar;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hash chain keyed by one pairwise seed
#[derive(Clone)]
pub struct PrgChain {
    hasher: Sha256,
    nonce: Rid,
}

impl PrgChain {
    pub fn new(seed: &Rid) -> Self {
        Self {
            hasher: Sha256::new(),
            nonce: *seed,
        }
    }

    /// Absorb the current nonce into the running hash, emit the digest as
    /// the new nonce and map it to a scalar.
    pub fn next_scalar(&mut self) -> Scalar {
        self.hasher.update(self.nonce.as_bytes());
        let digest: [u8; 32] = self.hasher.clone().finalize().into();
        self.nonce = Rid::from(digest);
        reduce_to_scalar(&digest)
    }

    /// Last emitted nonce (the seed before the first tick)
    pub fn nonce(&self) -> &Rid {
        &self.nonce
    }
}

/// The chains a party holds with each of its co-signers
#[derive(Clone)]
pub struct Prg {
    chains: BTreeMap<PartyId, PrgChain>,
}

impl Prg {
    /// Open one chain per peer from the stored seeds
    pub fn new(
        seeds: &BTreeMap<PartyId, Rid>,
        peers: impl IntoIterator<Item = PartyId>,
    ) -> Result<Self> {
        let chains = peers
            .into_iter()
            .map(|peer| {
                seeds
                    .get(&peer)
                    .map(|seed| (peer, PrgChain::new(seed)))
                    .ok_or_else(|| Error::Precondition(format!("No PRG seed for party {}", peer)))
            })
            .collect::<Result<_>>()?;
        Ok(Self { chains })
    }

    /// Next pad shared with `peer`
    pub fn next(&mut self, peer: PartyId) -> Result<Scalar> {
        self.chains
            .get_mut(&peer)
            .map(PrgChain::next_scalar)
            .ok_or_else(|| Error::Internal(format!("No PRG chain for party {}", peer)))
    }

    /// Write every chain's last nonce back as the seed for future sessions
    pub fn ratchet(&self, seeds: &mut BTreeMap<PartyId, Rid>) {
        for (peer, chain) in &self.chains {
            seeds.insert(*peer, *chain.nonce());
        }
    }
}
