//! Keygen message types

use crate::math::Commitment;
use crate::round::{Content, RoundNumber};
use crate::types::scalar_serde;
use k256::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Round 1 broadcast: Feldman commitment and chain key contribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenBroadcast {
    pub commitment: Commitment,
    pub chain_key: Vec<u8>,
}

/// Round 1 direct message: the recipient's evaluation of the sender's
/// polynomial and the sender's half of their pairwise seed
#[derive(Clone, Serialize, Deserialize)]
pub struct KeygenShare {
    #[serde(with = "scalar_serde")]
    pub share: Scalar,
    pub seed: Vec<u8>,
}

impl fmt::Debug for KeygenShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeygenShare")
            .field("share", &"[redacted]")
            .field("seed_len", &self.seed.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeygenMessage {
    Commitment(KeygenBroadcast),
    Share(KeygenShare),
}

impl Content for KeygenMessage {
    fn round(&self) -> RoundNumber {
        // both are produced by round 1 and consumed by round 2
        2
    }
}
