//! Signing message types

use crate::round::{Content, RoundNumber};
use crate::types::{point_serde, scalar_serde};
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Round 1 broadcast: Γᵢ = kᵢ·G for the masked nonce share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceCommitment {
    #[serde(with = "point_serde")]
    pub gamma: ProjectivePoint,
}

/// Round 1 direct message: the masked (k, φ, w) triple, or zeros when the
/// recipient is outside the sender's reveal set
#[derive(Clone, Serialize, Deserialize)]
pub struct MaskedShares {
    #[serde(with = "scalar_serde")]
    pub k: Scalar,
    #[serde(with = "scalar_serde")]
    pub phi: Scalar,
    #[serde(with = "scalar_serde")]
    pub w: Scalar,
}

impl MaskedShares {
    pub(crate) fn zero() -> Self {
        Self {
            k: Scalar::ZERO,
            phi: Scalar::ZERO,
            w: Scalar::ZERO,
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.k == Scalar::ZERO && self.phi == Scalar::ZERO && self.w == Scalar::ZERO
    }
}

impl fmt::Debug for MaskedShares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskedShares")
            .field("zero", &self.is_zero())
            .finish_non_exhaustive()
    }
}

/// Round 2 broadcast: additive shares of k·φ and of φ·(H(m) + r·x)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignature {
    #[serde(with = "scalar_serde")]
    pub v: Scalar,
    #[serde(with = "scalar_serde")]
    pub delta: Scalar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignMessage {
    Nonce(NonceCommitment),
    Masked(MaskedShares),
    Partial(PartialSignature),
}

impl Content for SignMessage {
    fn round(&self) -> RoundNumber {
        match self {
            SignMessage::Nonce(_) | SignMessage::Masked(_) => 2,
            SignMessage::Partial(_) => 3,
        }
    }
}
