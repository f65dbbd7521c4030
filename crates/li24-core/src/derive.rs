//! Unhardened BIP32-style derivation of threshold configs
//!
//! Every party derives locally and deterministically; no interaction is
//! needed since only public data (group key, chain key) feeds the tweak.

use crate::types::{point_to_bytes, scalar_from_bytes};
use crate::{Error, Result, Rid, ThresholdConfig};
use derivation_path::{ChildIndex, DerivationPath};
use hmac::{Hmac, Mac};
use k256::{ProjectivePoint, Scalar};
use sha2::Sha512;

/// First hardened child index
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

impl ThresholdConfig {
    /// Shift the shared key by `adjust`
    ///
    /// The secret share and every public share move by `adjust` (resp.
    /// `adjust·G`); since Lagrange weights sum to one the group key moves
    /// by `adjust·G` as well. The chain key is replaced when given.
    pub fn derive(&self, adjust: &Scalar, new_chain_key: Option<Rid>) -> Result<ThresholdConfig> {
        let offset = ProjectivePoint::GENERATOR * adjust;
        let mut derived = self.clone();
        derived.secret_share += adjust;
        for point in derived.public_shares.values_mut() {
            *point += offset;
        }
        if let Some(chain_key) = new_chain_key {
            derived.chain_key = chain_key;
        }
        derived
            .validate()
            .map_err(|e| Error::Derivation(format!("Derived config is invalid: {}", e)))?;
        Ok(derived)
    }

    /// Unhardened child at `index`
    pub fn derive_bip32(&self, index: u32) -> Result<ThresholdConfig> {
        if index >= HARDENED_OFFSET {
            return Err(Error::Derivation(format!(
                "Hardened index {} needs the full private key",
                index
            )));
        }

        let mut mac = Hmac::<Sha512>::new_from_slice(self.chain_key.as_bytes())
            .map_err(|e| Error::Derivation(e.to_string()))?;
        mac.update(&point_to_bytes(&self.public_point()));
        mac.update(&index.to_be_bytes());
        let output = mac.finalize().into_bytes();
        let (left, right) = output.split_at(32);

        let tweak = scalar_from_bytes(left)
            .map_err(|_| Error::Derivation(format!("Index {} gives an invalid tweak", index)))?;
        let chain_key = Rid::from_slice(right).map_err(|e| Error::Derivation(e.to_string()))?;
        self.derive(&tweak, Some(chain_key))
    }

    /// Follow a path such as `m/44/60/0/0/0`; hardened components are rejected
    pub fn derive_path(&self, path: &str) -> Result<ThresholdConfig> {
        let path: DerivationPath = path
            .parse()
            .map_err(|e| Error::Derivation(format!("Invalid path: {:?}", e)))?;

        let mut current = self.clone();
        for child in path.path() {
            current = match child {
                ChildIndex::Normal(index) => current.derive_bip32(*index)?,
                ChildIndex::Hardened(_) => {
                    return Err(Error::Derivation(
                        "Hardened derivation is not supported for threshold keys".into(),
                    ))
                }
            };
        }
        Ok(current)
    }
}
