//! # Li24 Core
//!
//! Threshold ECDSA over secp256k1 where any `t + 1` of `n` parties jointly
//! sign under a single public key without ever reconstructing it.
//!
//! This crate provides:
//! - Distributed Key Generation and Key Refresh (Feldman VSS, 2 rounds)
//! - Distributed Signature Generation (3 rounds, pairwise PRG masking)
//! - A round engine driving both protocols from inbound messages
//! - Persistence and BIP32 derivation of [`ThresholdConfig`]
//!
//! ## Protocol Overview
//!
//! Signing needs no homomorphic encryption: every pair of signers shares a
//! seed established at keygen time, and the hash chains keyed by those seeds
//! mask each party's nonce, blinding and key shares so that the masks cancel
//! over the signer set. Each party reveals its masked values to roughly half
//! of the other signers, which is enough to compute additive shares of
//! `k·φ` and `x·φ` in a single exchange.
//!
//! ## Example
//!
//! ```rust,ignore
//! use li24_core::{keygen, sign, mpc::MemoryRelay};
//!
//! let relays = MemoryRelay::network(&[0, 1, 2]);
//! let config = keygen::run_keygen(&[0, 1, 2], 0, 2, &[1; 32], &relays[0]).await?;
//! let output = sign::run_sign(&config, &[0, 1, 2], b"hello", &[2; 32], &relays[0]).await?;
//! ```

pub mod address;
pub mod config;
pub mod derive;
pub mod error;
pub mod keygen;
pub mod math;
pub mod mpc;
pub mod prg;
pub mod round;
pub mod sign;
pub mod types;

pub use config::ThresholdConfig;
pub use error::{Error, Result};
pub use round::{Info, Message, Session};
pub use sign::SignOutput;
pub use types::{Curve, PartyId, Rid, SessionId, Signature};

/// Default threshold for a 3-party setup
pub const DEFAULT_THRESHOLD: usize = 2;
