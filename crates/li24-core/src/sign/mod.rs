//! Distributed Signature Generation (DSG) module
//!
//! Three rounds: masked nonce and share fan-out, local cross terms, then
//! a broadcast of partial values that every signer combines into the
//! signature. No homomorphic encryption or OT is involved; the pairwise
//! PRG seeds from keygen do the masking.

mod dsg;
mod messages;

pub use dsg::{reveal_count, reveals_to, Round1, Round2, Round3};
pub use messages::*;

use crate::math::lagrange_coefficients;
use crate::mpc::{run_session, Relay};
use crate::prg::Prg;
use crate::round::{validate_threshold, Info, Message, Outbox, Round, RoundNumber, Transition};
use crate::{Error, PartyId, Result, Session, SessionId, Signature, ThresholdConfig};
use dsg::Context;
use k256::ProjectivePoint;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

/// Result of a signing session
///
/// `config` is the input config with the PRG seeds shared with the
/// co-signers ratcheted forward. It replaces the input config for later
/// sessions; the two must not both be used again.
#[derive(Debug, Clone)]
pub struct SignOutput {
    pub signature: Signature,
    pub config: ThresholdConfig,
}

/// Signing state machine
pub enum SignRound {
    Round1(Round1),
    Round2(Round2),
    Round3(Round3),
}

impl Round for SignRound {
    type Content = SignMessage;
    type Output = SignOutput;

    const FINAL_ROUND: RoundNumber = 3;

    fn number(&self) -> RoundNumber {
        match self {
            SignRound::Round1(_) => 1,
            SignRound::Round2(_) => 2,
            SignRound::Round3(_) => 3,
        }
    }

    fn expects_broadcast(&self) -> bool {
        !matches!(self, SignRound::Round1(_))
    }

    fn expects_direct(&self) -> bool {
        matches!(self, SignRound::Round2(_))
    }

    fn verify_message(&self, info: &Info, msg: &Message<SignMessage>) -> Result<()> {
        match self {
            SignRound::Round2(round) => round.verify_message(info, msg),
            _ => Err(Error::invalid_message(msg.from, "unexpected direct message")),
        }
    }

    fn store_message(&mut self, _info: &Info, msg: Message<SignMessage>) -> Result<()> {
        match self {
            SignRound::Round2(round) => round.store_message(msg),
            _ => Err(Error::invalid_message(msg.from, "unexpected direct message")),
        }
    }

    fn store_broadcast_message(&mut self, _info: &Info, msg: Message<SignMessage>) -> Result<()> {
        match self {
            SignRound::Round2(round) => round.store_broadcast_message(msg),
            SignRound::Round3(round) => round.store_broadcast_message(msg),
            SignRound::Round1(_) => Err(Error::invalid_message(msg.from, "no input in round 1")),
        }
    }

    fn finalize(self, info: &Info, outbox: &mut Outbox<SignMessage>) -> Result<Transition<Self>> {
        match self {
            SignRound::Round1(round) => round
                .finalize(info, outbox)
                .map(|next| Transition::Next(SignRound::Round2(next))),
            SignRound::Round2(round) => round
                .finalize(info, outbox)
                .map(|next| Transition::Next(SignRound::Round3(next))),
            SignRound::Round3(round) => round.finalize(info).map(Transition::Output),
        }
    }
}

/// Start signing `message` with the given signer set
///
/// Fails with [`Error::Precondition`] unless the threshold is at least 2,
/// the message is non-empty, and `signers` is a duplicate-free set of more
/// than `threshold` known parties that includes this one.
pub fn start(config: &ThresholdConfig, signers: &[PartyId], message: &[u8]) -> Result<Session<SignRound>> {
    if config.threshold < 2 || !validate_threshold(config.threshold, config.n()) {
        return Err(Error::Precondition(format!(
            "Threshold {} is invalid for signing with {} parties",
            config.threshold,
            config.n()
        )));
    }
    if message.is_empty() {
        return Err(Error::Precondition("Message is empty".into()));
    }
    let info = Info::new(signers, config.self_id, config.threshold)?;
    if !config.can_sign(info.party_ids()) {
        return Err(Error::Precondition(format!(
            "Signers {:?} are not a valid signing set",
            info.party_ids()
        )));
    }
    config.validate()?;

    // scale to additive shares of the key over this signer set
    let lambdas = lagrange_coefficients(info.party_ids());
    let scale = |id: &PartyId| -> Result<_> {
        lambdas
            .get(id)
            .copied()
            .ok_or_else(|| Error::Internal(format!("No Lagrange coefficient for party {}", id)))
    };
    let w = scale(&config.self_id)? * config.secret_share;
    let mut public_key = ProjectivePoint::IDENTITY;
    for id in info.party_ids() {
        let share = config
            .public_shares
            .get(id)
            .ok_or_else(|| Error::Internal(format!("No public share for party {}", id)))?;
        public_key += *share * scale(id)?;
    }

    let prg = Prg::new(&config.rid_seeds, info.other_party_ids())?;
    let ctx = Context {
        config: config.clone(),
        message: message.to_vec(),
        public_key,
        prg,
    };
    Ok(Session::new(info, SignRound::Round1(Round1 { ctx, w })))
}

/// Relay tag of one signing run
fn session_tag(signers: &[PartyId], message: &[u8], session_id: &SessionId) -> String {
    let mut sorted = signers.to_vec();
    sorted.sort_unstable();
    let ids: Vec<String> = sorted.iter().map(|id| id.to_string()).collect();
    let digest = Sha256::digest(message);
    format!(
        "sign/{}/{}/{}",
        ids.join("-"),
        hex::encode(&digest[..8]),
        hex::encode(session_id)
    )
}

/// Run signing over a relay
///
/// Every signer must pass the same `session_id`; signing the same message
/// again needs a new one.
#[instrument(skip_all, fields(party_id = config.self_id, signers = ?signers))]
pub async fn run_sign<R: Relay + ?Sized>(
    config: &ThresholdConfig,
    signers: &[PartyId],
    message: &[u8],
    session_id: &SessionId,
    relay: &R,
) -> Result<SignOutput> {
    info!(party_id = config.self_id, session = %hex::encode(session_id), "Starting signing");
    let session = start(config, signers, message)?;
    run_session(session, relay, &session_tag(signers, message, session_id)).await
}
