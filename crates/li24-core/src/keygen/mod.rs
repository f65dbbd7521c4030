//! Distributed Key Generation (DKG) module
//!
//! Two rounds of Feldman VSS. Every party deals a random degree-`t`
//! polynomial, sends each peer its evaluation together with half of their
//! pairwise PRG seed, and broadcasts the commitment plus a chain key
//! contribution. Round 2 verifies what arrived and assembles the
//! [`ThresholdConfig`].

mod dkg;
mod key_refresh;
mod messages;

pub use dkg::{Round1, Round2};
pub use key_refresh::{run_key_refresh, start_refresh};
pub use messages::*;

use crate::mpc::{run_session, Relay};
use crate::round::{Info, Message, Outbox, Round, RoundNumber, Transition};
use crate::{Error, PartyId, Result, Session, SessionId, ThresholdConfig};
use tracing::{info, instrument};

/// Keygen / refresh state machine
pub enum KeygenRound {
    Round1(Round1),
    Round2(Round2),
}

impl Round for KeygenRound {
    type Content = KeygenMessage;
    type Output = ThresholdConfig;

    const FINAL_ROUND: RoundNumber = 2;

    fn number(&self) -> RoundNumber {
        match self {
            KeygenRound::Round1(_) => 1,
            KeygenRound::Round2(_) => 2,
        }
    }

    fn expects_broadcast(&self) -> bool {
        matches!(self, KeygenRound::Round2(_))
    }

    fn expects_direct(&self) -> bool {
        matches!(self, KeygenRound::Round2(_))
    }

    fn verify_message(&self, _info: &Info, msg: &Message<KeygenMessage>) -> Result<()> {
        match self {
            KeygenRound::Round2(round) => round.verify_message(msg),
            KeygenRound::Round1(_) => Err(Error::invalid_message(msg.from, "no input in round 1")),
        }
    }

    fn store_message(&mut self, _info: &Info, msg: Message<KeygenMessage>) -> Result<()> {
        match self {
            KeygenRound::Round2(round) => round.store_message(msg),
            KeygenRound::Round1(_) => Err(Error::invalid_message(msg.from, "no input in round 1")),
        }
    }

    fn store_broadcast_message(&mut self, info: &Info, msg: Message<KeygenMessage>) -> Result<()> {
        match self {
            KeygenRound::Round2(round) => round.store_broadcast_message(info, msg),
            KeygenRound::Round1(_) => Err(Error::invalid_message(msg.from, "no input in round 1")),
        }
    }

    fn finalize(self, info: &Info, outbox: &mut Outbox<KeygenMessage>) -> Result<Transition<Self>> {
        match self {
            KeygenRound::Round1(round) => round
                .finalize(info, outbox)
                .map(|next| Transition::Next(KeygenRound::Round2(next))),
            KeygenRound::Round2(round) => round.finalize(info).map(Transition::Output),
        }
    }
}

/// Start a fresh keygen session for `party_ids` with threshold `t`
///
/// Any `t + 1` parties can sign with the resulting configs.
pub fn start(party_ids: &[PartyId], self_id: PartyId, threshold: usize) -> Result<Session<KeygenRound>> {
    let info = Info::new(party_ids, self_id, threshold)?;
    Ok(Session::new(info, KeygenRound::Round1(Round1 { previous: None })))
}

/// Run keygen over a relay
///
/// Every party of the run must pass the same `session_id`, and no other
/// run over the same relay may reuse it.
#[instrument(skip(session_id, relay))]
pub async fn run_keygen<R: Relay + ?Sized>(
    party_ids: &[PartyId],
    self_id: PartyId,
    threshold: usize,
    session_id: &SessionId,
    relay: &R,
) -> Result<ThresholdConfig> {
    info!(
        party_id = self_id,
        n_parties = party_ids.len(),
        threshold,
        session = %hex::encode(session_id),
        "Starting keygen"
    );
    let session = start(party_ids, self_id, threshold)?;
    let tag = format!("keygen/{}", hex::encode(session_id));
    run_session(session, relay, &tag).await
}
