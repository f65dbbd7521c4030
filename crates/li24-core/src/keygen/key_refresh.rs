//! Key refresh protocol

use super::{KeygenRound, Round1};
use crate::mpc::{run_session, Relay};
use crate::round::Info;
use crate::{Result, Session, SessionId, ThresholdConfig};
use tracing::{info, instrument};

/// Start a refresh of `config` with the same party set and threshold
///
/// Every party deals a zero-constant polynomial; the output config keeps
/// the group key and chain key but has fresh shares and PRG seeds.
pub fn start_refresh(config: &ThresholdConfig) -> Result<Session<KeygenRound>> {
    config.validate()?;
    let info = Info::new(&config.party_ids(), config.self_id, config.threshold)?;
    Ok(Session::new(
        info,
        KeygenRound::Round1(Round1 {
            previous: Some(config.clone()),
        }),
    ))
}

/// Run the key refresh protocol over a relay
///
/// Limits the window in which a leaked share is useful: shares from before
/// and after a refresh do not combine.
#[instrument(skip_all, fields(party_id = config.self_id))]
pub async fn run_key_refresh<R: Relay + ?Sized>(
    config: &ThresholdConfig,
    session_id: &SessionId,
    relay: &R,
) -> Result<ThresholdConfig> {
    info!(party_id = config.self_id, session = %hex::encode(session_id), "Starting key refresh");
    let session = start_refresh(config)?;
    let tag = format!(
        "refresh/{}/{}",
        hex::encode(config.public_key_bytes()),
        hex::encode(session_id)
    );
    run_session(session, relay, &tag).await
}
