//! MPC coordination utilities
//!
//! A [`Relay`] moves [`Envelope`]s between parties; [`run_session`] drives
//! a round-engine [`Session`] over one until it finishes or aborts.

use crate::round::{Message, Round};
use crate::{Error, PartyId, Result, Session};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub use ::async_trait::async_trait;

/// Serialized protocol message with routing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Tag of the protocol run the message belongs to
    pub session: String,
    pub from: PartyId,
    /// `None` for a broadcast
    pub to: Option<PartyId>,
    /// JSON-encoded message content
    pub payload: Vec<u8>,
}

/// Message relay trait for MPC communication
#[async_trait]
pub trait Relay: Send + Sync {
    /// Id of the party this relay belongs to
    fn party_id(&self) -> PartyId;

    /// Deliver `envelope` to party `to`
    ///
    /// Broadcasts arrive here once per recipient, with `envelope.to` left
    /// as `None`.
    async fn send(&self, to: PartyId, envelope: Envelope) -> Result<()>;

    /// Next envelope tagged `session`; envelopes of other runs are kept
    /// until asked for
    async fn recv(&self, session: &str) -> Result<Envelope>;
}

/// Inbound queue that parks envelopes by session tag
///
/// Lets a party that finishes one protocol late still pick up messages
/// its faster peers already sent for the next one.
pub struct Inbox {
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    parked: DashMap<String, VecDeque<Envelope>>,
}

impl Inbox {
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            rx: Mutex::new(rx),
            parked: DashMap::new(),
        }
    }

    fn unpark(&self, session: &str) -> Option<Envelope> {
        let envelope = self
            .parked
            .get_mut(session)
            .and_then(|mut queue| queue.pop_front());
        self.parked.remove_if(session, |_, queue| queue.is_empty());
        envelope
    }

    /// Number of sessions with parked envelopes
    pub fn parked_sessions(&self) -> usize {
        self.parked.len()
    }

    pub async fn recv(&self, session: &str) -> Result<Envelope> {
        let mut rx = self.rx.lock().await;
        loop {
            if let Some(envelope) = self.unpark(session) {
                return Ok(envelope);
            }
            let envelope = rx
                .recv()
                .await
                .ok_or_else(|| Error::Relay("Inbound channel closed".into()))?;
            if envelope.session == session {
                return Ok(envelope);
            }
            debug!(session = %envelope.session, from = envelope.from, "Parking envelope");
            self.parked
                .entry(envelope.session.clone())
                .or_default()
                .push_back(envelope);
        }
    }
}

/// Drive `session` to completion over `relay`
///
/// Every envelope is tagged with `tag`, which all parties of the run must
/// agree on and no other run may share. Broadcasts go to the session's
/// parties only. Dropping the future cancels the run; nothing is persisted
/// until the output is returned.
pub async fn run_session<R, T>(mut session: Session<R>, relay: &T, tag: &str) -> Result<R::Output>
where
    R: Round,
    R::Content: Serialize + DeserializeOwned,
    T: Relay + ?Sized,
{
    loop {
        for msg in session.take_outgoing() {
            let recipients: Vec<PartyId> = match msg.to {
                Some(to) => vec![to],
                None => session.info().other_party_ids().collect(),
            };
            let envelope = Envelope {
                session: tag.to_string(),
                from: msg.from,
                to: msg.to,
                payload: serde_json::to_vec(&msg.content)?,
            };
            for to in recipients {
                relay.send(to, envelope.clone()).await?;
            }
        }
        if session.is_terminal() {
            return session.into_result();
        }

        let envelope = relay.recv(tag).await?;
        let content: R::Content = match serde_json::from_slice(&envelope.payload) {
            Ok(content) => content,
            Err(e) => {
                warn!(from = envelope.from, error = %e, "Undecodable payload");
                return Err(Error::invalid_message(envelope.from, e.to_string()));
            }
        };
        // an abort is returned through into_result on the next pass
        let _ = session.handle(Message {
            from: envelope.from,
            to: envelope.to,
            content,
        });
    }
}

/// In-memory relay for testing
pub mod memory;

pub use memory::MemoryRelay;
