//! In-memory relay implementation for testing

use super::{async_trait, Envelope, Inbox, Relay};
use crate::{Error, PartyId, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// In-memory message relay connecting parties of one process
pub struct MemoryRelay {
    party_id: PartyId,
    /// Inbound channel of every party on the network
    peers: Arc<DashMap<PartyId, mpsc::UnboundedSender<Envelope>>>,
    inbox: Inbox,
}

impl MemoryRelay {
    /// Create one connected relay per party id
    pub fn network(party_ids: &[PartyId]) -> Vec<MemoryRelay> {
        let peers = Arc::new(DashMap::new());
        party_ids
            .iter()
            .map(|id| {
                let (tx, rx) = mpsc::unbounded_channel();
                peers.insert(*id, tx);
                MemoryRelay {
                    party_id: *id,
                    peers: peers.clone(),
                    inbox: Inbox::new(rx),
                }
            })
            .collect()
    }

    fn deliver(&self, to: PartyId, envelope: Envelope) -> Result<()> {
        let tx = self
            .peers
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Relay(format!("Unknown party {}", to)))?;
        tx.send(envelope)
            .map_err(|_| Error::Relay(format!("Party {} is gone", to)))
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn party_id(&self) -> PartyId {
        self.party_id
    }

    async fn send(&self, to: PartyId, envelope: Envelope) -> Result<()> {
        self.deliver(to, envelope)
    }

    async fn recv(&self, session: &str) -> Result<Envelope> {
        self.inbox.recv(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::session_id_from_label;
    use crate::{keygen, sign, Error, SessionId, ThresholdConfig};
    use futures_util::future::join_all;
    use std::time::Duration;

    fn envelope(session: &str, from: PartyId, to: Option<PartyId>, payload: &[u8]) -> Envelope {
        Envelope {
            session: session.into(),
            from,
            to,
            payload: payload.to_vec(),
        }
    }

    /// Relay whose envelopes to one party arrive late
    struct SlowLink {
        inner: MemoryRelay,
        slow_to: PartyId,
        delay: Duration,
    }

    #[async_trait]
    impl Relay for SlowLink {
        fn party_id(&self) -> PartyId {
            self.inner.party_id
        }

        async fn send(&self, to: PartyId, envelope: Envelope) -> Result<()> {
            if to != self.slow_to {
                return self.inner.send(to, envelope).await;
            }
            let tx = self
                .inner
                .peers
                .get(&to)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::Relay(format!("Unknown party {}", to)))?;
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(envelope);
            });
            Ok(())
        }

        async fn recv(&self, session: &str) -> Result<Envelope> {
            self.inner.recv(session).await
        }
    }

    /// Party 2's envelopes to party 0 are delayed, so party 1 starts the
    /// next run while party 0 is still in the previous one.
    fn slow_network() -> Vec<Box<dyn Relay>> {
        let mut relays = MemoryRelay::network(&[0, 1, 2]);
        let slow = relays.pop().unwrap();
        let mut out: Vec<Box<dyn Relay>> = relays
            .into_iter()
            .map(|r| Box::new(r) as Box<dyn Relay>)
            .collect();
        out.push(Box::new(SlowLink {
            inner: slow,
            slow_to: 0,
            delay: Duration::from_millis(300),
        }));
        out
    }

    #[tokio::test]
    async fn test_broadcast_and_direct() {
        let relays = MemoryRelay::network(&[0, 1, 2]);

        relays[0].send(1, envelope("s", 0, None, b"all")).await.unwrap();
        relays[0].send(2, envelope("s", 0, Some(2), b"two")).await.unwrap();

        assert_eq!(relays[1].recv("s").await.unwrap().payload, b"all");
        assert_eq!(relays[2].recv("s").await.unwrap().payload, b"two");
        assert!(relays[0].send(9, envelope("s", 0, Some(9), b"")).await.is_err());
    }

    #[tokio::test]
    async fn test_other_sessions_are_parked() {
        let relays = MemoryRelay::network(&[0, 1]);
        relays[0].send(1, envelope("later", 0, Some(1), b"b")).await.unwrap();
        relays[0].send(1, envelope("now", 0, Some(1), b"a")).await.unwrap();

        assert_eq!(relays[1].recv("now").await.unwrap().payload, b"a");
        assert_eq!(relays[1].inbox.parked_sessions(), 1);
        assert_eq!(relays[1].recv("later").await.unwrap().payload, b"b");
        assert_eq!(relays[1].inbox.parked_sessions(), 0);
    }

    async fn keygen_all(relays: &[MemoryRelay], ids: &[PartyId], t: usize) -> Vec<ThresholdConfig> {
        let session_id = session_id_from_label("lifecycle keygen");
        join_all(relays.iter().map(|r| keygen::run_keygen(ids, r.party_id(), t, &session_id, r)))
            .await
            .into_iter()
            .collect::<crate::Result<_>>()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_lifecycle_over_relay() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let ids = [0, 1, 2, 3];
        let relays = MemoryRelay::network(&ids);
        let configs = keygen_all(&relays, &ids, 2).await;
        let pk = configs[0].public_point();

        let signers = [0, 2, 3];
        let sign_id = session_id_from_label("lifecycle sign 1");
        let signed = join_all(signers.iter().map(|id| {
            sign::run_sign(&configs[*id], &signers, b"over the relay", &sign_id, &relays[*id])
        }))
        .await;
        for output in &signed {
            assert!(output.as_ref().unwrap().signature.verify(&pk, b"over the relay"));
        }

        let refresh_id = session_id_from_label("lifecycle refresh");
        let refreshed = join_all(
            relays
                .iter()
                .map(|r| keygen::run_key_refresh(&configs[r.party_id()], &refresh_id, r)),
        )
        .await
        .into_iter()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
        assert!(refreshed.iter().all(|c| c.public_point() == pk));
        // party 1 sat out the signing run and was sent none of its broadcasts
        assert_eq!(relays[1].inbox.parked_sessions(), 0);

        let sign_id = session_id_from_label("lifecycle sign 2");
        let signed = join_all(ids.iter().map(|id| {
            sign::run_sign(&refreshed[*id], &ids, b"after refresh", &sign_id, &relays[*id])
        }))
        .await;
        for output in signed {
            assert!(output.unwrap().signature.verify(&pk, b"after refresh"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_keygen_with_slow_link() {
        let relays = slow_network();
        let ids = [0, 1, 2];
        let first: SessionId = session_id_from_label("keygen 1");
        let second: SessionId = session_id_from_label("keygen 2");

        let runs = join_all(relays.iter().map(|relay| async move {
            let a = keygen::run_keygen(&ids, relay.party_id(), 1, &first, relay.as_ref()).await?;
            let b = keygen::run_keygen(&ids, relay.party_id(), 1, &second, relay.as_ref()).await?;
            Ok::<_, Error>((a, b))
        }));
        let results = tokio::time::timeout(Duration::from_secs(10), runs)
            .await
            .expect("both keygen runs complete");

        let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        let (first_pk, second_pk) = (results[0].0.public_point(), results[0].1.public_point());
        assert_ne!(first_pk, second_pk);
        for (a, b) in &results {
            assert_eq!(a.public_point(), first_pk);
            assert_eq!(b.public_point(), second_pk);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_message_signed_twice_with_slow_link() {
        let relays = slow_network();
        let ids = [0, 1, 2];
        let keygen_id = session_id_from_label("keygen");
        let configs = join_all(
            relays
                .iter()
                .map(|r| keygen::run_keygen(&ids, r.party_id(), 2, &keygen_id, r.as_ref())),
        )
        .await
        .into_iter()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
        let pk = configs[0].public_point();

        let first = session_id_from_label("sign 1");
        let second = session_id_from_label("sign 2");
        let runs = join_all(relays.iter().zip(&configs).map(|(relay, config)| async move {
            let a = sign::run_sign(config, &ids, b"twice", &first, relay.as_ref()).await?;
            let b = sign::run_sign(&a.config, &ids, b"twice", &second, relay.as_ref()).await?;
            Ok::<_, Error>((a.signature, b.signature))
        }));
        let results = tokio::time::timeout(Duration::from_secs(10), runs)
            .await
            .expect("both signing runs complete");

        for result in results {
            let (a, b) = result.unwrap();
            assert!(a.verify(&pk, b"twice"));
            assert!(b.verify(&pk, b"twice"));
            assert_ne!(a.r(), b.r());
        }
    }

    #[tokio::test]
    async fn test_garbage_payload_aborts() {
        let relays = MemoryRelay::network(&[0, 1]);
        let session_id = [3u8; 32];
        let tag = format!("keygen/{}", hex::encode(session_id));
        relays[1].send(0, envelope(&tag, 1, Some(0), b"not json")).await.unwrap();
        let result = keygen::run_keygen(&[0, 1], 0, 1, &session_id, &relays[0]).await;
        assert!(matches!(result, Err(Error::MessageValidation { from: 1, .. })));
    }
}
