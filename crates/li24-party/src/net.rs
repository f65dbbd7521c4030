//! Peer-to-peer TCP transport
//!
//! Every pair of parties shares one connection: the higher id dials, the
//! lower id accepts. The dialer opens with a handshake frame carrying its
//! party id. After that each frame is a length-prefixed JSON [`Envelope`].

use async_trait::async_trait;
use li24_core::mpc::{Envelope, Inbox, Relay};
use li24_core::{Error, PartyId, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default bound on dialing a peer
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest accepted frame
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Delay before dial attempt `attempt + 1`: 1s, 2s, 4s, … capped at 32s
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(5))
}

/// Dial `addr`, retrying with exponential backoff until `timeout` elapses
pub async fn dial_with_backoff(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout(format!("dialing {}: {}", addr, e)));
                }
                let delay = backoff_delay(attempt).min(deadline - now);
                debug!(%addr, attempt, ?delay, error = %e, "Dial failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Relay(format!("Frame of {} bytes is too large", payload.len())))?;
    writer.write_u32(len).await.map_err(relay_error)?;
    writer.write_all(payload).await.map_err(relay_error)?;
    writer.flush().await.map_err(relay_error)
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await.map_err(relay_error)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Relay(format!("Frame of {} bytes is too large", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(relay_error)?;
    Ok(payload)
}

fn relay_error(e: std::io::Error) -> Error {
    Error::Relay(e.to_string())
}

/// TCP mesh between a fixed set of parties
pub struct TcpNetwork {
    party_id: PartyId,
    writers: HashMap<PartyId, Mutex<OwnedWriteHalf>>,
    inbox: Inbox,
}

impl TcpNetwork {
    /// Listen on `listen` and connect to every peer
    pub async fn connect(
        party_id: PartyId,
        listen: SocketAddr,
        peers: &BTreeMap<PartyId, SocketAddr>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen).await.map_err(relay_error)?;
        Self::establish(party_id, listener, peers, dial_timeout).await
    }

    /// Connect to every peer using an already bound listener
    #[instrument(skip(listener, peers))]
    pub async fn establish(
        party_id: PartyId,
        listener: TcpListener,
        peers: &BTreeMap<PartyId, SocketAddr>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();

        for (peer, addr) in peers.range(..party_id) {
            let mut stream = dial_with_backoff(*addr, dial_timeout).await?;
            stream
                .write_u64(party_id as u64)
                .await
                .map_err(relay_error)?;
            debug!(peer, %addr, "Dialed peer");
            let (reader, writer) = stream.into_split();
            spawn_reader(*peer, reader, tx.clone());
            writers.insert(*peer, Mutex::new(writer));
        }

        let expected = peers.range(party_id + 1..).count();
        let accept_all = async {
            let mut accepted = 0;
            while accepted < expected {
                let (mut stream, addr) = listener.accept().await.map_err(relay_error)?;
                let peer = stream.read_u64().await.map_err(relay_error)? as PartyId;
                if peer <= party_id || !peers.contains_key(&peer) || writers.contains_key(&peer) {
                    warn!(%addr, peer, "Rejecting unexpected connection");
                    continue;
                }
                debug!(peer, %addr, "Accepted peer");
                let (reader, writer) = stream.into_split();
                spawn_reader(peer, reader, tx.clone());
                writers.insert(peer, Mutex::new(writer));
                accepted += 1;
            }
            Ok::<_, Error>(())
        };
        tokio::time::timeout(dial_timeout, accept_all)
            .await
            .map_err(|_| Error::Timeout("peers to connect".into()))??;

        info!(party_id, peers = writers.len(), "Connected to all peers");
        Ok(Self {
            party_id,
            writers,
            inbox: Inbox::new(rx),
        })
    }

    async fn deliver(&self, to: PartyId, frame: &[u8]) -> Result<()> {
        let writer = self
            .writers
            .get(&to)
            .ok_or_else(|| Error::Relay(format!("Not connected to party {}", to)))?;
        write_frame(&mut *writer.lock().await, frame).await
    }
}

/// Forward frames from one peer into the inbox until the connection drops
fn spawn_reader(peer: PartyId, mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Envelope>) {
    tokio::spawn(async move {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(peer, error = %e, "Connection closed");
                    return;
                }
            };
            let envelope: Envelope = match serde_json::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(peer, error = %e, "Dropping undecodable frame");
                    continue;
                }
            };
            if envelope.from != peer {
                warn!(peer, claimed = envelope.from, "Dropping envelope with forged sender");
                continue;
            }
            if tx.send(envelope).is_err() {
                return;
            }
        }
    });
}

#[async_trait]
impl Relay for TcpNetwork {
    fn party_id(&self) -> PartyId {
        self.party_id
    }

    async fn send(&self, to: PartyId, envelope: Envelope) -> Result<()> {
        let frame = serde_json::to_vec(&envelope)?;
        self.deliver(to, &frame).await
    }

    async fn recv(&self, session: &str) -> Result<Envelope> {
        self.inbox.recv(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use li24_core::{keygen, sign};

    #[test]
    fn test_backoff_doubles_then_caps() {
        let delays: Vec<u64> = (0..8).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = dial_with_backoff(addr, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    async fn mesh(ids: &[PartyId]) -> Vec<TcpNetwork> {
        let mut listeners = Vec::new();
        let mut peers = BTreeMap::new();
        for id in ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.insert(*id, listener.local_addr().unwrap());
            listeners.push(listener);
        }
        let handles: Vec<_> = ids
            .iter()
            .zip(listeners)
            .map(|(id, listener)| {
                let mut others = peers.clone();
                others.remove(id);
                let id = *id;
                tokio::spawn(async move {
                    TcpNetwork::establish(id, listener, &others, Duration::from_secs(5)).await
                })
            })
            .collect();
        let mut networks = Vec::new();
        for handle in handles {
            networks.push(handle.await.unwrap().unwrap());
        }
        networks
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keygen_and_sign_over_tcp() {
        let ids = [0, 1, 2];
        let networks = mesh(&ids).await;

        let keygen_id = [1u8; 32];
        let (a, b, c) = tokio::join!(
            keygen::run_keygen(&ids, 0, 2, &keygen_id, &networks[0]),
            keygen::run_keygen(&ids, 1, 2, &keygen_id, &networks[1]),
            keygen::run_keygen(&ids, 2, 2, &keygen_id, &networks[2]),
        );
        let configs = [a.unwrap(), b.unwrap(), c.unwrap()];
        let pk = configs[0].public_point();

        let sign_id = [2u8; 32];
        let (a, b, c) = tokio::join!(
            sign::run_sign(&configs[0], &ids, b"tcp", &sign_id, &networks[0]),
            sign::run_sign(&configs[1], &ids, b"tcp", &sign_id, &networks[1]),
            sign::run_sign(&configs[2], &ids, b"tcp", &sign_id, &networks[2]),
        );
        for output in [a, b, c] {
            assert!(output.unwrap().signature.verify(&pk, b"tcp"));
        }
    }
}
