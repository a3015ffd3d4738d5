//! Transport adapter: one connection per peer, best-effort send, ordered
//! per-peer delivery. Grounded on the teacher's `network::NetworkLayer`
//! (connection map + length-prefixed TCP framing), generalized behind a
//! `Transport` trait so the consensus core never depends on sockets.
//!
//! Per spec §5: outbound send from the driver is non-blocking — a full
//! per-peer queue drops the frame rather than stalling the driver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tracing::{debug, info, warn};

use crate::codec::{self, Message};
use crate::error::TransportError;
use crate::types::NodeId;

/// Depth of each per-peer outbound queue. Heartbeats are idempotent and
/// AppendEntries are retried on the next cadence, so a bounded, dropping
/// queue is safe (spec §5).
const OUTBOUND_QUEUE_DEPTH: usize = 64;
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// What a consensus `Engine` needs from its network layer: best-effort
/// fire-and-forget send, and a single inbound stream of frames from all
/// peers (cross-peer interleaving is unspecified; per-peer order is
/// preserved, per spec §5's ordering guarantees).
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, msg: Message);
}

/// TCP transport: one outbound writer task per peer (owns the socket,
/// reconnects with capped exponential backoff), one inbound reader task
/// per accepted connection, all inbound frames funneled into a single
/// channel the `Engine` drains.
pub struct TcpTransport {
    node_id: NodeId,
    outbound: HashMap<NodeId, mpsc::Sender<Message>>,
}

impl TcpTransport {
    /// Bind the listener, spawn the accept loop, and spawn one outbound
    /// writer task per configured peer. Returns the transport plus the
    /// receiver of inbound `(peer_id_is_embedded_in_message)` frames.
    pub async fn bind(
        node_id: NodeId,
        listen_addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), TransportError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: listen_addr.to_string(),
                source,
            })?;
        info!(%listen_addr, "transport listening");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        {
            let inbound_tx = inbound_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted inbound connection");
                            let inbound_tx = inbound_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = read_loop(stream, inbound_tx).await {
                                    warn!(error = %e, "inbound connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            });
        }

        let mut outbound = HashMap::new();
        for (&peer_id, &addr) in &peers {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
            tokio::spawn(writer_task(peer_id, addr, rx));
            outbound.insert(peer_id, tx);
        }

        Ok((Self { node_id, outbound }, inbound_rx))
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: NodeId, msg: Message) {
        match self.outbound.get(&to) {
            Some(tx) => {
                if tx.try_send(msg).is_err() {
                    warn!(peer = to, "outbound queue full or closed, dropping frame");
                }
            }
            None => {
                warn!(peer = to, self_id = self.node_id, "send to unknown peer");
            }
        }
    }
}

/// Writer task owning one peer's outbound connection: reconnects with
/// capped exponential backoff and never blocks the driver (the driver
/// only ever touches the bounded `mpsc::Sender`, not the socket).
async fn writer_task(peer_id: NodeId, addr: SocketAddr, mut rx: mpsc::Receiver<Message>) {
    let mut backoff = INITIAL_RECONNECT_BACKOFF;

    'connect: loop {
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => {
                backoff = INITIAL_RECONNECT_BACKOFF;
                s
            }
            Err(e) => {
                warn!(peer = peer_id, %addr, error = %e, "connect failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                continue 'connect;
            }
        };
        let (_, mut write_half) = stream.into_split();

        while let Some(msg) = rx.recv().await {
            let bytes = match codec::encode(&msg) {
                Ok(b) => b,
                Err(e) => {
                    warn!(peer = peer_id, error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, &bytes).await {
                warn!(peer = peer_id, error = %e, "send failed, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                continue 'connect;
            }
        }
        // Sender dropped: node is shutting down.
        return;
    }
}

async fn write_frame(
    stream: &mut tokio::net::tcp::OwnedWriteHalf,
    bytes: &[u8],
) -> std::io::Result<()> {
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_loop(
    mut stream: TcpStream,
    inbound_tx: mpsc::UnboundedSender<Message>,
) -> Result<(), TransportError> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(source) => return Err(TransportError::Receive { source }),
        };

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|source| TransportError::Receive { source })?;

        match codec::decode(&buf) {
            Ok(msg) => {
                if inbound_tx.send(msg).is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                // Protocol violation: drop silently, connection stays up
                // (spec §7 — malformed frames never reach consensus state).
                debug!(error = %e, "dropped malformed frame");
            }
        }
    }
}

/// In-process transport used by scenario tests: a shared registry of
/// per-node inbound channels stands in for the network. No reconnect
/// logic is needed since there is no socket to lose.
#[derive(Clone)]
pub struct ChannelTransport {
    node_id: NodeId,
    registry: Arc<SyncMutex<HashMap<NodeId, mpsc::UnboundedSender<Message>>>>,
}

impl ChannelTransport {
    /// Build a fully-connected in-process cluster: one `ChannelTransport`
    /// plus inbound receiver per id in `ids`.
    pub fn cluster(ids: &[NodeId]) -> HashMap<NodeId, (Self, mpsc::UnboundedReceiver<Message>)> {
        let registry = Arc::new(SyncMutex::new(HashMap::new()));
        let mut result = HashMap::new();
        for &id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.lock().insert(id, tx);
            result.insert(
                id,
                (
                    ChannelTransport {
                        node_id: id,
                        registry: Arc::clone(&registry),
                    },
                    rx,
                ),
            );
        }
        result
    }

    /// Disconnect a node from the simulated network (drop its inbound
    /// sender registration), used to test partitions/process death.
    pub fn isolate(&self, id: NodeId) {
        self.registry.lock().remove(&id);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: NodeId, msg: Message) {
        if to == self.node_id {
            return;
        }
        let maybe_tx = self.registry.lock().get(&to).cloned();
        if let Some(tx) = maybe_tx {
            let _ = tx.send(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, RequestVote};

    #[tokio::test]
    async fn channel_transport_delivers_in_order_per_peer() {
        let mut cluster = ChannelTransport::cluster(&[1, 2]);
        let (t1, _rx1) = cluster.remove(&1).unwrap();
        let (_t2, mut rx2) = cluster.remove(&2).unwrap();

        for term in 1..=3 {
            t1.send(
                2,
                Message::RequestVote(RequestVote {
                    term,
                    sender_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            );
        }

        for expected_term in 1..=3 {
            let msg = rx2.recv().await.expect("message");
            assert_eq!(msg.term(), expected_term);
        }
    }

    #[tokio::test]
    async fn isolated_peer_receives_nothing() {
        let mut cluster = ChannelTransport::cluster(&[1, 2]);
        let (t1, _rx1) = cluster.remove(&1).unwrap();
        let (t2, mut rx2) = cluster.remove(&2).unwrap();

        t2.isolate(2);
        t1.send(
            2,
            Message::RequestVote(RequestVote {
                term: 1,
                sender_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            }),
        );

        assert!(rx2.try_recv().is_err());
    }
}
