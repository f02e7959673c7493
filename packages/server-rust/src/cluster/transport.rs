//! `ClusterTransport`: full-mesh peer links, handshake, duplicate-link
//! resolution, heartbeat send, and typed message delivery.
//!
//! Sockets are owned exclusively by this module. `replication`, `migration`,
//! and `repair` depend only on the abstract [`PeerSender`] trait, which
//! `ClusterTransport` implements here so those modules plug in unmodified --
//! the same pluggable-callback shape the teacher uses throughout `cluster::*`.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::errors::ClusterError;
use super::messages::{ClusterMessage, HeartbeatPayload, HelloPayload, PROTOCOL_VERSION};
use super::replication::PeerSender;
use super::state::InboundClusterMessage;
use super::types::ClusterConfig;

/// Reconnect backoff schedule for outbound dials (seconds -> ms), capped at the last entry.
const RECONNECT_BACKOFF_MS: &[u64] = &[5_000, 10_000, 20_000, 40_000, 60_000];

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Deterministic duplicate-link tiebreak: the link whose initiator has the
/// lower node ID is the one kept active (see SPEC_FULL.md §9 Open Questions).
#[must_use]
fn initiator_wins(initiator_id: &str, receiver_id: &str) -> bool {
    initiator_id < receiver_id
}

/// Observable lifecycle/data events the embedder drains to drive membership,
/// the failure detector, and message routing.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A link to `node_id` was established (or won a duplicate-link tiebreak).
    PeerLinked {
        node_id: String,
        host: String,
        port: u16,
    },
    /// The active link to `node_id` went down.
    PeerUnlinked { node_id: String },
    /// A decoded message arrived from a peer over its active link.
    Message(InboundClusterMessage),
}

struct PeerLink {
    host: String,
    port: u16,
    tx: mpsc::Sender<WsMessage>,
    /// Monotonic id assigned at link-up, used by the stale-socket test: a
    /// closing link only tears down the table entry if its generation still
    /// matches, so a replaced-but-not-yet-closed loser can't clobber a winner.
    generation: u64,
}

/// Full-mesh inter-node transport.
///
/// `new()` allocates state; `start()` binds the mesh listener, spawns the
/// accept loop, the seed re-dial loop, and the heartbeat loop, mirroring the
/// deferred-startup split `network::NetworkModule` uses for the client port.
pub struct ClusterTransport {
    local_node_id: String,
    local_host: String,
    local_port: AtomicU16,
    members_view_version: AtomicU64,
    suspected_nodes: Mutex<Vec<String>>,
    links: DashMap<String, PeerLink>,
    dialing: DashMap<String, ()>,
    next_generation: AtomicU64,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    seed_dial_interval: Duration,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

/// Shared handle, suitable for use from multiple tasks and other components.
pub type SharedClusterTransport = Arc<ClusterTransport>;

impl ClusterTransport {
    #[must_use]
    pub fn new(
        local_node_id: impl Into<String>,
        local_host: impl Into<String>,
        config: &ClusterConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local_node_id: local_node_id.into(),
            local_host: local_host.into(),
            local_port: AtomicU16::new(config.cluster_port),
            members_view_version: AtomicU64::new(0),
            suspected_nodes: Mutex::new(Vec::new()),
            links: DashMap::new(),
            dialing: DashMap::new(),
            next_generation: AtomicU64::new(1),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            seed_dial_interval: Duration::from_millis(config.seed_dial_interval_ms),
            events_tx,
        });
        (transport, events_rx)
    }

    /// Updates the partition-table version advertised in outgoing heartbeats.
    pub fn set_members_view_version(&self, version: u64) {
        self.members_view_version.store(version, Ordering::Relaxed);
    }

    /// Updates the suspected-node list advertised in outgoing heartbeats.
    pub fn set_suspected_nodes(&self, nodes: Vec<String>) {
        *self.suspected_nodes.lock() = nodes;
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.local_node_id
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_linked(&self, node_id: &str) -> bool {
        self.links.contains_key(node_id)
    }

    #[must_use]
    pub fn linked_peer_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn pending_dial_count(&self) -> usize {
        self.dialing.len()
    }

    /// Binds the mesh listener and spawns the accept, seed-redial, and
    /// heartbeat loops. Returns the actual bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(
        self: &Arc<Self>,
        bind_host: &str,
        bind_port: u16,
        seeds: Vec<String>,
    ) -> anyhow::Result<u16> {
        let addr = format!("{bind_host}:{bind_port}");
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.local_port.store(port, Ordering::Relaxed);
        info!(node_id = %self.local_node_id, %addr, port, "cluster mesh listener bound");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener).await });

        if !seeds.is_empty() {
            let this = Arc::clone(self);
            let interval = self.seed_dial_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    for seed in &seeds {
                        this.connect_peer(seed.clone());
                    }
                }
            });
        }

        let this = Arc::clone(self);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.send_heartbeats().await;
            }
        });

        Ok(port)
    }

    /// Idempotently dials `address` (`host:port`), retrying with exponential
    /// backoff on failure. A no-op if a dial to this address is already
    /// pending or a link to it is already active.
    pub fn connect_peer(self: &Arc<Self>, address: String) {
        if self.dialing.contains_key(&address) {
            return;
        }
        let already_linked = self
            .links
            .iter()
            .any(|entry| format!("{}:{}", entry.value().host, entry.value().port) == address);
        if already_linked {
            return;
        }

        self.dialing.insert(address.clone(), ());
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dial_with_backoff(address).await });
    }

    async fn dial_with_backoff(self: Arc<Self>, address: String) {
        let mut attempt = 0usize;
        loop {
            let url = format!("ws://{address}/cluster");
            match tokio_tungstenite::connect_async(&url).await {
                Ok((stream, _response)) => {
                    self.dialing.remove(&address);
                    self.handle_stream(stream, true, Some(address)).await;
                    return;
                }
                Err(err) => {
                    let delay_ms = RECONNECT_BACKOFF_MS
                        [attempt.min(RECONNECT_BACKOFF_MS.len() - 1)];
                    warn!(%address, error = %err, delay_ms, "peer dial failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => this.handle_stream(ws, false, None).await,
                            Err(err) => {
                                warn!(%peer_addr, error = %err, "mesh handshake upgrade failed");
                            }
                        }
                    });
                }
                Err(err) => warn!(error = %err, "mesh listener accept failed"),
            }
        }
    }

    /// Drives one peer link end-to-end: `HELLO` handshake, duplicate-link
    /// resolution, then the read/write loop until the link closes.
    async fn handle_stream<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        initiator: bool,
        dial_addr: Option<String>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let hello = ClusterMessage::Hello(HelloPayload {
            sender_id: self.local_node_id.clone(),
            host: self.local_host.clone(),
            port: self.local_port(),
            protocol_version: PROTOCOL_VERSION,
        });
        let Ok(hello_bytes) = rmp_serde::to_vec_named(&hello) else {
            return;
        };
        if sink.send(WsMessage::Binary(hello_bytes.into())).await.is_err() {
            return;
        }

        let peer = match tokio::time::timeout(self.handshake_timeout, stream.next()).await {
            Ok(Some(Ok(WsMessage::Binary(bytes)))) => {
                match rmp_serde::from_slice::<ClusterMessage>(&bytes) {
                    Ok(ClusterMessage::Hello(payload)) => payload,
                    _ => {
                        warn!(?dial_addr, "first frame on new link was not HELLO, dropping");
                        return;
                    }
                }
            }
            _ => {
                warn!(?dial_addr, "handshake timed out before HELLO, dropping link");
                return;
            }
        };

        let (initiator_id, receiver_id) = if initiator {
            (self.local_node_id.clone(), peer.sender_id.clone())
        } else {
            (peer.sender_id.clone(), self.local_node_id.clone())
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<WsMessage>(256);

        match self.links.entry(peer.sender_id.clone()) {
            Entry::Occupied(_) if !initiator_wins(&initiator_id, &receiver_id) => {
                debug!(node_id = %peer.sender_id, "duplicate link loses low-id-initiator tiebreak, dropping");
                let _ = sink.close().await;
                return;
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(PeerLink {
                    host: peer.host.clone(),
                    port: peer.port,
                    tx,
                    generation,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PeerLink {
                    host: peer.host.clone(),
                    port: peer.port,
                    tx,
                    generation,
                });
            }
        }

        let _ = self.events_tx.send(TransportEvent::PeerLinked {
            node_id: peer.sender_id.clone(),
            host: peer.host.clone(),
            port: peer.port,
        });

        let writer_node_id = peer.sender_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            debug!(node_id = %writer_node_id, "mesh link writer exiting");
        });

        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    match rmp_serde::from_slice::<ClusterMessage>(&bytes) {
                        Ok(message) => {
                            let _ = self.events_tx.send(TransportEvent::Message(
                                InboundClusterMessage {
                                    sender_node_id: peer.sender_id.clone(),
                                    message,
                                },
                            ));
                        }
                        Err(err) => {
                            warn!(node_id = %peer.sender_id, error = %err, "malformed cluster frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(node_id = %peer.sender_id, error = %err, "mesh link read error");
                    break;
                }
            }
        }

        self.teardown_link(&peer.sender_id, generation);
    }

    /// Removes a link's table entry, but only if it's still the link that
    /// closed -- the "stale-socket" test referenced in SPEC_FULL.md §4.1.
    fn teardown_link(&self, node_id: &str, generation: u64) {
        let is_current = self
            .links
            .get(node_id)
            .map(|link| link.generation == generation)
            .unwrap_or(false);
        if !is_current {
            return;
        }
        self.links.remove(node_id);
        let _ = self
            .events_tx
            .send(TransportEvent::PeerUnlinked { node_id: node_id.to_string() });
    }

    async fn send_heartbeats(&self) {
        let payload = HeartbeatPayload {
            sender_id: self.local_node_id.clone(),
            timestamp_ms: now_ms(),
            members_view_version: self.members_view_version.load(Ordering::Relaxed),
            suspected_nodes: self.suspected_nodes.lock().clone(),
        };
        self.broadcast(ClusterMessage::Heartbeat(payload)).await;
    }

    /// Sends `message` to `node_id`. Fails with `PeerUnreachable` if the link
    /// is not open, matching the spec's "fails silently with a warning" --
    /// the warning is logged here; the error return lets callers decide
    /// whether silence is appropriate for their own context.
    pub async fn send(&self, node_id: &str, message: ClusterMessage) -> Result<(), ClusterError> {
        let Some(tx) = self.links.get(node_id).map(|link| link.tx.clone()) else {
            warn!(node_id, "send attempted to peer with no open link");
            return Err(ClusterError::PeerUnreachable {
                node_id: node_id.to_string(),
            });
        };
        let bytes = rmp_serde::to_vec_named(&message).map_err(|_| ClusterError::PeerUnreachable {
            node_id: node_id.to_string(),
        })?;
        tx.send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(|_| ClusterError::PeerUnreachable {
                node_id: node_id.to_string(),
            })
    }

    /// Sends `message` to every currently-linked peer, skipping individual
    /// failures with a warning rather than aborting the whole broadcast.
    pub async fn broadcast(&self, message: ClusterMessage) {
        let Ok(bytes) = rmp_serde::to_vec_named(&message) else {
            return;
        };
        let targets: Vec<(String, mpsc::Sender<WsMessage>)> = self
            .links
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().tx.clone()))
            .collect();
        for (node_id, tx) in targets {
            if tx.send(WsMessage::Binary(bytes.clone().into())).await.is_err() {
                warn!(node_id, "broadcast send failed, link not open");
            }
        }
    }
}

#[async_trait]
impl PeerSender for ClusterTransport {
    async fn send_to(&self, node_id: &str, message: ClusterMessage) -> Result<(), ClusterError> {
        self.send(node_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    /// Heartbeat and seed-redial intervals are set far longer than any test's
    /// runtime so their background ticks don't inject extra events into the
    /// assertions below.
    fn config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval_ms: 60_000,
            handshake_timeout_ms: 2_000,
            seed_dial_interval_ms: 60_000,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn low_id_initiator_wins_tiebreak() {
        assert!(initiator_wins("node-a", "node-b"));
        assert!(!initiator_wins("node-b", "node-a"));
    }

    #[test]
    fn reconnect_backoff_is_capped_exponential() {
        assert_eq!(RECONNECT_BACKOFF_MS, &[5_000, 10_000, 20_000, 40_000, 60_000]);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let (transport, _rx) = ClusterTransport::new("node-1", "127.0.0.1", &config());
        let port = transport.start("127.0.0.1", 0, vec![]).await.unwrap();
        assert!(port > 0);
        assert_eq!(transport.local_port(), port);
    }

    #[tokio::test]
    async fn connect_peer_is_idempotent_while_dial_pending() {
        let (transport, _rx) = ClusterTransport::new("node-1", "127.0.0.1", &config());
        // Port 1 is reserved and will not accept connections; the dial stays
        // pending long enough to observe the dedup.
        transport.connect_peer("127.0.0.1:1".to_string());
        transport.connect_peer("127.0.0.1:1".to_string());
        assert_eq!(transport.pending_dial_count(), 1);
    }

    #[tokio::test]
    async fn two_transports_complete_handshake_and_exchange_message() {
        let (node_a, mut a_events) = ClusterTransport::new("node-a", "127.0.0.1", &config());
        let (node_b, mut b_events) = ClusterTransport::new("node-b", "127.0.0.1", &config());

        let port_a = node_a.start("127.0.0.1", 0, vec![]).await.unwrap();
        let _port_b = node_b.start("127.0.0.1", 0, vec![]).await.unwrap();

        node_b.connect_peer(format!("127.0.0.1:{port_a}"));

        let linked_on_a = tokio::time::timeout(StdDuration::from_secs(5), a_events.recv())
            .await
            .expect("timed out waiting for link")
            .expect("event channel closed");
        assert!(matches!(linked_on_a, TransportEvent::PeerLinked { node_id, .. } if node_id == "node-b"));

        let linked_on_b = tokio::time::timeout(StdDuration::from_secs(5), b_events.recv())
            .await
            .expect("timed out waiting for link")
            .expect("event channel closed");
        assert!(matches!(linked_on_b, TransportEvent::PeerLinked { node_id, .. } if node_id == "node-a"));

        assert!(node_a.is_linked("node-b"));
        assert!(node_b.is_linked("node-a"));

        node_a
            .send(
                "node-b",
                ClusterMessage::ClusterTopicPub(super::super::messages::ClusterTopicPubPayload {
                    topic: "orders".to_string(),
                    data: vec![1, 2, 3],
                    original_sender_id: None,
                }),
            )
            .await
            .expect("send to linked peer should succeed");

        let received = tokio::time::timeout(StdDuration::from_secs(5), b_events.recv())
            .await
            .expect("timed out waiting for message")
            .expect("event channel closed");
        match received {
            TransportEvent::Message(InboundClusterMessage {
                sender_node_id,
                message: ClusterMessage::ClusterTopicPub(payload),
            }) => {
                assert_eq!(sender_node_id, "node-a");
                assert_eq!(payload.topic, "orders");
                assert_eq!(payload.data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unlinked_peer_is_peer_unreachable() {
        let (transport, _rx) = ClusterTransport::new("node-1", "127.0.0.1", &config());
        let err = transport
            .send("ghost", ClusterMessage::FetchPartitionTable)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnreachable { .. }));
    }
}
