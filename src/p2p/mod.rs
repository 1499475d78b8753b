//! The peer-to-peer pool: listener, outbound dials, handshake policy,
//! gossip fan-out and reconnection with capped exponential backoff.

pub mod nodes;
pub mod packet;
pub mod peer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::RngCore as _;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::constants::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, RECONNECT_INITIAL_DELAY,
    RECONNECT_MAX_DELAY,
};
use crate::market::{NodePubKey, PairId};
use nodes::{NodeList, ReputationEvent};
use packet::{
    Disconnecting, DisconnectReason, Envelope, Hello, OrderInvalidation, Packet, WireError,
    WireOrder, write_frame,
};
use peer::{PeerHandle, PeerInfo, spawn_peer};

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("cannot attempt connection to self")]
    ConnectToSelf,
    #[error("already connected to peer {0}")]
    AlreadyConnected(NodePubKey),
    #[error("peer {0} is banned")]
    Banned(NodePubKey),
    #[error("expected node pub key {expected} but received {actual}")]
    UnexpectedNodePubKey { expected: String, actual: String },
    #[error("tor address {0} rejected while tor is disabled")]
    TorDisabled(String),
    #[error("network mismatch: ours {ours}, theirs {theirs}")]
    NetworkMismatch { ours: String, theirs: String },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake expected a hello packet")]
    HandshakeProtocol,
    #[error("peer rejected the connection: {0:?}")]
    Rejected(DisconnectReason),
    #[error("peer {0} is not connected")]
    NotConnected(NodePubKey),
    #[error("invalid node uri {0}")]
    InvalidNodeUri(String),
    #[error("pool is not listening")]
    NotListening,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    PeerOpen {
        pub_key: NodePubKey,
        pairs: Vec<PairId>,
    },
    PeerClose {
        pub_key: NodePubKey,
        inbound: bool,
        reason: Option<DisconnectReason>,
    },
    Packet {
        pub_key: NodePubKey,
        envelope: Envelope,
    },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub network: String,
    pub listen_addr: Option<SocketAddr>,
    pub advertised_addresses: Vec<String>,
    pub tor_enabled: bool,
    /// Master switch for outbound reconnect attempts.
    pub reconnect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            network: "simnet".into(),
            listen_addr: None,
            advertised_addresses: Vec::new(),
            tor_enabled: false,
            reconnect: true,
        }
    }
}

/// Random 33-byte node identity key, hex encoded.
pub fn generate_node_key() -> NodePubKey {
    let mut bytes = [0u8; 33];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse `<nodePubKey>@<host>:<port>`.
pub fn parse_node_uri(uri: &str) -> Result<(NodePubKey, String), P2pError> {
    let (pub_key, addr) = uri
        .split_once('@')
        .ok_or_else(|| P2pError::InvalidNodeUri(uri.to_string()))?;
    let valid_key = pub_key.len() == 66 && pub_key.chars().all(|c| c.is_ascii_hexdigit());
    let valid_addr = addr.rsplit_once(':').is_some_and(|(host, port)| {
        !host.is_empty() && port.parse::<u16>().is_ok()
    });
    if !valid_key || !valid_addr {
        return Err(P2pError::InvalidNodeUri(uri.to_string()));
    }
    Ok((pub_key.to_string(), addr.to_string()))
}

fn is_tor_address(addr: &str) -> bool {
    addr.rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(addr)
        .ends_with(".onion")
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    cfg: PoolConfig,
    node_pub_key: NodePubKey,
    nodes: Arc<NodeList>,
    peers: Mutex<HashMap<NodePubKey, PeerHandle>>,
    retries: Mutex<HashMap<NodePubKey, JoinHandle<()>>>,
    events: mpsc::UnboundedSender<PoolEvent>,
    own_pairs: Mutex<Vec<PairId>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Pool {
    pub fn new(
        cfg: PoolConfig,
        node_pub_key: NodePubKey,
        nodes: Arc<NodeList>,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let pool = Self {
            inner: Arc::new(PoolInner {
                cfg,
                node_pub_key,
                nodes,
                peers: Mutex::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
                events,
                own_pairs: Mutex::new(Vec::new()),
                listen_addr: Mutex::new(None),
                listener_task: Mutex::new(None),
                shutdown,
            }),
        };
        (pool, events_rx)
    }

    pub fn node_pub_key(&self) -> &str {
        &self.inner.node_pub_key
    }

    pub fn nodes(&self) -> &NodeList {
        &self.inner.nodes
    }

    /// Our URI, available once the pool is listening.
    pub fn node_uri(&self) -> Option<String> {
        let addr = (*self.inner.listen_addr.lock().expect("listen addr poisoned"))?;
        Some(format!("{}@{}", self.inner.node_pub_key, addr))
    }

    /// Bind the listener and start accepting inbound connections.
    pub async fn listen(&self) -> Result<SocketAddr, P2pError> {
        let bind_addr = self.inner.cfg.listen_addr.ok_or(P2pError::NotListening)?;
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.listen_addr.lock().expect("listen addr poisoned") = Some(local_addr);

        let pool = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                if let Err(err) = pool.handshake(stream, addr, true, None, None).await {
                                    tracing::debug!(%addr, error = %err, "inbound handshake failed");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.inner.listener_task.lock().expect("listener task poisoned") = Some(task);

        tracing::info!(%local_addr, "p2p pool listening");
        Ok(local_addr)
    }

    /// Connect to a `<pubkey>@<host>:<port>` URI.
    pub async fn connect_uri(&self, uri: &str, retry: bool) -> Result<PeerInfo, P2pError> {
        let (pub_key, addr) = parse_node_uri(uri)?;
        self.add_outbound(addr, pub_key, retry).await
    }

    /// Dial an address expecting a specific node identity.
    pub async fn add_outbound(
        &self,
        addr: String,
        expected_pub_key: NodePubKey,
        retry: bool,
    ) -> Result<PeerInfo, P2pError> {
        if expected_pub_key == self.inner.node_pub_key {
            return Err(P2pError::ConnectToSelf);
        }
        if self.inner.nodes.is_banned(&expected_pub_key) {
            return Err(P2pError::Banned(expected_pub_key));
        }
        if self.is_connected(&expected_pub_key) {
            return Err(P2pError::AlreadyConnected(expected_pub_key));
        }
        if is_tor_address(&addr) && !self.inner.cfg.tor_enabled {
            return Err(P2pError::TorDisabled(addr));
        }

        let result = self.dial(&addr, &expected_pub_key).await;
        match &result {
            Ok(_) => self.revoke_retry(&expected_pub_key),
            Err(err) => {
                if retry && !matches!(err, P2pError::AlreadyConnected(_)) {
                    self.spawn_retry(expected_pub_key.clone(), addr);
                }
            }
        }
        result
    }

    async fn dial(&self, addr: &str, expected_pub_key: &str) -> Result<PeerInfo, P2pError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::HandshakeTimeout)??;
        let peer_addr = stream.peer_addr()?;
        self.handshake(
            stream,
            peer_addr,
            false,
            Some(expected_pub_key),
            Some(addr.to_string()),
        )
        .await
    }

    /// Exchange hellos and admit the peer, or close the socket with a
    /// `Disconnecting` reason.
    async fn handshake(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
        expected_pub_key: Option<&str>,
        retry_addr: Option<String>,
    ) -> Result<PeerInfo, P2pError> {
        let hello = timeout(HANDSHAKE_TIMEOUT, async {
            write_frame(&mut stream, &Envelope::new(Packet::Hello(self.our_hello())))
                .await?;
            let envelope = packet::read_frame(&mut stream).await?;
            match envelope.packet {
                Packet::Hello(hello) => Ok(hello),
                Packet::Disconnecting(d) => Err(P2pError::Rejected(d.reason)),
                _ => Err(P2pError::HandshakeProtocol),
            }
        })
        .await
        .map_err(|_| P2pError::HandshakeTimeout)??;

        if hello.pub_key == self.inner.node_pub_key {
            self.reject(stream, DisconnectReason::UnexpectedIdentity).await;
            return Err(P2pError::ConnectToSelf);
        }
        if let Some(expected) = expected_pub_key
            && expected != hello.pub_key
        {
            self.reject(stream, DisconnectReason::UnexpectedIdentity).await;
            return Err(P2pError::UnexpectedNodePubKey {
                expected: expected.to_string(),
                actual: hello.pub_key,
            });
        }
        if hello.network != self.inner.cfg.network {
            self.reject(stream, DisconnectReason::IncompatibleProtocolVersion)
                .await;
            return Err(P2pError::NetworkMismatch {
                ours: self.inner.cfg.network.clone(),
                theirs: hello.network,
            });
        }
        if self.inner.nodes.is_banned(&hello.pub_key) {
            self.reject(stream, DisconnectReason::Banned).await;
            return Err(P2pError::Banned(hello.pub_key));
        }

        let pub_key = hello.pub_key.clone();
        let handle = match self.register_peer(stream, addr, &hello, inbound, retry_addr) {
            Ok(handle) => handle,
            Err(stream) => {
                self.reject(stream, DisconnectReason::AlreadyConnected).await;
                return Err(P2pError::AlreadyConnected(pub_key));
            }
        };

        if let Err(err) = self.inner.nodes.seen(&pub_key, &hello.addresses) {
            tracing::warn!(peer = %pub_key, error = %err, "failed to persist node record");
        }
        self.revoke_retry(&pub_key);

        tracing::info!(peer = %pub_key, %addr, inbound, "peer connected");
        let _ = self.inner.events.send(PoolEvent::PeerOpen {
            pub_key: pub_key.clone(),
            pairs: hello.pairs,
        });
        // ask for the peer's current order book right away
        handle.send(Envelope::new(Packet::GetOrders));

        Ok(handle.info())
    }

    /// Atomically check-and-insert the peer under the peers lock, keeping
    /// the `MutexGuard` from ever crossing an `.await` point. Returns the
    /// stream back on failure so the caller can reject the connection.
    fn register_peer(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        hello: &Hello,
        inbound: bool,
        retry_addr: Option<String>,
    ) -> Result<PeerHandle, TcpStream> {
        let pub_key = hello.pub_key.clone();
        let mut peers = self.inner.peers.lock().expect("peer map poisoned");
        if peers.contains_key(&pub_key) {
            return Err(stream);
        }
        let on_close = self.on_close_callback(retry_addr);
        let handle = spawn_peer(
            stream,
            addr,
            hello.clone(),
            inbound,
            self.inner.events.clone(),
            on_close,
        );
        peers.insert(pub_key, handle.clone());
        Ok(handle)
    }

    async fn reject(&self, mut stream: TcpStream, reason: DisconnectReason) {
        let envelope = Envelope::new(Packet::Disconnecting(Disconnecting {
            reason,
            payload: None,
        }));
        let _ = timeout(CONNECT_TIMEOUT, write_frame(&mut stream, &envelope)).await;
    }

    fn our_hello(&self) -> Hello {
        Hello {
            pub_key: self.inner.node_pub_key.clone(),
            version: PROTOCOL_VERSION.to_string(),
            network: self.inner.cfg.network.clone(),
            addresses: self.inner.cfg.advertised_addresses.clone(),
            pairs: self.inner.own_pairs.lock().expect("pair list poisoned").clone(),
        }
    }

    fn on_close_callback(&self, retry_addr: Option<String>) -> peer::OnClose {
        let pool = self.clone();
        Box::new(move |conn_id, pub_key, inbound, local_reason, remote_reason| {
            pool.handle_peer_closed(
                conn_id,
                pub_key,
                inbound,
                local_reason,
                remote_reason,
                retry_addr,
            );
        })
    }

    fn handle_peer_closed(
        &self,
        conn_id: Uuid,
        pub_key: NodePubKey,
        inbound: bool,
        local_reason: Option<DisconnectReason>,
        remote_reason: Option<DisconnectReason>,
        retry_addr: Option<String>,
    ) {
        {
            let mut peers = self.inner.peers.lock().expect("peer map poisoned");
            // a replacement connection may already occupy the slot
            if peers.get(&pub_key).map(|h| h.conn_id) == Some(conn_id) {
                peers.remove(&pub_key);
            }
        }

        match local_reason {
            Some(DisconnectReason::MalformedPacket) => {
                let _ = self
                    .inner
                    .nodes
                    .add_reputation_event(&pub_key, ReputationEvent::MalformedPacket);
            }
            Some(DisconnectReason::ConnectionTimeout | DisconnectReason::ResponseStalling) => {
                let _ = self
                    .inner
                    .nodes
                    .add_reputation_event(&pub_key, ReputationEvent::StalledResponse);
            }
            _ => {}
        }

        let reason = remote_reason.or(local_reason);
        tracing::info!(peer = %pub_key, inbound, ?reason, "peer disconnected");
        let _ = self.inner.events.send(PoolEvent::PeerClose {
            pub_key: pub_key.clone(),
            inbound,
            reason,
        });

        // a close we initiated ourselves is only retried after a timeout;
        // remote shutdowns and rejections of a racing duplicate are retried
        let reconnect_worthy = matches!(
            remote_reason,
            Some(
                DisconnectReason::Shutdown
                    | DisconnectReason::AlreadyConnected
                    | DisconnectReason::ConnectionTimeout
            )
        ) || (remote_reason.is_none()
            && matches!(local_reason, Some(DisconnectReason::ConnectionTimeout)));
        if !inbound && reconnect_worthy && self.inner.cfg.reconnect {
            let addr = retry_addr.or_else(|| self.inner.nodes.addresses(&pub_key).into_iter().next());
            if let Some(addr) = addr {
                self.spawn_retry(pub_key, addr);
            }
        }
    }

    /// Retry an outbound connection with exponential backoff until it
    /// succeeds, the node is banned, or the attempt is revoked.
    fn spawn_retry(&self, pub_key: NodePubKey, addr: String) {
        let mut retries = self.inner.retries.lock().expect("retry map poisoned");
        if retries.contains_key(&pub_key) {
            return;
        }

        let pool = self.clone();
        let key = pub_key.clone();
        let task = tokio::spawn(async move {
            let mut delay = RECONNECT_INITIAL_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                if *pool.inner.shutdown.borrow()
                    || pool.inner.nodes.is_banned(&key)
                    || pool.is_connected(&key)
                {
                    break;
                }
                tracing::debug!(peer = %key, %addr, ?delay, "reconnect attempt");
                match pool.dial(&addr, &key).await {
                    Ok(_) => break,
                    Err(P2pError::AlreadyConnected(_)) => break,
                    Err(err) => {
                        tracing::debug!(peer = %key, error = %err, "reconnect failed");
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
            pool.inner.retries.lock().expect("retry map poisoned").remove(&key);
        });
        retries.insert(pub_key, task);
    }

    /// Cancel a pending reconnect attempt.
    pub fn revoke_retry(&self, pub_key: &str) {
        if let Some(task) = self
            .inner
            .retries
            .lock()
            .expect("retry map poisoned")
            .remove(pub_key)
        {
            task.abort();
        }
    }

    pub fn retrying(&self, pub_key: &str) -> bool {
        self.inner
            .retries
            .lock()
            .expect("retry map poisoned")
            .contains_key(pub_key)
    }

    pub fn is_connected(&self, pub_key: &str) -> bool {
        self.inner
            .peers
            .lock()
            .expect("peer map poisoned")
            .contains_key(pub_key)
    }

    pub fn peer(&self, pub_key: &str) -> Option<PeerInfo> {
        self.inner
            .peers
            .lock()
            .expect("peer map poisoned")
            .get(pub_key)
            .map(|h| h.info())
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .inner
            .peers
            .lock()
            .expect("peer map poisoned")
            .values()
            .map(|h| h.info())
            .collect();
        out.sort_by(|a, b| a.pub_key.cmp(&b.pub_key));
        out
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().expect("peer map poisoned").len()
    }

    pub fn disconnect_peer(
        &self,
        pub_key: &str,
        reason: DisconnectReason,
    ) -> Result<(), P2pError> {
        let peers = self.inner.peers.lock().expect("peer map poisoned");
        let handle = peers
            .get(pub_key)
            .ok_or_else(|| P2pError::NotConnected(pub_key.to_string()))?;
        handle.close(reason);
        Ok(())
    }

    pub fn send_to_peer(&self, pub_key: &str, envelope: Envelope) -> Result<(), P2pError> {
        let peers = self.inner.peers.lock().expect("peer map poisoned");
        let handle = peers
            .get(pub_key)
            .ok_or_else(|| P2pError::NotConnected(pub_key.to_string()))?;
        if !handle.send(envelope) {
            return Err(P2pError::NotConnected(pub_key.to_string()));
        }
        Ok(())
    }

    /// Advertise a new pair list to every connected peer.
    pub fn set_pairs(&self, pairs: Vec<PairId>) {
        *self.inner.own_pairs.lock().expect("pair list poisoned") = pairs.clone();
        let update = Packet::NodeStateUpdate(packet::NodeState {
            addresses: self.inner.cfg.advertised_addresses.clone(),
            pairs,
        });
        for handle in self.inner.peers.lock().expect("peer map poisoned").values() {
            handle.send(Envelope::new(update.clone()));
        }
    }

    /// Best-effort gossip of one of our own orders to every peer that
    /// advertises its pair.
    pub fn broadcast_order(&self, order: WireOrder) {
        for handle in self.inner.peers.lock().expect("peer map poisoned").values() {
            if handle.advertises_pair(&order.pair_id) {
                handle.send(Envelope::new(Packet::Order(order.clone())));
            }
        }
    }

    /// Broadcast an invalidation of one of our orders, optionally skipping
    /// the peer that consumed the quantity through a swap (its copy was
    /// already reduced at match time).
    pub fn broadcast_order_invalidation(
        &self,
        invalidation: OrderInvalidation,
        except_peer: Option<&str>,
    ) {
        for handle in self.inner.peers.lock().expect("peer map poisoned").values() {
            if except_peer == Some(handle.pub_key.as_str()) {
                continue;
            }
            if handle.advertises_pair(&invalidation.pair_id) {
                handle.send(Envelope::new(Packet::OrderInvalidation(invalidation.clone())));
            }
        }
    }

    /// Ban a node and drop any live connection to it.
    pub fn ban(&self, pub_key: &str) -> anyhow::Result<()> {
        self.inner.nodes.ban(pub_key)?;
        self.revoke_retry(pub_key);
        let _ = self.disconnect_peer(pub_key, DisconnectReason::Banned);
        Ok(())
    }

    pub fn unban(&self, pub_key: &str) -> anyhow::Result<()> {
        self.inner.nodes.unban(pub_key)
    }

    /// Score a peer event, banning and disconnecting on threshold.
    pub fn add_reputation_event(
        &self,
        pub_key: &str,
        event: ReputationEvent,
    ) -> anyhow::Result<()> {
        if self.inner.nodes.add_reputation_event(pub_key, event)? {
            self.revoke_retry(pub_key);
            let _ = self.disconnect_peer(pub_key, DisconnectReason::Banned);
        }
        Ok(())
    }

    /// Graceful shutdown: stop accepting, cancel retries, say goodbye to
    /// every peer and let their writers drain.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(task) = self
            .inner
            .listener_task
            .lock()
            .expect("listener task poisoned")
            .take()
        {
            task.abort();
        }

        let retries: Vec<JoinHandle<()>> = {
            let mut retries = self.inner.retries.lock().expect("retry map poisoned");
            retries.drain().map(|(_, task)| task).collect()
        };
        for task in retries {
            task.abort();
        }

        let handles: Vec<PeerHandle> = self
            .inner
            .peers
            .lock()
            .expect("peer map poisoned")
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.close(DisconnectReason::Shutdown);
        }
        // give writers a moment to flush the goodbyes
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
