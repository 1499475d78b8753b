//! Daemon assembly: construct every subsystem, wire the event channels,
//! run the dispatcher and background tasks, and tear everything down in
//! dependency order on shutdown. There is no global state; everything is
//! built here and passed explicitly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::alerts::{Alert, Alerts};
use crate::constants::SWAP_RECOVERY_INTERVAL;
use crate::market::NodePubKey;
use crate::market::book::OrderBook;
use crate::p2p::nodes::{NodeList, ReputationEvent};
use crate::p2p::packet::{Envelope, Packet};
use crate::p2p::{Pool, PoolConfig, PoolEvent, generate_node_key};
use crate::service::Service;
use crate::store::SqliteStore;
use crate::swap::client::ClientEvent;
use crate::swap::manager::SwapClientManager;
use crate::swap::swaps::Swaps;
use crate::swap::SwapEvent;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: String,
    pub listen_addr: Option<SocketAddr>,
    pub advertised_addresses: Vec<String>,
    pub tor_enabled: bool,
    pub reconnect: bool,
    /// Fixed identity key; generated when absent.
    pub node_key: Option<NodePubKey>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "simnet".into(),
            listen_addr: None,
            advertised_addresses: Vec::new(),
            tor_enabled: false,
            reconnect: true,
            node_key: None,
        }
    }
}

pub struct Node {
    service: Service,
    pool: Pool,
    tasks: Vec<JoinHandle<()>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    /// Bring the daemon up. The swap client manager is constructed by the
    /// caller so deployments (and tests) decide which backends exist.
    pub async fn start(
        cfg: NodeConfig,
        store: Arc<StdMutex<SqliteStore>>,
        manager: Arc<SwapClientManager>,
        client_events: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<Node> {
        let node_key = cfg.node_key.clone().unwrap_or_else(generate_node_key);

        let nodes = Arc::new(NodeList::new(store.clone()));
        let known = nodes.load().context("load node records")?;
        tracing::info!(known, "node list loaded");

        let pool_cfg = PoolConfig {
            network: cfg.network.clone(),
            listen_addr: cfg.listen_addr,
            advertised_addresses: cfg.advertised_addresses.clone(),
            tor_enabled: cfg.tor_enabled,
            reconnect: cfg.reconnect,
        };
        let (pool, pool_events) = Pool::new(pool_cfg, node_key, nodes);

        let book = OrderBook::new(store.clone(), pool.clone());
        book.load().await.context("load order book")?;

        let swaps = Swaps::new(
            store.clone(),
            pool.clone(),
            manager.clone(),
            Arc::new(book.clone()),
        );
        book.bind_swaps(swaps.clone());
        let unresolved = swaps.load_deals().context("load swap deals")?;
        if unresolved > 0 {
            tracing::info!(unresolved, "deals queued for recovery");
        }

        if cfg.listen_addr.is_some() {
            pool.listen().await.context("start p2p listener")?;
        }

        let alerts = Arc::new(Alerts::new());
        let (swap_successes, _) = broadcast::channel(256);
        let (swap_failures, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let service = Service::new(
            book.clone(),
            pool.clone(),
            swaps.clone(),
            manager.clone(),
            alerts.clone(),
            swap_successes.clone(),
            swap_failures.clone(),
            shutdown_tx,
            cfg.network.clone(),
        );

        let mut tasks = Vec::new();
        tasks.push(swaps.spawn_recovery(SWAP_RECOVERY_INTERVAL));
        tasks.push(spawn_dispatcher(
            book.clone(),
            pool.clone(),
            swaps.clone(),
            alerts.clone(),
            swap_successes,
            swap_failures,
            pool_events,
            client_events,
            shutdown_rx.clone(),
        ));
        tasks.push(spawn_maintenance(
            book.clone(),
            manager.clone(),
            shutdown_rx.clone(),
        ));

        Ok(Node {
            service,
            pool,
            tasks,
            shutdown_rx,
        })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Resolve when a shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear down: producers first (pool stops feeding the dispatcher), then
    /// the background tasks.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.pool.close().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Route pool, client and swap events to their consumers. Packets from a
/// single peer arrive here in receive order and are processed in order.
#[allow(clippy::too_many_arguments)]
fn spawn_dispatcher(
    book: OrderBook,
    pool: Pool,
    swaps: Swaps,
    alerts: Arc<Alerts>,
    swap_successes: broadcast::Sender<crate::swap::SwapSuccess>,
    swap_failures: broadcast::Sender<crate::swap::SwapFailure>,
    mut pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    mut client_events: mpsc::UnboundedReceiver<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut swap_events = swaps.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = pool_events.recv() => match event {
                    Some(event) => handle_pool_event(&book, &pool, &swaps, event).await,
                    None => break,
                },
                event = client_events.recv() => match event {
                    Some(event) => handle_client_event(&swaps, &alerts, event).await,
                    None => break,
                },
                event = swap_events.recv() => match event {
                    Ok(SwapEvent::Success(success)) => {
                        let _ = swap_successes.send(success);
                    }
                    Ok(SwapEvent::Failure(failure)) => {
                        alerts.notify(Alert::SwapFailure {
                            r_hash: failure.r_hash.clone(),
                            pair_id: failure.pair_id.clone(),
                            message: failure
                                .message
                                .clone()
                                .unwrap_or_else(|| format!("{:?}", failure.reason)),
                        });
                        let _ = swap_failures.send(failure);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "swap event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn handle_pool_event(book: &OrderBook, pool: &Pool, swaps: &Swaps, event: PoolEvent) {
    match event {
        PoolEvent::PeerOpen { pub_key, pairs } => {
            tracing::debug!(peer = %pub_key, ?pairs, "peer opened");
        }
        PoolEvent::PeerClose { pub_key, .. } => {
            book.on_peer_disconnect(&pub_key).await;
        }
        PoolEvent::Packet { pub_key, envelope } => {
            handle_packet(book, pool, swaps, &pub_key, envelope).await;
        }
    }
}

async fn handle_packet(
    book: &OrderBook,
    pool: &Pool,
    swaps: &Swaps,
    pub_key: &str,
    envelope: Envelope,
) {
    let packet_id = envelope.id;
    match envelope.packet {
        Packet::GetOrders => {
            let orders = book.own_orders_wire().await;
            let response = Envelope::response_to(
                Packet::Orders(crate::p2p::packet::Orders { orders }),
                packet_id,
            );
            if let Err(err) = pool.send_to_peer(pub_key, response) {
                tracing::debug!(peer = %pub_key, error = %err, "orders response failed");
            }
        }
        Packet::Orders(orders) => {
            for order in orders.orders {
                import_peer_order(book, pool, pub_key, order).await;
            }
        }
        Packet::Order(order) => {
            import_peer_order(book, pool, pub_key, order).await;
        }
        Packet::OrderInvalidation(invalidation) => {
            book.on_order_invalidation(pub_key, invalidation).await;
        }
        Packet::SwapRequest(request) => {
            swaps.handle_swap_request(pub_key, packet_id, request).await;
        }
        Packet::SwapAccepted(accepted) => {
            swaps.handle_swap_accepted(pub_key, accepted).await;
        }
        Packet::SwapFailed(failed) => {
            swaps.handle_swap_failed(pub_key, failed).await;
        }
        Packet::SwapComplete(complete) => {
            swaps.handle_swap_complete(pub_key, complete).await;
        }
        // handled inside the peer connection tasks
        Packet::Hello(_)
        | Packet::Disconnecting(_)
        | Packet::Ping
        | Packet::Pong
        | Packet::NodeStateUpdate(_) => {}
    }
}

async fn import_peer_order(
    book: &OrderBook,
    pool: &Pool,
    pub_key: &str,
    order: crate::p2p::packet::WireOrder,
) {
    use crate::market::book::BookError;
    use crate::market::matching::MatchingError;

    match book.import(pub_key, order).await {
        Ok(()) => {}
        // a broadcast racing the GetOrders snapshot is harmless
        Err(BookError::Matching(MatchingError::DuplicateOrder(id))) => {
            tracing::debug!(peer = %pub_key, order = %id, "duplicate gossiped order");
        }
        Err(err) => {
            tracing::debug!(peer = %pub_key, error = %err, "rejected peer order");
            let _ = pool.add_reputation_event(pub_key, ReputationEvent::InvalidOrder);
        }
    }
}

async fn handle_client_event(swaps: &Swaps, alerts: &Arc<Alerts>, event: ClientEvent) {
    match event {
        ClientEvent::HtlcAccepted {
            currency,
            r_hash,
            units,
        } => {
            swaps.handle_htlc_accepted(&currency, &r_hash, units).await;
        }
        ClientEvent::LowBalance {
            currency,
            local,
            required,
        } => {
            alerts.notify(Alert::LowTradingBalance {
                currency,
                local,
                required,
            });
        }
        ClientEvent::ConnectionVerified { currency } => {
            tracing::info!(%currency, "swap client connection verified");
        }
    }
}

fn spawn_maintenance(
    book: OrderBook,
    manager: Arc<SwapClientManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + MAINTENANCE_INTERVAL,
            MAINTENANCE_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    book.remove_expired().await;
                    manager.verify_connections().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
