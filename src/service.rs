//! The RPC-facing facade: every externally reachable operation validated
//! and mapped onto the owning subsystem. Transports (gRPC, CLI) sit on top
//! of this and stay out of scope.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::alerts::{Alert, Alerts};
use crate::constants::PROTOCOL_VERSION;
use crate::market::book::{BookError, OrderBook, OrderEvent, PlaceOrderResult};
use crate::market::{Currency, Order, Pair, PairId};
use crate::p2p::peer::PeerInfo;
use crate::p2p::{P2pError, Pool};
use crate::store::NodeRecord;
use crate::swap::client::ClientStatus;
use crate::swap::manager::{BackendConfig, SwapClientManager};
use crate::swap::swaps::Swaps;
use crate::swap::{SwapDeal, SwapFailure, SwapSuccess};

#[derive(Debug, Serialize)]
pub struct Info {
    pub version: String,
    pub network: String,
    pub node_pub_key: String,
    pub node_uri: Option<String>,
    pub peer_count: usize,
    pub own_order_count: usize,
    pub peer_order_count: usize,
    pub pairs: Vec<PairId>,
    pub swap_clients: Vec<(String, ClientStatus)>,
    pub deal_count: usize,
}

#[derive(Clone)]
pub struct Service {
    book: OrderBook,
    pool: Pool,
    swaps: Swaps,
    manager: Arc<SwapClientManager>,
    alerts: Arc<Alerts>,
    swap_successes: broadcast::Sender<SwapSuccess>,
    swap_failures: broadcast::Sender<SwapFailure>,
    shutdown: watch::Sender<bool>,
    network: String,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        book: OrderBook,
        pool: Pool,
        swaps: Swaps,
        manager: Arc<SwapClientManager>,
        alerts: Arc<Alerts>,
        swap_successes: broadcast::Sender<SwapSuccess>,
        swap_failures: broadcast::Sender<SwapFailure>,
        shutdown: watch::Sender<bool>,
        network: String,
    ) -> Self {
        Self {
            book,
            pool,
            swaps,
            manager,
            alerts,
            swap_successes,
            swap_failures,
            shutdown,
            network,
        }
    }

    /// Connect to a peer by `<pubkey>@<host>:<port>` URI.
    pub async fn connect(&self, node_uri: &str, retry: bool) -> Result<PeerInfo, P2pError> {
        self.pool.connect_uri(node_uri, retry).await
    }

    pub fn ban(&self, node_pub_key: &str) -> anyhow::Result<()> {
        self.pool.ban(node_pub_key)
    }

    pub fn unban(&self, node_pub_key: &str) -> anyhow::Result<()> {
        self.pool.unban(node_pub_key)
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.pool.list_peers()
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        self.pool.nodes().list()
    }

    pub async fn list_orders(&self, pair_id: Option<&str>) -> Result<Vec<Order>, BookError> {
        self.book.list_orders(pair_id).await
    }

    /// Place a limit order and wait for matching and swap initiation to
    /// finish.
    pub async fn place_order_sync(
        &self,
        pair_id: &str,
        local_id: &str,
        quantity: i64,
        price: Option<Decimal>,
        ttl_ms: Option<u64>,
    ) -> Result<PlaceOrderResult, BookError> {
        match price {
            Some(price) => {
                self.book
                    .place_limit_order(pair_id, local_id, quantity, price, ttl_ms)
                    .await
            }
            None => self.book.place_market_order(pair_id, local_id, quantity).await,
        }
    }

    /// Fire-and-forget variant; failures surface on the order and swap
    /// streams.
    pub fn place_order(
        &self,
        pair_id: String,
        local_id: String,
        quantity: i64,
        price: Option<Decimal>,
        ttl_ms: Option<u64>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .place_order_sync(&pair_id, &local_id, quantity, price, ttl_ms)
                .await
            {
                tracing::warn!(pair = %pair_id, %local_id, error = %err, "async order placement failed");
            }
        });
    }

    pub async fn remove_order(&self, pair_id: &str, local_id: &str) -> Result<Order, BookError> {
        self.book.remove_own_order_by_local_id(pair_id, local_id).await
    }

    pub fn list_pairs(&self) -> Vec<PairId> {
        self.book.pairs()
    }

    pub fn list_currencies(&self) -> Vec<Currency> {
        self.book.currencies()
    }

    /// Register a currency and, when a backend is configured, its swap
    /// client.
    pub fn add_currency(
        &self,
        currency: Currency,
        backend: Option<BackendConfig>,
    ) -> Result<(), BookError> {
        self.book.add_currency(currency.clone())?;
        if let Some(backend) = backend {
            self.manager.init_currency(&currency, &backend);
        }
        Ok(())
    }

    pub fn remove_currency(&self, symbol: &str) -> Result<(), BookError> {
        self.book.remove_currency(symbol)?;
        self.manager.remove_client(symbol);
        Ok(())
    }

    pub fn add_pair(&self, base: &str, quote: &str) -> Result<(), BookError> {
        self.book.add_pair(Pair::new(base, quote))
    }

    pub async fn remove_pair(&self, pair_id: &str) -> Result<(), BookError> {
        self.book.remove_pair(pair_id).await
    }

    pub fn list_deals(&self) -> Vec<SwapDeal> {
        self.swaps.list_deals()
    }

    pub async fn get_info(&self) -> Info {
        let orders = self.book.list_orders(None).await.unwrap_or_default();
        let own_order_count = orders.iter().filter(|o| o.is_own()).count();
        Info {
            version: PROTOCOL_VERSION.to_string(),
            network: self.network.clone(),
            node_pub_key: self.pool.node_pub_key().to_string(),
            node_uri: self.pool.node_uri(),
            peer_count: self.pool.peer_count(),
            own_order_count,
            peer_order_count: orders.len() - own_order_count,
            pairs: self.book.pairs(),
            swap_clients: self.manager.statuses(),
            deal_count: self.swaps.list_deals().len(),
        }
    }

    /// Request daemon shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<OrderEvent> {
        self.book.subscribe()
    }

    pub fn subscribe_swaps(&self) -> broadcast::Receiver<SwapSuccess> {
        self.swap_successes.subscribe()
    }

    pub fn subscribe_swap_failures(&self) -> broadcast::Receiver<SwapFailure> {
        self.swap_failures.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }
}
