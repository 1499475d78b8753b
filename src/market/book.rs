//! The order book: own and peer order lifecycle across pairs, the
//! local-id map, hold bookkeeping for in-flight swaps, gossip broadcast and
//! persistence. Matching for a pair runs under that pair's lock from
//! validation through swap initiation, so matches on one pair never
//! interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use async_trait::async_trait;
use anyhow::Context as _;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::matching::{MatchingEngine, MatchingError, OrderMatch};
use super::{Currency, Order, OrderSource, Pair, PairId, monotonic_ms};
use crate::p2p::Pool;
use crate::p2p::packet::{OrderInvalidation, WireOrder};
use crate::store::SqliteStore;
use crate::swap::swaps::{OrderHolds, Swaps};

#[derive(Debug, Error)]
pub enum BookError {
    #[error("unknown pair {0}")]
    UnknownPair(PairId),
    #[error("pair {0} already exists")]
    DuplicatePair(PairId),
    #[error("unknown currency {0}")]
    UnknownCurrency(String),
    #[error("currency {0} already exists")]
    DuplicateCurrency(String),
    #[error("currency {0} is referenced by a pair")]
    CurrencyInUse(String),
    #[error("pair {0} still has resting orders")]
    PairNotEmpty(PairId),
    #[error("local id {0} is already in use")]
    DuplicateLocalId(String),
    #[error("no order with local id {0}")]
    LocalIdNotFound(String),
    #[error("order {0} has {1} units reserved by in-flight swaps")]
    OrderHeld(Uuid, u64),
    #[error("order quantity must be nonzero")]
    InvalidQuantity,
    #[error("order price must be positive")]
    InvalidPrice,
    #[error(transparent)]
    Matching(#[from] MatchingError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Typed stream of order book changes for subscribers.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    OwnAdded(Order),
    OwnRemoved(Order),
    PeerIncoming(Order),
    PeerInvalidation {
        pair_id: PairId,
        order_id: Uuid,
        quantity: Option<u64>,
    },
    /// Two of our own orders crossed each other locally.
    InternalMatch { maker: Order, taker: Order },
}

#[derive(Debug, Default)]
pub struct PlaceOrderResult {
    pub internal_matches: Vec<OrderMatch>,
    /// Hashes of the swaps initiated for matches against peer orders.
    pub swaps_initiated: Vec<String>,
    /// Matches whose swap could not be started, with the reason.
    pub swap_failures: Vec<(Uuid, String)>,
    pub remaining: Option<Order>,
}

#[derive(Clone)]
pub struct OrderBook {
    inner: Arc<BookInner>,
}

struct BookInner {
    store: Arc<StdMutex<SqliteStore>>,
    pool: Pool,
    swaps: OnceLock<Swaps>,
    currencies: StdMutex<HashMap<String, Currency>>,
    pairs: StdMutex<BTreeMap<PairId, Arc<Mutex<MatchingEngine>>>>,
    /// Node-global map from caller-assigned local ids to resting orders.
    local_ids: StdMutex<HashMap<String, (PairId, Uuid)>>,
    events: broadcast::Sender<OrderEvent>,
}

impl OrderBook {
    pub fn new(store: Arc<StdMutex<SqliteStore>>, pool: Pool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BookInner {
                store,
                pool,
                swaps: OnceLock::new(),
                currencies: StdMutex::new(HashMap::new()),
                pairs: StdMutex::new(BTreeMap::new()),
                local_ids: StdMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Wire in the swap engine; the book initiates deals, swaps drives
    /// holds back through [`OrderHolds`].
    pub fn bind_swaps(&self, swaps: Swaps) {
        if self.inner.swaps.set(swaps).is_err() {
            tracing::warn!("swaps already bound to the order book");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.inner.events.subscribe()
    }

    /// Restore currencies, pairs and own orders from the store.
    pub async fn load(&self) -> anyhow::Result<()> {
        let (currencies, pairs, orders) = {
            let store = self.inner.store.lock().expect("store mutex poisoned");
            (
                store.list_currencies().context("load currencies")?,
                store.list_pairs().context("load pairs")?,
                store.list_orders().context("load orders")?,
            )
        };
        {
            let mut map = self.inner.currencies.lock().expect("currency map poisoned");
            for currency in currencies {
                map.insert(currency.symbol.clone(), currency);
            }
        }
        {
            let mut map = self.inner.pairs.lock().expect("pair map poisoned");
            for pair in pairs {
                map.entry(pair.id())
                    .or_insert_with(|| Arc::new(Mutex::new(MatchingEngine::new(pair.id()))));
            }
        }
        for order in orders {
            let Ok(engine) = self.engine(&order.pair_id) else {
                tracing::warn!(order = %order.id, pair = %order.pair_id, "orphaned order in store");
                continue;
            };
            if let Some(local_id) = order.local_id() {
                self.inner
                    .local_ids
                    .lock()
                    .expect("local id map poisoned")
                    .insert(local_id.to_string(), (order.pair_id.clone(), order.id));
            }
            let mut engine = engine.lock().await;
            if let Err(err) = engine.match_or_add_own_order(order, false) {
                tracing::warn!(error = %err, "failed to restore order");
            }
        }
        self.advertise_pairs();
        Ok(())
    }

    pub fn add_currency(&self, currency: Currency) -> Result<(), BookError> {
        {
            let map = self.inner.currencies.lock().expect("currency map poisoned");
            if map.contains_key(&currency.symbol) {
                return Err(BookError::DuplicateCurrency(currency.symbol));
            }
        }
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .insert_currency(&currency)?;
        self.inner
            .currencies
            .lock()
            .expect("currency map poisoned")
            .insert(currency.symbol.clone(), currency);
        Ok(())
    }

    pub fn remove_currency(&self, symbol: &str) -> Result<(), BookError> {
        {
            let currencies = self.inner.currencies.lock().expect("currency map poisoned");
            if !currencies.contains_key(symbol) {
                return Err(BookError::UnknownCurrency(symbol.to_string()));
            }
            let pairs = self.inner.pairs.lock().expect("pair map poisoned");
            if pairs.keys().any(|id| {
                Pair::from_id(id)
                    .map(|p| p.base == symbol || p.quote == symbol)
                    .unwrap_or(false)
            }) {
                return Err(BookError::CurrencyInUse(symbol.to_string()));
            }
        }
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .delete_currency(symbol)?;
        self.inner
            .currencies
            .lock()
            .expect("currency map poisoned")
            .remove(symbol);
        Ok(())
    }

    pub fn currencies(&self) -> Vec<Currency> {
        let mut out: Vec<Currency> = self
            .inner
            .currencies
            .lock()
            .expect("currency map poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub fn add_pair(&self, pair: Pair) -> Result<(), BookError> {
        let pair_id = pair.id();
        {
            let currencies = self.inner.currencies.lock().expect("currency map poisoned");
            for symbol in [&pair.base, &pair.quote] {
                if !currencies.contains_key(symbol) {
                    return Err(BookError::UnknownCurrency(symbol.clone()));
                }
            }
            let pairs = self.inner.pairs.lock().expect("pair map poisoned");
            if pairs.contains_key(&pair_id) {
                return Err(BookError::DuplicatePair(pair_id));
            }
        }
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .insert_pair(&pair)?;
        self.inner
            .pairs
            .lock()
            .expect("pair map poisoned")
            .insert(pair_id.clone(), Arc::new(Mutex::new(MatchingEngine::new(pair_id))));
        self.advertise_pairs();
        Ok(())
    }

    pub async fn remove_pair(&self, pair_id: &str) -> Result<(), BookError> {
        let engine = self.engine(pair_id)?;
        {
            let engine = engine.lock().await;
            if !engine.is_empty() {
                return Err(BookError::PairNotEmpty(pair_id.to_string()));
            }
        }
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .delete_pair(pair_id)?;
        self.inner
            .pairs
            .lock()
            .expect("pair map poisoned")
            .remove(pair_id);
        self.advertise_pairs();
        Ok(())
    }

    pub fn pairs(&self) -> Vec<PairId> {
        self.inner
            .pairs
            .lock()
            .expect("pair map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub async fn place_limit_order(
        &self,
        pair_id: &str,
        local_id: &str,
        quantity: i64,
        price: Decimal,
        ttl_ms: Option<u64>,
    ) -> Result<PlaceOrderResult, BookError> {
        self.place(pair_id, local_id, quantity, Some(price), ttl_ms, false)
            .await
    }

    /// Market orders cross whatever is available and discard the rest.
    pub async fn place_market_order(
        &self,
        pair_id: &str,
        local_id: &str,
        quantity: i64,
    ) -> Result<PlaceOrderResult, BookError> {
        self.place(pair_id, local_id, quantity, None, None, true).await
    }

    async fn place(
        &self,
        pair_id: &str,
        local_id: &str,
        quantity: i64,
        price: Option<Decimal>,
        ttl_ms: Option<u64>,
        discard_remaining: bool,
    ) -> Result<PlaceOrderResult, BookError> {
        if quantity == 0 {
            return Err(BookError::InvalidQuantity);
        }
        if let Some(price) = price
            && price <= Decimal::ZERO
        {
            return Err(BookError::InvalidPrice);
        }
        let engine = self.engine(pair_id)?;

        let order = Order {
            id: Uuid::new_v4(),
            pair_id: pair_id.to_string(),
            quantity,
            price,
            created_at: monotonic_ms(),
            initial_quantity: quantity.unsigned_abs(),
            hold: 0,
            source: OrderSource::Own {
                local_id: local_id.to_string(),
                ttl_ms,
            },
        };

        // claim the local id before matching; under concurrent placement of
        // the same id, exactly one caller gets past this point
        {
            let mut local_ids = self.inner.local_ids.lock().expect("local id map poisoned");
            if local_ids.contains_key(local_id) {
                return Err(BookError::DuplicateLocalId(local_id.to_string()));
            }
            local_ids.insert(local_id.to_string(), (pair_id.to_string(), order.id));
        }

        let mut engine = engine.lock().await;
        let result = match engine.match_or_add_own_order(order, discard_remaining) {
            Ok(result) => result,
            Err(err) => {
                self.release_local_id(local_id);
                return Err(err.into());
            }
        };

        let mut out = PlaceOrderResult::default();
        for m in result.matches {
            if m.maker.is_own() {
                self.finish_internal_match(&mut engine, &m)?;
                out.internal_matches.push(m);
                continue;
            }
            let Some(swaps) = self.inner.swaps.get() else {
                out.swap_failures.push((m.maker.id, "swaps not available".into()));
                continue;
            };
            match swaps.execute_deal(&m.taker, &m.maker).await {
                Ok(r_hash) => out.swaps_initiated.push(r_hash),
                Err(err) => {
                    tracing::warn!(
                        maker = %m.maker.id,
                        pair = %pair_id,
                        error = %err,
                        "failed to initiate swap for match"
                    );
                    out.swap_failures.push((m.maker.id, err.to_string()));
                }
            }
        }

        match result.remaining {
            Some(remaining) => {
                self.inner
                    .store
                    .lock()
                    .expect("store mutex poisoned")
                    .upsert_order(&remaining)?;
                self.inner.pool.broadcast_order(wire_order(&remaining));
                let _ = self.inner.events.send(OrderEvent::OwnAdded(remaining.clone()));
                out.remaining = Some(remaining);
            }
            None => self.release_local_id(local_id),
        }
        Ok(out)
    }

    /// Both sides of an internal match are our own; settle the bookkeeping
    /// for the resting maker side.
    fn finish_internal_match(
        &self,
        engine: &mut MatchingEngine,
        m: &OrderMatch,
    ) -> Result<(), BookError> {
        match engine.get(&m.maker.id) {
            Some(maker) => {
                self.inner
                    .store
                    .lock()
                    .expect("store mutex poisoned")
                    .upsert_order(maker)?;
            }
            None => {
                self.inner
                    .store
                    .lock()
                    .expect("store mutex poisoned")
                    .delete_order(&m.maker.id)?;
                if let Some(local_id) = m.maker.local_id() {
                    self.release_local_id(local_id);
                }
                let _ = self.inner.events.send(OrderEvent::OwnRemoved(m.maker.clone()));
            }
        }
        // peers tracking the maker side learn about the fill
        self.inner.pool.broadcast_order_invalidation(
            OrderInvalidation {
                order_id: m.maker.id,
                pair_id: m.maker.pair_id.clone(),
                quantity: Some(m.quantity()),
            },
            None,
        );
        let _ = self.inner.events.send(OrderEvent::InternalMatch {
            maker: m.maker.clone(),
            taker: m.taker.clone(),
        });
        Ok(())
    }

    pub async fn remove_own_order_by_local_id(
        &self,
        pair_id: &str,
        local_id: &str,
    ) -> Result<Order, BookError> {
        let (stored_pair, order_id) = self
            .inner
            .local_ids
            .lock()
            .expect("local id map poisoned")
            .get(local_id)
            .cloned()
            .ok_or_else(|| BookError::LocalIdNotFound(local_id.to_string()))?;
        if stored_pair != pair_id {
            return Err(BookError::LocalIdNotFound(local_id.to_string()));
        }

        let engine = self.engine(pair_id)?;
        let removed = {
            let mut engine = engine.lock().await;
            let Some(order) = engine.get(&order_id) else {
                self.release_local_id(local_id);
                return Err(BookError::LocalIdNotFound(local_id.to_string()));
            };
            if order.hold > 0 {
                return Err(BookError::OrderHeld(order_id, order.hold));
            }
            engine
                .remove_own_order(&order_id)
                .ok_or_else(|| BookError::LocalIdNotFound(local_id.to_string()))?
        };

        self.release_local_id(local_id);
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .delete_order(&order_id)?;
        self.inner.pool.broadcast_order_invalidation(
            OrderInvalidation {
                order_id,
                pair_id: pair_id.to_string(),
                quantity: None,
            },
            None,
        );
        let _ = self.inner.events.send(OrderEvent::OwnRemoved(removed.clone()));
        Ok(removed)
    }

    /// Import a gossiped peer order into the matching queues. The local
    /// arrival stamp decides FIFO priority among equal prices.
    pub async fn import(&self, peer_pub_key: &str, wire: WireOrder) -> Result<(), BookError> {
        if wire.quantity == 0 {
            return Err(BookError::InvalidQuantity);
        }
        if wire.price <= Decimal::ZERO {
            return Err(BookError::InvalidPrice);
        }
        let engine = self.engine(&wire.pair_id)?;
        let order = Order {
            id: wire.id,
            pair_id: wire.pair_id.clone(),
            quantity: wire.quantity,
            price: Some(wire.price),
            created_at: monotonic_ms(),
            initial_quantity: wire.quantity.unsigned_abs(),
            hold: 0,
            source: OrderSource::Peer {
                peer_pub_key: peer_pub_key.to_string(),
                destination: wire.destination,
            },
        };
        engine.lock().await.add_peer_order(order.clone())?;
        let _ = self.inner.events.send(OrderEvent::PeerIncoming(order));
        Ok(())
    }

    /// Handle a peer's invalidation of its own order. Only the originating
    /// peer is trusted; anything else is dropped.
    pub async fn on_order_invalidation(&self, peer_pub_key: &str, inv: OrderInvalidation) {
        let Ok(engine) = self.engine(&inv.pair_id) else {
            return;
        };
        let mut engine = engine.lock().await;
        match engine.get(&inv.order_id) {
            Some(order) if order.peer_pub_key() == Some(peer_pub_key) => {}
            Some(_) => {
                tracing::debug!(
                    peer = %peer_pub_key,
                    order = %inv.order_id,
                    "ignoring invalidation from a non-originating peer"
                );
                return;
            }
            None => return,
        }
        engine.remove_peer_order(&inv.order_id, inv.quantity);
        let _ = self.inner.events.send(OrderEvent::PeerInvalidation {
            pair_id: inv.pair_id,
            order_id: inv.order_id,
            quantity: inv.quantity,
        });
    }

    /// Purge every order sourced from a disconnected peer. Pairs are walked
    /// in id order, matching the lock order used everywhere else.
    pub async fn on_peer_disconnect(&self, peer_pub_key: &str) {
        let engines: Vec<(PairId, Arc<Mutex<MatchingEngine>>)> = {
            let pairs = self.inner.pairs.lock().expect("pair map poisoned");
            pairs.iter().map(|(id, e)| (id.clone(), e.clone())).collect()
        };
        for (pair_id, engine) in engines {
            let removed = {
                let mut engine = engine.lock().await;
                engine.remove_peer_orders(|o| o.peer_pub_key() == Some(peer_pub_key))
            };
            for order in removed {
                let _ = self.inner.events.send(OrderEvent::PeerInvalidation {
                    pair_id: pair_id.clone(),
                    order_id: order.id,
                    quantity: None,
                });
            }
        }
    }

    /// Drop own orders whose ttl has elapsed.
    pub async fn remove_expired(&self) {
        let now = monotonic_ms();
        let engines: Vec<(PairId, Arc<Mutex<MatchingEngine>>)> = {
            let pairs = self.inner.pairs.lock().expect("pair map poisoned");
            pairs.iter().map(|(id, e)| (id.clone(), e.clone())).collect()
        };
        for (pair_id, engine) in engines {
            let expired: Vec<(Uuid, String)> = {
                let engine = engine.lock().await;
                engine
                    .iter()
                    .filter(|o| o.hold == 0)
                    .filter_map(|o| match &o.source {
                        OrderSource::Own {
                            local_id,
                            ttl_ms: Some(ttl),
                        } if o.created_at.saturating_add(*ttl) <= now => {
                            Some((o.id, local_id.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            };
            for (_, local_id) in expired {
                match self.remove_own_order_by_local_id(&pair_id, &local_id).await {
                    Ok(order) => {
                        tracing::debug!(order = %order.id, pair = %pair_id, "own order expired");
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "expiry removal failed");
                    }
                }
            }
        }
    }

    /// Snapshot of our own resting orders for a `GetOrders` response.
    pub async fn own_orders_wire(&self) -> Vec<WireOrder> {
        let engines: Vec<Arc<Mutex<MatchingEngine>>> = {
            let pairs = self.inner.pairs.lock().expect("pair map poisoned");
            pairs.values().cloned().collect()
        };
        let mut out = Vec::new();
        for engine in engines {
            let engine = engine.lock().await;
            out.extend(engine.iter().filter(|o| o.is_own()).map(wire_order));
        }
        out
    }

    /// All resting orders, optionally restricted to one pair.
    pub async fn list_orders(&self, pair_id: Option<&str>) -> Result<Vec<Order>, BookError> {
        let engines: Vec<Arc<Mutex<MatchingEngine>>> = match pair_id {
            Some(pair_id) => vec![self.engine(pair_id)?],
            None => {
                let pairs = self.inner.pairs.lock().expect("pair map poisoned");
                pairs.values().cloned().collect()
            }
        };
        let mut out = Vec::new();
        for engine in engines {
            let engine = engine.lock().await;
            out.extend(engine.iter().cloned());
        }
        Ok(out)
    }

    fn engine(&self, pair_id: &str) -> Result<Arc<Mutex<MatchingEngine>>, BookError> {
        self.inner
            .pairs
            .lock()
            .expect("pair map poisoned")
            .get(pair_id)
            .cloned()
            .ok_or_else(|| BookError::UnknownPair(pair_id.to_string()))
    }

    fn release_local_id(&self, local_id: &str) {
        self.inner
            .local_ids
            .lock()
            .expect("local id map poisoned")
            .remove(local_id);
    }

    fn advertise_pairs(&self) {
        let pairs = self.pairs();
        self.inner.pool.set_pairs(pairs);
    }
}

fn wire_order(order: &Order) -> WireOrder {
    WireOrder {
        id: order.id,
        pair_id: order.pair_id.clone(),
        price: order.price.unwrap_or_default(),
        quantity: order.quantity,
        destination: None,
    }
}

#[async_trait]
impl OrderHolds for OrderBook {
    async fn currency(&self, symbol: &str) -> Option<Currency> {
        self.inner
            .currencies
            .lock()
            .expect("currency map poisoned")
            .get(symbol)
            .cloned()
    }

    async fn own_order(&self, pair_id: &str, order_id: &Uuid) -> Option<Order> {
        let engine = self.engine(pair_id).ok()?;
        let engine = engine.lock().await;
        engine.get(order_id).filter(|o| o.is_own()).cloned()
    }

    async fn reserve(&self, pair_id: &str, order_id: &Uuid, units: u64) -> anyhow::Result<()> {
        let engine = self
            .engine(pair_id)
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        let updated = {
            let mut engine = engine.lock().await;
            let order = engine
                .get(order_id)
                .filter(|o| o.is_own())
                .ok_or_else(|| anyhow::anyhow!("own order {order_id} not found"))?;
            anyhow::ensure!(
                order.available() >= units,
                "only {} of {} units available",
                order.available(),
                units
            );
            engine.adjust_hold(order_id, units as i64);
            engine.get(order_id).cloned()
        };
        if let Some(order) = updated {
            self.inner
                .store
                .lock()
                .expect("store mutex poisoned")
                .upsert_order(&order)?;
        }
        Ok(())
    }

    async fn release(&self, pair_id: &str, order_id: &Uuid, units: u64) -> anyhow::Result<()> {
        let engine = self
            .engine(pair_id)
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        let updated = {
            let mut engine = engine.lock().await;
            engine.adjust_hold(order_id, -(units as i64));
            engine.get(order_id).cloned()
        };
        if let Some(order) = updated {
            self.inner
                .store
                .lock()
                .expect("store mutex poisoned")
                .upsert_order(&order)?;
        }
        Ok(())
    }

    async fn consume(
        &self,
        pair_id: &str,
        order_id: &Uuid,
        units: u64,
        taker_peer: Option<&str>,
    ) -> anyhow::Result<()> {
        let engine = self
            .engine(pair_id)
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        let (order, removed) = {
            let mut engine = engine.lock().await;
            engine
                .consume(order_id, units)
                .ok_or_else(|| anyhow::anyhow!("own order {order_id} not found"))?
        };
        {
            let mut store = self.inner.store.lock().expect("store mutex poisoned");
            if removed {
                store.delete_order(order_id)?;
            } else {
                store.upsert_order(&order)?;
            }
        }
        if removed {
            if let Some(local_id) = order.local_id() {
                self.release_local_id(local_id);
            }
            let _ = self.inner.events.send(OrderEvent::OwnRemoved(order.clone()));
        }
        self.inner.pool.broadcast_order_invalidation(
            OrderInvalidation {
                order_id: *order_id,
                pair_id: pair_id.to_string(),
                quantity: Some(units),
            },
            taker_peer,
        );
        Ok(())
    }
}
