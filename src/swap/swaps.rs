//! The swap state machine: deal lifecycle from match to settlement, packet
//! handlers for both roles, per-phase timeouts and crash recovery.
//!
//! Protocol recap: the taker generates the preimage and reserves its
//! incoming payment before sending `SwapRequest`. The maker reserves its own
//! incoming payment, replies `SwapAccepted` and pays the first leg (taker
//! currency, the larger CLTV delta). The taker pays the second leg, settles
//! its incoming leg with the preimage, and that settlement resolves the
//! maker's outgoing payment, handing the maker the preimage for its own
//! incoming leg.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore as _;
use rust_decimal::Decimal;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::client::{PaymentError, PaymentRequest, PaymentState, SwapClientError};
use super::manager::SwapClientManager;
use super::{
    RHash, SwapDeal, SwapEvent, SwapFailure, SwapFailureReason, SwapPhase, SwapRole, SwapState,
    SwapSuccess,
};
use crate::constants::{CLTV_SAFETY_MARGIN, SWAP_PHASE_TIMEOUT};
use crate::market::{Currency, Order, Pair, PairId, Side, monotonic_ms, quote_units};
use crate::p2p::nodes::ReputationEvent;
use crate::p2p::packet::{self, Envelope, Packet};
use crate::p2p::{P2pError, Pool};
use crate::store::SqliteStore;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("unknown pair {0}")]
    UnknownPair(PairId),
    #[error("no swap client for currency {0}")]
    SwapClientUnavailable(String),
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),
    #[error("swap client returned no payment destination")]
    NoDestination,
    #[error("amount conversion overflowed")]
    AmountOverflow,
    #[error("deal {0} already exists")]
    DuplicateDeal(RHash),
    #[error("cannot swap against an order without a price")]
    MissingPrice,
    #[error(transparent)]
    Client(#[from] SwapClientError),
    #[error(transparent)]
    P2p(#[from] P2pError),
}

/// The order book surface swaps drives: hold bookkeeping on resting own
/// orders plus currency lookups. Implemented by `OrderBook`; keeping it a
/// trait breaks the ownership cycle between the two.
#[async_trait]
pub trait OrderHolds: Send + Sync {
    async fn currency(&self, symbol: &str) -> Option<Currency>;
    async fn own_order(&self, pair_id: &str, order_id: &Uuid) -> Option<Order>;
    async fn reserve(&self, pair_id: &str, order_id: &Uuid, units: u64) -> anyhow::Result<()>;
    async fn release(&self, pair_id: &str, order_id: &Uuid, units: u64) -> anyhow::Result<()>;
    /// Permanently consume held units after a completed swap. The taker
    /// peer already reduced its copy at match time and is excluded from the
    /// invalidation broadcast.
    async fn consume(
        &self,
        pair_id: &str,
        order_id: &Uuid,
        units: u64,
        taker_peer: Option<&str>,
    ) -> anyhow::Result<()>;
}

struct LegAmounts {
    taker_currency: String,
    maker_currency: String,
    taker_units: u64,
    maker_units: u64,
}

#[derive(Clone)]
pub struct Swaps {
    inner: Arc<SwapsInner>,
}

struct SwapsInner {
    store: Arc<Mutex<SqliteStore>>,
    pool: Pool,
    manager: Arc<SwapClientManager>,
    book: Arc<dyn OrderHolds>,
    deals: Mutex<HashMap<RHash, SwapDeal>>,
    /// Incoming HTLCs observed before the matching `SwapAccepted` arrived;
    /// the two race because they travel on different channels.
    pending_htlcs: Mutex<HashMap<RHash, (String, u64)>>,
    /// Deals inherited from a previous run that have no live driver task;
    /// the recovery scan owns them.
    recovery_queue: Mutex<HashSet<RHash>>,
    events: broadcast::Sender<SwapEvent>,
    phase_timeout: Duration,
}

impl Swaps {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        pool: Pool,
        manager: Arc<SwapClientManager>,
        book: Arc<dyn OrderHolds>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SwapsInner {
                store,
                pool,
                manager,
                book,
                deals: Mutex::new(HashMap::new()),
                pending_htlcs: Mutex::new(HashMap::new()),
                recovery_queue: Mutex::new(HashSet::new()),
                events,
                phase_timeout: SWAP_PHASE_TIMEOUT,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.inner.events.subscribe()
    }

    pub fn deal(&self, r_hash: &str) -> Option<SwapDeal> {
        self.inner
            .deals
            .lock()
            .expect("deal map poisoned")
            .get(r_hash)
            .cloned()
    }

    pub fn list_deals(&self) -> Vec<SwapDeal> {
        let mut out: Vec<SwapDeal> = self
            .inner
            .deals
            .lock()
            .expect("deal map poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    /// Re-populate the deal map with unresolved deals from the store. Call
    /// once at startup, before the recovery scan.
    pub fn load_deals(&self) -> anyhow::Result<usize> {
        let deals = self
            .inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_unresolved_deals()?;
        let count = deals.len();
        let mut map = self.inner.deals.lock().expect("deal map poisoned");
        let mut queue = self.inner.recovery_queue.lock().expect("recovery queue poisoned");
        for deal in deals {
            queue.insert(deal.r_hash.clone());
            map.entry(deal.r_hash.clone()).or_insert(deal);
        }
        Ok(count)
    }

    /// Taker entry point, called by the order book per match against a peer
    /// maker order while the pair lock is held. Reserves the incoming
    /// payment and sends `SwapRequest`; the rest of the deal is driven by
    /// packet and client events.
    pub async fn execute_deal(&self, taker: &Order, maker: &Order) -> Result<RHash, SwapError> {
        let peer_pub_key = maker
            .peer_pub_key()
            .ok_or_else(|| SwapError::PeerNotConnected("<own order>".into()))?
            .to_string();
        if !self.inner.pool.is_connected(&peer_pub_key) {
            return Err(SwapError::PeerNotConnected(peer_pub_key));
        }
        let price = maker.price.ok_or(SwapError::MissingPrice)?;
        let quantity = taker.magnitude();
        let legs = self
            .leg_amounts(&taker.pair_id, maker.side(), quantity, price)
            .await?;

        let incoming_client = self
            .inner
            .manager
            .get(&legs.taker_currency)
            .ok_or_else(|| SwapError::SwapClientUnavailable(legs.taker_currency.clone()))?;
        if self.inner.manager.get(&legs.maker_currency).is_none() {
            return Err(SwapError::SwapClientUnavailable(legs.maker_currency.clone()));
        }

        let (r_preimage, r_hash) = generate_preimage();
        if self.deal(&r_hash).is_some() {
            return Err(SwapError::DuplicateDeal(r_hash));
        }
        let taker_cltv_delta = incoming_client.cltv_delta();
        let taker_destination = incoming_client
            .add_invoice(&r_hash, legs.taker_units, taker_cltv_delta)
            .await?
            .ok_or(SwapError::NoDestination)?;

        let deal = SwapDeal {
            r_hash: r_hash.clone(),
            r_preimage: Some(r_preimage),
            role: SwapRole::Taker,
            phase: SwapPhase::Created,
            state: SwapState::Active,
            error: None,
            peer_pub_key: peer_pub_key.clone(),
            pair_id: taker.pair_id.clone(),
            quantity,
            price,
            taker_currency: legs.taker_currency,
            maker_currency: legs.maker_currency,
            taker_units: legs.taker_units,
            maker_units: legs.maker_units,
            taker_cltv_delta,
            maker_cltv_delta: 0,
            maker_order_id: maker.id,
            taker_order_id: taker.id,
            destination: None,
            hold_active: false,
            created_at: monotonic_ms(),
            executed_at: None,
            completed_at: None,
        };
        self.upsert_deal(deal);

        let request = Packet::SwapRequest(packet::SwapRequest {
            r_hash: r_hash.clone(),
            order_id: maker.id,
            pair_id: taker.pair_id.clone(),
            proposed_quantity: quantity,
            taker_cltv_delta,
            taker_destination,
        });
        if let Err(err) = self.inner.pool.send_to_peer(&peer_pub_key, Envelope::new(request)) {
            self.mutate_deal(&r_hash, |deal| {
                deal.state = SwapState::Error;
                deal.error = Some(err.to_string());
                deal.completed_at = Some(monotonic_ms());
            });
            let _ = incoming_client.remove_invoice(&r_hash).await;
            return Err(err.into());
        }

        self.set_phase(&r_hash, SwapPhase::SwapRequested);
        self.spawn_watchdog(r_hash.clone());
        tracing::info!(r_hash = %r_hash, pair = %taker.pair_id, quantity, "swap requested");
        Ok(r_hash)
    }

    /// Maker side of the handshake: validate, reserve the hold and our
    /// incoming payment, accept, then start paying the first leg.
    pub async fn handle_swap_request(
        &self,
        peer_pub_key: &str,
        request_id: Uuid,
        req: packet::SwapRequest,
    ) {
        let r_hash = req.r_hash.clone();
        if self.deal(&r_hash).is_some() {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::UnexpectedPacket,
                Some("duplicate r_hash".into()),
                Some(request_id),
            );
            return;
        }

        let Some(order) = self.inner.book.own_order(&req.pair_id, &req.order_id).await else {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::OrderNotFound,
                None,
                Some(request_id),
            );
            return;
        };
        let quantity = req.proposed_quantity.min(order.available());
        if quantity == 0 {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::InvalidQuantity,
                Some("no quantity available".into()),
                Some(request_id),
            );
            return;
        }
        let Some(price) = order.price else {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::UnknownError,
                Some("resting order has no price".into()),
                Some(request_id),
            );
            return;
        };

        let legs = match self
            .leg_amounts(&req.pair_id, order.side(), quantity, price)
            .await
        {
            Ok(legs) => legs,
            Err(err) => {
                self.send_swap_failed(
                    peer_pub_key,
                    &r_hash,
                    SwapFailureReason::UnknownError,
                    Some(err.to_string()),
                    Some(request_id),
                );
                return;
            }
        };

        let Some(incoming_client) = self.inner.manager.get(&legs.maker_currency) else {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::SwapClientUnavailable,
                Some(legs.maker_currency.clone()),
                Some(request_id),
            );
            return;
        };
        if self.inner.manager.get(&legs.taker_currency).is_none() {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::SwapClientUnavailable,
                Some(legs.taker_currency.clone()),
                Some(request_id),
            );
            return;
        }

        // the first leg must outlive the second by a safe margin
        let maker_cltv_delta = incoming_client.cltv_delta();
        if req.taker_cltv_delta <= maker_cltv_delta + CLTV_SAFETY_MARGIN {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::InsufficientCltvDelta,
                Some(format!(
                    "taker delta {} must exceed maker delta {} by more than {}",
                    req.taker_cltv_delta, maker_cltv_delta, CLTV_SAFETY_MARGIN
                )),
                Some(request_id),
            );
            return;
        }

        if let Err(err) = self
            .inner
            .book
            .reserve(&req.pair_id, &req.order_id, quantity)
            .await
        {
            self.send_swap_failed(
                peer_pub_key,
                &r_hash,
                SwapFailureReason::UnknownError,
                Some(err.to_string()),
                Some(request_id),
            );
            return;
        }

        let maker_destination = match incoming_client
            .add_invoice(&r_hash, legs.maker_units, maker_cltv_delta)
            .await
        {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                let _ = self.inner.book.release(&req.pair_id, &req.order_id, quantity).await;
                self.send_swap_failed(
                    peer_pub_key,
                    &r_hash,
                    SwapFailureReason::SwapClientUnavailable,
                    Some("no payment destination".into()),
                    Some(request_id),
                );
                return;
            }
            Err(err) => {
                let _ = self.inner.book.release(&req.pair_id, &req.order_id, quantity).await;
                self.send_swap_failed(
                    peer_pub_key,
                    &r_hash,
                    SwapFailureReason::SwapClientUnavailable,
                    Some(err.to_string()),
                    Some(request_id),
                );
                return;
            }
        };

        let deal = SwapDeal {
            r_hash: r_hash.clone(),
            r_preimage: None,
            role: SwapRole::Maker,
            phase: SwapPhase::Created,
            state: SwapState::Active,
            error: None,
            peer_pub_key: peer_pub_key.to_string(),
            pair_id: req.pair_id.clone(),
            quantity,
            price,
            taker_currency: legs.taker_currency,
            maker_currency: legs.maker_currency,
            taker_units: legs.taker_units,
            maker_units: legs.maker_units,
            taker_cltv_delta: req.taker_cltv_delta,
            maker_cltv_delta,
            maker_order_id: req.order_id,
            taker_order_id: Uuid::nil(),
            destination: Some(req.taker_destination),
            hold_active: true,
            created_at: monotonic_ms(),
            executed_at: None,
            completed_at: None,
        };
        self.upsert_deal(deal);

        let accepted = Packet::SwapAccepted(packet::SwapAccepted {
            r_hash: r_hash.clone(),
            quantity,
            maker_cltv_delta,
            maker_destination,
        });
        if self
            .inner
            .pool
            .send_to_peer(peer_pub_key, Envelope::response_to(accepted, request_id))
            .is_err()
        {
            self.fail_deal_safely(&r_hash, SwapFailureReason::UnknownError, "peer went away")
                .await;
            return;
        }

        self.set_phase(&r_hash, SwapPhase::SwapAccepted);
        self.spawn_watchdog(r_hash.clone());
        tracing::info!(r_hash = %r_hash, pair = %req.pair_id, quantity, "swap accepted");

        let swaps = self.clone();
        tokio::spawn(async move {
            swaps.send_first_leg(r_hash).await;
        });
    }

    /// Taker reaction to `SwapAccepted`: record the maker's terms and wait
    /// for the incoming HTLC.
    pub async fn handle_swap_accepted(&self, peer_pub_key: &str, acc: packet::SwapAccepted) {
        let Some(deal) = self.deal(&acc.r_hash) else {
            tracing::debug!(r_hash = %acc.r_hash, "swap accepted for unknown deal");
            return;
        };
        if deal.role != SwapRole::Taker
            || deal.phase != SwapPhase::SwapRequested
            || deal.peer_pub_key != peer_pub_key
        {
            tracing::debug!(r_hash = %acc.r_hash, "unexpected swap accepted");
            return;
        }
        if acc.quantity > deal.quantity || acc.quantity == 0 {
            self.fail_deal_safely(
                &acc.r_hash,
                SwapFailureReason::InvalidQuantity,
                "accepted quantity out of range",
            )
            .await;
            return;
        }
        if acc.maker_cltv_delta + CLTV_SAFETY_MARGIN >= deal.taker_cltv_delta {
            self.fail_deal_safely(
                &acc.r_hash,
                SwapFailureReason::InsufficientCltvDelta,
                "maker cltv delta leaves no safety margin",
            )
            .await;
            return;
        }

        // the maker may accept less than we proposed
        let (taker_units, maker_units) = if acc.quantity < deal.quantity {
            match self
                .leg_amounts(&deal.pair_id, maker_side(&deal), acc.quantity, deal.price)
                .await
            {
                Ok(legs) => (legs.taker_units, legs.maker_units),
                Err(err) => {
                    self.fail_deal_safely(
                        &acc.r_hash,
                        SwapFailureReason::UnknownError,
                        &err.to_string(),
                    )
                    .await;
                    return;
                }
            }
        } else {
            (deal.taker_units, deal.maker_units)
        };

        self.mutate_deal(&acc.r_hash, |deal| {
            deal.quantity = acc.quantity;
            deal.taker_units = taker_units;
            deal.maker_units = maker_units;
            deal.maker_cltv_delta = acc.maker_cltv_delta;
            deal.destination = Some(acc.maker_destination.clone());
        });
        self.set_phase(&acc.r_hash, SwapPhase::SwapAccepted);

        // the maker's first leg may have landed before its accept packet
        let stashed = self
            .inner
            .pending_htlcs
            .lock()
            .expect("pending htlc map poisoned")
            .remove(&acc.r_hash);
        if let Some((currency, units)) = stashed {
            self.handle_htlc_accepted(&currency, &acc.r_hash, units).await;
        }
    }

    /// An incoming payment locked to a known hash was observed by a client.
    /// For the taker this is the trigger to pay the second leg and settle.
    pub async fn handle_htlc_accepted(&self, currency: &str, r_hash: &str, units: u64) {
        let Some(deal) = self.deal(r_hash) else {
            tracing::debug!(%r_hash, %currency, "htlc accepted for unknown hash");
            return;
        };
        match deal.role {
            SwapRole::Maker => {
                // the taker's leg locking in requires no action from us; our
                // settlement happens once the preimage is learned
                tracing::debug!(%r_hash, %currency, "incoming maker leg locked");
            }
            SwapRole::Taker => {
                if deal.phase < SwapPhase::SwapAccepted {
                    // the accept packet is still in flight; replayed once it
                    // arrives
                    self.inner
                        .pending_htlcs
                        .lock()
                        .expect("pending htlc map poisoned")
                        .insert(r_hash.to_string(), (currency.to_string(), units));
                    return;
                }
                if deal.phase != SwapPhase::SwapAccepted {
                    tracing::debug!(%r_hash, phase = ?deal.phase, "htlc accepted out of phase");
                    return;
                }
                if currency != deal.taker_currency || units < deal.taker_units {
                    tracing::warn!(
                        %r_hash,
                        %currency,
                        units,
                        expected = deal.taker_units,
                        "incoming htlc does not match the deal"
                    );
                    return;
                }
                let swaps = self.clone();
                let r_hash = r_hash.to_string();
                tokio::spawn(async move {
                    swaps.send_second_leg(r_hash).await;
                });
            }
        }
    }

    pub async fn handle_swap_failed(&self, peer_pub_key: &str, failed: packet::SwapFailed) {
        let Some(deal) = self.deal(&failed.r_hash) else {
            tracing::debug!(r_hash = %failed.r_hash, "swap failed for unknown deal");
            return;
        };
        if deal.peer_pub_key != peer_pub_key || deal.state != SwapState::Active {
            return;
        }
        tracing::warn!(
            r_hash = %failed.r_hash,
            reason = ?failed.reason,
            message = failed.message.as_deref().unwrap_or(""),
            "peer failed the swap"
        );
        // past the payment phase our funds may be in flight; let recovery
        // decide instead of trusting the peer's word
        if deal.phase >= SwapPhase::SendingPayment {
            self.mutate_deal(&failed.r_hash, |deal| {
                deal.state = SwapState::Error;
                deal.error = Some(format!("peer reported failure: {:?}", failed.reason));
            });
            return;
        }
        self.abandon_deal(&deal, failed.reason, "peer failed the swap").await;
    }

    pub async fn handle_swap_complete(&self, peer_pub_key: &str, complete: packet::SwapComplete) {
        let Some(deal) = self.deal(&complete.r_hash) else {
            return;
        };
        if deal.peer_pub_key == peer_pub_key {
            tracing::debug!(r_hash = %complete.r_hash, "peer reported swap complete");
        }
    }

    /// Maker first leg: pay the taker and settle our own incoming leg with
    /// the preimage the settlement reveals.
    async fn send_first_leg(&self, r_hash: RHash) {
        let Some(deal) = self.deal(&r_hash) else {
            return;
        };
        debug_assert_eq!(deal.role, SwapRole::Maker);
        let Some(outgoing_client) = self.inner.manager.get(&deal.taker_currency) else {
            self.fail_deal_safely(
                &r_hash,
                SwapFailureReason::SwapClientUnavailable,
                "outgoing client disappeared",
            )
            .await;
            return;
        };
        let Some(request) = PaymentRequest::from_deal(&deal) else {
            self.fail_deal_safely(&r_hash, SwapFailureReason::UnknownError, "no destination")
                .await;
            return;
        };

        self.inner
            .manager
            .check_trading_balance(&deal.taker_currency, deal.taker_units)
            .await;
        self.set_phase(&r_hash, SwapPhase::SendingPayment);

        match outgoing_client.send_payment(request).await {
            Ok(preimage) => {
                if !preimage_matches(&preimage, &r_hash) {
                    tracing::error!(%r_hash, "settled preimage does not match hash");
                    let _ = self
                        .inner
                        .pool
                        .add_reputation_event(&deal.peer_pub_key, ReputationEvent::SwapFault);
                    self.mutate_deal(&r_hash, |deal| {
                        deal.state = SwapState::Error;
                        deal.error = Some("preimage mismatch".into());
                    });
                    return;
                }
                self.mutate_deal(&r_hash, |deal| {
                    deal.r_preimage = Some(preimage.clone());
                });
                self.set_phase(&r_hash, SwapPhase::PaymentReceived);
                self.settle_incoming_and_complete(&r_hash, &preimage).await;
            }
            Err(PaymentError::Final(message)) => {
                tracing::warn!(%r_hash, %message, "first leg payment failed");
                let peer = deal.peer_pub_key.clone();
                self.abandon_deal(&deal, SwapFailureReason::PaymentFailed, &message).await;
                self.send_swap_failed(
                    &peer,
                    &r_hash,
                    SwapFailureReason::PaymentFailed,
                    Some(message),
                    None,
                );
            }
            Err(PaymentError::Unknown(message)) => {
                // never retried; the recovery scan resolves it
                tracing::warn!(%r_hash, %message, "first leg payment state unknown");
                self.mutate_deal(&r_hash, |deal| {
                    deal.state = SwapState::Error;
                    deal.error = Some(message.clone());
                });
                self.emit_failure(&r_hash, SwapFailureReason::PaymentUnknown, Some(message));
            }
        }
    }

    /// Taker second leg: dispatch the payment to the maker, then settle our
    /// incoming leg with the preimage we generated, which unlocks the whole
    /// deal.
    async fn send_second_leg(&self, r_hash: RHash) {
        let Some(deal) = self.deal(&r_hash) else {
            return;
        };
        debug_assert_eq!(deal.role, SwapRole::Taker);
        let Some(preimage) = deal.r_preimage.clone() else {
            tracing::error!(%r_hash, "taker deal lost its preimage");
            return;
        };
        let Some(outgoing_client) = self.inner.manager.get(&deal.maker_currency) else {
            self.fail_deal_safely(
                &r_hash,
                SwapFailureReason::SwapClientUnavailable,
                "outgoing client disappeared",
            )
            .await;
            return;
        };
        let Some(incoming_client) = self.inner.manager.get(&deal.taker_currency) else {
            self.fail_deal_safely(
                &r_hash,
                SwapFailureReason::SwapClientUnavailable,
                "incoming client disappeared",
            )
            .await;
            return;
        };
        let Some(request) = PaymentRequest::from_deal(&deal) else {
            self.fail_deal_safely(&r_hash, SwapFailureReason::UnknownError, "no destination")
                .await;
            return;
        };

        self.inner
            .manager
            .check_trading_balance(&deal.maker_currency, deal.maker_units)
            .await;
        self.set_phase(&r_hash, SwapPhase::SendingPayment);

        // the outgoing payment only resolves after the maker settles it,
        // which requires the preimage we are about to reveal, so the two
        // must run concurrently
        let payment = {
            let client = outgoing_client.clone();
            tokio::spawn(async move { client.send_payment(request).await })
        };

        if let Err(err) = incoming_client.settle_invoice(&r_hash, &preimage).await {
            tracing::warn!(%r_hash, error = %err, "settling incoming leg failed");
            // the preimage is still ours; recovery can settle later
        }

        match payment.await {
            Ok(Ok(settled_preimage)) => {
                if settled_preimage != preimage {
                    tracing::warn!(%r_hash, "outgoing settlement revealed a different preimage");
                }
                self.set_phase(&r_hash, SwapPhase::PaymentReceived);
                self.complete_deal(&r_hash, &preimage, SwapState::Completed).await;
                let _ = self.inner.pool.send_to_peer(
                    &deal.peer_pub_key,
                    Envelope::new(Packet::SwapComplete(packet::SwapComplete {
                        r_hash: r_hash.clone(),
                    })),
                );
            }
            Ok(Err(PaymentError::Final(message))) => {
                tracing::warn!(%r_hash, %message, "second leg payment failed");
                self.mutate_deal(&r_hash, |deal| {
                    deal.state = SwapState::Error;
                    deal.error = Some(message.clone());
                });
                self.emit_failure(&r_hash, SwapFailureReason::PaymentFailed, Some(message.clone()));
                self.send_swap_failed(
                    &deal.peer_pub_key,
                    &r_hash,
                    SwapFailureReason::PaymentFailed,
                    Some(message),
                    None,
                );
            }
            Ok(Err(PaymentError::Unknown(message))) => {
                tracing::warn!(%r_hash, %message, "second leg payment state unknown");
                self.mutate_deal(&r_hash, |deal| {
                    deal.state = SwapState::Error;
                    deal.error = Some(message.clone());
                });
                self.emit_failure(&r_hash, SwapFailureReason::PaymentUnknown, Some(message));
            }
            Err(err) => {
                tracing::error!(%r_hash, error = %err, "payment task aborted");
                self.mutate_deal(&r_hash, |deal| {
                    deal.state = SwapState::Error;
                    deal.error = Some(err.to_string());
                });
            }
        }
    }

    /// Settle the maker's incoming leg and finish the deal.
    async fn settle_incoming_and_complete(&self, r_hash: &str, preimage: &str) {
        let Some(deal) = self.deal(r_hash) else {
            return;
        };
        let Some(incoming_client) = self.inner.manager.get(deal.incoming_currency()) else {
            self.mutate_deal(r_hash, |deal| {
                deal.state = SwapState::Error;
                deal.error = Some("incoming client disappeared".into());
            });
            return;
        };
        if let Err(err) = incoming_client.settle_invoice(r_hash, preimage).await {
            tracing::warn!(%r_hash, error = %err, "settling incoming leg failed; leaving to recovery");
            self.mutate_deal(r_hash, |deal| {
                deal.state = SwapState::Error;
                deal.error = Some(err.to_string());
            });
            return;
        }
        self.complete_deal(r_hash, preimage, SwapState::Completed).await;
    }

    /// Terminal success: consume maker holds, persist, notify.
    async fn complete_deal(&self, r_hash: &str, preimage: &str, state: SwapState) {
        let Some(deal) = self.deal(r_hash) else {
            return;
        };
        if deal.state.is_terminal() {
            return;
        }
        if deal.role == SwapRole::Maker && deal.hold_active {
            if let Err(err) = self
                .inner
                .book
                .consume(
                    &deal.pair_id,
                    &deal.maker_order_id,
                    deal.quantity,
                    Some(&deal.peer_pub_key),
                )
                .await
            {
                tracing::warn!(%r_hash, error = %err, "consuming held quantity failed");
            }
        }
        let updated = self.mutate_deal(r_hash, |deal| {
            deal.r_preimage = Some(preimage.to_string());
            deal.phase = SwapPhase::SwapCompleted;
            deal.state = state;
            deal.hold_active = false;
            deal.completed_at = Some(monotonic_ms());
        });
        let _ = self
            .inner
            .pool
            .add_reputation_event(&deal.peer_pub_key, ReputationEvent::SwapSuccess);
        if let Some(deal) = updated {
            tracing::info!(
                r_hash = %r_hash,
                pair = %deal.pair_id,
                role = ?deal.role,
                quantity = deal.quantity,
                "swap completed"
            );
            let _ = self.inner.events.send(SwapEvent::Success(SwapSuccess {
                r_hash: deal.r_hash.clone(),
                pair_id: deal.pair_id.clone(),
                role: deal.role,
                quantity: deal.quantity,
                price: deal.price,
                peer_pub_key: deal.peer_pub_key.clone(),
                r_preimage: preimage.to_string(),
            }));
        }
    }

    /// Fail a deal that has not put any funds in flight: release holds,
    /// cancel the reserved incoming payment, mark it resolved.
    async fn abandon_deal(&self, deal: &SwapDeal, reason: SwapFailureReason, message: &str) {
        if deal.role == SwapRole::Maker && deal.hold_active {
            if let Err(err) = self
                .inner
                .book
                .release(&deal.pair_id, &deal.maker_order_id, deal.quantity)
                .await
            {
                tracing::warn!(r_hash = %deal.r_hash, error = %err, "releasing hold failed");
            }
        }
        if let Some(client) = self.inner.manager.get(deal.incoming_currency()) {
            let _ = client.remove_invoice(&deal.r_hash).await;
        }
        self.mutate_deal(&deal.r_hash, |deal| {
            deal.state = SwapState::Error;
            deal.error = Some(message.to_string());
            deal.hold_active = false;
            deal.completed_at = Some(monotonic_ms());
        });
        self.emit_failure(&deal.r_hash, reason, Some(message.to_string()));
    }

    async fn fail_deal_safely(&self, r_hash: &str, reason: SwapFailureReason, message: &str) {
        if let Some(deal) = self.deal(r_hash) {
            self.abandon_deal(&deal, reason, message).await;
        }
    }

    /// Abort deals that stop making progress. Phases before any outgoing
    /// payment fail safely; later phases go to recovery.
    fn spawn_watchdog(&self, r_hash: RHash) {
        let swaps = self.clone();
        tokio::spawn(async move {
            let mut last_phase = None;
            loop {
                tokio::time::sleep(swaps.inner.phase_timeout).await;
                let Some(deal) = swaps.deal(&r_hash) else {
                    break;
                };
                if deal.state != SwapState::Active || deal.phase == SwapPhase::SwapCompleted {
                    break;
                }
                if last_phase != Some(deal.phase) {
                    last_phase = Some(deal.phase);
                    continue;
                }
                tracing::warn!(%r_hash, phase = ?deal.phase, "swap timed out");
                if deal.phase < SwapPhase::SendingPayment {
                    let peer = deal.peer_pub_key.clone();
                    swaps
                        .abandon_deal(&deal, SwapFailureReason::Timeout, "phase timeout")
                        .await;
                    swaps.send_swap_failed(
                        &peer,
                        &r_hash,
                        SwapFailureReason::Timeout,
                        None,
                        None,
                    );
                } else {
                    swaps.mutate_deal(&r_hash, |deal| {
                        deal.state = SwapState::Error;
                        deal.error = Some("phase timeout".into());
                    });
                }
                break;
            }
        });
    }

    /// Spawn the periodic recovery scan.
    pub fn spawn_recovery(&self, interval: Duration) -> JoinHandle<()> {
        let swaps = self.clone();
        tokio::spawn(async move {
            loop {
                swaps.recover_deals().await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Resolve every unresolved deal: look up the payment we sent and, when
    /// it turns out settled, settle the leg we hold with the preimage that
    /// lookup revealed. Idempotent: resolved deals are marked and skipped.
    pub async fn recover_deals(&self) {
        let candidates: Vec<SwapDeal> = {
            let deals = self.inner.deals.lock().expect("deal map poisoned");
            let queue = self.inner.recovery_queue.lock().expect("recovery queue poisoned");
            deals
                .values()
                .filter(|d| needs_recovery(d) || queue.contains(&d.r_hash))
                .filter(|d| !d.state.is_terminal() && d.completed_at.is_none())
                .cloned()
                .collect()
        };
        for deal in candidates {
            let r_hash = deal.r_hash.clone();
            self.resolve_deal(deal).await;
            // keep re-checking deals that are still pending
            let resolved = self
                .deal(&r_hash)
                .map(|d| d.state.is_terminal() || d.completed_at.is_some())
                .unwrap_or(true);
            if resolved {
                self.inner
                    .recovery_queue
                    .lock()
                    .expect("recovery queue poisoned")
                    .remove(&r_hash);
            }
        }
    }

    async fn resolve_deal(&self, deal: SwapDeal) {
        let r_hash = deal.r_hash.clone();
        // nothing was sent before SendingPayment; the deal can be failed
        // without consulting the clients
        if deal.phase < SwapPhase::SendingPayment {
            tracing::info!(%r_hash, phase = ?deal.phase, "recovering deal that never paid");
            self.abandon_deal(&deal, SwapFailureReason::Timeout, "recovered before payment")
                .await;
            return;
        }

        let Some(outgoing_client) = self.inner.manager.get(deal.outgoing_currency()) else {
            tracing::warn!(%r_hash, currency = deal.outgoing_currency(), "no client for recovery");
            return;
        };
        match outgoing_client.lookup_payment(&r_hash).await {
            Ok(PaymentState::Succeeded { preimage }) => {
                if !preimage_matches(&preimage, &r_hash) {
                    tracing::error!(%r_hash, "recovered preimage does not match hash");
                    return;
                }
                tracing::info!(%r_hash, "recovery found settled outgoing payment");
                let Some(incoming_client) = self.inner.manager.get(deal.incoming_currency())
                else {
                    return;
                };
                if let Err(err) = incoming_client.settle_invoice(&r_hash, &preimage).await {
                    // try again on the next scan
                    tracing::warn!(%r_hash, error = %err, "recovery settle failed");
                    return;
                }
                self.complete_deal(&r_hash, &preimage, SwapState::Recovered).await;
            }
            Ok(PaymentState::Failed) => {
                tracing::info!(%r_hash, "recovery found failed outgoing payment");
                self.abandon_deal(&deal, SwapFailureReason::PaymentFailed, "payment failed")
                    .await;
            }
            Ok(PaymentState::Pending) => {
                tracing::debug!(%r_hash, "outgoing payment still pending");
            }
            Err(err) => {
                tracing::debug!(%r_hash, error = %err, "recovery lookup failed");
            }
        }
    }

    async fn leg_amounts(
        &self,
        pair_id: &str,
        maker_side: Side,
        quantity: u64,
        price: Decimal,
    ) -> Result<LegAmounts, SwapError> {
        let pair = Pair::from_id(pair_id)
            .ok_or_else(|| SwapError::UnknownPair(pair_id.to_string()))?;
        let base = self
            .inner
            .book
            .currency(&pair.base)
            .await
            .ok_or_else(|| SwapError::UnknownPair(pair_id.to_string()))?;
        let quote = self
            .inner
            .book
            .currency(&pair.quote)
            .await
            .ok_or_else(|| SwapError::UnknownPair(pair_id.to_string()))?;
        let quote_amount = quote_units(quantity, price, base.decimal_places, quote.decimal_places)
            .ok_or(SwapError::AmountOverflow)?;

        // the maker pays out what it sells; the taker receives it
        Ok(match maker_side {
            Side::Sell => LegAmounts {
                taker_currency: base.symbol,
                maker_currency: quote.symbol,
                taker_units: quantity,
                maker_units: quote_amount,
            },
            Side::Buy => LegAmounts {
                taker_currency: quote.symbol,
                maker_currency: base.symbol,
                taker_units: quote_amount,
                maker_units: quantity,
            },
        })
    }

    fn upsert_deal(&self, deal: SwapDeal) {
        self.persist(&deal);
        self.inner
            .deals
            .lock()
            .expect("deal map poisoned")
            .insert(deal.r_hash.clone(), deal);
    }

    fn mutate_deal(&self, r_hash: &str, mutate: impl FnOnce(&mut SwapDeal)) -> Option<SwapDeal> {
        let updated = {
            let mut deals = self.inner.deals.lock().expect("deal map poisoned");
            let deal = deals.get_mut(r_hash)?;
            mutate(deal);
            deal.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    fn set_phase(&self, r_hash: &str, phase: SwapPhase) -> Option<SwapDeal> {
        self.mutate_deal(r_hash, |deal| {
            deal.phase = phase;
            if phase == SwapPhase::SendingPayment && deal.executed_at.is_none() {
                deal.executed_at = Some(monotonic_ms());
            }
        })
    }

    fn persist(&self, deal: &SwapDeal) {
        if let Err(err) = self
            .inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .upsert_deal(deal)
        {
            tracing::error!(r_hash = %deal.r_hash, error = %err, "failed to persist deal");
        }
    }

    fn send_swap_failed(
        &self,
        peer_pub_key: &str,
        r_hash: &str,
        reason: SwapFailureReason,
        message: Option<String>,
        req_id: Option<Uuid>,
    ) {
        let packet = Packet::SwapFailed(packet::SwapFailed {
            r_hash: r_hash.to_string(),
            reason,
            message,
        });
        let envelope = match req_id {
            Some(req_id) => Envelope::response_to(packet, req_id),
            None => Envelope::new(packet),
        };
        if let Err(err) = self.inner.pool.send_to_peer(peer_pub_key, envelope) {
            tracing::debug!(peer = %peer_pub_key, error = %err, "could not send swap failure");
        }
    }

    fn emit_failure(&self, r_hash: &str, reason: SwapFailureReason, message: Option<String>) {
        let Some(deal) = self.deal(r_hash) else {
            return;
        };
        let _ = self.inner.events.send(SwapEvent::Failure(SwapFailure {
            r_hash: r_hash.to_string(),
            pair_id: deal.pair_id,
            reason,
            message,
            peer_pub_key: deal.peer_pub_key,
        }));
    }
}

fn needs_recovery(deal: &SwapDeal) -> bool {
    if deal.state.is_terminal() || deal.completed_at.is_some() {
        return false;
    }
    deal.state == SwapState::Error
}

/// The taker receives what the maker sells, so the maker's side follows
/// from which currency the deal routes to the taker.
fn maker_side(deal: &SwapDeal) -> Side {
    match Pair::from_id(&deal.pair_id) {
        Some(pair) if pair.base == deal.taker_currency => Side::Sell,
        _ => Side::Buy,
    }
}

pub fn generate_preimage() -> (String, RHash) {
    let mut preimage = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut preimage);
    let r_hash = Sha256::digest(preimage);
    (hex::encode(preimage), hex::encode(r_hash))
}

pub fn preimage_matches(preimage_hex: &str, r_hash_hex: &str) -> bool {
    let Ok(preimage) = hex::decode(preimage_hex) else {
        return false;
    };
    hex::encode(Sha256::digest(&preimage)) == r_hash_hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_generation_round_trips() {
        let (preimage, r_hash) = generate_preimage();
        assert_eq!(preimage.len(), 64);
        assert_eq!(r_hash.len(), 64);
        assert!(preimage_matches(&preimage, &r_hash));
        assert!(!preimage_matches(&preimage, &"00".repeat(32)));
        assert!(!preimage_matches("zz", &r_hash));
    }
}
