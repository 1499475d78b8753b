//! Price/time-priority matching for a single pair.
//!
//! Each side is a ladder of price levels: bids keyed by `Reverse(price)` so
//! the highest bid is first, asks keyed by price so the lowest ask is first.
//! Orders within a level are kept in `created_at` order. An id index maps
//! every resting order to its side and price for O(log n) removal.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::{Order, PairId, Side};

#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("cannot split {target} units from an order of {parent} units")]
    InvalidSplit { target: u64, parent: u64 },
    #[error("order {0} is already queued")]
    DuplicateOrder(Uuid),
}

/// A single match between a resting maker order and an incoming taker order.
/// Both sides are quantity-`matched` snapshots of their parents.
#[derive(Debug, Clone)]
pub struct OrderMatch {
    pub maker: Order,
    pub taker: Order,
}

impl OrderMatch {
    pub fn quantity(&self) -> u64 {
        self.maker.magnitude()
    }
}

#[derive(Debug, Default)]
pub struct MatchResult {
    pub matches: Vec<OrderMatch>,
    /// The unmatched residual, already queued unless it was discarded or a
    /// market order.
    pub remaining: Option<Order>,
}

#[derive(Debug)]
struct PriceLevel {
    orders: VecDeque<Order>,
}

impl PriceLevel {
    fn new() -> Self {
        Self {
            orders: VecDeque::new(),
        }
    }

    /// Insert keeping the level sorted by `created_at`, oldest first.
    fn insert(&mut self, order: Order) {
        let pos = self
            .orders
            .iter()
            .rposition(|o| o.created_at <= order.created_at)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.orders.insert(pos, order);
    }

    fn remove(&mut self, id: &Uuid) -> Option<Order> {
        let pos = self.orders.iter().position(|o| o.id == *id)?;
        self.orders.remove(pos)
    }
}

/// The matching engine for one pair. Synchronous; callers serialize access
/// through the per-pair lock.
#[derive(Debug)]
pub struct MatchingEngine {
    pub pair_id: PairId,
    buys: BTreeMap<Reverse<Decimal>, PriceLevel>,
    sells: BTreeMap<Decimal, PriceLevel>,
    index: HashMap<Uuid, (Side, Decimal)>,
}

impl MatchingEngine {
    pub fn new(pair_id: PairId) -> Self {
        Self {
            pair_id,
            buys: BTreeMap::new(),
            sells: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    /// Highest resting buy, if any.
    pub fn best_buy(&self) -> Option<&Order> {
        self.buys.values().next().and_then(|l| l.orders.front())
    }

    /// Lowest resting sell, if any.
    pub fn best_sell(&self) -> Option<&Order> {
        self.sells.values().next().and_then(|l| l.orders.front())
    }

    pub fn get(&self, id: &Uuid) -> Option<&Order> {
        let (side, price) = self.index.get(id)?;
        let level = match side {
            Side::Buy => self.buys.get(&Reverse(*price))?,
            Side::Sell => self.sells.get(price)?,
        };
        level.orders.iter().find(|o| o.id == *id)
    }

    /// Cross `taker` against the opposite side, splitting whichever side of
    /// each match is larger, until the taker is exhausted or no crossable
    /// head remains. The residual is queued on the taker's side unless
    /// `discard_remaining` is set or the order is a market order.
    pub fn match_or_add_own_order(
        &mut self,
        mut taker: Order,
        discard_remaining: bool,
    ) -> Result<MatchResult, MatchingError> {
        debug_assert!(taker.is_own());
        if self.index.contains_key(&taker.id) {
            return Err(MatchingError::DuplicateOrder(taker.id));
        }

        let mut matches = Vec::new();
        while taker.magnitude() > 0 {
            let Some(maker_head) = self.head_of(taker.side().opposite()) else {
                break;
            };
            if !crosses(&taker, &maker_head) {
                break;
            }

            let matched = taker.magnitude().min(maker_head.magnitude());
            let maker_target = split(&maker_head, matched)?;
            let taker_target = split(&taker, matched)?;
            self.reduce_head(taker.side().opposite(), matched);
            reduce(&mut taker, matched);
            matches.push(OrderMatch {
                maker: maker_target,
                taker: taker_target,
            });
        }

        let remaining = if taker.magnitude() > 0 && !discard_remaining {
            if let Some(price) = taker.price {
                self.enqueue(taker.clone(), price)?;
                Some(taker)
            } else {
                // a market order can never rest
                None
            }
        } else {
            None
        };

        Ok(MatchResult { matches, remaining })
    }

    pub fn add_peer_order(&mut self, order: Order) -> Result<(), MatchingError> {
        debug_assert!(!order.is_own());
        if self.index.contains_key(&order.id) {
            return Err(MatchingError::DuplicateOrder(order.id));
        }
        let Some(price) = order.price else {
            // peer market orders are rejected at import, defensively dropped here
            return Ok(());
        };
        self.enqueue(order, price)
    }

    /// Remove a resting own order. Returns `None` if the id is unknown or
    /// belongs to a peer order.
    pub fn remove_own_order(&mut self, id: &Uuid) -> Option<Order> {
        if !self.get(id)?.is_own() {
            return None;
        }
        self.remove(id)
    }

    /// Remove a peer order, or decrement it by `decrease_by` units. Returns
    /// the removed portion as a snapshot.
    pub fn remove_peer_order(&mut self, id: &Uuid, decrease_by: Option<u64>) -> Option<Order> {
        if self.get(id)?.is_own() {
            return None;
        }
        match decrease_by {
            None => self.remove(id),
            Some(units) => {
                let order = self.order_mut(id)?;
                if units >= order.magnitude() {
                    return self.remove(id);
                }
                let removed = split(order, units).ok()?;
                reduce(order, units);
                Some(removed)
            }
        }
    }

    /// Bulk-remove every peer order matching `predicate`. Used when a peer
    /// disconnects.
    pub fn remove_peer_orders(&mut self, predicate: impl Fn(&Order) -> bool) -> Vec<Order> {
        let ids: Vec<Uuid> = self
            .index
            .keys()
            .copied()
            .filter(|id| {
                self.get(id)
                    .map(|o| !o.is_own() && predicate(o))
                    .unwrap_or(false)
            })
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Adjust the hold on a resting order. `delta` is signed; the result is
    /// clamped into `0..=magnitude`.
    pub fn adjust_hold(&mut self, id: &Uuid, delta: i64) -> Option<u64> {
        let order = self.order_mut(id)?;
        let hold = order.hold.saturating_add_signed(delta).min(order.magnitude());
        order.hold = hold;
        Some(hold)
    }

    /// Permanently consume `units` of a resting order, releasing the same
    /// amount of hold. Returns the order state after consumption and whether
    /// it was removed entirely.
    pub fn consume(&mut self, id: &Uuid, units: u64) -> Option<(Order, bool)> {
        let order = self.order_mut(id)?;
        if units >= order.magnitude() {
            return self.remove(id).map(|o| (o, true));
        }
        reduce(order, units);
        order.hold = order.hold.saturating_sub(units);
        Some((order.clone(), false))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.buys
            .values()
            .flat_map(|l| l.orders.iter())
            .chain(self.sells.values().flat_map(|l| l.orders.iter()))
    }

    fn enqueue(&mut self, order: Order, price: Decimal) -> Result<(), MatchingError> {
        self.index.insert(order.id, (order.side(), price));
        match order.side() {
            Side::Buy => self
                .buys
                .entry(Reverse(price))
                .or_insert_with(PriceLevel::new)
                .insert(order),
            Side::Sell => self
                .sells
                .entry(price)
                .or_insert_with(PriceLevel::new)
                .insert(order),
        }
        Ok(())
    }

    fn head_of(&self, side: Side) -> Option<Order> {
        match side {
            Side::Buy => self.best_buy().cloned(),
            Side::Sell => self.best_sell().cloned(),
        }
    }

    fn reduce_head(&mut self, side: Side, units: u64) {
        let (price, done) = match side {
            Side::Buy => {
                let (key, level) = self
                    .buys
                    .iter_mut()
                    .next()
                    .expect("reduce_head on empty side");
                let head = level.orders.front_mut().expect("empty price level");
                reduce(head, units);
                let id = head.id;
                let exhausted = head.magnitude() == 0;
                if exhausted {
                    level.orders.pop_front();
                    self.index.remove(&id);
                }
                (key.0, exhausted && level.orders.is_empty())
            }
            Side::Sell => {
                let (key, level) = self
                    .sells
                    .iter_mut()
                    .next()
                    .expect("reduce_head on empty side");
                let head = level.orders.front_mut().expect("empty price level");
                reduce(head, units);
                let id = head.id;
                let exhausted = head.magnitude() == 0;
                if exhausted {
                    level.orders.pop_front();
                    self.index.remove(&id);
                }
                (*key, exhausted && level.orders.is_empty())
            }
        };
        if done {
            match side {
                Side::Buy => self.buys.remove(&Reverse(price)),
                Side::Sell => self.sells.remove(&price),
            };
        }
    }

    fn remove(&mut self, id: &Uuid) -> Option<Order> {
        let (side, price) = self.index.remove(id)?;
        match side {
            Side::Buy => {
                let level = self.buys.get_mut(&Reverse(price))?;
                let order = level.remove(id);
                if level.orders.is_empty() {
                    self.buys.remove(&Reverse(price));
                }
                order
            }
            Side::Sell => {
                let level = self.sells.get_mut(&price)?;
                let order = level.remove(id);
                if level.orders.is_empty() {
                    self.sells.remove(&price);
                }
                order
            }
        }
    }

    fn order_mut(&mut self, id: &Uuid) -> Option<&mut Order> {
        let (side, price) = self.index.get(id)?;
        let level = match side {
            Side::Buy => self.buys.get_mut(&Reverse(*price))?,
            Side::Sell => self.sells.get_mut(price)?,
        };
        level.orders.iter_mut().find(|o| o.id == *id)
    }
}

/// A buy at `p_b` crosses a sell at `p_s` iff `p_b >= p_s`. Market orders
/// cross any price.
fn crosses(taker: &Order, maker: &Order) -> bool {
    let Some(maker_price) = maker.price else {
        return false;
    };
    match (taker.side(), taker.price) {
        (_, None) => true,
        (Side::Buy, Some(p)) => p >= maker_price,
        (Side::Sell, Some(p)) => p <= maker_price,
    }
}

/// A quantity-`target` snapshot of `parent`, keeping id, price, `created_at`
/// and source.
fn split(parent: &Order, target: u64) -> Result<Order, MatchingError> {
    if target > parent.magnitude() {
        return Err(MatchingError::InvalidSplit {
            target,
            parent: parent.magnitude(),
        });
    }
    let mut out = parent.clone();
    out.quantity = match parent.side() {
        Side::Buy => target as i64,
        Side::Sell => -(target as i64),
    };
    out.hold = 0;
    Ok(out)
}

fn reduce(order: &mut Order, units: u64) {
    debug_assert!(units <= order.magnitude());
    order.quantity = match order.side() {
        Side::Buy => order.quantity - units as i64,
        Side::Sell => order.quantity + units as i64,
    };
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::market::OrderSource;

    fn own(quantity: i64, price: i64, created_at: u64) -> Order {
        Order {
            id: Uuid::new_v4(),
            pair_id: "BTC/USDT".into(),
            quantity,
            price: Some(Decimal::from(price)),
            created_at,
            initial_quantity: quantity.unsigned_abs(),
            hold: 0,
            source: OrderSource::Own {
                local_id: Uuid::new_v4().to_string(),
                ttl_ms: None,
            },
        }
    }

    fn peer(quantity: i64, price: i64, created_at: u64) -> Order {
        Order {
            id: Uuid::new_v4(),
            pair_id: "BTC/USDT".into(),
            quantity,
            price: Some(Decimal::from(price)),
            created_at,
            initial_quantity: quantity.unsigned_abs(),
            hold: 0,
            source: OrderSource::Peer {
                peer_pub_key: "02aa".into(),
                destination: None,
            },
        }
    }

    fn engine() -> MatchingEngine {
        MatchingEngine::new("BTC/USDT".into())
    }

    #[test]
    fn full_cross_consumes_both_makers() {
        // S1: two peer sells of 5 at price 5, own buy of 10 at 5
        let mut eng = engine();
        eng.add_peer_order(peer(-5, 5, 1)).unwrap();
        eng.add_peer_order(peer(-5, 5, 2)).unwrap();

        let res = eng.match_or_add_own_order(own(10, 5, 3), false).unwrap();
        assert_eq!(res.matches.len(), 2);
        assert!(res.matches.iter().all(|m| m.quantity() == 5));
        assert!(res.remaining.is_none());
        assert!(eng.is_empty());
    }

    #[test]
    fn taker_split_leaves_own_remainder() {
        // S2: peer sells -4 and -5 at 5, own buy 10 -> remainder 1 rests
        let mut eng = engine();
        eng.add_peer_order(peer(-4, 5, 1)).unwrap();
        eng.add_peer_order(peer(-5, 5, 2)).unwrap();

        let res = eng.match_or_add_own_order(own(10, 5, 3), false).unwrap();
        let matched: u64 = res.matches.iter().map(|m| m.quantity()).sum();
        assert_eq!(matched, 9);
        let remaining = res.remaining.expect("remainder should rest");
        assert_eq!(remaining.quantity, 1);
        assert_eq!(eng.best_buy().map(|o| o.quantity), Some(1));
        assert!(eng.best_sell().is_none());
    }

    #[test]
    fn maker_split_keeps_head_with_residual() {
        // S3: peer sells -5 and -6 at 5, own buy 10 -> head sell left with -1
        let mut eng = engine();
        eng.add_peer_order(peer(-5, 5, 1)).unwrap();
        let second = peer(-6, 5, 2);
        let second_id = second.id;
        eng.add_peer_order(second).unwrap();

        let res = eng.match_or_add_own_order(own(10, 5, 3), false).unwrap();
        assert_eq!(res.matches.len(), 2);
        assert!(res.matches.iter().all(|m| m.quantity() == 5));
        assert!(res.remaining.is_none());

        let head = eng.best_sell().expect("residual sell should remain");
        assert_eq!(head.quantity, -1);
        assert_eq!(head.price, Some(Decimal::from(5)));
        // the split maker remainder keeps its id
        assert_eq!(head.id, second_id);
    }

    #[test]
    fn fifo_at_equal_price() {
        // S4: sells A(t=100) then B(t=101) at the same price; buy 3 takes A
        let mut eng = engine();
        let a = peer(-3, 5, 100);
        let a_id = a.id;
        let b = peer(-3, 5, 101);
        let b_id = b.id;
        eng.add_peer_order(a).unwrap();
        eng.add_peer_order(b).unwrap();

        let res = eng.match_or_add_own_order(own(3, 5, 102), false).unwrap();
        assert_eq!(res.matches.len(), 1);
        assert_eq!(res.matches[0].maker.id, a_id);
        assert_eq!(eng.best_sell().map(|o| o.id), Some(b_id));
    }

    #[test]
    fn fifo_respects_created_at_over_arrival() {
        let mut eng = engine();
        let late = peer(-3, 5, 200);
        let early = peer(-3, 5, 100);
        let early_id = early.id;
        eng.add_peer_order(late).unwrap();
        eng.add_peer_order(early).unwrap();

        let res = eng.match_or_add_own_order(own(3, 5, 300), false).unwrap();
        assert_eq!(res.matches[0].maker.id, early_id);
    }

    #[test]
    fn quantity_is_conserved() {
        let mut eng = engine();
        eng.add_peer_order(peer(-4, 5, 1)).unwrap();
        eng.add_peer_order(peer(-3, 4, 2)).unwrap();

        let initial = 10u64;
        let res = eng.match_or_add_own_order(own(initial as i64, 5, 3), false).unwrap();
        let matched: u64 = res.matches.iter().map(|m| m.quantity()).sum();
        let remaining = res.remaining.map(|o| o.magnitude()).unwrap_or(0);
        assert_eq!(matched + remaining, initial);
    }

    #[test]
    fn buy_price_always_covers_sell_price() {
        let mut eng = engine();
        eng.add_peer_order(peer(-5, 6, 1)).unwrap();
        eng.add_peer_order(peer(-5, 4, 2)).unwrap();

        let res = eng.match_or_add_own_order(own(10, 5, 3), false).unwrap();
        // only the 4-priced sell crosses
        assert_eq!(res.matches.len(), 1);
        for m in &res.matches {
            assert!(m.taker.price.unwrap() >= m.maker.price.unwrap());
        }
        assert_eq!(res.remaining.map(|o| o.quantity), Some(5));
    }

    #[test]
    fn market_buy_crosses_any_price_and_never_rests() {
        let mut eng = engine();
        eng.add_peer_order(peer(-5, 1_000_000, 1)).unwrap();

        let mut taker = own(8, 0, 2);
        taker.price = None;
        let res = eng.match_or_add_own_order(taker, true).unwrap();
        assert_eq!(res.matches.len(), 1);
        assert_eq!(res.matches[0].quantity(), 5);
        assert!(res.remaining.is_none());
        assert!(eng.is_empty());
    }

    #[test]
    fn better_priced_sell_matches_first() {
        let mut eng = engine();
        let cheap = peer(-5, 3, 2);
        let cheap_id = cheap.id;
        eng.add_peer_order(peer(-5, 4, 1)).unwrap();
        eng.add_peer_order(cheap).unwrap();

        let res = eng.match_or_add_own_order(own(5, 5, 3), false).unwrap();
        assert_eq!(res.matches[0].maker.id, cheap_id);
    }

    #[test]
    fn remove_peer_order_decrement_and_full() {
        let mut eng = engine();
        let order = peer(-10, 5, 1);
        let id = order.id;
        eng.add_peer_order(order).unwrap();

        let removed = eng.remove_peer_order(&id, Some(4)).unwrap();
        assert_eq!(removed.magnitude(), 4);
        assert_eq!(eng.get(&id).map(|o| o.quantity), Some(-6));

        let removed = eng.remove_peer_order(&id, None).unwrap();
        assert_eq!(removed.quantity, -6);
        assert!(eng.is_empty());
    }

    #[test]
    fn bulk_remove_by_peer() {
        let mut eng = engine();
        eng.add_peer_order(peer(-5, 5, 1)).unwrap();
        eng.add_peer_order(peer(-5, 6, 2)).unwrap();
        let mut other = peer(3, 4, 3);
        other.source = OrderSource::Peer {
            peer_pub_key: "02bb".into(),
            destination: None,
        };
        eng.add_peer_order(other).unwrap();

        let removed = eng.remove_peer_orders(|o| o.peer_pub_key() == Some("02aa"));
        assert_eq!(removed.len(), 2);
        assert_eq!(eng.len(), 1);
        assert!(eng.iter().all(|o| o.peer_pub_key() == Some("02bb")));
    }

    #[test]
    fn split_larger_than_parent_is_rejected() {
        let parent = peer(-5, 5, 1);
        let err = split(&parent, 6).unwrap_err();
        assert!(matches!(
            err,
            MatchingError::InvalidSplit { target: 6, parent: 5 }
        ));
    }

    #[test]
    fn holds_clamp_and_consume() {
        let mut eng = engine();
        let res = eng.match_or_add_own_order(own(10, 5, 1), false).unwrap();
        let id = res.remaining.unwrap().id;

        assert_eq!(eng.adjust_hold(&id, 4), Some(4));
        assert_eq!(eng.get(&id).unwrap().available(), 6);
        assert_eq!(eng.adjust_hold(&id, -10), Some(0));

        eng.adjust_hold(&id, 4);
        let (updated, removed) = eng.consume(&id, 4).unwrap();
        assert_eq!(updated.quantity, 6);
        assert_eq!(updated.hold, 0);
        assert!(!removed);

        let (_, removed) = eng.consume(&id, 6).unwrap();
        assert!(removed);
        assert!(eng.is_empty());
    }

    #[test]
    fn own_orders_cross_internally() {
        let mut eng = engine();
        eng.match_or_add_own_order(own(-5, 5, 1), false).unwrap();
        let res = eng.match_or_add_own_order(own(5, 5, 2), false).unwrap();
        assert_eq!(res.matches.len(), 1);
        assert!(res.matches[0].maker.is_own());
        assert!(eng.is_empty());
    }
}
