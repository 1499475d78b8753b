pub mod book;
pub mod matching;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Market identifier in `BASE/QUOTE` form.
pub type PairId = String;
/// Hex-encoded 33-byte node public key.
pub type NodePubKey = String;

/// The flavor of off-chain payment backend that settles a currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Htlc,
    HashlockTransfer,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Htlc => "htlc",
            BackendKind::HashlockTransfer => "hashlock_transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "htlc" => Some(BackendKind::Htlc),
            "hashlock_transfer" => Some(BackendKind::HashlockTransfer),
            _ => None,
        }
    }
}

/// A tradable currency. Immutable once added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub symbol: String,
    pub decimal_places: u8,
    pub backend: BackendKind,
    pub token_address: Option<String>,
}

/// A trading pair of base and quote currency symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    pub fn id(&self) -> PairId {
        format!("{}/{}", self.base, self.quote)
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let (base, quote) = id.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Where an order came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSource {
    /// Placed by a local caller.
    Own {
        local_id: String,
        ttl_ms: Option<u64>,
    },
    /// Imported from a connected peer via gossip.
    Peer {
        peer_pub_key: NodePubKey,
        destination: Option<String>,
    },
}

/// A resting or in-flight limit order.
///
/// `quantity` is the signed remaining amount in base-currency smallest
/// units: positive buys, negative sells. A zero-quantity order must not
/// exist; it is removed instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub pair_id: PairId,
    pub quantity: i64,
    /// Quote units per base unit; `None` is a market order.
    pub price: Option<Decimal>,
    /// Milliseconds, strictly monotonic per node.
    pub created_at: u64,
    /// Magnitude at creation time.
    pub initial_quantity: u64,
    /// Units reserved by in-flight swaps.
    pub hold: u64,
    pub source: OrderSource,
}

impl Order {
    pub fn side(&self) -> Side {
        if self.quantity >= 0 { Side::Buy } else { Side::Sell }
    }

    /// Remaining magnitude.
    pub fn magnitude(&self) -> u64 {
        self.quantity.unsigned_abs()
    }

    /// Magnitude not reserved by in-flight swaps.
    pub fn available(&self) -> u64 {
        self.magnitude().saturating_sub(self.hold)
    }

    pub fn is_own(&self) -> bool {
        matches!(self.source, OrderSource::Own { .. })
    }

    pub fn local_id(&self) -> Option<&str> {
        match &self.source {
            OrderSource::Own { local_id, .. } => Some(local_id),
            OrderSource::Peer { .. } => None,
        }
    }

    pub fn peer_pub_key(&self) -> Option<&str> {
        match &self.source {
            OrderSource::Peer { peer_pub_key, .. } => Some(peer_pub_key),
            OrderSource::Own { .. } => None,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        match &self.source {
            OrderSource::Peer { destination, .. } => destination.as_deref(),
            OrderSource::Own { .. } => None,
        }
    }
}

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Current time in milliseconds, strictly increasing across calls so that
/// orders stamped by the same node never tie on `created_at`.
pub fn monotonic_ms() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    LAST_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(wall.max(last + 1))
        })
        .map(|last| wall.max(last + 1))
        .unwrap_or(wall)
}

/// Convert a base-currency amount into quote-currency smallest units at the
/// given price, accounting for the decimal places of both currencies.
/// Returns `None` on overflow.
pub fn quote_units(
    base_units: u64,
    price: Decimal,
    base_decimals: u8,
    quote_decimals: u8,
) -> Option<u64> {
    let mut amount = Decimal::from(base_units).checked_mul(price)?;
    let shift = i32::from(quote_decimals) - i32::from(base_decimals);
    if shift >= 0 {
        amount = amount.checked_mul(Decimal::from(10u64.checked_pow(shift as u32)?))?;
    } else {
        amount = amount.checked_div(Decimal::from(10u64.checked_pow(shift.unsigned_abs())?))?;
    }
    amount.trunc().to_u64()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn pair_id_round_trip() {
        let pair = Pair::new("BTC", "USDT");
        assert_eq!(pair.id(), "BTC/USDT");
        assert_eq!(Pair::from_id("BTC/USDT"), Some(pair));
        assert_eq!(Pair::from_id("BTCUSDT"), None);
        assert_eq!(Pair::from_id("/USDT"), None);
    }

    #[test]
    fn monotonic_ms_strictly_increases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        let c = monotonic_ms();
        assert!(a < b && b < c);
    }

    #[test]
    fn quote_units_same_decimals() {
        // 100 base units at price 5 -> 500 quote units
        assert_eq!(quote_units(100, Decimal::from(5), 8, 8), Some(500));
    }

    #[test]
    fn quote_units_mixed_decimals() {
        // base has 8 decimals, quote has 6: amounts shrink by 10^2
        assert_eq!(quote_units(1_000_000, Decimal::from(2), 8, 6), Some(20_000));
        // and grow the other way around
        assert_eq!(quote_units(100, Decimal::from(2), 6, 8), Some(20_000));
    }

    #[test]
    fn quote_units_fractional_price_truncates() {
        assert_eq!(quote_units(3, Decimal::new(15, 1), 8, 8), Some(4)); // 3 * 1.5 = 4.5
    }

    #[test]
    fn order_accessors() {
        let order = Order {
            id: Uuid::new_v4(),
            pair_id: "BTC/USDT".into(),
            quantity: -25,
            price: Some(Decimal::from(5)),
            created_at: 1,
            initial_quantity: 40,
            hold: 10,
            source: OrderSource::Peer {
                peer_pub_key: "02ab".into(),
                destination: None,
            },
        };
        assert_eq!(order.side(), Side::Sell);
        assert_eq!(order.magnitude(), 25);
        assert_eq!(order.available(), 15);
        assert!(!order.is_own());
        assert_eq!(order.peer_pub_key(), Some("02ab"));
    }
}
