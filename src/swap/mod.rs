pub mod client;
pub mod hashlock;
pub mod htlc;
pub mod manager;
pub mod swaps;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::{NodePubKey, PairId};

/// Hex-encoded sha256 hashlock coordinating the two payment legs.
pub type RHash = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    /// Our resting order was hit by a remote taker.
    Maker,
    /// We placed the order that caused the match.
    Taker,
}

/// Progress of a deal through the settlement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    Created,
    SwapRequested,
    SwapAccepted,
    SendingPayment,
    PaymentReceived,
    SwapCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Active,
    /// Failed or indeterminate; recovery may still resolve it.
    Error,
    /// Resolved by the recovery scan after a crash or timeout.
    Recovered,
    Completed,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::Recovered | SwapState::Completed)
    }
}

/// Reason codes carried by `SwapFailed` packets and failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapFailureReason {
    /// Rejected before any payment was sent; no funds at risk.
    PaymentRejected,
    OrderNotFound,
    InvalidQuantity,
    SwapClientUnavailable,
    /// The outgoing payment definitively failed.
    PaymentFailed,
    /// The outgoing payment is in an unknown state; never retried.
    PaymentUnknown,
    InsufficientCltvDelta,
    Timeout,
    UnexpectedPacket,
    UnknownError,
}

/// A cross-chain settlement instance created from a match.
///
/// Leg orientation: the maker pays the taker in `taker_currency`
/// (`taker_units`, capped by `taker_cltv_delta`), the taker pays the maker
/// in `maker_currency`. The taker generates `r_preimage`; the maker learns
/// it from the settlement of its own outgoing payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapDeal {
    pub r_hash: RHash,
    pub r_preimage: Option<String>,
    pub role: SwapRole,
    pub phase: SwapPhase,
    pub state: SwapState,
    pub error: Option<String>,
    pub peer_pub_key: NodePubKey,
    pub pair_id: PairId,
    /// Matched amount in base-currency smallest units.
    pub quantity: u64,
    pub price: Decimal,
    pub taker_currency: String,
    pub maker_currency: String,
    pub taker_units: u64,
    pub maker_units: u64,
    pub taker_cltv_delta: u32,
    pub maker_cltv_delta: u32,
    pub maker_order_id: Uuid,
    pub taker_order_id: Uuid,
    /// Counterparty destination for our outgoing leg, learned during the
    /// request/accept exchange.
    pub destination: Option<String>,
    /// Whether a hold is still reserved on the underlying own order.
    pub hold_active: bool,
    pub created_at: u64,
    pub executed_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl SwapDeal {
    /// Currency of the payment we send.
    pub fn outgoing_currency(&self) -> &str {
        match self.role {
            SwapRole::Maker => &self.taker_currency,
            SwapRole::Taker => &self.maker_currency,
        }
    }

    /// Currency of the payment we receive.
    pub fn incoming_currency(&self) -> &str {
        match self.role {
            SwapRole::Maker => &self.maker_currency,
            SwapRole::Taker => &self.taker_currency,
        }
    }

    pub fn outgoing_units(&self) -> u64 {
        match self.role {
            SwapRole::Maker => self.taker_units,
            SwapRole::Taker => self.maker_units,
        }
    }

    pub fn incoming_units(&self) -> u64 {
        match self.role {
            SwapRole::Maker => self.maker_units,
            SwapRole::Taker => self.taker_units,
        }
    }

    /// CLTV limit for our outgoing leg.
    pub fn outgoing_cltv_delta(&self) -> u32 {
        match self.role {
            SwapRole::Maker => self.taker_cltv_delta,
            SwapRole::Taker => self.maker_cltv_delta,
        }
    }
}

/// Terminal notification for a completed deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapSuccess {
    pub r_hash: RHash,
    pub pair_id: PairId,
    pub role: SwapRole,
    pub quantity: u64,
    pub price: Decimal,
    pub peer_pub_key: NodePubKey,
    pub r_preimage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapFailure {
    pub r_hash: RHash,
    pub pair_id: PairId,
    pub reason: SwapFailureReason,
    pub message: Option<String>,
    pub peer_pub_key: NodePubKey,
}

#[derive(Debug, Clone)]
pub enum SwapEvent {
    Success(SwapSuccess),
    Failure(SwapFailure),
}

pub fn phase_to_str(phase: SwapPhase) -> &'static str {
    match phase {
        SwapPhase::Created => "created",
        SwapPhase::SwapRequested => "swap_requested",
        SwapPhase::SwapAccepted => "swap_accepted",
        SwapPhase::SendingPayment => "sending_payment",
        SwapPhase::PaymentReceived => "payment_received",
        SwapPhase::SwapCompleted => "swap_completed",
    }
}

pub fn phase_from_str(s: &str) -> Option<SwapPhase> {
    match s {
        "created" => Some(SwapPhase::Created),
        "swap_requested" => Some(SwapPhase::SwapRequested),
        "swap_accepted" => Some(SwapPhase::SwapAccepted),
        "sending_payment" => Some(SwapPhase::SendingPayment),
        "payment_received" => Some(SwapPhase::PaymentReceived),
        "swap_completed" => Some(SwapPhase::SwapCompleted),
        _ => None,
    }
}

pub fn state_to_str(state: SwapState) -> &'static str {
    match state {
        SwapState::Active => "active",
        SwapState::Error => "error",
        SwapState::Recovered => "recovered",
        SwapState::Completed => "completed",
    }
}

pub fn state_from_str(s: &str) -> Option<SwapState> {
    match s {
        "active" => Some(SwapState::Active),
        "error" => Some(SwapState::Error),
        "recovered" => Some(SwapState::Recovered),
        "completed" => Some(SwapState::Completed),
        _ => None,
    }
}

pub fn role_to_str(role: SwapRole) -> &'static str {
    match role {
        SwapRole::Maker => "maker",
        SwapRole::Taker => "taker",
    }
}

pub fn role_from_str(s: &str) -> Option<SwapRole> {
    match s {
        "maker" => Some(SwapRole::Maker),
        "taker" => Some(SwapRole::Taker),
        _ => None,
    }
}
