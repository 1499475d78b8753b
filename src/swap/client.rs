//! The uniform contract over heterogeneous off-chain payment backends.
//! Everything above this trait is backend-agnostic; only `send_payment`
//! internals and invoice handling differ between flavors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market::BackendKind;
use crate::swap::SwapDeal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Disabled,
    NotInitialized,
    Initialized,
    ConnectionVerified,
    Disconnected,
    OutOfSync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub local: u64,
    pub remote: u64,
    pub inactive: u64,
    pub pending_open: u64,
}

/// Resolution of a payment looked up by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Succeeded { preimage: String },
    Failed,
}

/// `Final` means the payment was definitely not sent and it is safe to
/// release holds; `Unknown` means the funds may still move and the deal
/// must go through recovery. Neither is ever retried.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment failed: {0}")]
    Final(String),
    #[error("payment status unknown: {0}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum SwapClientError {
    #[error("swap client request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected swap client response: {0}")]
    InvalidResponse(String),
    #[error("operation not supported by this backend: {0}")]
    NotSupported(&'static str),
    #[error("swap client is not ready: {0:?}")]
    NotReady(ClientStatus),
}

/// Events pushed by clients into the manager's aggregate stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    HtlcAccepted {
        currency: String,
        r_hash: String,
        units: u64,
    },
    LowBalance {
        currency: String,
        local: u64,
        required: u64,
    },
    ConnectionVerified {
        currency: String,
    },
}

/// Parameters of an outgoing payment, derived from a deal's leg
/// orientation by [`PaymentRequest::from_deal`].
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub destination: String,
    pub r_hash: String,
    pub units: u64,
    pub cltv_limit: u32,
}

impl PaymentRequest {
    pub fn from_deal(deal: &SwapDeal) -> Option<Self> {
        Some(Self {
            destination: deal.destination.clone()?,
            r_hash: deal.r_hash.clone(),
            units: deal.outgoing_units(),
            cltv_limit: deal.outgoing_cltv_delta(),
        })
    }
}

#[async_trait]
pub trait SwapClient: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn currency(&self) -> &str;

    fn status(&self) -> ClientStatus;

    /// Preferred CLTV delta for payments we receive through this client.
    fn cltv_delta(&self) -> u32;

    /// Send the outgoing leg of a deal, resolving to the preimage revealed
    /// by the counterparty's settlement. Implementations must map errors to
    /// [`PaymentError::Final`] only when the payment definitely did not
    /// happen. Callers never retry this.
    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError>;

    /// Reserve an incoming payment locked to `r_hash`. HTLC backends create
    /// a hold invoice; hashlock-transfer backends just register the
    /// expected hash. Returns the destination the counterparty should pay.
    async fn add_invoice(
        &self,
        r_hash: &str,
        units: u64,
        cltv_delta: u32,
    ) -> Result<Option<String>, SwapClientError>;

    async fn lookup_payment(&self, r_hash: &str) -> Result<PaymentState, SwapClientError>;

    async fn settle_invoice(&self, r_hash: &str, r_preimage: &str)
    -> Result<(), SwapClientError>;

    async fn remove_invoice(&self, r_hash: &str) -> Result<(), SwapClientError>;

    async fn channel_balance(&self) -> Result<ChannelBalance, SwapClientError>;

    async fn open_channel(
        &self,
        remote_identifier: &str,
        capacity: u64,
    ) -> Result<(), SwapClientError>;

    async fn close_channel(&self, remote_identifier: &str, force: bool)
    -> Result<(), SwapClientError>;

    async fn deposit(&self, units: u64) -> Result<String, SwapClientError>;

    /// Probe the backend daemon and update [`SwapClient::status`].
    async fn verify_connection(&self) -> Result<(), SwapClientError>;
}
