//! Lightning-style HTLC backend: a thin JSON client for a payment-channel
//! daemon exposing hold invoices and hash-locked payments over REST.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::client::{
    ChannelBalance, ClientEvent, ClientStatus, PaymentError, PaymentRequest, PaymentState,
    SwapClient, SwapClientError,
};
use crate::market::BackendKind;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long the invoice watcher keeps polling before giving up.
const INVOICE_WATCH_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct AddInvoiceRequest<'a> {
    r_hash: &'a str,
    units: u64,
    cltv_delta: u32,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    destination: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceStatusResponse {
    state: String,
    units: u64,
}

#[derive(Debug, Serialize)]
struct SendPaymentRequest<'a> {
    destination: &'a str,
    r_hash: &'a str,
    units: u64,
    cltv_limit: u32,
}

#[derive(Debug, Deserialize)]
struct PaymentStatusResponse {
    state: String,
    preimage: Option<String>,
}

#[derive(Debug, Serialize)]
struct SettleInvoiceRequest<'a> {
    r_preimage: &'a str,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    synced: bool,
}

#[derive(Debug, Serialize)]
struct OpenChannelRequest<'a> {
    remote_identifier: &'a str,
    capacity: u64,
}

#[derive(Debug, Serialize)]
struct CloseChannelRequest<'a> {
    remote_identifier: &'a str,
    force: bool,
}

#[derive(Debug, Serialize)]
struct DepositRequest {
    units: u64,
}

#[derive(Debug, Deserialize)]
struct DepositResponse {
    address: String,
}

pub struct HtlcClient {
    currency: String,
    base_url: String,
    cltv_delta: u32,
    http: reqwest::Client,
    status: Mutex<ClientStatus>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl HtlcClient {
    pub fn new(
        currency: String,
        base_url: String,
        cltv_delta: u32,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            currency,
            base_url: base_url.trim_end_matches('/').to_string(),
            cltv_delta,
            http: reqwest::Client::new(),
            status: Mutex::new(ClientStatus::Initialized),
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().expect("status mutex poisoned") = status;
    }

    async fn payment_status(&self, r_hash: &str) -> Result<PaymentState, SwapClientError> {
        let resp: PaymentStatusResponse = self
            .http
            .get(self.url(&format!("/v1/payments/{r_hash}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match resp.state.as_str() {
            "pending" | "in_flight" => Ok(PaymentState::Pending),
            "succeeded" => {
                let preimage = resp.preimage.ok_or_else(|| {
                    SwapClientError::InvalidResponse("succeeded payment without preimage".into())
                })?;
                Ok(PaymentState::Succeeded { preimage })
            }
            "failed" => Ok(PaymentState::Failed),
            other => Err(SwapClientError::InvalidResponse(format!(
                "unknown payment state {other}"
            ))),
        }
    }

    /// Watch an invoice until it is accepted, emitting `HtlcAccepted`.
    fn watch_invoice(&self, r_hash: String) {
        let http = self.http.clone();
        let url = self.url(&format!("/v1/invoices/{r_hash}"));
        let currency = self.currency.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + INVOICE_WATCH_TIMEOUT;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if Instant::now() >= deadline {
                    break;
                }
                let resp = match http.get(&url).timeout(REQUEST_TIMEOUT).send().await {
                    Ok(resp) => resp,
                    Err(err) => {
                        tracing::debug!(%currency, %r_hash, error = %err, "invoice poll failed");
                        continue;
                    }
                };
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    break;
                }
                let Ok(status) = resp.json::<InvoiceStatusResponse>().await else {
                    continue;
                };
                match status.state.as_str() {
                    "accepted" => {
                        let _ = events.send(ClientEvent::HtlcAccepted {
                            currency,
                            r_hash,
                            units: status.units,
                        });
                        break;
                    }
                    "settled" | "canceled" => break,
                    _ => {}
                }
            }
        });
    }
}

#[async_trait]
impl SwapClient for HtlcClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Htlc
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn status(&self) -> ClientStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    fn cltv_delta(&self) -> u32 {
        self.cltv_delta
    }

    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError> {
        let body = SendPaymentRequest {
            destination: &request.destination,
            r_hash: &request.r_hash,
            units: request.units,
            cltv_limit: request.cltv_limit,
        };
        let resp = self
            .http
            .post(self.url("/v1/payments"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            // the request may or may not have reached the daemon
            .map_err(|err| PaymentError::Unknown(err.to_string()))?;
        if resp.status().is_client_error() {
            // the daemon rejected the payment before dispatching anything
            return Err(PaymentError::Final(format!(
                "payment rejected: {}",
                resp.status()
            )));
        }

        let deadline = Instant::now() + PAYMENT_TIMEOUT;
        loop {
            match self.payment_status(&request.r_hash).await {
                Ok(PaymentState::Succeeded { preimage }) => return Ok(preimage),
                Ok(PaymentState::Failed) => {
                    return Err(PaymentError::Final("payment failed".into()));
                }
                Ok(PaymentState::Pending) => {}
                Err(err) => {
                    tracing::debug!(currency = %self.currency, error = %err, "payment poll failed");
                }
            }
            if Instant::now() >= deadline {
                return Err(PaymentError::Unknown(format!(
                    "payment still unresolved after {PAYMENT_TIMEOUT:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn add_invoice(
        &self,
        r_hash: &str,
        units: u64,
        cltv_delta: u32,
    ) -> Result<Option<String>, SwapClientError> {
        let body = AddInvoiceRequest {
            r_hash,
            units,
            cltv_delta,
        };
        let resp: AddInvoiceResponse = self
            .http
            .post(self.url("/v1/invoices"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.watch_invoice(r_hash.to_string());
        Ok(Some(resp.destination))
    }

    async fn lookup_payment(&self, r_hash: &str) -> Result<PaymentState, SwapClientError> {
        self.payment_status(r_hash).await
    }

    async fn settle_invoice(
        &self,
        r_hash: &str,
        r_preimage: &str,
    ) -> Result<(), SwapClientError> {
        let body = SettleInvoiceRequest { r_preimage };
        self.http
            .post(self.url(&format!("/v1/invoices/{r_hash}/settle")))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove_invoice(&self, r_hash: &str) -> Result<(), SwapClientError> {
        let resp = self
            .http
            .delete(self.url(&format!("/v1/invoices/{r_hash}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        // removing an unknown invoice is not an error
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status()?;
        }
        Ok(())
    }

    async fn channel_balance(&self) -> Result<ChannelBalance, SwapClientError> {
        let balance: ChannelBalance = self
            .http
            .get(self.url("/v1/balance"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(balance)
    }

    async fn open_channel(
        &self,
        remote_identifier: &str,
        capacity: u64,
    ) -> Result<(), SwapClientError> {
        let body = OpenChannelRequest {
            remote_identifier,
            capacity,
        };
        self.http
            .post(self.url("/v1/channels"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close_channel(
        &self,
        remote_identifier: &str,
        force: bool,
    ) -> Result<(), SwapClientError> {
        let body = CloseChannelRequest {
            remote_identifier,
            force,
        };
        self.http
            .post(self.url("/v1/channels/close"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deposit(&self, units: u64) -> Result<String, SwapClientError> {
        let resp: DepositResponse = self
            .http
            .post(self.url("/v1/deposit"))
            .timeout(REQUEST_TIMEOUT)
            .json(&DepositRequest { units })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.address)
    }

    async fn verify_connection(&self) -> Result<(), SwapClientError> {
        let info = self
            .http
            .get(self.url("/v1/info"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let info: InfoResponse = match info {
            Ok(resp) => resp.json().await?,
            Err(err) => {
                self.set_status(ClientStatus::Disconnected);
                return Err(err.into());
            }
        };
        if !info.synced {
            self.set_status(ClientStatus::OutOfSync);
            return Err(SwapClientError::NotReady(ClientStatus::OutOfSync));
        }
        self.set_status(ClientStatus::ConnectionVerified);
        let _ = self.events.send(ClientEvent::ConnectionVerified {
            currency: self.currency.clone(),
        });
        Ok(())
    }
}
