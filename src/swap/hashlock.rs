//! Hashlock-transfer backend for state-channel style daemons: conditional
//! transfers locked to a payment hash and resolved by revealing the
//! preimage. There are no invoices; an expected incoming transfer is
//! registered locally and watched on the daemon.

use std::collections::HashMap;
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
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TRANSFER_WATCH_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct CreateTransferRequest<'a> {
    recipient: &'a str,
    lock_hash: &'a str,
    units: u64,
    timelock: u32,
}

#[derive(Debug, Deserialize)]
struct TransferStatusResponse {
    state: String,
    units: u64,
    preimage: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveTransferRequest<'a> {
    preimage: &'a str,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    synced: bool,
    address: String,
}

#[derive(Debug, Serialize)]
struct DepositRequest {
    units: u64,
}

#[derive(Debug, Deserialize)]
struct DepositResponse {
    address: String,
}

pub struct HashlockClient {
    currency: String,
    base_url: String,
    timelock_delta: u32,
    http: reqwest::Client,
    status: Mutex<ClientStatus>,
    /// Our transfer address on the daemon, learned from `/v1/info`.
    address: Mutex<Option<String>>,
    /// Incoming hashes we expect, with their amounts.
    expected: Mutex<HashMap<String, u64>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl HashlockClient {
    pub fn new(
        currency: String,
        base_url: String,
        timelock_delta: u32,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            currency,
            base_url: base_url.trim_end_matches('/').to_string(),
            timelock_delta,
            http: reqwest::Client::new(),
            status: Mutex::new(ClientStatus::Initialized),
            address: Mutex::new(None),
            expected: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().expect("status mutex poisoned") = status;
    }

    async fn fetch_info(&self) -> Result<InfoResponse, SwapClientError> {
        let info: InfoResponse = self
            .http
            .get(self.url("/v1/info"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        *self.address.lock().expect("address mutex poisoned") = Some(info.address.clone());
        Ok(info)
    }

    async fn transfer_status(
        &self,
        lock_hash: &str,
        incoming: bool,
    ) -> Result<(PaymentState, u64), SwapClientError> {
        let direction = if incoming { "incoming" } else { "outgoing" };
        let resp = self
            .http
            .get(self.url(&format!("/v1/transfers/{direction}/{lock_hash}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((PaymentState::Pending, 0));
        }
        let status: TransferStatusResponse = resp.error_for_status()?.json().await?;
        let state = match status.state.as_str() {
            "locked" | "pending" => PaymentState::Pending,
            "resolved" => {
                let preimage = status.preimage.ok_or_else(|| {
                    SwapClientError::InvalidResponse("resolved transfer without preimage".into())
                })?;
                PaymentState::Succeeded { preimage }
            }
            "expired" | "failed" => PaymentState::Failed,
            other => {
                return Err(SwapClientError::InvalidResponse(format!(
                    "unknown transfer state {other}"
                )));
            }
        };
        Ok((state, status.units))
    }

    /// Watch for the expected incoming transfer to lock, emitting
    /// `HtlcAccepted` once it does.
    fn watch_incoming(&self, lock_hash: String) {
        let http = self.http.clone();
        let url = self.url(&format!("/v1/transfers/incoming/{lock_hash}"));
        let currency = self.currency.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + TRANSFER_WATCH_TIMEOUT;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if Instant::now() >= deadline {
                    break;
                }
                let Ok(resp) = http.get(&url).timeout(REQUEST_TIMEOUT).send().await else {
                    continue;
                };
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    continue;
                }
                let Ok(status) = resp.json::<TransferStatusResponse>().await else {
                    continue;
                };
                match status.state.as_str() {
                    "locked" => {
                        let _ = events.send(ClientEvent::HtlcAccepted {
                            currency,
                            r_hash: lock_hash,
                            units: status.units,
                        });
                        break;
                    }
                    "resolved" | "expired" | "failed" => break,
                    _ => {}
                }
            }
        });
    }
}

#[async_trait]
impl SwapClient for HashlockClient {
    fn kind(&self) -> BackendKind {
        BackendKind::HashlockTransfer
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn status(&self) -> ClientStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    fn cltv_delta(&self) -> u32 {
        self.timelock_delta
    }

    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError> {
        let body = CreateTransferRequest {
            recipient: &request.destination,
            lock_hash: &request.r_hash,
            units: request.units,
            timelock: request.cltv_limit,
        };
        let resp = self
            .http
            .post(self.url("/v1/transfers"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| PaymentError::Unknown(err.to_string()))?;
        if resp.status().is_client_error() {
            return Err(PaymentError::Final(format!(
                "transfer rejected: {}",
                resp.status()
            )));
        }

        let deadline = Instant::now() + TRANSFER_TIMEOUT;
        loop {
            match self.transfer_status(&request.r_hash, false).await {
                Ok((PaymentState::Succeeded { preimage }, _)) => return Ok(preimage),
                Ok((PaymentState::Failed, _)) => {
                    return Err(PaymentError::Final("transfer expired".into()));
                }
                Ok((PaymentState::Pending, _)) => {}
                Err(err) => {
                    tracing::debug!(currency = %self.currency, error = %err, "transfer poll failed");
                }
            }
            if Instant::now() >= deadline {
                return Err(PaymentError::Unknown(format!(
                    "transfer still unresolved after {TRANSFER_TIMEOUT:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// No invoice exists on this backend; register the expected hash and
    /// hand out our transfer address as the destination.
    async fn add_invoice(
        &self,
        r_hash: &str,
        units: u64,
        _cltv_delta: u32,
    ) -> Result<Option<String>, SwapClientError> {
        self.expected
            .lock()
            .expect("expected map poisoned")
            .insert(r_hash.to_string(), units);
        let address = {
            let known = self.address.lock().expect("address mutex poisoned").clone();
            match known {
                Some(address) => address,
                None => self.fetch_info().await?.address,
            }
        };
        self.watch_incoming(r_hash.to_string());
        Ok(Some(address))
    }

    async fn lookup_payment(&self, r_hash: &str) -> Result<PaymentState, SwapClientError> {
        let (state, _) = self.transfer_status(r_hash, false).await?;
        Ok(state)
    }

    async fn settle_invoice(
        &self,
        r_hash: &str,
        r_preimage: &str,
    ) -> Result<(), SwapClientError> {
        let body = ResolveTransferRequest {
            preimage: r_preimage,
        };
        self.http
            .post(self.url(&format!("/v1/transfers/incoming/{r_hash}/resolve")))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        self.expected
            .lock()
            .expect("expected map poisoned")
            .remove(r_hash);
        Ok(())
    }

    async fn remove_invoice(&self, r_hash: &str) -> Result<(), SwapClientError> {
        self.expected
            .lock()
            .expect("expected map poisoned")
            .remove(r_hash);
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
        #[derive(Serialize)]
        struct Body<'a> {
            counterparty: &'a str,
            capacity: u64,
        }
        self.http
            .post(self.url("/v1/channels"))
            .timeout(REQUEST_TIMEOUT)
            .json(&Body {
                counterparty: remote_identifier,
                capacity,
            })
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
        #[derive(Serialize)]
        struct Body<'a> {
            counterparty: &'a str,
            force: bool,
        }
        self.http
            .post(self.url("/v1/channels/close"))
            .timeout(REQUEST_TIMEOUT)
            .json(&Body {
                counterparty: remote_identifier,
                force,
            })
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
        match self.fetch_info().await {
            Ok(info) if info.synced => {
                self.set_status(ClientStatus::ConnectionVerified);
                let _ = self.events.send(ClientEvent::ConnectionVerified {
                    currency: self.currency.clone(),
                });
                Ok(())
            }
            Ok(_) => {
                self.set_status(ClientStatus::OutOfSync);
                Err(SwapClientError::NotReady(ClientStatus::OutOfSync))
            }
            Err(err) => {
                self.set_status(ClientStatus::Disconnected);
                Err(err)
            }
        }
    }
}
