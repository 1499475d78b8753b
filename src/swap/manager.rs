//! Owns one swap client per currency and dispatches by symbol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::client::{ClientEvent, ClientStatus, SwapClient};
use super::hashlock::HashlockClient;
use super::htlc::HtlcClient;
use crate::market::{BackendKind, Currency};

/// Connection options for one currency's payment-channel daemon.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub currency: String,
    pub url: String,
    pub cltv_delta: u32,
}

pub struct SwapClientManager {
    clients: Mutex<HashMap<String, Arc<dyn SwapClient>>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Local balance below this fraction of a required amount raises a
    /// low-balance event. Expressed in percent.
    low_balance_percent: u64,
}

impl SwapClientManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                clients: Mutex::new(HashMap::new()),
                events_tx,
                low_balance_percent: 100,
            },
            events_rx,
        )
    }

    /// Sender handed to clients constructed outside the manager (tests).
    pub fn events_sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.events_tx.clone()
    }

    /// Instantiate a client for `currency` using its configured backend.
    pub fn init_currency(&self, currency: &Currency, config: &BackendConfig) {
        let client: Arc<dyn SwapClient> = match currency.backend {
            BackendKind::Htlc => Arc::new(HtlcClient::new(
                currency.symbol.clone(),
                config.url.clone(),
                config.cltv_delta,
                self.events_tx.clone(),
            )),
            BackendKind::HashlockTransfer => Arc::new(HashlockClient::new(
                currency.symbol.clone(),
                config.url.clone(),
                config.cltv_delta,
                self.events_tx.clone(),
            )),
        };
        self.add_client(client);
    }

    pub fn add_client(&self, client: Arc<dyn SwapClient>) {
        self.clients
            .lock()
            .expect("client map poisoned")
            .insert(client.currency().to_string(), client);
    }

    pub fn remove_client(&self, currency: &str) {
        self.clients
            .lock()
            .expect("client map poisoned")
            .remove(currency);
    }

    /// The dispatch primitive: the client settling `currency`, if any.
    pub fn get(&self, currency: &str) -> Option<Arc<dyn SwapClient>> {
        self.clients
            .lock()
            .expect("client map poisoned")
            .get(currency)
            .cloned()
    }

    pub fn currencies(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .clients
            .lock()
            .expect("client map poisoned")
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn statuses(&self) -> Vec<(String, ClientStatus)> {
        let mut out: Vec<(String, ClientStatus)> = self
            .clients
            .lock()
            .expect("client map poisoned")
            .iter()
            .map(|(currency, client)| (currency.clone(), client.status()))
            .collect();
        out.sort();
        out
    }

    pub async fn verify_connections(&self) {
        let clients: Vec<Arc<dyn SwapClient>> = self
            .clients
            .lock()
            .expect("client map poisoned")
            .values()
            .cloned()
            .collect();
        for client in clients {
            if let Err(err) = client.verify_connection().await {
                tracing::warn!(
                    currency = client.currency(),
                    error = %err,
                    "swap client connection check failed"
                );
            }
        }
    }

    /// Check that `currency` has enough outbound capacity for `required`
    /// units, emitting a low-balance event if it does not.
    pub async fn check_trading_balance(&self, currency: &str, required: u64) {
        let Some(client) = self.get(currency) else {
            return;
        };
        let balance = match client.channel_balance().await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::debug!(%currency, error = %err, "channel balance check failed");
                return;
            }
        };
        if balance.local * 100 < required * self.low_balance_percent {
            let _ = self.events_tx.send(ClientEvent::LowBalance {
                currency: currency.to_string(),
                local: balance.local,
                required,
            });
        }
    }
}
