//! Shared test harness: an in-memory payment network standing in for the
//! per-currency channel daemons, plus node construction helpers.

// each integration test compiles its own copy and uses a subset
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use chandex::market::{BackendKind, Currency};
use chandex::node::{Node, NodeConfig};
use chandex::store::SqliteStore;
use chandex::swap::client::{
    ChannelBalance, ClientEvent, ClientStatus, PaymentError, PaymentRequest, PaymentState,
    SwapClient, SwapClientError,
};
use chandex::swap::manager::SwapClientManager;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBehavior {
    /// Deliver the payment and resolve once someone settles the hash.
    Deliver,
    /// Reject definitively before anything is sent.
    FailFinal,
    /// Swallow the payment with an indeterminate error.
    FailUnknown,
}

struct Registration {
    currency: String,
    events: mpsc::UnboundedSender<ClientEvent>,
}

#[derive(Default)]
struct NetInner {
    /// r_hash -> revealed preimage.
    settled: HashMap<String, String>,
    clients: HashMap<String, Registration>,
    /// Invoice settles observed per client: (currency, r_hash, preimage).
    invoice_settles: Vec<(String, String, String)>,
}

/// A hashlock "network" shared by every mock client in a test. Settling a
/// hash anywhere resolves all payments locked to it, which is exactly the
/// preimage propagation a real HTLC route gives you.
pub struct MockNetwork {
    inner: Mutex<NetInner>,
    notify: Notify,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetInner::default()),
            notify: Notify::new(),
        })
    }

    fn register(&self, destination: String, currency: String, events: mpsc::UnboundedSender<ClientEvent>) {
        self.inner
            .lock()
            .unwrap()
            .clients
            .insert(destination, Registration { currency, events });
    }

    fn settle(&self, currency: &str, r_hash: &str, preimage: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .settled
            .entry(r_hash.to_string())
            .or_insert_with(|| preimage.to_string());
        inner.invoice_settles.push((
            currency.to_string(),
            r_hash.to_string(),
            preimage.to_string(),
        ));
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn settled_preimage(&self, r_hash: &str) -> Option<String> {
        self.inner.lock().unwrap().settled.get(r_hash).cloned()
    }

    pub fn invoice_settles(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().invoice_settles.clone()
    }

    fn deliver(&self, destination: &str, r_hash: &str, units: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(registration) = inner.clients.get(destination) else {
            return false;
        };
        registration
            .events
            .send(ClientEvent::HtlcAccepted {
                currency: registration.currency.clone(),
                r_hash: r_hash.to_string(),
                units,
            })
            .is_ok()
    }

    async fn wait_settled(&self, r_hash: &str) -> Option<String> {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Some(preimage) = self.settled_preimage(r_hash) {
                return Some(preimage);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}

pub struct MockSwapClient {
    currency: String,
    cltv_delta: u32,
    destination: String,
    network: Arc<MockNetwork>,
    events: mpsc::UnboundedSender<ClientEvent>,
    send_behavior: Mutex<SendBehavior>,
    lookup_override: Mutex<Option<PaymentState>>,
}

impl MockSwapClient {
    pub fn new(
        currency: &str,
        cltv_delta: u32,
        network: Arc<MockNetwork>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Arc<Self> {
        let destination = format!("mock:{currency}:{}", Uuid::new_v4());
        network.register(destination.clone(), currency.to_string(), events.clone());
        Arc::new(Self {
            currency: currency.to_string(),
            cltv_delta,
            destination,
            network,
            events,
            send_behavior: Mutex::new(SendBehavior::Deliver),
            lookup_override: Mutex::new(None),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        *self.send_behavior.lock().unwrap() = behavior;
    }

    pub fn set_lookup(&self, state: PaymentState) {
        *self.lookup_override.lock().unwrap() = Some(state);
    }
}

#[async_trait]
impl SwapClient for MockSwapClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Htlc
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn status(&self) -> ClientStatus {
        ClientStatus::ConnectionVerified
    }

    fn cltv_delta(&self) -> u32 {
        self.cltv_delta
    }

    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError> {
        match *self.send_behavior.lock().unwrap() {
            SendBehavior::FailFinal => {
                return Err(PaymentError::Final("mock rejection".into()));
            }
            SendBehavior::FailUnknown => {
                return Err(PaymentError::Unknown("mock daemon crashed".into()));
            }
            SendBehavior::Deliver => {}
        }
        if !self.network.deliver(&request.destination, &request.r_hash, request.units) {
            return Err(PaymentError::Final(format!(
                "unknown destination {}",
                request.destination
            )));
        }
        match self.network.wait_settled(&request.r_hash).await {
            Some(preimage) => Ok(preimage),
            None => Err(PaymentError::Unknown("settlement timed out".into())),
        }
    }

    async fn add_invoice(
        &self,
        _r_hash: &str,
        _units: u64,
        _cltv_delta: u32,
    ) -> Result<Option<String>, SwapClientError> {
        Ok(Some(self.destination.clone()))
    }

    async fn lookup_payment(&self, r_hash: &str) -> Result<PaymentState, SwapClientError> {
        if let Some(state) = self.lookup_override.lock().unwrap().clone() {
            return Ok(state);
        }
        match self.network.settled_preimage(r_hash) {
            Some(preimage) => Ok(PaymentState::Succeeded { preimage }),
            None => Ok(PaymentState::Pending),
        }
    }

    async fn settle_invoice(
        &self,
        r_hash: &str,
        r_preimage: &str,
    ) -> Result<(), SwapClientError> {
        self.network.settle(&self.currency, r_hash, r_preimage);
        Ok(())
    }

    async fn remove_invoice(&self, _r_hash: &str) -> Result<(), SwapClientError> {
        Ok(())
    }

    async fn channel_balance(&self) -> Result<ChannelBalance, SwapClientError> {
        Ok(ChannelBalance {
            local: u64::MAX / 2,
            remote: u64::MAX / 2,
            inactive: 0,
            pending_open: 0,
        })
    }

    async fn open_channel(
        &self,
        _remote_identifier: &str,
        _capacity: u64,
    ) -> Result<(), SwapClientError> {
        Ok(())
    }

    async fn close_channel(
        &self,
        _remote_identifier: &str,
        _force: bool,
    ) -> Result<(), SwapClientError> {
        Ok(())
    }

    async fn deposit(&self, _units: u64) -> Result<String, SwapClientError> {
        Ok("mock-deposit-address".into())
    }

    async fn verify_connection(&self) -> Result<(), SwapClientError> {
        let _ = self.events.send(ClientEvent::ConnectionVerified {
            currency: self.currency.clone(),
        });
        Ok(())
    }
}

pub struct TestNode {
    pub node: Node,
    pub clients: HashMap<String, Arc<MockSwapClient>>,
    pub store: Arc<Mutex<SqliteStore>>,
}

impl TestNode {
    pub fn pub_key(&self) -> String {
        self.node.pool().node_pub_key().to_string()
    }

    pub fn uri(&self) -> String {
        self.node.pool().node_uri().expect("node is listening")
    }

    pub fn client(&self, currency: &str) -> &Arc<MockSwapClient> {
        &self.clients[currency]
    }
}

/// Start a listening node with mock swap clients for the given currencies
/// (symbol, decimal places, cltv delta) and the given pairs.
pub async fn start_node(
    network: &Arc<MockNetwork>,
    currencies: &[(&str, u8, u32)],
    pairs: &[(&str, &str)],
) -> TestNode {
    let store = Arc::new(Mutex::new(
        SqliteStore::open_in_memory().expect("open in-memory store"),
    ));
    let (manager, client_events) = SwapClientManager::new();
    let manager = Arc::new(manager);

    let mut clients = HashMap::new();
    for (symbol, _, cltv_delta) in currencies {
        let client = MockSwapClient::new(symbol, *cltv_delta, network.clone(), manager.events_sender());
        manager.add_client(client.clone());
        clients.insert(symbol.to_string(), client);
    }

    let cfg = NodeConfig {
        network: "testnet".into(),
        listen_addr: Some("127.0.0.1:0".parse::<SocketAddr>().unwrap()),
        advertised_addresses: Vec::new(),
        tor_enabled: false,
        reconnect: true,
        node_key: None,
    };
    let node = Node::start(cfg, store.clone(), manager, client_events)
        .await
        .expect("start node");

    for (symbol, decimal_places, _) in currencies {
        node.service()
            .add_currency(
                Currency {
                    symbol: symbol.to_string(),
                    decimal_places: *decimal_places,
                    backend: BackendKind::Htlc,
                    token_address: None,
                },
                None,
            )
            .expect("add currency");
    }
    for (base, quote) in pairs {
        node.service().add_pair(base, quote).expect("add pair");
    }

    TestNode {
        node,
        clients,
        store,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
