//! Crash recovery: deals reloaded from the store are resolved by looking
//! up their payment legs, exactly once, no matter how often the scan runs.

mod support;

use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use uuid::Uuid;

use chandex::market::book::OrderBook;
use chandex::market::{BackendKind, Currency, Pair};
use chandex::p2p::nodes::NodeList;
use chandex::p2p::{Pool, PoolConfig, generate_node_key};
use chandex::store::SqliteStore;
use chandex::swap::client::PaymentState;
use chandex::swap::manager::SwapClientManager;
use chandex::swap::swaps::{OrderHolds as _, Swaps, generate_preimage};
use chandex::swap::{SwapDeal, SwapPhase, SwapRole, SwapState};
use support::{MockNetwork, MockSwapClient};

struct Harness {
    swaps: Swaps,
    book: OrderBook,
    store: Arc<Mutex<SqliteStore>>,
    net: Arc<MockNetwork>,
    btc: Arc<MockSwapClient>,
    usdt: Arc<MockSwapClient>,
}

async fn harness() -> Harness {
    let store = Arc::new(Mutex::new(SqliteStore::open_in_memory().unwrap()));
    let nodes = Arc::new(NodeList::new(store.clone()));
    let (pool, _pool_events) = Pool::new(PoolConfig::default(), generate_node_key(), nodes);

    let (manager, _client_events) = SwapClientManager::new();
    let manager = Arc::new(manager);
    let net = MockNetwork::new();
    let btc = MockSwapClient::new("BTC", 576, net.clone(), manager.events_sender());
    let usdt = MockSwapClient::new("USDT", 40, net.clone(), manager.events_sender());
    manager.add_client(btc.clone());
    manager.add_client(usdt.clone());

    let book = OrderBook::new(store.clone(), pool.clone());
    for symbol in ["BTC", "USDT"] {
        book.add_currency(Currency {
            symbol: symbol.into(),
            decimal_places: 8,
            backend: BackendKind::Htlc,
            token_address: None,
        })
        .unwrap();
    }
    book.add_pair(Pair::new("BTC", "USDT")).unwrap();

    let swaps = Swaps::new(store.clone(), pool, manager, Arc::new(book.clone()));
    book.bind_swaps(swaps.clone());

    Harness {
        swaps,
        book,
        store,
        net,
        btc,
        usdt,
    }
}

/// A maker deal frozen mid-settlement, as left behind by a crash: the
/// first leg was dispatched, the hold is still reserved.
async fn seed_maker_deal(harness: &Harness, phase: SwapPhase) -> (String, String, Uuid) {
    let placed = harness
        .book
        .place_limit_order("BTC/USDT", "maker-sell", -100, Decimal::from(2), None)
        .await
        .unwrap();
    let order_id = placed.remaining.unwrap().id;
    harness.book.reserve("BTC/USDT", &order_id, 100).await.unwrap();

    let (preimage, r_hash) = generate_preimage();
    let deal = SwapDeal {
        r_hash: r_hash.clone(),
        r_preimage: None,
        role: SwapRole::Maker,
        phase,
        state: SwapState::Active,
        error: None,
        peer_pub_key: generate_node_key(),
        pair_id: "BTC/USDT".into(),
        quantity: 100,
        price: Decimal::from(2),
        taker_currency: "BTC".into(),
        maker_currency: "USDT".into(),
        taker_units: 100,
        maker_units: 200,
        taker_cltv_delta: 576,
        maker_cltv_delta: 40,
        maker_order_id: order_id,
        taker_order_id: Uuid::nil(),
        destination: Some("mock:taker:elsewhere".into()),
        hold_active: true,
        created_at: 1,
        executed_at: Some(1),
        completed_at: None,
    };
    harness
        .store
        .lock()
        .unwrap()
        .upsert_deal(&deal)
        .unwrap();
    (r_hash, preimage, order_id)
}

/// A taker deal frozen mid-settlement: the second leg was dispatched and
/// the preimage is ours, but the daemon died before settling the incoming
/// leg. Takers carry no hold; their matched portion never rests.
fn seed_taker_deal(harness: &Harness, phase: SwapPhase) -> (String, String) {
    let (preimage, r_hash) = generate_preimage();
    let deal = SwapDeal {
        r_hash: r_hash.clone(),
        r_preimage: Some(preimage.clone()),
        role: SwapRole::Taker,
        phase,
        state: SwapState::Active,
        error: None,
        peer_pub_key: generate_node_key(),
        pair_id: "BTC/USDT".into(),
        quantity: 100,
        price: Decimal::from(2),
        taker_currency: "BTC".into(),
        maker_currency: "USDT".into(),
        taker_units: 100,
        maker_units: 200,
        taker_cltv_delta: 576,
        maker_cltv_delta: 40,
        maker_order_id: Uuid::new_v4(),
        taker_order_id: Uuid::new_v4(),
        destination: Some("mock:maker:elsewhere".into()),
        hold_active: false,
        created_at: 1,
        executed_at: Some(1),
        completed_at: None,
    };
    harness
        .store
        .lock()
        .unwrap()
        .upsert_deal(&deal)
        .unwrap();
    (r_hash, preimage)
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_settles_incoming_after_crash_before_settle() {
    let harness = harness().await;
    let (r_hash, preimage, _order_id) = seed_maker_deal(&harness, SwapPhase::SendingPayment).await;

    assert_eq!(harness.swaps.load_deals().unwrap(), 1);
    // the maker's outgoing BTC payment turns out to have settled while the
    // daemon was down, revealing the preimage
    harness.btc.set_lookup(PaymentState::Succeeded {
        preimage: preimage.clone(),
    });

    harness.swaps.recover_deals().await;

    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Recovered);
    assert_eq!(deal.phase, SwapPhase::SwapCompleted);
    assert_eq!(deal.r_preimage.as_deref(), Some(preimage.as_str()));
    assert!(!deal.hold_active);
    assert!(deal.completed_at.is_some());

    // the incoming USDT leg was settled with the recovered preimage
    let settles = harness.net.invoice_settles();
    assert_eq!(settles.len(), 1);
    assert_eq!(settles[0], ("USDT".to_string(), r_hash.clone(), preimage));

    // the held quantity was consumed for good
    let orders = harness.book.list_orders(Some("BTC/USDT")).await.unwrap();
    assert!(orders.is_empty());

    // running recovery again must change nothing
    harness.swaps.recover_deals().await;
    let again = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(again, deal);
    assert_eq!(harness.net.invoice_settles().len(), 1);

    // the persisted record matches the in-memory resolution
    let stored = harness
        .store
        .lock()
        .unwrap()
        .get_deal(&r_hash)
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, SwapState::Recovered);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_settles_taker_incoming_after_crash_before_settle() {
    let harness = harness().await;
    let (r_hash, preimage) = seed_taker_deal(&harness, SwapPhase::SendingPayment);

    assert_eq!(harness.swaps.load_deals().unwrap(), 1);
    // the taker's outgoing USDT payment settled while the daemon was down
    harness.usdt.set_lookup(PaymentState::Succeeded {
        preimage: preimage.clone(),
    });

    harness.swaps.recover_deals().await;

    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Recovered);
    assert_eq!(deal.phase, SwapPhase::SwapCompleted);
    assert_eq!(deal.r_preimage.as_deref(), Some(preimage.as_str()));
    assert!(deal.completed_at.is_some());

    // the incoming BTC leg was settled with the taker's own preimage
    let settles = harness.net.invoice_settles();
    assert_eq!(settles.len(), 1);
    assert_eq!(settles[0], ("BTC".to_string(), r_hash.clone(), preimage));

    // running recovery again must change nothing
    harness.swaps.recover_deals().await;
    assert_eq!(harness.swaps.deal(&r_hash).unwrap(), deal);
    assert_eq!(harness.net.invoice_settles().len(), 1);

    let stored = harness
        .store
        .lock()
        .unwrap()
        .get_deal(&r_hash)
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, SwapState::Recovered);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_releases_hold_when_payment_failed() {
    let harness = harness().await;
    let (r_hash, _preimage, _order_id) = seed_maker_deal(&harness, SwapPhase::SendingPayment).await;

    harness.swaps.load_deals().unwrap();
    harness.btc.set_lookup(PaymentState::Failed);

    harness.swaps.recover_deals().await;

    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Error);
    assert!(deal.completed_at.is_some());
    assert!(!deal.hold_active);
    assert!(harness.net.invoice_settles().is_empty());

    // the full quantity is tradable again
    let orders = harness.book.list_orders(Some("BTC/USDT")).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].quantity, -100);
    assert_eq!(orders[0].hold, 0);

    // idempotent: a second scan leaves the resolved deal alone
    harness.swaps.recover_deals().await;
    assert_eq!(harness.swaps.deal(&r_hash).unwrap(), deal);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_abandons_deals_that_never_paid() {
    let harness = harness().await;
    let (r_hash, _preimage, _order_id) = seed_maker_deal(&harness, SwapPhase::SwapAccepted).await;

    harness.swaps.load_deals().unwrap();
    harness.swaps.recover_deals().await;

    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Error);
    assert!(deal.completed_at.is_some());
    assert!(!deal.hold_active);

    let orders = harness.book.list_orders(Some("BTC/USDT")).await.unwrap();
    assert_eq!(orders[0].hold, 0);
    assert_eq!(orders[0].quantity, -100);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_payments_are_left_for_the_next_scan() {
    let harness = harness().await;
    let (r_hash, preimage, _order_id) = seed_maker_deal(&harness, SwapPhase::SendingPayment).await;

    harness.swaps.load_deals().unwrap();
    harness.btc.set_lookup(PaymentState::Pending);
    harness.swaps.recover_deals().await;

    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Active);
    assert!(deal.completed_at.is_none());
    assert!(deal.hold_active);

    // once the payment resolves, the following scan completes the deal
    harness.btc.set_lookup(PaymentState::Succeeded {
        preimage: preimage.clone(),
    });
    harness.swaps.recover_deals().await;
    let deal = harness.swaps.deal(&r_hash).unwrap();
    assert_eq!(deal.state, SwapState::Recovered);
}
