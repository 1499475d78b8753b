use anyhow::{Context as _, Result};
use rust_decimal::Decimal;
use uuid::Uuid;

use chandex::market::{BackendKind, Currency, Order, OrderSource, Pair};
use chandex::store::{NodeRecord, SqliteStore};
use chandex::swap::{SwapDeal, SwapPhase, SwapRole, SwapState};

fn sample_order(local_id: &str, quantity: i64) -> Order {
    Order {
        id: Uuid::new_v4(),
        pair_id: "BTC/USDT".into(),
        quantity,
        price: Some(Decimal::new(425, 1)),
        created_at: 1_700_000_000_000,
        initial_quantity: quantity.unsigned_abs(),
        hold: 0,
        source: OrderSource::Own {
            local_id: local_id.to_string(),
            ttl_ms: Some(60_000),
        },
    }
}

fn sample_deal(r_hash: &str, order_id: Uuid) -> SwapDeal {
    SwapDeal {
        r_hash: r_hash.to_string(),
        r_preimage: None,
        role: SwapRole::Maker,
        phase: SwapPhase::SwapAccepted,
        state: SwapState::Active,
        error: None,
        peer_pub_key: "02".repeat(33),
        pair_id: "BTC/USDT".into(),
        quantity: 250,
        price: Decimal::new(425, 1),
        taker_currency: "BTC".into(),
        maker_currency: "USDT".into(),
        taker_units: 250,
        maker_units: 10_625,
        taker_cltv_delta: 576,
        maker_cltv_delta: 40,
        maker_order_id: order_id,
        taker_order_id: Uuid::nil(),
        destination: Some("destination".into()),
        hold_active: true,
        created_at: 1_700_000_000_500,
        executed_at: None,
        completed_at: None,
    }
}

#[test]
fn currencies_and_pairs_round_trip() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        SqliteStore::open(dir.path().join("chandex.db")).context("open sqlite store")?;

    let btc = Currency {
        symbol: "BTC".into(),
        decimal_places: 8,
        backend: BackendKind::Htlc,
        token_address: None,
    };
    let usdt = Currency {
        symbol: "USDT".into(),
        decimal_places: 6,
        backend: BackendKind::HashlockTransfer,
        token_address: Some("0xdac17f958d2ee523a2206206994597c13d831ec7".into()),
    };
    store.insert_currency(&btc).context("insert BTC")?;
    store.insert_currency(&usdt).context("insert USDT")?;
    assert!(store.insert_currency(&btc).is_err(), "duplicate currency");

    let listed = store.list_currencies().context("list currencies")?;
    assert_eq!(listed, vec![btc, usdt]);

    store.insert_pair(&Pair::new("BTC", "USDT")).context("insert pair")?;
    let pairs = store.list_pairs().context("list pairs")?;
    assert_eq!(pairs, vec![Pair::new("BTC", "USDT")]);

    store.delete_pair("BTC/USDT").context("delete pair")?;
    assert!(store.list_pairs()?.is_empty());
    let err = store.delete_pair("BTC/USDT").unwrap_err();
    assert!(err.to_string().contains("pair not found"));

    store.delete_currency("USDT").context("delete currency")?;
    assert_eq!(store.list_currencies()?.len(), 1);
    Ok(())
}

#[test]
fn node_records_persist_reputation_and_ban() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        SqliteStore::open(dir.path().join("chandex.db")).context("open sqlite store")?;

    let mut node = NodeRecord {
        pub_key: "03".repeat(33),
        addresses: vec!["127.0.0.1:18885".into(), "example.com:18885".into()],
        score: 0,
        banned: false,
        last_seen: 1_700_000_000_000,
    };
    store.upsert_node(&node).context("insert node")?;

    node.score = -55;
    node.banned = true;
    store.upsert_node(&node).context("update node")?;

    let got = store
        .get_node(&node.pub_key)
        .context("get node")?
        .context("node missing")?;
    assert_eq!(got, node);
    assert!(store.get_node("missing")?.is_none());
    assert_eq!(store.list_nodes()?.len(), 1);
    Ok(())
}

#[test]
fn own_orders_round_trip_and_update() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        SqliteStore::open(dir.path().join("chandex.db")).context("open sqlite store")?;

    let mut order = sample_order("local-a", -500);
    store.upsert_order(&order).context("insert order")?;

    order.quantity = -300;
    order.hold = 100;
    store.upsert_order(&order).context("update order")?;

    let listed = store.list_orders().context("list orders")?;
    assert_eq!(listed, vec![order.clone()]);

    // peer orders never hit the store
    let peer = Order {
        source: OrderSource::Peer {
            peer_pub_key: "02".repeat(33),
            destination: None,
        },
        ..sample_order("ignored", 10)
    };
    assert!(store.upsert_order(&peer).is_err());

    store.delete_order(&order.id).context("delete order")?;
    assert!(store.list_orders()?.is_empty());
    Ok(())
}

#[test]
fn deals_round_trip_through_phases() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        SqliteStore::open(dir.path().join("chandex.db")).context("open sqlite store")?;

    let order_id = Uuid::new_v4();
    let mut deal = sample_deal(&"ab".repeat(32), order_id);
    store.upsert_deal(&deal).context("insert deal")?;

    let got = store
        .get_deal(&deal.r_hash)
        .context("get deal")?
        .context("deal missing")?;
    assert_eq!(got, deal);

    deal.phase = SwapPhase::SwapCompleted;
    deal.state = SwapState::Completed;
    deal.r_preimage = Some("cd".repeat(32));
    deal.hold_active = false;
    deal.executed_at = Some(1_700_000_001_000);
    deal.completed_at = Some(1_700_000_002_000);
    store.upsert_deal(&deal).context("update deal")?;

    let got = store
        .get_deal(&deal.r_hash)
        .context("get updated deal")?
        .context("deal missing after update")?;
    assert_eq!(got, deal);

    // a second, unresolved deal shows up in the recovery listing
    let pending = SwapDeal {
        state: SwapState::Error,
        ..sample_deal(&"ef".repeat(32), order_id)
    };
    store.upsert_deal(&pending).context("insert pending deal")?;

    let unresolved = store.list_unresolved_deals().context("list unresolved")?;
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].r_hash, pending.r_hash);
    assert_eq!(store.list_deals()?.len(), 2);
    Ok(())
}

#[test]
fn reopening_preserves_state() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("chandex.db");

    {
        let mut store = SqliteStore::open(path.clone()).context("open store")?;
        store.insert_currency(&Currency {
            symbol: "BTC".into(),
            decimal_places: 8,
            backend: BackendKind::Htlc,
            token_address: None,
        })?;
        store.upsert_order(&sample_order("survivor", 42))?;
    }

    let store = SqliteStore::open(path).context("reopen store")?;
    assert_eq!(store.list_currencies()?.len(), 1);
    let orders = store.list_orders()?;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].local_id(), Some("survivor"));
    assert_eq!(orders[0].quantity, 42);
    Ok(())
}
