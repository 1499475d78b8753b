//! Peer pool behavior over real localhost connections: handshake policy,
//! reconnects and gossip-driven order import.

mod support;

use std::time::Duration;

use rust_decimal::Decimal;

use chandex::p2p::P2pError;
use chandex::p2p::packet::DisconnectReason;
use support::{MockNetwork, start_node, wait_until};

const CURRENCIES: &[(&str, u8, u32)] = &[("BTC", 8, 576), ("USDT", 8, 40)];
const PAIRS: &[(&str, &str)] = &[("BTC", "USDT")];

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_self_is_rejected() {
    let net = MockNetwork::new();
    let node = start_node(&net, CURRENCIES, PAIRS).await;

    let err = node
        .node
        .service()
        .connect(&node.uri(), false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot attempt connection to self"));
    assert!(node.node.service().list_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_expected_pub_key_is_rejected() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    let wrong_key = chandex::p2p::generate_node_key();
    let addr = node2.uri().split_once('@').unwrap().1.to_string();
    let err = node1
        .node
        .pool()
        .add_outbound(addr, wrong_key.clone(), false)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains(&wrong_key), "missing expected key: {message}");
    assert!(message.contains(&node2.pub_key()), "missing actual key: {message}");
    assert!(node1.node.service().list_peers().is_empty());
    // the rejected side eventually drops the half-open connection too
    assert!(
        wait_until(Duration::from_secs(3), || {
            node2.node.service().list_peers().is_empty()
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_connect_is_rejected() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    node1.node.service().connect(&node2.uri(), false).await.unwrap();
    let err = node1
        .node
        .service()
        .connect(&node2.uri(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, P2pError::AlreadyConnected(_)));
    assert!(err.to_string().contains("already connected"));
    assert_eq!(node1.node.service().list_peers().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_peer_reconnects_after_remote_shutdown() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    node1.node.service().connect(&node2.uri(), false).await.unwrap();
    let node1_key = node1.pub_key();
    let node2_key = node2.pub_key();

    // the remote says goodbye; our side of the connection was outbound, so
    // a reconnect attempt must follow
    node2
        .node
        .pool()
        .disconnect_peer(&node1_key, DisconnectReason::Shutdown)
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || {
            !node1.node.pool().is_connected(&node2_key)
                || node1.node.pool().retrying(&node2_key)
        })
        .await
    );
    assert!(
        wait_until(Duration::from_secs(8), || {
            node1.node.pool().is_connected(&node2_key)
        })
        .await,
        "outbound peer should reconnect after remote shutdown"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_peer_is_not_retried_after_remote_shutdown() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    // node2's view of node1 is inbound
    node1.node.service().connect(&node2.uri(), false).await.unwrap();
    let node1_key = node1.pub_key();
    let node2_key = node2.pub_key();

    node1
        .node
        .pool()
        .disconnect_peer(&node2_key, DisconnectReason::Shutdown)
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            node2.node.service().list_peers().is_empty()
        })
        .await
    );
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!node2.node.pool().is_connected(&node1_key));
    assert!(!node2.node.pool().retrying(&node1_key));
}

#[tokio::test(flavor = "multi_thread")]
async fn banned_node_is_refused_on_connect() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    node1.node.service().ban(&node2.pub_key()).unwrap();
    let err = node1
        .node
        .service()
        .connect(&node2.uri(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, P2pError::Banned(_)));

    // inbound attempts from the banned node are rejected at the handshake
    let err = node2
        .node
        .service()
        .connect(&node1.uri(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, P2pError::Rejected(DisconnectReason::Banned)));

    node1.node.service().unban(&node2.pub_key()).unwrap();
    node2.node.service().connect(&node1.uri(), false).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            node1.node.service().list_peers().len() == 1
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn orders_gossip_and_are_purged_on_disconnect() {
    let net = MockNetwork::new();
    let node1 = start_node(&net, CURRENCIES, PAIRS).await;
    let node2 = start_node(&net, CURRENCIES, PAIRS).await;

    node1.node.service().connect(&node2.uri(), false).await.unwrap();

    // a remainder rests on node1 and gossips to node2
    let result = node1
        .node
        .service()
        .place_order_sync("BTC/USDT", "sell-1", -100, Some(Decimal::from(5)), None)
        .await
        .unwrap();
    assert!(result.remaining.is_some());

    assert!(
        order_count_becomes(&node2, 1, Duration::from_secs(5)).await,
        "peer order should arrive via gossip"
    );

    let orders = node2
        .node
        .service()
        .list_orders(Some("BTC/USDT"))
        .await
        .unwrap();
    assert_eq!(orders[0].peer_pub_key(), Some(node1.pub_key().as_str()));
    assert_eq!(orders[0].quantity, -100);

    // after the close every order sourced from node1 is gone
    node1
        .node
        .pool()
        .disconnect_peer(&node2.pub_key(), DisconnectReason::Shutdown)
        .unwrap();
    assert!(
        order_count_becomes(&node2, 0, Duration::from_secs(5)).await,
        "peer orders should be purged on disconnect"
    );
}

async fn order_count_becomes(node: &support::TestNode, want: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = node
            .node
            .service()
            .list_orders(Some("BTC/USDT"))
            .await
            .map(|orders| orders.len())
            .unwrap_or(usize::MAX);
        if count == want {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
