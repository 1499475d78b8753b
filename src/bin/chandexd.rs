use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use clap::Parser as _;

use chandex::market::{BackendKind, Currency};
use chandex::node::{Node, NodeConfig};
use chandex::store::SqliteStore;
use chandex::swap::manager::{BackendConfig, SwapClientManager};

#[derive(Debug, clap::Parser)]
#[command(name = "chandexd", about = "Decentralized exchange daemon")]
struct Args {
    #[arg(long, default_value = "simnet")]
    network: String,

    #[arg(long, default_value = "0.0.0.0:18885")]
    listen_addr: SocketAddr,

    /// Disable the p2p listener (outbound connections only).
    #[arg(long)]
    no_listen: bool,

    /// Addresses advertised to peers, host:port.
    #[arg(long = "advertise")]
    advertised_addresses: Vec<String>,

    #[arg(long, default_value = "chandex.db")]
    db_path: PathBuf,

    /// Allow connections to .onion addresses.
    #[arg(long)]
    tor: bool,

    /// Disable automatic reconnects to dropped outbound peers.
    #[arg(long)]
    no_reconnect: bool,

    /// Currency spec: SYMBOL:DECIMALS:KIND[:CLTV], e.g. BTC:8:htlc:144.
    #[arg(long = "currency")]
    currencies: Vec<String>,

    /// Payment daemon for a currency: SYMBOL=URL.
    #[arg(long = "backend-url")]
    backend_urls: Vec<String>,

    /// Trading pair, BASE/QUOTE.
    #[arg(long = "pair")]
    pairs: Vec<String>,

    /// Peers to connect to at startup: <pubkey>@<host>:<port>.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

fn parse_currency(spec: &str) -> Result<(Currency, u32)> {
    let parts: Vec<&str> = spec.split(':').collect();
    anyhow::ensure!(
        parts.len() == 3 || parts.len() == 4,
        "currency spec must be SYMBOL:DECIMALS:KIND[:CLTV], got {spec}"
    );
    let decimal_places: u8 = parts[1]
        .parse()
        .with_context(|| format!("invalid decimal places in {spec}"))?;
    let backend = BackendKind::parse(parts[2])
        .with_context(|| format!("unknown backend kind in {spec}"))?;
    let cltv_delta: u32 = match parts.get(3) {
        Some(raw) => raw.parse().with_context(|| format!("invalid cltv in {spec}"))?,
        None => 144,
    };
    Ok((
        Currency {
            symbol: parts[0].to_uppercase(),
            decimal_places,
            backend,
            token_address: None,
        },
        cltv_delta,
    ))
}

fn backend_url<'a>(urls: &'a [String], symbol: &str) -> Option<&'a str> {
    urls.iter().find_map(|entry| {
        let (sym, url) = entry.split_once('=')?;
        (sym.eq_ignore_ascii_case(symbol)).then_some(url)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    chandex::logging::init().ok();
    let args = Args::parse();

    let store = SqliteStore::open(args.db_path.clone()).context("open store")?;
    let store = Arc::new(Mutex::new(store));

    let (manager, client_events) = SwapClientManager::new();
    let manager = Arc::new(manager);

    let cfg = NodeConfig {
        network: args.network.clone(),
        listen_addr: (!args.no_listen).then_some(args.listen_addr),
        advertised_addresses: args.advertised_addresses.clone(),
        tor_enabled: args.tor,
        reconnect: !args.no_reconnect,
        node_key: None,
    };

    let node = Node::start(cfg, store, manager.clone(), client_events)
        .await
        .context("start node")?;
    let service = node.service().clone();

    for spec in &args.currencies {
        let (currency, cltv_delta) = parse_currency(spec)?;
        let backend = backend_url(&args.backend_urls, &currency.symbol).map(|url| BackendConfig {
            currency: currency.symbol.clone(),
            url: url.to_string(),
            cltv_delta,
        });
        match service.add_currency(currency.clone(), backend.clone()) {
            Ok(()) => tracing::info!(symbol = %currency.symbol, "currency added"),
            Err(err) => {
                // already persisted from an earlier run; the client still
                // needs constructing
                tracing::debug!(symbol = %currency.symbol, error = %err, "currency not added");
                if let Some(backend) = backend {
                    manager.init_currency(&currency, &backend);
                }
            }
        }
    }
    for pair in &args.pairs {
        let Some((base, quote)) = pair.split_once('/') else {
            anyhow::bail!("pair must be BASE/QUOTE, got {pair}");
        };
        match service.add_pair(&base.to_uppercase(), &quote.to_uppercase()) {
            Ok(()) => tracing::info!(%pair, "pair added"),
            Err(err) => tracing::debug!(%pair, error = %err, "pair not added"),
        }
    }
    manager.verify_connections().await;

    for uri in &args.peers {
        match service.connect(uri, true).await {
            Ok(peer) => tracing::info!(peer = %peer.pub_key, "connected"),
            Err(err) => tracing::warn!(%uri, error = %err, "startup connect failed"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = node.wait_for_shutdown() => {}
    }
    node.shutdown().await;
    Ok(())
}
