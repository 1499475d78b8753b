//! Single-connection sqlite store for currencies, pairs, nodes, own orders
//! and swap deals. Writers share the connection behind a mutex, which is the
//! serialization point for all persistent state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::market::{BackendKind, Currency, NodePubKey, Order, OrderSource, Pair};
use crate::swap::{
    SwapDeal, phase_from_str, phase_to_str, role_from_str, role_to_str, state_from_str,
    state_to_str,
};

/// Persistent record of a known peer node. Created on first successful
/// handshake, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub pub_key: NodePubKey,
    pub addresses: Vec<String>,
    pub score: i64,
    pub banned: bool,
    pub last_seen: u64,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self {
            conn,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_currency(&mut self, currency: &Currency) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO currencies (symbol, decimal_places, backend, token_address)
VALUES (?1, ?2, ?3, ?4)
"#,
                params![
                    &currency.symbol,
                    currency.decimal_places,
                    currency.backend.as_str(),
                    currency.token_address.as_deref(),
                ],
            )
            .with_context(|| format!("insert currency {}", currency.symbol))?;
        Ok(())
    }

    pub fn list_currencies(&self) -> Result<Vec<Currency>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, decimal_places, backend, token_address FROM currencies ORDER BY symbol")
            .context("prepare list currencies")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map([], |row| {
                let backend: String = row.get(2)?;
                Ok(Currency {
                    symbol: row.get(0)?,
                    decimal_places: row.get(1)?,
                    backend: BackendKind::parse(&backend).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            format!("unknown backend kind: {backend}").into(),
                        )
                    })?,
                    token_address: row.get(3)?,
                })
            })
            .context("query currencies")?;
        for row in rows {
            out.push(row.context("read currency row")?);
        }
        Ok(out)
    }

    pub fn delete_currency(&mut self, symbol: &str) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM currencies WHERE symbol = ?1", params![symbol])
            .with_context(|| format!("delete currency {symbol}"))?;
        anyhow::ensure!(rows == 1, "currency not found: {symbol}");
        Ok(())
    }

    pub fn insert_pair(&mut self, pair: &Pair) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pairs (id, base, quote) VALUES (?1, ?2, ?3)",
                params![pair.id(), &pair.base, &pair.quote],
            )
            .with_context(|| format!("insert pair {}", pair.id()))?;
        Ok(())
    }

    pub fn list_pairs(&self) -> Result<Vec<Pair>> {
        let mut stmt = self
            .conn
            .prepare("SELECT base, quote FROM pairs ORDER BY id")
            .context("prepare list pairs")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map([], |row| {
                Ok(Pair {
                    base: row.get(0)?,
                    quote: row.get(1)?,
                })
            })
            .context("query pairs")?;
        for row in rows {
            out.push(row.context("read pair row")?);
        }
        Ok(out)
    }

    pub fn delete_pair(&mut self, pair_id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM pairs WHERE id = ?1", params![pair_id])
            .with_context(|| format!("delete pair {pair_id}"))?;
        anyhow::ensure!(rows == 1, "pair not found: {pair_id}");
        Ok(())
    }

    pub fn upsert_node(&mut self, node: &NodeRecord) -> Result<()> {
        let addresses =
            serde_json::to_string(&node.addresses).context("encode node addresses")?;
        self.conn
            .execute(
                r#"
INSERT INTO nodes (pub_key, addresses, score, banned, last_seen)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(pub_key) DO UPDATE SET
  addresses = excluded.addresses,
  score = excluded.score,
  banned = excluded.banned,
  last_seen = excluded.last_seen
"#,
                params![
                    &node.pub_key,
                    addresses,
                    node.score,
                    node.banned,
                    node.last_seen as i64,
                ],
            )
            .with_context(|| format!("upsert node {}", node.pub_key))?;
        Ok(())
    }

    pub fn get_node(&self, pub_key: &str) -> Result<Option<NodeRecord>> {
        self.conn
            .query_row(
                "SELECT pub_key, addresses, score, banned, last_seen FROM nodes WHERE pub_key = ?1",
                params![pub_key],
                row_to_node_record,
            )
            .optional()
            .with_context(|| format!("get node {pub_key}"))
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pub_key, addresses, score, banned, last_seen FROM nodes ORDER BY pub_key")
            .context("prepare list nodes")?;

        let mut out = Vec::new();
        let rows = stmt.query_map([], row_to_node_record).context("query nodes")?;
        for row in rows {
            out.push(row.context("read node row")?);
        }
        Ok(out)
    }

    pub fn upsert_order(&mut self, order: &Order) -> Result<()> {
        let OrderSource::Own { local_id, ttl_ms } = &order.source else {
            anyhow::bail!("only own orders are persisted: {}", order.id);
        };
        self.conn
            .execute(
                r#"
INSERT INTO orders (id, pair_id, local_id, price, quantity, initial_quantity, hold, created_at, ttl_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(id) DO UPDATE SET
  quantity = excluded.quantity,
  hold = excluded.hold
"#,
                params![
                    order.id.to_string(),
                    &order.pair_id,
                    local_id,
                    order.price.map(|p| p.to_string()),
                    order.quantity,
                    order.initial_quantity as i64,
                    order.hold as i64,
                    order.created_at as i64,
                    ttl_ms.map(|t| t as i64),
                ],
            )
            .with_context(|| format!("upsert order {}", order.id))?;
        Ok(())
    }

    pub fn delete_order(&mut self, id: &Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM orders WHERE id = ?1", params![id.to_string()])
            .with_context(|| format!("delete order {id}"))?;
        Ok(())
    }

    pub fn list_orders(&self) -> Result<Vec<Order>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT id, pair_id, local_id, price, quantity, initial_quantity, hold, created_at, ttl_ms
FROM orders
ORDER BY created_at
"#,
            )
            .context("prepare list orders")?;

        let mut out = Vec::new();
        let rows = stmt.query_map([], row_to_order).context("query orders")?;
        for row in rows {
            out.push(row.context("read order row")?);
        }
        Ok(out)
    }

    pub fn upsert_deal(&mut self, deal: &SwapDeal) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO deals (
  r_hash, r_preimage, role, phase, state, error,
  peer_pub_key, pair_id, quantity, price,
  taker_currency, maker_currency, taker_units, maker_units,
  taker_cltv_delta, maker_cltv_delta, maker_order_id, taker_order_id,
  destination, hold_active, created_at, executed_at, completed_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
  ?17, ?18, ?19, ?20, ?21, ?22, ?23
)
ON CONFLICT(r_hash) DO UPDATE SET
  r_preimage = excluded.r_preimage,
  phase = excluded.phase,
  state = excluded.state,
  error = excluded.error,
  destination = excluded.destination,
  hold_active = excluded.hold_active,
  taker_units = excluded.taker_units,
  maker_units = excluded.maker_units,
  maker_cltv_delta = excluded.maker_cltv_delta,
  quantity = excluded.quantity,
  executed_at = excluded.executed_at,
  completed_at = excluded.completed_at
"#,
                params![
                    &deal.r_hash,
                    deal.r_preimage.as_deref(),
                    role_to_str(deal.role),
                    phase_to_str(deal.phase),
                    state_to_str(deal.state),
                    deal.error.as_deref(),
                    &deal.peer_pub_key,
                    &deal.pair_id,
                    deal.quantity as i64,
                    deal.price.to_string(),
                    &deal.taker_currency,
                    &deal.maker_currency,
                    deal.taker_units as i64,
                    deal.maker_units as i64,
                    deal.taker_cltv_delta,
                    deal.maker_cltv_delta,
                    deal.maker_order_id.to_string(),
                    deal.taker_order_id.to_string(),
                    deal.destination.as_deref(),
                    deal.hold_active,
                    deal.created_at as i64,
                    deal.executed_at.map(|t| t as i64),
                    deal.completed_at.map(|t| t as i64),
                ],
            )
            .with_context(|| format!("upsert deal {}", deal.r_hash))?;
        Ok(())
    }

    pub fn get_deal(&self, r_hash: &str) -> Result<Option<SwapDeal>> {
        self.conn
            .query_row(
                &format!("{DEAL_SELECT} WHERE r_hash = ?1"),
                params![r_hash],
                row_to_deal,
            )
            .optional()
            .with_context(|| format!("get deal {r_hash}"))
    }

    pub fn list_deals(&self) -> Result<Vec<SwapDeal>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{DEAL_SELECT} ORDER BY created_at"))
            .context("prepare list deals")?;

        let mut out = Vec::new();
        let rows = stmt.query_map([], row_to_deal).context("query deals")?;
        for row in rows {
            out.push(row.context("read deal row")?);
        }
        Ok(out)
    }

    /// Deals that may still need driving or recovery.
    pub fn list_unresolved_deals(&self) -> Result<Vec<SwapDeal>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{DEAL_SELECT} WHERE state IN ('active', 'error') ORDER BY created_at"
            ))
            .context("prepare list unresolved deals")?;

        let mut out = Vec::new();
        let rows = stmt.query_map([], row_to_deal).context("query unresolved deals")?;
        for row in rows {
            out.push(row.context("read deal row")?);
        }
        Ok(out)
    }
}

const DEAL_SELECT: &str = r#"
SELECT
  r_hash, r_preimage, role, phase, state, error,
  peer_pub_key, pair_id, quantity, price,
  taker_currency, maker_currency, taker_units, maker_units,
  taker_cltv_delta, maker_cltv_delta, maker_order_id, taker_order_id,
  destination, hold_active, created_at, executed_at, completed_at
FROM deals
"#;

fn row_to_node_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
    let addresses: String = row.get(1)?;
    let addresses = serde_json::from_str(&addresses).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("invalid address list: {e}").into(),
        )
    })?;
    let last_seen: i64 = row.get(4)?;
    Ok(NodeRecord {
        pub_key: row.get(0)?,
        addresses,
        score: row.get(2)?,
        banned: row.get(3)?,
        last_seen: u64_from(last_seen, 4)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let id: String = row.get(0)?;
    let price: Option<String> = row.get(3)?;
    let initial_quantity: i64 = row.get(5)?;
    let hold: i64 = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    let ttl_ms: Option<i64> = row.get(8)?;

    Ok(Order {
        id: uuid_from(&id, 0)?,
        pair_id: row.get(1)?,
        quantity: row.get(4)?,
        price: price.map(|p| decimal_from(&p, 3)).transpose()?,
        created_at: u64_from(created_at, 7)?,
        initial_quantity: u64_from(initial_quantity, 5)?,
        hold: u64_from(hold, 6)?,
        source: OrderSource::Own {
            local_id: row.get(2)?,
            ttl_ms: ttl_ms.map(|t| u64_from(t, 8)).transpose()?,
        },
    })
}

fn row_to_deal(row: &rusqlite::Row<'_>) -> rusqlite::Result<SwapDeal> {
    let role: String = row.get(2)?;
    let phase: String = row.get(3)?;
    let state: String = row.get(4)?;
    let quantity: i64 = row.get(8)?;
    let price: String = row.get(9)?;
    let taker_units: i64 = row.get(12)?;
    let maker_units: i64 = row.get(13)?;
    let maker_order_id: String = row.get(16)?;
    let taker_order_id: String = row.get(17)?;
    let created_at: i64 = row.get(20)?;
    let executed_at: Option<i64> = row.get(21)?;
    let completed_at: Option<i64> = row.get(22)?;

    Ok(SwapDeal {
        r_hash: row.get(0)?,
        r_preimage: row.get(1)?,
        role: role_from_str(&role).ok_or_else(|| conversion(2, &role, "swap role"))?,
        phase: phase_from_str(&phase).ok_or_else(|| conversion(3, &phase, "swap phase"))?,
        state: state_from_str(&state).ok_or_else(|| conversion(4, &state, "swap state"))?,
        error: row.get(5)?,
        peer_pub_key: row.get(6)?,
        pair_id: row.get(7)?,
        quantity: u64_from(quantity, 8)?,
        price: decimal_from(&price, 9)?,
        taker_currency: row.get(10)?,
        maker_currency: row.get(11)?,
        taker_units: u64_from(taker_units, 12)?,
        maker_units: u64_from(maker_units, 13)?,
        taker_cltv_delta: row.get(14)?,
        maker_cltv_delta: row.get(15)?,
        maker_order_id: uuid_from(&maker_order_id, 16)?,
        taker_order_id: uuid_from(&taker_order_id, 17)?,
        destination: row.get(18)?,
        hold_active: row.get(19)?,
        created_at: u64_from(created_at, 20)?,
        executed_at: executed_at.map(|t| u64_from(t, 21)).transpose()?,
        completed_at: completed_at.map(|t| u64_from(t, 22)).transpose()?,
    })
}

fn u64_from(value: i64, col: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("invalid unsigned value {value}").into(),
        )
    })
}

fn uuid_from(value: &str, col: usize) -> rusqlite::Result<Uuid> {
    Uuid::from_str(value).map_err(|_| conversion(col, value, "uuid"))
}

fn decimal_from(value: &str, col: usize) -> rusqlite::Result<Decimal> {
    Decimal::from_str(value).map_err(|_| conversion(col, value, "decimal"))
}

fn conversion(col: usize, value: &str, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        format!("invalid {what}: {value}").into(),
    )
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS currencies (
  symbol TEXT PRIMARY KEY,
  decimal_places INTEGER NOT NULL,
  backend TEXT NOT NULL,
  token_address TEXT
);

CREATE TABLE IF NOT EXISTS pairs (
  id TEXT PRIMARY KEY,
  base TEXT NOT NULL,
  quote TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
  pub_key TEXT PRIMARY KEY,
  addresses TEXT NOT NULL,
  score INTEGER NOT NULL DEFAULT 0,
  banned INTEGER NOT NULL DEFAULT 0,
  last_seen INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS orders (
  id TEXT PRIMARY KEY,
  pair_id TEXT NOT NULL,
  local_id TEXT NOT NULL,
  price TEXT,
  quantity INTEGER NOT NULL,
  initial_quantity INTEGER NOT NULL,
  hold INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  ttl_ms INTEGER
);
CREATE INDEX IF NOT EXISTS orders_pair_id_idx ON orders(pair_id);
CREATE UNIQUE INDEX IF NOT EXISTS orders_local_id_idx ON orders(local_id);

CREATE TABLE IF NOT EXISTS deals (
  r_hash TEXT PRIMARY KEY,
  r_preimage TEXT,
  role TEXT NOT NULL,
  phase TEXT NOT NULL,
  state TEXT NOT NULL,
  error TEXT,
  peer_pub_key TEXT NOT NULL,
  pair_id TEXT NOT NULL,
  quantity INTEGER NOT NULL,
  price TEXT NOT NULL,
  taker_currency TEXT NOT NULL,
  maker_currency TEXT NOT NULL,
  taker_units INTEGER NOT NULL,
  maker_units INTEGER NOT NULL,
  taker_cltv_delta INTEGER NOT NULL,
  maker_cltv_delta INTEGER NOT NULL,
  maker_order_id TEXT NOT NULL,
  taker_order_id TEXT NOT NULL,
  destination TEXT,
  hold_active INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  executed_at INTEGER,
  completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS deals_state_idx ON deals(state);
"#,
    )
    .context("create tables")?;

    ensure_columns(conn).context("ensure columns")?;
    Ok(())
}

fn ensure_columns(conn: &Connection) -> Result<()> {
    let order_cols = table_columns(conn, "orders").context("read orders columns")?;
    ensure_column(conn, "orders", &order_cols, "ttl_ms", "INTEGER")?;

    let deal_cols = table_columns(conn, "deals").context("read deals columns")?;
    ensure_column(conn, "deals", &deal_cols, "destination", "TEXT")?;
    ensure_column(
        conn,
        "deals",
        &deal_cols,
        "hold_active",
        "INTEGER NOT NULL DEFAULT 0",
    )?;

    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("prepare PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([]).context("query PRAGMA table_info")?;

    let mut out = HashSet::new();
    while let Some(row) = rows.next().context("read PRAGMA row")? {
        let name: String = row.get(1)?;
        out.insert(name);
    }
    Ok(out)
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    columns: &HashSet<String>,
    name: &str,
    decl: &str,
) -> Result<()> {
    if columns.contains(name) {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"), [])
        .with_context(|| format!("add column {table}.{name}"))?;
    Ok(())
}
