//! Persistent address book and reputation ledger for known peer nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};

use crate::constants::BAN_THRESHOLD;
use crate::market::{NodePubKey, monotonic_ms};
use crate::store::{NodeRecord, SqliteStore};

/// Observable peer behavior mapped to a signed reputation delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    SwapSuccess,
    InvalidOrder,
    StalledResponse,
    MalformedPacket,
    SwapFault,
}

impl ReputationEvent {
    pub fn delta(&self) -> i64 {
        match self {
            ReputationEvent::SwapSuccess => 1,
            ReputationEvent::InvalidOrder => -5,
            ReputationEvent::StalledResponse => -5,
            ReputationEvent::MalformedPacket => -10,
            ReputationEvent::SwapFault => -20,
        }
    }
}

/// In-memory view of the node table. Records are created on first
/// handshake, mutated by reputation events and never deleted, so a ban
/// survives restarts.
pub struct NodeList {
    store: Arc<Mutex<SqliteStore>>,
    nodes: Mutex<HashMap<NodePubKey, NodeRecord>>,
}

impl NodeList {
    pub fn new(store: Arc<Mutex<SqliteStore>>) -> Self {
        Self {
            store,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the in-memory view from the store.
    pub fn load(&self) -> Result<usize> {
        let records = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_nodes()
            .context("list nodes")?;
        let mut nodes = self.nodes.lock().expect("node map poisoned");
        let count = records.len();
        *nodes = records.into_iter().map(|r| (r.pub_key.clone(), r)).collect();
        Ok(count)
    }

    /// Record a successful handshake: create the node on first contact and
    /// refresh its addresses and last-seen stamp.
    pub fn seen(&self, pub_key: &str, addresses: &[String]) -> Result<()> {
        let record = {
            let mut nodes = self.nodes.lock().expect("node map poisoned");
            let record = nodes.entry(pub_key.to_string()).or_insert_with(|| NodeRecord {
                pub_key: pub_key.to_string(),
                addresses: Vec::new(),
                score: 0,
                banned: false,
                last_seen: 0,
            });
            for address in addresses {
                if !record.addresses.contains(address) {
                    record.addresses.push(address.clone());
                }
            }
            record.last_seen = monotonic_ms();
            record.clone()
        };
        self.persist(&record)
    }

    pub fn get(&self, pub_key: &str) -> Option<NodeRecord> {
        self.nodes
            .lock()
            .expect("node map poisoned")
            .get(pub_key)
            .cloned()
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        let mut out: Vec<NodeRecord> = self
            .nodes
            .lock()
            .expect("node map poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.pub_key.cmp(&b.pub_key));
        out
    }

    pub fn is_banned(&self, pub_key: &str) -> bool {
        self.get(pub_key).map(|r| r.banned).unwrap_or(false)
    }

    pub fn addresses(&self, pub_key: &str) -> Vec<String> {
        self.get(pub_key).map(|r| r.addresses).unwrap_or_default()
    }

    /// Apply a reputation delta. Returns true if the node crossed the ban
    /// threshold with this event.
    pub fn add_reputation_event(&self, pub_key: &str, event: ReputationEvent) -> Result<bool> {
        let (record, newly_banned) = {
            let mut nodes = self.nodes.lock().expect("node map poisoned");
            let record = nodes.entry(pub_key.to_string()).or_insert_with(|| NodeRecord {
                pub_key: pub_key.to_string(),
                addresses: Vec::new(),
                score: 0,
                banned: false,
                last_seen: monotonic_ms(),
            });
            record.score += event.delta();
            let newly_banned = !record.banned && record.score <= BAN_THRESHOLD;
            if newly_banned {
                record.banned = true;
            }
            (record.clone(), newly_banned)
        };
        self.persist(&record)?;
        if newly_banned {
            tracing::warn!(peer = %pub_key, score = record.score, "node banned by reputation");
        }
        Ok(newly_banned)
    }

    pub fn ban(&self, pub_key: &str) -> Result<()> {
        let record = {
            let mut nodes = self.nodes.lock().expect("node map poisoned");
            let record = nodes.entry(pub_key.to_string()).or_insert_with(|| NodeRecord {
                pub_key: pub_key.to_string(),
                addresses: Vec::new(),
                score: 0,
                banned: false,
                last_seen: monotonic_ms(),
            });
            record.banned = true;
            record.clone()
        };
        self.persist(&record)
    }

    pub fn unban(&self, pub_key: &str) -> Result<()> {
        let record = {
            let mut nodes = self.nodes.lock().expect("node map poisoned");
            let record = nodes
                .get_mut(pub_key)
                .with_context(|| format!("unknown node {pub_key}"))?;
            anyhow::ensure!(record.banned, "node {pub_key} is not banned");
            record.banned = false;
            // a ban wipes accumulated score so the node starts fresh
            record.score = 0;
            record.clone()
        };
        self.persist(&record)
    }

    fn persist(&self, record: &NodeRecord) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .upsert_node(record)
            .with_context(|| format!("persist node {}", record.pub_key))
    }
}
