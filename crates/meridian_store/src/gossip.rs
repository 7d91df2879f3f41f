//! Anti-entropy gossip: a last-write-wins dictionary replicated across peers.
//!
//! Every entry carries the producing node's wall-clock timestamp in
//! milliseconds. A background worker runs pairwise `Exchange` rounds that
//! drive all reachable stores toward the pointwise maximum over `last_update`
//! for every key. Node membership lives in the same dictionary under the
//! `node:` key prefix and is re-materialized after every merge.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rpc;
use crate::stats::NodeStats;

/// Key prefix under which node membership records are published.
pub const NODE_KEY_PREFIX: &str = "node:";

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Identity and placement tag of a single node. Created once at process
/// start; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub sql_addr: String,
    pub grpc_addr: String,
    pub data_dir: String,
    pub region: String,
    pub join: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Vec<u8>,
    pub last_update: u64,
}

pub type Entries = BTreeMap<String, Entry>;

struct StoreInner {
    entries: Entries,
    nodes: BTreeMap<String, NodeInfo>,
}

impl StoreInner {
    /// Rebuild the materialized node table from `node:`-prefixed entries.
    fn rebuild_nodes(&mut self) {
        let mut nodes = BTreeMap::new();
        for (key, entry) in self.entries.range(NODE_KEY_PREFIX.to_string()..) {
            if !key.starts_with(NODE_KEY_PREFIX) {
                break;
            }
            match serde_json::from_slice::<NodeInfo>(&entry.value) {
                Ok(info) => {
                    nodes.insert(info.id.clone(), info);
                }
                Err(err) => warn!(key = %key, error = %err, "undecodable node entry"),
            }
        }
        self.nodes = nodes;
    }
}

pub struct GossipStore {
    self_info: NodeInfo,
    seed: Option<String>,
    inner: Mutex<StoreInner>,
}

impl GossipStore {
    /// Create a store seeded with this node's own membership record.
    pub fn new(self_info: NodeInfo, seed: Option<String>) -> anyhow::Result<Arc<GossipStore>> {
        let store = Arc::new(GossipStore {
            self_info: self_info.clone(),
            seed: seed.filter(|s| !s.is_empty()),
            inner: Mutex::new(StoreInner {
                entries: BTreeMap::new(),
                nodes: BTreeMap::new(),
            }),
        });
        let payload = serde_json::to_vec(&self_info)?;
        store.publish(&format!("{NODE_KEY_PREFIX}{}", self_info.id), payload);
        Ok(store)
    }

    pub fn self_info(&self) -> &NodeInfo {
        &self.self_info
    }

    /// Stamp a value with the current time and merge it through the LWW rule.
    pub fn publish(&self, key: &str, value: Vec<u8>) {
        let entry = Entry {
            value,
            last_update: unix_time_ms(),
        };
        let mut inner = self.inner.lock().unwrap();
        let newer = match inner.entries.get(key) {
            Some(local) => local.last_update < entry.last_update,
            None => true,
        };
        if newer {
            inner.entries.insert(key.to_string(), entry);
            inner.rebuild_nodes();
        }
    }

    /// Merge a peer's entries and return the entries this node holds newer
    /// versions of (plus the keys the peer is missing entirely).
    pub fn update(&self, peer_entries: &Entries) -> Entries {
        let mut inner = self.inner.lock().unwrap();
        let mut self_newer = Entries::new();
        for (key, peer_entry) in peer_entries {
            match inner.entries.get(key) {
                None => {
                    inner.entries.insert(key.clone(), peer_entry.clone());
                }
                Some(local) if local.last_update < peer_entry.last_update => {
                    inner.entries.insert(key.clone(), peer_entry.clone());
                }
                Some(local) => {
                    self_newer.insert(key.clone(), local.clone());
                }
            }
        }
        for (key, local) in &inner.entries {
            if !peer_entries.contains_key(key) {
                self_newer.insert(key.clone(), local.clone());
            }
        }
        inner.rebuild_nodes();
        self_newer
    }

    /// Full copy of the current entry map.
    pub fn snapshot(&self) -> Entries {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Currently-known nodes whose fields satisfy every constraint.
    ///
    /// Best-effort: if the store mutex is contended the query returns an
    /// empty set instead of blocking.
    pub fn get_nodes(&self, constraints: &BTreeMap<String, String>) -> Vec<NodeInfo> {
        let Ok(inner) = self.inner.try_lock() else {
            return Vec::new();
        };
        inner
            .nodes
            .values()
            .filter(|node| matches_constraints(node, constraints))
            .cloned()
            .collect()
    }

    /// RPC addresses of every known node other than self.
    fn peer_targets(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .filter(|node| node.id != self.self_info.id)
            .map(|node| node.grpc_addr.clone())
            .collect()
    }

    /// Pick the conversation partner for one gossip round.
    fn pick_peer(&self) -> Option<String> {
        let peers = self.peer_targets();
        if peers.is_empty() {
            return self.seed.clone();
        }
        let index = rand::thread_rng().gen_range(0..peers.len());
        peers.into_iter().nth(index)
    }
}

fn matches_constraints(node: &NodeInfo, constraints: &BTreeMap<String, String>) -> bool {
    constraints.iter().all(|(key, value)| match key.as_str() {
        "region" => node.region == *value,
        "sql_address" => node.sql_addr == *value,
        "rpc_address" => node.grpc_addr == *value,
        _ => false,
    })
}

/// Run one exchange round against a single peer.
async fn run_round(store: &GossipStore, deadline: Duration, stats: &NodeStats) {
    let Some(target) = store.pick_peer() else {
        debug!("gossip: no peer to contact");
        return;
    };
    let entries = store.snapshot();
    match rpc::exchange(&target, entries, deadline).await {
        Ok(self_newer) => {
            store.update(&self_newer);
            NodeStats::bump(&stats.gossip_rounds);
            debug!(peer = %target, "gossip round complete");
        }
        Err(err) => {
            NodeStats::bump(&stats.gossip_failures);
            warn!(peer = %target, error = %err, "gossip round failed");
        }
    }
}

/// Spawn the background worker that gossips with one peer per interval.
pub fn spawn_worker(
    store: Arc<GossipStore>,
    interval: Duration,
    deadline: Duration,
    stats: Arc<NodeStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            run_round(&store, deadline, &stats).await;
        }
    })
}
