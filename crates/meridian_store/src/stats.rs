//! Node-level counters and the periodic stats logger.
//!
//! Counters are plain relaxed atomics bumped on the hot paths; the logger
//! task snapshots and reports them on a fixed interval when enabled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct NodeStats {
    /// Query strings received on the SQL front-end.
    pub queries: AtomicU64,
    /// Statements that produced an error response.
    pub statement_errors: AtomicU64,
    /// Rows written by the insert path.
    pub rows_inserted: AtomicU64,
    /// Cells rewritten by the update path.
    pub cells_updated: AtomicU64,
    /// RPC requests handled by this node.
    pub rpc_requests: AtomicU64,
    /// Completed gossip rounds.
    pub gossip_rounds: AtomicU64,
    /// Failed gossip rounds.
    pub gossip_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub statement_errors: u64,
    pub rows_inserted: u64,
    pub cells_updated: u64,
    pub rpc_requests: u64,
    pub gossip_rounds: u64,
    pub gossip_failures: u64,
}

impl NodeStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            statement_errors: self.statement_errors.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            cells_updated: self.cells_updated.load(Ordering::Relaxed),
            rpc_requests: self.rpc_requests.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            gossip_failures: self.gossip_failures.load(Ordering::Relaxed),
        }
    }
}

/// Log a stats snapshot every `interval`.
pub fn spawn_logger(stats: Arc<NodeStats>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let snap = stats.snapshot();
            tracing::info!(
                queries = snap.queries,
                statement_errors = snap.statement_errors,
                rows_inserted = snap.rows_inserted,
                cells_updated = snap.cells_updated,
                rpc_requests = snap.rpc_requests,
                gossip_rounds = snap.gossip_rounds,
                gossip_failures = snap.gossip_failures,
                "node stats"
            );
        }
    })
}
