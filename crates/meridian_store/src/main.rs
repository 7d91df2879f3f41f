// Meridian node binary entry point.
//
// Wires together the cell store, gossip membership, catalog, node-to-node RPC
// server, and the PostgreSQL wire front-end, and hosts the CLI and runtime
// configuration.

use std::fs;
use std::io::IsTerminal;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod catalog;
pub mod datum;
pub mod executor;
pub mod gossip;
pub mod kv;
pub mod pg_server;
pub mod rpc;
pub mod schema;
pub mod sql;
pub mod stats;
pub mod status;

use catalog::Catalog;
use gossip::{GossipStore, NodeInfo};
use kv::Kv;
use stats::NodeStats;

/// CLI options for running a node.
#[derive(Parser, Debug)]
#[command(name = "meridian-store")]
pub struct NodeArgs {
    /// Address for PostgreSQL wire protocol clients.
    #[arg(long, env = "MERIDIAN_SQL_ADDR", default_value = "127.0.0.1:5433")]
    sql_addr: SocketAddr,

    /// Address for node-to-node RPC traffic.
    #[arg(long, env = "MERIDIAN_GRPC_ADDR", default_value = "127.0.0.1:50051")]
    grpc_addr: SocketAddr,

    /// Directory holding the cell store.
    #[arg(long, env = "MERIDIAN_DATA_DIR")]
    data_dir: String,

    /// Placement tag for this node (e.g. `us`).
    #[arg(long, env = "MERIDIAN_REGION", default_value = "")]
    region: String,

    /// RPC address of a seed peer used to bootstrap gossip.
    #[arg(long, env = "MERIDIAN_JOIN")]
    join: Option<SocketAddr>,

    /// Number of nodes required before DDL fans out across the cluster.
    #[arg(long, env = "MERIDIAN_CLUSTER_SIZE", default_value_t = 3)]
    cluster_size: usize,

    /// Interval between gossip rounds (milliseconds).
    #[arg(long, env = "MERIDIAN_GOSSIP_INTERVAL_MS", default_value_t = 3000)]
    gossip_interval_ms: u64,

    /// Per-round gossip exchange deadline (milliseconds).
    #[arg(long, env = "MERIDIAN_GOSSIP_DEADLINE_MS", default_value_t = 2000)]
    gossip_deadline_ms: u64,

    /// Log node counters every N milliseconds (0 disables).
    #[arg(long, env = "MERIDIAN_STATS_INTERVAL_MS", default_value_t = 0)]
    stats_interval_ms: u64,
}

/// Shared handles threaded through every request handler.
pub struct NodeState {
    pub info: NodeInfo,
    pub kv: Kv,
    pub gossip: Arc<GossipStore>,
    pub catalog: Catalog,
    pub stats: Arc<NodeStats>,
}

/// A running node: shared state plus its background server tasks.
pub struct Node {
    state: Arc<NodeState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage, publish this node's membership record, bind both
    /// listeners, and spawn the server and gossip tasks.
    pub async fn start(args: NodeArgs) -> anyhow::Result<Node> {
        validate_addr("sql-addr", &args.sql_addr)?;
        validate_addr("grpc-addr", &args.grpc_addr)?;

        let data_dir = PathBuf::from(&args.data_dir);
        fs::create_dir_all(&data_dir).context("create data dir")?;
        let kv = Kv::open(&data_dir)?;

        let info = NodeInfo {
            id: uuid::Uuid::new_v4().to_string(),
            sql_addr: args.sql_addr.to_string(),
            grpc_addr: args.grpc_addr.to_string(),
            data_dir: args.data_dir.clone(),
            region: args.region.clone(),
            join: args.join.map(|addr| addr.to_string()),
        };
        let gossip = GossipStore::new(info.clone(), info.join.clone())?;
        let catalog = Catalog::new(kv.clone(), gossip.clone(), args.cluster_size)?;
        let state = Arc::new(NodeState {
            info,
            kv,
            gossip,
            catalog,
            stats: Arc::new(NodeStats::default()),
        });

        // Bind before spawning so startup failures exit the process.
        let rpc_listener = TcpListener::bind(args.grpc_addr)
            .await
            .with_context(|| format!("bind rpc listener on {}", args.grpc_addr))?;
        let sql_listener = TcpListener::bind(args.sql_addr)
            .await
            .with_context(|| format!("bind sql listener on {}", args.sql_addr))?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn({
            let state = state.clone();
            async move {
                if let Err(err) = rpc::serve(rpc_listener, state).await {
                    tracing::error!(error = ?err, "rpc server failed");
                }
            }
        }));
        tasks.push(tokio::spawn({
            let state = state.clone();
            async move {
                if let Err(err) = pg_server::serve(sql_listener, state).await {
                    tracing::error!(error = ?err, "sql server failed");
                }
            }
        }));
        tasks.push(gossip::spawn_worker(
            state.gossip.clone(),
            Duration::from_millis(args.gossip_interval_ms.max(1)),
            Duration::from_millis(args.gossip_deadline_ms.max(1)),
            state.stats.clone(),
        ));
        if args.stats_interval_ms > 0 {
            tasks.push(stats::spawn_logger(
                state.stats.clone(),
                Duration::from_millis(args.stats_interval_ms),
            ));
        }

        tracing::info!(
            node_id = %state.info.id,
            sql = %state.info.sql_addr,
            rpc = %state.info.grpc_addr,
            region = %state.info.region,
            "node started"
        );

        Ok(Node { state, tasks })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Abort the background server tasks.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate_addr(flag: &str, addr: &SocketAddr) -> anyhow::Result<()> {
    let ip = addr.ip();
    if ip.is_multicast() {
        anyhow::bail!("--{flag} must not be a multicast address: {addr}");
    }
    if let IpAddr::V4(v4) = ip {
        if v4.is_broadcast() {
            anyhow::bail!("--{flag} must not be the broadcast address: {addr}");
        }
    }
    if addr.port() == 0 {
        anyhow::bail!("--{flag} requires a concrete port: {addr}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = NodeArgs::parse();
    run_node(args).await
}

/// Run a node until interrupted.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let node = Node::start(args).await?;
    shutdown.await?;
    node.stop();
    Ok(())
}
