use std::net::SocketAddr as EmbedSocketAddr;
use std::path::PathBuf as EmbedPathBuf;
use std::time::Duration as EmbedDuration;

include!("main.rs");

/// Minimal embeddable configuration for running a Meridian node inside
/// another process. Tests use this to stand up multi-node clusters with
/// distinct data directories and listen addresses.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub sql_addr: EmbedSocketAddr,
    pub grpc_addr: EmbedSocketAddr,
    pub data_dir: EmbedPathBuf,
    pub region: String,
    pub join: Option<EmbedSocketAddr>,
    pub cluster_size: usize,
    pub gossip_interval: EmbedDuration,
}

impl EmbeddedNodeConfig {
    pub fn single_node(
        sql_addr: EmbedSocketAddr,
        grpc_addr: EmbedSocketAddr,
        data_dir: EmbedPathBuf,
    ) -> Self {
        Self {
            sql_addr,
            grpc_addr,
            data_dir,
            region: String::new(),
            join: None,
            cluster_size: 1,
            gossip_interval: EmbedDuration::from_millis(500),
        }
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    let mut argv = vec![
        "meridian-store".to_string(),
        "--sql-addr".to_string(),
        config.sql_addr.to_string(),
        "--grpc-addr".to_string(),
        config.grpc_addr.to_string(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--region".to_string(),
        config.region.clone(),
        "--cluster-size".to_string(),
        config.cluster_size.max(1).to_string(),
        "--gossip-interval-ms".to_string(),
        config.gossip_interval.as_millis().max(1).to_string(),
    ];
    if let Some(join) = config.join {
        argv.push("--join".to_string());
        argv.push(join.to_string());
    }
    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

/// Handle to an embedded node; dropping it aborts the node's tasks.
pub struct EmbeddedNodeHandle {
    node: Node,
}

impl EmbeddedNodeHandle {
    pub fn state(&self) -> &Arc<NodeState> {
        self.node.state()
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.node.stop();
        Ok(())
    }
}

pub async fn start_embedded_node(
    config: EmbeddedNodeConfig,
) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let node = Node::start(args).await?;
    Ok(EmbeddedNodeHandle { node })
}
