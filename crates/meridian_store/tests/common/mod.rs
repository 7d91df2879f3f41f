//! Shared helpers for integration tests.

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use meridian_store::{start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// Allocate a free localhost port by binding and dropping a listener.
pub fn free_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind probe listener")?;
    Ok(listener.local_addr()?)
}

pub struct TestNode {
    pub handle: EmbeddedNodeHandle,
    pub sql_addr: SocketAddr,
    pub grpc_addr: SocketAddr,
}

pub async fn start_node(
    data_dir: &Path,
    region: &str,
    join: Option<SocketAddr>,
    cluster_size: usize,
) -> Result<TestNode> {
    let sql_addr = free_addr()?;
    let grpc_addr = free_addr()?;
    let config = EmbeddedNodeConfig {
        sql_addr,
        grpc_addr,
        data_dir: data_dir.to_path_buf(),
        region: region.to_string(),
        join,
        cluster_size,
        gossip_interval: Duration::from_millis(200),
    };
    let handle = start_embedded_node(config).await?;
    Ok(TestNode {
        handle,
        sql_addr,
        grpc_addr,
    })
}

pub async fn connect(addr: SocketAddr) -> Result<Client> {
    let params = format!(
        "host=127.0.0.1 port={} user=meridian dbname=meridian",
        addr.port()
    );
    let (client, connection) = tokio_postgres::connect(&params, NoTls)
        .await
        .context("connect to sql server")?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

/// Data rows of a simple-query response as plain strings.
pub fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<Vec<String>> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}
