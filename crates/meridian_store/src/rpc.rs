//! Typed request/response RPC surface between nodes.
//!
//! Framing is length-delimited JSON over TCP and every call carries its own
//! deadline. The services are gossip exchange, catalog table updates, row
//! inserts, dispatched UPDATE statements, and a status snapshot for tooling.
//! Delivery is at-most-once: one connect per call, no retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::executor;
use crate::gossip::Entries;
use crate::schema::Table;
use crate::sql::UpdateStmt;
use crate::status;
use crate::NodeState;

/// Default per-call deadline.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(2);
/// Longer deadline for catalog fan-out during DDL.
pub const UPDATE_TABLE_DEADLINE: Duration = Duration::from_secs(5);

/// One row travelling to the node that owns its partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPacket {
    pub table_name: String,
    pub column_names: Vec<String>,
    pub column_values: Vec<String>,
}

/// Introspection snapshot served to `meridianctl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: crate::gossip::NodeInfo,
    pub peers: Vec<crate::gossip::NodeInfo>,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Exchange { entries: Entries },
    UpdateTable { table: Table },
    Insert { row: RowPacket },
    Update { stmt: UpdateStmt },
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Reply {
    Entries { entries: Entries },
    Ack,
    Status { status: NodeStatus },
    Err { message: String },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub async fn serve(listener: TcpListener, state: Arc<NodeState>) -> anyhow::Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(error = ?err, "rpc connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<NodeState>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request: Request =
            serde_json::from_slice(&frame).context("decode rpc request")?;
        let reply = dispatch(&state, request).await;
        let encoded = serde_json::to_vec(&reply).context("encode rpc reply")?;
        framed.send(Bytes::from(encoded)).await?;
    }
    Ok(())
}

async fn dispatch(state: &Arc<NodeState>, request: Request) -> Reply {
    crate::stats::NodeStats::bump(&state.stats.rpc_requests);
    let result = match request {
        Request::Exchange { entries } => {
            return Reply::Entries {
                entries: state.gossip.update(&entries),
            };
        }
        Request::Status => {
            return Reply::Status {
                status: NodeStatus {
                    node: state.gossip.self_info().clone(),
                    peers: state.gossip.get_nodes(&Default::default()),
                    tables: state.catalog.table_names(),
                },
            };
        }
        Request::UpdateTable { table } => state.catalog.update_table(table),
        Request::Insert { row } => executor::apply_insert(state, &row),
        Request::Update { stmt } => executor::update_local(state, &stmt),
    };
    match result {
        Ok(()) => Reply::Ack,
        Err(err) => Reply::Err {
            message: err.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Issue one request to `addr` and wait for its reply under `deadline`.
pub async fn call(addr: &str, request: &Request, deadline: Duration) -> anyhow::Result<Reply> {
    let payload = serde_json::to_vec(request).context("encode rpc request")?;
    let fut = async move {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
        framed.send(Bytes::from(payload)).await?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed by {addr}"))??;
        let reply: Reply = serde_json::from_slice(&frame).context("decode rpc reply")?;
        Ok(reply)
    };
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(status::rpc(format!("rpc timed out for {addr}"))),
    }
}

fn expect_ack(reply: Reply, addr: &str) -> anyhow::Result<()> {
    match reply {
        Reply::Ack => Ok(()),
        Reply::Err { message } => Err(status::rpc(message)),
        other => Err(status::rpc(format!(
            "unexpected reply from {addr}: {other:?}"
        ))),
    }
}

pub async fn exchange(addr: &str, entries: Entries, deadline: Duration) -> anyhow::Result<Entries> {
    match call(addr, &Request::Exchange { entries }, deadline).await? {
        Reply::Entries { entries } => Ok(entries),
        Reply::Err { message } => Err(status::rpc(message)),
        other => Err(status::rpc(format!(
            "unexpected reply to exchange from {addr}: {other:?}"
        ))),
    }
}

pub async fn update_table(addr: &str, table: &Table, deadline: Duration) -> anyhow::Result<()> {
    let reply = call(
        addr,
        &Request::UpdateTable {
            table: table.clone(),
        },
        deadline,
    )
    .await?;
    expect_ack(reply, addr)
}

pub async fn insert(addr: &str, row: &RowPacket, deadline: Duration) -> anyhow::Result<()> {
    let reply = call(addr, &Request::Insert { row: row.clone() }, deadline).await?;
    expect_ack(reply, addr)
}

pub async fn update(addr: &str, stmt: &UpdateStmt, deadline: Duration) -> anyhow::Result<()> {
    let reply = call(addr, &Request::Update { stmt: stmt.clone() }, deadline).await?;
    expect_ack(reply, addr)
}

pub async fn status(addr: &str, deadline: Duration) -> anyhow::Result<NodeStatus> {
    match call(addr, &Request::Status, deadline).await? {
        Reply::Status { status } => Ok(status),
        Reply::Err { message } => Err(status::rpc(message)),
        other => Err(status::rpc(format!(
            "unexpected reply to status from {addr}: {other:?}"
        ))),
    }
}
