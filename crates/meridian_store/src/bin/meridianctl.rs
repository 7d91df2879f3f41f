//! Cluster inspection tool: asks a node for its identity, membership view,
//! and catalog contents over the RPC port.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use meridian_store::rpc;

#[derive(Parser, Debug)]
#[command(name = "meridianctl")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one node's status as JSON.
    Status {
        /// RPC address of the node to inspect.
        #[arg(long, default_value = "127.0.0.1:50051")]
        addr: String,

        /// Per-call deadline (milliseconds).
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Status { addr, timeout_ms } => {
            let status =
                rpc::status(&addr, Duration::from_millis(timeout_ms.max(1))).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
