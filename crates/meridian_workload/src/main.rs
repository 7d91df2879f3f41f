//! Workload generator for exercising a Meridian cluster over the PostgreSQL
//! protocol: creates a regionally partitioned table, inserts rows spread
//! across the configured regions, and verifies what the contacted node can
//! see locally.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "meridian-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// SQL endpoint of the node to drive, e.g. `127.0.0.1:5433`.
    #[arg(long, default_value = "127.0.0.1:5433")]
    addr: String,

    /// Table to create and fill.
    #[arg(long, default_value = "public.workload")]
    table: String,

    /// Comma-separated region tags; one partition is created per region.
    #[arg(long, default_value = "us,eu,asia")]
    regions: String,

    /// Number of rows to insert.
    #[arg(long, default_value_t = 100)]
    rows: usize,

    /// Skip DDL and only insert into an existing table.
    #[arg(long, default_value_t = false)]
    skip_create: bool,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let regions: Vec<String> = args
        .regions
        .split(',')
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .map(str::to_string)
        .collect();
    anyhow::ensure!(!regions.is_empty(), "at least one region is required");

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    tracing::info!(addr = %args.addr, rows = args.rows, seed, "workload starting");

    let client = connect(&args.addr).await?;
    if !args.skip_create {
        create_table(&client, &args.table, &regions).await?;
    }

    let start = Instant::now();
    let mut inserted = 0usize;
    for id in 0..args.rows {
        let region = &regions[id % regions.len()];
        let balance: i64 = rng.gen_range(0..10_000);
        let statement = format!(
            "INSERT INTO {} (id, name, balance, region) VALUES ({id}, 'row_{id}', {balance}, '{region}')",
            args.table
        );
        match client.simple_query(&statement).await {
            Ok(_) => inserted += 1,
            Err(err) => tracing::warn!(id, error = %err, "insert failed"),
        }
    }
    let elapsed = start.elapsed();

    let local_rows = count_local_rows(&client, &args.table).await?;
    tracing::info!(
        inserted,
        failed = args.rows - inserted,
        local_rows,
        elapsed_ms = elapsed.as_millis() as u64,
        "workload finished"
    );
    Ok(())
}

async fn connect(addr: &str) -> Result<Client> {
    let (host, port) = addr
        .rsplit_once(':')
        .context("addr must be host:port")?;
    let params = format!("host={host} port={port} user=meridian dbname=meridian");
    let (client, connection) = tokio_postgres::connect(&params, NoTls)
        .await
        .with_context(|| format!("connect to {addr}"))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "connection task ended");
        }
    });
    Ok(client)
}

async fn create_table(client: &Client, table: &str, regions: &[String]) -> Result<()> {
    client
        .simple_query(&format!(
            "CREATE TABLE {table} (id INT PRIMARY KEY, name STRING, balance INT, region STRING) \
             PARTITION BY LIST (region)"
        ))
        .await
        .context("create table")?;
    let bare_name = table.rsplit_once('.').map(|(_, name)| name).unwrap_or(table);
    for region in regions {
        client
            .simple_query(&format!(
                "CREATE TABLE {bare_name}_{region} PARTITION OF {table} FOR VALUES IN ('{region}')"
            ))
            .await
            .with_context(|| format!("create partition for {region}"))?;
        client
            .simple_query(&format!(
                "ALTER TABLE {bare_name}_{region} ADD CONSTRAINT region = '{region}'"
            ))
            .await
            .with_context(|| format!("constrain partition for {region}"))?;
    }
    Ok(())
}

/// Rows visible on the contacted node. Reads are local, so this reports the
/// node's own share of the table.
async fn count_local_rows(client: &Client, table: &str) -> Result<usize> {
    let messages = client
        .simple_query(&format!("SELECT * FROM {table}"))
        .await
        .context("scan table")?;
    Ok(messages
        .iter()
        .filter(|message| matches!(message, SimpleQueryMessage::Row(_)))
        .count())
}
