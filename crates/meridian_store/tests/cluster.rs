//! Multi-node cluster tests: gossip convergence and partition-aware routing.

mod common;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serial_test::serial;
use tempfile::TempDir;

use common::TestNode;

/// Poll every node's membership view until all of them know `expected` nodes.
async fn wait_for_members(nodes: &[&TestNode], expected: usize, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let no_constraints = BTreeMap::new();
        let converged = nodes.iter().all(|node| {
            node.handle.state().gossip.get_nodes(&no_constraints).len() >= expected
        });
        if converged {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("membership did not converge to {expected} nodes");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn setup_regional_table(client: &tokio_postgres::Client) -> Result<()> {
    client
        .simple_query(
            "CREATE TABLE public.accounts (\
             id INT PRIMARY KEY, name STRING, balance INT, region STRING) \
             PARTITION BY LIST (region)",
        )
        .await?;
    for region in ["us", "eu", "asia"] {
        client
            .simple_query(&format!(
                "CREATE TABLE public.accounts_{region} PARTITION OF public.accounts \
                 FOR VALUES IN ('{region}')"
            ))
            .await?;
        client
            .simple_query(&format!(
                "ALTER TABLE public.accounts_{region} ADD CONSTRAINT region = '{region}'"
            ))
            .await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[serial]
async fn bootstrap_convergence_across_three_regions() -> Result<()> {
    let temp = TempDir::new()?;
    let a = common::start_node(&temp.path().join("node-a"), "us", None, 3).await?;
    let b = common::start_node(&temp.path().join("node-b"), "eu", Some(a.grpc_addr), 3).await?;
    let c = common::start_node(&temp.path().join("node-c"), "asia", Some(a.grpc_addr), 3).await?;

    wait_for_members(&[&a, &b, &c], 3, Duration::from_secs(30)).await?;

    for node in [&a, &b, &c] {
        let mut regions: Vec<String> = node
            .handle
            .state()
            .gossip
            .get_nodes(&BTreeMap::new())
            .into_iter()
            .map(|info| info.region)
            .collect();
        regions.sort();
        assert_eq!(regions, vec!["asia", "eu", "us"]);
    }

    a.handle.shutdown().await?;
    b.handle.shutdown().await?;
    c.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[serial]
async fn rows_land_only_on_the_owning_node() -> Result<()> {
    let temp = TempDir::new()?;
    let a = common::start_node(&temp.path().join("node-a"), "us", None, 3).await?;
    let b = common::start_node(&temp.path().join("node-b"), "eu", Some(a.grpc_addr), 3).await?;
    let c = common::start_node(&temp.path().join("node-c"), "asia", Some(a.grpc_addr), 3).await?;
    wait_for_members(&[&a, &b, &c], 3, Duration::from_secs(30)).await?;

    let client = common::connect(a.sql_addr).await?;
    setup_regional_table(&client).await?;
    client
        .simple_query(
            "INSERT INTO public.accounts (id, name, balance, region) \
             VALUES (1, 'ada', 100, 'us'), (2, 'bob', 200, 'eu'), (3, 'eve', 300, 'asia')",
        )
        .await?;

    // every node holds exactly its own region's row
    let expect = [(&a, "1", "ada"), (&b, "2", "bob"), (&c, "3", "eve")];
    for (node, id, name) in expect {
        let rows = node.handle.state().kv.read_table("public.accounts")?;
        assert_eq!(rows.len(), 1, "one row per owning node");
        let cells = rows.get(id).expect("row keyed by primary key");
        assert_eq!(cells.get("name").map(String::as_str), Some(name));
    }

    // a SELECT against A reports only A's local row
    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert_eq!(rows, vec![vec!["1", "ada", "100", "us"]]);

    a.handle.shutdown().await?;
    b.handle.shutdown().await?;
    c.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[serial]
async fn update_dispatch_reaches_remote_rows() -> Result<()> {
    let temp = TempDir::new()?;
    let a = common::start_node(&temp.path().join("node-a"), "us", None, 3).await?;
    let b = common::start_node(&temp.path().join("node-b"), "eu", Some(a.grpc_addr), 3).await?;
    let c = common::start_node(&temp.path().join("node-c"), "asia", Some(a.grpc_addr), 3).await?;
    wait_for_members(&[&a, &b, &c], 3, Duration::from_secs(30)).await?;

    let client = common::connect(a.sql_addr).await?;
    setup_regional_table(&client).await?;
    client
        .simple_query(
            "INSERT INTO public.accounts (id, name, balance, region) \
             VALUES (2, 'bob', 200, 'eu')",
        )
        .await?;

    // the update fans out from A; the row lives on B
    client
        .simple_query("UPDATE public.accounts SET balance = balance - 25 WHERE id = 2")
        .await?;

    let rows = b.handle.state().kv.read_table("public.accounts")?;
    let cells = rows.get("2").expect("row on eu node");
    assert_eq!(cells.get("balance").map(String::as_str), Some("175"));

    // reading from B over the wire shows the new value
    let client_b = common::connect(b.sql_addr).await?;
    let rows = common::data_rows(
        client_b
            .simple_query("SELECT * FROM public.accounts")
            .await?,
    );
    assert_eq!(rows, vec![vec!["2", "bob", "175", "eu"]]);

    a.handle.shutdown().await?;
    b.handle.shutdown().await?;
    c.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[serial]
async fn create_table_definition_reaches_every_peer() -> Result<()> {
    let temp = TempDir::new()?;
    let a = common::start_node(&temp.path().join("node-a"), "us", None, 3).await?;
    let b = common::start_node(&temp.path().join("node-b"), "eu", Some(a.grpc_addr), 3).await?;
    let c = common::start_node(&temp.path().join("node-c"), "asia", Some(a.grpc_addr), 3).await?;
    wait_for_members(&[&a, &b, &c], 3, Duration::from_secs(30)).await?;

    let client = common::connect(a.sql_addr).await?;
    client
        .simple_query("CREATE TABLE public.t (id INT PRIMARY KEY, name STRING)")
        .await?;

    for node in [&a, &b, &c] {
        let table = node
            .handle
            .state()
            .catalog
            .get_table("public.t")
            .expect("table on every reachable node");
        assert_eq!(table.columns.len(), 2);
    }

    a.handle.shutdown().await?;
    b.handle.shutdown().await?;
    c.handle.shutdown().await
}
