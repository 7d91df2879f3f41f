//! End-to-end tests against a single embedded node over the wire protocol.

mod common;

use anyhow::Result;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ACCOUNTS_DDL: &str = "CREATE TABLE public.accounts (\
     id INT PRIMARY KEY, name STRING, balance INT, region STRING) \
     PARTITION BY LIST (region)";

async fn setup_accounts(client: &tokio_postgres::Client) -> Result<()> {
    client.simple_query(ACCOUNTS_DDL).await?;
    client
        .simple_query(
            "CREATE TABLE public.accounts_us PARTITION OF public.accounts FOR VALUES IN ('us')",
        )
        .await?;
    client
        .simple_query("ALTER TABLE public.accounts_us ADD CONSTRAINT region = 'us'")
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_insert_select_update_round_trip() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    setup_accounts(&client).await?;
    client
        .simple_query(
            "INSERT INTO public.accounts (id, name, balance, region) \
             VALUES (1, 'ada', 100, 'us'), (2, 'bob', 250, 'us')",
        )
        .await?;

    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert_eq!(
        rows,
        vec![
            vec!["1", "ada", "100", "us"],
            vec!["2", "bob", "250", "us"],
        ]
    );

    // arithmetic update rewrites the stored cell
    client
        .simple_query("UPDATE public.accounts SET balance = balance - 10 WHERE id = 1")
        .await?;
    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert_eq!(rows[0], vec!["1", "ada", "90", "us"]);
    assert_eq!(rows[1], vec!["2", "bob", "250", "us"]);

    // constant update
    client
        .simple_query("UPDATE public.accounts SET name = 'eve' WHERE id = 2")
        .await?;
    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert_eq!(rows[1], vec!["2", "eve", "250", "us"]);

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ddl_yields_empty_query_response_and_insert_without_column_list_works() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    let messages = client.simple_query(ACCOUNTS_DDL).await?;
    assert!(common::data_rows(messages).is_empty());

    client
        .simple_query(
            "CREATE TABLE public.accounts_us PARTITION OF public.accounts FOR VALUES IN ('us')",
        )
        .await?;
    client
        .simple_query("ALTER TABLE public.accounts_us ADD CONSTRAINT region = 'us'")
        .await?;
    // column list omitted: values bind in table order
    client
        .simple_query("INSERT INTO public.accounts VALUES (7, 'grace', 10, 'us')")
        .await?;
    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert_eq!(rows, vec![vec!["7", "grace", "10", "us"]]);

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn select_row_description_reports_types() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    setup_accounts(&client).await?;
    client
        .simple_query("INSERT INTO public.accounts VALUES (1, 'x', 5, 'us')")
        .await?;

    let messages = client.simple_query("SELECT * FROM public.accounts").await?;
    let mut saw_columns = false;
    for message in &messages {
        if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
            assert_eq!(row.columns().len(), 4);
            let names: Vec<&str> = row.columns().iter().map(|c| c.name()).collect();
            assert_eq!(names, vec!["id", "name", "balance", "region"]);
            saw_columns = true;
        }
    }
    assert!(saw_columns);

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn errors_keep_the_connection_usable() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    let err = client
        .simple_query("SELECT * FROM nope.nope")
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected a database error");
    assert_eq!(db_err.message(), "table not found: nope.nope");
    assert_eq!(db_err.severity(), "ERROR");

    // parse errors surface the same way
    let err = client.simple_query("FROB TABLE x").await.unwrap_err();
    assert!(err.as_db_error().is_some());

    // and the connection keeps answering
    setup_accounts(&client).await?;
    let rows = common::data_rows(client.simple_query("SELECT * FROM public.accounts").await?);
    assert!(rows.is_empty());

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insert_error_paths() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    // no partition at all
    client
        .simple_query("CREATE TABLE public.plain (id INT PRIMARY KEY, name STRING)")
        .await?;
    let err = client
        .simple_query("INSERT INTO public.plain VALUES (1, 'x')")
        .await
        .unwrap_err();
    assert!(err
        .as_db_error()
        .expect("expected a database error")
        .message()
        .contains("without partition"));

    // partition exists but no entry accepts the value
    setup_accounts(&client).await?;
    let err = client
        .simple_query("INSERT INTO public.accounts VALUES (1, 'x', 5, 'mars')")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("expected a database error").message(),
        "partition not found for value mars"
    );

    // partition entry exists but no node satisfies its constraints
    client
        .simple_query(
            "CREATE TABLE public.accounts_eu PARTITION OF public.accounts FOR VALUES IN ('eu')",
        )
        .await?;
    client
        .simple_query("ALTER TABLE public.accounts_eu ADD CONSTRAINT region = 'eu'")
        .await?;
    let err = client
        .simple_query("INSERT INTO public.accounts VALUES (1, 'x', 5, 'eu')")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("expected a database error").message(),
        "no server found for partition eu"
    );

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_create_and_cluster_size_gate() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    setup_accounts(&client).await?;
    let err = client.simple_query(ACCOUNTS_DDL).await.unwrap_err();
    assert_eq!(
        err.as_db_error().expect("expected a database error").message(),
        "table already exists: public.accounts"
    );

    // a node configured for a 3-node cluster refuses DDL while alone
    let gated = common::start_node(&temp.path().join("node-2"), "us", None, 3).await?;
    let gated_client = common::connect(gated.sql_addr).await?;
    let err = gated_client.simple_query(ACCOUNTS_DDL).await.unwrap_err();
    assert_eq!(
        err.as_db_error().expect("expected a database error").message(),
        "not enough nodes"
    );

    gated.handle.shutdown().await?;
    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn system_tables_are_queryable() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    let rows = common::data_rows(client.simple_query("SELECT * FROM system.tables").await?);
    let names: Vec<&str> = rows.iter().map(|row| row[0].as_str()).collect();
    assert!(names.contains(&"system.tables"));
    assert!(names.contains(&"system.partitions"));
    // the stored column list renders in the compact form
    let tables_row = rows
        .iter()
        .find(|row| row[0] == "system.tables")
        .expect("system.tables row");
    assert_eq!(tables_row[1], "table_name:string(PK), columns:string");

    setup_accounts(&client).await?;
    let rows =
        common::data_rows(client.simple_query("SELECT * FROM system.partitions").await?);
    let partition_row = rows
        .iter()
        .find(|row| row[1] == "accounts_us")
        .expect("accounts_us partition row");
    assert_eq!(partition_row[0], "public.accounts");
    assert_eq!(partition_row[3], "region");
    assert!(partition_row[2].contains("\"region\":\"us\""));
    assert!(partition_row[4].contains("us"));

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_table_is_idempotent_and_removes_catalog_rows() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;
    let client = common::connect(node.sql_addr).await?;

    setup_accounts(&client).await?;
    client.simple_query("DROP TABLE public.accounts").await?;
    let err = client
        .simple_query("SELECT * FROM public.accounts")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("expected a database error").message(),
        "table not found: public.accounts"
    );
    // dropping again is fine
    client.simple_query("DROP TABLE public.accounts").await?;

    let rows = common::data_rows(client.simple_query("SELECT * FROM system.tables").await?);
    assert!(rows.iter().all(|row| row[0] != "public.accounts"));

    node.handle.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ssl_request_is_refused_with_a_single_byte() -> Result<()> {
    let temp = TempDir::new()?;
    let node = common::start_node(&temp.path().join("node-1"), "us", None, 1).await?;

    let mut stream = tokio::net::TcpStream::connect(node.sql_addr).await?;
    let mut packet = 8u32.to_be_bytes().to_vec();
    packet.extend_from_slice(&80877103i32.to_be_bytes());
    stream.write_all(&packet).await?;
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await?;
    assert_eq!(reply[0], b'N');

    // the same socket then accepts a startup message
    let mut body = 196608i32.to_be_bytes().to_vec();
    body.extend_from_slice(b"user\0tester\0\0");
    let mut startup = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    startup.extend_from_slice(&body);
    stream.write_all(&startup).await?;
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    // AuthenticationOk
    assert_eq!(first[0], b'R');

    node.handle.shutdown().await
}
