//! Cell storage on top of a fjall keyspace.
//!
//! One partition holds every cell. Keys follow the layout
//! `/<table>/<pk>/<column>` and values are UTF-8 encoded datums; the store
//! itself treats both sides as opaque bytes and imposes no schema.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::schema::Table;
use crate::status;

/// Name of the fjall partition holding row cells.
const CELL_PARTITION: &str = "cells";

#[derive(Clone)]
pub struct Kv {
    #[allow(dead_code)]
    keyspace: Arc<Keyspace>,
    cells: PartitionHandle,
}

impl Kv {
    pub fn open(data_dir: &Path) -> anyhow::Result<Kv> {
        let keyspace = fjall::Config::new(data_dir)
            .open()
            .context("open fjall keyspace")?;
        let cells = keyspace
            .open_partition(CELL_PARTITION, PartitionCreateOptions::default())
            .context("open cell partition")?;
        Ok(Kv {
            keyspace: Arc::new(keyspace),
            cells,
        })
    }

    pub fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.cells
            .insert(key, value)
            .map_err(|err| status::io(format!("kv put failed: {err}")))
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self
            .cells
            .get(key)
            .map_err(|err| status::io(format!("kv get failed: {err}")))?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.cells
            .remove(key)
            .map_err(|err| status::io(format!("kv delete failed: {err}")))
    }

    /// All cells under `prefix` in key-sorted order, materialized at call time.
    pub fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.cells.prefix(prefix.as_bytes().to_vec()) {
            let (key, value) = item.map_err(|err| status::io(format!("kv scan failed: {err}")))?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(out)
    }

    /// Materialize every row of `table_name` as pk -> (column -> encoded value).
    pub fn read_table(
        &self,
        table_name: &str,
    ) -> anyhow::Result<BTreeMap<String, BTreeMap<String, String>>> {
        let prefix = format!("/{table_name}/");
        let mut rows: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in self.scan_prefix(&prefix)? {
            let suffix = &key[prefix.len()..];
            let Some((pk, column)) = suffix.split_once('/') else {
                return Err(status::internal(format!("malformed cell key: {key}")));
            };
            rows.entry(pk.to_string())
                .or_default()
                .insert(column.to_string(), value);
        }
        Ok(rows)
    }

    /// Write one cell per column for a full row of encoded values.
    pub fn write_row(&self, table: &Table, values: &[String]) -> anyhow::Result<()> {
        let pk_index = table
            .pk_index()
            .ok_or_else(|| status::internal(format!("table {} has no primary key", table.name)))?;
        if values.len() != table.columns.len() {
            return Err(status::internal(format!(
                "row has {} values, table {} has {} columns",
                values.len(),
                table.name,
                table.columns.len()
            )));
        }
        let pk = &values[pk_index];
        for (column, value) in table.columns.iter().zip(values) {
            self.put(&cell_key(&table.name, pk, &column.name), value)?;
        }
        Ok(())
    }
}

/// Cell key for one (table, primary key, column) triple.
pub fn cell_key(table: &str, pk: &str, column: &str) -> String {
    format!("/{table}/{pk}/{column}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DataType;
    use crate::schema::Column;
    use tempfile::TempDir;

    fn open_kv() -> (TempDir, Kv) {
        let dir = TempDir::new().unwrap();
        let kv = Kv::open(dir.path()).unwrap();
        (dir, kv)
    }

    fn accounts_table() -> Table {
        Table::new(
            "public.accounts",
            vec![
                Column::primary_key("id", DataType::Int64),
                Column::new("name", DataType::String),
            ],
        )
        .unwrap()
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, kv) = open_kv();
        kv.put("/t/1/a", "x").unwrap();
        assert_eq!(kv.get("/t/1/a").unwrap(), Some(b"x".to_vec()));
        // overwrite is idempotent
        kv.put("/t/1/a", "y").unwrap();
        assert_eq!(kv.get("/t/1/a").unwrap(), Some(b"y".to_vec()));
        kv.delete("/t/1/a").unwrap();
        assert_eq!(kv.get("/t/1/a").unwrap(), None);
        // deleting a missing key is fine
        kv.delete("/t/1/a").unwrap();
    }

    #[test]
    fn scan_prefix_is_sorted_and_bounded() {
        let (_dir, kv) = open_kv();
        kv.put("/t/2/a", "2a").unwrap();
        kv.put("/t/1/a", "1a").unwrap();
        kv.put("/u/1/a", "other").unwrap();
        let cells = kv.scan_prefix("/t/").unwrap();
        assert_eq!(
            cells,
            vec![
                ("/t/1/a".to_string(), "1a".to_string()),
                ("/t/2/a".to_string(), "2a".to_string()),
            ]
        );
    }

    #[test]
    fn write_row_then_read_table() {
        let (_dir, kv) = open_kv();
        let table = accounts_table();
        kv.write_row(&table, &["1".to_string(), "ada".to_string()])
            .unwrap();
        kv.write_row(&table, &["2".to_string(), "bob".to_string()])
            .unwrap();

        let rows = kv.read_table("public.accounts").unwrap();
        assert_eq!(rows.len(), 2);
        // every row carries a cell for every column
        for (_, cells) in &rows {
            assert!(cells.contains_key("id"));
            assert!(cells.contains_key("name"));
        }
        assert_eq!(rows["1"]["name"], "ada");
        assert_eq!(rows["2"]["name"], "bob");
    }

    #[test]
    fn read_table_of_missing_table_is_empty() {
        let (_dir, kv) = open_kv();
        assert!(kv.read_table("public.nope").unwrap().is_empty());
    }

    #[test]
    fn write_row_requires_primary_key() {
        let (_dir, kv) = open_kv();
        let table = Table::new("t", vec![Column::new("a", DataType::String)]).unwrap();
        assert!(kv.write_row(&table, &["x".to_string()]).is_err());
    }
}
