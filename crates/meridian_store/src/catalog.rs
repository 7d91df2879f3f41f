//! Table metadata: the in-memory authoritative copy for this node, durably
//! backed by the cell store, loosely synchronized with peers through
//! `Catalog.UpdateTable` fan-out during CREATE TABLE.
//!
//! Two system tables are bootstrapped at startup and persisted through the
//! same write path as user tables: `system.tables` (one row per table, with
//! the column list as JSON) and `system.partitions` (one row per list
//! partition entry).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::datum::DataType;
use crate::gossip::GossipStore;
use crate::kv::Kv;
use crate::rpc;
use crate::schema::{Column, ListPartition, Partition, PartitionItem, Table};
use crate::sql::PartitionStrategy;
use crate::status;

pub const SYSTEM_TABLES: &str = "system.tables";
pub const SYSTEM_PARTITIONS: &str = "system.partitions";

pub struct Catalog {
    tables: RwLock<HashMap<String, Table>>,
    system_tables: Table,
    system_partitions: Table,
    kv: Kv,
    gossip: Arc<GossipStore>,
    cluster_size: usize,
}

impl Catalog {
    pub fn new(kv: Kv, gossip: Arc<GossipStore>, cluster_size: usize) -> anyhow::Result<Catalog> {
        let system_tables = Table::new(
            SYSTEM_TABLES,
            vec![
                Column::primary_key("table_name", DataType::String),
                Column::new("columns", DataType::String),
            ],
        )?;
        let system_partitions = Table::new(
            SYSTEM_PARTITIONS,
            vec![
                Column::new("table_name", DataType::String),
                Column::primary_key("partition_name", DataType::String),
                Column::new("constraint", DataType::String),
                Column::new("column_name", DataType::String),
                Column::new("partition_value", DataType::String),
            ],
        )?;
        let catalog = Catalog {
            tables: RwLock::new(HashMap::new()),
            system_tables: system_tables.clone(),
            system_partitions: system_partitions.clone(),
            kv,
            gossip,
            cluster_size: cluster_size.max(1),
        };
        catalog.update_table(system_tables)?;
        catalog.update_table(system_partitions)?;
        Ok(catalog)
    }

    pub fn get_table(&self, name: &str) -> Option<Table> {
        self.tables.read().unwrap().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Install a table into the in-memory map and persist its catalog rows.
    /// No further broadcast; this is also the receiving end of the fan-out.
    pub fn update_table(&self, table: Table) -> anyhow::Result<()> {
        self.persist_table(&table)?;
        self.tables
            .write()
            .unwrap()
            .insert(table.name.clone(), table);
        Ok(())
    }

    fn persist_table(&self, table: &Table) -> anyhow::Result<()> {
        let columns_json = serde_json::to_string(&table.columns)?;
        self.kv
            .write_row(&self.system_tables, &[table.name.clone(), columns_json])?;
        if let Some(partition) = table.list_partition() {
            for (partition_name, item) in &partition.partitions {
                let row = vec![
                    table.name.clone(),
                    partition_name.clone(),
                    serde_json::to_string(&item.constraints)?,
                    partition.column_name.clone(),
                    serde_json::to_string(&item.values)?,
                ];
                self.kv.write_row(&self.system_partitions, &row)?;
            }
        }
        Ok(())
    }

    pub fn create_table_local(&self, name: &str, columns: Vec<Column>) -> anyhow::Result<()> {
        if self.get_table(name).is_some() {
            return Err(status::already_exists(format!(
                "table already exists: {name}"
            )));
        }
        let table = Table::new(name, columns)?;
        self.update_table(table)
    }

    /// Create a table locally, then fan the definition out to every known
    /// peer. Requires the gossip membership to have reached the configured
    /// cluster size.
    pub async fn create_table(&self, name: &str, columns: Vec<Column>) -> anyhow::Result<()> {
        self.create_table_local(name, columns)?;

        let nodes = self.gossip.get_nodes(&BTreeMap::new());
        if nodes.len() < self.cluster_size {
            warn!(
                known = nodes.len(),
                required = self.cluster_size,
                "create table blocked on membership"
            );
            return Err(status::internal("not enough nodes"));
        }

        let table = self
            .get_table(name)
            .ok_or_else(|| status::internal(format!("table {name} vanished during create")))?;
        let self_id = &self.gossip.self_info().id;
        for node in nodes.iter().filter(|node| node.id != *self_id) {
            rpc::update_table(&node.grpc_addr, &table, rpc::UPDATE_TABLE_DEADLINE)
                .await
                .map_err(|err| {
                    status::internal(format!(
                        "failed to update table on server {}: {err}",
                        node.grpc_addr
                    ))
                })?;
            debug!(peer = %node.grpc_addr, table = %name, "table definition sent");
        }
        Ok(())
    }

    /// Attach a partition spec to an existing table. Only LIST is supported.
    pub fn set_partition(
        &self,
        table_name: &str,
        column_name: &str,
        strategy: PartitionStrategy,
    ) -> anyhow::Result<()> {
        if strategy != PartitionStrategy::List {
            return Err(status::internal(format!(
                "Unsupported partition strategy: {strategy:?}"
            )));
        }
        let mut table = self
            .get_table(table_name)
            .ok_or_else(|| status::not_found(format!("table not found: {table_name}")))?;
        if table.column_index(column_name).is_none() {
            return Err(status::invalid_argument(format!(
                "partition column not found: {column_name}"
            )));
        }
        table.partition = Some(Partition::List(ListPartition::new(column_name)));
        self.update_table(table)
    }

    /// Append values to a named partition of `table_name`, creating the
    /// partition entry when missing.
    pub fn add_list_partition(
        &self,
        table_name: &str,
        partition_name: &str,
        values: &[String],
    ) -> anyhow::Result<()> {
        let mut table = self
            .get_table(table_name)
            .ok_or_else(|| status::not_found(format!("table not found: {table_name}")))?;
        let Some(partition) = table.list_partition_mut() else {
            return Err(status::internal(format!(
                "table {table_name} has no list partition"
            )));
        };
        let item = partition
            .partitions
            .entry(partition_name.to_string())
            .or_insert_with(PartitionItem::default);
        for value in values {
            if !item.values.contains(value) {
                item.values.push(value.clone());
            }
        }
        self.update_table(table)
    }

    /// Find the table holding `partition_name` in its list partition and add
    /// a placement constraint to that partition.
    pub fn add_partition_constraint(
        &self,
        partition_name: &str,
        constraint: (String, String),
    ) -> anyhow::Result<()> {
        let table = {
            let tables = self.tables.read().unwrap();
            tables
                .values()
                .find(|table| {
                    table
                        .list_partition()
                        .map_or(false, |p| p.partitions.contains_key(partition_name))
                })
                .cloned()
        };
        let Some(mut table) = table else {
            return Err(status::not_found(format!(
                "partition not found: {partition_name}"
            )));
        };
        if let Some(partition) = table.list_partition_mut() {
            if let Some(item) = partition.partitions.get_mut(partition_name) {
                item.constraints.insert(constraint.0, constraint.1);
            }
        }
        self.update_table(table)
    }

    /// Remove a table. Idempotent: dropping a missing table is fine.
    pub fn drop_table(&self, name: &str) -> anyhow::Result<()> {
        self.tables.write().unwrap().remove(name);
        let prefix = format!("/{SYSTEM_TABLES}/{name}/");
        for (key, _) in self.kv.scan_prefix(&prefix)? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }
}
