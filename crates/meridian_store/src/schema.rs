//! Table, column, and list-partition schema model.
//!
//! Tables are schema-qualified (`public.accounts`). A table optionally
//! carries a list partition whose entries enumerate the exact column values
//! they accept, plus placement constraints (e.g. `region -> us`) used to pick
//! the owning node. Everything round-trips through JSON; partition maps are
//! ordered so the on-disk representation stays deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datum::DataType;
use crate::status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub is_primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Column {
        Column {
            name: name.into(),
            data_type,
            is_primary_key: false,
        }
    }

    pub fn primary_key(name: impl Into<String>, data_type: DataType) -> Column {
        Column {
            name: name.into(),
            data_type,
            is_primary_key: true,
        }
    }
}

/// One named partition: the values it accepts and its placement constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionItem {
    pub values: Vec<String>,
    pub constraints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPartition {
    pub column_name: String,
    pub partitions: BTreeMap<String, PartitionItem>,
}

impl ListPartition {
    pub fn new(column_name: impl Into<String>) -> ListPartition {
        ListPartition {
            column_name: column_name.into(),
            partitions: BTreeMap::new(),
        }
    }

    /// First partition in map order whose value set contains `value`.
    pub fn lookup(&self, value: &str) -> Option<&PartitionItem> {
        self.partitions
            .values()
            .find(|item| item.values.iter().any(|v| v == value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Partition {
    List(ListPartition),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<Partition>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> anyhow::Result<Table> {
        let name = name.into();
        if name.is_empty() {
            return Err(status::invalid_argument("table name must not be empty"));
        }
        // `/` is the cell-key separator, so it cannot appear in names.
        if name.contains('/') {
            return Err(status::invalid_argument(format!(
                "table name must not contain '/': {name}"
            )));
        }
        let mut primary_keys = 0;
        for (index, column) in columns.iter().enumerate() {
            if column.name.contains('/') {
                return Err(status::invalid_argument(format!(
                    "column name must not contain '/': {}",
                    column.name
                )));
            }
            if columns[..index].iter().any(|c| c.name == column.name) {
                return Err(status::invalid_argument(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
            if column.is_primary_key {
                primary_keys += 1;
            }
        }
        if primary_keys > 1 {
            return Err(status::invalid_argument(format!(
                "table {name} declares {primary_keys} primary key columns"
            )));
        }
        Ok(Table {
            name,
            columns,
            partition: None,
        })
    }

    /// Index of the column marked as primary key.
    pub fn pk_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_primary_key)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn list_partition(&self) -> Option<&ListPartition> {
        match &self.partition {
            Some(Partition::List(partition)) => Some(partition),
            None => None,
        }
    }

    pub fn list_partition_mut(&mut self) -> Option<&mut ListPartition> {
        match &mut self.partition {
            Some(Partition::List(partition)) => Some(partition),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let mut table = Table::new(
            "public.accounts",
            vec![
                Column::primary_key("id", DataType::Int64),
                Column::new("name", DataType::String),
                Column::new("region", DataType::String),
            ],
        )
        .unwrap();
        let mut partition = ListPartition::new("region");
        partition.partitions.insert(
            "accounts_us".to_string(),
            PartitionItem {
                values: vec!["us".to_string()],
                constraints: BTreeMap::from([("region".to_string(), "us".to_string())]),
            },
        );
        partition.partitions.insert(
            "accounts_eu".to_string(),
            PartitionItem {
                values: vec!["eu".to_string(), "uk".to_string()],
                constraints: BTreeMap::from([("region".to_string(), "eu".to_string())]),
            },
        );
        table.partition = Some(Partition::List(partition));
        table
    }

    #[test]
    fn column_json_field_order() {
        let column = Column::primary_key("id", DataType::Int64);
        assert_eq!(
            serde_json::to_string(&column).unwrap(),
            r#"{"name":"id","type":"INT64","is_primary_key":true}"#
        );
    }

    #[test]
    fn table_json_round_trip() {
        let table = sample_table();
        let encoded = serde_json::to_string(&table).unwrap();
        let decoded: Table = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn table_without_partition_omits_field() {
        let table = Table::new("t", vec![Column::new("a", DataType::String)]).unwrap();
        let encoded = serde_json::to_string(&table).unwrap();
        assert!(!encoded.contains("partition"));
        let decoded: Table = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn lookup_scans_in_map_order() {
        let table = sample_table();
        let partition = table.list_partition().unwrap();
        let item = partition.lookup("uk").unwrap();
        assert_eq!(item.constraints.get("region").map(String::as_str), Some("eu"));
        assert!(partition.lookup("asia").is_none());
    }

    #[test]
    fn lookup_misses_do_not_fall_back_to_first_partition() {
        let table = sample_table();
        let partition = table.list_partition().unwrap();
        assert!(partition.lookup("").is_none());
        assert!(partition.lookup("u").is_none());
    }

    #[test]
    fn pk_index_finds_marked_column() {
        let table = sample_table();
        assert_eq!(table.pk_index(), Some(0));
        let no_pk = Table::new("t", vec![Column::new("a", DataType::String)]).unwrap();
        assert_eq!(no_pk.pk_index(), None);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(Table::new("a/b", vec![]).is_err());
        assert!(Table::new(
            "t",
            vec![
                Column::new("a", DataType::String),
                Column::new("a", DataType::Int64),
            ],
        )
        .is_err());
        assert!(Table::new(
            "t",
            vec![
                Column::primary_key("a", DataType::Int64),
                Column::primary_key("b", DataType::Int64),
            ],
        )
        .is_err());
    }
}
