//! Logical column types and datum encoding.
//!
//! Two logical types exist: 64-bit signed integers and UTF-8 strings. Cell
//! values travel and persist as text: integers as decimal ASCII, strings
//! unchanged. The same encoding is used for KV cells and for the text format
//! of the PostgreSQL wire protocol.

use serde::{Deserialize, Serialize};

use crate::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "INT64")]
    Int64,
    #[serde(rename = "STRING")]
    String,
}

impl DataType {
    /// PostgreSQL type OID reported in `RowDescription` (int8 / text).
    pub fn pg_oid(self) -> u32 {
        match self {
            DataType::Int64 => 20,
            DataType::String => 25,
        }
    }

    /// PostgreSQL `typlen`: fixed byte width, or -1 for varlena types.
    pub fn pg_len(self) -> i16 {
        match self {
            DataType::Int64 => 8,
            DataType::String => -1,
        }
    }

    /// Short display name used when rendering catalog rows.
    pub fn display_name(self) -> &'static str {
        match self {
            DataType::Int64 => "int4",
            DataType::String => "string",
        }
    }

    /// Resolve a SQL-level type name into a logical type.
    pub fn from_sql_name(name: &str) -> anyhow::Result<DataType> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "int4" | "int8" | "integer" | "bigint" => Ok(DataType::Int64),
            "string" | "text" | "varchar" => Ok(DataType::String),
            other => Err(status::unsupported(format!("unknown type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datum {
    Int64(i64),
    String(String),
}

impl Datum {
    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Int64(_) => DataType::Int64,
            Datum::String(_) => DataType::String,
        }
    }

    /// Encode to the textual cell representation.
    pub fn encode(&self) -> String {
        match self {
            Datum::Int64(value) => value.to_string(),
            Datum::String(value) => value.clone(),
        }
    }
}

/// Decode a textual cell back into a datum of the given type.
pub fn decode(raw: &str, data_type: DataType) -> anyhow::Result<Datum> {
    match data_type {
        DataType::Int64 => raw
            .parse::<i64>()
            .map(Datum::Int64)
            .map_err(|_| status::malformed_value(format!("malformed int64 value: {raw}"))),
        DataType::String => Ok(Datum::String(raw.to_string())),
    }
}
