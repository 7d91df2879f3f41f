//! Statement routing and execution.
//!
//! Each parsed statement becomes either a catalog operation, a local scan of
//! the cell store, or an RPC dispatch to the node that owns the target
//! partition. Results come back as a small columnar batch the wire server
//! encodes; DDL and DML produce the empty batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog;
use crate::datum::{self, DataType, Datum};
use crate::kv;
use crate::rpc::{self, RowPacket};
use crate::schema::Column;
use crate::sql::{
    self, AlterTableStmt, ArithOp, CreateTableStmt, InsertStmt, SelectStmt, SelectTarget,
    SetExpr, Statement, UpdateStmt,
};
use crate::status;
use crate::NodeState;

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub enum ColumnData {
    Int64(Vec<i64>),
    String(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Int64(values) => values.len(),
            ColumnData::String(values) => values.len(),
        }
    }
}

/// A columnar result batch.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub fields: Vec<Field>,
    pub columns: Vec<ColumnData>,
}

impl RecordBatch {
    pub fn empty() -> RecordBatch {
        RecordBatch {
            fields: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(ColumnData::len).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    /// Text rendering of one cell, as sent on the wire.
    pub fn cell_text(&self, row: usize, column: usize) -> String {
        match &self.columns[column] {
            ColumnData::Int64(values) => values[row].to_string(),
            ColumnData::String(values) => values[row].clone(),
        }
    }
}

/// Parse and run a query string. Statements execute in order; the reply
/// describes the last one.
pub async fn execute(state: &Arc<NodeState>, sql_text: &str) -> anyhow::Result<RecordBatch> {
    let statements = sql::parse_statements(sql_text)?;
    let mut batch = RecordBatch::empty();
    for statement in statements {
        batch = execute_statement(state, statement).await?;
    }
    Ok(batch)
}

async fn execute_statement(
    state: &Arc<NodeState>,
    statement: Statement,
) -> anyhow::Result<RecordBatch> {
    match statement {
        Statement::CreateTable(stmt) => {
            create_table(state, stmt).await?;
            Ok(RecordBatch::empty())
        }
        Statement::DropTable(stmt) => {
            state.catalog.drop_table(&stmt.name.qualified())?;
            Ok(RecordBatch::empty())
        }
        Statement::AlterTable(stmt) => {
            add_constraint(state, &stmt)?;
            Ok(RecordBatch::empty())
        }
        Statement::Select(stmt) => select(state, &stmt),
        Statement::Insert(stmt) => {
            insert(state, &stmt).await?;
            Ok(RecordBatch::empty())
        }
        Statement::Update(stmt) => {
            update_dispatch(state, &stmt).await?;
            Ok(RecordBatch::empty())
        }
    }
}

async fn create_table(state: &Arc<NodeState>, stmt: CreateTableStmt) -> anyhow::Result<()> {
    // `CREATE TABLE ... PARTITION OF parent FOR VALUES IN (...)` binds a
    // value list to a named partition of the parent.
    if let Some(parent) = &stmt.parent {
        let values: Vec<String> = stmt.bound_values.iter().map(Datum::encode).collect();
        return state
            .catalog
            .add_list_partition(&parent.qualified(), &stmt.name.name, &values);
    }

    let mut columns = Vec::with_capacity(stmt.columns.len());
    for def in &stmt.columns {
        let data_type = DataType::from_sql_name(&def.type_name)?;
        let mut column = Column::new(def.name.clone(), data_type);
        column.is_primary_key = def.primary_key;
        columns.push(column);
    }
    state
        .catalog
        .create_table(&stmt.name.qualified(), columns)
        .await?;

    if let Some(partition_by) = &stmt.partition_by {
        state.catalog.set_partition(
            &stmt.name.qualified(),
            &partition_by.column,
            partition_by.strategy,
        )?;
    }
    Ok(())
}

fn add_constraint(state: &Arc<NodeState>, stmt: &AlterTableStmt) -> anyhow::Result<()> {
    state.catalog.add_partition_constraint(
        &stmt.table.name,
        (
            stmt.constraint_column.clone(),
            stmt.constraint_value.encode(),
        ),
    )
}

fn select(state: &Arc<NodeState>, stmt: &SelectStmt) -> anyhow::Result<RecordBatch> {
    let table_name = stmt.table.qualified();
    let table = state
        .catalog
        .get_table(&table_name)
        .ok_or_else(|| status::not_found(format!("table not found: {table_name}")))?;

    for target in &stmt.targets {
        if let SelectTarget::Column(name) = target {
            return Err(status::invalid_argument(format!(
                "unsupported select target: {name}"
            )));
        }
    }

    let rows = state.kv.read_table(&table_name)?;
    let mut builders: Vec<ColumnData> = table
        .columns
        .iter()
        .map(|column| match column.data_type {
            DataType::Int64 => ColumnData::Int64(Vec::with_capacity(rows.len())),
            DataType::String => ColumnData::String(Vec::with_capacity(rows.len())),
        })
        .collect();

    for (pk, cells) in &rows {
        for (column, builder) in table.columns.iter().zip(builders.iter_mut()) {
            let Some(raw) = cells.get(&column.name) else {
                return Err(status::invalid_argument(format!(
                    "column {} missing for row {pk}",
                    column.name
                )));
            };
            match builder {
                ColumnData::Int64(values) => {
                    let Datum::Int64(value) = datum::decode(raw, DataType::Int64)? else {
                        return Err(status::internal("decoder returned mismatched type"));
                    };
                    values.push(value);
                }
                ColumnData::String(values) => {
                    values.push(render_string_cell(&table_name, &column.name, raw)?);
                }
            }
        }
    }

    // `SELECT *` projects every field in table order.
    let fields = table
        .columns
        .iter()
        .map(|column| Field {
            name: column.name.clone(),
            data_type: column.data_type,
        })
        .collect();
    Ok(RecordBatch {
        fields,
        columns: builders,
    })
}

/// The stored column list of `system.tables` is JSON; render it in the
/// compact `name:type(PK), ...` form for clients.
fn render_string_cell(table_name: &str, column_name: &str, raw: &str) -> anyhow::Result<String> {
    if table_name == catalog::SYSTEM_TABLES && column_name == "columns" {
        let columns: Vec<Column> = serde_json::from_str(raw)
            .map_err(|err| status::internal(format!("malformed columns cell: {err}")))?;
        let rendered = columns
            .iter()
            .map(|column| {
                let mut cell = format!("{}:{}", column.name, column.data_type.display_name());
                if column.is_primary_key {
                    cell.push_str("(PK)");
                }
                cell
            })
            .collect::<Vec<_>>()
            .join(", ");
        return Ok(rendered);
    }
    Ok(raw.to_string())
}

async fn insert(state: &Arc<NodeState>, stmt: &InsertStmt) -> anyhow::Result<()> {
    let table_name = stmt.table.qualified();
    let table = state
        .catalog
        .get_table(&table_name)
        .ok_or_else(|| status::not_found(format!("table not found: {table_name}")))?;

    let Some(partition) = table.list_partition() else {
        return Err(status::unimplemented(format!(
            "insert into table {table_name} without partition is not supported"
        )));
    };

    // An omitted column list means table order.
    let columns: Vec<String> = if stmt.columns.is_empty() {
        table.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        stmt.columns.clone()
    };
    let partition_index = columns
        .iter()
        .position(|name| *name == partition.column_name)
        .ok_or_else(|| {
            status::internal(format!(
                "partition column {} not found",
                partition.column_name
            ))
        })?;

    for row in &stmt.rows {
        if row.len() != columns.len() {
            return Err(status::invalid_argument(format!(
                "insert row has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        let partition_value = row[partition_index].encode();
        let item = partition.lookup(&partition_value).ok_or_else(|| {
            status::internal(format!("partition not found for value {partition_value}"))
        })?;

        let nodes = state.gossip.get_nodes(&item.constraints);
        if nodes.is_empty() {
            return Err(status::internal(format!(
                "no server found for partition {partition_value}"
            )));
        }
        if nodes.len() > 1 {
            return Err(status::internal(format!(
                "multiple servers found for partition {partition_value}"
            )));
        }

        let packet = RowPacket {
            table_name: table_name.clone(),
            column_names: columns.clone(),
            column_values: row.iter().map(Datum::encode).collect(),
        };
        rpc::insert(&nodes[0].grpc_addr, &packet, rpc::DEFAULT_RPC_DEADLINE)
            .await
            .map_err(|err| {
                status::internal(format!(
                    "failed to insert row into server {}: {err}",
                    nodes[0].grpc_addr
                ))
            })?;
    }
    Ok(())
}

/// Receiving side of `Insert.Insert`: write one cell per column, in table
/// column order so a row is always complete.
pub fn apply_insert(state: &Arc<NodeState>, row: &RowPacket) -> anyhow::Result<()> {
    let table = state
        .catalog
        .get_table(&row.table_name)
        .ok_or_else(|| status::not_found(format!("table not found: {}", row.table_name)))?;
    if row.column_names.len() != row.column_values.len() {
        return Err(status::invalid_argument(format!(
            "insert row has {} names but {} values",
            row.column_names.len(),
            row.column_values.len()
        )));
    }
    let mut values = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let index = row
            .column_names
            .iter()
            .position(|name| *name == column.name)
            .ok_or_else(|| {
                status::invalid_argument(format!(
                    "column {} missing from insert row",
                    column.name
                ))
            })?;
        values.push(row.column_values[index].clone());
    }
    state.kv.write_row(&table, &values)?;
    crate::stats::NodeStats::bump(&state.stats.rows_inserted);
    Ok(())
}

/// Initiating side of UPDATE: package the statement and send it to every
/// known node; each recipient applies it against its local cells.
pub async fn update_dispatch(state: &Arc<NodeState>, stmt: &UpdateStmt) -> anyhow::Result<()> {
    let table_name = stmt.table.qualified();
    if state.catalog.get_table(&table_name).is_none() {
        return Err(status::not_found(format!("table not found: {table_name}")));
    }
    let nodes = state.gossip.get_nodes(&BTreeMap::new());
    for node in nodes {
        rpc::update(&node.grpc_addr, stmt, rpc::DEFAULT_RPC_DEADLINE)
            .await
            .map_err(|err| {
                status::internal(format!(
                    "failed to update into server {}: {err}",
                    node.grpc_addr
                ))
            })?;
    }
    Ok(())
}

/// Receiving side of `Update.Update`: scan the table, keep rows matching the
/// WHERE equality, and rewrite the targeted cells.
pub fn update_local(state: &Arc<NodeState>, stmt: &UpdateStmt) -> anyhow::Result<()> {
    let table_name = stmt.table.qualified();
    let table = state
        .catalog
        .get_table(&table_name)
        .ok_or_else(|| status::not_found(format!("table not found: {table_name}")))?;

    let rows = state.kv.read_table(&table_name)?;
    let filter_value = stmt.filter.value.encode();
    for (pk, cells) in &rows {
        let matched = cells
            .get(&stmt.filter.column)
            .map(|value| *value == filter_value)
            .unwrap_or(false);
        if !matched {
            continue;
        }
        for target in &stmt.targets {
            let new_value = match &target.value {
                SetExpr::Literal(datum) => datum.encode(),
                SetExpr::Binary {
                    column: ref_column,
                    op,
                    operand,
                } => {
                    let current_raw = cells.get(ref_column).ok_or_else(|| {
                        status::internal(format!("column {ref_column} missing for row {pk}"))
                    })?;
                    let column_type = table
                        .columns
                        .iter()
                        .find(|c| c.name == target.column)
                        .map(|c| c.data_type)
                        .ok_or_else(|| {
                            status::not_found(format!("column not found: {}", target.column))
                        })?;
                    if column_type != DataType::Int64 {
                        return Err(status::internal(format!(
                            "unsupported type for arithmetic: {}",
                            column_type.display_name()
                        )));
                    }
                    let Datum::Int64(current) = datum::decode(current_raw, DataType::Int64)?
                    else {
                        return Err(status::internal("decoder returned mismatched type"));
                    };
                    let Datum::Int64(operand) = operand else {
                        return Err(status::internal(
                            "unsupported operand for arithmetic",
                        ));
                    };
                    let result = match op {
                        ArithOp::Add => current.checked_add(*operand),
                        ArithOp::Sub => current.checked_sub(*operand),
                        ArithOp::Mul => current.checked_mul(*operand),
                        ArithOp::Div => {
                            return Err(status::internal(format!(
                                "unsupported operator: {}",
                                op.symbol()
                            )));
                        }
                    }
                    .ok_or_else(|| {
                        status::internal("integer overflow in update expression")
                    })?;
                    Datum::Int64(result).encode()
                }
            };
            state
                .kv
                .put(&kv::cell_key(&table_name, pk, &target.column), &new_value)?;
            crate::stats::NodeStats::bump(&state.stats.cells_updated);
        }
    }
    Ok(())
}
