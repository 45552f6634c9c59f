//! Lazy creation of measurement and rollup tables.
//!
//! A table is ensured explicitly the first time it is referenced and then
//! remembered in [`KnownSchemas`]. If a statement against a remembered table
//! still fails (dropped externally, or a rollback undid its creation) the table
//! is provisioned again and the statement retried exactly once.

use diesel::prelude::*;
use log::{debug, info, warn};
use std::collections::HashSet;

use crate::db::error::EngineError;
use crate::db::query::{self, ColumnName, Ident, RowCount};

#[derive(Debug, Copy, Clone)]
pub enum TableLayout<'a> {
    /// `ts, sensorid, value, name, place` with a non-unique `(ts, sensorid)` index.
    Raw,
    /// `ts, sensorid, <value columns>, name, place` with a unique `(ts, sensorid, name, place)` index.
    Rollup { value_columns: &'a [Ident] },
}

/// Tables already provisioned by this process.
#[derive(Debug, Default)]
pub struct KnownSchemas {
    tables: HashSet<Ident>,
}

impl KnownSchemas {
    pub fn contains(&self, table: &Ident) -> bool {
        self.tables.contains(table)
    }

    pub fn mark(&mut self, table: &Ident) {
        self.tables.insert(table.clone());
    }

    pub fn forget(&mut self, table: &Ident) {
        self.tables.remove(table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

pub fn table_exists(conn: &mut SqliteConnection, table: &Ident) -> Result<bool, EngineError> {
    let rows: Vec<RowCount> = query::table_exists(table)
        .load(conn)
        .map_err(|e| EngineError::store(format!("checking table {} failed", table), e))?;
    Ok(rows.first().is_some_and(|r| r.count > 0))
}

/// Creates `table` and its index if missing. For rollup tables, value columns
/// missing from an existing table are added.
pub fn ensure_table(conn: &mut SqliteConnection, table: &Ident, layout: TableLayout<'_>) -> Result<(), EngineError> {
    match layout {
        TableLayout::Raw => {
            query::create_raw_table(table)
                .execute(conn)
                .map_err(|e| EngineError::provision(table.as_str(), e))?;
            query::create_raw_index(table)
                .execute(conn)
                .map_err(|e| EngineError::provision(table.as_str(), e))?;
        }
        TableLayout::Rollup { value_columns } => {
            query::create_rollup_table(table, value_columns)
                .execute(conn)
                .map_err(|e| EngineError::provision(table.as_str(), e))?;
            query::create_rollup_index(table)
                .execute(conn)
                .map_err(|e| EngineError::provision(table.as_str(), e))?;
            add_missing_columns(conn, table, value_columns)?;
        }
    }
    debug!("Schema ensured for table {}", table);
    Ok(())
}

fn add_missing_columns(conn: &mut SqliteConnection, table: &Ident, value_columns: &[Ident]) -> Result<(), EngineError> {
    let existing: HashSet<String> = query::table_columns(table)
        .load::<ColumnName>(conn)
        .map_err(|e| EngineError::provision(table.as_str(), e))?
        .into_iter()
        .map(|c| c.name)
        .collect();

    for column in value_columns {
        if existing.contains(column.as_str()) {
            continue;
        }
        query::add_value_column(table, column)
            .execute(conn)
            .map_err(|e| EngineError::provision(table.as_str(), e))?;
        info!("Added column {} to table {}", column, table);
    }
    Ok(())
}

/// Runs `op` against `table`, provisioning the table first if this process has
/// not seen it yet, and once more if `op` fails.
pub fn with_schema<T>(
    conn: &mut SqliteConnection,
    schemas: &mut KnownSchemas,
    table: &Ident,
    layout: TableLayout<'_>,
    mut op: impl FnMut(&mut SqliteConnection) -> QueryResult<T>,
) -> Result<T, EngineError> {
    if !schemas.contains(table) {
        ensure_table(conn, table, layout)?;
        schemas.mark(table);
    }

    match op(conn) {
        Ok(v) => Ok(v),
        Err(first) => {
            warn!("Statement against {} failed ({}); provisioning and retrying once", table, first);
            schemas.forget(table);
            ensure_table(conn, table, layout)?;
            schemas.mark(table);
            op(conn).map_err(|e| EngineError::store(format!("statement against {} failed after provisioning", table), e))
        }
    }
}
