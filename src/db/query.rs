//! Statement builders for the dynamically named measurement and rollup tables.
//!
//! Table and column names come from payloads and operator-edited rules, so they
//! cannot be bound as parameters. Every name is carried as an [`Ident`] which is
//! validated on construction and always quoted when rendered. Values
//! (timestamps, periods, readings) are bound.

use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::query_dsl::LoadQuery;
use diesel::sql_types::{BigInt, Double, Nullable, Text};
use diesel::sqlite::Sqlite;
use std::fmt::{self, Display, Formatter};

use crate::db::error::EngineError;
use crate::db::models::{AggregateFn, RAW_VALUE_COLUMN};

/// Prefix of raw tables; the remainder is the measurement name.
pub const RAW_TABLE_PREFIX: &str = "measurements_";

/// A table or column name matching `[A-Za-z_][A-Za-z0-9_]{0,63}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub const MAX_LEN: usize = 64;

    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let well_formed = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        // sqlite_* names are reserved for the store's internal tables
        let reserved = raw.to_ascii_lowercase().starts_with("sqlite_");
        if !well_formed || reserved || raw.len() > Self::MAX_LEN {
            return Err(EngineError::InvalidIdentifier(raw));
        }
        Ok(Ident(raw))
    }

    /// Raw table receiving datapoints of `measurement`.
    pub fn measurement_table(measurement: &str) -> Result<Self, EngineError> {
        Ident::new(format!("{RAW_TABLE_PREFIX}{measurement}"))
    }

    /// The `value` column of raw measurement tables.
    pub fn raw_value_column() -> Self {
        Ident(RAW_VALUE_COLUMN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl From<AggregateFn> for Ident {
    fn from(function: AggregateFn) -> Self {
        Ident(function.column_name().to_string())
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Rendered SQL plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<Bind>,
}

impl Statement {
    fn new(sql: impl Into<String>) -> Self {
        Statement {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    fn bind(mut self, value: Bind) -> Self {
        self.binds.push(value);
        self
    }

    fn boxed(&self) -> BoxedSqlQuery<'static, Sqlite, SqlQuery> {
        let mut query = diesel::sql_query(self.sql.clone()).into_boxed::<Sqlite>();
        for value in &self.binds {
            query = match value {
                Bind::Integer(v) => query.bind::<BigInt, _>(*v),
                Bind::Real(v) => query.bind::<Double, _>(*v),
                Bind::Text(v) => query.bind::<Text, _>(v.clone()),
            };
        }
        query
    }

    pub fn execute(&self, conn: &mut SqliteConnection) -> QueryResult<usize> {
        self.boxed().execute(conn)
    }

    pub fn load<T>(&self, conn: &mut SqliteConnection) -> QueryResult<Vec<T>>
    where
        for<'a> BoxedSqlQuery<'static, Sqlite, SqlQuery>: LoadQuery<'a, SqliteConnection, T>,
    {
        self.boxed().load::<T>(conn)
    }
}

#[derive(Debug, QueryableByName)]
pub struct MaxTimestamp {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub ts: Option<i64>,
}

#[derive(Debug, QueryableByName)]
pub struct RowCount {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(Debug, QueryableByName)]
pub struct ColumnName {
    #[diesel(sql_type = Text)]
    pub name: String,
}

pub fn table_exists(table: &Ident) -> Statement {
    Statement::new("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(Bind::Text(table.as_str().to_string()))
}

pub fn table_columns(table: &Ident) -> Statement {
    Statement::new("SELECT name FROM pragma_table_info(?)").bind(Bind::Text(table.as_str().to_string()))
}

pub fn max_timestamp(table: &Ident) -> Statement {
    Statement::new(format!("SELECT CAST(MAX(ts) AS INTEGER) AS ts FROM {}", table.quoted()))
}

pub fn create_raw_table(table: &Ident) -> Statement {
    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         ts REAL NOT NULL, \
         sensorid TEXT NOT NULL, \
         value REAL NOT NULL, \
         name TEXT, \
         place TEXT)",
        table.quoted()
    ))
}

pub fn create_raw_index(table: &Ident) -> Statement {
    Statement::new(format!(
        "CREATE INDEX IF NOT EXISTS \"idx_{}_ts_sensorid\" ON {} (ts, sensorid)",
        table.as_str(),
        table.quoted()
    ))
}

pub fn create_rollup_table(table: &Ident, value_columns: &[Ident]) -> Statement {
    let columns = value_columns
        .iter()
        .map(|c| format!("{} REAL NOT NULL, ", c.quoted()))
        .collect::<String>();
    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         ts INTEGER NOT NULL, \
         sensorid TEXT NOT NULL, \
         {}name TEXT NOT NULL DEFAULT '', \
         place TEXT NOT NULL DEFAULT '')",
        table.quoted(),
        columns
    ))
}

/// The unique key that makes re-applying a window an idempotent replace.
pub fn create_rollup_index(table: &Ident) -> Statement {
    Statement::new(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_{}_ts_sensorid_name_place\" ON {} (ts, sensorid, name, place)",
        table.as_str(),
        table.quoted()
    ))
}

/// Columns added after creation cannot be NOT NULL without a default; older rows keep NULL.
pub fn add_value_column(table: &Ident, column: &Ident) -> Statement {
    Statement::new(format!("ALTER TABLE {} ADD COLUMN {} REAL", table.quoted(), column.quoted()))
}

pub fn insert_raw(
    table: &Ident,
    ts_secs: f64,
    sensor_id: &str,
    value: f64,
    name: &str,
    place: &str,
) -> Statement {
    Statement::new(format!(
        "INSERT INTO {} (ts, sensorid, value, name, place) VALUES (?, ?, ?, ?, ?)",
        table.quoted()
    ))
    .bind(Bind::Real(ts_secs))
    .bind(Bind::Text(sensor_id.to_string()))
    .bind(Bind::Real(value))
    .bind(Bind::Text(name.to_string()))
    .bind(Bind::Text(place.to_string()))
}

/// Deletes rows with `start <= ts < end`.
pub fn delete_range(table: &Ident, start: i64, end: i64) -> Statement {
    Statement::new(format!("DELETE FROM {} WHERE ts >= ? AND ts < ?", table.quoted()))
        .bind(Bind::Integer(start))
        .bind(Bind::Integer(end))
}

pub fn delete_before(table: &Ident, cutoff: i64) -> Statement {
    Statement::new(format!("DELETE FROM {} WHERE ts < ?", table.quoted())).bind(Bind::Integer(cutoff))
}

/// One aggregated output column: `output = function(input)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub function: AggregateFn,
    pub input: Ident,
    pub output: Ident,
}

/// Grouped aggregation of `source` rows in `[start, end)` into `destination`,
/// bucketed by `period` seconds.
#[derive(Debug, Clone)]
pub struct RollupQuery<'a> {
    pub source: &'a Ident,
    pub destination: &'a Ident,
    pub projections: &'a [Projection],
    pub period: i64,
    pub start: i64,
    pub end: i64,
}

impl RollupQuery<'_> {
    pub fn to_statement(&self) -> Statement {
        let outputs = self
            .projections
            .iter()
            .map(|p| p.output.quoted())
            .collect::<Vec<_>>()
            .join(", ");
        let aggregates = self
            .projections
            .iter()
            .map(|p| format!("{}({})", p.function.sql_function(), p.input.quoted()))
            .collect::<Vec<_>>()
            .join(", ");

        Statement::new(format!(
            "INSERT OR REPLACE INTO {dst} (ts, sensorid, {outputs}, name, place) \
             SELECT CAST(ts / ? AS INTEGER) * ? AS bucket, sensorid, {aggregates}, \
             COALESCE(name, '') AS tag_name, COALESCE(place, '') AS tag_place \
             FROM {src} \
             WHERE ts >= ? AND ts < ? \
             GROUP BY bucket, sensorid, tag_name, tag_place",
            dst = self.destination.quoted(),
            src = self.source.quoted(),
        ))
        .bind(Bind::Integer(self.period))
        .bind(Bind::Integer(self.period))
        .bind(Bind::Integer(self.start))
        .bind(Bind::Integer(self.end))
    }
}
