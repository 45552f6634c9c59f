//! Shared fixtures for the in-memory SQLite tests.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Text};
use diesel_migrations::MigrationHarness;

use crate::MIGRATIONS;
use crate::models::datapoint::Datapoint;
use crate::schema;

/// An empty database without the rule table.
pub fn bare_connection() -> SqliteConnection {
    SqliteConnection::establish(":memory:").expect("in-memory sqlite")
}

/// An in-memory database with migrations applied.
pub fn memory_connection() -> SqliteConnection {
    let mut conn = bare_connection();
    conn.run_pending_migrations(MIGRATIONS).expect("migrations apply");
    conn
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::rollup_rules)]
pub struct NewRule {
    pub rank: i64,
    pub src_table: String,
    pub src_delete: String,
    pub dst_table: String,
    pub aggr1: String,
    pub aggr2: String,
    pub aggr3: String,
    pub aggr4: String,
    pub period: i64,
    pub retention: i64,
}

impl NewRule {
    pub fn avg(rank: i64, src: &str, dst: &str, period: i64) -> Self {
        NewRule {
            rank,
            src_table: src.into(),
            src_delete: "no".into(),
            dst_table: dst.into(),
            aggr1: "avg".into(),
            aggr2: String::new(),
            aggr3: String::new(),
            aggr4: String::new(),
            period,
            retention: 0,
        }
    }
}

pub fn insert_rule(conn: &mut SqliteConnection, rule: NewRule) {
    diesel::insert_into(schema::rollup_rules::table)
        .values(rule)
        .execute(conn)
        .expect("insert rule");
}

pub fn datapoint(measurement: &str, ts_secs: i64, sensor_id: &str, value: f64) -> Datapoint {
    Datapoint {
        measurement: measurement.into(),
        timestamp_millis: ts_secs * 1000,
        sensor_id: sensor_id.into(),
        name: String::new(),
        place: String::new(),
        value,
    }
}

#[derive(Debug, QueryableByName, PartialEq)]
pub struct RolledRow {
    #[diesel(sql_type = BigInt)]
    pub ts: i64,
    #[diesel(sql_type = Text)]
    pub sensorid: String,
    #[diesel(sql_type = Double)]
    pub value: f64,
}

/// Rows of `table` ordered by time, reading `column` as the value.
pub fn rolled_rows(conn: &mut SqliteConnection, table: &str, column: &str) -> Vec<RolledRow> {
    diesel::sql_query(format!(
        "SELECT CAST(ts AS INTEGER) AS ts, sensorid, {column} AS value FROM {table} ORDER BY ts, sensorid"
    ))
    .load(conn)
    .expect("read rows")
}

pub fn count_rows(conn: &mut SqliteConnection, table: &str) -> i64 {
    #[derive(QueryableByName)]
    struct Count {
        #[diesel(sql_type = BigInt)]
        count: i64,
    }
    diesel::sql_query(format!("SELECT COUNT(*) AS count FROM {table}"))
        .get_result::<Count>(conn)
        .expect("count rows")
        .count
}
