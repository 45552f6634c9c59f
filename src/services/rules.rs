//! Rule store: reads operator-managed rollup rules and normalizes them.
//!
//! Conventions for stored rows:
//! - `period` and `retention` are seconds.
//! - `period <= 0` is not a rule; anything below one minute is raised to one minute.
//! - `retention = 0` keeps rollups forever; anything below one hour is raised to one hour.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use log::{debug, info, warn};

use crate::db::error::EngineError;
use crate::db::models::{AGGREGATE_SLOTS, AggregateFn, RollupRule, RuleRow};
use crate::db::query::Ident;
use crate::schema;

pub const MIN_PERIOD_SECS: i64 = 60;
pub const MIN_RETENTION_SECS: i64 = 3600;

// Same DDL as the embedded migration; every statement is IF NOT EXISTS.
const RULE_TABLE_DDL: &str = include_str!("../../migrations/2025-06-01-000000_create_rollup_rules/up.sql");

/// Returns the valid rules ordered by rank. The rule table is created if it
/// cannot be read, and the read retried once.
pub fn load_rules(conn: &mut SqliteConnection) -> Result<Vec<RollupRule>, EngineError> {
    let rows = match fetch_rows(conn) {
        Ok(rows) => rows,
        Err(first) => {
            warn!("Reading rollup_rules failed ({}); provisioning rule table", first);
            conn.batch_execute(RULE_TABLE_DDL)
                .map_err(|e| EngineError::provision("rollup_rules", e))?;
            info!("Rule table rollup_rules provisioned");
            fetch_rows(conn).map_err(|e| EngineError::store("reading rollup_rules after provisioning", e))?
        }
    };

    let total = rows.len();
    let rules = rows.into_iter().filter_map(normalize_rule).collect::<Vec<_>>();
    debug!("Loaded {} rollup rule(s), {} discarded", rules.len(), total - rules.len());
    Ok(rules)
}

fn fetch_rows(conn: &mut SqliteConnection) -> QueryResult<Vec<RuleRow>> {
    use schema::rollup_rules::dsl as R;

    R::rollup_rules
        .order(R::rank.asc())
        .select(RuleRow::as_select())
        .load(conn)
}

pub fn normalize_rule(row: RuleRow) -> Option<RollupRule> {
    if row.period <= 0 {
        debug!("Rule {} discarded: period {} is not positive", row.rank, row.period);
        return None;
    }

    let source = match Ident::new(row.src_table.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!("Rule {} discarded: source table {}", row.rank, e);
            return None;
        }
    };
    let destination = match Ident::new(row.dst_table.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!("Rule {} discarded: destination table {}", row.rank, e);
            return None;
        }
    };
    if source == destination {
        warn!("Rule {} discarded: {} is both source and destination", row.rank, source);
        return None;
    }

    let mut aggregates = [None; AGGREGATE_SLOTS];
    for (index, raw) in row.aggregate_slots().into_iter().enumerate() {
        match AggregateFn::parse(raw) {
            Ok(function) => aggregates[index] = function,
            Err(e) => warn!("Rule {} slot aggr{} left empty: {}", row.rank, index + 1, e),
        }
    }

    let retention_secs = if row.retention <= 0 {
        0
    } else {
        row.retention.max(MIN_RETENTION_SECS)
    };

    Some(RollupRule {
        rank: row.rank,
        source,
        destination,
        delete_source: row.src_delete.trim().eq_ignore_ascii_case("yes"),
        aggregates,
        period_secs: row.period.max(MIN_PERIOD_SECS),
        retention_secs,
    })
}
