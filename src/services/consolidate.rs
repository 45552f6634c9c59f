//! Aggregation executor: rolls one rule's window from source into destination.
//!
//! The upsert, the optional source deletion and the retention eviction run in a
//! single transaction, so a rule either fully applies for a window or leaves no
//! trace. Re-applying a window replaces rows on the destination's unique
//! `(ts, sensorid, name, place)` key.

use diesel::prelude::*;
use log::{debug, warn};

use crate::db::error::EngineError;
use crate::db::models::RollupRule;
use crate::db::provision::{KnownSchemas, TableLayout, with_schema};
use crate::db::query::{self, Ident, Projection, RollupQuery};
use crate::services::planner::Window;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ConsolidationOutcome {
    pub upserted: usize,
    pub source_deleted: usize,
    pub evicted: usize,
}

/// The rule whose destination feeds `rule`, if `rule` is chained.
pub fn find_upstream<'a>(rule: &RollupRule, rules: &'a [RollupRule]) -> Option<&'a RollupRule> {
    rules.iter().find(|u| u.destination == rule.source)
}

/// Maps each non-empty slot of `rule` to an output column.
///
/// Unchained rules aggregate the raw `value` column. A chained rule applies its
/// slot-`i` function to the upstream rule's slot-`i` column (`avg` over an
/// upstream `avg` slot reads `vavg`). Slots without an upstream counterpart and
/// repeated output columns are dropped.
pub fn resolve_projections(rule: &RollupRule, upstream: Option<&RollupRule>) -> Vec<Projection> {
    let mut projections: Vec<Projection> = Vec::new();

    for (index, slot) in rule.aggregates.iter().enumerate() {
        let Some(function) = *slot else { continue };

        let input = match upstream {
            None => Ident::raw_value_column(),
            Some(up) => match up.aggregates[index] {
                Some(upstream_fn) => Ident::from(upstream_fn),
                None => {
                    warn!(
                        "Rule {} slot aggr{} ignored: upstream rule {} has no aggregate in that slot",
                        rule.rank,
                        index + 1,
                        up.rank
                    );
                    continue;
                }
            },
        };

        let output = Ident::from(function);
        if projections.iter().any(|p| p.output == output) {
            warn!("Rule {} slot aggr{} ignored: {} is already produced", rule.rank, index + 1, output);
            continue;
        }
        projections.push(Projection { function, input, output });
    }

    projections
}

/// Applies `window` of `rule` in one transaction.
pub fn consolidate(
    conn: &mut SqliteConnection,
    schemas: &mut KnownSchemas,
    rule: &RollupRule,
    projections: &[Projection],
    window: Window,
) -> Result<ConsolidationOutcome, EngineError> {
    let value_columns = projections.iter().map(|p| p.output.clone()).collect::<Vec<_>>();
    let layout = TableLayout::Rollup {
        value_columns: &value_columns,
    };
    let rollup = RollupQuery {
        source: &rule.source,
        destination: &rule.destination,
        projections,
        period: rule.period_secs,
        start: window.start,
        end: window.end,
    }
    .to_statement();
    debug!("Rollup {} -> {}: {}", rule.source, rule.destination, rollup.sql);

    let result = conn.transaction::<_, EngineError, _>(|conn| {
        let upserted = with_schema(conn, schemas, &rule.destination, layout, |c| rollup.execute(c))?;

        let source_deleted = if rule.delete_source {
            query::delete_range(&rule.source, window.start, window.end)
                .execute(conn)
                .map_err(|e| EngineError::store(format!("deleting consolidated rows from {} failed", rule.source), e))?
        } else {
            0
        };

        // measured from the new high bucket, independent of the window start
        let evicted = if rule.retention_secs > 0 && window.end > rule.retention_secs {
            let cutoff = window.end - rule.retention_secs;
            query::delete_before(&rule.destination, cutoff)
                .execute(conn)
                .map_err(|e| EngineError::store(format!("evicting rows of {} before {} failed", rule.destination, cutoff), e))?
        } else {
            0
        };

        Ok(ConsolidationOutcome {
            upserted,
            source_deleted,
            evicted,
        })
    });

    if result.is_err() {
        // a rolled back CREATE TABLE must be provisioned again next time
        schemas.forget(&rule.destination);
    }
    result
}
