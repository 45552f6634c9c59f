//! The control loop: the only owner of the store connection.
//!
//! Datapoints and consolidation ticks are handled one at a time on this thread,
//! so ingestion and consolidation never touch the store concurrently. Producers
//! feed a bounded channel and block while a pass is running.

use chrono::Utc;
use diesel::SqliteConnection;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::db::models::RollupRule;
use crate::db::provision::{KnownSchemas, table_exists};
use crate::db::query::Ident;
use crate::models::datapoint::Datapoint;
use crate::services::consolidate::{consolidate, find_upstream, resolve_projections};
use crate::services::ingest::insert_datapoint;
use crate::services::planner::plan_window;
use crate::services::rules::load_rules;
use crate::services::watermark::refresh_watermark;

/// State of a single pass, rebuilt from the store on every tick.
#[derive(Debug)]
pub struct PassContext {
    pub now: i64,
    pub rules: Vec<RollupRule>,
    pub watermarks: BTreeMap<Ident, i64>,
}

impl PassContext {
    pub fn new(now: i64, rules: Vec<RollupRule>) -> Self {
        PassContext {
            now,
            rules,
            watermarks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub consolidated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Engine {
    conn: SqliteConnection,
    schemas: KnownSchemas,
    safety_margin_secs: i64,
}

impl Engine {
    pub fn new(conn: SqliteConnection, safety_margin_secs: i64) -> Self {
        Engine {
            conn,
            schemas: KnownSchemas::default(),
            safety_margin_secs,
        }
    }

    /// Stores one datapoint. Failures are logged and the datapoint dropped.
    pub fn ingest(&mut self, dp: &Datapoint) {
        if let Err(e) = insert_datapoint(&mut self.conn, &mut self.schemas, dp) {
            error!(
                "Dropping datapoint {} ts={} sensor={}: {}",
                dp.measurement, dp.timestamp_millis, dp.sensor_id, e
            );
        }
    }

    /// Runs every eligible rule once, in rank order, as of `now` (unix seconds).
    pub fn run_pass(&mut self, now: i64) -> PassSummary {
        let mut summary = PassSummary::default();
        let rules = match load_rules(&mut self.conn) {
            Ok(rules) => rules,
            Err(e) => {
                error!("Consolidation skipped: {}", e);
                return summary;
            }
        };
        let mut ctx = PassContext::new(now, rules);

        for rule in &ctx.rules {
            let upstream = find_upstream(rule, &ctx.rules);
            if let Some(up) = upstream
                && up.rank > rule.rank
            {
                warn!(
                    "Rule {} reads {} which rule {} fills later in the pass; it will lag one pass",
                    rule.rank, rule.source, up.rank
                );
            }

            let projections = resolve_projections(rule, upstream);
            if projections.is_empty() {
                debug!("Rule {} ({}) has no aggregates; skipped", rule.rank, rule.destination);
                summary.skipped += 1;
                continue;
            }

            match table_exists(&mut self.conn, &rule.source) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Rule {} skipped: source {} does not exist yet", rule.rank, rule.source);
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!("Rule {} skipped: {}", rule.rank, e);
                    summary.failed += 1;
                    continue;
                }
            }

            let watermark = match refresh_watermark(&mut self.conn, &rule.destination, rule.period_secs) {
                Ok(v) => v,
                Err(e) => {
                    error!("Rule {} skipped: {}", rule.rank, e);
                    summary.failed += 1;
                    continue;
                }
            };
            ctx.watermarks.insert(rule.destination.clone(), watermark);

            let Some(window) = plan_window(rule, watermark, ctx.now, self.safety_margin_secs) else {
                debug!("Rule {} ({}) is up to date at {}", rule.rank, rule.destination, watermark);
                summary.skipped += 1;
                continue;
            };

            info!(
                "Consolidating {} -> {} [{}, {}) period={}s aggr={} delete_source={} retention={}s",
                rule.source,
                rule.destination,
                window.start,
                window.end,
                rule.period_secs,
                rule.describe_aggregates(),
                rule.delete_source,
                rule.retention_secs
            );
            match consolidate(&mut self.conn, &mut self.schemas, rule, &projections, window) {
                Ok(outcome) => {
                    debug!(
                        "Rule {}: {} row(s) upserted, {} source row(s) deleted, {} row(s) evicted",
                        rule.rank, outcome.upserted, outcome.source_deleted, outcome.evicted
                    );
                    summary.consolidated += 1;
                }
                Err(e) => {
                    error!("Rule {} rolled back: {}", rule.rank, e);
                    summary.failed += 1;
                }
            }
        }

        debug!("Watermarks: {:?} ({} table(s) provisioned)", ctx.watermarks, self.schemas.len());
        info!(
            "Consolidated at {} ({} rule(s) applied, {} skipped, {} failed)",
            now, summary.consolidated, summary.skipped, summary.failed
        );
        summary
    }

    #[cfg(test)]
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

/// Serves `receiver` and runs a pass every `interval` until the sender side
/// disconnects, then runs one last pass.
pub fn run_loop(engine: &mut Engine, receiver: Receiver<Datapoint>, interval: Duration) {
    let mut next_tick = Instant::now() + interval;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(timeout) {
            Ok(dp) => engine.ingest(&dp),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("Ingestion source closed; running final consolidation");
                engine.run_pass(Utc::now().timestamp());
                return;
            }
        }

        let now = Instant::now();
        if now >= next_tick {
            debug!("Tick");
            engine.run_pass(Utc::now().timestamp());
            // missed ticks are dropped rather than replayed back to back
            next_tick += interval;
            if next_tick <= Instant::now() {
                next_tick = Instant::now() + interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NewRule, count_rows, datapoint, insert_rule, memory_connection, rolled_rows};
    use diesel::RunQueryDsl;
    use std::sync::mpsc;

    fn engine() -> Engine {
        Engine::new(memory_connection(), 40)
    }

    #[test]
    fn end_to_end_minute_average() {
        let mut engine = engine();
        let mut rule = NewRule::avg(1, "measurements_power", "power_1m", 60);
        rule.retention = 3600;
        insert_rule(engine.connection(), rule);
        for (ts, value) in [(10, 1.0), (20, 2.0), (30, 3.0), (70, 4.0), (80, 5.0)] {
            engine.ingest(&datapoint("power", ts, "s1", value));
        }

        let summary = engine.run_pass(100);
        assert_eq!(summary.consolidated, 1);

        let rows = rolled_rows(engine.connection(), "power_1m", "vavg");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].ts, rows[0].sensorid.as_str(), rows[0].value), (0, "s1", 2.0));
        assert_eq!(count_rows(engine.connection(), "measurements_power"), 5);
    }

    #[test]
    fn second_pass_in_same_bucket_does_nothing() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_power", "power_1m", 60));
        engine.ingest(&datapoint("power", 10, "s1", 1.0));

        assert_eq!(engine.run_pass(100).consolidated, 1);
        let again = engine.run_pass(130);
        assert_eq!(again.consolidated, 0);
        assert_eq!(again.skipped, 1);
    }

    #[test]
    fn watermark_never_decreases() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_power", "power_1m", 60));
        let destination = Ident::new("power_1m").unwrap();

        let mut last = 0;
        for step in 0..6_i64 {
            let ts = step * 45;
            engine.ingest(&datapoint("power", ts, "s1", step as f64));
            engine.run_pass(ts + 100);
            let watermark = refresh_watermark(engine.connection(), &destination, 60).unwrap();
            assert!(watermark >= last, "watermark went from {last} to {watermark}");
            last = watermark;
        }
        assert!(last > 0);
    }

    #[test]
    fn chained_rules_run_in_rank_order() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(2, "rollup1", "rollup2", 3600));
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_power", "rollup1", 60));
        engine.ingest(&datapoint("power", 10, "s1", 1.0));
        engine.ingest(&datapoint("power", 70, "s1", 3.0));
        engine.ingest(&datapoint("power", 80, "s1", 5.0));

        let summary = engine.run_pass(3640);
        assert_eq!(summary.consolidated, 2);

        let minutes = rolled_rows(engine.connection(), "rollup1", "vavg");
        assert_eq!(minutes.iter().map(|r| r.value).collect::<Vec<_>>(), vec![1.0, 4.0]);
        let hours = rolled_rows(engine.connection(), "rollup2", "vavg");
        assert_eq!(hours.len(), 1);
        assert_eq!((hours[0].ts, hours[0].value), (0, 2.5));
    }

    #[test]
    fn failing_rule_does_not_stop_later_rules() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_power", "power_bad", 60));
        insert_rule(engine.connection(), NewRule::avg(2, "measurements_power", "power_1m", 60));
        engine.ingest(&datapoint("power", 10, "s1", 1.0));

        // a view cannot be written to, so every statement against power_bad fails
        diesel::sql_query("CREATE VIEW power_bad AS SELECT 1 AS ts")
            .execute(engine.connection())
            .unwrap();

        let summary = engine.run_pass(7300);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.consolidated, 1);
        assert_eq!(count_rows(engine.connection(), "power_1m"), 1);
    }

    #[test]
    fn rule_for_missing_source_is_skipped() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_nothing", "nothing_1m", 60));
        let summary = engine.run_pass(1_000);
        assert_eq!(summary, PassSummary { consolidated: 0, skipped: 1, failed: 0 });
    }

    #[test]
    fn loop_drains_queue_and_consolidates_on_close() {
        let mut engine = engine();
        insert_rule(engine.connection(), NewRule::avg(1, "measurements_power", "power_1m", 60));
        let (tx, rx) = mpsc::sync_channel(10);
        tx.send(datapoint("power", 10, "s1", 1.0)).unwrap();
        tx.send(datapoint("power", 20, "s1", 3.0)).unwrap();
        drop(tx);

        run_loop(&mut engine, rx, Duration::from_secs(3600));
        assert_eq!(count_rows(engine.connection(), "measurements_power"), 2);
        // the final pass runs at wall-clock time, long after these buckets closed
        assert_eq!(rolled_rows(engine.connection(), "power_1m", "vavg")[0].value, 2.0);
    }
}
