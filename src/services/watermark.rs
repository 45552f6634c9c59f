//! Watermark tracking: how far a rollup table has been consolidated.
//!
//! The watermark is never stored. It is derived every pass from the newest bucket
//! in the rollup table, so restarts and manual edits of rollup data correct
//! themselves on the next pass.

use diesel::SqliteConnection;

use crate::db::error::EngineError;
use crate::db::provision::table_exists;
use crate::db::query::{self, Ident, MaxTimestamp};

/// Returns the exclusive end of the newest bucket in `destination`
/// (`max(ts) + period`), or 0 when the table is missing or empty.
pub fn refresh_watermark(conn: &mut SqliteConnection, destination: &Ident, period_secs: i64) -> Result<i64, EngineError> {
    if !table_exists(conn, destination)? {
        return Ok(0);
    }

    let newest = query::max_timestamp(destination)
        .load::<MaxTimestamp>(conn)
        .map_err(|e| EngineError::store(format!("reading watermark of {} failed", destination), e))?
        .into_iter()
        .next()
        .and_then(|row| row.ts);

    Ok(newest.map(|ts| ts + period_secs).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::provision::{TableLayout, ensure_table};
    use crate::test_support::memory_connection;
    use diesel::connection::SimpleConnection;

    #[test]
    fn missing_or_empty_table_yields_zero() {
        let mut conn = memory_connection();
        let table = Ident::new("power_1m").unwrap();
        assert_eq!(refresh_watermark(&mut conn, &table, 60).unwrap(), 0);

        let columns = [Ident::new("vavg").unwrap()];
        ensure_table(&mut conn, &table, TableLayout::Rollup { value_columns: &columns }).unwrap();
        assert_eq!(refresh_watermark(&mut conn, &table, 60).unwrap(), 0);
    }

    #[test]
    fn seals_through_end_of_newest_bucket() {
        let mut conn = memory_connection();
        let table = Ident::new("power_1m").unwrap();
        let columns = [Ident::new("vavg").unwrap()];
        ensure_table(&mut conn, &table, TableLayout::Rollup { value_columns: &columns }).unwrap();
        conn.batch_execute(
            "INSERT INTO power_1m (ts, sensorid, vavg, name, place) VALUES \
             (0, 's1', 1.0, '', ''), (120, 's1', 2.0, '', ''), (60, 's2', 3.0, '', '')",
        )
        .unwrap();

        assert_eq!(refresh_watermark(&mut conn, &table, 60).unwrap(), 180);
    }

    #[test]
    fn follows_manual_edits() {
        let mut conn = memory_connection();
        let table = Ident::new("power_1m").unwrap();
        let columns = [Ident::new("vavg").unwrap()];
        ensure_table(&mut conn, &table, TableLayout::Rollup { value_columns: &columns }).unwrap();
        conn.batch_execute("INSERT INTO power_1m (ts, sensorid, vavg, name, place) VALUES (600, 's1', 1.0, '', '')")
            .unwrap();
        assert_eq!(refresh_watermark(&mut conn, &table, 60).unwrap(), 660);

        conn.batch_execute("DELETE FROM power_1m").unwrap();
        assert_eq!(refresh_watermark(&mut conn, &table, 60).unwrap(), 0);
    }
}
