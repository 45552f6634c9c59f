use diesel::SqliteConnection;
use log::debug;

use crate::db::error::EngineError;
use crate::db::provision::{KnownSchemas, TableLayout, with_schema};
use crate::db::query::{self, Ident};
use crate::models::datapoint::Datapoint;

/// Appends `dp` to `measurements_<measurement>`, creating the table on first use.
pub fn insert_datapoint(conn: &mut SqliteConnection, schemas: &mut KnownSchemas, dp: &Datapoint) -> Result<(), EngineError> {
    let table = Ident::measurement_table(&dp.measurement)?;
    let statement = query::insert_raw(&table, dp.timestamp_secs(), &dp.sensor_id, dp.value, &dp.name, &dp.place);

    with_schema(conn, schemas, &table, TableLayout::Raw, |c| statement.execute(c))?;
    debug!(
        "Inserted {} ts={} sensor={} name={} place={} value={}",
        table,
        dp.timestamp_millis,
        dp.sensor_id,
        dp.name,
        dp.place,
        dp.value
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count_rows, datapoint, memory_connection, rolled_rows};

    #[test]
    fn creates_raw_table_on_first_insert() {
        let mut conn = memory_connection();
        let mut schemas = KnownSchemas::default();

        insert_datapoint(&mut conn, &mut schemas, &datapoint("power", 10, "s1", 1.0)).unwrap();
        insert_datapoint(&mut conn, &mut schemas, &datapoint("power", 20, "s1", 2.0)).unwrap();
        insert_datapoint(&mut conn, &mut schemas, &datapoint("humidity", 20, "h1", 55.0)).unwrap();

        assert_eq!(count_rows(&mut conn, "measurements_power"), 2);
        assert_eq!(count_rows(&mut conn, "measurements_humidity"), 1);
        assert_eq!(schemas.len(), 2);
    }

    #[test]
    fn stores_seconds_from_millis() {
        let mut conn = memory_connection();
        let mut schemas = KnownSchemas::default();
        let mut dp = datapoint("power", 0, "s1", 4.5);
        dp.timestamp_millis = 90_500;

        insert_datapoint(&mut conn, &mut schemas, &dp).unwrap();
        let rows = rolled_rows(&mut conn, "measurements_power", "value");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 90);
        assert_eq!(rows[0].value, 4.5);
    }

    #[test]
    fn drops_unsafe_measurement_names() {
        let mut conn = memory_connection();
        let mut schemas = KnownSchemas::default();
        let dp = datapoint("power; DROP TABLE rollup_rules", 10, "s1", 1.0);

        let err = insert_datapoint(&mut conn, &mut schemas, &dp).unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier(_)));
        assert_eq!(schemas.len(), 0);
    }
}
