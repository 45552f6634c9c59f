pub mod models {
    pub mod datapoint;
}

pub mod config;
pub mod db {
    pub mod error;
    pub mod models;
    pub mod provision;
    pub mod query;
}
pub mod schema;
pub mod services {
    pub mod consolidate;
    pub mod ingest;
    pub mod planner;
    pub mod rules;
    pub mod scheduler;
    pub mod watermark;
}
pub mod sources {
    pub mod fake;
    pub mod file;
    pub mod mqtt;
}
#[cfg(test)]
mod test_support;

use crate::config::{Config, IngestSource};
use crate::services::scheduler::{Engine, run_loop};
use diesel::SqliteConnection;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use std::sync::mpsc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut SqliteConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run(cfg: Config) -> Result<(), String> {
    info!(
        "Config loaded (database={}, source={:?}, interval={}s, safety_margin={}s, queue={}, busy_timeout={}ms)",
        cfg.database_url,
        cfg.ingest_source,
        cfg.consolidation_interval.as_secs(),
        cfg.safety_margin_secs,
        cfg.queue_capacity,
        cfg.busy_timeout_ms
    );

    let mut conn =
        SqliteConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    conn.batch_execute(&format!("PRAGMA busy_timeout = {};", cfg.busy_timeout_ms))
        .map_err(|e| format!("DB setup failed: {}", e))?;
    info!("Opened database {}", cfg.database_url);

    apply_database_migrations(&mut conn)?;

    // producers block while a consolidation pass holds the connection
    let (sender, receiver) = mpsc::sync_channel(cfg.queue_capacity);
    let _source = match cfg.ingest_source {
        IngestSource::Mqtt => sources::mqtt::spawn(&cfg, sender)?,
        IngestSource::File => sources::file::spawn(cfg.ingest_file.clone(), sender)?,
        IngestSource::Fake => sources::fake::spawn(cfg.fake_sensors, cfg.fake_interval, sender)?,
    };

    info!(
        "Starting control loop: consolidating every {}s",
        cfg.consolidation_interval.as_secs()
    );
    let mut engine = Engine::new(conn, cfg.safety_margin_secs);
    run_loop(&mut engine, receiver, cfg.consolidation_interval);
    info!("Control loop finished");
    Ok(())
}

fn main() {
    let loaded_env = match config::configure_env_from_cli(std::env::args().skip(1)) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let cfg = Config::from_env();

    // Init logging after environment so RUST_LOG from .env is respected.
    let debug = cfg.as_ref().is_ok_and(|c| c.debug);
    let default_filter = env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" });
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "sensor-rollup {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = cfg.and_then(run) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
