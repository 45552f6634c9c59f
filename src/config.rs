//! Runtime configuration from the environment, optionally seeded from a `.env` file.
//! Defaults match a docker-compose setup with a broker reachable as `mqtt`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::planner::DEFAULT_SAFETY_MARGIN_SECS;

pub const DEFAULT_DATABASE_URL: &str = "measurements.db";
pub const DEFAULT_BROKER_URL: &str = "tcp://mqtt:1883";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_CONSOLIDATION_SECS: u64 = 180;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSource {
    /// Subscribe to a broker topic.
    Mqtt,
    /// Read one payload per line from a file, or stdin for `-`.
    File,
    /// Generate synthetic readings.
    Fake,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (or `:memory:`).
    pub database_url: String,
    pub ingest_source: IngestSource,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: Option<String>,
    pub mqtt_keep_alive: Duration,
    pub ingest_file: PathBuf,
    /// Time between consolidation passes.
    pub consolidation_interval: Duration,
    /// How long after a bucket ends before it may be closed.
    pub safety_margin_secs: i64,
    /// Datapoints buffered between the ingestion source and the control loop.
    pub queue_capacity: usize,
    /// Upper bound on waiting for a locked database, per statement.
    pub busy_timeout_ms: u64,
    pub fake_sensors: usize,
    pub fake_interval: Duration,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ingest_source = match var("INGEST_SOURCE").as_deref().unwrap_or("mqtt") {
            "mqtt" => IngestSource::Mqtt,
            "file" => IngestSource::File,
            "fake" => IngestSource::Fake,
            other => return Err(format!("INGEST_SOURCE must be mqtt, file or fake (got {other})")),
        };

        let broker_url = var("MQTT_BROKER_URL").unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        let (mqtt_host, mqtt_port) = parse_broker_url(&broker_url)?;
        let mqtt_topic = var("MQTT_TOPIC");
        if ingest_source == IngestSource::Mqtt && mqtt_topic.is_none() {
            return Err("Topic not specified: set MQTT_TOPIC".to_string());
        }

        let number = |key: &str, default: u64| -> Result<u64, String> {
            match var(key) {
                Some(s) => s
                    .parse::<u64>()
                    .map_err(|_| format!("{key} must be a non-negative integer (got {s})")),
                None => Ok(default),
            }
        };

        let consolidation_secs = number("CONSOLIDATION_INTERVAL_SECS", DEFAULT_CONSOLIDATION_SECS)?;
        if consolidation_secs == 0 {
            return Err("CONSOLIDATION_INTERVAL_SECS must be positive".to_string());
        }
        let queue_capacity = number("INGEST_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY as u64)?;
        if queue_capacity == 0 {
            return Err("INGEST_QUEUE_CAPACITY must be positive".to_string());
        }

        Ok(Config {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            ingest_source,
            mqtt_host,
            mqtt_port,
            mqtt_topic,
            mqtt_keep_alive: Duration::from_secs(number("MQTT_KEEPALIVE_SECS", 25)?),
            ingest_file: PathBuf::from(var("INGEST_FILE").unwrap_or_else(|| "-".to_string())),
            consolidation_interval: Duration::from_secs(consolidation_secs),
            safety_margin_secs: i64::try_from(number("SAFETY_MARGIN_SECS", DEFAULT_SAFETY_MARGIN_SECS as u64)?)
                .map_err(|_| "SAFETY_MARGIN_SECS is out of range".to_string())?,
            queue_capacity: queue_capacity as usize,
            busy_timeout_ms: number("STORE_BUSY_TIMEOUT_MS", 5000)?,
            fake_sensors: number("FAKE_SENSORS", 3)?.max(1) as usize,
            fake_interval: Duration::from_millis(number("FAKE_INTERVAL_MS", 1000)?),
            debug: var("DEBUG").is_some_and(|v| matches!(v.as_str(), "1" | "true" | "TRUE")),
        })
    }
}

/// Splits `tcp://host:port` (scheme and port optional) into host and port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), String> {
    let rest = match url.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => return Err(format!("unsupported broker scheme {scheme:?} (use tcp://)")),
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| format!("invalid broker port in {url:?}"))?,
        ),
        None => (rest, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(format!("missing broker host in {url:?}"));
    }
    Ok((host.to_string(), port))
}

/// Where the environment file came from, for the startup log.
#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Handles `--env-file <path>` / `--env-file=<path>`; otherwise loads `./.env` if present.
pub fn configure_env_from_cli(args: impl IntoIterator<Item = String>) -> Result<Option<LoadedEnvFile>, String> {
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let value = if arg == "--env-file" {
            Some(args.next().ok_or("`--env-file` requires a path argument")?)
        } else if let Some(v) = arg.strip_prefix("--env-file=") {
            Some(v.to_string())
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {arg}"));
        };
        if env_file.is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
        match value {
            Some(v) if !v.is_empty() => env_file = Some(PathBuf::from(v)),
            _ => return Err("`--env-file` requires a path argument".to_string()),
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if path.is_file() => (path, true),
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let path = PathBuf::from(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        if let Some((key, value)) = parsed
            && std::env::var_os(&key).is_none()
        {
            // Process environment wins over the file. Mutating it is unsafe once
            // other threads exist; this runs before any are spawned.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parses `KEY=value`, `export KEY=value`, quoted values and trailing comments.
fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment.split_once('=').ok_or("missing '=' in assignment")?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {key:?}"));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let body = &raw[1..];
            let end = body.find(quote).ok_or("unterminated quoted value")?;
            let trailing = body[end + 1..].trim();
            if !(trailing.is_empty() || trailing.starts_with('#')) {
                return Err("unexpected characters after closing quote".to_string());
            }
            body[..end].to_string()
        }
        _ => raw.split(" #").next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}
