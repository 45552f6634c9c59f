//! Measurement records and their JSON wire format.
//!
//! A payload is a JSON array of measurement objects:
//!
//! ```json
//! [{"measurement": "power_watt", "timestamp": 1718000000000,
//!   "tags": {"id": "s1", "name": "boiler", "place": "cellar"},
//!   "fields": {"value": 812.5}}]
//! ```
//!
//! A single bare object is accepted as well. `timestamp` is in milliseconds.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// One decoded measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub measurement: String,
    pub timestamp_millis: i64,
    pub sensor_id: String,
    pub name: String,
    pub place: String,
    pub value: f64,
}

impl Datapoint {
    /// Timestamp as stored in raw tables (fractional seconds).
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_millis as f64 / 1000.0
    }
}

#[derive(Debug, Deserialize)]
struct WirePoint {
    measurement: String,
    timestamp: i64,
    #[serde(default)]
    tags: WireTags,
    fields: WireFields,
}

#[derive(Debug, Default, Deserialize)]
struct WireTags {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    place: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFields {
    value: f64,
}

impl From<WirePoint> for Datapoint {
    fn from(w: WirePoint) -> Self {
        Datapoint {
            measurement: w.measurement,
            timestamp_millis: w.timestamp,
            sensor_id: w.tags.id,
            name: w.tags.name.unwrap_or_default(),
            place: w.tags.place.unwrap_or_default(),
            value: w.fields.value,
        }
    }
}

/// A payload that could not be decoded, with the JSON path where decoding stopped.
#[derive(Debug)]
pub struct PayloadError {
    pub path: String,
    pub message: String,
}

impl Display for PayloadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: {}", self.path, self.message)
    }
}

impl Error for PayloadError {}

impl<E: Display> From<serde_path_to_error::Error<E>> for PayloadError {
    fn from(value: serde_path_to_error::Error<E>) -> Self {
        PayloadError {
            path: value.path().to_string(),
            message: value.inner().to_string(),
        }
    }
}

pub fn decode_payload(payload: &str) -> Result<Vec<Datapoint>, PayloadError> {
    let trimmed = payload.trim_start();
    let de = &mut serde_json::Deserializer::from_str(trimmed);
    if trimmed.starts_with('{') {
        let point: WirePoint = serde_path_to_error::deserialize(de)?;
        Ok(vec![point.into()])
    } else {
        let points: Vec<WirePoint> = serde_path_to_error::deserialize(de)?;
        Ok(points.into_iter().map(Datapoint::from).collect())
    }
}
