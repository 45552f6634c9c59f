//! Synthetic sensors for local runs without a broker.

use chrono::{DateTime, Timelike, Utc};
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::models::datapoint::Datapoint;

const SEED: u64 = 0x5E45_0A11_0B0F_F1CEu64;
const PLACES: [&str; 4] = ["Cellar", "Kitchen", "Attic", "Garage"];

/// Emits one reading per sensor and measurement every `interval`, until the
/// receiving side is dropped.
pub fn spawn(sensors: usize, interval: Duration, sender: SyncSender<Datapoint>) -> Result<JoinHandle<()>, String> {
    info!("Fake source: {} sensor(s) every {:?}", sensors, interval);
    thread::Builder::new()
        .name("fake-source".to_string())
        .spawn(move || {
            let mut rng = SmallRng::seed_from_u64(SEED);
            loop {
                for dp in generate(&mut rng, sensors, Utc::now()) {
                    if sender.send(dp).is_err() {
                        return;
                    }
                }
                thread::sleep(interval);
            }
        })
        .map_err(|e| format!("failed to start fake source thread: {}", e))
}

pub fn generate(rng: &mut SmallRng, sensors: usize, ts: DateTime<Utc>) -> Vec<Datapoint> {
    let day_fraction = ts.num_seconds_from_midnight() as f64 / 86_400.0;
    let mut points = Vec::with_capacity(sensors * 3);

    for index in 0..sensors {
        let sensor_id = format!("fake-{}", index + 1);
        let place = PLACES[index % PLACES.len()];
        let temperature = compute_temperature(day_fraction, index as f64, rng);
        let readings = [
            ("power_watt", compute_power(day_fraction, rng)),
            ("temperature_celsius", temperature),
            ("humidity_pct", compute_humidity(temperature, rng)),
        ];
        for (measurement, value) in readings {
            points.push(Datapoint {
                measurement: measurement.to_string(),
                timestamp_millis: ts.timestamp_millis(),
                sensor_id: sensor_id.clone(),
                name: format!("{} {}", place, measurement.split('_').next().unwrap_or(measurement)),
                place: place.to_string(),
                value,
            });
        }
    }
    points
}

fn compute_power(day_fraction: f64, rng: &mut SmallRng) -> f64 {
    let morning = gaussian(day_fraction, 0.3, 0.05) * 900.0;
    let evening = gaussian(day_fraction, 0.8, 0.06) * 1400.0;
    let standby = rng.random_range(40.0..=90.0);
    let spike = if rng.random_bool(0.03) {
        rng.random_range(1500.0..=2500.0)
    } else {
        0.0
    };
    (standby + morning + evening + spike).clamp(0.0, 4000.0)
}

fn compute_temperature(day_fraction: f64, sensor_index: f64, rng: &mut SmallRng) -> f64 {
    let diurnal = ((day_fraction - 0.3) * 2.0 * PI).sin() * 2.5;
    let bias = (sensor_index + 1.0).sin() * 1.5;
    let random = rng.random_range(-0.4..=0.4);
    (19.5 + diurnal + bias + random).clamp(5.0, 35.0)
}

fn compute_humidity(temperature: f64, rng: &mut SmallRng) -> f64 {
    let temperature_component = (21.0 - temperature) * 1.8;
    let random = rng.random_range(-4.0..=4.0);
    (48.0 + temperature_component + random).clamp(20.0, 90.0)
}

fn gaussian(x: f64, center: f64, width: f64) -> f64 {
    let exponent = -((x - center) * (x - center)) / (2.0 * width * width);
    exponent.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_three_measurements_per_sensor() {
        let mut rng = SmallRng::seed_from_u64(1);
        let ts = DateTime::<Utc>::from_timestamp(1_718_000_000, 0).unwrap();
        let points = generate(&mut rng, 2, ts);

        assert_eq!(points.len(), 6);
        assert!(points.iter().all(|dp| dp.timestamp_millis == 1_718_000_000_000));
        assert_eq!(points.iter().filter(|dp| dp.sensor_id == "fake-2").count(), 3);
        for dp in &points {
            match dp.measurement.as_str() {
                "power_watt" => assert!((0.0..=4000.0).contains(&dp.value)),
                "temperature_celsius" => assert!((5.0..=35.0).contains(&dp.value)),
                "humidity_pct" => assert!((20.0..=90.0).contains(&dp.value)),
                other => panic!("unexpected measurement {other}"),
            }
        }
    }

    #[test]
    fn same_seed_same_readings() {
        let ts = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let a = generate(&mut SmallRng::seed_from_u64(7), 3, ts);
        let b = generate(&mut SmallRng::seed_from_u64(7), 3, ts);
        assert_eq!(a, b);
    }
}
