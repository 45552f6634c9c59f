//! Broker subscription. Each publish carries one datapoint or an array of them.

use log::{debug, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::models::datapoint::{Datapoint, decode_payload};

const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;

/// Connects to the configured broker and forwards decoded datapoints to `sender`
/// from a background thread. The thread ends once the receiving side is gone.
pub fn spawn(cfg: &Config, sender: SyncSender<Datapoint>) -> Result<JoinHandle<()>, String> {
    let topic = cfg.mqtt_topic.clone().ok_or("MQTT_TOPIC is required for the mqtt source")?;
    let client_id = format!("sensor-rollup-{:08x}", rand::random::<u32>());

    let mut options = MqttOptions::new(client_id.clone(), cfg.mqtt_host.clone(), cfg.mqtt_port);
    options.set_keep_alive(cfg.mqtt_keep_alive);
    let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

    info!(
        "Subscribing to {} on {}:{} as {}",
        topic, cfg.mqtt_host, cfg.mqtt_port, client_id
    );

    thread::Builder::new()
        .name("mqtt-source".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // subscriptions do not survive a reconnect with a clean session
                        if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            warn!("Subscribe to {} failed: {}", topic, e);
                        } else {
                            info!("Connected to broker; subscribed to {}", topic);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if !forward(&publish.topic, &publish.payload, &sender) {
                            info!("Consumer gone; disconnecting from broker");
                            let _ = client.try_disconnect();
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Broker connection error: {}; retrying in {:?}", e, RECONNECT_PAUSE);
                        thread::sleep(RECONNECT_PAUSE);
                    }
                }
            }
        })
        .map_err(|e| format!("failed to start mqtt thread: {}", e))
}

/// Decodes one publish and queues its datapoints. Returns false once the receiver is dropped.
fn forward(topic: &str, payload: &[u8], sender: &SyncSender<Datapoint>) -> bool {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!("Ignoring non-UTF-8 message on {}: {}", topic, e);
            return true;
        }
    };
    match decode_payload(text) {
        Ok(points) => {
            debug!("Received {} datapoint(s) on {}", points.len(), topic);
            points.into_iter().all(|dp| sender.send(dp).is_ok())
        }
        Err(e) => {
            warn!("Ignoring malformed message on {}: {}", topic, e);
            true
        }
    }
}
