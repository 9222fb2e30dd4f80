//! MQTT side of the bridge.

mod client;
mod publisher;

pub use client::{MqttClient, MqttMessage};
pub use publisher::{Publication, Publisher, run_publish_worker};
