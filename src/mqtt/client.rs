//! MQTT client wrapper for the bridge's broker connection.

use crate::config::MqttConfig;
use crate::topic::PAYLOAD_OFFLINE;
use log::info;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use std::time::Duration;

/// Message received from the MQTT broker.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT client holding both the request handle and the event loop.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    ///
    /// `status_topic` receives a retained `offline` last will, so subscribers
    /// learn when the bridge disappears without a clean shutdown.
    pub fn new(config: &MqttConfig, status_topic: &str) -> Self {
        let mut options = Self::options(config, &config.client_id);
        options.set_last_will(LastWill::new(
            status_topic,
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    /// Client for tools talking to a running bridge. No last will; a random
    /// client id suffix keeps it from kicking the bridge off the broker.
    pub fn tool(config: &MqttConfig) -> Self {
        let client_id = format!("{}-tool-{}", config.client_id, uuid::Uuid::new_v4().simple());
        let options = Self::options(config, &client_id);
        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    fn options(config: &MqttConfig, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        options
    }

    /// Subscribe to a topic filter.
    pub async fn subscribe(&self, topic: &str) -> Result<(), rumqttc::ClientError> {
        info!("[MQTT] Subscribing to {}", topic);
        self.client.subscribe(topic, QoS::AtLeastOnce).await
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Split into the request handle and the event loop that must be polled.
    pub fn into_parts(self) -> (AsyncClient, EventLoop) {
        (self.client, self.event_loop)
    }
}
