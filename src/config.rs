use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Load environment variables from a `.env` file in the working directory.
/// Values may contain spaces without quotes; existing variables win.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }

        if std::env::var(key).is_err() {
            // SAFETY: only called at the top of a synchronous main, before the runtime exists
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Default location of the optional JSON config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("zwave-mqtt-bridge").join("config.json"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub zwave: ZWaveConfig,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZWaveConfig {
    /// Serial device of the Z-Wave controller.
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub topic_prefix: String,
    /// Reissues allowed after the first attempt of a command.
    pub retry_limit: u32,
    pub ack_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    /// In-flight commands older than this fail when the mesh network returns.
    pub reconnect_grace_secs: u64,
    /// Publish command outcomes on `.../result` topics (otherwise only logged).
    pub publish_command_results: bool,
    pub event_queue_capacity: usize,
    pub publish_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Extra random delay, as a fraction of the base delay.
    pub jitter: f64,
    /// Consecutive failed attempts before giving up; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "zwave-mqtt-bridge".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

impl Default for ZWaveConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_string(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "zwave".to_string(),
            retry_limit: 3,
            ack_timeout_ms: 5_000,
            confirm_timeout_ms: 10_000,
            reconnect_grace_secs: 30,
            publish_command_results: true,
            event_queue_capacity: 256,
            publish_queue_capacity: 1024,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 60_000,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Config {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables on top of the current values.
    pub fn apply_env(&mut self) {
        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = env_parse("MQTT_BROKER_PORT") {
            self.mqtt.broker_port = port;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(keep_alive) = env_parse("MQTT_KEEP_ALIVE") {
            self.mqtt.keep_alive_secs = keep_alive;
        }

        if let Ok(device) = std::env::var("ZWAVE_DEVICE") {
            self.zwave.device = device;
        }

        if let Ok(prefix) = std::env::var("ZWAVE_TOPIC_PREFIX") {
            self.bridge.topic_prefix = prefix;
        }
        if let Some(limit) = env_parse("COMMAND_RETRY_LIMIT") {
            self.bridge.retry_limit = limit;
        }
        if let Some(ms) = env_parse("COMMAND_ACK_TIMEOUT_MS") {
            self.bridge.ack_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("COMMAND_CONFIRM_TIMEOUT_MS") {
            self.bridge.confirm_timeout_ms = ms;
        }
        if let Some(secs) = env_parse("COMMAND_GRACE_SECS") {
            self.bridge.reconnect_grace_secs = secs;
        }
        if let Some(publish) = env_flag("PUBLISH_COMMAND_RESULTS") {
            self.bridge.publish_command_results = publish;
        }
        if let Some(capacity) = env_parse("EVENT_QUEUE_CAPACITY") {
            self.bridge.event_queue_capacity = capacity;
        }
        if let Some(capacity) = env_parse("PUBLISH_QUEUE_CAPACITY") {
            self.bridge.publish_queue_capacity = capacity;
        }

        if let Some(ms) = env_parse("RECONNECT_INITIAL_MS") {
            self.reconnect.initial_ms = ms;
        }
        if let Some(ms) = env_parse("RECONNECT_MAX_MS") {
            self.reconnect.max_ms = ms;
        }
        if let Some(jitter) = env_parse("RECONNECT_JITTER") {
            self.reconnect.jitter = jitter;
        }
        if let Some(attempts) = env_parse("RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = attempts;
        }
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        let prefix = self.bridge.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(BridgeError::Config(format!(
                "topic prefix '{}' must be non-empty and free of wildcards",
                self.bridge.topic_prefix
            )));
        }
        if self.bridge.ack_timeout_ms == 0 || self.bridge.confirm_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "command timeouts must be greater than zero".to_string(),
            ));
        }
        if self.bridge.event_queue_capacity == 0 || self.bridge.publish_queue_capacity == 0 {
            return Err(BridgeError::Config(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.initial_ms == 0 || self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(BridgeError::Config(
                "reconnect delays must satisfy 0 < initial_ms <= max_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(BridgeError::Config(
                "reconnect jitter must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}
