//! Send one command through a running bridge and wait for its outcome.
//!
//! Usage:
//!   zwave-command <node> <class> <value> [--instance <n>] [--timeout <secs>]
//!
//! Example:
//!   zwave-command 12 switch true
//!   zwave-command 3 dimmer 40 --timeout 20

use clap::Parser;
use log::{error, info, warn};
use rumqttc::{Event, Packet, QoS};
use std::process::ExitCode;
use std::time::Duration;
use zwave_mqtt_bridge::config::Config;
use zwave_mqtt_bridge::model::{NodeId, ValueClass, ValueId};
use zwave_mqtt_bridge::mqtt::MqttClient;
use zwave_mqtt_bridge::topic::{Direction, TopicMapper};

#[derive(Parser)]
#[command(name = "zwave-command")]
#[command(about = "Set a Z-Wave value through the MQTT bridge")]
struct Cli {
    /// Node id of the target device
    node: u8,

    /// Value class, e.g. switch, dimmer, thermostat_mode
    class: String,

    /// Desired value (true, 40, Heat, ...)
    value: String,

    /// Instance of the value on the node
    #[arg(long, default_value_t = 0)]
    instance: u8,

    /// Topic prefix the bridge uses
    #[arg(long, env = "ZWAVE_TOPIC_PREFIX", default_value = "zwave")]
    prefix: String,

    /// Seconds to wait for the outcome
    #[arg(long, default_value_t = 15)]
    timeout: u64,
}

fn main() -> ExitCode {
    zwave_mqtt_bridge::config::load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(run(cli)),
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ExitCode {
    let Some(class) = ValueClass::new(cli.class.as_str()) else {
        error!("Invalid value class '{}'", cli.class);
        return ExitCode::from(2);
    };
    let id = ValueId::new(NodeId(cli.node), class, cli.instance);
    let mapper = TopicMapper::new(cli.prefix.as_str());
    let set_topic = mapper.topic_for(&id, Direction::Command);
    let state_topic = mapper.topic_for(&id, Direction::State);
    let result_topic = mapper.result_topic(&id);

    let config = Config::from_env();
    info!(
        "Connecting to MQTT broker at {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    let mqtt = MqttClient::tool(&config.mqtt);
    for topic in [&result_topic, &state_topic] {
        if let Err(e) = mqtt.subscribe(topic).await {
            error!("Failed to subscribe to {}: {}", topic, e);
            return ExitCode::FAILURE;
        }
    }
    let (client, mut event_loop) = mqtt.into_parts();
    if let Err(e) = client
        .publish(set_topic.as_str(), QoS::AtLeastOnce, false, cli.value.clone())
        .await
    {
        error!("Failed to publish to {}: {}", set_topic, e);
        return ExitCode::FAILURE;
    }
    info!("Sent {} -> {}", cli.value, set_topic);

    let wait = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    if publish.topic == state_topic {
                        info!("State: {}", payload);
                        continue;
                    }
                    if publish.topic != result_topic {
                        continue;
                    }
                    let status = serde_json::from_str::<serde_json::Value>(&payload)
                        .ok()
                        .and_then(|json| json["status"].as_str().map(str::to_string));
                    info!("Result: {}", payload);
                    return status.as_deref() == Some("confirmed");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    };

    let outcome = tokio::time::timeout(Duration::from_secs(cli.timeout), wait).await;
    let _ = client.try_disconnect();
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(_) => {
            error!("No outcome within {}s", cli.timeout);
            ExitCode::FAILURE
        }
    }
}
