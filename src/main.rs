//! Z-Wave to MQTT bridge daemon.
//!
//! Usage:
//!   zwave-mqtt-bridge [--config <path>] [--topic-prefix <topic>] [--broker <host>] [--simulate-interval <secs>]
//!
//! Settings come from the JSON config file (if present), then environment
//! variables and `.env`, then command-line flags.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use zwave_mqtt_bridge::bridge::BridgeCore;
use zwave_mqtt_bridge::config::{self, Config};
use zwave_mqtt_bridge::error::Result;
use zwave_mqtt_bridge::zwave::SimulatedDriver;
use zwave_mqtt_bridge::zwave::simulated::run_simulation;

#[derive(Parser)]
#[command(name = "zwave-mqtt-bridge")]
#[command(about = "Bridge a Z-Wave mesh network to an MQTT broker")]
struct Cli {
    /// JSON config file (defaults to the user config directory)
    #[arg(long, env = "ZWAVE_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the MQTT topic prefix
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Override the MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// Seconds between simulated sensor drifts (0 disables)
    #[arg(long, env = "SIMULATE_INTERVAL", default_value_t = 30)]
    simulate_interval: u64,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().or_else(config::default_config_path);
    let mut config = match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            Config::from_file(&path)?
        }
        _ => Config::default(),
    };
    config.apply_env();

    if let Some(prefix) = &cli.topic_prefix {
        config.bridge.topic_prefix = prefix.clone();
    }
    if let Some(broker) = &cli.broker {
        config.mqtt.broker_host = broker.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    // Environment setup has to happen while the process is single-threaded.
    config::load_dotenv();
    init_logger();
    info!("Starting Z-Wave MQTT bridge");

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run(cli));
}

async fn run(cli: Cli) {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    info!("Configuration loaded:");
    info!(
        "  Broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Topic prefix: {}", config.bridge.topic_prefix);
    info!("  Controller: {}", config.zwave.device);
    info!(
        "  Commands: {} retries, ack {}ms, confirm {}ms",
        config.bridge.retry_limit, config.bridge.ack_timeout_ms, config.bridge.confirm_timeout_ms
    );

    warn!("No native controller driver is bundled, running the simulated network");
    let driver = Arc::new(SimulatedDriver::demo());
    let simulation = (cli.simulate_interval > 0)
        .then(|| run_simulation(driver.clone(), Duration::from_secs(cli.simulate_interval)));

    let bridge = match BridgeCore::new(config, driver) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let cancel = bridge.cancel_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                cancel.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let result = bridge.run().await;

    if let Some(simulation) = simulation {
        simulation.abort();
    }

    match result {
        Ok(()) => info!("Z-Wave MQTT bridge stopped"),
        Err(e) => {
            error!("Bridge stopped: {}", e);
            std::process::exit(1);
        }
    }
}
