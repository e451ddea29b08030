//! mqtt-edge - Main Entry Point
//!
//! Runs the MQTT engine against a broker: a long-lived device session with
//! automatic reconnection, or a one-shot publish.

use clap::{Parser, Subcommand};
use mqtt_edge::config::{ClientConfig, SubscriptionConfig};
use mqtt_edge::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_edge::protocol::topics::topic_matches;
use mqtt_edge::protocol::QoS;
use mqtt_edge::transport::mqtt::{MessageQueue, MqttClient, ReconnectController, TickOutcome};
use mqtt_edge::transport::TcpConnector;
use mqtt_edge::MqttError;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn, Level};

/// How often the reconnection controller is driven
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound messages held while the log writer catches up
const INBOX_CAPACITY: usize = 64;

/// Device-side MQTT 3.1.1 client
#[derive(Parser)]
#[command(name = "mqtt-edge")]
#[command(about = "Device-side MQTT 3.1.1 client with QoS 1 delivery and reconnect backoff")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected, subscribe the configured topics and log messages
    Run,
    /// Publish a single message and exit
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// 0 or 1
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting mqtt-edge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => publish_once(config, &topic, message.as_bytes(), qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["mqtt-edge.toml", "config/mqtt-edge.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }

            Err("no configuration file found; pass -c/--config or create mqtt-edge.toml".into())
        }
    }
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let inbox = Arc::new(MessageQueue::new(INBOX_CAPACITY));
    let client = MqttClient::new(config.mqtt.clone(), TcpConnector, inbox.clone())?;
    let controller = ReconnectController::new(client, config.backoff_policy());

    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Running as {} against {}:{}",
        config.mqtt.client_id,
        config.mqtt.server,
        config.mqtt.port()
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            _ = ticker.tick() => {
                if let TickOutcome::Stopped = controller.tick().await {
                    break;
                }
                if controller.take_reconnected() {
                    subscribe_all(&controller, &config.subscriptions).await;
                }
            }
            message = inbox.recv() => {
                let filter = config
                    .subscriptions
                    .iter()
                    .find(|s| topic_matches(&s.topic, &message.topic))
                    .map_or("-", |s| s.topic.as_str());
                info!(
                    topic = %message.topic,
                    filter,
                    retained = message.retained,
                    "{}",
                    String::from_utf8_lossy(&message.payload)
                );
            }
        }
    }

    controller.shutdown().await;
    info!(
        "Session ended ({} republished, {} inbound discarded)",
        controller.client().republish_count(),
        inbox.discards()
    );
    Ok(())
}

/// Subscriptions do not survive a reconnect; restore them all
async fn subscribe_all(
    controller: &ReconnectController<TcpConnector>,
    topics: &[SubscriptionConfig],
) {
    for subscription in topics {
        let Some(qos) = QoS::from_level(subscription.qos) else {
            warn!("Skipping {}: invalid QoS {}", subscription.topic, subscription.qos);
            continue;
        };
        match controller.client().subscribe(&subscription.topic, qos).await {
            Ok(()) => {}
            Err(e @ MqttError::SubscriptionRejected { .. }) => warn!("{}", e),
            Err(e) => {
                // The connection was dropped; the next reconnect retries
                warn!("Subscribing to {} failed: {}", subscription.topic, e);
                return;
            }
        }
    }
}

async fn publish_once(
    config: ClientConfig,
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::from_level(qos).ok_or(MqttError::UnsupportedQoS(qos))?;
    let client = MqttClient::new(
        config.mqtt,
        TcpConnector,
        Arc::new(|_: &str, _: &[u8], _: bool| {}),
    )?;

    client.connect().await?;
    let result = client.publish(topic, payload, retain, qos).await;
    client.disconnect().await;
    result?;

    info!("Published {} bytes to {}", payload.len(), topic);
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.to_redacted_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
