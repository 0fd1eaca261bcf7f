//! mqtt-session - command line client for the MQTT session manager
//!
//! `sub` keeps a subscription alive across reconnects and prints every
//! message; `pub` publishes a single message and waits for its
//! acknowledgment.

use clap::{Parser, Subcommand, ValueEnum};
use mqtt_session::connection::ConnectionObserver;
use mqtt_session::observability::init_default_logging;
use mqtt_session::{
    handler_fn, ConnectionConfig, MqttConnection, MqttError, MqttMessage, QoS,
    SharedMessageHandler,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Reconnecting MQTT client
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Reconnecting MQTT publish/subscribe client")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URI, overrides the configuration file
    #[arg(long, env = "MQTT_SERVER_URI")]
    server_uri: Option<String>,

    /// Client identifier, generated when empty
    #[arg(long, env = "MQTT_CLIENT_ID")]
    client_id: Option<String>,

    /// MQTT username (optional)
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password (optional)
    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    /// Resume the broker session instead of starting clean
    #[arg(long)]
    persistent_session: bool,

    /// Give up instead of reconnecting when the connection drops
    #[arg(long)]
    no_reconnect: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to topic filters and print messages until Ctrl+C
    Sub {
        /// Topic filter, may be repeated
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,

        /// Requested QoS (0, 1 or 2)
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        format: OutputFormat,
    },
    /// Publish one message
    Pub {
        /// Topic name
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long)]
        message: String,

        /// QoS (0, 1 or 2)
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,

        /// Ask the broker to retain the message
        #[arg(short, long)]
        retain: bool,
    },
}

/// Output formatting options
#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Timestamped, human-readable
    Pretty,
    /// Single line per message, topic and payload only
    Compact,
    /// One JSON object per line
    Json,
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

fn format_message(message: &MqttMessage, format: OutputFormat) -> String {
    match format {
        OutputFormat::Pretty => format!(
            "[{}] {} (qos {}{}) {}",
            chrono::Utc::now().format("%H:%M:%S%.3f"),
            message.topic,
            message.qos as u8,
            if message.retained { ", retained" } else { "" },
            message.payload_str()
        ),
        OutputFormat::Compact => format!("{} {}", message.topic, message.payload_str()),
        OutputFormat::Json => serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "topic": message.topic,
            "qos": message.qos as u8,
            "retained": message.retained,
            "payload": message.payload_str(),
        })
        .to_string(),
    }
}

/// Re-issues the CLI's subscriptions every time a session is established
struct Resubscriber {
    topics: Vec<String>,
    qos: QoS,
    handler: SharedMessageHandler,
}

impl ConnectionObserver for Resubscriber {
    fn on_connection_lost(&self, _connection: &MqttConnection, will_reconnect: bool, cause: &MqttError) {
        warn!(will_reconnect, "Connection lost: {}", cause);
    }

    fn on_connection_established(&self, connection: &MqttConnection, reconnected: bool) {
        info!(reconnected, "Subscribing to {} filter(s)", self.topics.len());
        for topic in &self.topics {
            let handle = connection.subscribe(topic, self.qos, Some(self.handler.clone()));
            let topic = topic.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    error!("Subscribe to {} failed: {}", topic, e);
                }
            });
        }
    }
}

fn load_configuration(cli: &Cli) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConnectionConfig::load_from_file(path)?
        }
        None => ConnectionConfig::default(),
    };

    if let Some(uri) = &cli.server_uri {
        config.server_uri = uri.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.client_id = client_id.clone();
    }
    if cli.username.is_some() {
        config.username = cli.username.clone();
    }
    if cli.password.is_some() {
        config.password = cli.password.clone();
    }
    if cli.persistent_session {
        config.clean_session = false;
    }
    if cli.no_reconnect {
        config.reconnect = false;
    }

    config.validate()?;
    Ok(config)
}

async fn run_subscriber(
    connection: MqttConnection,
    topics: Vec<String>,
    qos: QoS,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let handler = handler_fn(move |message: &MqttMessage| {
        println!("{}", format_message(message, format));
    });
    connection.set_connection_observer(Some(Arc::new(Resubscriber {
        topics,
        qos,
        handler,
    })));

    connection.open().await?;
    info!("Press Ctrl+C to stop");
    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

async fn run_publisher(
    connection: &MqttConnection,
    message: MqttMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    connection.open().await?;
    let topic = message.topic.clone();
    connection.publish(message).await?;
    info!("Published to {}", topic);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let connection = match MqttConnection::new(config) {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to create connection: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Sub {
            topics,
            qos,
            format,
        } => run_subscriber(connection.clone(), topics, qos_from_level(qos), format).await,
        Commands::Pub {
            topic,
            message,
            qos,
            retain,
        } => {
            let message = MqttMessage::new(topic, qos_from_level(qos), message).retain(retain);
            tokio::select! {
                result = run_publisher(&connection, message) => result,
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            }
        }
    };

    match connection.close().wait_timeout(Duration::from_secs(5)).await {
        Ok(()) => info!("Connection closed"),
        Err(e) => warn!("Close did not complete: {}", e),
    }

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}
