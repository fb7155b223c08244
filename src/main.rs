//! hubclient command line
//!
//! Drives a single device over MQTT: send events, watch cloud-to-device traffic and twin
//! updates, serve direct methods, read and patch the twin.

use clap::{Parser, Subcommand};
use hubclient::config::{HubConfig, SendOptions};
use hubclient::device::{Client, DirectMethodHandler};
use hubclient::observability::{init_default_logging, init_logging, LogFormat};
use hubclient::protocol::{Mapping, Qos, Value};
use hubclient::transport::MqttTransport;
use hubclient::{HubError, TwinState};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hubclient")]
#[command(about = "IoT hub device client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one device-to-cloud event
    Send {
        payload: String,
        /// Application property, `key=value`
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,
        #[arg(long)]
        message_id: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        /// Quality of service, 0 or 1
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
    /// Print cloud-to-device events until interrupted
    WatchEvents,
    /// Print desired-property updates until interrupted
    WatchTwin,
    /// Answer the named direct methods by echoing their payload
    Serve {
        #[arg(required = true)]
        methods: Vec<String>,
    },
    /// Print the desired and reported twin state
    Twin,
    /// Patch reported properties; values are parsed as JSON, falling back to strings
    UpdateTwin {
        #[arg(required = true, value_name = "KEY=VALUE")]
        properties: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Show the loaded configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(tracing::Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(tracing::Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => show_config(&config, show),
        command => run_device(config, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: &Option<PathBuf>) -> Result<HubConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(HubConfig::load_from_file(path)?);
    }

    for candidate in ["hubclient.toml", "config/hubclient.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(HubConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(HubConfig::default())
}

fn show_config(config: &HubConfig, show: bool) -> CliResult {
    info!("Configuration is valid");
    if show {
        println!("{config:#?}");
    }
    Ok(())
}

async fn run_device(config: HubConfig, command: Commands) -> CliResult {
    let transport = Arc::new(MqttTransport::new(config.mqtt.clone()));
    let client = Client::from_config(transport, &config)?;
    let cancel = CancellationToken::new();

    client.connect(&cancel).await?;
    info!(device_id = client.device_id(), "connected");

    let outcome = tokio::select! {
        outcome = execute(&client, &cancel, command) => outcome,
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            cancel.cancel();
            Ok(())
        }
    };

    if let Err(e) = client.close().await {
        warn!("Error during close: {}", e);
    }
    outcome
}

async fn execute(client: &Client, cancel: &CancellationToken, command: Commands) -> CliResult {
    match command {
        Commands::Send {
            payload,
            properties,
            message_id,
            correlation_id,
            qos,
        } => {
            let mut options = SendOptions::default().with_qos(Qos::from_level(qos)?);
            for property in &properties {
                let (key, value) = split_pair(property)?;
                options = options.with_property(key, value);
            }
            if let Some(id) = message_id {
                options = options.with_message_id(id);
            }
            if let Some(id) = correlation_id {
                options = options.with_correlation_id(id);
            }
            client.send_event(cancel, payload, options).await?;
            info!("Event sent");
        }
        Commands::WatchEvents => {
            let mut events = client.subscribe_events(cancel).await?;
            loop {
                let event = events.recv().await?;
                println!("{}\t{:?}", event.payload_text(), event.properties);
            }
        }
        Commands::WatchTwin => {
            let mut updates = client.subscribe_twin_updates(cancel).await?;
            loop {
                let desired = updates.recv().await?;
                println!("{}", String::from_utf8_lossy(&desired.to_json()?));
            }
        }
        Commands::Serve { methods } => {
            for name in &methods {
                let method = name.clone();
                let handler: DirectMethodHandler = Arc::new(move |payload: Mapping| {
                    info!(method = %method, "direct method invoked");
                    Ok(payload)
                });
                client.register_method(cancel, name, handler).await?;
            }
            info!(methods = ?methods, "Serving direct methods");
            cancel.cancelled().await;
        }
        Commands::Twin => {
            let (desired, reported) = client.retrieve_twin_state(cancel).await?;
            println!("desired:  {}", String::from_utf8_lossy(&desired.to_json()?));
            println!("reported: {}", String::from_utf8_lossy(&reported.to_json()?));
        }
        Commands::UpdateTwin { properties } => {
            let mut state = TwinState::default();
            for property in &properties {
                let (key, value) = split_pair(property)?;
                let value = Value::from_json_slice(value.as_bytes())
                    .unwrap_or_else(|_| Value::from(value));
                state = state.with(key, value);
            }
            let version = client.update_twin_state(cancel, &state).await?;
            info!(version, "Reported properties updated");
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

fn split_pair(pair: &str) -> Result<(&str, &str), HubError> {
    pair.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| HubError::invalid_input(format!("expected KEY=VALUE, got {pair:?}")))
}

#[cfg(unix)]
async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
