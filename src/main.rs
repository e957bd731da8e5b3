//! MQTT relay - main entry point
//!
//! Loads the TOML configuration, seeds the in-memory store, and serves the
//! HTTP API and live WebSocket gateway until SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use mqtt_relay::api;
use mqtt_relay::config::RelayConfig;
use mqtt_relay::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_relay::persistence::MemoryStore;
use mqtt_relay::service::RelayService;
use mqtt_relay::transport::mqtt::RumqttConnector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

/// MQTT connection manager with live WebSocket fan-out
#[derive(Parser)]
#[command(name = "mqtt-relay")]
#[command(about = "MQTT connection manager with live WebSocket fan-out")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and live gateway
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format(), false),
        _ => init_logging(Level::TRACE, log_format(), true),
    }

    info!("Starting mqtt-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()))
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(RelayConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["relay.toml", "config/relay.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(RelayConfig::load_from_file(&path)?);
                }
            }

            info!("No configuration file found, using defaults");
            Ok(RelayConfig::default())
        }
    }
}

async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    let store = MemoryStore::from_seeds(&config.connections).await?;
    let service = Arc::new(RelayService::new(
        &config,
        Arc::new(RumqttConnector::default()),
        Arc::new(store),
    ));

    let shutdown_service = service.clone();
    let (bound, server) = warp::serve(api::routes(service.clone()))
        .try_bind_with_graceful_shutdown(addr, async move {
            wait_for_signal().await;
            // Browser channels get their close frames before sessions go.
            shutdown_service.shutdown().await;
        })?;

    info!(address = %bound, "Relay listening");
    server.await;

    // Covers a server that stopped without a signal.
    service.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());
    let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());

    match (sigint, sigterm) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            }
        }
        _ => {
            error!("Failed to install signal handlers, falling back to ctrl-c");
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to wait for ctrl-c: {}", e);
            }
        }
    }
}

fn handle_config_command(config: &RelayConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current relay configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}
