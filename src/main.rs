//! InletMQ - Main Entry Point
//!
//! Runs the consumption pipeline with a handler that prints each payload
//! to standard output. Supply your own handler through the library API
//! when you need more than that.

use clap::{Parser, Subcommand};
use inletmq::config::ConsumerConfig;
use inletmq::consumer::Consumer;
use inletmq::dispatch::{HandlerOutcome, LogDeadLetter, MessageHandler};
use inletmq::error::HandlerError;
use inletmq::message::InboundMessage;
use inletmq::observability::{init_default_logging, metrics::metrics};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

/// Reconnecting, back-pressured MQTT message consumer
#[derive(Parser)]
#[command(name = "inletmq")]
#[command(about = "Reconnecting, back-pressured MQTT message consumer")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer, printing payloads to standard output
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// The minimal handler: print each payload and acknowledge
struct PrintHandler;

#[async_trait::async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<HandlerOutcome, HandlerError> {
        println!("{}", message.payload_lossy());
        Ok(HandlerOutcome::Ack)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("Starting InletMQ v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_consumer(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ConsumerConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ConsumerConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["inletmq.toml", "config/inletmq.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ConsumerConfig::load_from_file(&path)?);
                }
            }

            Err("no configuration file found; provide one with -c/--config or create inletmq.toml"
                .into())
        }
    }
}

async fn run_consumer(config: ConsumerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_consumer_state("starting");

    let consumer = Consumer::start(config, Arc::new(PrintHandler), Arc::new(LogDeadLetter))?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Consumer is running, waiting for messages...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = consumer.closed() => {
            error!("Connection permanently closed, shutting down...");
        }
    }

    let fatal = consumer.take_fatal();
    let report = consumer.shutdown().await;
    debug!(
        snapshot = %serde_json::to_string(&collector.get_metrics()).unwrap_or_default(),
        "final metrics"
    );

    if let Some(error) = fatal {
        collector.set_consumer_state("error");
        error!(error = %error, "consumer stopped on fatal error");
        return Err(error.into());
    }

    if !report.clean {
        error!(
            inbox_remaining = report.inbox_remaining,
            unacked = report.unacked,
            "drain budget expired before all handlers finished"
        );
    }
    Ok(())
}

fn handle_config_command(
    config: ConsumerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
