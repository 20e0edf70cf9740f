//! User event service - Main Entry Point
//!
//! Runs the user-event consumer with a health endpoint, publishes single
//! user events from the command line, or shows the effective configuration.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use user_events::broker::{new_message_broker, MessageBroker};
use user_events::config::{redact_url, ServiceConfig};
use user_events::domain::{
    DomainEvent, UserCreatedEvent, UserDeletedEvent, UserLoggedInEvent, UserUpdatedEvent,
};
use user_events::error::BrokerError;
use user_events::events::UserEventConsumer;
use user_events::observability::{init_default_logging, BrokerMetrics, HealthServer};
use uuid::Uuid;

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["user-events.toml", "config/user-events.toml"];

/// User service event broker client
#[derive(Parser)]
#[command(name = "user-events")]
#[command(about = "Publish and consume user domain events over RabbitMQ")]
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
    /// Consume user events until SIGINT or SIGTERM
    Run,
    /// Publish a single user event
    Publish {
        #[arg(value_enum)]
        kind: EventKind,
        #[arg(long)]
        user_id: Option<Uuid>,
        #[arg(long, default_value = "user@example.com")]
        email: String,
        #[arg(long, default_value = "Example User")]
        name: String,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EventKind {
    Created,
    Updated,
    Deleted,
    LoggedIn,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Publish {
            kind,
            user_id,
            email,
            name,
        } => {
            let user_id = user_id.unwrap_or_else(Uuid::new_v4);
            publish_event(config, kind, user_id, email, name).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(ServiceConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(ServiceConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(ServiceConfig::from_env()?)
}

/// Build the broker if enabled; a broker that is disabled yields `None`
fn build_broker(
    config: &ServiceConfig,
    metrics: Arc<BrokerMetrics>,
) -> Result<Option<Arc<dyn MessageBroker>>, BrokerError> {
    match new_message_broker(&config.broker, metrics) {
        Ok(broker) => Ok(Some(broker)),
        Err(BrokerError::Disabled) => {
            info!("Message broker disabled, running without events");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn run_service(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting user event service"
    );

    let metrics = Arc::new(BrokerMetrics::new());
    let broker = build_broker(&config, Arc::clone(&metrics))?;

    // The service keeps running when the broker is unreachable at startup
    if let Some(broker) = &broker {
        if let Err(e) = broker.connect().await {
            warn!(error = %e, "Broker unavailable at startup, continuing degraded");
        }
    }

    let consumer = UserEventConsumer::new(broker.clone());
    if let Err(e) = consumer.start().await {
        warn!(error = %e, "User event consumer not started");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = Arc::new(HealthServer::new(
        config.service.name.clone(),
        config.health.port,
        broker.clone(),
        Arc::clone(&metrics),
    ));
    let health_task = tokio::spawn(async move {
        if let Err(e) = health.start(shutdown_rx).await {
            error!(error = %e, "Health server error");
        }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Service running, waiting for user events");
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
    }

    consumer.stop().await;
    if let Some(broker) = &broker {
        if let Err(e) = broker.close().await {
            warn!(error = %e, "Error while closing broker");
        }
    }

    shutdown_tx.send_replace(true);
    if let Err(e) = health_task.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("Service shutdown complete");
    Ok(())
}

async fn publish_event(
    config: ServiceConfig,
    kind: EventKind,
    user_id: Uuid,
    email: String,
    name: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = new_message_broker(&config.broker, Arc::new(BrokerMetrics::new()))?;
    broker.connect().await?;

    let event: Box<dyn DomainEvent> = match kind {
        EventKind::Created => Box::new(UserCreatedEvent::new(user_id, email, name)),
        EventKind::Updated => Box::new(UserUpdatedEvent::new(user_id, name)),
        EventKind::Deleted => Box::new(UserDeletedEvent::new(user_id)),
        EventKind::LoggedIn => Box::new(UserLoggedInEvent::new(user_id, email)),
    };
    let result = broker.publish(event.event_type(), event.as_ref()).await;

    broker.close().await?;
    result?;
    info!(user_id = %user_id, event_id = %event.event_id(), "User event published");
    Ok(())
}

fn handle_config_command(
    config: &ServiceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut shown = config.clone();
        shown.broker.rabbitmq.url = config.broker.rabbitmq.url.as_deref().map(redact_url);
        println!("{}", toml::to_string_pretty(&shown)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
