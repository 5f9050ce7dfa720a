//! quorum ingest service
//!
//! Consumes creation commands from the intake topic, persists events,
//! receivers and receiver groups, and announces them together with every
//! receiver group an event completes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use quorum_bus::{ConsumerGroup, ConsumerGroupConfig, Producer, TopicProducer};
use quorum_ingest::{
    config::{self, DEFAULT_GROUP_ID},
    db::Database,
    intake::IntakeHandler,
    service::EventService,
    store::EventStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to QUORUM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting quorum ingest");
    info!(
        outbound_topic = %config.outbound_topic,
        intake_topic = %config.intake_topic,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if let Err(e) = db.health_check().await {
        error!(error = %e, "Database health check failed");
        return Err(e.into());
    }

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store: Arc<dyn EventStore> = Arc::new(db.store());

    // Producer and its delivery report drains
    let producer = Arc::new(Producer::connect(&config.producer)?);
    let successes = producer.consume_successes()?;
    let errors = producer.consume_errors()?;

    let service = Arc::new(EventService::new(
        store,
        TopicProducer::new(Arc::clone(&producer), config.outbound_topic.clone()),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the intake consumer when a broker is configured
    let consumer = if producer.is_enabled() {
        let group_config = ConsumerGroupConfig::from_env(
            vec![config.intake_topic.clone()],
            Some(
                std::env::var(quorum_bus::config::ENV_GROUP_ID)
                    .unwrap_or_else(|_| DEFAULT_GROUP_ID.to_string()),
            ),
        )?;
        let group = Arc::new(ConsumerGroup::connect(
            &group_config,
            IntakeHandler::new(Arc::clone(&service)),
        )?);

        if let Some(ready) = group.ready() {
            tokio::spawn(async move {
                if ready.await.is_ok() {
                    info!("Intake consumer joined its group");
                }
            });
        }

        let handle = tokio::spawn({
            let group = Arc::clone(&group);
            let shutdown_rx = shutdown_rx.clone();
            async move {
                if let Err(e) = group.run(shutdown_rx).await {
                    error!(error = %e, "Intake consumer failed");
                }
            }
        });
        Some((group, handle))
    } else {
        warn!("No brokers configured, intake consumer not started");
        None
    };
    drop(shutdown_rx);

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Some((group, handle)) = consumer {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Intake consumer did not shut down in time");
        }
        if let Err(e) = group.close() {
            warn!(error = %e, "Failed to close intake consumer");
        }
    }

    // Closing the producer ends both drains once buffered reports are consumed.
    if let Err(e) = producer.close() {
        warn!(error = %e, "Failed to close producer");
    }
    match tokio::time::timeout(shutdown_timeout, successes.join()).await {
        Ok(delivered) => info!(delivered, "Delivery success drain stopped"),
        Err(e) => warn!(error = %e, "Delivery success drain did not stop in time"),
    }
    match tokio::time::timeout(shutdown_timeout, errors.join()).await {
        Ok(failed) => info!(failed, "Delivery failure drain stopped"),
        Err(e) => warn!(error = %e, "Delivery failure drain did not stop in time"),
    }

    info!("quorum ingest shutdown complete");
    Ok(())
}
