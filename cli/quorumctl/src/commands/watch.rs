//! Watch command (tail bus topics through the watcher).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use quorum_bus::config::{parse_brokers, ENV_BROKERS};
use quorum_bus::{Record, RecordHandler, SaslAuthentication, Watcher, WatcherConfig};
use quorum_events::Message;
use tokio::sync::watch;
use tracing::info;

use crate::error::CliError;
use crate::output::{format_record, OutputFormat};

const DEFAULT_TOPIC: &str = "quorum.events";

#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Comma separated bootstrap servers.
    #[arg(long, env = ENV_BROKERS, default_value = "")]
    brokers: String,

    /// Topic to watch, repeatable.
    #[arg(long = "topic", default_values_t = [DEFAULT_TOPIC.to_string()])]
    topics: Vec<String>,

    /// Consumer group name for the watcher's client.
    #[arg(long, default_value = "quorumctl-watch")]
    group: String,

    /// Only show messages of this type.
    #[arg(long = "type")]
    message_type: Option<String>,

    /// Only show messages whose source starts with this prefix.
    #[arg(long)]
    source: Option<String>,

    /// Only show failed messages.
    #[arg(long)]
    failed: bool,
}

/// Record filter built from the command line.
#[derive(Debug, Clone, Default)]
struct Filter {
    message_type: Option<String>,
    source_prefix: Option<String>,
    failed_only: bool,
}

impl Filter {
    fn is_empty(&self) -> bool {
        self.message_type.is_none() && self.source_prefix.is_none() && !self.failed_only
    }

    /// Without criteria every record matches; with criteria only quorum
    /// messages that satisfy all of them do.
    fn matches(&self, record: &Record) -> bool {
        if self.is_empty() {
            return true;
        }
        let Ok(message) = record.decode_json::<Message>() else {
            return false;
        };

        self.message_type
            .as_ref()
            .map_or(true, |t| message.message_type == *t)
            && self
                .source_prefix
                .as_ref()
                .map_or(true, |p| message.source.starts_with(p.as_str()))
            && (!self.failed_only || !message.success)
    }
}

struct PrintHandler {
    format: OutputFormat,
}

#[async_trait]
impl RecordHandler for PrintHandler {
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        println!("{}", format_record(record, self.format));
        Ok(())
    }
}

impl WatchCommand {
    fn filter(&self) -> Filter {
        Filter {
            message_type: self.message_type.clone(),
            source_prefix: self.source.clone(),
            failed_only: self.failed,
        }
    }

    pub async fn run(self, format: OutputFormat) -> Result<()> {
        let brokers = parse_brokers(&self.brokers);
        if brokers.is_empty() {
            return Err(CliError::NoBrokers.into());
        }

        let config = WatcherConfig::new(brokers, self.topics.clone(), self.group.clone())
            .with_security(SaslAuthentication::from_env().into());
        let watcher = Arc::new(Watcher::connect(&config).map_err(CliError::from)?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = watcher
            .start_task_handler(PrintHandler { format }, shutdown_rx.clone())
            .map_err(CliError::from)?;

        let filter = self.filter();
        let polled = tokio::select! {
            polled = watcher.consume_records(move |record| filter.matches(record), shutdown_rx) => polled,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping watch");
                Ok(())
            }
        };

        let _ = shutdown_tx.send(true);
        let handled = handler.await.unwrap_or_default();
        info!(handled, "Watch finished");
        watcher.close().map_err(CliError::from)?;

        polled.map_err(|e| CliError::from(e).into())
    }
}
