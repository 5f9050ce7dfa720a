use anyhow::Result;
use quorum_bus::ProducerConfig;

use crate::db::DbConfig;

pub const DEFAULT_OUTBOUND_TOPIC: &str = "quorum.events";
pub const DEFAULT_INTAKE_TOPIC: &str = "quorum.intake";
pub const DEFAULT_GROUP_ID: &str = "quorum-ingest";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    /// Topic every announcement is published to.
    pub outbound_topic: String,
    /// Topic creation commands are consumed from.
    pub intake_topic: String,
    pub database: DbConfig,
    pub producer: ProducerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("QUORUM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("QUORUM_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let outbound_topic = std::env::var("QUORUM_OUTBOUND_TOPIC")
            .unwrap_or_else(|_| DEFAULT_OUTBOUND_TOPIC.to_string());

        let intake_topic = std::env::var("QUORUM_INTAKE_TOPIC")
            .unwrap_or_else(|_| DEFAULT_INTAKE_TOPIC.to_string());

        let database = DbConfig::from_env();

        let producer = ProducerConfig::from_env();
        // Reject an unknown version or mechanism before anything connects.
        if producer.is_enabled() {
            producer.client_config()?;
        }

        Ok(Self {
            log_level,
            dev_mode,
            outbound_topic,
            intake_topic,
            database,
            producer,
        })
    }
}
