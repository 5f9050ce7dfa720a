//! Bus error types.

use thiserror::Error;

use crate::config::SaslMechanism;

/// Errors raised by the producer, consumer group and watcher.
///
/// Configuration variants are returned at construction time and never retried.
/// Runtime variants are returned from `send` or logged by the long-running
/// loops.
#[derive(Debug, Error)]
pub enum BusError {
    /// The configured protocol version is not a known Kafka release.
    #[error("unknown kafka protocol version: {0}")]
    UnknownVersion(String),

    /// The SASL mechanism is recognized but cannot be used.
    #[error("SASL mechanism {0} is not supported")]
    UnsupportedMechanism(SaslMechanism),

    /// A consumer group was configured without a group id.
    #[error("consumer group id is required")]
    MissingGroupId,

    /// The underlying Kafka client failed to start.
    #[error("failed to create kafka client: {0}")]
    Client(#[source] rdkafka::error::KafkaError),

    /// The value could not be encoded to bytes.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The broker rejected or never acknowledged a record.
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// A consume session ended with an error.
    #[error("consume session failed: {0}")]
    Consume(String),

    /// Fetching records failed in a way the watcher cannot recover from.
    #[error("fatal fetch error: {0}")]
    Fetch(String),

    /// A delivery report or task queue has already been handed out.
    #[error("{0} is already being drained")]
    AlreadyDraining(&'static str),

    /// The producer or consumer has been closed.
    #[error("bus client is closed")]
    Closed,
}

impl BusError {
    /// Returns true for errors raised while validating configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BusError::UnknownVersion(_) | BusError::UnsupportedMechanism(_) | BusError::MissingGroupId
        )
    }
}

pub type BusResult<T> = Result<T, BusError>;
