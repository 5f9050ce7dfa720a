//! Error types for encoding and decoding messages.

use thiserror::Error;

/// Errors raised while converting messages to and from their wire forms.
#[derive(Debug, Error)]
pub enum EventError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encoding failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
