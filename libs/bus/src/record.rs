//! Records flowing in and out of the bus.

use serde::de::DeserializeOwned;

use crate::encoder::Encoder;
use crate::error::BusError;

/// A record fetched from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

impl Record {
    /// The payload as UTF-8, if present and valid.
    pub fn payload_str(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }

    /// Decodes the payload as JSON. A missing payload decodes as empty input.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.payload.as_deref().unwrap_or_default())
    }
}

/// A record handed to a transport for publishing.
#[derive(Debug)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: Box<dyn Encoder>,
}

/// Broker acknowledgment for a published record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record the transport gave up on.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub topic: String,
    pub error: BusError,
}
