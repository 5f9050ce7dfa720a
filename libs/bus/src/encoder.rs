//! Lazy, memoized value encoding.

use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

use crate::error::{BusError, BusResult};

/// A value that can be turned into record bytes.
pub trait Encoder: Send + Sync + fmt::Debug {
    /// Encoded bytes. Repeated calls return the same bytes.
    fn encode(&self) -> BusResult<&[u8]>;

    /// Length of the encoded bytes, zero if encoding fails.
    fn length(&self) -> usize {
        self.encode().map(<[u8]>::len).unwrap_or(0)
    }
}

/// Encodes a serializable value as JSON the first time its bytes are needed.
pub struct JsonEncoder<T> {
    value: T,
    encoded: OnceLock<Result<Vec<u8>, String>>,
}

impl<T: Serialize> JsonEncoder<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            encoded: OnceLock::new(),
        }
    }

    pub fn is_encoded(&self) -> bool {
        self.encoded.get().is_some()
    }
}

impl<T> fmt::Debug for JsonEncoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonEncoder")
            .field("encoded", &self.encoded.get().is_some())
            .finish()
    }
}

impl<T: Serialize + Send + Sync> Encoder for JsonEncoder<T> {
    fn encode(&self) -> BusResult<&[u8]> {
        self.encoded
            .get_or_init(|| serde_json::to_vec(&self.value).map_err(|e| e.to_string()))
            .as_deref()
            .map_err(|e| BusError::Encode(e.clone()))
    }
}
