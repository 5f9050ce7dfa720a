//! In-process transport for tests and local development.
//!
//! Records are kept in memory in publish order. Every topic has a single
//! partition whose offsets start at zero. A failing variant rejects every
//! record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{BusError, BusResult};
use crate::producer::{DeliverySink, Producer, Transport};
use crate::record::{Delivered, DeliveryFailure, OutboundRecord};

/// A record captured by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl PublishedRecord {
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    sink: Mutex<Option<DeliverySink>>,
    published: Mutex<Log>,
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<PublishedRecord>,
    next_offsets: HashMap<String, i64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    pub fn new(sink: DeliverySink) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            published: Mutex::new(Log::default()),
            failure: None,
        }
    }

    /// A transport that rejects every record with `reason`.
    pub fn failing(sink: DeliverySink, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new(sink)
        }
    }

    /// A producer wired to a fresh in-memory transport.
    pub fn producer() -> BusResult<(Producer, Arc<MemoryTransport>)> {
        Producer::with_transport(64, |sink| Ok(MemoryTransport::new(sink)))
    }

    /// A producer whose every publish fails with `reason`.
    pub fn failing_producer(
        reason: impl Into<String>,
    ) -> BusResult<(Producer, Arc<MemoryTransport>)> {
        let reason = reason.into();
        Producer::with_transport(64, |sink| Ok(MemoryTransport::failing(sink, reason)))
    }

    /// Every record published so far, oldest first.
    pub fn records(&self) -> Vec<PublishedRecord> {
        lock(&self.published).records.clone()
    }

    /// Records published to `topic`, oldest first.
    pub fn records_for(&self, topic: &str) -> Vec<PublishedRecord> {
        lock(&self.published)
            .records
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    fn append(&self, record: &OutboundRecord) -> BusResult<Delivered> {
        if let Some(reason) = &self.failure {
            return Err(BusError::Publish {
                topic: record.topic.clone(),
                reason: reason.clone(),
            });
        }

        let payload = record.value.encode()?.to_vec();
        let mut log = lock(&self.published);
        let next = log.next_offsets.entry(record.topic.clone()).or_insert(0);
        let offset = *next;
        *next += 1;
        log.records.push(PublishedRecord {
            topic: record.topic.clone(),
            key: record.key.clone(),
            payload,
        });

        Ok(Delivered {
            topic: record.topic.clone(),
            partition: 0,
            offset,
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn enqueue(&self, record: OutboundRecord) {
        let outcome = self.append(&record);
        let sink = lock(&self.sink);
        let Some(sink) = sink.as_ref() else {
            return;
        };
        match outcome {
            Ok(delivered) => sink.success(delivered),
            Err(error) => sink.failure(DeliveryFailure {
                topic: record.topic,
                error,
            }),
        }
    }

    async fn deliver(&self, record: OutboundRecord) -> BusResult<Delivered> {
        self.append(&record)
    }

    fn close(&self) -> BusResult<()> {
        lock(&self.sink).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offsets_count_per_topic() {
        let (producer, transport) = MemoryTransport::producer().unwrap();

        let first = producer.send("builds", 1).await.unwrap().unwrap();
        let other = producer.send("releases", 2).await.unwrap().unwrap();
        let second = producer.send("builds", 3).await.unwrap().unwrap();

        assert_eq!((first.offset, other.offset, second.offset), (0, 0, 1));
        assert_eq!(transport.records_for("builds").len(), 2);
        assert_eq!(transport.records().len(), 3);
    }
}
