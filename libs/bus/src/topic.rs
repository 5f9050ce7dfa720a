//! Producer bound to a single topic.

use std::sync::Arc;

use serde::Serialize;

use crate::error::BusResult;
use crate::producer::Producer;
use crate::record::Delivered;

/// Publishes to one topic through a shared [`Producer`].
///
/// Callers never see the topic name or the transport's security settings.
#[derive(Clone)]
pub struct TopicProducer {
    producer: Arc<Producer>,
    topic: String,
}

impl TopicProducer {
    pub fn new(producer: Arc<Producer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fire-and-forget publish; see [`Producer::send_async`].
    pub fn send_async<T>(&self, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.producer.send_async(&self.topic, value);
    }

    /// Fire-and-forget publish with a partitioning key.
    pub fn send_async_keyed<T>(&self, key: impl Into<String>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.producer.send_async_keyed(&self.topic, key, value);
    }

    /// Publishes and waits for the broker's acknowledgment.
    pub async fn send<T>(&self, value: T) -> BusResult<Option<Delivered>>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.producer.send(&self.topic, value).await
    }
}
