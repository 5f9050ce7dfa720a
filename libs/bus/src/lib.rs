//! # quorum-bus
//!
//! Kafka plumbing for the quorum event correlation service.
//!
//! ## Publishing
//!
//! A [`Producer`] has two paths: [`Producer::send`] waits for the broker's
//! acknowledgment, [`Producer::send_async`] hands the record to a buffered
//! client and reports the outcome on delivery report channels drained by
//! [`Producer::consume_successes`] and [`Producer::consume_errors`].
//! [`TopicProducer`] binds a producer to one topic.
//!
//! ## Consuming
//!
//! [`ConsumerGroup`] keeps a consumer group member running with at-least-once
//! semantics: every record is handed to a [`RecordHandler`] and marked
//! afterwards, whatever the handler returned. [`Watcher`] tails topics for
//! operators, filtering records through a matcher into a bounded task queue.
//!
//! ## Transports
//!
//! Kafka access goes through rdkafka. [`MemoryTransport`] keeps published
//! records in memory for tests and local runs without a broker.

pub mod config;
mod consumer;
mod encoder;
mod error;
mod kafka;
mod memory;
mod producer;
mod record;
mod topic;
mod watcher;

pub use config::{
    ConsumerGroupConfig, KafkaVersion, ProducerConfig, SaslAuthentication, SaslCredentials,
    SaslMechanism, Security, WatcherConfig,
};
pub use consumer::{
    handler_fn, Claim, ConsumerGroup, FnHandler, GroupClient, GroupHandler, GroupSession,
    RecordHandler, SessionHandler,
};
pub use encoder::{Encoder, JsonEncoder};
pub use error::{BusError, BusResult};
pub use kafka::{KafkaFetcher, KafkaGroupClient, KafkaTransport};
pub use memory::{MemoryTransport, PublishedRecord};
pub use producer::{DeliverySink, DrainHandle, Producer, Transport};
pub use record::{Delivered, DeliveryFailure, OutboundRecord, Record};
pub use topic::TopicProducer;
pub use watcher::{RecordFetcher, Watcher, TASK_QUEUE_CAPACITY};
