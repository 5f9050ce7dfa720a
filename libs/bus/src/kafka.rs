//! librdkafka-backed transport, consumer group client and record fetcher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::producer::{
    BaseRecord, DeliveryResult, FutureProducer, FutureRecord, Producer as _, ProducerContext,
    ThreadedProducer,
};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConsumerGroupConfig, ProducerConfig, WatcherConfig};
use crate::consumer::{Claim, GroupClient, GroupSession, SessionHandler};
use crate::error::{BusError, BusResult};
use crate::producer::{DeliverySink, Transport};
use crate::record::{Delivered, DeliveryFailure, OutboundRecord, Record};
use crate::watcher::RecordFetcher;

/// How long `close` waits for buffered records to leave the client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl From<&BorrowedMessage<'_>> for Record {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        }
    }
}

// =============================================================================
// Producer transport
// =============================================================================

/// Forwards buffered-path delivery reports from librdkafka's polling thread.
struct DeliveryReporter {
    sink: DeliverySink,
}

impl ClientContext for DeliveryReporter {}

impl ProducerContext for DeliveryReporter {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        match result {
            Ok(message) => self.sink.success(Delivered {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            }),
            Err((error, message)) => self.sink.failure(DeliveryFailure {
                topic: message.topic().to_string(),
                error: BusError::Publish {
                    topic: message.topic().to_string(),
                    reason: error.to_string(),
                },
            }),
        }
    }
}

/// Kafka transport holding one client per publish path.
///
/// Buffered records rejected before they reach librdkafka are reported to the
/// same sink as broker delivery failures.
pub struct KafkaTransport {
    buffered: Mutex<Option<ThreadedProducer<DeliveryReporter>>>,
    acknowledged: Mutex<Option<FutureProducer>>,
    /// Released on close so the failure drain can finish.
    sink: Mutex<Option<DeliverySink>>,
    send_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(config: &ProducerConfig, sink: DeliverySink) -> BusResult<Self> {
        let client_config = config.client_config()?;

        let buffered: ThreadedProducer<DeliveryReporter> = client_config
            .create_with_context(DeliveryReporter { sink: sink.clone() })
            .map_err(BusError::Client)?;
        let acknowledged: FutureProducer = client_config.create().map_err(BusError::Client)?;

        info!(
            brokers = %config.brokers.join(","),
            version = %config.version,
            "Kafka producer connected"
        );

        Ok(Self {
            buffered: Mutex::new(Some(buffered)),
            acknowledged: Mutex::new(Some(acknowledged)),
            sink: Mutex::new(Some(sink)),
            send_timeout: config.send_timeout,
        })
    }

    fn reject(&self, topic: &str, error: BusError) {
        warn!(topic, error = %error, "Buffered record rejected");
        if let Some(sink) = lock(&self.sink).as_ref() {
            sink.failure(DeliveryFailure {
                topic: topic.to_string(),
                error,
            });
        }
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn enqueue(&self, record: OutboundRecord) {
        let payload = match record.value.encode() {
            Ok(payload) => payload,
            Err(error) => return self.reject(&record.topic, error),
        };

        let guard = lock(&self.buffered);
        let Some(producer) = guard.as_ref() else {
            drop(guard);
            return self.reject(&record.topic, BusError::Closed);
        };

        let mut base = BaseRecord::<str, [u8], ()>::to(&record.topic).payload(payload);
        if let Some(key) = record.key.as_deref() {
            base = base.key(key);
        }

        if let Err((error, _)) = producer.send(base) {
            drop(guard);
            self.reject(
                &record.topic,
                BusError::Publish {
                    topic: record.topic.clone(),
                    reason: error.to_string(),
                },
            );
        }
    }

    async fn deliver(&self, record: OutboundRecord) -> BusResult<Delivered> {
        let producer = lock(&self.acknowledged)
            .as_ref()
            .cloned()
            .ok_or(BusError::Closed)?;

        let payload = record.value.encode()?;
        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic).payload(payload);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match producer.send(future_record, self.send_timeout).await {
            Ok((partition, offset)) => Ok(Delivered {
                topic: record.topic,
                partition,
                offset,
            }),
            Err((error, _)) => Err(BusError::Publish {
                topic: record.topic,
                reason: error.to_string(),
            }),
        }
    }

    fn close(&self) -> BusResult<()> {
        let buffered = lock(&self.buffered).take();
        let acknowledged = lock(&self.acknowledged).take();
        lock(&self.sink).take();

        if let Some(producer) = buffered {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
                warn!(error = %e, "Buffered records not flushed before close");
            }
        }
        if let Some(producer) = acknowledged {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
                warn!(error = %e, "Acknowledged records not flushed before close");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Consumer group client
// =============================================================================

/// A change to this member's partition assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked,
}

/// Partition assignment as last reported by the rebalance callbacks.
///
/// `epoch` increases on every assignment so a session can tell its own
/// assignment from a later one covering the same partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AssignmentState {
    epoch: u64,
    assigned: bool,
    partitions: Vec<(String, i32)>,
}

impl AssignmentState {
    fn apply(&mut self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                self.epoch += 1;
                self.assigned = true;
                self.partitions = partitions;
            }
            RebalanceEvent::Revoked => {
                self.assigned = false;
                self.partitions.clear();
            }
        }
    }

    /// Epoch of the live assignment, if this member holds one.
    fn current(&self) -> Option<u64> {
        self.assigned.then_some(self.epoch)
    }

    /// Whether a session started under `epoch` may keep consuming.
    fn holds(&self, epoch: u64) -> bool {
        self.current() == Some(epoch)
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    let mut partitions: Vec<(String, i32)> = tpl
        .elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition()))
        .collect();
    partitions.sort();
    partitions
}

/// Publishes rebalance outcomes to the consume sessions.
///
/// Callbacks run inside `recv`, so a session only observes them while it is
/// polling for records.
struct SessionContext {
    assignment: watch::Sender<AssignmentState>,
}

impl ClientContext for SessionContext {}

impl ConsumerContext for SessionContext {
    fn pre_rebalance<'a>(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            info!(partitions = tpl.count(), "Partitions revoked");
            self.assignment
                .send_modify(|state| state.apply(RebalanceEvent::Revoked));
        }
    }

    fn post_rebalance<'a>(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                info!(partitions = partitions.len(), "Partitions assigned");
                self.assignment
                    .send_modify(|state| state.apply(RebalanceEvent::Assigned(partitions)));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => warn!(error = %e, "Rebalance failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<SessionContext>;

/// Consumer group membership backed by a single `StreamConsumer`.
///
/// One session spans one partition assignment. A session starts once the
/// group has assigned partitions to this member and ends when they are
/// revoked; the driver then starts the next session.
pub struct KafkaGroupClient {
    consumer: GroupConsumer,
    assignment: watch::Receiver<AssignmentState>,
    subscription: Mutex<Vec<String>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl KafkaGroupClient {
    pub fn new(config: &ConsumerGroupConfig) -> BusResult<Self> {
        let (assignment_tx, assignment) = watch::channel(AssignmentState::default());
        let consumer: GroupConsumer = config
            .client_config()?
            .create_with_context(SessionContext {
                assignment: assignment_tx,
            })
            .map_err(BusError::Client)?;

        info!(
            group_id = %config.group_id,
            brokers = %config.brokers.join(","),
            "Kafka consumer group client created"
        );

        Ok(Self {
            consumer,
            assignment,
            subscription: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> BusResult<()> {
        let mut subscription = lock(&self.subscription);
        if subscription.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| BusError::Consume(e.to_string()))?;
        *subscription = topics.to_vec();
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }
}

/// Polls until the group assigns partitions to this member.
///
/// Returns the assignment epoch and, when a record raced the assignment
/// notification, that record.
async fn await_assignment(
    consumer: &GroupConsumer,
    assignment: &mut watch::Receiver<AssignmentState>,
) -> BusResult<(u64, Option<Record>)> {
    loop {
        let current = assignment.borrow_and_update().current();
        if let Some(epoch) = current {
            return Ok((epoch, None));
        }

        tokio::select! {
            message = consumer.recv() => {
                let message = message.map_err(|e| BusError::Consume(e.to_string()))?;
                let record = Record::from(&message);
                let epoch = assignment.borrow_and_update().epoch;
                return Ok((epoch, Some(record)));
            }
            changed = assignment.changed() => {
                if changed.is_err() {
                    return Err(BusError::Closed);
                }
            }
        }
    }
}

struct KafkaSession<'a> {
    consumer: &'a GroupConsumer,
    generation: u64,
}

impl GroupSession for KafkaSession<'_> {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn mark_record(&self, record: &Record) {
        let mut tpl = TopicPartitionList::new();
        let stored = tpl
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .and_then(|()| self.consumer.store_offsets(&tpl));

        if let Err(e) = stored {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to mark record"
            );
        }
    }
}

struct KafkaClaim<'a> {
    consumer: &'a GroupConsumer,
    assignment: watch::Receiver<AssignmentState>,
    epoch: u64,
    pending: Option<Record>,
    error: Option<KafkaError>,
}

#[async_trait]
impl Claim for KafkaClaim<'_> {
    async fn next_record(&mut self) -> Option<Record> {
        if let Some(record) = self.pending.take() {
            return Some(record);
        }

        let consumer = self.consumer;
        loop {
            if !self.assignment.borrow_and_update().holds(self.epoch) {
                info!(epoch = self.epoch, "Partition assignment ended, closing session");
                return None;
            }

            tokio::select! {
                message = consumer.recv() => {
                    return match message {
                        Ok(message) => Some(Record::from(&message)),
                        Err(e) => {
                            self.error = Some(e);
                            None
                        }
                    };
                }
                changed = self.assignment.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn consume(&self, topics: &[String], handler: &dyn SessionHandler) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.ensure_subscribed(topics)?;

        let mut assignment = self.assignment.clone();
        let (epoch, pending) = await_assignment(&self.consumer, &mut assignment).await?;

        let session = KafkaSession {
            consumer: &self.consumer,
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
        };
        let mut claim = KafkaClaim {
            consumer: &self.consumer,
            assignment,
            epoch,
            pending,
            error: None,
        };

        debug!(generation = session.generation, epoch, "Starting consume session");
        handler.setup(&session).await?;
        let consumed = handler.consume_claim(&session, &mut claim).await;
        handler.cleanup(&session).await?;
        consumed?;

        match claim.error {
            Some(e) => Err(BusError::Consume(e.to_string())),
            None => Ok(()),
        }
    }

    fn close(&self) -> BusResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.consumer.unsubscribe();
            info!("Kafka consumer group client closed");
        }
        Ok(())
    }
}

// =============================================================================
// Watcher fetcher
// =============================================================================

/// Single consumer used by the watcher for ad hoc tailing.
pub struct KafkaFetcher {
    consumer: StreamConsumer,
}

impl KafkaFetcher {
    pub fn new(config: &WatcherConfig) -> BusResult<Self> {
        let consumer: StreamConsumer = config
            .client_config()?
            .create()
            .map_err(BusError::Client)?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(BusError::Client)?;
        info!(topics = ?config.topics, group = %config.group, "Watcher subscribed");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl RecordFetcher for KafkaFetcher {
    async fn fetch(&self) -> BusResult<Vec<Record>> {
        match self.consumer.recv().await {
            Ok(message) => Ok(vec![Record::from(&message)]),
            Err(KafkaError::PartitionEOF(partition)) => {
                debug!(partition, "Reached end of partition");
                Ok(Vec::new())
            }
            Err(e) => Err(BusError::Fetch(e.to_string())),
        }
    }

    fn close(&self) -> BusResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::Producer;
    use serde::ser::Error as _;
    use serde::Serialize;

    fn assigned(partitions: &[(&str, i32)]) -> RebalanceEvent {
        RebalanceEvent::Assigned(
            partitions
                .iter()
                .map(|(topic, partition)| (topic.to_string(), *partition))
                .collect(),
        )
    }

    #[test]
    fn test_no_session_before_first_assignment() {
        let state = AssignmentState::default();
        assert_eq!(state.current(), None);
        assert!(!state.holds(0));
    }

    #[test]
    fn test_revoke_ends_session() {
        let mut state = AssignmentState::default();
        state.apply(assigned(&[("quorum.intake", 0)]));
        let epoch = state.current().unwrap();
        assert!(state.holds(epoch));

        state.apply(RebalanceEvent::Revoked);
        assert!(!state.holds(epoch));
        assert!(state.partitions.is_empty());
    }

    #[test]
    fn test_reassignment_of_same_partitions_starts_new_session() {
        let mut state = AssignmentState::default();
        state.apply(assigned(&[("quorum.intake", 0)]));
        let first = state.current().unwrap();

        state.apply(RebalanceEvent::Revoked);
        state.apply(assigned(&[("quorum.intake", 0)]));
        let second = state.current().unwrap();

        assert_ne!(first, second);
        assert!(!state.holds(first));
        assert!(state.holds(second));
    }

    #[test]
    fn test_partitions_sorted() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("quorum.intake", 2);
        tpl.add_partition("quorum.events", 1);
        tpl.add_partition("quorum.intake", 0);
        assert_eq!(
            partitions_of(&tpl),
            vec![
                ("quorum.events".to_string(), 1),
                ("quorum.intake".to_string(), 0),
                ("quorum.intake".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_session_observes_revoke_through_channel() {
        let (tx, mut rx) = watch::channel(AssignmentState::default());
        tx.send_modify(|state| state.apply(assigned(&[("quorum.intake", 0)])));
        let epoch = rx.borrow_and_update().current().unwrap();

        tx.send_modify(|state| state.apply(RebalanceEvent::Revoked));
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().holds(epoch));
    }

    struct Broken;

    impl Serialize for Broken {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("broken value"))
        }
    }

    #[tokio::test]
    async fn test_unencodable_async_record_reaches_error_drain() {
        // No broker is contacted: the record fails before reaching librdkafka.
        let config = ProducerConfig::new(vec!["127.0.0.1:9".to_string()]);
        let (producer, _transport) =
            Producer::with_transport(8, |sink| KafkaTransport::new(&config, sink)).unwrap();
        let errors = producer.consume_errors().unwrap();

        producer.send_async("quorum.events", Broken);
        producer.close().unwrap();

        assert_eq!(errors.join().await, 1);
    }
}
