//! Reliable publishing with a synchronous and a buffered path.
//!
//! A [`Producer`] owns one [`Transport`] (or none, when messaging is disabled)
//! and the receiving ends of two delivery report channels. Outcomes of
//! [`Producer::send_async`] are only visible through those channels, so the
//! owner is expected to start [`Producer::consume_successes`] and
//! [`Producer::consume_errors`] once per producer. Reports that arrive while
//! nobody drains them are dropped with a warning once the channel is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::ProducerConfig;
use crate::encoder::JsonEncoder;
use crate::error::{BusError, BusResult};
use crate::kafka::KafkaTransport;
use crate::record::{Delivered, DeliveryFailure, OutboundRecord};

/// The client side of a bus connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands a record to the buffered path without waiting.
    ///
    /// The outcome is reported through the [`DeliverySink`] the transport was
    /// built with.
    fn enqueue(&self, record: OutboundRecord);

    /// Publishes a record and waits for the broker's acknowledgment.
    async fn deliver(&self, record: OutboundRecord) -> BusResult<Delivered>;

    /// Flushes buffered records and releases every client handle.
    fn close(&self) -> BusResult<()>;
}

/// Sending side of the delivery report channels, owned by the transport.
#[derive(Debug, Clone)]
pub struct DeliverySink {
    successes: mpsc::Sender<Delivered>,
    errors: mpsc::Sender<DeliveryFailure>,
}

impl DeliverySink {
    pub fn success(&self, delivered: Delivered) {
        if let Err(e) = self.successes.try_send(delivered) {
            warn!(error = %e, "Dropping delivery success report");
        }
    }

    pub fn failure(&self, failure: DeliveryFailure) {
        if let Err(e) = self.errors.try_send(failure) {
            match e {
                mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => {
                    error!(topic = %f.topic, error = %f.error, "Dropping delivery failure report");
                }
            }
        }
    }
}

struct DeliveryReports {
    successes: Mutex<Option<mpsc::Receiver<Delivered>>>,
    errors: Mutex<Option<mpsc::Receiver<DeliveryFailure>>>,
}

fn delivery_channels(capacity: usize) -> (DeliverySink, DeliveryReports) {
    let (successes_tx, successes_rx) = mpsc::channel(capacity.max(1));
    let (errors_tx, errors_rx) = mpsc::channel(capacity.max(1));
    (
        DeliverySink {
            successes: successes_tx,
            errors: errors_tx,
        },
        DeliveryReports {
            successes: Mutex::new(Some(successes_rx)),
            errors: Mutex::new(Some(errors_rx)),
        },
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes values to the bus.
pub struct Producer {
    transport: Option<Arc<dyn Transport>>,
    reports: DeliveryReports,
    closed: AtomicBool,
    span: Span,
}

impl Producer {
    /// Connects to Kafka, or returns a disabled producer when `config` lists no
    /// brokers.
    pub fn connect(config: &ProducerConfig) -> BusResult<Self> {
        if !config.is_enabled() {
            warn!("No brokers configured, messaging is disabled");
            return Ok(Self::disabled());
        }

        let (producer, _transport) = Self::with_transport(config.report_capacity, |sink| {
            KafkaTransport::new(config, sink)
        })?;
        Ok(producer)
    }

    /// A producer that logs and discards everything.
    pub fn disabled() -> Self {
        let (_sink, reports) = delivery_channels(1);
        Self {
            transport: None,
            reports,
            closed: AtomicBool::new(false),
            span: info_span!("producer", enabled = false),
        }
    }

    /// Builds a producer around a custom transport.
    ///
    /// `build` receives the sink the transport must report buffered outcomes
    /// to. The transport is returned alongside the producer so callers can
    /// keep a typed handle to it.
    pub fn with_transport<T, F>(report_capacity: usize, build: F) -> BusResult<(Self, Arc<T>)>
    where
        T: Transport + 'static,
        F: FnOnce(DeliverySink) -> BusResult<T>,
    {
        let (sink, reports) = delivery_channels(report_capacity);
        let transport = Arc::new(build(sink)?);
        let producer = Self {
            transport: Some(Arc::clone(&transport) as Arc<dyn Transport>),
            reports,
            closed: AtomicBool::new(false),
            span: info_span!("producer", enabled = true),
        };
        Ok((producer, transport))
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    fn open_transport(&self) -> BusResult<Option<&Arc<dyn Transport>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(self.transport.as_ref())
    }

    /// Fire-and-forget publish. Never blocks the caller.
    pub fn send_async<T>(&self, topic: &str, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.publish_async(topic, None, value);
    }

    /// Fire-and-forget publish with a partitioning key.
    pub fn send_async_keyed<T>(&self, topic: &str, key: impl Into<String>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.publish_async(topic, Some(key.into()), value);
    }

    fn publish_async<T>(&self, topic: &str, key: Option<String>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let _entered = self.span.enter();
        match self.open_transport() {
            Ok(Some(transport)) => transport.enqueue(OutboundRecord {
                topic: topic.to_string(),
                key,
                value: Box::new(JsonEncoder::new(value)),
            }),
            Ok(None) => debug!(topic, "Messaging disabled, skipping async publish"),
            Err(e) => error!(topic, error = %e, "Async publish after close"),
        }
    }

    /// Publishes and waits for the broker's acknowledgment.
    ///
    /// Returns `Ok(None)` when messaging is disabled.
    pub async fn send<T>(&self, topic: &str, value: T) -> BusResult<Option<Delivered>>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.send_keyed(topic, None, value).await
    }

    pub async fn send_keyed<T>(
        &self,
        topic: &str,
        key: Option<String>,
        value: T,
    ) -> BusResult<Option<Delivered>>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let Some(transport) = self.open_transport()? else {
            debug!(parent: &self.span, topic, "Messaging disabled, skipping publish");
            return Ok(None);
        };

        let record = OutboundRecord {
            topic: topic.to_string(),
            key,
            value: Box::new(JsonEncoder::new(value)),
        };
        let delivered = transport
            .deliver(record)
            .instrument(self.span.clone())
            .await?;
        debug!(
            parent: &self.span,
            topic = %delivered.topic,
            partition = delivered.partition,
            offset = delivered.offset,
            "Record acknowledged"
        );
        Ok(Some(delivered))
    }

    /// Starts the task draining success reports from the buffered path.
    ///
    /// Must be called from within a tokio runtime. Only one drain may exist per
    /// producer.
    pub fn consume_successes(&self) -> BusResult<DrainHandle> {
        let rx = lock(&self.reports.successes)
            .take()
            .ok_or(BusError::AlreadyDraining("success reports"))?;

        Ok(spawn_drain(
            rx,
            info_span!(parent: &self.span, "drain_successes"),
            |delivered: &Delivered| {
                info!(
                    topic = %delivered.topic,
                    partition = delivered.partition,
                    offset = delivered.offset,
                    "Message delivered"
                );
            },
        ))
    }

    /// Starts the task draining failure reports from the buffered path.
    pub fn consume_errors(&self) -> BusResult<DrainHandle> {
        let rx = lock(&self.reports.errors)
            .take()
            .ok_or(BusError::AlreadyDraining("failure reports"))?;

        Ok(spawn_drain(
            rx,
            info_span!(parent: &self.span, "drain_errors"),
            |failure: &DeliveryFailure| {
                error!(topic = %failure.topic, error = %failure.error, "Message delivery failed");
            },
        ))
    }

    /// Flushes and releases the transport. Later calls are no-ops.
    pub fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _entered = self.span.enter();
        match &self.transport {
            Some(transport) => {
                transport.close()?;
                info!("Producer closed");
            }
            None => debug!("Disabled producer closed"),
        }
        Ok(())
    }
}

/// Handle to a background delivery report drain.
///
/// Dropping the handle detaches the task; it keeps draining until the
/// producer is closed.
pub struct DrainHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl DrainHandle {
    /// Waits for the drain to finish, which happens once the producer is
    /// closed and every buffered report has been consumed. Returns the number
    /// of reports drained.
    pub async fn join(self) -> u64 {
        match self.handle.await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Delivery report drain task failed");
                0
            }
        }
    }

    /// Stops draining without waiting for the producer to close.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        self.join().await
    }
}

fn spawn_drain<T, F>(mut rx: mpsc::Receiver<T>, span: Span, on_report: F) -> DrainHandle
where
    T: Send + 'static,
    F: Fn(&T) + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(
        async move {
            let mut drained: u64 = 0;
            let mut watching = true;

            loop {
                tokio::select! {
                    biased;
                    report = rx.recv() => match report {
                        Some(report) => {
                            on_report(&report);
                            drained += 1;
                        }
                        None => break,
                    },
                    changed = shutdown_rx.changed(), if watching => match changed {
                        Ok(()) if *shutdown_rx.borrow() => break,
                        Ok(()) => {}
                        // Handle dropped: keep draining until the channel closes.
                        Err(_) => watching = false,
                    },
                }
            }

            debug!(drained, "Delivery report drain stopped");
            drained
        }
        .instrument(span),
    );

    DrainHandle { shutdown, handle }
}
