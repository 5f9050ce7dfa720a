//! Consumer group controller with at-least-once delivery.
//!
//! A [`ConsumerGroup`] repeatedly joins a consumer group through a
//! [`GroupClient`]. Each join is a session: the client calls the
//! [`SessionHandler`] lifecycle hooks, and [`GroupHandler`] hands every record
//! of the session's claim to the worker before marking it processed. A record
//! is marked whether or not the worker succeeded, so a failing worker never
//! stalls a partition.
//!
//! The loop:
//! 1. Reset readiness if the previous session signalled it
//! 2. Consume one session until it ends (rebalance) or fails
//! 3. On failure, log and wait `retry_backoff`
//! 4. Exit when the shutdown channel flips to `true`

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, info_span, instrument, warn, Instrument, Span};

use crate::config::ConsumerGroupConfig;
use crate::error::{BusError, BusResult};
use crate::kafka::KafkaGroupClient;
use crate::record::Record;

/// Processes a single record. Errors are logged by the caller and the record
/// is still marked.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: RecordHandler + ?Sized> RecordHandler for Arc<H> {
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        (**self).handle(record).await
    }
}

/// Adapts an async closure into a [`RecordHandler`].
pub struct FnHandler<F>(F);

/// Wraps `f` so it can be used wherever a [`RecordHandler`] is expected.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        (self.0)(record.clone()).await
    }
}

/// One membership generation of the consumer group.
pub trait GroupSession: Send + Sync {
    fn generation(&self) -> u64;

    /// Records `record` as processed so its offset is committed.
    fn mark_record(&self, record: &Record);
}

/// The stream of records assigned to this member for one session.
#[async_trait]
pub trait Claim: Send {
    /// Returns the next record, or `None` once the session is over.
    async fn next_record(&mut self) -> Option<Record>;
}

/// Lifecycle hooks invoked by a [`GroupClient`] for every session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn setup(&self, session: &dyn GroupSession) -> BusResult<()>;

    async fn cleanup(&self, session: &dyn GroupSession) -> BusResult<()>;

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn Claim,
    ) -> BusResult<()>;
}

/// Consumer group membership.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Joins the group for `topics` and runs one session to completion.
    async fn consume(&self, topics: &[String], handler: &dyn SessionHandler) -> BusResult<()>;

    /// Leaves the group and releases the client.
    fn close(&self) -> BusResult<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ReadinessState {
    sender: Option<oneshot::Sender<()>>,
    receiver: Option<oneshot::Receiver<()>>,
}

/// One-shot "ready" signal, re-armed between sessions.
struct Readiness {
    state: Mutex<ReadinessState>,
}

impl Readiness {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            state: Mutex::new(ReadinessState {
                sender: Some(sender),
                receiver: Some(receiver),
            }),
        }
    }

    /// Fires the current signal. Later calls in the same session are no-ops.
    fn signal(&self) {
        if let Some(sender) = lock(&self.state).sender.take() {
            let _ = sender.send(());
        }
    }

    /// Arms a fresh signal once the current one has fired.
    fn reset_if_signalled(&self) {
        let mut state = lock(&self.state);
        if state.sender.is_none() {
            let (sender, receiver) = oneshot::channel();
            state.sender = Some(sender);
            state.receiver = Some(receiver);
        }
    }

    fn take_receiver(&self) -> Option<oneshot::Receiver<()>> {
        lock(&self.state).receiver.take()
    }
}

/// Session handler feeding every claimed record to a worker.
pub struct GroupHandler {
    worker: Arc<dyn RecordHandler>,
    readiness: Arc<Readiness>,
    span: Span,
}

#[async_trait]
impl SessionHandler for GroupHandler {
    async fn setup(&self, session: &dyn GroupSession) -> BusResult<()> {
        debug!(parent: &self.span, generation = session.generation(), "Session started");
        self.readiness.signal();
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> BusResult<()> {
        debug!(parent: &self.span, generation = session.generation(), "Session ended");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn Claim,
    ) -> BusResult<()> {
        while let Some(record) = claim.next_record().await {
            let handled = self
                .worker
                .handle(&record)
                .instrument(self.span.clone())
                .await;

            if let Err(e) = handled {
                warn!(
                    parent: &self.span,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Worker failed to process record"
                );
            }
            session.mark_record(&record);
        }
        Ok(())
    }
}

/// Long-running consumer group member.
pub struct ConsumerGroup<C> {
    client: C,
    topics: Vec<String>,
    handler: GroupHandler,
    readiness: Arc<Readiness>,
    retry_backoff: Duration,
    closed: AtomicBool,
}

impl ConsumerGroup<KafkaGroupClient> {
    /// Creates a Kafka-backed member for the configured group and topics.
    pub fn connect<H>(config: &ConsumerGroupConfig, worker: H) -> BusResult<Self>
    where
        H: RecordHandler + 'static,
    {
        let client = KafkaGroupClient::new(config)?;
        Ok(Self::new(
            client,
            config.topics.clone(),
            worker,
            config.retry_backoff,
        )
        .with_span(info_span!("consumer_group", group_id = %config.group_id)))
    }
}

impl<C: GroupClient> ConsumerGroup<C> {
    pub fn new<H>(client: C, topics: Vec<String>, worker: H, retry_backoff: Duration) -> Self
    where
        H: RecordHandler + 'static,
    {
        let readiness = Arc::new(Readiness::new());
        Self {
            client,
            topics,
            handler: GroupHandler {
                worker: Arc::new(worker),
                readiness: Arc::clone(&readiness),
                span: info_span!("consumer_group"),
            },
            readiness,
            retry_backoff,
            closed: AtomicBool::new(false),
        }
    }

    fn with_span(mut self, span: Span) -> Self {
        self.handler.span = span;
        self
    }

    /// Receiver that resolves once the current session is set up.
    ///
    /// Only one owner may wait per session; returns `None` if the receiver was
    /// already taken.
    pub fn ready(&self) -> Option<oneshot::Receiver<()>> {
        self.readiness.take_receiver()
    }

    /// Consumes sessions until the shutdown signal is received.
    #[instrument(skip(self, shutdown), name = "consumer_group", fields(topics = ?self.topics))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BusResult<()> {
        info!("Starting consumer group");

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping consumer group");
                break;
            }
            if self.closed.load(Ordering::Acquire) {
                info!("Consumer group closed, stopping");
                break;
            }

            self.readiness.reset_if_signalled();

            let consumed = tokio::select! {
                consumed = self.client.consume(&self.topics, &self.handler) => consumed,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received during session");
                        break;
                    }
                    continue;
                }
            };

            match consumed {
                Ok(()) => debug!("Session finished, rejoining"),
                Err(BusError::Closed) => {
                    info!("Consumer group client closed, stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?self.retry_backoff, "Consume session failed");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("Shutdown signal received during backoff");
                                break;
                            }
                        }
                        _ = sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Releases the client. Later calls are no-ops.
    pub fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.close()?;
        info!(parent: &self.handler.span, "Consumer group closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn record(offset: i64) -> Record {
        Record {
            topic: "intake".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: Some(format!("{{\"n\":{offset}}}").into_bytes()),
            timestamp_ms: None,
        }
    }

    struct VecClaim(VecDeque<Record>);

    #[async_trait]
    impl Claim for VecClaim {
        async fn next_record(&mut self) -> Option<Record> {
            self.0.pop_front()
        }
    }

    struct FakeSession<'a> {
        generation: u64,
        marked: &'a Mutex<Vec<i64>>,
    }

    impl GroupSession for FakeSession<'_> {
        fn generation(&self) -> u64 {
            self.generation
        }

        fn mark_record(&self, record: &Record) {
            lock(self.marked).push(record.offset);
        }
    }

    /// Plays back scripted sessions, then idles until shut down.
    #[derive(Default)]
    struct FakeClient {
        sessions: Mutex<VecDeque<Result<Vec<Record>, String>>>,
        marked: Mutex<Vec<i64>>,
        generation: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeClient {
        fn scripted(sessions: Vec<Result<Vec<Record>, String>>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl GroupClient for FakeClient {
        async fn consume(&self, _topics: &[String], handler: &dyn SessionHandler) -> BusResult<()> {
            let next = lock(&self.sessions).pop_front();
            let records = match next {
                Some(Ok(records)) => records,
                Some(Err(reason)) => return Err(BusError::Consume(reason)),
                None => std::future::pending().await,
            };

            let session = FakeSession {
                generation: self.generation.fetch_add(1, Ordering::SeqCst) as u64 + 1,
                marked: &self.marked,
            };
            let mut claim = VecClaim(records.into());
            handler.setup(&session).await?;
            handler.consume_claim(&session, &mut claim).await?;
            handler.cleanup(&session).await
        }

        fn close(&self) -> BusResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_worker(
        seen: Arc<AtomicUsize>,
        fail_offset: i64,
    ) -> impl RecordHandler + 'static {
        handler_fn(move |record: Record| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if record.offset == fail_offset {
                    anyhow::bail!("cannot process offset {}", record.offset);
                }
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    async fn run_until_marked(group: Arc<ConsumerGroup<FakeClient>>, expected: usize) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run(shutdown_rx).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while lock(&group.client.marked).len() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_records_marked_despite_worker_errors() {
        let seen = Arc::new(AtomicUsize::new(0));
        let client = FakeClient::scripted(vec![Ok(vec![record(0), record(1), record(2)])]);
        let group = Arc::new(ConsumerGroup::new(
            client,
            vec!["intake".to_string()],
            counting_worker(Arc::clone(&seen), 1),
            Duration::from_millis(10),
        ));

        run_until_marked(Arc::clone(&group), 3).await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(*lock(&group.client.marked), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_session_is_retried() {
        let seen = Arc::new(AtomicUsize::new(0));
        let client = FakeClient::scripted(vec![
            Err("coordinator not available".to_string()),
            Ok(vec![record(7)]),
        ]);
        let group = Arc::new(ConsumerGroup::new(
            client,
            vec!["intake".to_string()],
            counting_worker(Arc::clone(&seen), -1),
            Duration::from_millis(10),
        ));

        run_until_marked(Arc::clone(&group), 1).await;

        assert_eq!(*lock(&group.client.marked), vec![7]);
        assert_eq!(group.client.generation.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_fires_on_setup() {
        let client = FakeClient::scripted(vec![Ok(vec![record(0)])]);
        let group = Arc::new(ConsumerGroup::new(
            client,
            vec!["intake".to_string()],
            handler_fn(|_record: Record| async { Ok::<(), anyhow::Error>(()) }),
            Duration::from_millis(10),
        ));

        let ready = group.ready().unwrap();
        assert!(group.ready().is_none());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run(shutdown_rx).await })
        };

        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_readiness_rearmed_between_sessions() {
        let client = FakeClient::scripted(vec![Ok(vec![record(0)]), Ok(vec![record(1)])]);
        let group = Arc::new(ConsumerGroup::new(
            client,
            vec!["intake".to_string()],
            handler_fn(|_record: Record| async { Ok::<(), anyhow::Error>(()) }),
            Duration::from_millis(10),
        ));
        let first = group.ready().unwrap();

        run_until_marked(Arc::clone(&group), 2).await;

        first.await.unwrap();
        assert!(group.ready().is_some());
    }

    #[tokio::test]
    async fn test_close_releases_client_once() {
        let group = ConsumerGroup::new(
            FakeClient::default(),
            vec!["intake".to_string()],
            handler_fn(|_record: Record| async { Ok::<(), anyhow::Error>(()) }),
            Duration::from_millis(10),
        );

        group.close().unwrap();
        group.close().unwrap();
        assert_eq!(group.client.closes.load(Ordering::SeqCst), 1);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        group.run(shutdown_rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_idle() {
        let group = Arc::new(ConsumerGroup::new(
            FakeClient::default(),
            vec!["intake".to_string()],
            handler_fn(|_record: Record| async { Ok::<(), anyhow::Error>(()) }),
            Duration::from_millis(10),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
