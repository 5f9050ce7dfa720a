//! Filtered tailing of bus topics.
//!
//! The watcher runs two loops connected by a bounded task queue: the poll loop
//! fetches records and enqueues those the matcher accepts, the task handler
//! pulls them off and invokes a [`RecordHandler`]. The queue holds at most
//! [`TASK_QUEUE_CAPACITY`] records; when it is full the poll loop waits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::WatcherConfig;
use crate::consumer::RecordHandler;
use crate::error::{BusError, BusResult};
use crate::kafka::KafkaFetcher;
use crate::record::Record;

/// Capacity of the queue between the poll loop and the task handler.
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// Source of records for a [`Watcher`].
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// Waits for the next batch. An error is fatal to the poll loop.
    async fn fetch(&self) -> BusResult<Vec<Record>>;

    fn close(&self) -> BusResult<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Watcher {
    fetcher: Arc<dyn RecordFetcher>,
    tasks: mpsc::Sender<Record>,
    pending: Mutex<Option<mpsc::Receiver<Record>>>,
    span: Span,
}

impl Watcher {
    /// Subscribes a Kafka client to the configured topics.
    pub fn connect(config: &WatcherConfig) -> BusResult<Self> {
        let fetcher = KafkaFetcher::new(config)?;
        let mut watcher = Self::new(fetcher);
        watcher.span = info_span!("watcher", group = %config.group, topics = ?config.topics);
        Ok(watcher)
    }

    pub fn new<F: RecordFetcher + 'static>(fetcher: F) -> Self {
        let (tasks, pending) = mpsc::channel(TASK_QUEUE_CAPACITY);
        Self {
            fetcher: Arc::new(fetcher),
            tasks,
            pending: Mutex::new(Some(pending)),
            span: info_span!("watcher"),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.tasks.max_capacity()
    }

    /// Records waiting for the task handler.
    pub fn queued(&self) -> usize {
        self.tasks.max_capacity() - self.tasks.capacity()
    }

    /// Polls until shutdown, enqueueing every record `matcher` accepts.
    ///
    /// Returns [`BusError::Fetch`] on the first fetch error and
    /// [`BusError::Closed`] if the task handler is gone.
    pub async fn consume_records<M>(
        &self,
        matcher: M,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusResult<()>
    where
        M: Fn(&Record) -> bool + Send + Sync,
    {
        info!(parent: &self.span, "Starting watcher poll loop");
        let mut matched: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let records = tokio::select! {
                fetched = self.fetcher.fetch() => fetched.map_err(|e| match e {
                    BusError::Fetch(_) => e,
                    other => BusError::Fetch(other.to_string()),
                })?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            for record in records {
                if !matcher(&record) {
                    continue;
                }

                tokio::select! {
                    sent = self.tasks.send(record) => {
                        sent.map_err(|_| BusError::Closed)?;
                        matched += 1;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(parent: &self.span, matched, "Shutdown while task queue full");
                            return Ok(());
                        }
                    }
                }
            }
        }

        info!(parent: &self.span, matched, "Watcher poll loop stopped");
        Ok(())
    }

    /// Spawns the task handler. Handler errors are logged and never retried.
    ///
    /// The returned task resolves to the number of records handled. Only one
    /// task handler may exist per watcher.
    pub fn start_task_handler<H>(
        &self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusResult<JoinHandle<u64>>
    where
        H: RecordHandler + 'static,
    {
        let mut pending = lock(&self.pending)
            .take()
            .ok_or(BusError::AlreadyDraining("watcher task queue"))?;

        let span = info_span!(parent: &self.span, "task_handler");
        Ok(tokio::spawn(
            async move {
                let mut handled: u64 = 0;
                loop {
                    let record = tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        record = pending.recv() => match record {
                            Some(record) => record,
                            None => break,
                        },
                    };

                    if let Err(e) = handler.handle(&record).await {
                        warn!(
                            topic = %record.topic,
                            offset = record.offset,
                            error = %e,
                            "Task handler failed"
                        );
                    }
                    handled += 1;
                }
                debug!(handled, "Task handler stopped");
                handled
            }
            .instrument(span),
        ))
    }

    pub fn close(&self) -> BusResult<()> {
        self.fetcher.close()?;
        info!(parent: &self.span, "Watcher closed");
        Ok(())
    }
}
