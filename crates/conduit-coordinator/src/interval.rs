//! Interval coordinator: flushes on a timer with adaptive backoff when idle (SPEC_FULL.md §4.4).
//! Empty flushes raise the interval up to `max_interval`; a non-empty flush resets it to
//! `min_interval`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_store_core::{
    InboxCompletion, InboxFailure, NewInboxItem, NewOutboxItem, OutboxCompletion, OutboxFailure,
    PerspectiveCompletion, PerspectiveFailure, StorageError, WorkBatch,
};
use conduit_types::{ConduitError, MessageId};
use conduit_uow::{QueuedWork, WorkSink};
use tokio::task::JoinHandle;

use crate::{CoordinatorCore, WorkCoordinator};

/// Adaptive polling parameters (SPEC_FULL §8: `polling_interval_ms [100-5000 adaptive]`,
/// `idle_threshold_polls [2]`).
#[derive(Debug, Clone, Copy)]
pub struct PollingConfig {
    /// Fastest tick when there is (or was recently) work to do.
    pub min_interval: Duration,
    /// Slowest tick reached after sustained idleness.
    pub max_interval: Duration,
    /// Consecutive empty flushes tolerated at the current interval before it is doubled.
    pub idle_threshold_polls: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(5000),
            idle_threshold_polls: 2,
        }
    }
}

/// Flushes to the store on a background timer, backing off when idle.
pub struct IntervalCoordinator {
    core: Arc<CoordinatorCore>,
    disposed: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

impl IntervalCoordinator {
    /// Start ticking `core` per `polling`.
    pub fn new(core: Arc<CoordinatorCore>, polling: PollingConfig) -> Self {
        let disposed = Arc::new(AtomicBool::new(false));
        let ticker_core = core.clone();
        let ticker_disposed = disposed.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = polling.min_interval;
            let mut idle_polls = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if ticker_disposed.load(Ordering::SeqCst) {
                    break;
                }
                match ticker_core.flush_once().await {
                    Ok(batch) if batch.is_empty() && !ticker_core.has_pending().await => {
                        idle_polls += 1;
                        if idle_polls >= polling.idle_threshold_polls {
                            interval = (interval * 2).min(polling.max_interval);
                        }
                    }
                    Ok(_) => {
                        idle_polls = 0;
                        interval = polling.min_interval;
                    }
                    Err(err) => {
                        tracing::error!(?err, "interval coordinator flush failed");
                    }
                }
            }
        });
        Self { core, disposed, ticker }
    }
}

#[async_trait]
impl WorkCoordinator for IntervalCoordinator {
    async fn queue_new_outbox(&self, item: NewOutboxItem) {
        self.core.queue_new_outbox(item).await;
    }

    async fn queue_new_inbox(&self, item: NewInboxItem) {
        self.core.queue_new_inbox(item).await;
    }

    async fn queue_outbox_completion(&self, completion: OutboxCompletion) {
        self.core.queue_outbox_completion(completion).await;
    }

    async fn queue_outbox_failure(&self, failure: OutboxFailure) {
        self.core.queue_outbox_failure(failure).await;
    }

    async fn queue_inbox_completion(&self, completion: InboxCompletion) {
        self.core.queue_inbox_completion(completion).await;
    }

    async fn queue_inbox_failure(&self, failure: InboxFailure) {
        self.core.queue_inbox_failure(failure).await;
    }

    async fn queue_receptor_completion(&self, completion: InboxCompletion) {
        self.core.queue_receptor_completion(completion).await;
    }

    async fn queue_receptor_failure(&self, failure: InboxFailure) {
        self.core.queue_receptor_failure(failure).await;
    }

    async fn queue_perspective_completion(&self, completion: PerspectiveCompletion) {
        self.core.queue_perspective_completion(completion).await;
    }

    async fn queue_perspective_failure(&self, failure: PerspectiveFailure) {
        self.core.queue_perspective_failure(failure).await;
    }

    async fn renew_outbox_lease(&self, id: MessageId) {
        self.core.renew_outbox_lease(id).await;
    }

    async fn renew_inbox_lease(&self, id: MessageId, handler_name: String) {
        self.core.renew_inbox_lease(id, handler_name).await;
    }

    async fn flush(&self) -> Result<WorkBatch, StorageError> {
        self.core.flush_once().await
    }

    async fn dispose(&self) -> Result<(), StorageError> {
        self.disposed.store(true, Ordering::SeqCst);
        self.ticker.abort();
        self.core.flush_once().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkSink for IntervalCoordinator {
    async fn accept(&self, batch: QueuedWork) -> Result<(), ConduitError> {
        for item in batch.new_outbox {
            self.queue_new_outbox(item).await;
        }
        for item in batch.new_inbox {
            self.queue_new_inbox(item).await;
        }
        Ok(())
    }
}
