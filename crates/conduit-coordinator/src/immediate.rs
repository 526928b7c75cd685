//! Immediate coordinator: flushes to the store on every queue call (SPEC_FULL.md §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_store_core::{
    InboxCompletion, InboxFailure, NewInboxItem, NewOutboxItem, OutboxCompletion, OutboxFailure,
    PerspectiveCompletion, PerspectiveFailure, StorageError, WorkBatch,
};
use conduit_types::{ConduitError, MessageId};
use conduit_uow::{QueuedWork, WorkSink};

use crate::{CoordinatorCore, WorkCoordinator};

/// Flushes every queued item to the store immediately, one round trip per call.
pub struct ImmediateCoordinator {
    core: Arc<CoordinatorCore>,
    disposed: AtomicBool,
}

impl ImmediateCoordinator {
    /// Wrap `core` with the immediate-flush policy.
    pub fn new(core: Arc<CoordinatorCore>) -> Self {
        Self { core, disposed: AtomicBool::new(false) }
    }

    async fn flush_and_log(&self) {
        if let Err(err) = self.core.flush_once().await {
            tracing::error!(?err, "immediate coordinator flush failed; drained items were restored to the queue for the next attempt");
        }
    }
}

#[async_trait]
impl WorkCoordinator for ImmediateCoordinator {
    async fn queue_new_outbox(&self, item: NewOutboxItem) {
        self.core.queue_new_outbox(item).await;
        self.flush_and_log().await;
    }

    async fn queue_new_inbox(&self, item: NewInboxItem) {
        self.core.queue_new_inbox(item).await;
        self.flush_and_log().await;
    }

    async fn queue_outbox_completion(&self, completion: OutboxCompletion) {
        self.core.queue_outbox_completion(completion).await;
        self.flush_and_log().await;
    }

    async fn queue_outbox_failure(&self, failure: OutboxFailure) {
        self.core.queue_outbox_failure(failure).await;
        self.flush_and_log().await;
    }

    async fn queue_inbox_completion(&self, completion: InboxCompletion) {
        self.core.queue_inbox_completion(completion).await;
        self.flush_and_log().await;
    }

    async fn queue_inbox_failure(&self, failure: InboxFailure) {
        self.core.queue_inbox_failure(failure).await;
        self.flush_and_log().await;
    }

    async fn queue_receptor_completion(&self, completion: InboxCompletion) {
        self.core.queue_receptor_completion(completion).await;
        self.flush_and_log().await;
    }

    async fn queue_receptor_failure(&self, failure: InboxFailure) {
        self.core.queue_receptor_failure(failure).await;
        self.flush_and_log().await;
    }

    async fn queue_perspective_completion(&self, completion: PerspectiveCompletion) {
        self.core.queue_perspective_completion(completion).await;
        self.flush_and_log().await;
    }

    async fn queue_perspective_failure(&self, failure: PerspectiveFailure) {
        self.core.queue_perspective_failure(failure).await;
        self.flush_and_log().await;
    }

    async fn renew_outbox_lease(&self, id: MessageId) {
        self.core.renew_outbox_lease(id).await;
        self.flush_and_log().await;
    }

    async fn renew_inbox_lease(&self, id: MessageId, handler_name: String) {
        self.core.renew_inbox_lease(id, handler_name).await;
        self.flush_and_log().await;
    }

    async fn flush(&self) -> Result<WorkBatch, StorageError> {
        self.core.flush_once().await
    }

    async fn dispose(&self) -> Result<(), StorageError> {
        self.disposed.store(true, Ordering::SeqCst);
        self.core.flush_once().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkSink for ImmediateCoordinator {
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
