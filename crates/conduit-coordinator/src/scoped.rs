//! Scoped coordinator: buffers until the caller explicitly ends the scope (typically the end of
//! one handler invocation), then flushes once (SPEC_FULL.md §4.4).

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

/// Buffers queued items until [`ScopedCoordinator::end_scope`] (or [`WorkCoordinator::dispose`])
/// is called, then flushes once.
pub struct ScopedCoordinator {
    core: Arc<CoordinatorCore>,
    disposed: AtomicBool,
}

impl ScopedCoordinator {
    /// Wrap `core` with the scope-end-flush policy.
    pub fn new(core: Arc<CoordinatorCore>) -> Self {
        Self { core, disposed: AtomicBool::new(false) }
    }

    /// End the current scope: flush whatever is buffered (a no-op round trip is still made, so
    /// the caller's heartbeat and lease renewals land even if nothing new was queued).
    pub async fn end_scope(&self) -> Result<WorkBatch, StorageError> {
        self.core.flush_once().await
    }
}

#[async_trait]
impl WorkCoordinator for ScopedCoordinator {
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
        self.core.flush_once().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkSink for ScopedCoordinator {
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
