//! Scoped strategy: one `ScopedUnitOfWork` instance represents one logical scope (typically a
//! single handler invocation). All messages queued against it accumulate into one unit keyed by a
//! single UUIDv7; the buffer flushes on scope disposal. Empty scopes never flush
//! (SPEC_FULL.md §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{LifecycleStage, QueuedWork, UnitId, UnitOfWork, UowError, WorkSink};

/// Buffers every message queued within one scope into a single unit, flushed on disposal.
pub struct ScopedUnitOfWork {
    sink: Arc<dyn WorkSink>,
    unit_id: UnitId,
    buffer: Mutex<QueuedWork>,
    flushed: AtomicBool,
    disposed: AtomicBool,
}

impl ScopedUnitOfWork {
    /// Open a new scope. The returned unit's id is fixed for the lifetime of this instance.
    pub fn new(sink: Arc<dyn WorkSink>) -> Self {
        Self {
            sink,
            unit_id: UnitId::new(),
            buffer: Mutex::new(QueuedWork::default()),
            flushed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// This scope's unit id.
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    async fn flush_buffer(&self) -> Result<(), UowError> {
        if self.flushed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            // Empty scopes do not flush.
            return Ok(());
        }
        self.flushed.store(true, Ordering::SeqCst);
        self.sink.accept(batch).await.map_err(UowError::Sink)
    }
}

#[async_trait]
impl UnitOfWork for ScopedUnitOfWork {
    async fn queue(&self, item: crate::QueuedItem, _stage: Option<LifecycleStage>) -> Result<UnitId, UowError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UowError::Disposed);
        }
        if self.flushed.load(Ordering::SeqCst) {
            return Err(UowError::Disposed);
        }
        self.buffer.lock().await.push(item);
        Ok(self.unit_id)
    }

    async fn cancel(&self, unit_id: UnitId) -> Result<(), UowError> {
        if unit_id != self.unit_id {
            return Err(UowError::UnknownUnit);
        }
        if self.flushed.load(Ordering::SeqCst) {
            // Cancellation of a flushed unit is a no-op.
            return Ok(());
        }
        *self.buffer.lock().await = QueuedWork::default();
        Ok(())
    }

    async fn flush(&self, unit_id: UnitId) -> Result<(), UowError> {
        if unit_id != self.unit_id {
            return Err(UowError::UnknownUnit);
        }
        self.flush_buffer().await
    }

    async fn dispose(&self) -> Result<(), UowError> {
        self.flush_buffer().await?;
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_store_core::NewInboxItem;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<QueuedWork>>);

    #[async_trait]
    impl WorkSink for RecordingSink {
        async fn accept(&self, batch: QueuedWork) -> Result<(), conduit_types::ConduitError> {
            self.0.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn sample_inbox() -> NewInboxItem {
        NewInboxItem {
            message_id: conduit_types::MessageId::new(),
            handler_name: "h".into(),
            message_type: "test".into(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            stream_id: None,
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn scope_accumulates_then_flushes_once_on_dispose() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let uow = ScopedUnitOfWork::new(sink.clone());

        let unit_a = uow.queue(crate::QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        let unit_b = uow.queue(crate::QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        assert_eq!(unit_a, unit_b);
        assert!(sink.0.lock().unwrap().is_empty());

        uow.dispose().await.unwrap();
        let flushed = sink.0.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].new_inbox.len(), 2);
    }

    #[tokio::test]
    async fn empty_scope_never_flushes() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let uow = ScopedUnitOfWork::new(sink.clone());
        uow.dispose().await.unwrap();
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_discards_unflushed_buffer() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let uow = ScopedUnitOfWork::new(sink.clone());
        let unit_id = uow.queue(crate::QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        uow.cancel(unit_id).await.unwrap();
        uow.dispose().await.unwrap();
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
