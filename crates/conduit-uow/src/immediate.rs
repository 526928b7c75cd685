//! Immediate strategy: every [`UnitOfWork::queue`] call flushes synchronously. One message, one
//! unit — the lowest-latency, highest-overhead strategy (SPEC_FULL.md §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{QueuedItem, QueuedWork, UnitId, UnitOfWork, UowError, WorkSink};

/// Flushes every queued message immediately, synchronously, one at a time.
pub struct ImmediateUnitOfWork {
    sink: Arc<dyn WorkSink>,
    disposed: AtomicBool,
}

impl ImmediateUnitOfWork {
    /// Build a unit of work that flushes straight through to `sink`.
    pub fn new(sink: Arc<dyn WorkSink>) -> Self {
        Self { sink, disposed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl UnitOfWork for ImmediateUnitOfWork {
    async fn queue(&self, item: QueuedItem, _stage: Option<crate::LifecycleStage>) -> Result<UnitId, UowError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UowError::Disposed);
        }
        let unit_id = UnitId::new();
        let mut batch = QueuedWork::default();
        batch.push(item);
        self.sink.accept(batch).await.map_err(UowError::Sink)?;
        Ok(unit_id)
    }

    async fn cancel(&self, _unit_id: UnitId) -> Result<(), UowError> {
        // Every unit has already flushed by the time `queue` returns; cancellation of a flushed
        // unit is a no-op per SPEC_FULL §4.3.
        Ok(())
    }

    async fn flush(&self, _unit_id: UnitId) -> Result<(), UowError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), UowError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_store_core::NewInboxItem;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<QueuedWork>>);

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
    async fn each_queue_call_flushes_separately() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let uow = ImmediateUnitOfWork::new(sink.clone());

        let a = uow.queue(QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        let b = uow.queue(QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disposed_uow_rejects_queueing() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let uow = ImmediateUnitOfWork::new(sink);
        uow.dispose().await.unwrap();
        let err = uow.queue(QueuedItem::Inbox(sample_inbox()), None).await.unwrap_err();
        assert_eq!(err, UowError::Disposed);
    }
}
