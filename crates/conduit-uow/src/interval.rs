//! Interval strategy: a background timer flushes accumulated messages every `interval_ms`.
//! Disposal drains whatever remains and stops the timer (SPEC_FULL.md §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::{LifecycleStage, QueuedItem, QueuedWork, UnitId, UnitOfWork, UowError, WorkSink};

struct Shared {
    sink: Arc<dyn WorkSink>,
    buffer: Mutex<QueuedWork>,
    disposed: AtomicBool,
}

impl Shared {
    async fn drain_and_flush(&self) -> Result<(), UowError> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        self.sink.accept(batch).await.map_err(UowError::Sink)
    }
}

/// Buffers queued messages and flushes them on a fixed timer, independent of individual
/// `queue`/`flush` calls.
pub struct IntervalUnitOfWork {
    shared: Arc<Shared>,
    ticker: JoinHandle<()>,
}

impl IntervalUnitOfWork {
    /// Start flushing `sink` every `interval`.
    pub fn new(sink: Arc<dyn WorkSink>, interval: Duration) -> Self {
        let shared = Arc::new(Shared { sink, buffer: Mutex::new(QueuedWork::default()), disposed: AtomicBool::new(false) });
        let ticker_shared = shared.clone();
        let ticker = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                if ticker_shared.disposed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = ticker_shared.drain_and_flush().await {
                    tracing::error!(?err, "interval unit-of-work flush failed");
                }
            }
        });
        Self { shared, ticker }
    }
}

#[async_trait]
impl UnitOfWork for IntervalUnitOfWork {
    async fn queue(&self, item: QueuedItem, _stage: Option<LifecycleStage>) -> Result<UnitId, UowError> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(UowError::Disposed);
        }
        let unit_id = UnitId::new();
        self.shared.buffer.lock().await.push(item);
        Ok(unit_id)
    }

    async fn cancel(&self, _unit_id: UnitId) -> Result<(), UowError> {
        // The interval strategy buffers messages from many units together; it cannot selectively
        // discard one unit's contribution once queued, only the whole pending buffer (which
        // `dispose` does). Per-unit cancellation before a tick is therefore not supported here.
        Ok(())
    }

    async fn flush(&self, _unit_id: UnitId) -> Result<(), UowError> {
        self.shared.drain_and_flush().await
    }

    async fn dispose(&self) -> Result<(), UowError> {
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.ticker.abort();
        self.shared.drain_and_flush().await
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
    async fn flushes_on_timer() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let uow = IntervalUnitOfWork::new(sink.clone(), Duration::from_millis(20));
        uow.queue(QueuedItem::Inbox(sample_inbox()), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sink.0.lock().unwrap().is_empty());
        uow.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn dispose_drains_remaining_buffer() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let uow = IntervalUnitOfWork::new(sink.clone(), Duration::from_secs(60));
        uow.queue(QueuedItem::Inbox(sample_inbox()), None).await.unwrap();
        uow.dispose().await.unwrap();

        let flushed = sink.0.lock().unwrap();
        assert_eq!(flushed.iter().map(|b| b.new_inbox.len()).sum::<usize>(), 1);
    }
}
