#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-stream-processor** – The Ordered Stream Processor (SPEC_FULL.md §4.5).
//!
//! Given a batch of claimed work items, each carrying an optional `StreamId`, groups them by
//! stream, processes each group strictly in `MessageId` order (serially within the group), and
//! runs groups concurrently across streams (bounded by a worker count) unless told to serialise
//! everything. A failure aborts only the remainder of its own stream — later items in other
//! streams are unaffected, matching the "stream-local failure cascade" invariant.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_types::{MessageId, StreamId};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Implemented by anything the stream processor can order and group: outbox rows, inbox rows, and
/// any application-defined claimed-work shape.
pub trait StreamItem {
    /// The stream this item is ordered against, or `None` for the null-stream group.
    fn stream_id(&self) -> Option<StreamId>;
    /// This item's time-ordered identifier, used to sort within a stream group.
    fn message_id(&self) -> MessageId;
}

impl StreamItem for conduit_store_core::OutboxRecord {
    fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl StreamItem for conduit_store_core::InboxRecord {
    fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// Carries the status bits that *did* accumulate before a `process` call failed, so the caller can
/// report partial progress (e.g. `Stored` even though `EventStored` never completed).
#[derive(Debug, Clone)]
pub struct StreamProcessorError<S> {
    /// Status reached before the failure.
    pub partial_status: S,
    /// Human-readable error detail.
    pub error: String,
}

impl<S> StreamProcessorError<S> {
    /// Construct an error carrying the given partial status and message.
    pub fn new(partial_status: S, error: impl Into<String>) -> Self {
        Self { partial_status, error: error.into() }
    }
}

/// The outcome of attempting to process one item. Items that were never attempted (because an
/// earlier item in the same stream failed, or cancellation stopped the group before they started)
/// do not appear here at all — they remain leased and are re-offered on the next claim.
#[derive(Debug, Clone)]
pub struct ProcessOutcome<S> {
    /// The item's identifier.
    pub message_id: MessageId,
    /// The item's stream, if any.
    pub stream_id: Option<StreamId>,
    /// `Ok` on success, `Err` with partial status on failure.
    pub result: Result<S, StreamProcessorError<S>>,
}

/// Group `items` by stream, process each group in ascending `MessageId` order, and return one
/// [`ProcessOutcome`] per item actually attempted.
///
/// `process` is invoked at most once per item, strictly after the previous item in the same
/// stream has completed (successfully or not); a failure aborts the remainder of its stream
/// without affecting other streams. When `parallelize_streams` is true, distinct stream groups run
/// concurrently, bounded by `max_concurrency`; otherwise groups run one at a time. Honors
/// `cancellation`: no new item starts once the token is cancelled, but an already-started item
/// runs to completion. Empty input returns immediately.
pub async fn process_ordered<T, S, F, Fut>(
    items: Vec<T>,
    parallelize_streams: bool,
    max_concurrency: usize,
    cancellation: CancellationToken,
    process: F,
) -> Vec<ProcessOutcome<S>>
where
    T: StreamItem + Send + 'static,
    S: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<S, StreamProcessorError<S>>> + Send + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }

    let mut groups: HashMap<Option<StreamId>, Vec<T>> = HashMap::new();
    for item in items {
        groups.entry(item.stream_id()).or_default().push(item);
    }
    for group in groups.values_mut() {
        group.sort_by_key(StreamItem::message_id);
    }

    if !parallelize_streams {
        let mut outcomes = Vec::new();
        for group in groups.into_values() {
            outcomes.extend(process_group(group, cancellation.clone(), process.clone()).await);
        }
        return outcomes;
    }

    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::new();
    for group in groups.into_values() {
        let semaphore = semaphore.clone();
        let process = process.clone();
        let cancellation = cancellation.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("stream-processor semaphore never closes");
            process_group(group, cancellation, process).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(group_outcomes) => outcomes.extend(group_outcomes),
            Err(join_err) => tracing::error!(?join_err, "stream group task panicked"),
        }
    }
    outcomes
}

async fn process_group<T, S, F, Fut>(group: Vec<T>, cancellation: CancellationToken, process: F) -> Vec<ProcessOutcome<S>>
where
    T: StreamItem,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Result<S, StreamProcessorError<S>>>,
{
    let mut outcomes = Vec::with_capacity(group.len());
    for item in group {
        if cancellation.is_cancelled() {
            break;
        }
        let message_id = item.message_id();
        let stream_id = item.stream_id();
        match process(item).await {
            Ok(status) => outcomes.push(ProcessOutcome { message_id, stream_id, result: Ok(status) }),
            Err(err) => {
                outcomes.push(ProcessOutcome { message_id, stream_id, result: Err(err) });
                break;
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Clone)]
    struct Item {
        stream_id: Option<StreamId>,
        message_id: MessageId,
        fail: bool,
    }

    impl StreamItem for Item {
        fn stream_id(&self) -> Option<StreamId> {
            self.stream_id
        }

        fn message_id(&self) -> MessageId {
            self.message_id
        }
    }

    fn item(stream: StreamId, fail: bool) -> Item {
        Item { stream_id: Some(stream), message_id: MessageId::new(), fail }
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let outcomes: Vec<ProcessOutcome<()>> =
            process_ordered(Vec::<Item>::new(), true, 4, CancellationToken::new(), |_: Item| async { Ok(()) }).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn failure_aborts_remainder_of_its_own_stream_only() {
        let stream_a = StreamId(Uuid::from_u128(1));
        let stream_b = StreamId(Uuid::from_u128(2));

        let a1 = item(stream_a, false);
        let a2 = item(stream_a, true);
        let a3 = item(stream_a, false);
        let b1 = item(stream_b, false);

        let attempted = Arc::new(Mutex::new(Vec::new()));
        let attempted_clone = attempted.clone();

        let outcomes = process_ordered(vec![a1.clone(), a2.clone(), a3.clone(), b1.clone()], true, 4, CancellationToken::new(), move |i: Item| {
            let attempted = attempted_clone.clone();
            async move {
                attempted.lock().unwrap().push(i.message_id);
                if i.fail {
                    Err(StreamProcessorError::new((), "boom"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let attempted = attempted.lock().unwrap();
        assert!(attempted.contains(&a1.message_id));
        assert!(attempted.contains(&a2.message_id));
        assert!(!attempted.contains(&a3.message_id), "a3 must not run after a2 failed in the same stream");
        assert!(attempted.contains(&b1.message_id), "stream b is independent of stream a's failure");

        let stream_a_outcomes: Vec<_> = outcomes.iter().filter(|o| o.stream_id == Some(stream_a)).collect();
        assert_eq!(stream_a_outcomes.len(), 2);
        assert!(stream_a_outcomes[1].result.is_err());
    }

    #[tokio::test]
    async fn groups_process_in_message_id_order() {
        let stream = StreamId(Uuid::from_u128(3));
        let mut items = vec![item(stream, false), item(stream, false), item(stream, false)];
        items.sort_by_key(|i| std::cmp::Reverse(i.message_id));
        let expected_order: Vec<MessageId> = {
            let mut ids: Vec<_> = items.iter().map(|i| i.message_id).collect();
            ids.sort();
            ids
        };

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        process_ordered(items, false, 1, CancellationToken::new(), move |i: Item| {
            let order = order_clone.clone();
            async move {
                order.lock().unwrap().push(i.message_id);
                Ok::<(), StreamProcessorError<()>>(())
            }
        })
        .await;

        assert_eq!(*order.lock().unwrap(), expected_order);
    }

    #[tokio::test]
    async fn cancellation_stops_new_items_but_lets_started_ones_finish() {
        let stream = StreamId(Uuid::from_u128(4));
        let items = vec![item(stream, false), item(stream, false)];
        let token = CancellationToken::new();
        token.cancel();

        let attempted = Arc::new(Mutex::new(0usize));
        let attempted_clone = attempted.clone();
        let outcomes = process_ordered(items, false, 1, token, move |_: Item| {
            let attempted = attempted_clone.clone();
            async move {
                *attempted.lock().unwrap() += 1;
                Ok::<(), StreamProcessorError<()>>(())
            }
        })
        .await;

        assert_eq!(outcomes.len(), 0);
        assert_eq!(*attempted.lock().unwrap(), 0);
    }
}
