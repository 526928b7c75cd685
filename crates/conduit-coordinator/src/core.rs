//! Shared plumbing behind all three coordinator strategies: a queue buffer, the channels that
//! feed newly claimed work straight to waiting workers, and the single call into
//! [`WorkCoordinatorStore::process_work_batch`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_store_core::{
    CallerIdentity, InboxCompletion, InboxFailure, InboxRecord, NewInboxItem, NewOutboxItem,
    OutboxCompletion, OutboxFailure, OutboxRecord, PerspectiveCheckpoint, PerspectiveCompletion,
    PerspectiveFailure, StorageError, WorkBatch, WorkBatchRequest, WorkCoordinatorStore,
};
use conduit_types::MessageId;
use tokio::sync::{mpsc, Mutex};

/// Static parameters of the work-batch round trip (SPEC_FULL.md §8 configuration surface).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of hash buckets.
    pub partition_count: u32,
    /// Per-instance cap on claimed partitions.
    pub max_partitions_per_instance: u32,
    /// Lease lifetime, in seconds.
    pub lease_seconds: i64,
    /// Instance-liveness window, in seconds.
    pub stale_threshold_seconds: i64,
    /// Max items per claim.
    pub batch_size: u32,
    /// Attach extra telemetry to every round trip.
    pub debug_mode: bool,
}

/// Downstream channels that newly claimed work is written to directly, eliminating a polling
/// round trip for locally produced work (SPEC_FULL §4.4).
pub struct CoordinatorChannels {
    pub(crate) outbox_tx: mpsc::Sender<OutboxRecord>,
    pub(crate) inbox_tx: mpsc::Sender<InboxRecord>,
    pub(crate) perspective_tx: mpsc::Sender<PerspectiveCheckpoint>,
}

/// The worker-facing halves of [`CoordinatorChannels`], handed out once at construction time.
pub struct CoordinatorReceivers {
    /// Outbox work claimed by this instance.
    pub outbox_rx: mpsc::Receiver<OutboxRecord>,
    /// Inbox work claimed by this instance.
    pub inbox_rx: mpsc::Receiver<InboxRecord>,
    /// Perspective checkpoints claimed by this instance.
    pub perspective_rx: mpsc::Receiver<PerspectiveCheckpoint>,
}

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone)]
struct PendingQueues {
    outbox_completions: Vec<OutboxCompletion>,
    outbox_failures: Vec<OutboxFailure>,
    inbox_completions: Vec<InboxCompletion>,
    inbox_failures: Vec<InboxFailure>,
    receptor_completions: Vec<InboxCompletion>,
    receptor_failures: Vec<InboxFailure>,
    perspective_completions: Vec<PerspectiveCompletion>,
    perspective_failures: Vec<PerspectiveFailure>,
    new_outbox: Vec<NewOutboxItem>,
    new_inbox: Vec<NewInboxItem>,
    renew_outbox_lease_ids: Vec<MessageId>,
    renew_inbox_lease_ids: Vec<(MessageId, String)>,
}

impl PendingQueues {
    fn is_empty(&self) -> bool {
        self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.receptor_completions.is_empty()
            && self.receptor_failures.is_empty()
            && self.perspective_completions.is_empty()
            && self.perspective_failures.is_empty()
            && self.new_outbox.is_empty()
            && self.new_inbox.is_empty()
            && self.renew_outbox_lease_ids.is_empty()
            && self.renew_inbox_lease_ids.is_empty()
    }

    /// Merge `other` back into `self` — used to restore drained items that failed to flush,
    /// without discarding anything queued concurrently while the failed round trip was in flight.
    fn extend(&mut self, other: PendingQueues) {
        self.outbox_completions.extend(other.outbox_completions);
        self.outbox_failures.extend(other.outbox_failures);
        self.inbox_completions.extend(other.inbox_completions);
        self.inbox_failures.extend(other.inbox_failures);
        self.receptor_completions.extend(other.receptor_completions);
        self.receptor_failures.extend(other.receptor_failures);
        self.perspective_completions.extend(other.perspective_completions);
        self.perspective_failures.extend(other.perspective_failures);
        self.new_outbox.extend(other.new_outbox);
        self.new_inbox.extend(other.new_inbox);
        self.renew_outbox_lease_ids.extend(other.renew_outbox_lease_ids);
        self.renew_inbox_lease_ids.extend(other.renew_inbox_lease_ids);
    }
}

/// Shared state behind every coordinator strategy.
pub struct CoordinatorCore {
    store: Arc<dyn WorkCoordinatorStore>,
    identity: CallerIdentity,
    config: CoordinatorConfig,
    queues: Mutex<PendingQueues>,
    channels: CoordinatorChannels,
    /// Clock override for deterministic tests; `None` uses wall-clock time.
    pub now_override: Option<DateTime<Utc>>,
}

impl CoordinatorCore {
    /// Build a coordinator core, returning the worker-facing channel receivers alongside it.
    pub fn new(store: Arc<dyn WorkCoordinatorStore>, identity: CallerIdentity, config: CoordinatorConfig) -> (Self, CoordinatorReceivers) {
        let (outbox_tx, outbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (perspective_tx, perspective_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let core = Self {
            store,
            identity,
            config,
            queues: Mutex::new(PendingQueues::default()),
            channels: CoordinatorChannels { outbox_tx, inbox_tx, perspective_tx },
            now_override: None,
        };
        (core, CoordinatorReceivers { outbox_rx, inbox_rx, perspective_rx })
    }

    pub async fn queue_new_outbox(&self, item: NewOutboxItem) {
        self.queues.lock().await.new_outbox.push(item);
    }

    pub async fn queue_new_inbox(&self, item: NewInboxItem) {
        self.queues.lock().await.new_inbox.push(item);
    }

    pub async fn queue_outbox_completion(&self, c: OutboxCompletion) {
        self.queues.lock().await.outbox_completions.push(c);
    }

    pub async fn queue_outbox_failure(&self, f: OutboxFailure) {
        self.queues.lock().await.outbox_failures.push(f);
    }

    pub async fn queue_inbox_completion(&self, c: InboxCompletion) {
        self.queues.lock().await.inbox_completions.push(c);
    }

    pub async fn queue_inbox_failure(&self, f: InboxFailure) {
        self.queues.lock().await.inbox_failures.push(f);
    }

    pub async fn queue_receptor_completion(&self, c: InboxCompletion) {
        self.queues.lock().await.receptor_completions.push(c);
    }

    pub async fn queue_receptor_failure(&self, f: InboxFailure) {
        self.queues.lock().await.receptor_failures.push(f);
    }

    pub async fn queue_perspective_completion(&self, c: PerspectiveCompletion) {
        self.queues.lock().await.perspective_completions.push(c);
    }

    pub async fn queue_perspective_failure(&self, f: PerspectiveFailure) {
        self.queues.lock().await.perspective_failures.push(f);
    }

    pub async fn renew_outbox_lease(&self, id: MessageId) {
        self.queues.lock().await.renew_outbox_lease_ids.push(id);
    }

    pub async fn renew_inbox_lease(&self, id: MessageId, handler: String) {
        self.queues.lock().await.renew_inbox_lease_ids.push((id, handler));
    }

    /// True if nothing is currently buffered.
    pub async fn has_pending(&self) -> bool {
        !self.queues.lock().await.is_empty()
    }

    /// Drain the buffer, call `process_work_batch`, and push newly claimed work into the
    /// downstream channels. Returns the claimed batch so the caller (typically a worker loop
    /// that itself called `flush`) can also act on it inline.
    pub async fn flush_once(&self) -> Result<WorkBatch, StorageError> {
        let drained = {
            let mut guard = self.queues.lock().await;
            std::mem::take(&mut *guard)
        };

        let request = WorkBatchRequest {
            identity: self.identity.clone(),
            outbox_completions: drained.outbox_completions.clone(),
            outbox_failures: drained.outbox_failures.clone(),
            inbox_completions: drained.inbox_completions.clone(),
            inbox_failures: drained.inbox_failures.clone(),
            receptor_completions: drained.receptor_completions.clone(),
            receptor_failures: drained.receptor_failures.clone(),
            perspective_completions: drained.perspective_completions.clone(),
            perspective_failures: drained.perspective_failures.clone(),
            new_outbox: drained.new_outbox.clone(),
            new_inbox: drained.new_inbox.clone(),
            renew_outbox_lease_ids: drained.renew_outbox_lease_ids.clone(),
            renew_inbox_lease_ids: drained.renew_inbox_lease_ids.clone(),
            partition_count: self.config.partition_count,
            max_partitions_per_instance: self.config.max_partitions_per_instance,
            lease_seconds: self.config.lease_seconds,
            stale_threshold_seconds: self.config.stale_threshold_seconds,
            batch_size: self.config.batch_size,
            debug_mode: self.config.debug_mode,
            now: self.now_override,
        };

        // On failure, restore the drained items rather than let `?` drop them — a transient
        // store error must not silently lose domain events or inbox rows a caller already
        // considers durable (SPEC_FULL.md §4.2/§7).
        let batch = match self.store.process_work_batch(request).await {
            Ok(batch) => batch,
            Err(err) => {
                self.queues.lock().await.extend(drained);
                return Err(err);
            }
        };

        for item in batch.outbox_work.iter().cloned() {
            if self.channels.outbox_tx.try_send(item).is_err() {
                tracing::warn!("outbox work channel full or closed, item dropped from fan-out (still leased in store)");
            }
        }
        for item in batch.inbox_work.iter().cloned() {
            if self.channels.inbox_tx.try_send(item).is_err() {
                tracing::warn!("inbox work channel full or closed, item dropped from fan-out (still leased in store)");
            }
        }
        for item in batch.perspective_work.iter().cloned() {
            if self.channels.perspective_tx.try_send(item).is_err() {
                tracing::warn!("perspective work channel full or closed, item dropped from fan-out (still leased in store)");
            }
        }

        Ok(batch)
    }
}
