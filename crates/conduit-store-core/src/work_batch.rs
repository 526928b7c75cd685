//! Inputs and outputs of the work-batch procedure (SPEC_FULL.md §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conduit_types::{InstanceId, MessageId, StatusFlags, StreamId};

use crate::records::{InboxRecord, OutboxRecord, PerspectiveCheckpoint};

/// A completion reported against an outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxCompletion {
    /// The row being completed.
    pub message_id: MessageId,
    /// Status bits to OR into the row's existing `status_flags`.
    pub status_flags: StatusFlags,
}

/// A failure reported against an outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxFailure {
    /// The row being failed.
    pub message_id: MessageId,
    /// Status bits that *did* accumulate before the failure (partial progress).
    pub partial_status_flags: StatusFlags,
    /// Human-readable error detail.
    pub error: String,
    /// Whether the retry budget is exhausted — if true, `Failed` is set permanently; otherwise
    /// the row's lease is simply released so another instance can retry.
    pub terminal: bool,
}

/// A completion reported against an inbox row. Used for both the bare "inbox row stored/claimed"
/// completions and the "receptor ran to completion" completions from C5 — the latter additionally
/// set `mark_processed`, which causes a dedup row to be written in the same transaction (see
/// DESIGN.md for the reasoning).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxCompletion {
    /// The row being completed.
    pub message_id: MessageId,
    /// The handler this completion applies to.
    pub handler_name: String,
    /// Status bits to OR into the row's existing `status_flags`.
    pub status_flags: StatusFlags,
    /// If true, also record `(message_id, handler_name)` in the dedup table.
    pub mark_processed: bool,
}

/// A failure reported against an inbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxFailure {
    /// The row being failed.
    pub message_id: MessageId,
    /// The handler this failure applies to.
    pub handler_name: String,
    /// Status bits that did accumulate before the failure.
    pub partial_status_flags: StatusFlags,
    /// Human-readable error detail.
    pub error: String,
    /// Whether the retry budget is exhausted.
    pub terminal: bool,
}

/// A completion reported against a perspective checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveCompletion {
    /// The stream being projected.
    pub stream_id: StreamId,
    /// The perspective name.
    pub perspective_name: String,
    /// The new checkpoint position. Must be `>=` the row's current value (monotonicity,
    /// SPEC_FULL §8 property 7).
    pub last_processed_event_id: MessageId,
}

/// A failure reported against a perspective checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveFailure {
    /// The stream being projected.
    pub stream_id: StreamId,
    /// The perspective name.
    pub perspective_name: String,
    /// The checkpoint position reached before the failure, if any events in this batch did
    /// apply successfully.
    pub partial_last_processed_event_id: Option<MessageId>,
    /// Human-readable error detail.
    pub error: String,
}

/// A brand-new outbox row to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxItem {
    /// Pre-assigned message id (so the caller can correlate before the row is visible). If
    /// `None`, the store assigns a fresh one.
    pub message_id: Option<MessageId>,
    /// Transport destination.
    pub destination: String,
    /// Stable wire-contract identifier for the payload type.
    pub message_type: String,
    /// JSON-encoded payload.
    pub payload: Value,
    /// Free-form metadata.
    pub metadata: Value,
    /// Logical scope this row was queued under.
    pub scope: Option<String>,
    /// The stream this row's envelope is ordered against, if any.
    pub stream_id: Option<StreamId>,
    /// True if this row's envelope is a durably-appended domain event.
    pub carries_event: bool,
    /// Earliest time this row becomes claimable.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// A brand-new inbox row to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInboxItem {
    /// The received envelope's id.
    pub message_id: MessageId,
    /// The receptor this row is destined for.
    pub handler_name: String,
    /// Stable wire-contract identifier for the payload type.
    pub message_type: String,
    /// JSON-encoded payload.
    pub payload: Value,
    /// Free-form metadata.
    pub metadata: Value,
    /// The stream this row's envelope is ordered against, if any.
    pub stream_id: Option<StreamId>,
    /// Earliest time this row becomes claimable.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Caller identity attached to every work-batch round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// The calling instance's id.
    pub instance_id: InstanceId,
    /// Logical service name.
    pub service_name: String,
    /// Hostname.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
}

/// Everything the work-batch procedure needs for one round trip (SPEC_FULL §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkBatchRequest {
    /// Caller identity (upserted into the service-instance table).
    pub identity: CallerIdentity,

    /// Outbox completions to apply.
    pub outbox_completions: Vec<OutboxCompletion>,
    /// Outbox failures to apply.
    pub outbox_failures: Vec<OutboxFailure>,
    /// Inbox completions to apply.
    pub inbox_completions: Vec<InboxCompletion>,
    /// Inbox failures to apply.
    pub inbox_failures: Vec<InboxFailure>,
    /// Receptor-dispatch completions (inbox rows, typically with `mark_processed = true`).
    pub receptor_completions: Vec<InboxCompletion>,
    /// Receptor-dispatch failures.
    pub receptor_failures: Vec<InboxFailure>,
    /// Perspective checkpoint completions to apply.
    pub perspective_completions: Vec<PerspectiveCompletion>,
    /// Perspective checkpoint failures to apply.
    pub perspective_failures: Vec<PerspectiveFailure>,

    /// New outbox rows to insert.
    pub new_outbox: Vec<NewOutboxItem>,
    /// New inbox rows to insert.
    pub new_inbox: Vec<NewInboxItem>,

    /// Outbox row ids whose lease should be renewed (only takes effect if owned by the caller).
    pub renew_outbox_lease_ids: Vec<MessageId>,
    /// Inbox row keys whose lease should be renewed.
    pub renew_inbox_lease_ids: Vec<(MessageId, String)>,

    /// Number of hash buckets.
    pub partition_count: u32,
    /// Per-instance cap on claimed partitions.
    pub max_partitions_per_instance: u32,
    /// Lease lifetime, in seconds.
    pub lease_seconds: i64,
    /// Instance-liveness window, in seconds.
    pub stale_threshold_seconds: i64,
    /// Max items per claim (applied independently to outbox, inbox, and perspective work).
    pub batch_size: u32,
    /// Attach extra telemetry to this round trip (implementation-defined; surfaced via tracing).
    pub debug_mode: bool,

    /// Clock override for deterministic tests. `None` means "use wall-clock `Utc::now()`".
    pub now: Option<DateTime<Utc>>,
}

impl WorkBatchRequest {
    /// An empty request that only renews the caller's heartbeat and claims work — the shape a
    /// worker sends on an idle tick with nothing queued locally.
    pub fn heartbeat_only(identity: CallerIdentity, partition_count: u32, max_partitions_per_instance: u32, lease_seconds: i64, stale_threshold_seconds: i64, batch_size: u32) -> Self {
        Self {
            identity,
            outbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_completions: Vec::new(),
            inbox_failures: Vec::new(),
            receptor_completions: Vec::new(),
            receptor_failures: Vec::new(),
            perspective_completions: Vec::new(),
            perspective_failures: Vec::new(),
            new_outbox: Vec::new(),
            new_inbox: Vec::new(),
            renew_outbox_lease_ids: Vec::new(),
            renew_inbox_lease_ids: Vec::new(),
            partition_count,
            max_partitions_per_instance,
            lease_seconds,
            stale_threshold_seconds,
            batch_size,
            debug_mode: false,
            now: None,
        }
    }
}

/// The work newly claimed by this round trip (SPEC_FULL §4.2 step 11).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkBatch {
    /// Outbox rows now leased by the caller.
    pub outbox_work: Vec<OutboxRecord>,
    /// Inbox rows now leased by the caller.
    pub inbox_work: Vec<InboxRecord>,
    /// Perspective checkpoints now leased by the caller.
    pub perspective_work: Vec<PerspectiveCheckpoint>,
}

impl WorkBatch {
    /// True if nothing was claimed.
    pub fn is_empty(&self) -> bool {
        self.outbox_work.is_empty() && self.inbox_work.is_empty() && self.perspective_work.is_empty()
    }
}
