//! `process_work_batch` for [`crate::MemoryStore`] — a single-threaded reference rendering of
//! SPEC_FULL.md §4.2's eleven-step procedure.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use conduit_store_core::{
    InboxRecord, OutboxRecord, PartitionAssignment, PerspectiveCheckpoint, PerspectiveStatus,
    ServiceInstanceRecord, StorageError, WorkBatch, WorkBatchRequest, WorkCoordinatorStore,
};
use conduit_types::{MessageId, PartitionNumber, StatusFlags, StreamId};

use crate::{MemoryStore, State};

fn outbox_claimable(row: &OutboxRecord, now: DateTime<Utc>) -> bool {
    row.status_flags.contains(StatusFlags::STORED)
        && !row.is_terminal()
        && row.lease_expiry.map_or(true, |expiry| expiry <= now)
        && row.scheduled_for.map_or(true, |scheduled| scheduled <= now)
}

fn inbox_claimable(row: &InboxRecord, now: DateTime<Utc>) -> bool {
    row.status_flags.contains(StatusFlags::STORED)
        && !row.is_terminal()
        && row.lease_expiry.map_or(true, |expiry| expiry <= now)
        && row.scheduled_for.map_or(true, |scheduled| scheduled <= now)
}

/// The earliest (by `message_id`, which is time-ordered) non-terminal outbox row per stream is
/// the only one eligible for claiming — this is what gives the stream processor serial-per-stream
/// delivery without a separate sequencing step.
fn earliest_unresolved_per_stream(state: &State) -> HashMap<StreamId, MessageId> {
    let mut earliest: HashMap<StreamId, MessageId> = HashMap::new();
    for row in state.outbox.values() {
        let Some(stream_id) = row.stream_id else { continue };
        if row.is_terminal() {
            continue;
        }
        earliest
            .entry(stream_id)
            .and_modify(|current| {
                if row.message_id < *current {
                    *current = row.message_id;
                }
            })
            .or_insert(row.message_id);
    }
    earliest
}

fn partition_has_claimable_work(state: &State, partition: PartitionNumber, now: DateTime<Utc>) -> bool {
    state
        .outbox
        .values()
        .any(|row| row.partition_number == partition && outbox_claimable(row, now))
        || state
            .inbox
            .values()
            .any(|row| row.partition_number == partition && inbox_claimable(row, now))
        || state.checkpoints.values().any(|checkpoint| {
            checkpoint.partition_number == partition && checkpoint_claimable(checkpoint, state, now)
        })
}

fn checkpoint_claimable(checkpoint: &PerspectiveCheckpoint, state: &State, now: DateTime<Utc>) -> bool {
    if checkpoint.lease_expiry.map_or(false, |expiry| expiry > now) {
        return false;
    }
    let last_event_id = state
        .events
        .get(&checkpoint.stream_id)
        .and_then(|records| records.last())
        .map(|record| record.envelope.message_id);
    match (checkpoint.last_processed_event_id, last_event_id) {
        (_, None) => false,
        (Some(processed), Some(last)) => processed < last,
        (None, Some(_)) => true,
    }
}

#[async_trait]
impl WorkCoordinatorStore for MemoryStore {
    async fn process_work_batch(&self, request: WorkBatchRequest) -> Result<WorkBatch, StorageError> {
        let now = request.now.unwrap_or_else(Utc::now);
        let lease_duration = Duration::seconds(request.lease_seconds);
        let stale_threshold = Duration::seconds(request.stale_threshold_seconds);
        let caller = request.identity.instance_id;

        let mut state = self.state.lock().await;

        // Step 1: upsert the caller's liveness record.
        state
            .instances
            .entry(caller)
            .and_modify(|instance| instance.last_heartbeat_at = now)
            .or_insert(ServiceInstanceRecord {
                instance_id: caller,
                service_name: request.identity.service_name.clone(),
                host_name: request.identity.host_name.clone(),
                process_id: request.identity.process_id,
                started_at: now,
                last_heartbeat_at: now,
            });

        // Step 2: apply outbox completions.
        for completion in &request.outbox_completions {
            if let Some(row) = state.outbox.get_mut(&completion.message_id) {
                row.status_flags |= completion.status_flags;
                row.processed_at = Some(now);
                if row.is_terminal() {
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
        }

        // Step 3: apply outbox failures. A terminal failure sets `Failed` and clears the lease
        // immediately; a transient one just records the error and leaves the lease to expire on
        // its own schedule, so another instance only picks it up once the lease window elapses.
        for failure in &request.outbox_failures {
            if let Some(row) = state.outbox.get_mut(&failure.message_id) {
                row.status_flags |= failure.partial_status_flags;
                row.error = Some(failure.error.clone());
                row.attempts += 1;
                row.processed_at = Some(now);
                if failure.terminal {
                    row.status_flags |= StatusFlags::FAILED;
                    row.failure_reason = Some(failure.error.clone());
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
        }

        // Step 4: apply inbox + receptor completions (unified — see DESIGN.md).
        for completion in request.inbox_completions.iter().chain(request.receptor_completions.iter()) {
            let key = (completion.message_id, completion.handler_name.clone());
            if let Some(row) = state.inbox.get_mut(&key) {
                row.status_flags |= completion.status_flags;
                row.processed_at = Some(now);
                if row.is_terminal() {
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
            if completion.mark_processed {
                state.dedup.entry(key.clone()).or_insert_with(|| conduit_store_core::DedupRecord {
                    message_id: completion.message_id,
                    handler_name: completion.handler_name.clone(),
                    processed_at: now,
                });
            }
        }

        // Step 5: apply inbox + receptor failures.
        for failure in request.inbox_failures.iter().chain(request.receptor_failures.iter()) {
            let key = (failure.message_id, failure.handler_name.clone());
            if let Some(row) = state.inbox.get_mut(&key) {
                row.status_flags |= failure.partial_status_flags;
                row.error = Some(failure.error.clone());
                row.attempts += 1;
                row.processed_at = Some(now);
                if failure.terminal {
                    row.status_flags |= StatusFlags::FAILED;
                    row.failure_reason = Some(failure.error.clone());
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
        }

        // Step 6: apply perspective completions/failures.
        for completion in &request.perspective_completions {
            let key = (completion.stream_id, completion.perspective_name.clone());
            if let Some(checkpoint) = state.checkpoints.get_mut(&key) {
                checkpoint.last_processed_event_id = Some(completion.last_processed_event_id);
                checkpoint.processed_at = Some(now);
                checkpoint.error = None;
                let caught_up = state
                    .events
                    .get(&completion.stream_id)
                    .and_then(|records| records.last())
                    .map(|record| record.envelope.message_id == completion.last_processed_event_id)
                    .unwrap_or(false);
                checkpoint.status = if caught_up { PerspectiveStatus::Caught } else { PerspectiveStatus::Pending };
                checkpoint.instance_id = None;
                checkpoint.lease_expiry = None;
            }
        }
        for failure in &request.perspective_failures {
            let key = (failure.stream_id, failure.perspective_name.clone());
            if let Some(checkpoint) = state.checkpoints.get_mut(&key) {
                if let Some(partial) = failure.partial_last_processed_event_id {
                    checkpoint.last_processed_event_id = Some(partial);
                }
                checkpoint.error = Some(failure.error.clone());
                checkpoint.status = PerspectiveStatus::Failed;
                checkpoint.processed_at = Some(now);
                checkpoint.instance_id = None;
                checkpoint.lease_expiry = None;
            }
        }

        // Step 7: insert new outbox/inbox rows.
        for item in request.new_outbox {
            let message_id = item.message_id.unwrap_or_else(MessageId::new);
            let partition_number = item
                .stream_id
                .map(|stream_id| PartitionNumber::of(stream_id, request.partition_count))
                .unwrap_or(PartitionNumber(0));
            let mut status_flags = StatusFlags::STORED;
            if item.carries_event {
                status_flags |= StatusFlags::EVENT_STORED;
            }
            state.outbox.insert(
                message_id,
                OutboxRecord {
                    message_id,
                    destination: item.destination,
                    message_type: item.message_type,
                    payload: item.payload,
                    metadata: item.metadata,
                    scope: item.scope,
                    attempts: 0,
                    error: None,
                    failure_reason: None,
                    created_at: now,
                    published_at: None,
                    processed_at: None,
                    instance_id: None,
                    lease_expiry: None,
                    stream_id: item.stream_id,
                    partition_number,
                    status_flags,
                    carries_event: item.carries_event,
                    scheduled_for: item.scheduled_for,
                },
            );
        }
        for item in request.new_inbox {
            let partition_number = item
                .stream_id
                .map(|stream_id| PartitionNumber::of(stream_id, request.partition_count))
                .unwrap_or(PartitionNumber(0));
            // `or_insert_with` — matches the Postgres backend's `ON CONFLICT (message_id,
            // handler_name) DO NOTHING`. An existing row (in flight, leased, or already
            // terminal) must never be clobbered by a redelivered envelope.
            state.inbox.entry((item.message_id, item.handler_name.clone())).or_insert_with(|| InboxRecord {
                message_id: item.message_id,
                handler_name: item.handler_name,
                message_type: item.message_type,
                payload: item.payload,
                metadata: item.metadata,
                attempts: 0,
                error: None,
                failure_reason: None,
                created_at: now,
                processed_at: None,
                instance_id: None,
                lease_expiry: None,
                stream_id: item.stream_id,
                partition_number,
                status_flags: StatusFlags::STORED,
                scheduled_for: item.scheduled_for,
            });
        }

        // Step 8: renew leases the caller still owns.
        for message_id in &request.renew_outbox_lease_ids {
            if let Some(row) = state.outbox.get_mut(message_id) {
                if row.instance_id == Some(caller) {
                    row.lease_expiry = Some(now + lease_duration);
                }
            }
        }
        for (message_id, handler_name) in &request.renew_inbox_lease_ids {
            if let Some(row) = state.inbox.get_mut(&(*message_id, handler_name.clone())) {
                if row.instance_id == Some(caller) {
                    row.lease_expiry = Some(now + lease_duration);
                }
            }
        }

        // Step 9: reclaim partitions held by instances that have gone stale.
        let stale: Vec<PartitionNumber> = state
            .partitions
            .values()
            .filter(|assignment| {
                state
                    .instances
                    .get(&assignment.instance_id)
                    .map(|instance| !instance.is_alive(now, stale_threshold))
                    .unwrap_or(true)
            })
            .map(|assignment| assignment.partition_number)
            .collect();
        for partition in stale {
            state.partitions.remove(&partition);
        }

        // Step 10: claim additional partitions for the caller, up to its cap, preferring the
        // lowest-numbered unclaimed partition that actually has claimable work.
        let mut owned: usize = state
            .partitions
            .values()
            .filter(|assignment| assignment.instance_id == caller)
            .count();
        let mut partition = 0u32;
        while owned < request.max_partitions_per_instance as usize && partition < request.partition_count {
            let candidate = PartitionNumber(partition);
            partition += 1;
            if state.partitions.contains_key(&candidate) {
                continue;
            }
            if !partition_has_claimable_work(&state, candidate, now) {
                continue;
            }
            state.partitions.insert(
                candidate,
                PartitionAssignment {
                    partition_number: candidate,
                    instance_id: caller,
                    assigned_at: now,
                    last_heartbeat: now,
                },
            );
            owned += 1;
        }
        for assignment in state.partitions.values_mut() {
            if assignment.instance_id == caller {
                assignment.last_heartbeat = now;
            }
        }

        let owned_partitions: HashSet<PartitionNumber> = state
            .partitions
            .values()
            .filter(|assignment| assignment.instance_id == caller)
            .map(|assignment| assignment.partition_number)
            .collect();

        // Step 11a: lazily create perspective checkpoints for streams whose event types are newly
        // associated with a perspective this service maintains.
        let stream_ids: Vec<StreamId> = state.events.keys().copied().collect();
        for stream_id in stream_ids {
            let event_types: HashSet<String> = state.events[&stream_id]
                .iter()
                .map(|record| record.event_type.clone())
                .collect();
            for (event_type, perspective_name) in self.associations.pairs() {
                if !event_types.contains(event_type) {
                    continue;
                }
                let key = (stream_id, perspective_name.to_string());
                if state.checkpoints.contains_key(&key) {
                    continue;
                }
                let partition_number = PartitionNumber::of(stream_id, request.partition_count);
                state.checkpoints.insert(
                    key,
                    PerspectiveCheckpoint {
                        stream_id,
                        perspective_name: perspective_name.to_string(),
                        last_processed_event_id: None,
                        status: PerspectiveStatus::Pending,
                        processed_at: None,
                        error: None,
                        instance_id: None,
                        lease_expiry: None,
                        partition_number,
                    },
                );
            }
        }

        // Step 11b: select and lease claimable outbox rows, honouring the stream-ordering guard.
        let earliest_unresolved = earliest_unresolved_per_stream(&state);
        let mut outbox_work = Vec::new();
        let candidate_ids: Vec<MessageId> = state
            .outbox
            .values()
            .filter(|row| owned_partitions.contains(&row.partition_number) && outbox_claimable(row, now))
            .filter(|row| match row.stream_id {
                None => true,
                Some(stream_id) => earliest_unresolved.get(&stream_id) == Some(&row.message_id),
            })
            .map(|row| row.message_id)
            .collect();
        for message_id in candidate_ids.into_iter().take(request.batch_size as usize) {
            if let Some(row) = state.outbox.get_mut(&message_id) {
                row.instance_id = Some(caller);
                row.lease_expiry = Some(now + lease_duration);
                outbox_work.push(row.clone());
            }
        }

        // Step 11c: select and lease claimable inbox rows. No stream-ordering guard: receptors
        // may run out of order across different inbound messages.
        let mut inbox_work = Vec::new();
        let candidate_keys: Vec<(MessageId, String)> = state
            .inbox
            .values()
            .filter(|row| owned_partitions.contains(&row.partition_number) && inbox_claimable(row, now))
            .map(|row| (row.message_id, row.handler_name.clone()))
            .collect();
        for key in candidate_keys.into_iter().take(request.batch_size as usize) {
            if let Some(row) = state.inbox.get_mut(&key) {
                row.instance_id = Some(caller);
                row.lease_expiry = Some(now + lease_duration);
                inbox_work.push(row.clone());
            }
        }

        // Step 11d: select and lease claimable perspective checkpoints.
        let mut perspective_work = Vec::new();
        let candidate_checkpoints: Vec<(StreamId, String)> = state
            .checkpoints
            .values()
            .filter(|checkpoint| {
                owned_partitions.contains(&checkpoint.partition_number) && checkpoint_claimable(checkpoint, &state, now)
            })
            .map(|checkpoint| (checkpoint.stream_id, checkpoint.perspective_name.clone()))
            .collect();
        for key in candidate_checkpoints.into_iter().take(request.batch_size as usize) {
            if let Some(checkpoint) = state.checkpoints.get_mut(&key) {
                checkpoint.instance_id = Some(caller);
                checkpoint.lease_expiry = Some(now + lease_duration);
                checkpoint.status = PerspectiveStatus::InProgress;
                perspective_work.push(checkpoint.clone());
            }
        }

        if request.debug_mode {
            tracing::debug!(
                instance_id = %caller,
                outbox_claimed = outbox_work.len(),
                inbox_claimed = inbox_work.len(),
                perspectives_claimed = perspective_work.len(),
                "process_work_batch round trip"
            );
        }

        Ok(WorkBatch { outbox_work, inbox_work, perspective_work })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use conduit_store_core::{CallerIdentity, NewOutboxItem, StorageBackend, WorkBatchRequest};
    use conduit_types::{Envelope, MessageAssociationTable, StreamId};

    use crate::MemoryStore;

    fn identity(instance: InstanceId) -> CallerIdentity {
        CallerIdentity { instance_id: instance, service_name: "svc".into(), host_name: "host".into(), process_id: 1 }
    }

    use conduit_types::InstanceId;

    fn base_request(identity: CallerIdentity) -> WorkBatchRequest {
        WorkBatchRequest::heartbeat_only(identity, 4, 4, 30, 60, 10)
    }

    #[tokio::test]
    async fn claims_newly_inserted_outbox_row() {
        let store = MemoryStore::new(MessageAssociationTable::new());
        let instance = InstanceId::new();
        let mut request = base_request(identity(instance));
        request.new_outbox.push(NewOutboxItem {
            message_id: None,
            destination: "orders".into(),
            message_type: "order.created".into(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: None,
            carries_event: false,
            scheduled_for: None,
        });

        let batch = store.process_work_batch(request).await.unwrap();
        assert_eq!(batch.outbox_work.len(), 1);
        assert_eq!(batch.outbox_work[0].instance_id, Some(instance));
    }

    #[tokio::test]
    async fn stream_ordering_guard_serialises_same_stream_rows() {
        let store = MemoryStore::new(MessageAssociationTable::new());
        let instance = InstanceId::new();
        let stream_id = StreamId::from_key("order:1");

        let mut insert_request = base_request(identity(instance));
        for n in 0..2 {
            insert_request.new_outbox.push(NewOutboxItem {
                message_id: None,
                destination: "orders".into(),
                message_type: format!("order.step{n}"),
                payload: serde_json::json!({ "n": n }),
                metadata: serde_json::json!({}),
                scope: None,
                stream_id: Some(stream_id),
                carries_event: false,
                scheduled_for: None,
            });
        }
        store.process_work_batch(insert_request).await.unwrap();

        let claim_request = base_request(identity(instance));
        let batch = store.process_work_batch(claim_request).await.unwrap();
        assert_eq!(batch.outbox_work.len(), 1, "only the earliest unresolved row in the stream is claimable");
    }

    #[tokio::test]
    async fn stale_instance_partitions_are_reclaimed() {
        let store = MemoryStore::new(MessageAssociationTable::new());
        let dead_instance = InstanceId::new();
        let live_instance = InstanceId::new();

        let mut setup = base_request(identity(dead_instance));
        setup.now = Some(Utc::now() - chrono::Duration::seconds(120));
        setup.new_outbox.push(NewOutboxItem {
            message_id: None,
            destination: "orders".into(),
            message_type: "order.created".into(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: None,
            carries_event: false,
            scheduled_for: None,
        });
        store.process_work_batch(setup).await.unwrap();

        // dead_instance's heartbeat is now 120s stale relative to "now" below.
        let mut claim = base_request(identity(live_instance));
        claim.stale_threshold_seconds = 60;
        let batch = store.process_work_batch(claim).await.unwrap();
        assert_eq!(batch.outbox_work.len(), 1, "live instance should reclaim the stale instance's partition");
        assert_eq!(batch.outbox_work[0].instance_id, Some(live_instance));
    }

    #[tokio::test]
    async fn event_append_and_dedup_are_independent_of_work_batch() {
        let store = MemoryStore::new(MessageAssociationTable::new());
        let stream_id = StreamId::from_key("s1");
        let origin = InstanceId::new();

        #[derive(serde::Serialize)]
        struct Payload {
            v: i32,
        }
        store
            .append_event(stream_id, Envelope::new("e", origin, &Payload { v: 1 }).unwrap())
            .await
            .unwrap();
        assert_eq!(store.event_count().await, 1);
    }
}
