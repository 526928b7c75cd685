//! S4 (SPEC_FULL.md §8): instance A claims two outbox rows on distinct streams, then stops
//! heartbeating. Once its lease and liveness window both lapse, instance B reclaims the same
//! partitions and rows in one round trip and completes them exactly once each.

use chrono::{Duration, Utc};
use conduit_store_core::{CallerIdentity, NewOutboxItem, OutboxCompletion, StorageBackend, WorkBatchRequest, WorkCoordinatorStore};
use conduit_store_memory::MemoryStore;
use conduit_types::{InstanceId, MessageAssociationTable, StatusFlags, StreamId};

fn identity(instance: InstanceId) -> CallerIdentity {
    CallerIdentity { instance_id: instance, service_name: "crash-recovery".into(), host_name: "host".into(), process_id: 1 }
}

fn base_request(identity: CallerIdentity, now: chrono::DateTime<Utc>) -> WorkBatchRequest {
    let mut request = WorkBatchRequest::heartbeat_only(identity, 16, 16, 30, 60, 10);
    request.now = Some(now);
    request
}

#[tokio::test]
async fn dead_instance_work_is_reclaimed_and_completed_exactly_once() {
    let store = MemoryStore::new(MessageAssociationTable::new());
    let instance_a = InstanceId::new();
    let instance_b = InstanceId::new();
    let t0 = Utc::now();

    let stream_r1 = StreamId::from_key("Order:r1");
    let stream_r2 = StreamId::from_key("Order:r2");

    let mut insert_request = base_request(identity(instance_a), t0);
    for stream_id in [stream_r1, stream_r2] {
        insert_request.new_outbox.push(NewOutboxItem {
            message_id: None,
            destination: "orders".into(),
            message_type: "order.created".into(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: Some(stream_id),
            carries_event: false,
            scheduled_for: None,
        });
    }

    let claimed_by_a = store.process_work_batch(insert_request).await.unwrap();
    assert_eq!(claimed_by_a.outbox_work.len(), 2, "instance A claims both rows in the same round that inserts them");
    assert!(claimed_by_a.outbox_work.iter().all(|row| row.instance_id == Some(instance_a)));

    // Instance A crashes: no further heartbeat. Advance past both the 30s lease and the 60s
    // staleness window so instance B's round trip both reclaims A's partitions and leases the
    // now-unowned rows.
    let t1 = t0 + Duration::seconds(70);
    let reclaim_request = base_request(identity(instance_b), t1);
    let claimed_by_b = store.process_work_batch(reclaim_request).await.unwrap();

    assert_eq!(claimed_by_b.outbox_work.len(), 2, "instance B reclaims both rows once A goes stale");
    assert!(claimed_by_b.outbox_work.iter().all(|row| row.instance_id == Some(instance_b)));

    let reclaimed_ids: Vec<_> = claimed_by_b.outbox_work.iter().map(|row| row.message_id).collect();
    let original_ids: Vec<_> = claimed_by_a.outbox_work.iter().map(|row| row.message_id).collect();
    assert_eq!(
        reclaimed_ids.iter().collect::<std::collections::HashSet<_>>(),
        original_ids.iter().collect::<std::collections::HashSet<_>>(),
        "B reclaims the exact rows A was holding, not fresh ones"
    );

    // B publishes each exactly once and reports completion.
    let mut completion_request = base_request(identity(instance_b), t1);
    for message_id in reclaimed_ids {
        completion_request.outbox_completions.push(OutboxCompletion { message_id, status_flags: StatusFlags::PUBLISHED });
    }
    let after_completion = store.process_work_batch(completion_request).await.unwrap();
    assert!(after_completion.outbox_work.is_empty(), "both rows are now terminal and no longer claimable");

    // A later round trip, even from instance A (were it to come back), claims nothing further for
    // these rows — they are terminal.
    let final_request = base_request(identity(instance_a), t1 + Duration::seconds(1));
    let final_batch = store.process_work_batch(final_request).await.unwrap();
    assert!(final_batch.outbox_work.is_empty());
}
