//! Two of the quantified invariants from SPEC_FULL.md §8, exercised directly against
//! `conduit-store-memory`: partition exclusivity (a partition has at most one owning instance at
//! any time) and idempotent completion application (re-reporting the same completion twice never
//! double-applies its effect).

use conduit_store_core::{CallerIdentity, NewOutboxItem, OutboxCompletion, WorkBatchRequest, WorkCoordinatorStore};
use conduit_store_memory::MemoryStore;
use conduit_types::{InstanceId, MessageAssociationTable, StatusFlags, StreamId};

fn identity(instance: InstanceId) -> CallerIdentity {
    CallerIdentity { instance_id: instance, service_name: "invariants".into(), host_name: "host".into(), process_id: 1 }
}

fn base_request(identity: CallerIdentity) -> WorkBatchRequest {
    WorkBatchRequest::heartbeat_only(identity, 1, 1, 300, 600, 10)
}

#[tokio::test]
async fn a_partition_is_never_owned_by_two_instances_at_once() {
    let store = MemoryStore::new(MessageAssociationTable::new());
    let instance_a = InstanceId::new();
    let instance_b = InstanceId::new();

    // A single partition with claimable work in it — both instances compete for the one slot.
    let mut seed = base_request(identity(instance_a));
    seed.new_outbox.push(NewOutboxItem {
        message_id: None,
        destination: "orders".into(),
        message_type: "order.created".into(),
        payload: serde_json::json!({}),
        metadata: serde_json::json!({}),
        scope: None,
        stream_id: Some(StreamId::from_key("Order:only")),
        carries_event: false,
        scheduled_for: None,
    });
    let claimed_by_a = store.process_work_batch(seed).await.unwrap();
    assert_eq!(claimed_by_a.outbox_work.len(), 1, "instance A takes the only partition and its one row");

    // Instance B asks for work in the same round-robin window — there is nothing left for it to
    // claim, because the partition is already assigned to A and A is still alive.
    let claimed_by_b = store.process_work_batch(base_request(identity(instance_b))).await.unwrap();
    assert!(claimed_by_b.outbox_work.is_empty(), "B cannot acquire a partition A already owns while A is live");
}

#[tokio::test]
async fn reporting_the_same_completion_twice_is_a_no_op_the_second_time() {
    let store = MemoryStore::new(MessageAssociationTable::new());
    let instance = InstanceId::new();

    let mut seed = base_request(identity(instance));
    seed.new_outbox.push(NewOutboxItem {
        message_id: None,
        destination: "orders".into(),
        message_type: "order.created".into(),
        payload: serde_json::json!({}),
        metadata: serde_json::json!({}),
        scope: None,
        stream_id: Some(StreamId::from_key("Order:idempotent")),
        carries_event: false,
        scheduled_for: None,
    });
    let claimed = store.process_work_batch(seed).await.unwrap();
    let message_id = claimed.outbox_work[0].message_id;

    let mut complete_once = base_request(identity(instance));
    complete_once.outbox_completions.push(OutboxCompletion { message_id, status_flags: StatusFlags::PUBLISHED });
    let after_first = store.process_work_batch(complete_once).await.unwrap();
    assert!(after_first.outbox_work.is_empty(), "the row is terminal and nothing else is left to claim");

    // A retried completion report for the same message (e.g. the publisher's ack was lost and it
    // resent) ORs the same bit in again — already set, so no observable change.
    let mut complete_again = base_request(identity(instance));
    complete_again.outbox_completions.push(OutboxCompletion { message_id, status_flags: StatusFlags::PUBLISHED });
    let after_second = store.process_work_batch(complete_again).await.unwrap();
    assert!(after_second.outbox_work.is_empty(), "replaying the same completion changes nothing");
}
