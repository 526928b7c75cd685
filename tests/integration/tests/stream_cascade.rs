//! S5 (SPEC_FULL.md §8): three outbox rows (R1, R2, R3) share one stream. The stream-ordering
//! guard only ever exposes the earliest non-terminal row in a stream, so R1 must resolve before
//! R2 becomes claimable, and R2 — whether still leased out after a transient failure or merely
//! unresolved — blocks R3 from ever being exposed early. Only a terminal failure on R2 frees R3.

use conduit_store_core::{CallerIdentity, NewOutboxItem, OutboxCompletion, OutboxFailure, WorkBatchRequest, WorkCoordinatorStore};
use conduit_store_memory::MemoryStore;
use conduit_types::{InstanceId, MessageAssociationTable, StatusFlags, StreamId};

fn identity(instance: InstanceId) -> CallerIdentity {
    CallerIdentity { instance_id: instance, service_name: "stream-cascade".into(), host_name: "host".into(), process_id: 1 }
}

fn base_request(identity: CallerIdentity) -> WorkBatchRequest {
    WorkBatchRequest::heartbeat_only(identity, 4, 4, 300, 600, 10)
}

#[tokio::test]
async fn a_non_terminal_failure_blocks_every_later_row_in_the_stream() {
    let store = MemoryStore::new(MessageAssociationTable::new());
    let instance = InstanceId::new();
    let stream_id = StreamId::from_key("Order:cascade");

    let mut insert_request = base_request(identity(instance));
    for step in 0..3 {
        insert_request.new_outbox.push(NewOutboxItem {
            message_id: None,
            destination: "orders".into(),
            message_type: format!("order.step{step}"),
            payload: serde_json::json!({ "step": step }),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: Some(stream_id),
            carries_event: false,
            scheduled_for: None,
        });
    }
    let claimed = store.process_work_batch(insert_request).await.unwrap();
    assert_eq!(claimed.outbox_work.len(), 1, "only R1 — the earliest row — is claimable while R2/R3 exist in the same stream");
    let r1 = claimed.outbox_work[0].message_id;

    // R1 succeeds; the claim step in the same round trip picks up R2 as the new earliest.
    let mut complete_r1 = base_request(identity(instance));
    complete_r1.outbox_completions.push(OutboxCompletion { message_id: r1, status_flags: StatusFlags::PUBLISHED });
    let after_r1 = store.process_work_batch(complete_r1).await.unwrap();
    assert_eq!(after_r1.outbox_work.len(), 1, "R2 becomes claimable once R1 is terminal");
    let r2 = after_r1.outbox_work[0].message_id;
    assert_ne!(r2, r1);

    // R2 fails transiently (retryable): its lease is left alone to expire on its own schedule
    // rather than released immediately, so the same round trip claims nothing further — and R3
    // stays locked out regardless, because R2 is still the earliest *unresolved* row in the
    // stream even while it sits idle waiting on its own lease.
    let mut fail_r2_transient = base_request(identity(instance));
    fail_r2_transient.outbox_failures.push(OutboxFailure {
        message_id: r2,
        partial_status_flags: StatusFlags::NONE,
        error: "transport exception".into(),
        terminal: false,
    });
    let after_transient_failure = store.process_work_batch(fail_r2_transient).await.unwrap();
    assert!(after_transient_failure.outbox_work.is_empty(), "R2's lease hasn't expired yet and R3 is blocked behind it");

    // R2 now fails terminally: the stream unblocks and R3 becomes claimable.
    let mut fail_r2_terminal = base_request(identity(instance));
    fail_r2_terminal.outbox_failures.push(OutboxFailure {
        message_id: r2,
        partial_status_flags: StatusFlags::NONE,
        error: "validation error".into(),
        terminal: true,
    });
    let after_terminal_failure = store.process_work_batch(fail_r2_terminal).await.unwrap();
    assert_eq!(after_terminal_failure.outbox_work.len(), 1, "R3 is finally exposed once R2 is terminally Failed");
    let r3 = after_terminal_failure.outbox_work[0].message_id;
    assert!(r3 != r1 && r3 != r2);
}
