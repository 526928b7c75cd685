//! `process_work_batch` for [`crate::PostgresStore`] — the same eleven-step procedure as
//! `conduit-store-memory`, expressed as SQL running inside one transaction with
//! `SELECT ... FOR UPDATE SKIP LOCKED` for claim selection instead of an in-process mutex.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Postgres, Row, Transaction};

use conduit_store_core::{
    InboxRecord, OutboxRecord, PerspectiveCheckpoint, StorageError, WorkBatch, WorkBatchRequest,
    WorkCoordinatorStore,
};
use conduit_types::{MessageId, PartitionNumber, StreamId};

use crate::{storage_err, PostgresStore};

const FLAG_STORED: i32 = 1;
const FLAG_EVENT_STORED: i32 = 8;

/// Builds the "is this outbox row terminal" predicate against `flags_expr` (a SQL expression
/// evaluating to the status-flags bitmask to test — either the stored column for claim-selection
/// queries, or `status_flags | $n` for completion/failure updates, since a `SET` clause's `CASE`
/// branches see the row's pre-update values, not the value being assigned in the same statement).
fn outbox_terminal_sql(flags_expr: &str) -> String {
    format!(
        "(({flags_expr} & 4) <> 0 \
         OR (carries_event AND ({flags_expr} & 10) = 10) \
         OR (NOT carries_event AND ({flags_expr} & 2) <> 0))"
    )
}

/// Inbox rows never carry a domain event, so terminality only checks `Failed`/`Published`.
fn inbox_terminal_sql(flags_expr: &str) -> String {
    format!("(({flags_expr} & 4) <> 0 OR ({flags_expr} & 2) <> 0)")
}

#[async_trait]
impl WorkCoordinatorStore for PostgresStore {
    async fn process_work_batch(&self, request: WorkBatchRequest) -> Result<WorkBatch, StorageError> {
        let now = request.now.unwrap_or_else(Utc::now);
        let lease_until = now + chrono::Duration::seconds(request.lease_seconds);
        let stale_cutoff = now - chrono::Duration::seconds(request.stale_threshold_seconds);
        let caller = request.identity.instance_id;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        upsert_instance(&mut tx, &request, now).await?;
        apply_outbox_completions(&mut tx, &request, now).await?;
        apply_outbox_failures(&mut tx, &request, now).await?;
        apply_inbox_completions(&mut tx, &request, now).await?;
        apply_inbox_failures(&mut tx, &request, now).await?;
        apply_perspective_completions(&mut tx, &request, now).await?;
        apply_perspective_failures(&mut tx, &request, now).await?;
        insert_new_outbox(&mut tx, &request, now).await?;
        insert_new_inbox(&mut tx, &request, now).await?;
        renew_leases(&mut tx, &request, lease_until).await?;
        reclaim_stale_partitions(&mut tx, stale_cutoff).await?;
        claim_partitions(&mut tx, &request, caller, now).await?;

        let owned_partitions = owned_partition_numbers(&mut tx, caller).await?;
        discover_perspective_checkpoints(&mut tx, self, &request).await?;

        let outbox_work = claim_outbox(&mut tx, &owned_partitions, caller, lease_until, now, request.batch_size).await?;
        let inbox_work = claim_inbox(&mut tx, &owned_partitions, caller, lease_until, now, request.batch_size).await?;
        let perspective_work = claim_perspectives(&mut tx, &owned_partitions, caller, lease_until, now, request.batch_size).await?;

        tx.commit().await.map_err(storage_err)?;

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

async fn upsert_instance(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO service_instances (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at) \
         VALUES ($1, $2, $3, $4, $5, $5) \
         ON CONFLICT (instance_id) DO UPDATE SET last_heartbeat_at = $5",
    )
    .bind(request.identity.instance_id.0)
    .bind(&request.identity.service_name)
    .bind(&request.identity.host_name)
    .bind(request.identity.process_id as i32)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn apply_outbox_completions(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    let terminal = outbox_terminal_sql("status_flags | $1");
    for completion in &request.outbox_completions {
        sqlx::query(&format!(
            "UPDATE outbox SET status_flags = status_flags | $1, processed_at = $2, \
             instance_id = CASE WHEN {terminal} THEN NULL ELSE instance_id END, \
             lease_expiry = CASE WHEN {terminal} THEN NULL ELSE lease_expiry END \
             WHERE message_id = $3"
        ))
        .bind(completion.status_flags.0 as i32)
        .bind(now)
        .bind(completion.message_id.0)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn apply_outbox_failures(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for failure in &request.outbox_failures {
        if failure.terminal {
            sqlx::query(
                "UPDATE outbox SET status_flags = status_flags | $1 | 4, error = $2, failure_reason = $2, \
                 attempts = attempts + 1, processed_at = $3, instance_id = NULL, lease_expiry = NULL \
                 WHERE message_id = $4",
            )
            .bind(failure.partial_status_flags.0 as i32)
            .bind(&failure.error)
            .bind(now)
            .bind(failure.message_id.0)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        } else {
            sqlx::query(
                "UPDATE outbox SET status_flags = status_flags | $1, error = $2, attempts = attempts + 1, \
                 processed_at = $3 WHERE message_id = $4",
            )
            .bind(failure.partial_status_flags.0 as i32)
            .bind(&failure.error)
            .bind(now)
            .bind(failure.message_id.0)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn apply_inbox_completions(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    let terminal = inbox_terminal_sql("status_flags | $1");
    for completion in request.inbox_completions.iter().chain(request.receptor_completions.iter()) {
        sqlx::query(&format!(
            "UPDATE inbox SET status_flags = status_flags | $1, processed_at = $2, \
             instance_id = CASE WHEN {terminal} THEN NULL ELSE instance_id END, \
             lease_expiry = CASE WHEN {terminal} THEN NULL ELSE lease_expiry END \
             WHERE message_id = $3 AND handler_name = $4"
        ))
        .bind(completion.status_flags.0 as i32)
        .bind(now)
        .bind(completion.message_id.0)
        .bind(&completion.handler_name)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;

        if completion.mark_processed {
            sqlx::query(
                "INSERT INTO dedup (message_id, handler_name, processed_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (message_id, handler_name) DO NOTHING",
            )
            .bind(completion.message_id.0)
            .bind(&completion.handler_name)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn apply_inbox_failures(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for failure in request.inbox_failures.iter().chain(request.receptor_failures.iter()) {
        if failure.terminal {
            sqlx::query(
                "UPDATE inbox SET status_flags = status_flags | $1 | 4, error = $2, failure_reason = $2, \
                 attempts = attempts + 1, processed_at = $3, instance_id = NULL, lease_expiry = NULL \
                 WHERE message_id = $4 AND handler_name = $5",
            )
            .bind(failure.partial_status_flags.0 as i32)
            .bind(&failure.error)
            .bind(now)
            .bind(failure.message_id.0)
            .bind(&failure.handler_name)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        } else {
            sqlx::query(
                "UPDATE inbox SET status_flags = status_flags | $1, error = $2, attempts = attempts + 1, \
                 processed_at = $3 WHERE message_id = $4 AND handler_name = $5",
            )
            .bind(failure.partial_status_flags.0 as i32)
            .bind(&failure.error)
            .bind(now)
            .bind(failure.message_id.0)
            .bind(&failure.handler_name)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn apply_perspective_completions(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for completion in &request.perspective_completions {
        let caught_up: bool = sqlx::query(
            "SELECT COALESCE((SELECT message_id FROM events WHERE stream_id = $1 ORDER BY sequence DESC LIMIT 1) = $2, FALSE) AS caught",
        )
        .bind(completion.stream_id.0)
        .bind(completion.last_processed_event_id.0)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?
        .get("caught");

        sqlx::query(
            "UPDATE perspective_checkpoints SET last_processed_event_id = $1, processed_at = $2, error = NULL, \
             status = $3, instance_id = NULL, lease_expiry = NULL WHERE stream_id = $4 AND perspective_name = $5",
        )
        .bind(completion.last_processed_event_id.0)
        .bind(now)
        .bind(if caught_up { "caught" } else { "pending" })
        .bind(completion.stream_id.0)
        .bind(&completion.perspective_name)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn apply_perspective_failures(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for failure in &request.perspective_failures {
        if let Some(partial) = failure.partial_last_processed_event_id {
            sqlx::query(
                "UPDATE perspective_checkpoints SET last_processed_event_id = $1, error = $2, status = 'failed', \
                 processed_at = $3, instance_id = NULL, lease_expiry = NULL WHERE stream_id = $4 AND perspective_name = $5",
            )
            .bind(partial.0)
            .bind(&failure.error)
            .bind(now)
            .bind(failure.stream_id.0)
            .bind(&failure.perspective_name)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        } else {
            sqlx::query(
                "UPDATE perspective_checkpoints SET error = $1, status = 'failed', processed_at = $2, \
                 instance_id = NULL, lease_expiry = NULL WHERE stream_id = $3 AND perspective_name = $4",
            )
            .bind(&failure.error)
            .bind(now)
            .bind(failure.stream_id.0)
            .bind(&failure.perspective_name)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn insert_new_outbox(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for item in &request.new_outbox {
        let message_id = item.message_id.unwrap_or_else(MessageId::new);
        let partition_number = item
            .stream_id
            .map(|stream_id| PartitionNumber::of(stream_id, request.partition_count))
            .unwrap_or(PartitionNumber(0));
        let mut status_flags = FLAG_STORED;
        if item.carries_event {
            status_flags |= FLAG_EVENT_STORED;
        }

        sqlx::query(
            "INSERT INTO outbox (message_id, destination, message_type, payload, metadata, scope, created_at, \
             stream_id, partition_number, status_flags, carries_event, scheduled_for) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(message_id.0)
        .bind(&item.destination)
        .bind(&item.message_type)
        .bind(&item.payload)
        .bind(&item.metadata)
        .bind(&item.scope)
        .bind(now)
        .bind(item.stream_id.map(|s| s.0))
        .bind(partition_number.0 as i32)
        .bind(status_flags)
        .bind(item.carries_event)
        .bind(item.scheduled_for)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn insert_new_inbox(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, now: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for item in &request.new_inbox {
        let partition_number = item
            .stream_id
            .map(|stream_id| PartitionNumber::of(stream_id, request.partition_count))
            .unwrap_or(PartitionNumber(0));

        sqlx::query(
            "INSERT INTO inbox (message_id, handler_name, message_type, payload, metadata, created_at, \
             stream_id, partition_number, status_flags, scheduled_for) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (message_id, handler_name) DO NOTHING",
        )
        .bind(item.message_id.0)
        .bind(&item.handler_name)
        .bind(&item.message_type)
        .bind(&item.payload)
        .bind(&item.metadata)
        .bind(now)
        .bind(item.stream_id.map(|s| s.0))
        .bind(partition_number.0 as i32)
        .bind(FLAG_STORED)
        .bind(item.scheduled_for)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn renew_leases(tx: &mut Transaction<'_, Postgres>, request: &WorkBatchRequest, lease_until: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    for message_id in &request.renew_outbox_lease_ids {
        sqlx::query("UPDATE outbox SET lease_expiry = $1 WHERE message_id = $2 AND instance_id = $3")
            .bind(lease_until)
            .bind(message_id.0)
            .bind(request.identity.instance_id.0)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
    }
    for (message_id, handler_name) in &request.renew_inbox_lease_ids {
        sqlx::query("UPDATE inbox SET lease_expiry = $1 WHERE message_id = $2 AND handler_name = $3 AND instance_id = $4")
            .bind(lease_until)
            .bind(message_id.0)
            .bind(handler_name)
            .bind(request.identity.instance_id.0)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
    }
    Ok(())
}

async fn reclaim_stale_partitions(tx: &mut Transaction<'_, Postgres>, stale_cutoff: chrono::DateTime<Utc>) -> Result<(), StorageError> {
    sqlx::query(
        "DELETE FROM partition_assignments pa \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM service_instances si \
             WHERE si.instance_id = pa.instance_id AND si.last_heartbeat_at > $1 \
         )",
    )
    .bind(stale_cutoff)
    .execute(&mut **tx)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn claim_partitions(
    tx: &mut Transaction<'_, Postgres>,
    request: &WorkBatchRequest,
    caller: conduit_types::InstanceId,
    now: chrono::DateTime<Utc>,
) -> Result<(), StorageError> {
    let owned: i64 = sqlx::query("SELECT COUNT(*) AS n FROM partition_assignments WHERE instance_id = $1")
        .bind(caller.0)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?
        .get("n");
    let mut owned = owned as u32;
    let outbox_terminal = outbox_terminal_sql("status_flags");
    let inbox_terminal = inbox_terminal_sql("status_flags");

    for partition in 0..request.partition_count {
        if owned >= request.max_partitions_per_instance {
            break;
        }
        let has_work: bool = sqlx::query(&format!(
            "SELECT (EXISTS (SELECT 1 FROM outbox WHERE partition_number = $1 AND (status_flags & {FLAG_STORED}) <> 0 \
                AND NOT {outbox_terminal} AND (lease_expiry IS NULL OR lease_expiry <= $2) \
                AND (scheduled_for IS NULL OR scheduled_for <= $2)) \
             OR EXISTS (SELECT 1 FROM inbox WHERE partition_number = $1 AND (status_flags & {FLAG_STORED}) <> 0 \
                AND NOT {inbox_terminal} AND (lease_expiry IS NULL OR lease_expiry <= $2) \
                AND (scheduled_for IS NULL OR scheduled_for <= $2)) \
             OR EXISTS (SELECT 1 FROM perspective_checkpoints WHERE partition_number = $1 \
                AND (lease_expiry IS NULL OR lease_expiry <= $2))) AS present"
        ))
        .bind(partition as i32)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?
        .get("present");

        if !has_work {
            continue;
        }

        let inserted = sqlx::query(
            "INSERT INTO partition_assignments (partition_number, instance_id, assigned_at, last_heartbeat) \
             VALUES ($1, $2, $3, $3) ON CONFLICT (partition_number) DO NOTHING",
        )
        .bind(partition as i32)
        .bind(caller.0)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;

        if inserted.rows_affected() > 0 {
            owned += 1;
        }
    }

    sqlx::query("UPDATE partition_assignments SET last_heartbeat = $1 WHERE instance_id = $2")
        .bind(now)
        .bind(caller.0)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;

    Ok(())
}

async fn owned_partition_numbers(tx: &mut Transaction<'_, Postgres>, caller: conduit_types::InstanceId) -> Result<Vec<i32>, StorageError> {
    let rows = sqlx::query("SELECT partition_number FROM partition_assignments WHERE instance_id = $1")
        .bind(caller.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage_err)?;
    Ok(rows.into_iter().map(|row| row.get("partition_number")).collect())
}

async fn discover_perspective_checkpoints(tx: &mut Transaction<'_, Postgres>, store: &PostgresStore, request: &WorkBatchRequest) -> Result<(), StorageError> {
    // Every distinct (stream_id, event_type) pair with at least one event, cross-joined against
    // this instance's `MessageAssociationTable`, gives the set of checkpoints that must exist.
    let streams_with_types: Vec<(uuid::Uuid, String)> = sqlx::query("SELECT DISTINCT stream_id, event_type FROM events")
        .fetch_all(&mut **tx)
        .await
        .map_err(storage_err)?
        .into_iter()
        .map(|row| (row.get("stream_id"), row.get("event_type")))
        .collect();

    for (stream_id, event_type) in streams_with_types {
        for (associated_type, perspective_name) in store.associations.pairs() {
            if associated_type != event_type {
                continue;
            }
            let partition_number = PartitionNumber::of(StreamId(stream_id), request.partition_count);
            sqlx::query(
                "INSERT INTO perspective_checkpoints (stream_id, perspective_name, status, partition_number) \
                 VALUES ($1, $2, 'pending', $3) ON CONFLICT (stream_id, perspective_name) DO NOTHING",
            )
            .bind(stream_id)
            .bind(perspective_name)
            .bind(partition_number.0 as i32)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn claim_outbox(
    tx: &mut Transaction<'_, Postgres>,
    owned_partitions: &[i32],
    caller: conduit_types::InstanceId,
    lease_until: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
    batch_size: u32,
) -> Result<Vec<OutboxRecord>, StorageError> {
    if owned_partitions.is_empty() {
        return Ok(Vec::new());
    }

    let terminal_o = outbox_terminal_sql("o.status_flags");
    let terminal_o2 = outbox_terminal_sql("o2.status_flags");
    let rows = sqlx::query(&format!(
        "SELECT message_id FROM outbox o \
         WHERE o.partition_number = ANY($1) AND (o.status_flags & {FLAG_STORED}) <> 0 \
           AND NOT {terminal_o} \
           AND (o.lease_expiry IS NULL OR o.lease_expiry <= $2) \
           AND (o.scheduled_for IS NULL OR o.scheduled_for <= $2) \
           AND (o.stream_id IS NULL OR o.message_id = ( \
               SELECT message_id FROM outbox o2 WHERE o2.stream_id = o.stream_id AND NOT {terminal_o2} \
               ORDER BY o2.message_id ASC LIMIT 1 \
           )) \
         ORDER BY o.message_id ASC LIMIT $3 FOR UPDATE SKIP LOCKED"
    ))
    .bind(owned_partitions)
    .bind(now)
    .bind(batch_size as i64)
    .fetch_all(&mut **tx)
    .await
    .map_err(storage_err)?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let message_id: uuid::Uuid = row.get("message_id");
        sqlx::query("UPDATE outbox SET instance_id = $1, lease_expiry = $2 WHERE message_id = $3")
            .bind(caller.0)
            .bind(lease_until)
            .bind(message_id)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        claimed.push(fetch_outbox_record(tx, message_id).await?);
    }
    Ok(claimed)
}

async fn claim_inbox(
    tx: &mut Transaction<'_, Postgres>,
    owned_partitions: &[i32],
    caller: conduit_types::InstanceId,
    lease_until: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
    batch_size: u32,
) -> Result<Vec<InboxRecord>, StorageError> {
    if owned_partitions.is_empty() {
        return Ok(Vec::new());
    }

    let terminal = inbox_terminal_sql("status_flags");
    let rows = sqlx::query(&format!(
        "SELECT message_id, handler_name FROM inbox \
         WHERE partition_number = ANY($1) AND (status_flags & {FLAG_STORED}) <> 0 \
           AND NOT {terminal} \
           AND (lease_expiry IS NULL OR lease_expiry <= $2) \
           AND (scheduled_for IS NULL OR scheduled_for <= $2) \
         ORDER BY message_id ASC LIMIT $3 FOR UPDATE SKIP LOCKED"
    ))
    .bind(owned_partitions)
    .bind(now)
    .bind(batch_size as i64)
    .fetch_all(&mut **tx)
    .await
    .map_err(storage_err)?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let message_id: uuid::Uuid = row.get("message_id");
        let handler_name: String = row.get("handler_name");
        sqlx::query("UPDATE inbox SET instance_id = $1, lease_expiry = $2 WHERE message_id = $3 AND handler_name = $4")
            .bind(caller.0)
            .bind(lease_until)
            .bind(message_id)
            .bind(&handler_name)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        claimed.push(fetch_inbox_record(tx, message_id, &handler_name).await?);
    }
    Ok(claimed)
}

async fn claim_perspectives(
    tx: &mut Transaction<'_, Postgres>,
    owned_partitions: &[i32],
    caller: conduit_types::InstanceId,
    lease_until: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
    batch_size: u32,
) -> Result<Vec<PerspectiveCheckpoint>, StorageError> {
    if owned_partitions.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT pc.stream_id, pc.perspective_name FROM perspective_checkpoints pc \
         WHERE pc.partition_number = ANY($1) AND (pc.lease_expiry IS NULL OR pc.lease_expiry <= $2) \
           AND (SELECT e.message_id FROM events e WHERE e.stream_id = pc.stream_id \
                ORDER BY e.sequence DESC LIMIT 1) IS DISTINCT FROM pc.last_processed_event_id \
         LIMIT $3 FOR UPDATE SKIP LOCKED",
    )
    .bind(owned_partitions)
    .bind(now)
    .bind(batch_size as i64)
    .fetch_all(&mut **tx)
    .await
    .map_err(storage_err)?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let stream_id: uuid::Uuid = row.get("stream_id");
        let perspective_name: String = row.get("perspective_name");
        sqlx::query(
            "UPDATE perspective_checkpoints SET instance_id = $1, lease_expiry = $2, status = 'in_progress' \
             WHERE stream_id = $3 AND perspective_name = $4",
        )
        .bind(caller.0)
        .bind(lease_until)
        .bind(stream_id)
        .bind(&perspective_name)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        claimed.push(fetch_checkpoint(tx, stream_id, &perspective_name).await?);
    }
    Ok(claimed)
}

async fn fetch_outbox_record(tx: &mut Transaction<'_, Postgres>, message_id: uuid::Uuid) -> Result<OutboxRecord, StorageError> {
    let row = sqlx::query("SELECT * FROM outbox WHERE message_id = $1")
        .bind(message_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?;

    Ok(OutboxRecord {
        message_id: MessageId(row.get("message_id")),
        destination: row.get("destination"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        metadata: row.get("metadata"),
        scope: row.get("scope"),
        attempts: row.get::<i32, _>("attempts") as u32,
        error: row.get("error"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        published_at: row.get("published_at"),
        processed_at: row.get("processed_at"),
        instance_id: row.get::<Option<uuid::Uuid>, _>("instance_id").map(conduit_types::InstanceId),
        lease_expiry: row.get("lease_expiry"),
        stream_id: row.get::<Option<uuid::Uuid>, _>("stream_id").map(StreamId),
        partition_number: PartitionNumber(row.get::<i32, _>("partition_number") as u32),
        status_flags: conduit_types::StatusFlags(row.get::<i32, _>("status_flags") as u32),
        carries_event: row.get("carries_event"),
        scheduled_for: row.get("scheduled_for"),
    })
}

async fn fetch_inbox_record(tx: &mut Transaction<'_, Postgres>, message_id: uuid::Uuid, handler_name: &str) -> Result<InboxRecord, StorageError> {
    let row = sqlx::query("SELECT * FROM inbox WHERE message_id = $1 AND handler_name = $2")
        .bind(message_id)
        .bind(handler_name)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?;

    Ok(InboxRecord {
        message_id: MessageId(row.get("message_id")),
        handler_name: row.get("handler_name"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        metadata: row.get("metadata"),
        attempts: row.get::<i32, _>("attempts") as u32,
        error: row.get("error"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        instance_id: row.get::<Option<uuid::Uuid>, _>("instance_id").map(conduit_types::InstanceId),
        lease_expiry: row.get("lease_expiry"),
        stream_id: row.get::<Option<uuid::Uuid>, _>("stream_id").map(StreamId),
        partition_number: PartitionNumber(row.get::<i32, _>("partition_number") as u32),
        status_flags: conduit_types::StatusFlags(row.get::<i32, _>("status_flags") as u32),
        scheduled_for: row.get("scheduled_for"),
    })
}

async fn fetch_checkpoint(tx: &mut Transaction<'_, Postgres>, stream_id: uuid::Uuid, perspective_name: &str) -> Result<PerspectiveCheckpoint, StorageError> {
    let row = sqlx::query("SELECT * FROM perspective_checkpoints WHERE stream_id = $1 AND perspective_name = $2")
        .bind(stream_id)
        .bind(perspective_name)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_err)?;

    let status: String = row.get("status");
    Ok(PerspectiveCheckpoint {
        stream_id: StreamId(row.get("stream_id")),
        perspective_name: row.get("perspective_name"),
        last_processed_event_id: row.get::<Option<uuid::Uuid>, _>("last_processed_event_id").map(MessageId),
        status: match status.as_str() {
            "caught" => conduit_store_core::PerspectiveStatus::Caught,
            "in_progress" => conduit_store_core::PerspectiveStatus::InProgress,
            "failed" => conduit_store_core::PerspectiveStatus::Failed,
            _ => conduit_store_core::PerspectiveStatus::Pending,
        },
        processed_at: row.get("processed_at"),
        error: row.get("error"),
        instance_id: row.get::<Option<uuid::Uuid>, _>("instance_id").map(conduit_types::InstanceId),
        lease_expiry: row.get("lease_expiry"),
        partition_number: PartitionNumber(row.get::<i32, _>("partition_number") as u32),
    })
}
