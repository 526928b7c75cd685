//! Schema migrations, run idempotently on every [`crate::PostgresStore::from_pool`].
//!
//! Column names mirror the logical row shapes in `conduit_store_core::records` (SPEC_FULL.md §3).

pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        stream_id UUID NOT NULL,
        sequence BIGINT NOT NULL,
        message_id UUID NOT NULL,
        message_type TEXT NOT NULL,
        hops JSONB NOT NULL,
        payload JSONB NOT NULL,
        event_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (stream_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        message_id UUID PRIMARY KEY,
        destination TEXT NOT NULL,
        message_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        metadata JSONB NOT NULL,
        scope TEXT,
        attempts INT NOT NULL DEFAULT 0,
        error TEXT,
        failure_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        published_at TIMESTAMPTZ,
        processed_at TIMESTAMPTZ,
        instance_id UUID,
        lease_expiry TIMESTAMPTZ,
        stream_id UUID,
        partition_number INT NOT NULL,
        status_flags INT NOT NULL DEFAULT 0,
        carries_event BOOLEAN NOT NULL DEFAULT FALSE,
        scheduled_for TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_partition ON outbox (partition_number)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_stream ON outbox (stream_id)",
    r#"
    CREATE TABLE IF NOT EXISTS inbox (
        message_id UUID NOT NULL,
        handler_name TEXT NOT NULL,
        message_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        metadata JSONB NOT NULL,
        attempts INT NOT NULL DEFAULT 0,
        error TEXT,
        failure_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        instance_id UUID,
        lease_expiry TIMESTAMPTZ,
        stream_id UUID,
        partition_number INT NOT NULL,
        status_flags INT NOT NULL DEFAULT 0,
        scheduled_for TIMESTAMPTZ,
        PRIMARY KEY (message_id, handler_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_inbox_partition ON inbox (partition_number)",
    r#"
    CREATE TABLE IF NOT EXISTS dedup (
        message_id UUID NOT NULL,
        handler_name TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (message_id, handler_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS perspective_checkpoints (
        stream_id UUID NOT NULL,
        perspective_name TEXT NOT NULL,
        last_processed_event_id UUID,
        status TEXT NOT NULL,
        processed_at TIMESTAMPTZ,
        error TEXT,
        instance_id UUID,
        lease_expiry TIMESTAMPTZ,
        partition_number INT NOT NULL,
        PRIMARY KEY (stream_id, perspective_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_partition ON perspective_checkpoints (partition_number)",
    r#"
    CREATE TABLE IF NOT EXISTS service_instances (
        instance_id UUID PRIMARY KEY,
        service_name TEXT NOT NULL,
        host_name TEXT NOT NULL,
        process_id INT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        last_heartbeat_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS partition_assignments (
        partition_number INT PRIMARY KEY,
        instance_id UUID NOT NULL,
        assigned_at TIMESTAMPTZ NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL
    )
    "#,
];
