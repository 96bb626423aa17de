//! Schema DDL, applied idempotently at startup.

use sqlx::PgPool;

/// The durable schema: bookings, outbox, dead letters, saga instances,
/// idempotency keys.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS bookings (
    booking_id        UUID PRIMARY KEY,
    user_id           UUID NOT NULL,
    event_id          UUID NOT NULL,
    show_id           UUID NOT NULL,
    zone_id           UUID NOT NULL,
    quantity          INTEGER NOT NULL CHECK (quantity > 0),
    unit_price        BIGINT NOT NULL,
    total_price       BIGINT NOT NULL CHECK (total_price = unit_price * quantity),
    currency          TEXT NOT NULL,
    status            TEXT NOT NULL
                      CHECK (status IN ('reserved', 'confirmed', 'cancelled', 'expired')),
    idempotency_key   TEXT,
    reserved_at       TIMESTAMPTZ NOT NULL,
    expires_at        TIMESTAMPTZ NOT NULL,
    confirmed_at      TIMESTAMPTZ,
    cancelled_at      TIMESTAMPTZ,
    payment_id        TEXT,
    confirmation_code TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS bookings_idempotency_key
    ON bookings (idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS bookings_user_event
    ON bookings (user_id, event_id);
CREATE INDEX IF NOT EXISTS bookings_status_expires
    ON bookings (status, expires_at);

CREATE TABLE IF NOT EXISTS outbox_messages (
    id             BIGSERIAL PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id   TEXT NOT NULL,
    event_type     TEXT NOT NULL,
    payload        JSONB NOT NULL,
    topic          TEXT NOT NULL,
    partition_key  TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending'
                   CHECK (status IN ('pending', 'published', 'failed')),
    retry_count    INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL DEFAULT 5,
    last_error     TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at   TIMESTAMPTZ,
    published_at   TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS outbox_messages_pending
    ON outbox_messages (created_at, id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS dead_letter_messages (
    id              BIGSERIAL PRIMARY KEY,
    original_topic  TEXT NOT NULL,
    partition_key   TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    payload         JSONB NOT NULL,
    error           TEXT NOT NULL,
    retry_count     INTEGER NOT NULL,
    first_failed_at TIMESTAMPTZ NOT NULL,
    last_failed_at  TIMESTAMPTZ NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'replayed', 'discarded'))
);

CREATE INDEX IF NOT EXISTS dead_letter_messages_pending
    ON dead_letter_messages (first_failed_at) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS saga_instances (
    saga_id    UUID PRIMARY KEY,
    booking_id UUID NOT NULL,
    status     TEXT NOT NULL
               CHECK (status IN ('running', 'compensating', 'completed', 'failed')),
    state      JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS saga_instances_live
    ON saga_instances (updated_at) WHERE status IN ('running', 'compensating');

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key             TEXT PRIMARY KEY,
    fingerprint     TEXT,
    response_status INTEGER,
    response_body   JSONB,
    in_flight       BOOLEAN NOT NULL DEFAULT TRUE,
    created_at      TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ
);
";

/// Applies [`SCHEMA`] statement by statement.
///
/// # Errors
///
/// Returns the underlying `sqlx` error if any statement fails.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("database schema applied");
    Ok(())
}
