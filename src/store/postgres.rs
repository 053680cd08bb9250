use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::booking::model::BookingError;
use crate::config::DatabaseConfig;

/// Connect a pool to Postgres with the configured limits.
pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool, BookingError> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.acquire_timeout)
        .connect(&cfg.url)
        .await
        .map_err(|e| BookingError::Database(format!("failed to connect to Postgres: {e}")))?;
    info!("connected to Postgres");
    Ok(pool)
}

/// Idempotent schema setup. Every statement is CREATE IF NOT EXISTS, so
/// repeated startup runs are harmless.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        title VARCHAR(255) NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        date TIMESTAMPTZ NOT NULL,
        total_seats INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email VARCHAR(255) UNIQUE NOT NULL,
        name VARCHAR(255) NOT NULL,
        messaging_id VARCHAR(100),
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS bookings (
        id BIGSERIAL PRIMARY KEY,
        event_id BIGINT NOT NULL REFERENCES events(id),
        user_id BIGINT NOT NULL REFERENCES users(id),
        seats INTEGER NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        expires_at TIMESTAMPTZ NOT NULL,
        reservation_timeout INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_bookings_event_id ON bookings(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_user_id ON bookings(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_status ON bookings(status)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_expires_at ON bookings(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_event_status ON bookings(event_id, status)",
];

pub async fn run_migrations(pool: &PgPool) -> Result<(), BookingError> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| BookingError::Database(format!("migration failed: {e}")))?;
    }
    info!("database migrations completed");
    Ok(())
}
