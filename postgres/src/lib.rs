//! `PostgreSQL` stores for the outbox relay and the idempotent consumer.
//!
//! This crate provides production implementations of the store traits from
//! `outbox-core`:
//!
//! - [`PostgresOutboxStore`]: the outbox table, claimed with `FOR UPDATE SKIP LOCKED`
//! - [`PostgresProcessedEventStore`]: the idempotency ledger, driven by conditional upserts
//! - [`enqueue`]: the write contract for the domain side, run on the caller's transaction
//!
//! Every state transition is a single guarded statement. There are no
//! read-then-write sequences, so concurrent relays and redeliveries cannot
//! lose updates.
//!
//! # Example
//!
//! ```no_run
//! use outbox_postgres::{connect, migrate, PostgresOutboxStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/servicedesk", 10).await?;
//! migrate(&pool).await?;
//! let store = PostgresOutboxStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;
mod processed;

pub use outbox::{PostgresOutboxStore, enqueue};
pub use processed::PostgresProcessedEventStore;

use outbox_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(db_error)?;

    tracing::info!(max_connections, "PostgreSQL pool connected");

    Ok(pool)
}

/// Run the bundled migrations (`outbox` and `processed_events` tables).
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
}

pub(crate) fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
