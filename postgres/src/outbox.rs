//! Outbox table access.

use crate::db_error;
use chrono::{DateTime, Utc};
use outbox_core::outbox::{
    DEFAULT_BATCH_SIZE, DEFAULT_PROCESSING_TIMEOUT, PROCESSING_TIMEOUT_ERROR, StoreFuture,
};
use outbox_core::{NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStore, StoreError};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

const RECORD_COLUMNS: &str = "id, event_id, aggregate, aggregate_id, event_type, payload, status, \
     attempts, created_at, processing_started_at, sent_at, next_retry_at, last_error";

/// Insert an outbox row on the caller's open transaction.
///
/// This is the write contract for the domain side: call it in the same
/// transaction as the business write, so the event exists if and only if the
/// state change committed. The row starts `pending` with `attempts = 0`, due
/// immediately.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the insert fails (including a duplicate `event_id`).
///
/// # Example
///
/// ```no_run
/// use outbox_core::NewOutboxRecord;
/// use outbox_postgres::enqueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
/// sqlx::query("INSERT INTO tickets (id, title) VALUES ($1, $2)")
///     .bind("T1")
///     .bind("printer on fire")
///     .execute(&mut *tx)
///     .await?;
/// enqueue(
///     &mut tx,
///     &NewOutboxRecord::new("ticket", "T1", "ticket.created", serde_json::json!({"id": "T1"})),
/// )
/// .await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    record: &NewOutboxRecord,
) -> Result<i64, StoreError> {
    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox (event_id, aggregate, aggregate_id, event_type, payload, status, attempts)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0)
        RETURNING id
        ",
    )
    .bind(&record.event_id)
    .bind(&record.aggregate)
    .bind(&record.aggregate_id)
    .bind(&record.event_type)
    .bind(&record.payload)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_error)?;

    tracing::debug!(
        outbox_id = id,
        event_id = %record.event_id,
        event_type = %record.event_type,
        "Outbox row enqueued"
    );

    Ok(id)
}

/// `PostgreSQL`-backed [`OutboxStore`].
///
/// Concurrent relays claim disjoint batches through `FOR UPDATE SKIP LOCKED`;
/// no other coordination is needed between instances.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch a single row by id, for inspection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a column cannot be decoded.
    pub async fn get(&self, id: i64) -> Result<Option<OutboxRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Run a guarded `processing → *` update and warn when the guard did not match.
    ///
    /// A miss means the claim expired and another relay recovered the row; the
    /// stale outcome is dropped instead of overwriting the newer claim.
    async fn finish(
        &self,
        id: i64,
        query: Query<'_, Postgres, PgArguments>,
        outcome: OutboxStatus,
    ) -> Result<(), StoreError> {
        let result = query.execute(&self.pool).await.map_err(db_error)?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                outbox_id = id,
                outcome = outcome.as_str(),
                "Outbox row no longer processing, outcome dropped"
            );
        }

        Ok(())
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_pending(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let limit = if limit == 0 { DEFAULT_BATCH_SIZE } else { limit };

            let rows = sqlx::query(&format!(
                r"
                WITH due AS (
                    SELECT id
                    FROM outbox
                    WHERE status = 'pending'
                      AND next_retry_at <= now()
                    ORDER BY created_at, id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox o
                SET status = 'processing',
                    processing_started_at = now(),
                    attempts = o.attempts + 1,
                    updated_at = now()
                FROM due
                WHERE o.id = due.id
                RETURNING {}
                ",
                qualified_columns("o")
            ))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            let mut records = rows
                .iter()
                .map(row_to_record)
                .collect::<Result<Vec<_>, _>>()?;

            // UPDATE ... RETURNING does not preserve the CTE order
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

            Ok(records)
        })
    }

    fn mark_sent(&self, id: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'sent',
                    sent_at = now(),
                    processing_started_at = NULL,
                    last_error = NULL,
                    updated_at = now()
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id);

            self.finish(id, query, OutboxStatus::Sent).await
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'pending',
                    processing_started_at = NULL,
                    next_retry_at = $2,
                    last_error = $3,
                    updated_at = now()
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id)
            .bind(next_retry_at)
            .bind(error);

            self.finish(id, query, OutboxStatus::Pending).await
        })
    }

    fn mark_dead<'a>(&'a self, id: i64, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'dead',
                    processing_started_at = NULL,
                    last_error = $2,
                    updated_at = now()
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id)
            .bind(error);

            self.finish(id, query, OutboxStatus::Dead).await
        })
    }

    fn requeue_stuck(&self, timeout: Duration) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let timeout = if timeout.is_zero() {
                DEFAULT_PROCESSING_TIMEOUT
            } else {
                timeout
            };

            let result = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'pending',
                    processing_started_at = NULL,
                    next_retry_at = now(),
                    last_error = $2,
                    updated_at = now()
                WHERE status = 'processing'
                  AND processing_started_at IS NOT NULL
                  AND processing_started_at < now() - make_interval(secs => $1)
                ",
            )
            .bind(timeout.as_secs_f64())
            .bind(PROCESSING_TIMEOUT_ERROR)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            Ok(result.rows_affected())
        })
    }

    fn lag_seconds(&self) -> StoreFuture<'_, f64> {
        Box::pin(async move {
            let (lag,): (f64,) = sqlx::query_as(
                r"
                SELECT COALESCE(EXTRACT(EPOCH FROM (now() - MIN(created_at))), 0)::float8
                FROM outbox
                WHERE status = 'pending'
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

            Ok(lag.max(0.0))
        })
    }
}

fn qualified_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert a database row to an [`OutboxRecord`].
fn row_to_record(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(db_error)?,
        event_id: row.try_get("event_id").map_err(db_error)?,
        aggregate: row.try_get("aggregate").map_err(db_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(db_error)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        status: OutboxStatus::parse(&status)?,
        attempts: row.try_get("attempts").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        processing_started_at: row.try_get("processing_started_at").map_err(db_error)?,
        sent_at: row.try_get("sent_at").map_err(db_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(db_error)?,
        last_error: row.try_get("last_error").map_err(db_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_clause_is_alias_qualified() {
        let columns = qualified_columns("o");
        assert!(columns.starts_with("o.id, o.event_id, "));
        assert!(columns.ends_with("o.next_retry_at, o.last_error"));
        assert_eq!(columns.matches("o.").count(), RECORD_COLUMNS.split(", ").count());
    }
}
