//! Idempotency ledger (`processed_events`).

use crate::db_error;
use outbox_core::outbox::StoreFuture;
use outbox_core::{
    Envelope, ProcessedEvent, ProcessedEventStore, ProcessedStatus, StartOutcome, StoreError,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL`-backed [`ProcessedEventStore`].
///
/// `start_processing` is one conditional upsert, so two consumers racing on
/// the same `event_id` serialise on the primary key and never both observe
/// an absent row.
#[derive(Clone)]
pub struct PostgresProcessedEventStore {
    pool: PgPool,
}

impl PostgresProcessedEventStore {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn guarded_update(
        &self,
        event_id: &str,
        sql: &'static str,
        error: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut query = sqlx::query(sql).bind(event_id);
        if let Some(error) = error {
            query = query.bind(error);
        }

        let result = query.execute(&self.pool).await.map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

impl ProcessedEventStore for PostgresProcessedEventStore {
    fn start_processing<'a>(&'a self, envelope: &'a Envelope) -> StoreFuture<'a, StartOutcome> {
        Box::pin(async move {
            let upserted = sqlx::query(
                r"
                INSERT INTO processed_events
                    (event_id, event_type, aggregate, aggregate_id, payload, status, attempts, updated_at)
                VALUES ($1, $2, $3, $4, $5, 'processing', 1, now())
                ON CONFLICT (event_id) DO UPDATE
                SET attempts = processed_events.attempts + 1,
                    payload = EXCLUDED.payload,
                    updated_at = now()
                WHERE processed_events.status = 'processing'
                RETURNING status, attempts
                ",
            )
            .bind(&envelope.event_id)
            .bind(&envelope.event_type)
            .bind(&envelope.aggregate)
            .bind(&envelope.aggregate_id)
            .bind(&envelope.payload)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            // Nothing returned: the conflict row is terminal and the guard skipped it
            let row = match upserted {
                Some(row) => row,
                None => sqlx::query(
                    "SELECT status, attempts FROM processed_events WHERE event_id = $1",
                )
                .bind(&envelope.event_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?,
            };

            let status: String = row.try_get("status").map_err(db_error)?;
            let attempts: i32 = row.try_get("attempts").map_err(db_error)?;

            Ok(StartOutcome::for_row(
                ProcessedStatus::parse(&status)?,
                attempts,
            ))
        })
    }

    fn mark_done<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let affected = self
                .guarded_update(
                    event_id,
                    r"
                    UPDATE processed_events
                    SET status = 'done',
                        processed_at = now(),
                        last_error = NULL,
                        updated_at = now()
                    WHERE event_id = $1 AND status = 'processing'
                    ",
                    None,
                )
                .await?;

            if affected == 0 {
                tracing::warn!(event_id, "Ledger row not processing, mark_done skipped");
            }

            Ok(())
        })
    }

    fn mark_failed<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.guarded_update(
                event_id,
                r"
                UPDATE processed_events
                SET last_error = $2,
                    updated_at = now()
                WHERE event_id = $1 AND status = 'processing'
                ",
                Some(error),
            )
            .await?;

            Ok(())
        })
    }

    fn mark_dead<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.guarded_update(
                event_id,
                r"
                UPDATE processed_events
                SET status = 'failed',
                    failed_at = COALESCE(failed_at, now()),
                    last_error = $2,
                    updated_at = now()
                WHERE event_id = $1 AND status = 'processing'
                ",
                Some(error),
            )
            .await?;

            Ok(())
        })
    }

    fn get<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, Option<ProcessedEvent>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT event_id, event_type, aggregate, aggregate_id, payload, status,
                       attempts, last_error, processed_at, failed_at, updated_at
                FROM processed_events
                WHERE event_id = $1
                ",
            )
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            row.as_ref().map(row_to_processed_event).transpose()
        })
    }
}

fn row_to_processed_event(row: &PgRow) -> Result<ProcessedEvent, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;

    Ok(ProcessedEvent {
        event_id: row.try_get("event_id").map_err(db_error)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        aggregate: row.try_get("aggregate").map_err(db_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        status: ProcessedStatus::parse(&status)?,
        attempts: row.try_get("attempts").map_err(db_error)?,
        last_error: row.try_get("last_error").map_err(db_error)?,
        processed_at: row.try_get("processed_at").map_err(db_error)?,
        failed_at: row.try_get("failed_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}
