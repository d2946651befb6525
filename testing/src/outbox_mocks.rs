//! In-memory outbox store.

#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use outbox_core::environment::Clock;
use outbox_core::outbox::{
    DEFAULT_BATCH_SIZE, DEFAULT_PROCESSING_TIMEOUT, PROCESSING_TIMEOUT_ERROR, StoreFuture,
};
use outbox_core::{NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStore, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, OutboxRecord>,
    next_id: i64,
}

/// In-memory [`OutboxStore`] with the same semantics as the Postgres store.
///
/// One mutex guards the whole table, so concurrent claims are disjoint.
/// Time comes from the injected [`Clock`], which lets tests cross retry
/// schedules and processing timeouts by advancing a [`ManualClock`](crate::ManualClock).
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    table: Arc<Mutex<Table>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Insert a `pending` row due now, as the domain write path would.
    pub fn insert(&self, record: NewOutboxRecord) -> i64 {
        let now = self.clock.now();
        let mut table = self.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(
            id,
            OutboxRecord {
                id,
                event_id: record.event_id,
                aggregate: record.aggregate,
                aggregate_id: record.aggregate_id,
                event_type: record.event_type,
                payload: record.payload,
                status: OutboxStatus::Pending,
                attempts: 0,
                created_at: now,
                processing_started_at: None,
                sent_at: None,
                next_retry_at: now,
                last_error: None,
            },
        );
        id
    }

    /// Snapshot of one row.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<OutboxRecord> {
        self.lock().rows.get(&id).cloned()
    }

    /// Snapshot of every row, in id order.
    #[must_use]
    pub fn all(&self) -> Vec<OutboxRecord> {
        self.lock().rows.values().cloned().collect()
    }

    /// Number of rows in `status`.
    #[must_use]
    pub fn count(&self, status: OutboxStatus) -> usize {
        self.lock()
            .rows
            .values()
            .filter(|row| row.status == status)
            .count()
    }

    /// When set, every operation fails with [`StoreError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Database("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn finish(
        &self,
        id: i64,
        next: OutboxStatus,
        apply: impl FnOnce(&mut OutboxRecord, DateTime<Utc>),
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut table = self.lock();
        if let Some(row) = table.rows.get_mut(&id) {
            if row.status.can_transition_to(next) {
                row.status = next;
                row.processing_started_at = None;
                apply(row, now);
            }
        }
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn claim_pending(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            self.check_available()?;
            let limit = if limit == 0 { DEFAULT_BATCH_SIZE } else { limit };
            let now = self.clock.now();
            let mut table = self.lock();

            let mut due: Vec<(DateTime<Utc>, i64)> = table
                .rows
                .values()
                .filter(|row| row.status == OutboxStatus::Pending && row.next_retry_at <= now)
                .map(|row| (row.created_at, row.id))
                .collect();
            due.sort_unstable();
            due.truncate(limit);

            let mut claimed = Vec::with_capacity(due.len());
            for (_, id) in due {
                if let Some(row) = table.rows.get_mut(&id) {
                    row.status = OutboxStatus::Processing;
                    row.processing_started_at = Some(now);
                    row.attempts += 1;
                    claimed.push(row.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn mark_sent(&self, id: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.finish(id, OutboxStatus::Sent, |row, now| {
                row.sent_at = Some(now);
                row.last_error = None;
            })
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.finish(id, OutboxStatus::Pending, |row, _| {
                row.next_retry_at = next_retry_at;
                row.last_error = Some(error.to_string());
            })
        })
    }

    fn mark_dead<'a>(&'a self, id: i64, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.finish(id, OutboxStatus::Dead, |row, _| {
                row.last_error = Some(error.to_string());
            })
        })
    }

    fn requeue_stuck(&self, timeout: Duration) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.check_available()?;
            let timeout = if timeout.is_zero() {
                DEFAULT_PROCESSING_TIMEOUT
            } else {
                timeout
            };
            let now = self.clock.now();
            let cutoff =
                now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());

            let mut requeued = 0;
            for row in self.lock().rows.values_mut() {
                let expired = row
                    .processing_started_at
                    .is_some_and(|started| started < cutoff);
                if row.status == OutboxStatus::Processing && expired {
                    row.status = OutboxStatus::Pending;
                    row.processing_started_at = None;
                    row.next_retry_at = now;
                    row.last_error = Some(PROCESSING_TIMEOUT_ERROR.to_string());
                    requeued += 1;
                }
            }
            Ok(requeued)
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn lag_seconds(&self) -> StoreFuture<'_, f64> {
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let oldest = self
                .lock()
                .rows
                .values()
                .filter(|row| row.status == OutboxStatus::Pending)
                .map(|row| row.created_at)
                .min();

            Ok(oldest.map_or(0.0, |created| {
                ((now - created).num_milliseconds() as f64 / 1000.0).max(0.0)
            }))
        })
    }
}
