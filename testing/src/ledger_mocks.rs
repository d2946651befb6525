//! In-memory idempotency ledger.

use outbox_core::environment::Clock;
use outbox_core::outbox::StoreFuture;
use outbox_core::{
    Envelope, ProcessedEvent, ProcessedEventStore, ProcessedStatus, StartOutcome, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory [`ProcessedEventStore`].
///
/// Mirrors the conditional-upsert semantics of the Postgres ledger: terminal
/// rows are never modified and `attempts` only grows while `processing`.
#[derive(Clone)]
pub struct InMemoryProcessedEventStore {
    rows: Arc<Mutex<HashMap<String, ProcessedEvent>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryProcessedEventStore {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot of one row.
    #[must_use]
    pub fn snapshot(&self, event_id: &str) -> Option<ProcessedEvent> {
        self.lock().get(event_id).cloned()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// When set, every operation fails with [`StoreError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessedEvent>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Database("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn update_processing(
        &self,
        event_id: &str,
        apply: impl FnOnce(&mut ProcessedEvent),
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        if let Some(row) = self.lock().get_mut(event_id) {
            if row.status == ProcessedStatus::Processing {
                apply(row);
                row.updated_at = now;
            }
        }
        Ok(())
    }
}

impl ProcessedEventStore for InMemoryProcessedEventStore {
    fn start_processing<'a>(&'a self, envelope: &'a Envelope) -> StoreFuture<'a, StartOutcome> {
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let mut rows = self.lock();

            let row = rows
                .entry(envelope.event_id.clone())
                .and_modify(|row| {
                    if row.status == ProcessedStatus::Processing {
                        row.attempts += 1;
                        row.payload = envelope.payload.clone();
                        row.updated_at = now;
                    }
                })
                .or_insert_with(|| ProcessedEvent {
                    event_id: envelope.event_id.clone(),
                    event_type: envelope.event_type.clone(),
                    aggregate: envelope.aggregate.clone(),
                    aggregate_id: envelope.aggregate_id.clone(),
                    payload: envelope.payload.clone(),
                    status: ProcessedStatus::Processing,
                    attempts: 1,
                    last_error: None,
                    processed_at: None,
                    failed_at: None,
                    updated_at: now,
                });

            Ok(StartOutcome::for_row(row.status, row.attempts))
        })
    }

    fn mark_done<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update_processing(event_id, |row| {
                row.status = ProcessedStatus::Done;
                row.processed_at = Some(now);
                row.last_error = None;
            })
        })
    }

    fn mark_failed<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.update_processing(event_id, |row| {
                row.last_error = Some(error.to_string());
            })
        })
    }

    fn mark_dead<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update_processing(event_id, |row| {
                row.status = ProcessedStatus::Failed;
                row.failed_at.get_or_insert(now);
                row.last_error = Some(error.to_string());
            })
        })
    }

    fn get<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, Option<ProcessedEvent>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.snapshot(event_id))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_clock;

    fn envelope(event_id: &str) -> Envelope {
        Envelope {
            event_id: event_id.to_string(),
            event_type: "ticket.created".to_string(),
            occurred_at: test_clock().now(),
            aggregate: "ticket".to_string(),
            aggregate_id: "T1".to_string(),
            request_id: None,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn processing_rows_count_attempts_until_done() {
        let ledger = InMemoryProcessedEventStore::new(Arc::new(test_clock()));
        let event = envelope("e1");

        assert_eq!(
            ledger.start_processing(&event).await.unwrap(),
            StartOutcome::for_row(ProcessedStatus::Processing, 1)
        );
        assert_eq!(ledger.start_processing(&event).await.unwrap().attempts, 2);

        ledger.mark_done("e1").await.unwrap();
        let outcome = ledger.start_processing(&event).await.unwrap();
        assert!(!outcome.should_process);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let ledger = InMemoryProcessedEventStore::new(Arc::new(test_clock()));
        let event = envelope("e2");

        ledger.start_processing(&event).await.unwrap();
        ledger.mark_dead("e2", "exhausted").await.unwrap();
        ledger.mark_done("e2").await.unwrap();

        let row = ledger.snapshot("e2").unwrap();
        assert_eq!(row.status, ProcessedStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("exhausted"));
        assert!(!ledger.start_processing(&event).await.unwrap().should_process);
    }
}
