//! Idempotency ledger for the consumer side.
//!
//! One row per event identity ever seen. The row gates the business effect:
//! once it is `done` or `failed`, redeliveries of the same `event_id` are
//! recognised and skipped.
//!
//! ```text
//!   first sighting            effect applied
//! ─────────────────► processing ─────────────► done     (terminal)
//!                     │  ▲
//!   attempt failed    └──┘ attempts + 1 on each redelivery
//!                     │
//!                     └──────────────────────► failed   (terminal, dead-lettered)
//! ```

use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::outbox::StoreFuture;
use chrono::{DateTime, Utc};
use std::fmt;

/// Status of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessedStatus {
    /// Seen, effect not yet confirmed
    Processing,
    /// Effect applied
    Done,
    /// Dead-lettered after exhausting attempts
    Failed,
}

impl ProcessedStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidStatus`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::InvalidStatus(format!("processed status: {s}"))),
        }
    }

    /// `done` and `failed` are immutable.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for ProcessedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    /// Event identity (unique)
    pub event_id: String,
    /// Event type
    pub event_type: String,
    /// Aggregate kind
    pub aggregate: String,
    /// Aggregate identity
    pub aggregate_id: String,
    /// Last-seen payload, kept for diagnostics
    pub payload: serde_json::Value,
    /// Current status
    pub status: ProcessedStatus,
    /// Attempts made while `processing`
    pub attempts: i32,
    /// Most recent failure
    pub last_error: Option<String>,
    /// When the effect was applied
    pub processed_at: Option<DateTime<Utc>>,
    /// When the event was first dead-lettered
    pub failed_at: Option<DateTime<Utc>>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

/// Result of [`ProcessedEventStore::start_processing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// `false` when the event already reached a terminal state
    pub should_process: bool,
    /// Attempt count after this call
    pub attempts: i32,
    /// Status after this call
    pub status: ProcessedStatus,
}

impl StartOutcome {
    /// Build the outcome for a row in `status` with `attempts`.
    #[must_use]
    pub const fn for_row(status: ProcessedStatus, attempts: i32) -> Self {
        Self {
            should_process: !status.is_terminal(),
            attempts,
            status,
        }
    }
}

/// Durable idempotency ledger keyed by event identity.
///
/// Every transition is a single conditional write: terminal rows are never
/// touched again, and `attempts` only grows while the row is `processing`.
pub trait ProcessedEventStore: Send + Sync {
    /// Record an attempt at processing `envelope`.
    ///
    /// - no row: insert `processing`, `attempts = 1`, should process
    /// - `processing` row: `attempts + 1`, should process (crashed or failed earlier attempt)
    /// - `done` / `failed` row: untouched, should not process
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    fn start_processing<'a>(&'a self, envelope: &'a Envelope) -> StoreFuture<'a, StartOutcome>;

    /// `processing → done`, clearing `last_error`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_done<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, ()>;

    /// Record a failed attempt. Status stays `processing` so the next attempt retries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_failed<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()>;

    /// `processing → failed`. `failed_at` is stamped once; a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_dead<'a>(&'a self, event_id: &'a str, error: &'a str) -> StoreFuture<'a, ()>;

    /// Look up a ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn get<'a>(&'a self, event_id: &'a str) -> StoreFuture<'a, Option<ProcessedEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_rows_are_not_processed() {
        assert!(StartOutcome::for_row(ProcessedStatus::Processing, 2).should_process);
        assert!(!StartOutcome::for_row(ProcessedStatus::Done, 1).should_process);
        assert!(!StartOutcome::for_row(ProcessedStatus::Failed, 10).should_process);
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(ProcessedStatus::parse("done"), Ok(ProcessedStatus::Done));
        assert!(ProcessedStatus::parse("sent").is_err());
    }
}
