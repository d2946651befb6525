//! Outbox rows and the store abstraction the relay drives.
//!
//! # Lifecycle
//!
//! ```text
//!            claim                 publish ok
//! pending ──────────► processing ─────────────► sent      (terminal)
//!    ▲                    │  │
//!    │   publish failed   │  │   attempts exhausted
//!    └────────────────────┘  └─────────────────► dead     (terminal)
//!    ▲                    │
//!    │ processing timeout │
//!    └────────────────────┘   (requeue stuck)
//! ```
//!
//! Rows are created by the domain write path (see [`NewOutboxRecord`]) inside
//! the same transaction as the business row, mutated only by the relay, and
//! never deleted here.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Batch size used when a caller asks for zero rows.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Processing timeout used when a caller passes a zero timeout.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);

/// `last_error` written on rows recovered by [`OutboxStore::requeue_stuck`].
pub const PROCESSING_TIMEOUT_ERROR: &str = "processing timeout";

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Waiting to be claimed (possibly after a retry delay).
    Pending,
    /// Claimed by exactly one relay instance.
    Processing,
    /// Published to the log.
    Sent,
    /// Gave up after exhausting attempts.
    Dead,
}

impl OutboxStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Dead => "dead",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidStatus`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "dead" => Ok(Self::Dead),
            _ => Err(StoreError::InvalidStatus(format!("outbox status: {s}"))),
        }
    }

    /// `sent` and `dead` never change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }

    /// Guarded transitions of the outbox state machine.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Sent | Self::Pending | Self::Dead)
        )
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Storage-assigned identity
    pub id: i64,
    /// Caller-assigned, globally unique event identity
    pub event_id: String,
    /// Aggregate kind
    pub aggregate: String,
    /// Aggregate identity (partitioning key)
    pub aggregate_id: String,
    /// Event type
    pub event_type: String,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Current status
    pub status: OutboxStatus,
    /// Number of claims so far
    pub attempts: i32,
    /// When the domain write happened
    pub created_at: DateTime<Utc>,
    /// When the current claim started (only while processing)
    pub processing_started_at: Option<DateTime<Utc>>,
    /// When the row was published
    pub sent_at: Option<DateTime<Utc>>,
    /// Earliest time the row may be claimed again
    pub next_retry_at: DateTime<Utc>,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// A row the domain write path inserts into the outbox.
///
/// Inserted with `status = 'pending'` and `attempts = 0`, in the same
/// transaction as the business write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    /// Event identity carried into the envelope
    pub event_id: String,
    /// Aggregate kind
    pub aggregate: String,
    /// Aggregate identity
    pub aggregate_id: String,
    /// Event type
    pub event_type: String,
    /// Payload
    pub payload: serde_json::Value,
}

impl NewOutboxRecord {
    /// Create a row with a freshly generated (v4 UUID) event id.
    #[must_use]
    pub fn new(
        aggregate: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            aggregate: aggregate.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Use a caller-chosen event id instead of a generated one.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }
}

/// Relational store behind the outbox relay.
///
/// Implementations must make every operation atomic at the row level. In
/// particular [`claim_pending`](Self::claim_pending) must let concurrently
/// running relays claim disjoint rows without blocking each other.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the relay can hold an
/// `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due `pending` rows, oldest first.
    ///
    /// Claimed rows move to `processing`, get `processing_started_at = now`
    /// and `attempts + 1`. Nothing due yields an empty vector. A zero limit
    /// falls back to [`DEFAULT_BATCH_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the claim fails.
    fn claim_pending(&self, limit: usize) -> StoreFuture<'_, Vec<OutboxRecord>>;

    /// `processing → sent`. Clears `processing_started_at` and `last_error`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_sent(&self, id: i64) -> StoreFuture<'_, ()>;

    /// `processing → pending` with a retry time and the failure recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_failed<'a>(
        &'a self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// `processing → dead`. No further retries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_dead<'a>(&'a self, id: i64, error: &'a str) -> StoreFuture<'a, ()>;

    /// Force rows stuck in `processing` longer than `timeout` back to `pending`,
    /// due immediately. Returns how many rows were recovered. A zero timeout
    /// falls back to [`DEFAULT_PROCESSING_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn requeue_stuck(&self, timeout: Duration) -> StoreFuture<'_, u64>;

    /// Age in seconds of the oldest `pending` row, zero when none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn lag_seconds(&self) -> StoreFuture<'_, f64>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Sent,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("published").is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Sent,
            OutboxStatus::Dead,
        ] {
            assert!(!OutboxStatus::Sent.can_transition_to(next));
            assert!(!OutboxStatus::Dead.can_transition_to(next));
        }
    }

    #[test]
    fn pending_only_moves_through_a_claim() {
        assert!(OutboxStatus::Pending.can_transition_to(OutboxStatus::Processing));
        assert!(!OutboxStatus::Pending.can_transition_to(OutboxStatus::Sent));
        assert!(!OutboxStatus::Pending.can_transition_to(OutboxStatus::Dead));
        assert!(OutboxStatus::Processing.can_transition_to(OutboxStatus::Pending));
    }

    #[test]
    fn new_records_get_distinct_event_ids() {
        let a = NewOutboxRecord::new("ticket", "T1", "ticket.created", serde_json::json!({}));
        let b = NewOutboxRecord::new("ticket", "T1", "ticket.created", serde_json::json!({}));
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.with_event_id("fixed").event_id, "fixed");
    }
}
