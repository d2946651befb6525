//! # Outbox Core
//!
//! Core traits and types for moving state-change events out of a relational
//! store and into a partitioned log with effectively-once processing.
//!
//! The crate is pure data contract plus seams. It has no I/O of its own:
//!
//! - [`envelope`]: the wire format exchanged over the log, and dead-letter records
//! - [`outbox`]: outbox rows, their lifecycle, and the [`OutboxStore`](outbox::OutboxStore) trait
//! - [`processed`]: the idempotency ledger and the
//!   [`ProcessedEventStore`](processed::ProcessedEventStore) trait
//! - [`transport`]: the [`LogProducer`](transport::LogProducer) /
//!   [`LogConsumer`](transport::LogConsumer) seams over the partitioned log
//! - [`error`]: store errors and the failure taxonomy shared by relay and consumer
//!
//! ## Data Flow
//!
//! ```text
//! domain write ──► outbox row (pending)
//!                      │
//!                      ▼  claim (skip locked)
//!                  relay ──► producer ──► partitioned log
//!                                              │
//!                                              ▼  fetch
//!                                          consumer ──► ledger (dedup) ──► business effect
//!                                              │
//!                                              ▼
//!                                        offset commit
//! ```
//!
//! Implementations live in sibling crates: `outbox-postgres` for the stores,
//! `outbox-redpanda` for the transport, `outbox-testing` for in-memory doubles.

pub mod envelope;
pub mod error;
pub mod outbox;
pub mod processed;
pub mod transport;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use envelope::{DeadLetter, Envelope, EnvelopeError};
pub use error::{FailureReason, StoreError};
pub use outbox::{NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStore};
pub use processed::{ProcessedEvent, ProcessedEventStore, ProcessedStatus, StartOutcome};
pub use transport::{LogConsumer, LogMessage, LogProducer, TransportError, TransportErrorKind};

/// Environment module - Dependency injection traits
///
/// External dependencies the relay and consumer read from the world are
/// abstracted behind traits so tests can pin them down.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use outbox_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
