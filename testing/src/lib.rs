//! # Outbox Testing
//!
//! Testing utilities for the outbox relay and the notification consumer.
//!
//! This crate provides:
//! - [`InMemoryOutboxStore`]: outbox table with the same claim and guard semantics as Postgres
//! - [`InMemoryProcessedEventStore`]: idempotency ledger
//! - [`ScriptedProducer`]: log producer that fails on cue and records what it published
//! - [`InMemoryLogConsumer`]: a single-partition log with manual commits
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use outbox_core::{NewOutboxRecord, OutboxStore};
//! use outbox_testing::{InMemoryOutboxStore, ManualClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Arc::new(ManualClock::default());
//! let store = InMemoryOutboxStore::new(clock.clone());
//! store.insert(NewOutboxRecord::new("ticket", "T1", "ticket.created", serde_json::json!({})));
//!
//! let claimed = store.claim_pending(10).await?;
//! assert_eq!(claimed.len(), 1);
//! # Ok(())
//! # }
//! ```

mod ledger_mocks;
mod outbox_mocks;
mod transport_mocks;

pub use ledger_mocks::InMemoryProcessedEventStore;
pub use outbox_mocks::InMemoryOutboxStore;
pub use transport_mocks::{InMemoryLogConsumer, PublishedMessage, ScriptedProducer};

use chrono::{DateTime, Utc};
use outbox_core::environment::Clock;

/// Mock implementations of the clock.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::FixedClock;
    /// use outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test advances it.
    ///
    /// Retry schedules and processing timeouts can be crossed without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            if let Ok(by) = chrono::Duration::from_std(by) {
                *self.time.lock().unwrap_or_else(PoisonError::into_inner) += by;
            }
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_new_year_2025() {
        assert_eq!(test_clock().now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
