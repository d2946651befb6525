//! Store errors and the failure taxonomy shared by the relay and the consumer.

use std::fmt;
use thiserror::Error;

/// Errors that can occur during outbox or ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A status column held a value outside the known state machine.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
}

/// Why handling an event failed.
///
/// Only [`FailureReason::Decode`] is non-retryable. Every other reason is
/// retried with backoff until the attempt budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Malformed envelope. Dead-lettered on first sight.
    Decode,
    /// Ledger or outbox read/write failure.
    Store,
    /// Publish or fetch failure against the log.
    Transport,
    /// Failure injected on purpose by the forced-failure knob.
    Forced,
    /// The business effect itself failed.
    Business,
}

impl FailureReason {
    /// Stable label used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Store => "store",
            Self::Transport => "transport",
            Self::Forced => "forced",
            Self::Business => "business",
        }
    }

    /// Whether another attempt could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
