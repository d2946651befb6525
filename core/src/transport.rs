//! Producer and consumer seams over the partitioned log.
//!
//! The relay publishes through a [`LogProducer`]; the notification consumer
//! reads through a [`LogConsumer`]. Both are thin: no business logic, no
//! decoding, only bytes, keys and offsets.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **Ordered within partition**: messages with the same key land on the same partition
//! - **Manual commits**: offsets advance only when the caller says so
//!
//! # Error Classification
//!
//! Transport failures carry a closed [`TransportErrorKind`]. The kind, not the
//! error text, decides whether a client rebuilds its connection before retrying.
//!
//! # Dyn Compatibility
//!
//! Both traits use explicit `Pin<Box<dyn Future>>` returns so orchestrators can
//! hold `Arc<dyn LogProducer>` / `Arc<dyn LogConsumer>`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Structured cause of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Broker refused or could not be reached / resolved.
    ConnectionRefused,
    /// Request or message delivery timed out.
    Timeout,
    /// Cached cluster metadata is out of date (leadership moved, unknown broker).
    StaleMetadata,
    /// An established connection broke mid-flight.
    BrokenConnection,
    /// The client was closed locally.
    Closed,
    /// Anything else (bad message, authorisation, broker-side rejection).
    Other,
}

impl TransportErrorKind {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::Timeout => "timeout",
            Self::StaleMetadata => "stale_metadata",
            Self::BrokenConnection => "broken_connection",
            Self::Closed => "closed",
            Self::Other => "other",
        }
    }

    /// Whether rebuilding the client connection / metadata could cure this failure.
    #[must_use]
    pub const fn warrants_reset(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::Timeout | Self::StaleMetadata | Self::BrokenConnection
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure talking to the log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport error ({kind}): {message}")]
pub struct TransportError {
    /// Structured cause
    pub kind: TransportErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl TransportError {
    /// Create a transport error.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The client has been closed.
    #[must_use]
    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "client is closed")
    }
}

/// A message fetched from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Topic the message came from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partitioning key, if any
    pub key: Option<Vec<u8>>,
    /// Message body
    pub value: Vec<u8>,
}

/// Durable publisher to one topic of the log.
pub trait LogProducer: Send + Sync {
    /// Publish one message and wait for at least one broker acknowledgement,
    /// bounded by `timeout`. A zero timeout means "use the producer default".
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the message was not acknowledged.
    fn publish<'a>(
        &'a self,
        key: &'a [u8],
        value: &'a [u8],
        timeout: Duration,
    ) -> TransportFuture<'a, ()>;

    /// Close the producer. Idempotent; safe to race with in-flight publishes,
    /// which either complete or observe [`TransportErrorKind::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if flushing buffered messages fails.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// Consumer-group subscriber that never commits on its own.
pub trait LogConsumer: Send + Sync {
    /// Wait for the next message. Cancel by dropping the future.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if fetching fails.
    fn fetch_message(&self) -> TransportFuture<'_, LogMessage>;

    /// Advance the group's committed offsets past `messages`.
    ///
    /// Call only once each message's fate is decided (success or terminal failure).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the commit fails.
    fn commit_messages<'a>(&'a self, messages: &'a [LogMessage]) -> TransportFuture<'a, ()>;

    /// Leave the group and release the client. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if closing fails.
    fn close(&self) -> TransportFuture<'_, ()>;
}
