//! Kafka error classification and reset rate limiting.

use outbox_core::{TransportError, TransportErrorKind};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Minimum interval between two client rebuilds.
pub const DEFAULT_MIN_RESET_INTERVAL: Duration = Duration::from_secs(2);

/// Map a librdkafka error code onto the transport taxonomy.
#[must_use]
pub const fn classify_code(code: RDKafkaErrorCode) -> TransportErrorKind {
    match code {
        RDKafkaErrorCode::BrokerTransportFailure | RDKafkaErrorCode::NetworkException => {
            TransportErrorKind::BrokenConnection
        }
        RDKafkaErrorCode::Resolve | RDKafkaErrorCode::AllBrokersDown => {
            TransportErrorKind::ConnectionRefused
        }
        RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::OperationTimedOut => TransportErrorKind::Timeout,
        RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownPartition
        | RDKafkaErrorCode::UnknownTopic => TransportErrorKind::StaleMetadata,
        _ => TransportErrorKind::Other,
    }
}

/// Classify a client error by its structured code, never by its text.
#[must_use]
pub fn classify(err: &KafkaError) -> TransportErrorKind {
    err.rdkafka_error_code()
        .map_or(TransportErrorKind::Other, classify_code)
}

/// Wrap a client error as a [`TransportError`].
#[must_use]
pub fn transport_error(err: &KafkaError) -> TransportError {
    TransportError::new(classify(err), err.to_string())
}

/// Admits at most one client rebuild per interval.
///
/// Under a sustained outage every publish fails with a reset-worthy error;
/// without the gate each failure would tear down and rebuild the client.
#[derive(Debug)]
pub struct ResetGate {
    min_interval: Duration,
    last_reset: Mutex<Option<Instant>>,
}

impl ResetGate {
    /// Create a gate with the given minimum interval.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_reset: Mutex::new(None),
        }
    }

    /// Returns `true` and records `now` if a reset is allowed at `now`.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut last = self
            .last_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for ResetGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RESET_INTERVAL)
    }
}
