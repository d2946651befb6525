//! The business-effect seam of the notification consumer.
//!
//! The consumer owns decoding, deduplication, retries and commits. A handler
//! only applies the effect of one decoded [`Envelope`] and reports why it
//! failed, if it did.

use outbox_core::{Envelope, FailureReason};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tracing::{info, warn};

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Failure applying an event's business effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct HandlerError {
    /// Failure class, used for retry decisions and metric labels
    pub reason: FailureReason,
    /// Detail recorded in the ledger and dead-letter record
    pub message: String,
}

impl HandlerError {
    /// Create a handler error.
    #[must_use]
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// The effect itself failed.
    #[must_use]
    pub fn business(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Business, message)
    }

    /// Failure injected by [`ForcedFailure`].
    #[must_use]
    pub fn forced() -> Self {
        Self::new(FailureReason::Forced, "forced failure")
    }
}

/// Applies the business effect of one event.
///
/// Called at most once per delivery attempt, and never for an event the
/// ledger already holds as done or failed.
pub trait EventHandler: Send + Sync {
    /// Apply the effect of `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the effect could not be applied. Every
    /// reason except [`FailureReason::Decode`] is retried.
    fn handle<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a>;
}

/// Handler whose effect is a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl EventHandler for LoggingNotifier {
    fn handle<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                aggregate_id = %envelope.aggregate_id,
                request_id = envelope.request_id.as_deref().unwrap_or(""),
                "Notification sent"
            );
            Ok(())
        })
    }
}

/// Wraps a handler and fails matching events on purpose.
///
/// Used to exercise the retry and dead-letter paths of a live deployment.
/// The event type match ignores surrounding whitespace and case; an empty
/// type matches every event.
#[derive(Debug, Clone)]
pub struct ForcedFailure<H> {
    inner: H,
    enabled: bool,
    event_type: String,
}

impl<H> ForcedFailure<H> {
    /// Wrap `inner`. Nothing is forced unless `enabled`.
    #[must_use]
    pub fn new(inner: H, enabled: bool, event_type: impl Into<String>) -> Self {
        Self {
            inner,
            enabled,
            event_type: event_type.into().trim().to_string(),
        }
    }

    /// Whether `event_type` would be failed.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        self.enabled
            && (self.event_type.is_empty()
                || self.event_type.eq_ignore_ascii_case(event_type.trim()))
    }
}

impl<H: EventHandler> EventHandler for ForcedFailure<H> {
    fn handle<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a> {
        if self.matches(&envelope.event_type) {
            return Box::pin(async move {
                warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    force_fail_event_type = %self.event_type,
                    "Forced failure hit"
                );
                Err(HandlerError::forced())
            });
        }
        self.inner.handle(envelope)
    }
}
