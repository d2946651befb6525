//! Idempotent notification consumer.
//!
//! A consumer-group reader keeps fetching newer messages whether or not
//! earlier ones were committed, so "retry by not committing" would silently
//! skip a failed message. Instead each fetched message is retried in process
//! until its fate is decided, and only then committed:
//!
//! ```text
//! fetch ──► decode ──► ledger.start_processing ──► handler ──► ledger.mark_done ──► commit
//!             │                  │                    │
//!             │            already done/failed    failure
//!             │                  │                    │
//!             │                  └──► commit          ├──► budget left: backoff, retry same message
//!             │                                       └──► exhausted: dead-letter, ledger.mark_dead, commit
//!             └──► malformed: dead-letter raw bytes, commit
//! ```
//!
//! A crash between the effect and the commit redelivers the message once; the
//! ledger then reports it done and the effect is not applied again.

use crate::handler::EventHandler;
use crate::metrics::ConsumerMetrics;
use crate::retry::BackoffPolicy;
use outbox_core::environment::{Clock, SystemClock};
use outbox_core::{
    DeadLetter, Envelope, FailureReason, LogConsumer, LogMessage, LogProducer,
    ProcessedEventStore, TransportErrorKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Consumer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Attempts before an event is dead-lettered (0 = retry forever)
    pub max_attempts: u32,
    /// Bound on a dead-letter publish
    pub dead_letter_timeout: Duration,
    /// Pause after a failed fetch
    pub fetch_error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            dead_letter_timeout: Duration::from_secs(5),
            fetch_error_backoff: Duration::from_millis(300),
        }
    }
}

/// How one fetched message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Effect applied and committed
    Processed,
    /// Already done or failed in the ledger; committed without applying
    Duplicate,
    /// Malformed or exhausted; dead-lettered and committed
    DeadLettered,
    /// Shutdown arrived while waiting to retry; not committed
    Abandoned,
}

enum Handled {
    Applied,
    Duplicate,
}

struct Failure {
    reason: FailureReason,
    error: String,
    envelope: Option<Envelope>,
    ledger_attempts: u32,
}

impl Failure {
    fn new(reason: FailureReason, error: impl std::fmt::Display) -> Self {
        Self {
            reason,
            error: format!("{reason}: {error}"),
            envelope: None,
            ledger_attempts: 0,
        }
    }

    fn with_envelope(mut self, envelope: &Envelope) -> Self {
        self.envelope = Some(envelope.clone());
        self
    }

    const fn with_attempts(mut self, attempts: u32) -> Self {
        self.ledger_attempts = attempts;
        self
    }

    fn event_type(&self) -> &str {
        self.envelope
            .as_ref()
            .map_or(UNKNOWN_EVENT_TYPE, |e| e.event_type.as_str())
    }
}

/// Fetch loop with per-event deduplication and in-process retries.
pub struct NotificationConsumer {
    consumer: Arc<dyn LogConsumer>,
    ledger: Arc<dyn ProcessedEventStore>,
    handler: Arc<dyn EventHandler>,
    dead_letter: Option<Arc<dyn LogProducer>>,
    metrics: Arc<ConsumerMetrics>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    config: ConsumerConfig,
}

impl NotificationConsumer {
    /// Create a consumer with no dead-letter topic.
    #[must_use]
    pub fn new(
        consumer: Arc<dyn LogConsumer>,
        ledger: Arc<dyn ProcessedEventStore>,
        handler: Arc<dyn EventHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            consumer,
            ledger,
            handler,
            dead_letter: None,
            metrics: Arc::new(ConsumerMetrics::new()),
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::consumer(),
            config,
        }
    }

    /// Publish dead-lettered events through `producer`.
    #[must_use]
    pub fn with_dead_letter(mut self, producer: Arc<dyn LogProducer>) -> Self {
        self.dead_letter = Some(producer);
        self
    }

    /// Record into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stamp commits with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retry schedule.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The consumer's metrics.
    #[must_use]
    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    /// Fetch and settle messages until `shutdown` fires or the consumer is closed.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            max_attempts = self.config.max_attempts,
            dead_letter = self.dead_letter.is_some(),
            "Notification consumer started"
        );

        loop {
            let fetched = tokio::select! {
                _ = shutdown.recv() => break,
                fetched = self.consumer.fetch_message() => fetched,
            };

            match fetched {
                Ok(message) => {
                    self.metrics.record_fetched();
                    log_fetch(&message);
                    if self.process_message(&message, &mut shutdown).await
                        == MessageOutcome::Abandoned
                    {
                        break;
                    }
                }
                Err(e) if e.kind == TransportErrorKind::Closed => {
                    info!("Log consumer closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Fetch failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(self.config.fetch_error_backoff) => {}
                    }
                }
            }
        }

        info!("Notification consumer shutting down");
    }

    /// Settle one message: retry it in place until it is processed, skipped
    /// as a duplicate, or dead-lettered, then commit it.
    ///
    /// Returns [`MessageOutcome::Abandoned`] without committing if `shutdown`
    /// fires during a backoff sleep; the message will be redelivered.
    pub async fn process_message(
        &self,
        message: &LogMessage,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> MessageOutcome {
        let mut local_attempts: u32 = 0;

        loop {
            local_attempts = local_attempts.saturating_add(1);

            let failure = match self.handle(message).await {
                Ok((Handled::Applied, envelope)) => {
                    self.metrics.record_ok(&envelope.event_type);
                    self.commit(message).await;
                    return MessageOutcome::Processed;
                }
                Ok((Handled::Duplicate, envelope)) => {
                    info!(
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        "Skipping already settled event"
                    );
                    self.metrics.record_duplicate(&envelope.event_type);
                    self.commit(message).await;
                    return MessageOutcome::Duplicate;
                }
                Err(failure) => failure,
            };

            let attempts = local_attempts.max(failure.ledger_attempts);
            self.metrics.record_error(failure.event_type(), failure.reason);
            error!(
                reason = %failure.reason,
                attempt = attempts,
                partition = message.partition,
                offset = message.offset,
                error = %failure.error,
                "Message handling failed"
            );

            let exhausted = self.config.max_attempts > 0 && attempts >= self.config.max_attempts;
            if !failure.reason.is_retryable() || exhausted {
                self.bury(message, &failure).await;
                self.commit(message).await;
                return MessageOutcome::DeadLettered;
            }

            let delay = self.backoff.delay_for_attempt(attempts);
            tokio::select! {
                _ = shutdown.recv() => {
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        "Shutdown during retry, leaving message uncommitted"
                    );
                    return MessageOutcome::Abandoned;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn handle(&self, message: &LogMessage) -> Result<(Handled, Envelope), Failure> {
        let envelope =
            Envelope::decode(&message.value).map_err(|e| Failure::new(FailureReason::Decode, e))?;

        let start = self.ledger.start_processing(&envelope).await.map_err(|e| {
            Failure::new(FailureReason::Store, e).with_envelope(&envelope)
        })?;
        let ledger_attempts = u32::try_from(start.attempts).unwrap_or(0);
        if !start.should_process {
            return Ok((Handled::Duplicate, envelope));
        }

        if let Err(e) = self.handler.handle(&envelope).await {
            let failure = Failure::new(e.reason, &e.message)
                .with_envelope(&envelope)
                .with_attempts(ledger_attempts);
            self.record_failure(&envelope, &failure.error).await;
            return Err(failure);
        }

        if let Err(e) = self.ledger.mark_done(&envelope.event_id).await {
            let failure = Failure::new(FailureReason::Store, e)
                .with_envelope(&envelope)
                .with_attempts(ledger_attempts);
            self.record_failure(&envelope, &failure.error).await;
            return Err(failure);
        }

        debug!(event_id = %envelope.event_id, attempt = ledger_attempts, "Event processed");
        Ok((Handled::Applied, envelope))
    }

    async fn record_failure(&self, envelope: &Envelope, error: &str) {
        if let Err(e) = self.ledger.mark_failed(&envelope.event_id, error).await {
            warn!(event_id = %envelope.event_id, error = %e, "Failed to record attempt failure");
        }
    }

    /// Dead-letter a message whose fate is decided, and close its ledger row.
    async fn bury(&self, message: &LogMessage, failure: &Failure) {
        let record = match &failure.envelope {
            Some(envelope) => DeadLetter::for_envelope(&failure.error, envelope.clone()),
            None => DeadLetter::for_raw(&failure.error, &message.value),
        };
        self.publish_dead_letter(message, &record).await;

        if let Some(envelope) = &failure.envelope {
            if let Err(e) = self
                .ledger
                .mark_dead(&envelope.event_id, &failure.error)
                .await
            {
                error!(event_id = %envelope.event_id, error = %e, "Failed to mark event dead");
            }
        }

        self.metrics.record_dead(failure.event_type());
        error!(
            event_type = failure.event_type(),
            partition = message.partition,
            offset = message.offset,
            error = %failure.error,
            "Message dead-lettered"
        );
    }

    async fn publish_dead_letter(&self, message: &LogMessage, record: &DeadLetter) {
        let Some(producer) = &self.dead_letter else {
            return;
        };

        let bytes = match record.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode dead-letter record");
                return;
            }
        };

        let key = match (&message.key, record) {
            (Some(key), _) => key.clone(),
            (None, DeadLetter::Envelope { envelope, .. }) => {
                envelope.aggregate_id.as_bytes().to_vec()
            }
            (None, DeadLetter::Raw { .. }) => Vec::new(),
        };

        if let Err(e) = producer
            .publish(&key, &bytes, self.config.dead_letter_timeout)
            .await
        {
            warn!(error = %e, "Dead-letter publish failed");
        }
    }

    async fn commit(&self, message: &LogMessage) {
        match self
            .consumer
            .commit_messages(std::slice::from_ref(message))
            .await
        {
            Ok(()) => {
                self.metrics.record_committed(self.clock.now().timestamp());
                info!(
                    partition = message.partition,
                    offset = message.offset,
                    "Committed message"
                );
            }
            Err(e) => error!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Commit failed"
            ),
        }
    }
}

fn log_fetch(message: &LogMessage) {
    match Envelope::decode(&message.value) {
        Ok(envelope) => info!(
            partition = message.partition,
            offset = message.offset,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            "Fetched message"
        ),
        Err(e) => warn!(
            partition = message.partition,
            offset = message.offset,
            error = %e,
            "Fetched undecodable message"
        ),
    }
}
