//! Consumer-group reader with manual commits.

use crate::error::{DEFAULT_MIN_RESET_INTERVAL, ResetGate, transport_error};
use outbox_core::transport::TransportFuture;
use outbox_core::{LogConsumer, LogMessage, TransportError, TransportErrorKind};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Where a group with no committed offsets starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Beginning of each partition.
    First,
    /// Only messages produced after the group joined.
    #[default]
    Last,
}

impl StartOffset {
    /// `"first"` (any case) selects [`StartOffset::First`]; anything else is [`StartOffset::Last`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("first") {
            Self::First
        } else {
            Self::Last
        }
    }

    /// librdkafka `auto.offset.reset` value.
    #[must_use]
    pub const fn auto_offset_reset(self) -> &'static str {
        match self {
            Self::First => "earliest",
            Self::Last => "latest",
        }
    }
}

/// Kafka-compatible consumer for one topic in one consumer group.
///
/// Auto-commit is off: offsets move only through
/// [`LogConsumer::commit_messages`]. A fetch that fails with a
/// connection-level error rebuilds the client, rate-limited like the producer.
pub struct RedpandaConsumer {
    config: ClientConfig,
    topic: String,
    group_id: String,
    client: RwLock<Option<Arc<StreamConsumer>>>,
    reset_gate: ResetGate,
}

impl RedpandaConsumer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Close the current client and subscribe a fresh one with the original
    /// configuration. Skipped if a reopen happened within the reset interval
    /// or the consumer is closed.
    pub fn reopen(&self) {
        if !self.reset_gate.try_acquire(Instant::now()) {
            tracing::debug!(topic = %self.topic, "Consumer reopen skipped, rate limited");
            return;
        }

        let fresh = match subscribe(&self.config, &self.topic) {
            Ok(consumer) => consumer,
            Err(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "Failed to reopen consumer");
                return;
            }
        };

        let previous = {
            let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                return;
            }
            slot.replace(Arc::new(fresh))
        };
        drop(previous);

        tracing::info!(topic = %self.topic, group_id = %self.group_id, "Consumer reopened");
    }

    fn current(&self) -> Result<Arc<StreamConsumer>, TransportError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(TransportError::closed)
    }
}

fn subscribe(config: &ClientConfig, topic: &str) -> Result<StreamConsumer, TransportError> {
    let consumer: StreamConsumer = config.create().map_err(|e| transport_error(&e))?;
    consumer
        .subscribe(&[topic])
        .map_err(|e| transport_error(&e))?;
    Ok(consumer)
}

/// Highest offset per partition, plus one: the next offset the group should read.
fn commit_positions(messages: &[LogMessage]) -> BTreeMap<(&str, i32), i64> {
    let mut positions = BTreeMap::new();
    for message in messages {
        let next = message.offset + 1;
        positions
            .entry((message.topic.as_str(), message.partition))
            .and_modify(|current: &mut i64| *current = (*current).max(next))
            .or_insert(next);
    }
    positions
}

impl LogConsumer for RedpandaConsumer {
    fn fetch_message(&self) -> TransportFuture<'_, LogMessage> {
        Box::pin(async move {
            let client = self.current()?;

            let result = match client.recv().await {
                Ok(message) => Ok(LogMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    value: message.payload().unwrap_or_default().to_vec(),
                }),
                Err(e) => Err(transport_error(&e)),
            };

            if let Err(err) = &result {
                if err.kind.warrants_reset() {
                    self.reopen();
                }
            }

            result
        })
    }

    fn commit_messages<'a>(&'a self, messages: &'a [LogMessage]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(());
            }

            let client = self.current()?;
            let mut positions = TopicPartitionList::new();
            for ((topic, partition), next) in commit_positions(messages) {
                positions
                    .add_partition_offset(topic, partition, Offset::Offset(next))
                    .map_err(|e| transport_error(&e))?;
            }

            client
                .commit(&positions, CommitMode::Async)
                .map_err(|e| transport_error(&e))
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let client = self
                .client
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            let Some(client) = client else {
                return Ok(());
            };

            // Leaving the group blocks until the coordinator answers
            tokio::task::spawn_blocking(move || {
                client.unsubscribe();
                drop(client);
            })
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

            tracing::info!(topic = %self.topic, group_id = %self.group_id, "Consumer closed");
            Ok(())
        })
    }
}

/// Builder for [`RedpandaConsumer`].
#[derive(Default)]
pub struct RedpandaConsumerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    group_id: Option<String>,
    start_offset: StartOffset,
    session_timeout: Option<Duration>,
    min_reset_interval: Option<Duration>,
}

impl RedpandaConsumerBuilder {
    /// Comma-separated bootstrap brokers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic to subscribe to.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Start position for a group without committed offsets. Default: [`StartOffset::Last`].
    #[must_use]
    pub const fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    /// Group session timeout. Default: 6 seconds.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Minimum interval between reopens. Default: 2 seconds.
    #[must_use]
    pub const fn min_reset_interval(mut self, interval: Duration) -> Self {
        self.min_reset_interval = Some(interval);
        self
    }

    /// Build and subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if brokers, topic or group are missing, or the
    /// client cannot be created or subscribed.
    pub fn build(self) -> Result<RedpandaConsumer, TransportError> {
        let missing = |what: &str| {
            TransportError::new(TransportErrorKind::Other, format!("{what} not configured"))
        };
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| missing("brokers"))?;
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| missing("topic"))?;
        let group_id = self
            .group_id
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| missing("group id"))?;
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(6));

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", self.start_offset.auto_offset_reset())
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");

        let consumer = subscribe(&config, &topic)?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            group_id = %group_id,
            start_offset = self.start_offset.auto_offset_reset(),
            manual_commit = true,
            "RedpandaConsumer subscribed"
        );

        Ok(RedpandaConsumer {
            config,
            topic,
            group_id,
            client: RwLock::new(Some(Arc::new(consumer))),
            reset_gate: ResetGate::new(
                self.min_reset_interval
                    .unwrap_or(DEFAULT_MIN_RESET_INTERVAL),
            ),
        })
    }
}
