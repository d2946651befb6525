//! # Outbox Runtime
//!
//! The two long-running loops of the outbox pipeline and their shared plumbing.
//!
//! ## Core Components
//!
//! - **[`OutboxRelay`](relay::OutboxRelay)**: claims pending outbox rows, publishes
//!   them keyed by aggregate id, and records each row's outcome
//! - **[`NotificationConsumer`](notification::NotificationConsumer)**: fetches one
//!   message at a time, deduplicates it through the idempotency ledger, applies
//!   the business effect and commits only once the message's fate is decided
//! - **[`BackoffPolicy`](retry::BackoffPolicy)**: the retry schedule both loops share
//! - **Metrics**: recorders passed into each loop, plus the global Prometheus recorder
//! - **Shutdown**: signal handling and broadcast fan-out
//!
//! ## Example
//!
//! ```ignore
//! use outbox_runtime::relay::{OutboxRelay, RelayConfig};
//! use outbox_runtime::shutdown::{Shutdown, shutdown_signal};
//!
//! let shutdown = Shutdown::new();
//! let relay = OutboxRelay::new(store, producer, RelayConfig::default());
//!
//! let task = tokio::spawn({
//!     let rx = shutdown.subscribe();
//!     async move { relay.run(rx).await }
//! });
//!
//! shutdown_signal().await;
//! shutdown.trigger();
//! ```

/// Business-effect seam
pub mod handler;

/// Prometheus metrics for observability
pub mod metrics;

/// Idempotent consumer loop
pub mod notification;

/// Outbox relay loop
pub mod relay;

/// Exponential backoff
pub mod retry;

/// Signal handling and shutdown fan-out
pub mod shutdown;

pub use handler::{EventHandler, ForcedFailure, HandlerError, HandlerFuture, LoggingNotifier};
pub use metrics::{ConsumerMetrics, MetricsError, PrometheusMetrics, RelayMetrics};
pub use notification::{ConsumerConfig, MessageOutcome, NotificationConsumer};
pub use relay::{OutboxRelay, RelayConfig, RowOutcome, TickReport};
pub use retry::BackoffPolicy;
pub use shutdown::{Shutdown, shutdown_signal};
