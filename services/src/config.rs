//! Configuration management for the relay and the notification service.
//!
//! Loads configuration from environment variables (and a `.env` file, if
//! present) with sensible defaults. Unparsable values fall back to the
//! default; only a missing `DATABASE_URL` is an error.
//!
//! Durations accept `500ms`, `30s`, `2m`, `1h` or bare seconds. Booleans
//! accept `1/0`, `true/false`, `yes/no` and `on/off`.

use outbox_redpanda::StartOffset;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Typed reads over a variable lookup.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.raw(key).ok_or(ConfigError::Missing(key))
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.raw(key)
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn duration(&self, key: &str, default: Duration) -> Duration {
        self.raw(key)
            .and_then(|v| parse_duration(&v))
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.raw(key).and_then(|v| parse_bool(&v)).unwrap_or(default)
    }

    fn csv(&self, key: &str, default: &str) -> Vec<String> {
        let parsed = parse_csv(&self.string(key, default));
        if parsed.is_empty() {
            parse_csv(default)
        } else {
            parsed
        }
    }

    fn addr(&self, key: &str, default: SocketAddr) -> SocketAddr {
        self.raw(key)
            .and_then(|v| parse_listen_addr(&v))
            .unwrap_or(default)
    }
}

/// Parse `500ms`, `30s`, `2m`, `1h` or bare seconds.
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim().to_ascii_lowercase();
    if let Some(ms) = value.strip_suffix("ms") {
        let ms: f64 = ms.trim().parse().ok()?;
        return Duration::try_from_secs_f64(ms / 1000.0).ok();
    }

    let (number, unit_secs) = if let Some(n) = value.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (value.as_str(), 1.0)
    };

    let number: f64 = number.trim().parse().ok()?;
    Duration::try_from_secs_f64(number * unit_secs).ok()
}

/// Parse a boolean flag. A literal `0` is false.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated list, dropping blanks.
#[must_use]
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a listen address; `:9090` binds every interface.
#[must_use]
pub fn parse_listen_addr(value: &str) -> Option<SocketAddr> {
    let value = value.trim();
    match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}").parse().ok(),
        None => value.parse().ok(),
    }
}

/// Log connection settings shared by both services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    /// Bootstrap brokers
    pub brokers: Vec<String>,
    /// Event topic
    pub topic: String,
    /// Dead-letter topic; `None` disables dead-letter publishing
    pub dlq_topic: Option<String>,
}

impl KafkaSettings {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Self {
        Self {
            brokers: vars.csv("KAFKA_BROKERS", "localhost:9092"),
            topic: vars.string("KAFKA_TOPIC", "tickets.events"),
            dlq_topic: vars.optional("KAFKA_DLQ_TOPIC"),
        }
    }

    /// Brokers in librdkafka's `bootstrap.servers` form.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// `outbox-relay` configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// `PostgreSQL` connection URL
    pub database_url: String,
    /// Pool size
    pub database_max_connections: u32,
    /// Log connection
    pub kafka: KafkaSettings,
    /// Client id reported to the brokers
    pub client_id: String,
    /// Rows claimed per tick
    pub batch_size: usize,
    /// Time between ticks
    pub poll_interval: Duration,
    /// Age after which a claimed row is presumed orphaned
    pub processing_timeout: Duration,
    /// Attempts before dead-lettering (0 = unlimited)
    pub max_attempts: u32,
    /// Bound on a single publish
    pub write_timeout: Duration,
    /// Prometheus listen address
    pub metrics_addr: SocketAddr,
    /// Deployment environment (`prod` switches logs to JSON)
    pub app_env: String,
}

impl RelaySettings {
    /// Load from the process environment and `.env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        Ok(Self {
            database_url: vars.required("DATABASE_URL")?,
            database_max_connections: vars.number("DATABASE_MAX_CONNECTIONS", 10),
            kafka: KafkaSettings::load(&vars),
            client_id: vars.string("KAFKA_CLIENT_ID", "outbox-relay"),
            batch_size: vars.number("OUTBOX_RELAY_BATCH_SIZE", 50),
            poll_interval: vars.duration("OUTBOX_RELAY_POLL_INTERVAL", Duration::from_millis(500)),
            processing_timeout: vars
                .duration("OUTBOX_RELAY_PROCESSING_TIMEOUT", Duration::from_secs(30)),
            max_attempts: vars.number("OUTBOX_RELAY_MAX_ATTEMPTS", 10),
            write_timeout: vars.duration("KAFKA_WRITE_TIMEOUT", Duration::from_secs(5)),
            metrics_addr: vars.addr("METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 9090))),
            app_env: vars.string("APP_ENV", "dev"),
        })
    }
}

/// `notification-service` configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySettings {
    /// `PostgreSQL` connection URL
    pub database_url: String,
    /// Pool size
    pub database_max_connections: u32,
    /// Log connection
    pub kafka: KafkaSettings,
    /// Consumer group id
    pub group_id: String,
    /// Start position for a new group
    pub start_offset: StartOffset,
    /// Attempts before dead-lettering (0 = unlimited)
    pub max_attempts: u32,
    /// Fail matching events on purpose
    pub force_fail: bool,
    /// Event type to fail; empty fails every type
    pub force_fail_event_type: String,
    /// Prometheus listen address
    pub metrics_addr: SocketAddr,
    /// Deployment environment (`prod` switches logs to JSON)
    pub app_env: String,
}

impl NotifySettings {
    /// Load from the process environment and `.env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        Ok(Self {
            database_url: vars.required("DATABASE_URL")?,
            database_max_connections: vars.number("DATABASE_MAX_CONNECTIONS", 10),
            kafka: KafkaSettings::load(&vars),
            group_id: vars.string("KAFKA_GROUP_ID", "notification-service"),
            start_offset: StartOffset::parse(&vars.string("KAFKA_START_OFFSET", "last")),
            max_attempts: vars.number("NOTIFY_MAX_ATTEMPTS", 10),
            force_fail: vars.flag("NOTIFY_FORCE_FAIL", false),
            force_fail_event_type: vars.string("NOTIFY_FORCE_FAIL_EVENT_TYPE", ""),
            metrics_addr: vars.addr("METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 9091))),
            app_env: vars.string("APP_ENV", "dev"),
        })
    }
}
