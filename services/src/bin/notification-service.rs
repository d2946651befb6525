//! Notification service.
//!
//! Consumes ticket events, deduplicates them through the `processed_events`
//! ledger and sends one notification per event.

use anyhow::Context;
use outbox_core::{LogConsumer, LogProducer};
use outbox_postgres::PostgresProcessedEventStore;
use outbox_redpanda::{RedpandaConsumer, RedpandaProducer};
use outbox_runtime::{
    ConsumerConfig, ConsumerMetrics, ForcedFailure, LoggingNotifier, PrometheusMetrics,
    NotificationConsumer, Shutdown, shutdown_signal,
};
use outbox_services::{NotifySettings, Readiness, ops, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SERVICE: &str = "notification-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = NotifySettings::from_env().context("Failed to load configuration")?;
    telemetry::init(SERVICE, &settings.app_env)?;

    info!(
        brokers = %settings.kafka.bootstrap_servers(),
        topic = %settings.kafka.topic,
        group_id = %settings.group_id,
        start_offset = ?settings.start_offset,
        dlq_topic = settings.kafka.dlq_topic.as_deref().unwrap_or(""),
        max_attempts = settings.max_attempts,
        force_fail = settings.force_fail,
        force_fail_event_type = %settings.force_fail_event_type,
        "Starting notification consumer"
    );

    let shutdown = Shutdown::new();
    let readiness = Readiness::new();
    let metrics = PrometheusMetrics::install().context("Failed to install metrics recorder")?;
    let listener = tokio::net::TcpListener::bind(settings.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.metrics_addr))?;
    info!(addr = %settings.metrics_addr, "Serving /metrics, /healthz and /readyz");
    let ops_task = tokio::spawn(ops::serve(
        listener,
        ops::router(metrics, readiness.clone()),
        shutdown.subscribe(),
    ));

    let pool = outbox_postgres::connect(&settings.database_url, settings.database_max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    outbox_postgres::migrate(&pool)
        .await
        .context("Failed to run migrations")?;

    let consumer = Arc::new(
        RedpandaConsumer::builder()
            .brokers(settings.kafka.bootstrap_servers())
            .topic(&settings.kafka.topic)
            .group_id(&settings.group_id)
            .start_offset(settings.start_offset)
            .build()
            .context("Failed to create consumer")?,
    );

    let dead_letter = match &settings.kafka.dlq_topic {
        Some(topic) => Some(Arc::new(
            RedpandaProducer::builder()
                .brokers(settings.kafka.bootstrap_servers())
                .topic(topic)
                .client_id(format!("{SERVICE}-dlq"))
                .build()
                .context("Failed to create dead-letter producer")?,
        )),
        None => None,
    };

    let handler = ForcedFailure::new(
        LoggingNotifier,
        settings.force_fail,
        settings.force_fail_event_type.as_str(),
    );
    let config = ConsumerConfig {
        max_attempts: settings.max_attempts,
        ..ConsumerConfig::default()
    };
    let mut notifier = NotificationConsumer::new(
        consumer.clone(),
        Arc::new(PostgresProcessedEventStore::new(pool.clone())),
        Arc::new(handler),
        config,
    )
    .with_metrics(Arc::new(ConsumerMetrics::new()));
    if let Some(dead_letter) = &dead_letter {
        notifier = notifier.with_dead_letter(dead_letter.clone());
    }

    let task = tokio::spawn({
        let rx = shutdown.subscribe();
        async move { notifier.run(rx).await }
    });

    readiness.set_ready(true);

    shutdown_signal().await;
    readiness.set_ready(false);
    shutdown.trigger();
    Shutdown::join(SERVICE, task, Duration::from_secs(10)).await;
    match tokio::time::timeout(Duration::from_secs(5), ops_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Ops server failed"),
        Ok(Err(e)) => warn!(error = %e, "Ops server task panicked"),
        Err(_) => warn!("Ops server did not stop in time"),
    }

    if let Err(e) = consumer.close().await {
        warn!(error = %e, "Failed to close consumer");
    }
    if let Some(dead_letter) = dead_letter {
        if let Err(e) = dead_letter.close().await {
            warn!(error = %e, "Failed to close dead-letter producer");
        }
    }
    pool.close().await;

    info!("Notification consumer stopped");
    Ok(())
}
