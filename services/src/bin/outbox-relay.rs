//! Outbox relay service.
//!
//! Polls the `outbox` table and publishes pending events to Kafka, keyed by
//! aggregate id.

use anyhow::Context;
use outbox_core::LogProducer;
use outbox_postgres::PostgresOutboxStore;
use outbox_redpanda::RedpandaProducer;
use outbox_runtime::{
    OutboxRelay, PrometheusMetrics, RelayConfig, RelayMetrics, Shutdown, shutdown_signal,
};
use outbox_services::{Readiness, RelaySettings, ops, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SERVICE: &str = "outbox-relay";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = RelaySettings::from_env().context("Failed to load configuration")?;
    telemetry::init(SERVICE, &settings.app_env)?;

    info!(
        brokers = %settings.kafka.bootstrap_servers(),
        topic = %settings.kafka.topic,
        dlq_topic = settings.kafka.dlq_topic.as_deref().unwrap_or(""),
        batch_size = settings.batch_size,
        max_attempts = settings.max_attempts,
        "Starting outbox relay"
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

    let producer = Arc::new(
        RedpandaProducer::builder()
            .brokers(settings.kafka.bootstrap_servers())
            .topic(&settings.kafka.topic)
            .client_id(&settings.client_id)
            .write_timeout(settings.write_timeout)
            .build()
            .context("Failed to create producer")?,
    );

    let dead_letter = match &settings.kafka.dlq_topic {
        Some(topic) => Some(Arc::new(
            RedpandaProducer::builder()
                .brokers(settings.kafka.bootstrap_servers())
                .topic(topic)
                .client_id(format!("{}-dlq", settings.client_id))
                .write_timeout(settings.write_timeout)
                .build()
                .context("Failed to create dead-letter producer")?,
        )),
        None => None,
    };

    let config = RelayConfig {
        batch_size: settings.batch_size,
        poll_interval: settings.poll_interval,
        processing_timeout: settings.processing_timeout,
        max_attempts: settings.max_attempts,
        publish_timeout: settings.write_timeout,
    };
    let mut relay = OutboxRelay::new(
        Arc::new(PostgresOutboxStore::new(pool.clone())),
        producer.clone(),
        config,
    )
    .with_metrics(Arc::new(RelayMetrics::new()));
    if let Some(dead_letter) = &dead_letter {
        relay = relay.with_dead_letter(dead_letter.clone());
    }

    let task = tokio::spawn({
        let rx = shutdown.subscribe();
        async move { relay.run(rx).await }
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

    if let Err(e) = producer.close().await {
        warn!(error = %e, "Failed to close producer");
    }
    if let Some(dead_letter) = dead_letter {
        if let Err(e) = dead_letter.close().await {
            warn!(error = %e, "Failed to close dead-letter producer");
        }
    }
    pool.close().await;

    info!("Outbox relay stopped");
    Ok(())
}
