use anyhow::{bail, Context, Result};
use cdc_sink_service::config::{Config, SinkKind};
use cdc_sink_service::metrics::MetricsServer;
use cdc_sink_service::services::cdc::TableResolver;
use cdc_sink_service::services::sink::create_pool;
use cdc_sink_service::services::{
    dead_letter, KafkaBroker, MemorySink, Orchestrator, PostgresSink, SinkStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_sink_service=debug".into());
    if config.json_logs() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(?config, "Starting cdc-sink-service");

    let store: Arc<dyn SinkStore> = match config.sink_kind()? {
        SinkKind::Postgres => {
            let pool = create_pool(&config.postgres_sink_config())
                .await
                .context("Failed to create sink database pool")?;
            Arc::new(PostgresSink::new(pool))
        }
        SinkKind::Memory => {
            warn!("Using in-memory sink; applied rows are discarded on exit");
            Arc::new(MemorySink::new())
        }
    };

    let dead_letter = dead_letter::connect(&config.dead_letter_target()?, &config.kafka_brokers)
        .await
        .context("Failed to open dead-letter output")?;

    let broker = KafkaBroker::new(&config.kafka_settings()).context("Failed to create Kafka consumer")?;

    let resolver = Arc::new(TableResolver::new(config.table_keys()?, config.default_key()));

    let orchestrator = Orchestrator::new(
        Box::new(broker),
        store,
        dead_letter,
        resolver,
        config.pipeline_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let metrics_server = MetricsServer::start(config.metrics_addr()?, shutdown_rx.clone())
        .context("Failed to start metrics endpoint")?;

    let result = orchestrator.run(shutdown_rx).await;
    metrics_server.stop().await;
    let summary = result.context("CDC pipeline failed")?;

    info!(
        committed = ?summary.committed,
        received = summary.stats.received,
        applied = summary.stats.applied,
        skipped = summary.stats.skipped,
        dead_lettered = summary.stats.dead_lettered,
        retries = summary.stats.retries,
        "cdc-sink-service shutdown complete"
    );

    if !summary.is_clean() {
        for (partition, halted) in &summary.halted {
            error!(
                %partition,
                offset = halted.offset,
                reason = %halted.reason,
                "Partition halted"
            );
        }
        bail!("{} partition(s) halted", summary.halted.len());
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
