use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::io;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Metrics for CDC pipeline monitoring
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Messages returned by broker polls
    pub messages_received_total: IntCounter,
    /// Mutations written to the sink
    pub mutations_applied_total: IntCounter,
    /// Tombstones, unknown operations and image-less events
    pub messages_skipped_total: IntCounter,
    pub messages_dead_lettered_total: IntCounter,
    /// Apply attempts beyond the first
    pub apply_retries_total: IntCounter,
    /// Partitions stopped after exhausting retries
    pub partitions_halted: IntGauge,
    pub commits_total: IntCounter,
    pub commit_errors_total: IntCounter,
    pub poll_errors_total: IntCounter,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let messages_received_total = IntCounter::new(
            "cdc_messages_received_total",
            "Total number of CDC messages received from the broker",
        )
        .expect("valid metric for cdc_messages_received_total");

        let mutations_applied_total = IntCounter::new(
            "cdc_mutations_applied_total",
            "Total number of mutations applied to the sink",
        )
        .expect("valid metric for cdc_mutations_applied_total");

        let messages_skipped_total = IntCounter::new(
            "cdc_messages_skipped_total",
            "Total number of CDC messages that required no sink write",
        )
        .expect("valid metric for cdc_messages_skipped_total");

        let messages_dead_lettered_total = IntCounter::new(
            "cdc_messages_dead_lettered_total",
            "Total number of CDC messages routed to the dead-letter output",
        )
        .expect("valid metric for cdc_messages_dead_lettered_total");

        let apply_retries_total = IntCounter::new(
            "cdc_apply_retries_total",
            "Total number of sink apply retries after transient failures",
        )
        .expect("valid metric for cdc_apply_retries_total");

        let partitions_halted = IntGauge::new(
            "cdc_partitions_halted",
            "Number of partitions halted after exhausting retries",
        )
        .expect("valid metric for cdc_partitions_halted");

        let commits_total = IntCounter::new(
            "cdc_commits_total",
            "Total number of successful offset commits",
        )
        .expect("valid metric for cdc_commits_total");

        let commit_errors_total = IntCounter::new(
            "cdc_commit_errors_total",
            "Total number of failed offset commits",
        )
        .expect("valid metric for cdc_commit_errors_total");

        let poll_errors_total = IntCounter::new(
            "cdc_poll_errors_total",
            "Total number of broker poll errors",
        )
        .expect("valid metric for cdc_poll_errors_total");

        for metric in [
            Box::new(messages_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(mutations_applied_total.clone()),
            Box::new(messages_skipped_total.clone()),
            Box::new(messages_dead_lettered_total.clone()),
            Box::new(apply_retries_total.clone()),
            Box::new(partitions_halted.clone()),
            Box::new(commits_total.clone()),
            Box::new(commit_errors_total.clone()),
            Box::new(poll_errors_total.clone()),
        ] {
            // Already registered by an earlier pipeline in this process
            let _ = registry.register(metric);
        }

        Self {
            messages_received_total,
            mutations_applied_total,
            messages_skipped_total,
            messages_dead_lettered_total,
            apply_retries_total,
            partitions_halted,
            commits_total,
            commit_errors_total,
            poll_errors_total,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that serialises Prometheus metrics in text format.
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_handler))
        .route("/health", web::get().to(|| async { "OK" }));
}

/// Running scrape endpoint
pub struct MetricsServer {
    addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<io::Result<()>>,
}

impl MetricsServer {
    /// Bind `addr` and serve `/metrics` until `shutdown` turns true
    pub fn start(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> io::Result<Self> {
        let server = HttpServer::new(|| App::new().configure(configure))
            .workers(1)
            .disable_signals()
            .bind(addr)?;

        let addr = server.addrs().first().copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "metrics server bound no address")
        })?;

        let server = server.run();
        let handle = server.handle();

        let stopper = handle.clone();
        tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            stopper.stop(true).await;
        });

        info!(%addr, "Metrics endpoint listening");

        Ok(Self {
            addr,
            handle,
            task: tokio::spawn(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
        match self.task.await {
            Ok(Ok(())) => info!("Metrics endpoint stopped"),
            Ok(Err(e)) => warn!(error = %e, "Metrics endpoint failed"),
            Err(e) => warn!(error = %e, "Metrics endpoint task failed"),
        }
    }

    /// Wait until the server exits on its own, after shutdown was signalled
    pub async fn join(self) -> io::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}
