//! Prometheus registry and HTTP exposition.
//!
//! The hot path never touches the registry directly: readers bump the
//! lock-free counters in [`crate::filter::ProcessingCounters`] and the
//! engine's folding task adds the swapped-out values to the counters
//! here once per second.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::filter::CounterSnapshot;

/// Prometheus metrics for the filter pipeline.
pub struct Metrics {
    registry: Registry,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Lines read from all connections.
    pub received_total: IntCounter,
    /// Lines that parsed cleanly.
    pub received_valid: IntCounter,
    /// Valid lines that matched at least one pattern.
    pub received_matching: IntCounter,

    /// Pattern-match duration, sampled on every 10th line.
    pub match_duration: Histogram,
    /// Sink write duration per batch.
    pub save_duration: Histogram,
    /// Pattern trie rebuild duration per refresh.
    pub buildtree_duration: Histogram,
}

impl Metrics {
    /// Creates the registry with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let received_total = IntCounter::with_opts(
            Opts::new("received_total", "Lines read from all connections.").namespace("siftd"),
        )?;
        let received_valid = IntCounter::with_opts(
            Opts::new("received_valid", "Lines that parsed cleanly.").namespace("siftd"),
        )?;
        let received_matching = IntCounter::with_opts(
            Opts::new(
                "received_matching",
                "Valid lines that matched at least one pattern.",
            )
            .namespace("siftd"),
        )?;

        let match_duration = Histogram::with_opts(
            HistogramOpts::new(
                "match_duration_seconds",
                "Pattern-match duration, sampled on every 10th line.",
            )
            .namespace("siftd"),
        )?;
        let save_duration = Histogram::with_opts(
            HistogramOpts::new("save_duration_seconds", "Sink write duration per batch.")
                .namespace("siftd"),
        )?;
        let buildtree_duration = Histogram::with_opts(
            HistogramOpts::new(
                "buildtree_duration_seconds",
                "Pattern trie rebuild duration per refresh.",
            )
            .namespace("siftd"),
        )?;

        registry.register(Box::new(received_total.clone()))?;
        registry.register(Box::new(received_valid.clone()))?;
        registry.register(Box::new(received_matching.clone()))?;
        registry.register(Box::new(match_duration.clone()))?;
        registry.register(Box::new(save_duration.clone()))?;
        registry.register(Box::new(buildtree_duration.clone()))?;

        Ok(Self {
            registry,
            shutdown: parking_lot::Mutex::new(None),
            received_total,
            received_valid,
            received_matching,
            match_duration,
            save_duration,
            buildtree_duration,
        })
    }

    /// Fold a counter snapshot into the registry.
    pub fn fold(&self, snapshot: CounterSnapshot) {
        self.received_total
            .inc_by(u64::try_from(snapshot.total).unwrap_or(0));
        self.received_valid
            .inc_by(u64::try_from(snapshot.valid).unwrap_or(0));
        self.received_matching
            .inc_by(u64::try_from(snapshot.matched).unwrap_or(0));
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
