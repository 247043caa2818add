use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::LatestSnapshot;

/// Prometheus metrics for the engine itself.
///
/// All metrics use the "air" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Scheduler chain firings by chain.
    pub chain_ticks: CounterVec,
    /// Handler run time by stage.
    pub stage_duration: HistogramVec,
    /// Samples dropped for lack of app-id or filter room.
    pub samples_dropped: Gauge,
    /// Threads with live slot sets.
    pub threads_tracked: Gauge,
    /// Control messages answered, by result (ok/error).
    pub control_commands: CounterVec,
    /// Snapshots handed to exporters.
    pub snapshots_exported: Counter,
    /// Failed exports by exporter.
    pub export_errors: CounterVec,
    /// Latency lags recorded by the preprocessor.
    pub latency_matches: Counter,
}

impl HealthMetrics {
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let chain_ticks = CounterVec::new(
            Opts::new("chain_ticks_total", "Scheduler chain firings by chain.").namespace("air"),
            &["chain"],
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "stage_duration_seconds",
                "Time spent in a pipeline stage handler.",
            )
            .namespace("air")
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
            &["stage"],
        )?;
        let samples_dropped = Gauge::with_opts(
            Opts::new(
                "samples_dropped",
                "Samples dropped because the app-id table was full or the filter was out of range.",
            )
            .namespace("air"),
        )?;
        let threads_tracked = Gauge::with_opts(
            Opts::new("threads_tracked", "Threads with live metric slots.").namespace("air"),
        )?;
        let control_commands = CounterVec::new(
            Opts::new(
                "control_commands_total",
                "Control messages answered by result.",
            )
            .namespace("air"),
            &["result"],
        )?;
        let snapshots_exported = Counter::with_opts(
            Opts::new(
                "snapshots_exported_total",
                "Analysis snapshots handed to exporters.",
            )
            .namespace("air"),
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Failed snapshot exports by exporter.")
                .namespace("air"),
            &["exporter"],
        )?;
        let latency_matches = Counter::with_opts(
            Opts::new(
                "latency_matches_total",
                "Latency start/end pairs turned into lag samples.",
            )
            .namespace("air"),
        )?;

        registry.register(Box::new(chain_ticks.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(threads_tracked.clone()))?;
        registry.register(Box::new(control_commands.clone()))?;
        registry.register(Box::new(snapshots_exported.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(latency_matches.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            chain_ticks,
            stage_duration,
            samples_dropped,
            threads_tracked,
            control_commands,
            snapshots_exported,
            export_errors,
            latency_matches,
        })
    }

    /// Renders every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Serves `/metrics`, `/healthz` and `/snapshot` until [`stop`](Self::stop).
    /// Returns the bound address.
    pub async fn start(&self, latest: LatestSnapshot) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9091"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            latest,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/snapshot", get(snapshot_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

struct AppState {
    registry: Registry,
    latest: LatestSnapshot,
}

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

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.latest.load_full() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no snapshot yet").into_response(),
    }
}
