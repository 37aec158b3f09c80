//! Prometheus metrics and the `/metrics` + `/healthz` listener.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::error::ControllerError;

/// Reconcile counters and latency, labeled by outcome
#[derive(Debug, Clone)]
pub struct Metrics {
    reconciliations: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let reconciliations = IntCounterVec::new(
            Opts::new("k3k_cluster_reconcile_total", "Cluster reconciliations by result"),
            &["result"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "k3k_cluster_reconcile_duration_seconds",
                "Time spent reconciling one Cluster",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
            &["result"],
        )?;
        Ok(Self {
            reconciliations,
            duration,
        })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, ControllerError> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.duration.clone()))?;
        Ok(self)
    }

    pub fn reconcile_success(&self, elapsed: Duration) {
        self.observe("success", elapsed);
    }

    pub fn reconcile_failure(&self, elapsed: Duration) {
        self.observe("error", elapsed);
    }

    fn observe(&self, result: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    #[must_use]
    pub fn count(&self, result: &str) -> u64 {
        self.reconciliations.with_label_values(&[result]).get()
    }
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(registry)
}

/// Serve metrics and health until the listener fails
pub async fn serve(addr: SocketAddr, registry: Registry) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "Serving metrics");
    axum::serve(listener, router(registry))
        .await
        .map_err(|e| ControllerError::Metrics(e.to_string()))
}
