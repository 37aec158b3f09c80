//! Sync counters and the per-manager `/metrics` listener.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::error::KubeletError;

#[derive(Debug, Clone)]
pub struct SyncMetrics {
    syncs: IntCounterVec,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, KubeletError> {
        let syncs = IntCounterVec::new(
            Opts::new("k3k_kubelet_sync_total", "Object syncs by kind and result"),
            &["kind", "result"],
        )?;
        Ok(Self { syncs })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, KubeletError> {
        registry.register(Box::new(self.syncs.clone()))?;
        Ok(self)
    }

    pub fn record(&self, kind: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.syncs.with_label_values(&[kind, result]).inc();
    }

    #[must_use]
    pub fn count(&self, kind: &str, result: &str) -> u64 {
        self.syncs.with_label_values(&[kind, result]).get()
    }
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buffer).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `/metrics` on `addr`; a disabled listener never returns
pub async fn serve(addr: Option<SocketAddr>, registry: Registry) -> Result<(), KubeletError> {
    let Some(addr) = addr else {
        std::future::pending::<()>().await;
        return Ok(());
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KubeletError::Metrics(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "Serving metrics");
    let app = Router::new().route("/metrics", get(metrics)).with_state(registry);
    axum::serve(listener, app)
        .await
        .map_err(|e| KubeletError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_kind_and_result() {
        let registry = Registry::new();
        let metrics = SyncMetrics::new().unwrap().register(&registry).unwrap();
        metrics.record("Service", true);
        metrics.record("Service", true);
        metrics.record("PersistentVolumeClaim", false);

        assert_eq!(metrics.count("Service", "success"), 2);
        assert_eq!(metrics.count("PersistentVolumeClaim", "error"), 1);
        assert_eq!(metrics.count("PriorityClass", "success"), 0);
        assert_eq!(registry.gather()[0].name(), "k3k_kubelet_sync_total");
    }

    #[test]
    fn test_clones_export_through_the_registered_counter() {
        let registry = Registry::new();
        let metrics = SyncMetrics::new().unwrap().register(&registry).unwrap();
        let provider = metrics.clone();
        provider.record("Pod", true);
        metrics.record("Service", true);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains(r#"k3k_kubelet_sync_total{kind="Pod",result="success"} 1"#));
        assert!(text.contains(r#"k3k_kubelet_sync_total{kind="Service",result="success"} 1"#));
    }
}
