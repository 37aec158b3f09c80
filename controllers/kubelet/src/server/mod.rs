//! Kubelet HTTP API of the virtual node.
//!
//! The virtual API server calls these endpoints with its kubelet client
//! certificate. Pods are addressed by their virtual names and served from
//! the host pods backing them.

pub mod stream;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{AsyncBufReadExt, StreamExt};
use host_client::{ClientError, ClusterClient};
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use kube::api::{Api, LogParams};
use rustls::server::ServerConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::error::KubeletError;
use crate::provider::{PodTranslator, VIRTUAL_UID_ANNOTATION};
use crate::syncer::ShadowKey;
use stream::{PROTOCOLS, SessionKind, SessionParams};

/// Shared state of the kubelet API handlers
#[derive(Clone)]
pub struct ServerState<H> {
    pub host: H,
    /// Host pods in the cluster namespace, for logs and sessions
    pub pods: Api<Pod>,
    pub translator: Arc<PodTranslator>,
    pub node_name: String,
    pub started: DateTime<Utc>,
}

enum ApiError {
    NotFound(String),
    Upstream(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(pod) => (StatusCode::NOT_FOUND, format!("pod {pod} not found")).into_response(),
            Self::Upstream(message) => {
                error!(error = %message, "Kubelet API request failed");
                (StatusCode::BAD_GATEWAY, message).into_response()
            }
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Host name of virtual pod `namespace/name`, `None` unless its host pod is ours
pub async fn resolve_pod<H: ClusterClient>(
    host: &H,
    translator: &PodTranslator,
    namespace: &str,
    name: &str,
) -> Result<Option<String>, ClientError> {
    let host_name = translator.host_name(namespace, name);
    let Some(pod) = host.get::<Pod>(&translator.host_namespace, &host_name).await? else {
        return Ok(None);
    };
    let expected = ShadowKey {
        cluster: translator.cluster.clone(),
        kind: Pod::kind(&()).to_string(),
        namespace: Some(namespace.to_string()),
        name: name.to_string(),
    };
    let linked = ShadowKey::from_shadow(&translator.cluster, pod.meta()).is_some_and(|key| key == expected);
    Ok(linked.then_some(host_name))
}

async fn host_name_of<H: ClusterClient>(state: &ServerState<H>, namespace: &str, pod: &str) -> Result<String, ApiError> {
    resolve_pod(&state.host, &state.translator, namespace, pod)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{namespace}/{pod}")))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
    limit_bytes: Option<i64>,
    #[serde(default)]
    timestamps: bool,
    #[serde(default)]
    previous: bool,
    #[serde(default)]
    follow: bool,
}

impl LogQuery {
    fn params(&self, container: &str) -> LogParams {
        LogParams {
            container: Some(container.to_string()),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            limit_bytes: self.limit_bytes,
            timestamps: self.timestamps,
            previous: self.previous,
            follow: self.follow,
            ..Default::default()
        }
    }
}

async fn container_logs<H: ClusterClient + Clone + 'static>(
    State(state): State<ServerState<H>>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let host_name = host_name_of(&state, &namespace, &pod).await?;
    let params = query.params(&container);

    if !query.follow {
        let logs = state.pods.logs(&host_name, &params).await?;
        return Ok(logs.into_response());
    }
    let lines = state.pods.log_stream(&host_name, &params).await?.lines().map(|line| {
        line.map(|mut l| {
            l.push('\n');
            l
        })
    });
    Ok(Body::from_stream(lines).into_response())
}

async fn session<H: ClusterClient + Clone + 'static>(
    state: ServerState<H>,
    kind: SessionKind,
    (namespace, pod, container): (String, String, String),
    query: Option<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let host_name = host_name_of(&state, &namespace, &pod).await?;
    let params = SessionParams::from_query(query.as_deref().unwrap_or_default());
    let pods = state.pods.clone();
    Ok(ws
        .protocols(PROTOCOLS)
        .on_upgrade(move |socket| stream::proxy(socket, pods, host_name, container, kind, params))
        .into_response())
}

async fn exec<H: ClusterClient + Clone + 'static>(
    State(state): State<ServerState<H>>,
    Path(target): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    session(state, SessionKind::Exec, target, query, ws).await
}

async fn attach<H: ClusterClient + Clone + 'static>(
    State(state): State<ServerState<H>>,
    Path(target): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    session(state, SessionKind::Attach, target, query, ws).await
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Stats summary listing every pod served by the node under its virtual name
#[must_use]
pub fn summary(node_name: &str, started: DateTime<Utc>, host_pods: &[Pod], cluster: &str) -> Value {
    let pods: Vec<Value> = host_pods
        .iter()
        .filter_map(|pod| {
            let key = ShadowKey::from_shadow(cluster, pod.meta())?;
            let start = pod
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .and_then(host_client::time::time_to_utc)
                .map(timestamp);
            let containers: Vec<Value> = pod
                .spec
                .iter()
                .flat_map(|s| s.containers.iter())
                .map(|c| json!({ "name": c.name, "startTime": start }))
                .collect();
            Some(json!({
                "podRef": {
                    "name": key.name,
                    "namespace": key.namespace,
                    "uid": pod.metadata.annotations.as_ref().and_then(|a| a.get(VIRTUAL_UID_ANNOTATION)),
                },
                "startTime": start,
                "containers": containers,
            }))
        })
        .collect();

    json!({
        "node": { "nodeName": node_name, "startTime": timestamp(started) },
        "pods": pods,
    })
}

async fn stats_summary<H: ClusterClient + Clone + 'static>(State(state): State<ServerState<H>>) -> Result<Json<Value>, ApiError> {
    let selector = ShadowKey::selector(&state.translator.cluster);
    let pods: Vec<Pod> = state.host.list(&state.translator.host_namespace, &selector).await?;
    Ok(Json(summary(&state.node_name, state.started, &pods, &state.translator.cluster)))
}

pub fn router<H: ClusterClient + Clone + 'static>(state: ServerState<H>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/containerLogs/{namespace}/{pod}/{container}", get(container_logs::<H>))
        .route("/exec/{namespace}/{pod}/{container}", any(exec::<H>))
        .route("/attach/{namespace}/{pod}/{container}", any(attach::<H>))
        .route("/stats/summary", get(stats_summary::<H>))
        .with_state(state)
}

/// Serve the kubelet API until the listener fails
pub async fn serve<H: ClusterClient + Clone + 'static>(
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
    state: ServerState<H>,
) -> Result<(), KubeletError> {
    info!(addr = %addr, "Kubelet API listening");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(tls))
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| {
            warn!(error = %e, "Kubelet API stopped");
            KubeletError::Server(format!("kubelet API: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crds::{Cluster, ClusterSpec};
    use host_client::MockClusterClient;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tower::ServiceExt;

    fn fake_pods() -> Api<Pod> {
        let service = tower::service_fn(|_req: axum::http::Request<kube::client::Body>| async {
            Ok::<_, std::convert::Infallible>(axum::http::Response::new(kube::client::Body::from(
                b"line one\nline two\n".to_vec(),
            )))
        });
        Api::namespaced(kube::Client::new(service, "tenant"), "tenant")
    }

    fn state() -> ServerState<MockClusterClient> {
        let translator = PodTranslator::new(&test_config(), &Cluster::new("demo", ClusterSpec::default()));
        let host = MockClusterClient::new();
        let virtual_pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        };
        host.insert("tenant", &translator.host_pod(&virtual_pod));
        ServerState {
            host,
            pods: fake_pods(),
            translator: Arc::new(translator),
            node_name: "k3k-demo-kubelet".to_string(),
            started: Utc::now(),
        }
    }

    async fn request(state: ServerState<MockClusterClient>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(request(state(), "/healthz").await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_logs_of_known_pod() {
        let (status, body) = request(state(), "/containerLogs/apps/web-0/app?tailLines=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_unknown_pod_is_not_found() {
        let (status, _) = request(state(), "/containerLogs/apps/missing/app").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolve_ignores_foreign_pods() {
        let state = state();
        state.host.insert(
            "tenant",
            &Pod {
                metadata: ObjectMeta {
                    name: Some("db-0-apps-demo".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let resolved = resolve_pod(&state.host, &state.translator, "apps", "db-0").await.unwrap();
        assert!(resolved.is_none());
        let resolved = resolve_pod(&state.host, &state.translator, "apps", "web-0").await.unwrap();
        assert_eq!(resolved.as_deref(), Some("web-0-apps-demo"));
    }

    #[tokio::test]
    async fn test_stats_summary_uses_virtual_names() {
        let (status, body) = request(state(), "/stats/summary").await;
        assert_eq!(status, StatusCode::OK);
        let summary: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(summary["node"]["nodeName"], "k3k-demo-kubelet");
        assert_eq!(summary["pods"][0]["podRef"]["name"], "web-0");
        assert_eq!(summary["pods"][0]["podRef"]["namespace"], "apps");
        assert_eq!(summary["pods"][0]["containers"][0]["name"], "app");
    }
}
