//! HTTP surface.
//!
//! | Method | Path          | Description                                   |
//! |--------|---------------|-----------------------------------------------|
//! | `GET`  | `/`           | Redirect to `/health`.                        |
//! | `GET`  | `/health`     | Dashboard (`text/html`) or JSON snapshot.     |
//! | `GET`  | `/metrics`    | Prometheus exposition.                        |
//! | `POST` | `/v1/respond` | Run the full routing pipeline on one request. |
//! | `POST` | `/v1/preview` | Feed partial input to the prefetcher.         |
//!
//! When an OOM ETA is known it also travels out-of-band in the
//! `x-oom-eta-seconds` response header, both on `/health` and on gate
//! rejections.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::embedding::EmbeddingService;
use crate::error::MindgateError;
use crate::health::HealthMonitor;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::pool::ModelPool;
use crate::pool::prefetch::Prefetcher;
use crate::request::{Attachment, ClientHints, InferenceRequest};

/// Response header carrying the projected OOM ETA in seconds.
pub const OOM_ETA_HEADER: &str = "x-oom-eta-seconds";

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub health: Arc<HealthMonitor>,
    pub pool: Arc<ModelPool>,
    pub embeddings: Arc<EmbeddingService>,
    pub metrics: Arc<Metrics>,
    pub prefetcher: Prefetcher,
}

/// Build the router with tracing and CORS applied.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/respond", post(respond))
        .route("/v1/preview", post(preview))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn root() -> Redirect {
    Redirect::temporary("/health")
}

async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = state.health.snapshot();
    let stats = state.pool.stats();
    let degraded = snapshot.degraded || state.embeddings.is_degraded();

    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);

    let mut response = if wants_html {
        Html(render_dashboard(&snapshot, &stats, degraded)).into_response()
    } else {
        let loaded: Vec<&str> = stats
            .resident
            .iter()
            .filter(|m| m.state == "ready")
            .map(|m| m.name.as_str())
            .collect();
        Json(json!({
            "state": (if degraded { "degraded" } else { snapshot.state.as_str() }),
            "ram_bytes": snapshot.ram_bytes,
            "trend_bytes_per_sec": snapshot.trend_bytes_per_sec,
            "eta_seconds": snapshot.eta_seconds,
            "loaded": loaded,
            "loading": stats.loading,
            "prefetched": stats.prefetched,
            "last_evictions": stats.last_evictions,
            "embedding_degraded": state.embeddings.is_degraded(),
            "degraded": degraded,
        }))
        .into_response()
    };

    if let Some(eta) = snapshot.eta_seconds {
        if let Ok(value) = format!("{eta:.0}").parse() {
            response.headers_mut().insert(OOM_ETA_HEADER, value);
        }
    }
    response
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Ingress payload. Binary attachments arrive as raw byte arrays; at most
/// one of `image` and `audio` may be set.
#[derive(Debug, Deserialize)]
struct RespondBody {
    text: String,
    #[serde(default)]
    image: Option<Vec<u8>>,
    #[serde(default)]
    audio: Option<Vec<u8>>,
    #[serde(default)]
    session_id: Option<String>,
    /// Client deadline for the whole request, in milliseconds.
    #[serde(default)]
    deadline_ms: Option<u64>,
}

async fn respond(State(state): State<AppState>, Json(body): Json<RespondBody>) -> Response {
    if body.image.is_some() && body.audio.is_some() {
        return error_response(&MindgateError::InvalidRequest(
            "at most one of image and audio may be attached".into(),
        ));
    }

    let mut request = InferenceRequest::text(body.text);
    if let Some(image) = body.image {
        request = request.with_attachment(Attachment::Image(image));
    } else if let Some(audio) = body.audio {
        request = request.with_attachment(Attachment::Audio(audio));
    }
    if let Some(session_id) = body.session_id {
        request = request.with_hints(ClientHints { session_id: Some(session_id), locale: None });
    }
    if let Some(deadline_ms) = body.deadline_ms {
        request = request.with_deadline(std::time::Duration::from_millis(deadline_ms));
    }

    match state.orchestrator.respond(request).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Partial-input snapshot while the user is still typing. Accepted and
/// forwarded to the prefetcher; nothing is generated yet.
#[derive(Debug, Deserialize)]
struct PreviewBody {
    text: String,
}

async fn preview(State(state): State<AppState>, Json(body): Json<PreviewBody>) -> StatusCode {
    state.prefetcher.observe_partial(&body.text);
    StatusCode::ACCEPTED
}

fn error_response(error: &MindgateError) -> Response {
    let status = error.status_code();
    let body = Json(json!({
        "error": error.kind_str(),
        "message": error.to_string(),
        "retryable": error.is_retryable(),
    }));
    let mut response = (status, body).into_response();
    if let MindgateError::AdmissionRejected { eta_seconds } = error {
        if let Ok(value) = format!("{eta_seconds:.0}").parse() {
            response.headers_mut().insert(OOM_ETA_HEADER, value);
        }
    }
    response
}

fn render_dashboard(
    snapshot: &crate::health::HealthSnapshot,
    stats: &crate::pool::PoolStats,
    degraded: bool,
) -> String {
    let mut rows = String::new();
    for model in &stats.resident {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            model.name, model.state, model.in_flight, model.ram_estimate_bytes
        ));
    }
    format!(
        "<!doctype html><html><head><title>mindgate</title></head><body>\
         <h1>mindgate</h1>\
         <p>state: <strong>{}</strong></p>\
         <p>ram: {} bytes, trend: {:.0} B/s, oom eta: {}</p>\
         <table><tr><th>model</th><th>state</th><th>in flight</th><th>ram</th></tr>{}</table>\
         </body></html>",
        if degraded { "degraded" } else { snapshot.state.as_str() },
        snapshot.ram_bytes,
        snapshot.trend_bytes_per_sec,
        snapshot
            .eta_seconds
            .map(|eta| format!("{eta:.0}s"))
            .unwrap_or_else(|| "n/a".to_string()),
        rows
    )
}

/// Bind and serve until the shutdown signal resolves. Exit code semantics
/// live in `main`.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "http surface listening");
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::audit::NullAuditSink;
    use crate::cache::SemanticCache;
    use crate::classify::{Classifier, ClassifierMode};
    use crate::control::MetaControl;
    use crate::health::MemorySample;
    use crate::pool::{BackendRegistry, PoolConfig};
    use crate::request::ModelDescriptor;
    use crate::settings::{Settings, builtin_models};

    const GIB: u64 = 1024 * 1024 * 1024;

    async fn test_state(dir: &tempfile::TempDir) -> AppState {
        let mut settings = Settings::default();
        settings.models = builtin_models();
        for model in settings.models.values_mut() {
            let path = dir.path().join(format!("{}.gguf", model.name.replace('/', "_")));
            std::fs::write(&path, b"weights").unwrap();
            model.backend = crate::request::BackendKind::LocalFile;
            model.location = path.to_string_lossy().into_owned();
        }
        let settings = Arc::new(settings);

        let metrics = Arc::new(Metrics::new());
        let catalog: HashMap<String, ModelDescriptor> =
            settings.models.clone().into_iter().collect();
        let pool = ModelPool::new(
            catalog,
            BackendRegistry::with_defaults(&settings.memory),
            PoolConfig {
                max_concurrent_models: 3,
                max_ram_bytes: 32 * GIB,
                load_deadline: Duration::from_secs(5),
            },
            Arc::clone(&metrics),
        );
        let health = HealthMonitor::new(&settings.health, 12 * GIB, Arc::clone(&metrics));
        let embeddings = Arc::new(EmbeddingService::initialize(&settings.embedding).await);

        let classifier = Arc::new(Classifier::new(ClassifierMode::Cold));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&settings),
            Arc::clone(&embeddings),
            Arc::clone(&classifier),
            Arc::new(SemanticCache::new(&settings.cache)),
            Arc::new(MetaControl::new(None)),
            Arc::clone(&pool),
            Arc::clone(&health),
            Arc::clone(&metrics),
            Arc::new(NullAuditSink),
        ));

        // The shutdown side stays open for the lifetime of the test server.
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        std::mem::forget(shutdown_tx);
        let prefetcher = Prefetcher::spawn(
            Arc::clone(&pool),
            classifier,
            Arc::clone(&settings),
            shutdown_rx,
        );

        AppState { orchestrator, health, pool, embeddings, metrics, prefetcher }
    }

    async fn spawn_server(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind(("localhost", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, build_app(state)).await.unwrap();
        });
        format!("http://localhost:{port}")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn root_redirects_to_health() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(test_state(&dir).await).await;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let response = client.get(&base).send().await.unwrap();
        assert_eq!(response.status(), 307);
        assert_eq!(response.headers()["location"], "/health");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn health_negotiates_json_and_html() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(test_state(&dir).await).await;
        let client = reqwest::Client::new();

        let json: serde_json::Value = client
            .get(format!("{base}/health"))
            .header("accept", "application/json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["state"], "ok");
        assert!(json["loaded"].is_array());
        assert!(json["eta_seconds"].is_null());
        assert_eq!(json["degraded"], false);

        let html = client
            .get(format!("{base}/health"))
            .header("accept", "text/html")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(html.contains("<h1>mindgate</h1>"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn metrics_exposition_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(test_state(&dir).await).await;

        let text = reqwest::get(format!("{base}/metrics")).await.unwrap().text().await.unwrap();
        assert!(text.contains("ram_bytes"));
        assert!(text.contains("uptime_seconds"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn respond_runs_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(test_state(&dir).await).await;
        let client = reqwest::Client::new();

        let payload: serde_json::Value = client
            .post(format!("{base}/v1/respond"))
            .json(&json!({"text": "Configure SSH on a remote host"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(payload["decision"], json!({"cascade": "t1"}));
        assert_eq!(payload["model"], "tiny");
        assert!(payload["text"].as_str().unwrap().contains("[tiny]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn preview_prefetches_the_predicted_model() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let pool = Arc::clone(&state.pool);
        let base = spawn_server(state).await;
        let client = reqwest::Client::new();

        let status = client
            .post(format!("{base}/v1/preview"))
            .json(&json!({"text": "Write a Python function"}))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, 202);

        // The debounce quiet period elapses, then the prefetch lands.
        let mut prefetched = false;
        for _ in 0..60 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if pool.stats().prefetched.contains(&"code".to_string()) {
                prefetched = true;
                break;
            }
        }
        assert!(prefetched, "code model should be prefetched after the quiet period");

        // The final submission promotes the prefetched handle.
        let payload: serde_json::Value = client
            .post(format!("{base}/v1/respond"))
            .json(&json!({"text": "Write a Python function that parses logs"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(payload["model"], "code");
        assert!(pool.stats().prefetched.is_empty(), "handle was promoted, not reloaded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn whitespace_request_maps_to_400() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(test_state(&dir).await).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/v1/respond"))
            .json(&json!({"text": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn degraded_gate_returns_503_with_eta_header() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        for i in 0..10u64 {
            state.health.observe(
                i as f64,
                MemorySample {
                    used_bytes: 6 * GIB + i * (GIB / 10),
                    cpu_percent: 1.0,
                },
            );
        }
        let base = spawn_server(state).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/v1/respond"))
            .json(&json!({"text": "Configure SSH on a remote host"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        let eta: f64 = response.headers()[OOM_ETA_HEADER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(eta > 0.0 && eta <= 60.0);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["retryable"], true);

        // The same ETA shows on /health, body and header both.
        let health = client
            .get(format!("{base}/health"))
            .header("accept", "application/json")
            .send()
            .await
            .unwrap();
        assert!(health.headers().contains_key(OOM_ETA_HEADER));
        let body: serde_json::Value = health.json().await.unwrap();
        assert_eq!(body["state"], "degraded");
        assert!(body["eta_seconds"].as_f64().unwrap() <= 60.0);
    }
}
