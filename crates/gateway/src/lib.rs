//! HTTP API gateway for TaskPilot.
//!
//! Exposes the run API (submit, poll, stream, cancel), workspace file
//! listing and uploads, session memory, and a health check.
//!
//! Built on Axum; every run executes as a background tokio task while
//! handlers only read the shared [`RunRegistry`].

pub mod api;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use taskpilot_agent::{Orchestrator, OrchestratorSettings};
use taskpilot_config::AppConfig;
use taskpilot_core::model::{GenerationConfig, ModelBackend};
use taskpilot_core::registry::RunRegistry;
use taskpilot_memory::SessionMemory;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub registry: Arc<RunRegistry>,
    pub memory: Arc<SessionMemory>,
    pub orchestrator: Arc<Orchestrator>,
    /// Generation settings applied when a request leaves a field unset
    pub defaults: GenerationConfig,
    /// Relative workspaces in requests resolve against this directory
    pub base_workspace: PathBuf,
    pub max_upload_file_bytes: usize,
    pub max_upload_total_bytes: usize,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Wire up state from configuration and a model backend.
    pub fn from_config(config: &AppConfig, model: Arc<dyn ModelBackend>, memory: Arc<SessionMemory>) -> Self {
        let orchestrator = Orchestrator::new(model, memory.clone())
            .with_settings(OrchestratorSettings::from_config(config));

        Self {
            registry: Arc::new(RunRegistry::new()),
            memory,
            orchestrator: Arc::new(orchestrator),
            defaults: config.generation_defaults(),
            base_workspace: config.gateway.resolved_base_workspace(),
            max_upload_file_bytes: config.gateway.max_upload_file_bytes,
            max_upload_total_bytes: config.gateway.max_upload_total_bytes,
        }
    }
}

/// Session memory as configured: persisted when `memory.path` is set.
pub fn session_memory(config: &AppConfig) -> Arc<SessionMemory> {
    let memory = match &config.memory.path {
        Some(path) => SessionMemory::with_persistence(config.memory.capacity, path.clone()),
        None => SessionMemory::new(config.memory.capacity),
    };
    Arc::new(memory)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full router.
///
/// Layers applied:
/// - CORS (permissive; the API has no authentication and binds to localhost by default)
/// - Request body limit sized for base64-encoded uploads
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    // base64 inflates by 4/3, plus room for the JSON envelope
    let body_limit = state.max_upload_total_bytes / 3 * 4 + 1024 * 1024;

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api::api_router(state))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig, model: Arc<dyn ModelBackend>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let memory = session_memory(&config);
    let state = Arc::new(GatewayState::from_config(&config, model, memory));
    info!(
        base_workspace = %state.base_workspace.display(),
        memory_entries = state.memory.len().await,
        "Gateway state ready"
    );

    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NullModel;

    #[async_trait::async_trait]
    impl ModelBackend for NullModel {
        fn name(&self) -> &str {
            "null"
        }

        async fn generate(
            &self,
            _messages: &[taskpilot_core::message::Message],
            _config: &GenerationConfig,
        ) -> Result<String, taskpilot_core::error::ModelError> {
            Ok(r#"{"final_answer": "ok"}"#.into())
        }
    }

    #[tokio::test]
    async fn health_reports_version() {
        let config = AppConfig::default();
        let state = Arc::new(GatewayState::from_config(
            &config,
            Arc::new(NullModel),
            session_memory(&config),
        ));
        let app = build_router(state);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn persisted_memory_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.memory.path = Some(dir.path().join("memory.jsonl"));
        config.memory.capacity = 4;
        let memory = session_memory(&config);
        assert_eq!(memory.capacity(), 4);
        assert!(memory.is_empty().await);
    }
}
