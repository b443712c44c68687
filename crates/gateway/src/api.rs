//! HTTP API — runs, files, uploads and session memory.
//!
//! Endpoints:
//!
//! - `POST /api/runs`               — Submit a task, get a run id
//! - `GET  /api/runs`               — List runs, newest first
//! - `GET  /api/runs/{id}?since=N`  — Run state plus events from cursor `N`
//! - `GET  /api/runs/{id}/stream`   — SSE stream of events from cursor `N`
//! - `POST /api/runs/{id}/cancel`   — Request cancellation
//! - `GET  /api/files`              — List workspace files
//! - `POST /api/uploads`            — Save base64 files into a workspace
//! - `GET  /api/memory`             — Session memory entries and prompt preview
//! - `POST /api/memory/clear`       — Forget all session memory

use std::collections::VecDeque;
use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskpilot_core::event::RunEvent;
use taskpilot_core::model::GenerationConfig;
use taskpilot_core::registry::{CancelOutcome, NewRun, RunRegistry, RunSnapshot};
use taskpilot_core::run::RunSummary;
use taskpilot_memory::{MemoryEntry, Order};
use taskpilot_security::Workspace;
use taskpilot_tools::list_files;

use crate::SharedState;

/// Upper bound on files in one upload request.
const MAX_UPLOAD_FILES: usize = 64;
/// Upper bound on an uploaded file name.
const MAX_FILENAME_LEN: usize = 255;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the API router. Nest this under "/api" in the main router.
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/runs", post(create_run_handler).get(list_runs_handler))
        .route("/runs/{id}", get(get_run_handler))
        .route("/runs/{id}/stream", get(stream_run_handler))
        .route("/runs/{id}/cancel", post(cancel_run_handler))
        .route("/files", get(list_files_handler))
        .route("/uploads", post(upload_handler))
        .route("/memory", get(get_memory_handler))
        .route("/memory/clear", post(clear_memory_handler))
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

/// An error response with a `{ "detail": ... }` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

fn run_not_found() -> ApiError {
    ApiError::not_found("run not found")
}

/// Resolve a requested workspace against the base directory.
fn resolve_workspace(base: &FsPath, raw: &str) -> Result<Workspace, ApiError> {
    let raw_path = FsPath::new(raw);
    let candidate = if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        base.join(raw_path)
    };
    Workspace::open(&candidate).map_err(|_| {
        ApiError::bad_request(format!("workspace does not exist or is not a directory: {raw}"))
    })
}

// ── Runs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub task: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub min_new_tokens: Option<u32>,
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_gpu_memory_gib: Option<u32>,
    #[serde(default)]
    pub coder_model: Option<String>,
    #[serde(default = "default_true")]
    pub lazy_load: bool,
    #[serde(default = "default_true")]
    pub sparse_load: bool,
    #[serde(default)]
    pub no_shell: bool,
    #[serde(default)]
    pub no_ocr: bool,
}

fn default_workspace() -> String {
    ".".into()
}

fn default_true() -> bool {
    true
}

impl RunRequest {
    /// Check ranges and merge over `defaults`.
    pub fn generation_config(&self, defaults: &GenerationConfig) -> Result<GenerationConfig, ApiError> {
        if self.task.trim().is_empty() {
            return Err(ApiError::bad_request("task must not be empty"));
        }
        check_range("max_steps", self.max_steps, 1, 200)?;
        check_range("min_new_tokens", self.min_new_tokens, 1, 16_384)?;
        check_range("max_new_tokens", self.max_new_tokens, 1, 16_384)?;
        check_range("max_gpu_memory_gib", self.max_gpu_memory_gib, 1, 256)?;
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(ApiError::bad_request("temperature must be between 0 and 2"));
        }
        if let Some(p) = self.top_p
            && !(p > 0.0 && p <= 1.0)
        {
            return Err(ApiError::bad_request("top_p must be in (0, 1]"));
        }

        let mut config = defaults.clone();
        if let Some(v) = self.max_steps {
            config.step_limit = v;
        }
        if let Some(v) = self.min_new_tokens {
            config.min_new_tokens = v;
        }
        if let Some(v) = self.max_new_tokens {
            config.max_new_tokens = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.top_p {
            config.top_p = v;
        }
        if let Some(model) = self.coder_model.as_ref().filter(|m| !m.trim().is_empty()) {
            config.coder_model = model.clone();
        }
        if self.max_gpu_memory_gib.is_some() {
            config.max_gpu_memory_gib = self.max_gpu_memory_gib;
        }
        config.lazy_load = self.lazy_load;
        config.sparse_load = self.sparse_load;
        config.allow_shell = defaults.allow_shell && !self.no_shell;
        config.enable_ocr = defaults.enable_ocr && !self.no_ocr;
        Ok(config)
    }
}

fn check_range(field: &str, value: Option<u32>, min: u32, max: u32) -> Result<(), ApiError> {
    match value {
        Some(v) if v < min || v > max => Err(ApiError::bad_request(format!(
            "{field} must be between {min} and {max}"
        ))),
        _ => Ok(()),
    }
}

#[derive(Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

/// `POST /api/runs` — Validate, register and start a run.
async fn create_run_handler(
    State(state): State<SharedState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<CreateRunResponse>, ApiError> {
    let Json(request) = payload?;
    let config = request.generation_config(&state.defaults)?;
    let workspace = resolve_workspace(&state.base_workspace, &request.workspace)?;

    let handle = state.registry.create_run(NewRun {
        task: request.task,
        workspace: workspace.root().to_path_buf(),
        image_path: request
            .image_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from),
        config,
    });
    info!(run_id = %handle.id(), workspace = %workspace.root().display(), "Run submitted");

    let run_id = handle.id().to_string();
    state.orchestrator.clone().spawn(handle);
    Ok(Json(CreateRunResponse { run_id }))
}

#[derive(Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunSummary>,
}

/// `GET /api/runs` — Newest first.
async fn list_runs_handler(State(state): State<SharedState>) -> Json<RunListResponse> {
    Json(RunListResponse {
        runs: state.registry.list_runs(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: usize,
}

/// `GET /api/runs/{id}?since=N` — Run state plus events from the cursor.
async fn get_run_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<RunSnapshot>, ApiError> {
    state
        .registry
        .read_since(&id, query.since)
        .map(Json)
        .ok_or_else(run_not_found)
}

#[derive(Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
}

/// `POST /api/runs/{id}/cancel`
async fn cancel_run_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    match state.registry.cancel(&id) {
        CancelOutcome::Cancelled => {
            info!(run_id = %id, "Run cancellation requested");
            Ok(Json(CancelResponse {
                status: "cancelling".into(),
            }))
        }
        CancelOutcome::AlreadyFinished => Err(ApiError {
            status: StatusCode::CONFLICT,
            detail: "run already finished".into(),
        }),
        CancelOutcome::NotFound => Err(run_not_found()),
    }
}

// ── SSE Streaming ─────────────────────────────────────────────────────────

struct EventCursor {
    registry: Arc<RunRegistry>,
    id: String,
    cursor: usize,
    ticks: watch::Receiver<usize>,
    pending: VecDeque<RunEvent>,
    done: bool,
}

impl EventCursor {
    /// Next event, waiting for the run to produce one. `None` after a
    /// terminal event.
    async fn next_event(&mut self) -> Option<RunEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.kind.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                }
                return Some(event);
            }
            if self.done {
                return None;
            }

            let snapshot = self.registry.read_since(&self.id, self.cursor)?;
            if !snapshot.events.is_empty() {
                self.cursor = snapshot.next_index;
                self.pending.extend(snapshot.events);
                continue;
            }
            if snapshot.status.is_terminal() {
                return None;
            }
            self.ticks.changed().await.ok()?;
        }
    }
}

fn to_sse(event: &RunEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default()
        .event(event.kind.type_name())
        .id(event.index.to_string())
        .data(data)
}

/// `GET /api/runs/{id}/stream?since=N` — One SSE event per run event, closing
/// after the terminal event.
async fn stream_run_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let ticks = state.registry.subscribe(&id).ok_or_else(run_not_found)?;
    debug!(run_id = %id, since = query.since, "SSE stream opened");

    let cursor = EventCursor {
        registry: state.registry.clone(),
        id,
        cursor: query.since,
        ticks,
        pending: VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::unfold(cursor, |mut cursor| async move {
        let event = cursor.next_event().await?;
        Some((Ok::<_, Infallible>(to_sse(&event)), cursor))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Files ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    #[serde(default = "default_workspace")]
    pub workspace_path: String,
    #[serde(default = "default_files_limit")]
    pub limit: usize,
}

fn default_files_limit() -> usize {
    500
}

#[derive(Serialize, Deserialize)]
pub struct FilesResponse {
    pub workspace: String,
    pub files: Vec<String>,
}

/// `GET /api/files?workspace_path=.&limit=500`
async fn list_files_handler(
    State(state): State<SharedState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<FilesResponse>, ApiError> {
    if !(1..=2_000).contains(&query.limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 2000"));
    }
    let workspace = resolve_workspace(&state.base_workspace, &query.workspace_path)?;
    let root = workspace.root().display().to_string();
    let limit = query.limit;

    let (files, _clipped) =
        tokio::task::spawn_blocking(move || list_files::collect(&workspace, ".", limit))
            .await
            .map_err(|e| ApiError::internal(format!("file listing failed: {e}")))?
            .map_err(ApiError::bad_request)?;

    Ok(Json(FilesResponse {
        workspace: root,
        files,
    }))
}

// ── Uploads ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UploadFile {
    pub name: String,
    pub content_base64: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_workspace")]
    pub destination: String,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SavedFile {
    pub name: String,
    pub path: String,
    pub bytes: usize,
}

#[derive(Serialize, Deserialize)]
pub struct UploadResponse {
    pub workspace: String,
    pub destination: String,
    pub saved: Vec<SavedFile>,
}

/// Final path component of an uploaded name, or `None` if nothing usable remains.
fn upload_file_name(raw: &str) -> Option<&str> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match name {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// `POST /api/uploads` — Decode every file first, then write them all.
async fn upload_handler(
    State(state): State<SharedState>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let Json(request) = payload?;
    if request.files.is_empty() || request.files.len() > MAX_UPLOAD_FILES {
        return Err(ApiError::bad_request(format!(
            "files must contain between 1 and {MAX_UPLOAD_FILES} entries"
        )));
    }

    let workspace = resolve_workspace(&state.base_workspace, &request.workspace)?;
    if FsPath::new(&request.destination).is_absolute() {
        return Err(ApiError::bad_request("destination must be a relative path"));
    }
    let save_dir = workspace
        .resolve(&request.destination)
        .map_err(|_| ApiError::bad_request("destination escapes workspace"))?;

    let mut total = 0usize;
    let mut decoded = Vec::with_capacity(request.files.len());
    for item in &request.files {
        if item.name.is_empty() || item.name.len() > MAX_FILENAME_LEN {
            return Err(ApiError::bad_request(format!("invalid filename: {:?}", item.name)));
        }
        let name = upload_file_name(&item.name)
            .ok_or_else(|| ApiError::bad_request(format!("invalid filename: {:?}", item.name)))?;
        let content = STANDARD
            .decode(item.content_base64.trim())
            .map_err(|_| ApiError::bad_request(format!("invalid base64 for file: {name}")))?;

        if content.len() > state.max_upload_file_bytes {
            return Err(ApiError::bad_request(format!(
                "file too large: {name} exceeds {} bytes",
                state.max_upload_file_bytes
            )));
        }
        total += content.len();
        if total > state.max_upload_total_bytes {
            return Err(ApiError::bad_request(format!(
                "total upload size exceeds {} bytes",
                state.max_upload_total_bytes
            )));
        }

        let relative = FsPath::new(&request.destination).join(name);
        let target = workspace
            .resolve(&relative.to_string_lossy())
            .map_err(|_| ApiError::bad_request(format!("invalid target path for {name}")))?;
        decoded.push((name.to_string(), target, content));
    }

    tokio::fs::create_dir_all(&save_dir)
        .await
        .map_err(|e| ApiError::internal(format!("failed to create destination: {e}")))?;

    let mut saved = Vec::with_capacity(decoded.len());
    for (name, target, content) in decoded {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::internal(format!("failed to create directory for {name}: {e}")))?;
        }
        tokio::fs::write(&target, &content).await.map_err(|e| {
            warn!(file = %target.display(), error = %e, "Upload write failed");
            ApiError::internal(format!("failed to write {name}: {e}"))
        })?;
        saved.push(SavedFile {
            name,
            path: workspace.display_relative(&target),
            bytes: content.len(),
        });
    }
    info!(workspace = %workspace.root().display(), files = saved.len(), bytes = total, "Upload saved");

    Ok(Json(UploadResponse {
        workspace: workspace.root().display().to_string(),
        destination: request.destination,
        saved,
    }))
}

// ── Memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    #[serde(default = "default_memory_limit")]
    pub limit: usize,
}

fn default_memory_limit() -> usize {
    20
}

#[derive(Serialize, Deserialize)]
pub struct MemoryResponse {
    pub entries: Vec<MemoryEntry>,
    pub context_preview: String,
}

/// `GET /api/memory?limit=20` — Oldest first, plus the prompt preview.
async fn get_memory_handler(
    State(state): State<SharedState>,
    Query(query): Query<MemoryQuery>,
) -> Result<Json<MemoryResponse>, ApiError> {
    if !(1..=100).contains(&query.limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 100"));
    }
    let entries = state.memory.recent(query.limit, Order::OldestFirst).await;
    let context_preview = state
        .memory
        .render_context(6, 2_500)
        .await
        .map(|ctx| ctx.text)
        .unwrap_or_default();

    Ok(Json(MemoryResponse {
        entries,
        context_preview,
    }))
}

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// `POST /api/memory/clear`
async fn clear_memory_handler(State(state): State<SharedState>) -> Result<Json<StatusResponse>, ApiError> {
    state
        .memory
        .clear()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!("Session memory cleared");
    Ok(Json(StatusResponse { status: "ok".into() }))
}

// ── Tests ─────────────────────────────────────────────────────────────────
