use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use sandbox::{
    ConsoleResponse, ProjectState, ProjectTemplate, RetryPolicy, SandboxConfig, SandboxError,
    SandboxFs, ShellConfig, ShellRunner, StateStore, VirtualConsole, UPLOADS_DIR,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{dispatcher, error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

const SESSION_HEADER: &str = "x-console-session";
const DEFAULT_SESSION: &str = "default";
const UPLOAD_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    sandbox: SandboxFs,
    consoles: Arc<ConsoleSessions>,
    metrics: Arc<AppMetrics>,
}

struct AppMetrics {
    registry: Registry,
    sandbox_counter: IntCounterVec,
    console_counter: IntCounterVec,
}

impl AppMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let sandbox_counter = IntCounterVec::new(
            Opts::new(
                "sandbox_operations_total",
                "Sandbox operations executed by operation and status",
            ),
            &["operation", "status"],
        )?;
        let console_counter = IntCounterVec::new(
            Opts::new("console_commands_total", "Console commands by status"),
            &["status"],
        )?;
        registry.register(Box::new(sandbox_counter.clone()))?;
        registry.register(Box::new(console_counter.clone()))?;
        Ok(Self {
            registry,
            sandbox_counter,
            console_counter,
        })
    }

    fn record_sandbox_op(&self, operation: &'static str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.sandbox_counter
            .with_label_values(&[operation, status])
            .inc();
    }

    fn record_console(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.console_counter.with_label_values(&[status]).inc();
    }

    fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone, Copy, Debug)]
struct SessionLimits {
    idle: Duration,
    max_sessions: usize,
}

struct Session {
    console: Arc<VirtualConsole>,
    last_used: Instant,
}

/// Console sessions keyed by the `x-console-session` header.
///
/// Requests without the header share the `default` console. Any other id must
/// come from [`ConsoleSessions::open`]; idle sessions are swept on the next
/// open and the least recently used one makes room once the cap is reached.
struct ConsoleSessions {
    sandbox: SandboxFs,
    shell: ShellConfig,
    limits: SessionLimits,
    default: Arc<VirtualConsole>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl ConsoleSessions {
    fn new(sandbox: SandboxFs, shell: ShellConfig, limits: SessionLimits) -> Self {
        let default = Arc::new(VirtualConsole::new(
            sandbox.clone(),
            ShellRunner::new(shell.clone()),
        ));
        Self {
            sandbox,
            shell,
            limits,
            default,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a fresh session and returns its id.
    fn open(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let console = Arc::new(VirtualConsole::new(
            self.sandbox.clone(),
            ShellRunner::new(self.shell.clone()),
        ));
        let now = Instant::now();

        let mut guard = self.sessions.lock();
        let before = guard.len();
        guard.retain(|_, session| now.duration_since(session.last_used) < self.limits.idle);
        while guard.len() >= self.limits.max_sessions.max(1) {
            let oldest = guard
                .iter()
                .min_by_key(|(_, session)| session.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    guard.remove(&oldest);
                }
                None => break,
            }
        }
        let evicted = before - guard.len();
        guard.insert(
            id.clone(),
            Session {
                console,
                last_used: now,
            },
        );
        info!(session = %id, evicted, active = guard.len(), "console session opened");
        id
    }

    fn get(&self, headers: &HeaderMap) -> Result<Arc<VirtualConsole>, ApiError> {
        let id = match session_id(headers) {
            None => return Ok(self.default.clone()),
            Some(id) if id == DEFAULT_SESSION => return Ok(self.default.clone()),
            Some(id) => id,
        };
        let mut guard = self.sessions.lock();
        let now = Instant::now();
        let expired = match guard.get_mut(id) {
            Some(session) if now.duration_since(session.last_used) < self.limits.idle => {
                session.last_used = now;
                return Ok(session.console.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.remove(id);
            info!(session = %id, "console session expired");
        }
        Err(ApiError::UnknownSession(id.to_string()))
    }

    fn close(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        match session_id(headers) {
            Some(id) if id != DEFAULT_SESSION => match self.sessions.lock().remove(id) {
                Some(_) => {
                    info!(session = %id, "console session closed");
                    Ok(())
                }
                None => Err(ApiError::UnknownSession(id.to_string())),
            },
            _ => Err(ApiError::BadRequest(
                "the default console session cannot be closed".to_string(),
            )),
        }
    }
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let metrics = Arc::new(AppMetrics::new()?);
    let bind_addr = resolve_bind_address()?;
    let sandbox = initialize_sandbox().await?;
    let shell = resolve_shell_config()?;
    let limits = SessionLimits {
        idle: Duration::from_secs(env_or("CONSOLE_SESSION_IDLE_SECS", 30 * 60_u64)),
        max_sessions: env_or("CONSOLE_MAX_SESSIONS", 64_usize),
    };

    let state = AppState {
        consoles: Arc::new(ConsoleSessions::new(sandbox.clone(), shell, limits)),
        sandbox,
        metrics,
    };

    let app = build_router(state);

    info!(%bind_addr, "server starting");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.sandbox.max_file_size())
        .unwrap_or(usize::MAX)
        .saturating_add(UPLOAD_OVERHEAD_BYTES);
    let api = Router::new()
        .route("/console/session", post(console_session).delete(close_console_session))
        .route("/console/cwd", get(console_cwd))
        .route("/console/execute", post(console_execute))
        .route("/run_python", post(run_python))
        .route("/pip_install", post(pip_install))
        .route("/download_projects", get(download_projects));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/create_folder", post(create_folder))
        .route("/create_file", post(create_file))
        .route("/read_file", get(read_file))
        .route("/write_file", post(write_file))
        .route("/list_files", get(list_files))
        .route("/delete_file", delete(delete_file))
        .route("/create_project", post(create_project))
        .route("/refresh_state", post(refresh_state))
        .route("/clear_state", post(clear_state))
        .route("/project_state", get(project_state))
        .route("/upload", post(upload))
        .nest("/api", api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    Ok(raw.parse()?)
}

fn absolute_from_env(key: &str, default: &str) -> anyhow::Result<PathBuf> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    let path = PathBuf::from(&raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(path))
    }
}

async fn initialize_sandbox() -> anyhow::Result<SandboxFs> {
    let max_size = env_or("SANDBOX_MAX_FILE_SIZE", 10 * 1024 * 1024_u64);
    let retry = RetryPolicy::new(
        env_or("SANDBOX_RETRY_ATTEMPTS", 5_u32),
        Duration::from_millis(env_or("SANDBOX_RETRY_DELAY_MS", 500_u64)),
    )?;
    let root = absolute_from_env("SANDBOX_ROOT", "./projects")?;
    let config = SandboxConfig::new(&root, max_size)?.with_retry(retry);
    tokio::fs::create_dir_all(config.base_dir.join(UPLOADS_DIR)).await?;

    let snapshot = absolute_from_env("SANDBOX_STATE_FILE", "./project_state.json")?;
    let state = Arc::new(StateStore::open(config.base_dir.clone(), snapshot).await);
    state.full_rescan().await?;
    info!(root = %config.base_dir.display(), "project state synchronized with file system");

    Ok(SandboxFs::new(config, state))
}

fn resolve_shell_config() -> anyhow::Result<ShellConfig> {
    let defaults = ShellConfig::platform_default();
    let program = std::env::var("CONSOLE_SHELL").unwrap_or_else(|_| defaults.program().to_string());
    let timeout_ms = env_or("CONSOLE_TIMEOUT_MS", defaults.timeout().as_millis() as u64);
    let max_output = env_or("CONSOLE_MAX_OUTPUT_BYTES", defaults.max_output_bytes());
    let python = std::env::var("CONSOLE_PYTHON").unwrap_or_else(|_| defaults.python().to_string());
    Ok(ShellConfig::new(program, Duration::from_millis(timeout_ms), max_output)?
        .with_python(python)?)
}

#[derive(Debug)]
enum ApiError {
    Sandbox(SandboxError),
    UnknownSession(String),
    BadRequest(String),
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError::Sandbox(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Sandbox(err) => status_for(err),
            ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Sandbox(err) => err.to_string(),
            ApiError::UnknownSession(id) => format!("unknown console session: {id}"),
            ApiError::BadRequest(message) => message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(err = %message, "request failed");
        } else {
            warn!(err = %message, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::OutsideRoot { .. } => StatusCode::FORBIDDEN,
        SandboxError::NotFound { .. } => StatusCode::NOT_FOUND,
        SandboxError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        SandboxError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
        SandboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn tracked<T>(
    metrics: &AppMetrics,
    operation: &'static str,
    result: sandbox::Result<T>,
) -> sandbox::Result<T> {
    metrics.record_sandbox_op(operation, result.is_ok());
    result
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ProjectBody {
    template: String,
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response()
        }
    }
}

async fn create_folder(State(state): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult {
    let result = state.sandbox.create_folder(&query.path).await;
    let message = tracked(&state.metrics, "create_folder", result)?;
    Ok(Json(json!({ "message": message })))
}

async fn create_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    body: Option<Json<ContentBody>>,
) -> ApiResult {
    let content = body.map(|Json(body)| body.content).unwrap_or_default();
    let result = state.sandbox.create_file(&query.path, content).await;
    let message = tracked(&state.metrics, "create_file", result)?;
    Ok(Json(json!({ "message": message })))
}

async fn read_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult {
    let result = state.sandbox.read_file(&query.path).await;
    let content = tracked(&state.metrics, "read_file", result)?;
    Ok(Json(json!({ "content": content })))
}

async fn write_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    Json(body): Json<ContentBody>,
) -> ApiResult {
    let result = state.sandbox.write_file(&query.path, body.content).await;
    let message = tracked(&state.metrics, "write_file", result)?;
    Ok(Json(json!({ "message": message })))
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<OptionalPathQuery>,
) -> ApiResult {
    let path = query.path.unwrap_or_else(|| ".".to_string());
    let result = state.sandbox.list_entries(&path).await;
    let files = tracked(&state.metrics, "list_files", result)?;
    Ok(Json(json!({ "files": files, "currentDirectory": path })))
}

async fn delete_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult {
    let result = state.sandbox.delete_file(&query.path).await;
    let message = tracked(&state.metrics, "delete_file", result)?;
    Ok(Json(json!({ "message": message })))
}

async fn create_project(
    State(state): State<AppState>,
    Query(query): Query<OptionalPathQuery>,
    Json(body): Json<ProjectBody>,
) -> ApiResult {
    let template: ProjectTemplate = body.template.parse()?;
    let parent = query.path.unwrap_or_default();
    let result = state.sandbox.create_project(&parent, template).await;
    let project = tracked(&state.metrics, "create_project", result)?;
    Ok(Json(json!({
        "message": format!("{} project created successfully at {}", template.name(), project)
    })))
}

async fn refresh_state(State(state): State<AppState>) -> ApiResult {
    let result = state.sandbox.state().full_rescan().await;
    tracked(&state.metrics, "refresh_state", result)?;
    Ok(Json(json!({ "message": "Project state refreshed successfully" })))
}

async fn clear_state(State(state): State<AppState>) -> ApiResult {
    let store = state.sandbox.state();
    let result = match store.reset().await {
        Ok(_) => store.full_rescan().await,
        Err(err) => Err(err),
    };
    tracked(&state.metrics, "clear_state", result)?;
    info!("project state cleared and synced with file system");
    Ok(Json(json!({ "message": "Project state cleared successfully" })))
}

async fn project_state(State(state): State<AppState>) -> Json<ProjectState> {
    Json(state.sandbox.state().current().await)
}

async fn console_session(State(state): State<AppState>) -> Json<Value> {
    let id = state.consoles.open();
    Json(json!({ "session": id }))
}

async fn close_console_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    state.consoles.close(&headers)?;
    Ok(Json(json!({ "message": "Console session closed" })))
}

async fn console_cwd(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let console = state.consoles.get(&headers)?;
    Ok(Json(json!({ "cwd": console.relative_cwd().display_or_dot() })))
}

async fn console_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<Json<ConsoleResponse>, ApiError> {
    let console = state.consoles.get(&headers)?;
    let result = console.execute(&body.command).await;
    state.metrics.record_console(result.is_ok());
    Ok(Json(result?))
}

async fn run_python(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<Json<ConsoleResponse>, ApiError> {
    let console = state.consoles.get(&headers)?;
    let result = console.run_python(&body.command).await;
    Ok(Json(tracked(&state.metrics, "run_python", result)?))
}

async fn pip_install(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<Json<ConsoleResponse>, ApiError> {
    let console = state.consoles.get(&headers)?;
    let result = console.pip_install(&body.command).await;
    Ok(Json(tracked(&state.metrics, "pip_install", result)?))
}

async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("uploaded file has no name".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        let result = state.sandbox.upload(&filename, &bytes).await;
        let message = tracked(&state.metrics, "upload", result)?;
        return Ok(Json(json!({
            "message": message,
            "file_contents": String::from_utf8_lossy(&bytes),
        })));
    }
    Err(ApiError::BadRequest("missing 'file' field".to_string()))
}

async fn download_projects(State(state): State<AppState>) -> Result<Response, ApiError> {
    let result = state.sandbox.archive_tree().await;
    let bytes = tracked(&state.metrics, "download_projects", result)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"projects.zip\""),
        ],
        bytes,
    )
        .into_response())
}
