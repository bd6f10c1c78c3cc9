pub mod auth;
pub mod spaces;
pub mod terminal;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use sandspace_protocol::HealthResponse;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SpaceError;
use crate::exec::ExecGateway;
use crate::files::WorkspaceFiles;
use crate::space::SpaceManager;
use crate::stats::SpaceStatsReader;
use crate::terminal::TerminalBridge;

/// Shared state for all API handlers, passed via axum `State`.
pub struct AppState {
    pub manager: Arc<SpaceManager>,
    pub exec: ExecGateway,
    pub files: WorkspaceFiles,
    pub stats: SpaceStatsReader,
    pub terminal: TerminalBridge,
}

impl AppState {
    pub fn new(manager: Arc<SpaceManager>) -> Self {
        Self {
            exec: ExecGateway::new(manager.clone()),
            files: WorkspaceFiles::new(manager.clone()),
            stats: SpaceStatsReader::new(manager.clone()),
            terminal: TerminalBridge::new(manager.clone()),
            manager,
        }
    }

    pub fn config(&self) -> &Config {
        self.manager.config()
    }
}

/// Response envelope for successful API responses.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(serde::Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(serde::Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: ApiMeta::new(),
        }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
            },
            meta: ApiMeta::new(),
        }
    }
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, axum::Json(ApiError::new(code, message))).into_response()
}

pub fn ok_response<T: serde::Serialize>(data: T) -> Response {
    (StatusCode::OK, axum::Json(ApiResponse::new(data))).into_response()
}

pub fn created_response<T: serde::Serialize>(data: T) -> Response {
    (StatusCode::CREATED, axum::Json(ApiResponse::new(data))).into_response()
}

pub fn status_for(err: &SpaceError) -> StatusCode {
    match err {
        SpaceError::NotFound(_) => StatusCode::NOT_FOUND,
        SpaceError::Conflict(_) => StatusCode::CONFLICT,
        SpaceError::InvalidName(_) | SpaceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SpaceError::BootstrapFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SpaceError::Runtime(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Map a space error onto the error envelope.
pub fn space_error_response(err: SpaceError) -> Response {
    error_response(status_for(&err), err.code(), err.to_string())
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    ok_response(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_seconds: state.manager.metrics().uptime_seconds(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    // Listing refreshes the per-status gauges.
    if let Err(e) = state.manager.list().await {
        warn!(error = %e, "failed to refresh space counts for metrics");
    }
    let body = state.manager.metrics().encode_metrics();
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let h = response.headers_mut();
    h.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    h.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    h.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    h.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Build the full router. Everything under `/api/spaces` requires the admin
/// token; `/api/health` and `/metrics` do not.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .merge(spaces::routes())
        .merge(terminal::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let api = Router::new().route("/health", get(health)).merge(protected);

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(metrics))
        .layer(cors_layer(state.config()))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Bind the listener and serve the API as a background task.
pub async fn start_server(state: Arc<AppState>) -> anyhow::Result<JoinHandle<()>> {
    let server = &state.config().server;
    if server.bind_addr != "127.0.0.1" && server.bind_addr != "::1" && server.api_key.is_empty() {
        warn!(
            bind_addr = %server.bind_addr,
            "API bound to a non-loopback address with no api_key set"
        );
    }

    let addr = format!("{}:{}", server.bind_addr, server.port);
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API server listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    }))
}
