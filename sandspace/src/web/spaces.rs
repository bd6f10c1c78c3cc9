use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use sandspace_protocol::{CreateSpaceRequest, ExecRequest, WriteFileRequest};
use serde::Deserialize;

use super::{created_response, ok_response, space_error_response, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/spaces", get(list_spaces).post(create_space))
        .route("/spaces/{name}", get(get_space).delete(destroy_space))
        .route("/spaces/{name}/start", post(start_space))
        .route("/spaces/{name}/pause", post(pause_space))
        .route("/spaces/{name}/stop", post(pause_space))
        .route("/spaces/{name}/exec", post(exec_command))
        .route("/spaces/{name}/stats", get(space_stats))
        .route("/spaces/{name}/observability", get(space_observability))
        .route("/spaces/{name}/files", get(list_files))
        .route(
            "/spaces/{name}/files/content",
            get(read_file).put(write_file),
        )
}

#[derive(Deserialize)]
struct DestroyQuery {
    #[serde(default)]
    remove_volume: bool,
}

#[derive(Deserialize)]
struct ListFilesQuery {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct ReadFileQuery {
    path: String,
    max_bytes: Option<u64>,
}

async fn list_spaces(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.list().await {
        Ok(spaces) => ok_response(spaces),
        Err(e) => space_error_response(e),
    }
}

async fn create_space(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSpaceRequest>,
) -> Response {
    match state.manager.create(req).await {
        Ok(info) => created_response(info),
        Err(e) => space_error_response(e),
    }
}

async fn get_space(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.manager.get(&name).await {
        Ok(info) => ok_response(info),
        Err(e) => space_error_response(e),
    }
}

async fn destroy_space(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Response {
    match state.manager.destroy(&name, query.remove_volume).await {
        Ok(()) => ok_response(serde_json::json!({
            "name": name,
            "destroyed": true,
            "volume_removed": query.remove_volume,
        })),
        Err(e) => space_error_response(e),
    }
}

async fn start_space(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.manager.start(&name).await {
        Ok(info) => ok_response(info),
        Err(e) => space_error_response(e),
    }
}

async fn pause_space(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if let Err(e) = state.manager.pause(&name).await {
        return space_error_response(e);
    }
    match state.manager.get(&name).await {
        Ok(info) => ok_response(info),
        Err(e) => space_error_response(e),
    }
}

async fn exec_command(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Response {
    match state.exec.exec(&name, &req).await {
        Ok(result) => ok_response(result),
        Err(e) => space_error_response(e),
    }
}

async fn space_stats(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.stats.stats(&name).await {
        Ok(stats) => ok_response(stats),
        Err(e) => space_error_response(e),
    }
}

async fn space_observability(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.stats.observability(&name).await {
        Ok(obs) => ok_response(obs),
        Err(e) => space_error_response(e),
    }
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> Response {
    match state.files.list(&name, &query.path).await {
        Ok(entries) => ok_response(entries),
        Err(e) => space_error_response(e),
    }
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ReadFileQuery>,
) -> Response {
    match state.files.read(&name, &query.path, query.max_bytes).await {
        Ok(content) => ok_response(content),
        Err(e) => space_error_response(e),
    }
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<WriteFileRequest>,
) -> Response {
    match state.files.write(&name, &req).await {
        Ok(bytes) => ok_response(serde_json::json!({
            "path": req.path,
            "bytes": bytes,
        })),
        Err(e) => space_error_response(e),
    }
}
