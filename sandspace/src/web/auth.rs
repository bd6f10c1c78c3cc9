use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use super::AppState;

/// Constant-time string comparison. All bytes are compared regardless of
/// where the first difference is.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let result = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    result == 0
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// The token presented by a request: `Authorization: Bearer <token>`, or
/// `?key=<token>` for clients that cannot set headers (browser WebSockets).
fn presented_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("authorization") {
        if let Some(token) = value.to_str().ok().and_then(|s| s.strip_prefix("Bearer ")) {
            return Some(token.to_string());
        }
    }
    Query::<KeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.key)
}

/// Requires the configured api_key. An empty key disables authentication.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = &state.config().server.api_key;
    if expected.is_empty() {
        return next.run(request).await;
    }

    match presented_token(&request) {
        Some(token) if constant_time_eq(&token, expected) => next.run(request).await,
        _ => super::error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid or missing api key",
        ),
    }
}
