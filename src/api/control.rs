//! `/control/{pause,resume}` and the two SSE feeds (`/requests/stream`,
//! `/events`).
//!
//! Both feeds are a thin delegation into
//! [`crate::event_stream::EventStream::subscribe_sse`], which already owns
//! sequencing, lag handling, and keepalive.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::routes::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .route("/requests/stream", get(stream))
        .route("/events", get(stream))
}

async fn pause(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response();
    }
    state.paused.store(true, std::sync::atomic::Ordering::SeqCst);
    state.event_stream.publish("gateway-paused", serde_json::json!({}));
    StatusCode::NO_CONTENT.into_response()
}

async fn resume(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response();
    }
    state.paused.store(false, std::sync::atomic::Ordering::SeqCst);
    state.event_stream.publish("gateway-resumed", serde_json::json!({}));
    StatusCode::NO_CONTENT.into_response()
}

/// Both `/requests/stream` and `/events` subscribe to the same named-event
/// broadcast; a dashboard that only cares about request lifecycle events
/// filters client-side on the `type` field rather than the server running
/// two separate broadcast channels.
async fn stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.event_stream.subscribe_sse()
}
