//! `POST /v1/messages` (and sibling LLM paths) — the client-facing entry
//! point into [`crate::request_handler::RequestHandler`].
//!
//! Extracts headers and parses the JSON body just far enough to read the
//! top-level `model` field; everything else is passed through untouched,
//! since the gateway doesn't need to understand the full wire format to
//! route and meter it.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio_util::sync::CancellationToken;

use super::routes::AppState;

const TENANT_HEADER: &str = "x-tenant-id";
const OVERRIDE_KEY_HEADER: &str = "x-proxy-override-key";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/complete", post(handle_messages))
        .route("/v1/:tail", post(handle_llm_path))
}

/// Handles the primary `/v1/messages` route and its legacy `/v1/complete`
/// alias, which share identical semantics (only the wire shape of the body
/// differs, and the gateway only ever touches the `model` field).
async fn handle_messages(state: State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(state, "/v1/messages", headers, body).await
}

/// Catches any other `/v1/<tail>` LLM path (e.g. a future `/v1/responses`)
/// and proxies it the same way, so the gateway does not need a new route
/// wired in for every upstream surface z.ai exposes under `/v1`.
async fn handle_llm_path(
    state: State<Arc<AppState>>,
    Path(tail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, &format!("/v1/{tail}"), headers, body).await
}

async fn dispatch(State(state): State<Arc<AppState>>, path: &str, headers: HeaderMap, body: Bytes) -> Response {
    if state.paused.load(std::sync::atomic::Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({"error": "gateway paused"})),
        )
            .into_response();
    }

    let body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({"error": format!("invalid JSON body: {e}")})),
            )
                .into_response();
        }
    };

    let tenant_id = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let override_key = headers
        .get(OVERRIDE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // A fresh token per request; dropped (and therefore cancelled) the
    // moment the handler future itself is dropped, which is what happens
    // when the underlying connection closes mid-request. Suspension points
    // inside the retry loop additionally race against `cancel.cancelled()`
    // so in-flight sleeps/acquires unwind promptly rather than relying
    // solely on future-drop.
    let cancel = CancellationToken::new();

    state
        .request_handler
        .handle_request(path, body, tenant_id, override_key, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_header_name_is_lowercase() {
        assert_eq!(TENANT_HEADER, TENANT_HEADER.to_ascii_lowercase());
    }
}
