//! `/model-routing*` — CRUD over the persisted declarative routing config,
//! plus read-only views onto the router's live runtime state (pools,
//! cooldowns, per-key overrides) and a dry-run classifier endpoint.
//!
//! Mutating routes validate against the model catalog before persisting
//! (`GET/PUT /model-routing`, `POST /model-routing/reset`) so a bad config
//! can't be written over a working one.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::model_router::{ClassifierThresholds, RoutingFeatures};
use crate::routing_config::RoutingConfig;

use super::routes::AppState;

/// Pushes a newly persisted routing config into the live `ModelRouter` so a
/// `PUT`/reset/enable-safe call takes effect on the next selection instead
/// of only after a restart.
async fn apply_to_live_router(state: &AppState, config: &RoutingConfig) {
    state
        .model_router
        .update_config(
            config.default_model.clone(),
            ClassifierThresholds {
                heavy_min_messages: config.classifier.heavy_min_messages,
                heavy_min_system_length: config.classifier.heavy_min_system_length,
                light_max_messages: config.classifier.light_max_messages,
                light_max_system_length: config.classifier.light_max_system_length,
            },
            config.rules.clone(),
            config.cooldown.base_ms,
        )
        .await;
    state.model_router.reset_cooldowns().await;
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/model-routing", get(get_config).put(put_config))
        .route("/model-routing/reset", post(reset_config))
        .route("/model-routing/test", get(dry_run))
        .route(
            "/model-routing/overrides",
            get(get_overrides).put(set_override).delete(clear_override),
        )
        .route("/model-routing/cooldowns", get(get_cooldowns))
        .route("/model-routing/pools", get(get_pools))
        .route("/model-routing/enable-safe", put(enable_safe))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response()
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<RoutingConfig> {
    Json(state.routing_config.get().await)
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new_config): Json<RoutingConfig>,
) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return unauthorized();
    }
    match state.routing_config.put(new_config).await {
        Ok(saved) => {
            apply_to_live_router(&state, &saved).await;
            Json(saved).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e}))).into_response(),
    }
}

async fn reset_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return unauthorized();
    }
    let reset = state.routing_config.reset().await;
    apply_to_live_router(&state, &reset).await;
    Json(reset).into_response()
}

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    #[serde(default)]
    messages: usize,
    #[serde(default)]
    system_length: usize,
    #[serde(default)]
    has_tools: bool,
    #[serde(default)]
    has_vision: bool,
    max_tokens: Option<u32>,
    #[serde(default = "default_client_model")]
    client_model: String,
}

fn default_client_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

/// Runs the classifier against synthetic features without acquiring a model
/// slot or touching cooldown state, so operators can validate a ruleset
/// against hypothetical traffic shapes before it goes live.
async fn dry_run(State(state): State<Arc<AppState>>, Query(q): Query<DryRunQuery>) -> Json<serde_json::Value> {
    let features = RoutingFeatures {
        message_count: q.messages,
        has_tools: q.has_tools,
        has_vision: q.has_vision,
        system_length: q.system_length,
        client_model: q.client_model,
        max_tokens: q.max_tokens,
    };
    let decision = state.model_router.select_model(&features, None, &[]).await;
    Json(serde_json::json!({
        "targetModel": decision.target_model,
        "tier": decision.tier.id(),
        "source": format!("{:?}", decision.source),
        "reason": decision.reason,
    }))
}

async fn get_overrides(State(state): State<Arc<AppState>>) -> Json<std::collections::HashMap<String, String>> {
    Json(state.model_router.overrides_snapshot().await)
}

#[derive(Debug, Deserialize)]
struct OverrideBody {
    key: String,
    model: String,
}

async fn set_override(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OverrideBody>,
) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return unauthorized();
    }
    if state.catalog.get(&body.model).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown model '{}'", body.model)})),
        )
            .into_response();
    }
    state.model_router.set_override(body.key, body.model).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct OverrideKeyQuery {
    key: String,
}

async fn clear_override(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<OverrideKeyQuery>,
) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return unauthorized();
    }
    state.model_router.clear_override(&q.key).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn get_cooldowns(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pools = state.model_router.pool_snapshot().await;
    let mut out = serde_json::Map::new();
    for entries in pools.values() {
        for entry in entries {
            if entry.cooldown_ms > 0 {
                out.insert(entry.model.clone(), serde_json::json!(entry.cooldown_ms));
            }
        }
    }
    Json(serde_json::Value::Object(out))
}

async fn get_pools(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.model_router.pool_snapshot().await).unwrap_or(serde_json::Value::Null))
}

/// Flips the persisted config to `enabled=true, shadowMode=false` after
/// re-validating it against the current catalog, so an operator can promote
/// a ruleset that was being shadow-tested without hand-editing the file.
async fn enable_safe(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !crate::auth::check_bearer(&headers, state.config.proxy_secret.as_deref()) {
        return unauthorized();
    }
    let mut config = state.routing_config.get().await;
    config.enabled = true;
    config.shadow_mode = false;
    match state.routing_config.put(config).await {
        Ok(saved) => {
            apply_to_live_router(&state, &saved).await;
            Json(saved).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e}))).into_response(),
    }
}
