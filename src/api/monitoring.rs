//! Read-only observability surface: health, stats, traces, logs.
//!
//! Reports on the [`crate::trace_store::TraceStore`] and
//! [`crate::cost_tracker::CostTracker`], with `/history` bucketing the cost
//! time series into a requested window.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::cost_tracker::Period;
use crate::trace_store::TraceFilter;

use super::routes::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/history", get(history))
        .route("/models", get(models))
        .route("/traces", get(list_traces))
        .route("/traces/:id", get(get_trace))
        .route("/requests", get(list_traces))
        .route("/requests/search", get(search_requests))
        .route("/requests/:id", get(get_trace))
        .route("/stats/cost", get(cost_stats))
        .route("/stats/cost/history", get(cost_history))
        .route("/persistent-stats", get(persistent_stats))
        .route("/logs", get(logs))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let credentials = state.key_manager.snapshot_all().await;
    let healthy_keys = credentials
        .iter()
        .filter(|c| !matches!(c.circuit, crate::key_manager::CircuitState::Open))
        .count();
    let pool_cooldown_ms = state.key_manager.get_pool_cooldown_remaining_ms().await;

    Json(serde_json::json!({
        "status": if healthy_keys > 0 { "ok" } else { "degraded" },
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "paused": state.paused.load(std::sync::atomic::Ordering::SeqCst),
        "keys": {
            "total": credentials.len(),
            "healthy": healthy_keys,
            "poolCooldownMs": pool_cooldown_ms,
        },
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.request_handler.metrics.snapshot().await;
    let today = state.cost_tracker.get_stats(Period::Today).await;
    let projection = state.cost_tracker.get_projection().await;
    Json(serde_json::json!({
        "requests": metrics,
        "costToday": today,
        "projectedDailyCost": projection,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    minutes: Option<u64>,
}

/// `cost_time_series` is bucketed hourly, so a `minutes` query is converted
/// to a count of hourly buckets (rounded up, minimum 1) and each bucket's
/// per-model costs are summed into a single point.
async fn history(State(state): State<Arc<AppState>>, Query(q): Query<HistoryQuery>) -> Json<serde_json::Value> {
    let n = q.minutes.map(|m| ((m + 59) / 60).max(1) as usize).unwrap_or(24);
    let series = state.cost_tracker.get_cost_time_series().await;
    let start = series.times.len().saturating_sub(n);

    let points: Vec<serde_json::Value> = series.times[start..]
        .iter()
        .enumerate()
        .map(|(offset, time)| {
            let idx = start + offset;
            let cost: f64 = series
                .models
                .values()
                .map(|values| values.get(idx).copied().unwrap_or(0.0))
                .sum();
            serde_json::json!({ "time": time, "cost": cost })
        })
        .collect();

    Json(serde_json::json!({
        "schemaVersion": 2,
        "tier": "all",
        "tierResolution": "hour",
        "points": points,
    }))
}

async fn models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "models": state.catalog.all(),
        "count": state.catalog.all().len(),
        "cacheStats": { "hits": 0, "misses": 0 },
        "timestamp": chrono::Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn list_traces(State(state): State<Arc<AppState>>, Query(q): Query<RecentQuery>) -> Json<serde_json::Value> {
    let limit = q.limit.unwrap_or(100);
    let traces = state.trace_store.recent(limit).await;
    Json(serde_json::json!({ "traces": traces, "total": state.trace_store.len().await }))
}

async fn get_trace(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.trace_store.get(id).await {
        Some(trace) => Json(trace).into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "trace not found"}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    success: Option<bool>,
    model: Option<String>,
    has_retries: Option<bool>,
    min_duration_ms: Option<u64>,
    since: Option<DateTime<Utc>>,
}

async fn search_requests(State(state): State<Arc<AppState>>, Query(q): Query<SearchQuery>) -> Json<serde_json::Value> {
    let filter = TraceFilter {
        success: q.success,
        model: q.model,
        has_retries: q.has_retries,
        min_duration_ms: q.min_duration_ms,
        since: q.since,
    };
    let traces = state.trace_store.query(&filter).await;
    Json(serde_json::json!({ "traces": traces }))
}

async fn cost_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "byKey": state.cost_tracker.get_cost_by_key().await,
        "byTenant": state.cost_tracker.get_all_tenant_costs().await,
    }))
}

async fn cost_history(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.cost_tracker.get_cost_time_series().await).unwrap_or(serde_json::Value::Null))
}

async fn persistent_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.cost_tracker.get_full_report().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(State(state): State<Arc<AppState>>, Query(q): Query<LogsQuery>) -> Json<serde_json::Value> {
    let limit = q.limit.unwrap_or(200);
    Json(serde_json::json!({ "lines": state.log_ring.recent(limit) }))
}
