//! Wires every component together and assembles the top-level router.
//!
//! Constructs shared state for the five subsystems (key manager, model
//! router, cost tracker, trace store, event stream), merges the per-module
//! routers, and binds and serves with graceful shutdown.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::cost_tracker::CostTracker;
use crate::event_stream::EventStream;
use crate::key_manager::{KeyManager, KeyManagerConfig};
use crate::log_ring::LogRing;
use crate::model_router::{ClassifierThresholds, ModelRouter, ModelRouterConfig};
use crate::models::ModelCatalog;
use crate::request_handler::RequestHandler;
use crate::routing_config::RoutingConfigStore;
use crate::trace_store::TraceStore;
use crate::upstream::UpstreamClient;

const TRACE_STORE_CAPACITY: usize = 2_000;

/// Shared, `Arc`-wrapped state handed to every route handler.
pub struct AppState {
    pub config: Config,
    pub catalog: Arc<ModelCatalog>,
    pub key_manager: Arc<KeyManager>,
    pub model_router: Arc<ModelRouter>,
    pub cost_tracker: Arc<CostTracker>,
    pub trace_store: Arc<TraceStore>,
    pub event_stream: Arc<EventStream>,
    pub routing_config: Arc<RoutingConfigStore>,
    pub request_handler: Arc<RequestHandler>,
    pub log_ring: LogRing,
    pub paused: Arc<AtomicBool>,
    pub started_at: Instant,
}

/// Builds the full component graph, reading any persisted cost/routing
/// state from `config.working_dir`, then binds and serves until the
/// process receives a shutdown signal.
pub async fn serve(config: Config, log_ring: LogRing) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.working_dir).await.ok();

    let catalog = Arc::new(ModelCatalog::load(config.models_override_path.as_deref()));

    let key_manager = Arc::new(KeyManager::new(
        config.zai_api_keys.clone(),
        KeyManagerConfig {
            max_concurrency_per_key: config.max_concurrency_per_key,
            ..KeyManagerConfig::default()
        },
    ));

    let routing_config = RoutingConfigStore::load_or_default(config.routing_state_path(), Arc::clone(&catalog)).await;
    let active_routing = routing_config.get().await;

    let model_router = Arc::new(ModelRouter::new(
        Arc::clone(&catalog),
        ModelRouterConfig {
            default_model: active_routing.default_model.clone(),
            classifier: ClassifierThresholds {
                heavy_min_messages: active_routing.classifier.heavy_min_messages,
                heavy_min_system_length: active_routing.classifier.heavy_min_system_length,
                light_max_messages: active_routing.classifier.light_max_messages,
                light_max_system_length: active_routing.classifier.light_max_system_length,
            },
            rules: active_routing.rules.clone(),
            burst_dampening_factor: 0.5,
            burst_dampening_window_limit: 3,
            retry_delay_floor_ms: active_routing.cooldown.base_ms,
        },
    ));

    let cost_tracker = CostTracker::new(
        config.cost_state_path(),
        Arc::clone(&catalog),
        config.save_debounce_ms,
        config.slow_save_threshold_ms,
    );
    cost_tracker.load().await;
    cost_tracker
        .set_budget(
            config.budget.daily_cents.map(|c| c as f64 / 100.0),
            config.budget.monthly_cents.map(|c| c as f64 / 100.0),
            Some(config.budget.alert_thresholds.clone()),
        )
        .await;

    let trace_store = Arc::new(TraceStore::new(TRACE_STORE_CAPACITY));
    let event_stream = EventStream::new();
    event_stream.spawn_pool_status_publisher(Arc::clone(&model_router));

    // Budget alerts surface on the same SSE stream as pool status and
    // request lifecycle events, so a dashboard only needs one subscription.
    let alert_events = Arc::clone(&event_stream);
    cost_tracker
        .set_alert_callback(Arc::new(move |alert| {
            alert_events.publish("budget_alert", serde_json::json!(alert));
        }))
        .await;

    let upstream = Arc::new(UpstreamClient::new(
        config.zai_base_url.clone(),
        config.max_concurrent_upstream,
        Duration::from_millis(config.request_timeout_ms),
    ));

    let request_handler = RequestHandler::new(
        Arc::clone(&key_manager),
        Arc::clone(&model_router),
        Arc::clone(&cost_tracker),
        Arc::clone(&trace_store),
        Arc::clone(&event_stream),
        Arc::clone(&upstream),
        config.clone(),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        catalog,
        key_manager,
        model_router,
        cost_tracker: Arc::clone(&cost_tracker),
        trace_store,
        event_stream,
        routing_config,
        request_handler,
        log_ring,
        paused: Arc::new(AtomicBool::new(false)),
        started_at: Instant::now(),
    });

    let app: Router<()> = Router::new()
        .merge(super::proxy::routes())
        .merge(super::monitoring::routes())
        .merge(super::model_routing::routes())
        .merge(super::control::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("binding on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(crate::error::GatewayError::Bind)?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cost_tracker.destroy().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
