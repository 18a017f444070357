//! Exercises `RequestHandler::handle_request`'s give-up thresholds against a
//! `wiremock` double, rather than unit-testing the retry loop's counters in
//! isolation: a pool that keeps returning 429s across two candidate models
//! should surface a `max_model_switches` failure once the configured switch
//! cap is reached, without ever falling through to the 429-count/window caps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use zai_gateway::config::{AdmissionHoldConfig, Config, FailoverConfig, PoolCooldownConfig};
use zai_gateway::cost_tracker::CostTracker;
use zai_gateway::event_stream::EventStream;
use zai_gateway::key_manager::{KeyManager, KeyManagerConfig};
use zai_gateway::model_router::{ClassifierThresholds, ModelRouter, ModelRouterConfig};
use zai_gateway::models::{Model, ModelCatalog, ModelPricing, ModelTier};
use zai_gateway::request_handler::RequestHandler;
use zai_gateway::trace_store::TraceStore;
use zai_gateway::upstream::UpstreamClient;

fn two_model_catalog() -> Arc<ModelCatalog> {
    Arc::new(ModelCatalog::from_models(vec![
        Model {
            id: "heavy-a".to_string(),
            tier: ModelTier::Heavy,
            context_length: 100_000,
            supports_vision: true,
            max_concurrency: 4,
            pricing: ModelPricing { input_per_1m: 1.0, output_per_1m: 1.0 },
        },
        Model {
            id: "heavy-b".to_string(),
            tier: ModelTier::Heavy,
            context_length: 100_000,
            supports_vision: true,
            max_concurrency: 4,
            pricing: ModelPricing { input_per_1m: 1.0, output_per_1m: 1.0 },
        },
    ]))
}

async fn build_handler(server_uri: String, max_model_switches_per_request: u32) -> Arc<RequestHandler> {
    let catalog = two_model_catalog();

    let key_manager = Arc::new(KeyManager::new(
        vec!["test-key".to_string()],
        KeyManagerConfig::default(),
    ));

    let model_router = Arc::new(ModelRouter::new(
        Arc::clone(&catalog),
        ModelRouterConfig {
            default_model: "heavy-a".to_string(),
            classifier: ClassifierThresholds::default(),
            rules: Vec::new(),
            burst_dampening_factor: 0.5,
            burst_dampening_window_limit: 3,
            retry_delay_floor_ms: 10,
        },
    ));

    let cost_tracker = CostTracker::new(
        PathBuf::from("/tmp/zai_gateway_test_give_up_cost_state.json"),
        Arc::clone(&catalog),
        60_000,
        250,
    );

    let trace_store = Arc::new(TraceStore::new(10));
    let event_stream = EventStream::new();
    let upstream = Arc::new(UpstreamClient::new(server_uri, 4, Duration::from_secs(5)));

    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        proxy_secret: None,
        zai_api_keys: vec!["test-key".to_string()],
        zai_base_url: String::new(),
        max_retries: 10,
        request_timeout_ms: 5_000,
        max_total_concurrency: 16,
        max_concurrent_upstream: 4,
        max_concurrency_per_key: 16,
        queue_size: 8,
        queue_timeout_ms: 1_000,
        pool_cooldown: PoolCooldownConfig {
            sleep_threshold_ms: 0,
            ..PoolCooldownConfig::default()
        },
        admission_hold: AdmissionHoldConfig {
            enabled: false,
            ..AdmissionHoldConfig::default()
        },
        failover: FailoverConfig {
            max_429_attempts_per_request: 50,
            max_429_retry_window_ms: 3_600_000,
            max_model_switches_per_request,
        },
        budget: Default::default(),
        save_debounce_ms: 60_000,
        slow_save_threshold_ms: 250,
        models_override_path: None,
        working_dir: PathBuf::from("/tmp"),
    };

    RequestHandler::new(
        key_manager,
        model_router,
        cost_tracker,
        trace_store,
        event_stream,
        upstream,
        config,
    )
}

fn request_body() -> serde_json::Value {
    serde_json::json!({
        "model": "claude-sonnet-4-5",
        "messages": [{"role": "user", "content": "hi"}],
        "tools": [{"name": "search"}],
    })
}

#[tokio::test]
async fn gives_up_with_max_model_switches_before_exhausting_429_caps() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .mount(&server)
        .await;

    // With two candidate models and a cap of one switch, the handler should
    // give up on the attempt that first switches away from the initial pick
    // rather than continuing to alternate between the two until the much
    // higher 429-count/window caps are reached.
    let handler = build_handler(server.uri(), 1).await;

    let response = handler
        .handle_request(
            "/v1/messages",
            request_body(),
            None,
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    let marker = response
        .headers()
        .get("x-proxy-rate-limit")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(marker.as_deref(), Some("model_exhausted"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["errorType"], "max_model_switches");
}
