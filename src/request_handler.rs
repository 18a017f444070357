//! The retry/failover state machine that composes the Key Manager and
//! Model Router, drives one or more upstream attempts via
//! [`crate::upstream::UpstreamClient`], and streams the winning response
//! back to the client.
//!
//! Each attempt consults the Key Manager and Model Router fresh rather than
//! iterating a fixed chain, tracking per-outcome counters
//! (`rate_limit_count`, `server_error_count`, `client_error_count`) and
//! enforcing admission holds and give-up thresholds across the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::cost_tracker::CostTracker;
use crate::event_stream::EventStream;
use crate::key_manager::{CredentialHandle, KeyManager, Outcome, PoolRateLimitHit};
use crate::model_router::{ModelRouter, RoutingFeatures};
use crate::trace_store::{RequestTrace, TraceStore};
use crate::upstream::{AttemptOutcome, ErrorKind, UpstreamClient};

/// Extracts the routing feature vector from an inbound Anthropic-shaped
/// request body. Unknown/missing fields default to the "light" end so a
/// malformed body fails open into a cheap tier rather than an expensive one.
pub fn extract_features(body: &Value) -> RoutingFeatures {
    let messages = body.get("messages").and_then(|m| m.as_array());
    let message_count = messages.map(|m| m.len()).unwrap_or(0);

    let has_tools = body
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|t| !t.is_empty())
        .unwrap_or(false);

    let has_vision = messages
        .map(|m| {
            m.iter().any(|msg| {
                msg.get("content")
                    .and_then(|c| c.as_array())
                    .map(|parts| parts.iter().any(|p| p.get("type").and_then(|t| t.as_str()) == Some("image")))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    let system_length = body
        .get("system")
        .and_then(|s| s.as_str())
        .map(|s| s.len())
        .unwrap_or(0);

    let client_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();

    let max_tokens = body.get("max_tokens").and_then(|v| v.as_u64()).map(|v| v as u32);

    RoutingFeatures {
        message_count,
        has_tools,
        has_vision,
        system_length,
        client_model,
        max_tokens,
    }
}

/// Every stat counter the request lifecycle needs, exposed as atomics so
/// `/stats` can snapshot them without taking a lock on the hot path.
#[derive(Default)]
pub struct Metrics {
    pub client_request_start: AtomicU64,
    pub client_request_success: AtomicU64,
    pub client_request_failure: AtomicU64,
    pub total_retries: AtomicU64,
    pub retry_backoff_delay_count: AtomicU64,
    pub same_model_retry: AtomicU64,
    pub admission_hold_rejected: AtomicU64,
    pub admission_hold_complete: AtomicU64,
    pub pool_429_total: AtomicU64,
    give_up_reasons: Mutex<HashMap<&'static str, u64>>,
    failed_request_attempted_sum: AtomicU64,
    failed_request_switches_sum: AtomicU64,
    failed_request_count: AtomicU64,
}

impl Metrics {
    async fn record_give_up(&self, reason: &'static str) {
        let mut reasons = self.give_up_reasons.lock().await;
        *reasons.entry(reason).or_insert(0) += 1;
    }

    async fn record_failed_request_model_stats(&self, attempted: usize, switches: usize) {
        self.failed_request_attempted_sum.fetch_add(attempted as u64, Ordering::Relaxed);
        self.failed_request_switches_sum.fetch_add(switches as u64, Ordering::Relaxed);
        self.failed_request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> Value {
        let reasons = self.give_up_reasons.lock().await.clone();
        serde_json::json!({
            "clientRequestStart": self.client_request_start.load(Ordering::Relaxed),
            "clientRequestSuccess": self.client_request_success.load(Ordering::Relaxed),
            "clientRequestFailure": self.client_request_failure.load(Ordering::Relaxed),
            "totalRetries": self.total_retries.load(Ordering::Relaxed),
            "retryBackoffDelayCount": self.retry_backoff_delay_count.load(Ordering::Relaxed),
            "sameModelRetry": self.same_model_retry.load(Ordering::Relaxed),
            "admissionHoldRejected": self.admission_hold_rejected.load(Ordering::Relaxed),
            "admissionHoldComplete": self.admission_hold_complete.load(Ordering::Relaxed),
            "pool429Total": self.pool_429_total.load(Ordering::Relaxed),
            "giveUpReasons": reasons,
            "failedRequestModelStats": {
                "count": self.failed_request_count.load(Ordering::Relaxed),
                "attemptedSum": self.failed_request_attempted_sum.load(Ordering::Relaxed),
                "switchesSum": self.failed_request_switches_sum.load(Ordering::Relaxed),
            },
        })
    }
}

pub struct RequestHandler {
    pub key_manager: Arc<KeyManager>,
    pub model_router: Arc<ModelRouter>,
    pub cost_tracker: Arc<CostTracker>,
    pub trace_store: Arc<TraceStore>,
    pub event_stream: Arc<EventStream>,
    pub upstream: Arc<UpstreamClient>,
    pub config: Config,
    pub metrics: Metrics,
    admission_holds: std::sync::atomic::AtomicUsize,
}

impl RequestHandler {
    pub fn new(
        key_manager: Arc<KeyManager>,
        model_router: Arc<ModelRouter>,
        cost_tracker: Arc<CostTracker>,
        trace_store: Arc<TraceStore>,
        event_stream: Arc<EventStream>,
        upstream: Arc<UpstreamClient>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            key_manager,
            model_router,
            cost_tracker,
            trace_store,
            event_stream,
            upstream,
            config,
            metrics: Metrics::default(),
            admission_holds: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Entry point for `POST /v1/messages` (and sibling LLM routes). Any
    /// uncaught failure inside `proxy_with_retries` surfaces as a 504,
    /// unless a response has already started streaming to the client.
    pub async fn handle_request(
        self: &Arc<Self>,
        path: &str,
        mut body: Value,
        tenant_id: Option<String>,
        override_key: Option<String>,
        cancel: CancellationToken,
    ) -> Response {
        self.metrics.client_request_start.fetch_add(1, Ordering::Relaxed);

        let original_model = body.get("model").and_then(|m| m.as_str()).map(str::to_string);
        let mut trace = RequestTrace::new("POST", path);
        trace.original_model = original_model.clone();
        let request_id = trace.request_id;

        self.event_stream.publish(
            "request-start",
            serde_json::json!({
                "requestId": request_id,
                "path": path,
                "originalModel": original_model,
            }),
        );

        let result = self
            .proxy_with_retries(&mut trace, &mut body, tenant_id, override_key, cancel)
            .await;

        match result {
            Ok(response) => {
                self.metrics.client_request_success.fetch_add(1, Ordering::Relaxed);
                trace.end(
                    response.status().as_u16(),
                    response.status().is_success(),
                    None,
                );
                self.publish_request_complete(&trace);
                self.trace_store.put(trace).await;
                response
            }
            Err(failure) => {
                self.metrics.client_request_failure.fetch_add(1, Ordering::Relaxed);
                if failure.headers_sent {
                    trace.end(failure.status.as_u16(), true, None);
                    self.publish_request_complete(&trace);
                    self.trace_store.put(trace).await;
                    return failure.into_response_with_request_id(request_id);
                }
                trace.end(failure.status.as_u16(), false, Some(failure.message.clone()));
                self.publish_request_complete(&trace);
                self.trace_store.put(trace).await;
                failure.into_response_with_request_id(request_id)
            }
        }
    }

    fn publish_request_complete(&self, trace: &RequestTrace) {
        self.event_stream.publish(
            "request-complete",
            serde_json::json!({
                "requestId": trace.request_id,
                "status": trace.status,
                "success": trace.success,
                "mappedModel": trace.mapped_model,
                "latencyMs": trace.latency_ms,
                "attempts": trace.attempts.len(),
            }),
        );
    }

    async fn proxy_with_retries(
        self: &Arc<Self>,
        trace: &mut RequestTrace,
        body: &mut Value,
        tenant_id: Option<String>,
        override_key: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Response, HandlerFailure> {
        let features = extract_features(body);
        let mut attempted_models: Vec<String> = Vec::new();
        let mut fresh_connection_next = false;
        let mut retry_window_start = Instant::now();
        let mut request_429_count: u32 = 0;
        let mut model_switches: usize = 0;

        for attempt_number in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(HandlerFailure::client_disconnect());
            }

            let mut attempt = crate::trace_store::Attempt::new(attempt_number);
            attempt.retried = attempt_number > 0;

            // --- 1. Admission hold (attempt 0 only: the tier either clears
            // during the hold or the request fails over/gives up from there).
            if attempt_number == 0 && self.config.admission_hold.enabled {
                if let Some(shift) = self.try_admission_hold(&features, &cancel).await? {
                    retry_window_start += shift;
                }
            }

            // --- 2. Pool cooldown admission. Model selection routes around
            // cooled models on its own, so this only dampens the very first
            // attempt with a short, capped sleep when the pool just took a
            // 429 hit, rather than blocking for the full cooldown duration.
            let pool_cooldown_ms = self.key_manager.get_pool_cooldown_remaining_ms().await;
            if attempt_number == 0 && pool_cooldown_ms > self.config.pool_cooldown.sleep_threshold_ms {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(
                        self.config.pool_cooldown.sleep_threshold_ms.min(pool_cooldown_ms),
                    )) => {}
                    _ = cancel.cancelled() => return Err(HandlerFailure::client_disconnect()),
                }
            }

            // --- 3. Key acquisition, with bounded queueing.
            let handle = match self.acquire_key_with_queue(&cancel).await {
                Some(h) => h,
                None => return Err(HandlerFailure::all_keys_exhausted()),
            };
            trace.key_index = Some(handle.index);

            // --- 4. Body transform via model selection.
            let decision = self
                .model_router
                .select_model(&features, override_key.as_deref(), &attempted_models)
                .await;
            if attempted_models.last() != Some(&decision.target_model) && !attempted_models.is_empty() {
                model_switches += 1;
                if model_switches >= self.config.failover.max_model_switches_per_request as usize {
                    self.key_manager
                        .release(handle, Outcome::Success { latency_ms: 0 })
                        .await;
                    self.metrics.record_give_up("max_model_switches").await;
                    self.metrics
                        .record_failed_request_model_stats(attempted_models.len(), model_switches)
                        .await;
                    attempt.error_type = Some("max_model_switches".to_string());
                    attempt.retried = false;
                    trace.attempts.push(attempt);
                    return Err(HandlerFailure::max_model_switches());
                }
            }
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String(decision.target_model.clone()));
            }
            trace.mapped_model = Some(decision.target_model.clone());
            tracing::debug!(
                target_model = %decision.target_model,
                tier = %decision.tier,
                source = ?decision.source,
                "routed request to model"
            );

            if let Err(_cap) = self.model_router.acquire_model(&decision.target_model).await {
                // model_at_capacity never faults the credential: the model's
                // concurrency gate tripped before the key was ever dispatched
                // against upstream, so releasing as a failure would blame the
                // wrong resource and could spuriously trip its circuit.
                self.key_manager
                    .release(handle, Outcome::Success { latency_ms: 0 })
                    .await;
                attempted_models.push(decision.target_model.clone());
                attempt.error_type = Some("model_at_capacity".to_string());
                trace.attempts.push(attempt);
                self.sleep_backoff(attempt_number, None, &cancel).await?;
                continue;
            }

            // --- 5. Upstream dispatch.
            let started = Instant::now();
            let secret = self.key_manager.secret_for(handle.index).await.unwrap_or_default();
            let outcome = self
                .upstream
                .dispatch(
                    &secret,
                    "/v1/messages",
                    &*body,
                    Duration::from_millis(self.config.request_timeout_ms),
                    fresh_connection_next,
                )
                .await;
            fresh_connection_next = false;

            // --- 6. Classification and retry decision.
            match outcome {
                AttemptOutcome::PassThrough { status, headers, response, latency_ms } => {
                    self.model_router.release_model(&decision.target_model).await;
                    self.key_manager
                        .release(handle, Outcome::Success { latency_ms })
                        .await;
                    attempt.push_span("upstream", serde_json::json!({"status": status}));
                    trace.attempts.push(attempt);

                    return Ok(self.stream_response_with_cost_tracking(
                        status,
                        headers,
                        response,
                        handle.index,
                        decision.target_model.clone(),
                        tenant_id.clone(),
                    ));
                }
                AttemptOutcome::Failure { kind, status, retry_after_ms, message } => {
                    attempt.error_type = Some(format!("{kind:?}"));
                    let latency_ms = started.elapsed().as_millis() as u64;

                    let exclude_key = kind.should_exclude_key();
                    self.key_manager
                        .release(
                            handle,
                            match kind {
                                ErrorKind::RateLimited => Outcome::RateLimited { retry_after_ms },
                                _ if exclude_key => Outcome::Failure { latency_ms },
                                _ => Outcome::Success { latency_ms },
                            },
                        )
                        .await;
                    self.model_router.release_model(&decision.target_model).await;

                    if kind == ErrorKind::RateLimited {
                        request_429_count += 1;
                        self.metrics.pool_429_total.fetch_add(1, Ordering::Relaxed);
                        let pool_hit = self
                            .key_manager
                            .record_pool_rate_limit_hit(PoolRateLimitHit {
                                model: decision.target_model.clone(),
                                retry_after_ms,
                                base_ms: self.config.pool_cooldown.base_ms,
                                cap_ms: self.config.pool_cooldown.cap_ms,
                                decay_ms: self.config.pool_cooldown.decay_ms,
                            })
                            .await;
                        let n = self.model_router.record_pool_429(&decision.target_model).await;
                        let (cooldown_ms, dampened) = self
                            .model_router
                            .burst_dampened_cooldown(&decision.target_model, pool_hit.cooldown_ms)
                            .await;
                        self.model_router
                            .record_model_cooldown(&decision.target_model, cooldown_ms, dampened)
                            .await;
                        tracing::debug!(model = %decision.target_model, n, cooldown_ms, "pool 429 recorded");

                        if attempted_models.contains(&decision.target_model) {
                            self.metrics.same_model_retry.fetch_add(1, Ordering::Relaxed);
                        }

                        let elapsed = retry_window_start.elapsed().as_millis() as u64;
                        if request_429_count >= self.config.failover.max_429_attempts_per_request
                            || elapsed >= self.config.failover.max_429_retry_window_ms
                        {
                            let reason = if request_429_count >= self.config.failover.max_429_attempts_per_request {
                                "max_429_attempts"
                            } else {
                                "max_429_window"
                            };
                            self.metrics.record_give_up(reason).await;
                            self.metrics
                                .record_failed_request_model_stats(attempted_models.len(), model_switches)
                                .await;
                            attempt.retried = false;
                            trace.attempts.push(attempt);
                            return Err(HandlerFailure::give_up_429(reason));
                        }

                        attempted_models.push(decision.target_model.clone());
                        trace.attempts.push(attempt);
                        self.metrics.total_retries.fetch_add(1, Ordering::Relaxed);
                        self.sleep_backoff(attempt_number, retry_after_ms, &cancel).await?;
                        continue;
                    }

                    if !kind.is_retryable() {
                        trace.attempts.push(attempt);
                        return Err(HandlerFailure::non_retryable(kind, status, message));
                    }

                    fresh_connection_next = kind.wants_fresh_connection();
                    trace.attempts.push(attempt);
                    self.metrics.total_retries.fetch_add(1, Ordering::Relaxed);
                    self.sleep_backoff(attempt_number, retry_after_ms, &cancel).await?;
                    continue;
                }
            }
        }

        self.metrics
            .record_failed_request_model_stats(attempted_models.len(), model_switches)
            .await;
        Err(HandlerFailure::retry_cap_reached())
    }

    async fn try_admission_hold(
        &self,
        features: &RoutingFeatures,
        cancel: &CancellationToken,
    ) -> Result<Option<Duration>, HandlerFailure> {
        let tier = match self.model_router.peek_admission_hold(features).await {
            Some(peek) if self.config.admission_hold.tiers.contains(&peek.tier) => peek,
            _ => return Ok(None),
        };
        if !tier.all_cooled || tier.min_cooldown_ms < self.config.admission_hold.min_cooldown_to_hold_ms {
            return Ok(None);
        }

        let current = self.admission_holds.load(Ordering::SeqCst);
        if current >= self.config.admission_hold.max_concurrent_holds {
            self.metrics.admission_hold_rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.admission_holds.fetch_add(1, Ordering::SeqCst);

        let hold_ms = (tier.min_cooldown_ms + self.config.admission_hold.jitter_ms)
            .min(self.config.admission_hold.max_hold_ms);
        let started = Instant::now();

        // A single `select!` arm runs to completion, so exactly one of
        // "completed"/"disconnected" fires and the decrement below always
        // executes exactly once per hold.
        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => "completed",
            _ = cancel.cancelled() => "disconnected",
        };
        self.admission_holds.fetch_sub(1, Ordering::SeqCst);

        if outcome == "disconnected" {
            return Err(HandlerFailure::client_disconnect());
        }

        self.metrics.admission_hold_complete.fetch_add(1, Ordering::Relaxed);

        let still_cooled = self
            .model_router
            .peek_admission_hold(features)
            .await
            .map(|p| !p.all_cooled)
            .unwrap_or(true);
        if !still_cooled {
            return Err(HandlerFailure::admission_hold_timeout(tier.tier));
        }

        Ok(Some(started.elapsed()))
    }

    async fn acquire_key_with_queue(&self, cancel: &CancellationToken) -> Option<CredentialHandle> {
        if let Some(handle) = self.key_manager.acquire_key().await {
            return Some(handle);
        }

        let deadline = tokio::time::sleep(Duration::from_millis(self.config.queue_timeout_ms));
        tokio::pin!(deadline);
        let mut poll_interval = tokio::time::interval(Duration::from_millis(25));

        loop {
            tokio::select! {
                _ = &mut deadline => return None,
                _ = cancel.cancelled() => return None,
                _ = poll_interval.tick() => {
                    if let Some(handle) = self.key_manager.acquire_key().await {
                        return Some(handle);
                    }
                }
            }
        }
    }

    async fn sleep_backoff(
        &self,
        attempt: u32,
        retry_after_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerFailure> {
        let backoff_ms = retry_after_ms.unwrap_or_else(|| {
            let base = 500u64;
            let multiplier = 2u64;
            let max_delay = 10_000u64;
            base.saturating_mul(multiplier.saturating_pow(attempt)).min(max_delay)
        });
        let jitter = self.config.pool_cooldown.retry_jitter_ms.min(250);
        let total = backoff_ms + (attempt as u64 * 7) % (jitter.max(1));

        if total > 0 {
            self.metrics.retry_backoff_delay_count.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(total)) => Ok(()),
                _ = cancel.cancelled() => Err(HandlerFailure::client_disconnect()),
            }
        } else {
            Ok(())
        }
    }

    /// Builds the client response from a live upstream response, forwarding
    /// bytes as they arrive while buffering a capped prefix on the side to
    /// recover the terminal `usage` event once the body completes, so cost
    /// accounting never blocks the stream reaching the client.
    fn stream_response_with_cost_tracking(
        self: &Arc<Self>,
        status: u16,
        headers: reqwest::header::HeaderMap,
        response: reqwest::Response,
        key_index: usize,
        model: String,
        tenant_id: Option<String>,
    ) -> Response {
        let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
        if let Some(builder_headers) = builder.headers_mut() {
            for (name, value) in headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                    HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    builder_headers.insert(name, value);
                }
            }
        }

        const USAGE_PREFIX_CAP: usize = 64 * 1024;
        let this = Arc::clone(self);
        let upstream_stream = response.bytes_stream();

        let tracked = async_stream::stream! {
            use futures::StreamExt;
            tokio::pin!(upstream_stream);
            let mut prefix = Vec::new();

            while let Some(chunk) = upstream_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if prefix.len() < USAGE_PREFIX_CAP {
                            prefix.extend_from_slice(&bytes[..bytes.len().min(USAGE_PREFIX_CAP - prefix.len())]);
                        }
                        yield Ok(bytes);
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            if let Some(usage) = crate::upstream::parse_usage_from_sse_prefix(&prefix) {
                this.cost_tracker
                    .record_usage(
                        &key_index.to_string(),
                        usage.input_tokens as f64,
                        usage.output_tokens as f64,
                        Some(&model),
                        tenant_id.as_deref(),
                    )
                    .await;
            }
        };

        builder
            .body(Body::from_stream(tracked))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

/// A non-retryable or exhausted outcome that still needs to become an HTTP
/// response with the right status, `x-proxy-rate-limit` marker, and request
/// id header.
struct HandlerFailure {
    status: StatusCode,
    message: String,
    error_type: Option<&'static str>,
    rate_limit_marker: Option<&'static str>,
    tier: Option<String>,
    headers_sent: bool,
}

impl HandlerFailure {
    fn all_keys_exhausted() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "All keys exhausted or circuits open".to_string(),
            error_type: None,
            rate_limit_marker: None,
            tier: None,
            headers_sent: false,
        }
    }

    fn give_up_429(reason: &'static str) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "model exhausted after repeated rate limiting".to_string(),
            error_type: Some(reason),
            rate_limit_marker: Some("model_exhausted"),
            tier: None,
            headers_sent: false,
        }
    }

    fn retry_cap_reached() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "retry cap reached".to_string(),
            error_type: Some("retry_cap_reached"),
            rate_limit_marker: Some("model_exhausted"),
            tier: None,
            headers_sent: false,
        }
    }

    fn max_model_switches() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "maximum model switches per request exceeded".to_string(),
            error_type: Some("max_model_switches"),
            rate_limit_marker: Some("model_exhausted"),
            tier: None,
            headers_sent: false,
        }
    }

    fn admission_hold_timeout(tier: crate::models::ModelTier) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "admission hold timed out waiting for tier to clear".to_string(),
            error_type: Some("admission_hold_timeout"),
            rate_limit_marker: Some("admission_hold_timeout"),
            tier: Some(tier.id().to_string()),
            headers_sent: false,
        }
    }

    fn non_retryable(kind: ErrorKind, status: Option<u16>, message: String) -> Self {
        Self {
            status: status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            message,
            error_type: Some(match kind {
                ErrorKind::AuthError => "auth_error",
                ErrorKind::ContextOverflow => "context_overflow",
                _ => "unknown",
            }),
            rate_limit_marker: None,
            tier: None,
            headers_sent: false,
        }
    }

    fn client_disconnect() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "client disconnected".to_string(),
            error_type: Some("client_disconnect"),
            rate_limit_marker: None,
            tier: None,
            headers_sent: false,
        }
    }

    fn into_response_with_request_id(self, request_id: uuid::Uuid) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-request-id",
            HeaderValue::from_str(&request_id.to_string()).unwrap(),
        );
        if let Some(marker) = self.rate_limit_marker {
            headers.insert("x-proxy-rate-limit", HeaderValue::from_static(marker));
        }
        if let Some(tier) = &self.tier {
            if let Ok(v) = HeaderValue::from_str(tier) {
                headers.insert("x-proxy-tier", v);
            }
        }
        let body = serde_json::json!({
            "error": self.message,
            "errorType": self.error_type,
        });
        (self.status, headers, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_features_reads_message_count_and_tools() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "search"}],
        });
        let features = extract_features(&body);
        assert_eq!(features.message_count, 1);
        assert!(features.has_tools);
        assert!(!features.has_vision);
    }

    #[test]
    fn extract_features_detects_vision_content() {
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": [{"type": "image"}]}]
        });
        let features = extract_features(&body);
        assert!(features.has_vision);
    }

    #[tokio::test]
    async fn metrics_give_up_reason_counts_accumulate() {
        let metrics = Metrics::default();
        metrics.record_give_up("max_429_attempts").await;
        metrics.record_give_up("max_429_attempts").await;
        metrics.record_give_up("max_429_window").await;
        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot["giveUpReasons"]["max_429_attempts"], 2);
        assert_eq!(snapshot["giveUpReasons"]["max_429_window"], 1);
    }

    #[tokio::test]
    async fn metrics_failed_request_model_stats_aggregate() {
        let metrics = Metrics::default();
        metrics.record_failed_request_model_stats(2, 1).await;
        metrics.record_failed_request_model_stats(3, 2).await;
        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot["failedRequestModelStats"]["count"], 2);
        assert_eq!(snapshot["failedRequestModelStats"]["attemptedSum"], 5);
        assert_eq!(snapshot["failedRequestModelStats"]["switchesSum"], 3);
    }
}
