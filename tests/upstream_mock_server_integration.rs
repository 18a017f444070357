//! Exercises `UpstreamClient` against a `wiremock` double of z.ai instead of
//! unit-testing status/error classification in isolation, covering a clean
//! success, a 429 with `Retry-After`, a 5xx that should be treated as
//! key-excluding, a 401 that should not be retried, a two-attempt retry
//! sequence, and the upstream concurrency gate rejecting a second concurrent
//! dispatch rather than queueing it.

use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use zai_gateway::upstream::{AttemptOutcome, ErrorKind, UpstreamClient};

fn echo_body() -> serde_json::Value {
    serde_json::json!({"model": "glm-4.6", "messages": [{"role": "user", "content": "hi"}]})
}

#[tokio::test]
async fn dispatch_passes_through_a_2xx_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 5, "output_tokens": 7},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));
    let outcome = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;

    match outcome {
        AttemptOutcome::PassThrough { status, .. } => assert_eq!(status, 200),
        AttemptOutcome::Failure { kind, message, .. } => {
            panic!("expected a pass-through success, got failure {kind:?}: {message}")
        }
    }
}

#[tokio::test]
async fn dispatch_classifies_429_with_retry_after_as_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_json(serde_json::json!({"error": "rate limited"})),
        )
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));
    let outcome = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;

    match outcome {
        AttemptOutcome::Failure { kind, status, retry_after_ms, .. } => {
            assert_eq!(kind, ErrorKind::RateLimited);
            assert_eq!(status, Some(429));
            assert_eq!(retry_after_ms, Some(2000));
        }
        AttemptOutcome::PassThrough { .. } => panic!("expected a 429 failure"),
    }
}

#[tokio::test]
async fn dispatch_classifies_5xx_as_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));
    let outcome = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;

    match outcome {
        AttemptOutcome::Failure { kind, status, .. } => {
            assert_eq!(kind, ErrorKind::ServerError);
            assert_eq!(status, Some(503));
            assert!(kind.is_retryable());
            assert!(kind.should_exclude_key());
        }
        AttemptOutcome::PassThrough { .. } => panic!("expected a 503 failure"),
    }
}

#[tokio::test]
async fn dispatch_classifies_401_as_non_retryable_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "bad key"})))
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));
    let outcome = client
        .dispatch("bad-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;

    match outcome {
        AttemptOutcome::Failure { kind, .. } => {
            assert_eq!(kind, ErrorKind::AuthError);
            assert!(!kind.is_retryable());
            assert!(kind.should_exclude_key());
        }
        AttemptOutcome::PassThrough { .. } => panic!("expected a 401 failure"),
    }
}

#[tokio::test]
async fn dispatch_recovers_after_transient_failure_mirrors_retry_loop() {
    // Mirrors what the request handler's retry loop sees: a first attempt
    // fails with a 429, a second attempt (same mock server, same client)
    // succeeds. `UpstreamClient` itself doesn't retry, so this exercises
    // the mock server serving the two responses in sequence.
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_2",
            "type": "message",
            "content": [{"type": "text", "text": "second try worked"}],
        })))
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));

    let first = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;
    assert!(matches!(
        first,
        AttemptOutcome::Failure { kind: ErrorKind::RateLimited, .. }
    ));

    let second = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;
    assert!(matches!(second, AttemptOutcome::PassThrough { status: 200, .. }));
}

#[tokio::test]
async fn dispatch_classifies_400_context_length_body_as_context_overflow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "This model's maximum context length is 131072 tokens",
        })))
        .mount(&server)
        .await;

    let client = UpstreamClient::new(server.uri(), 4, Duration::from_secs(5));
    let outcome = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;

    match outcome {
        AttemptOutcome::Failure { kind, status, .. } => {
            assert_eq!(kind, ErrorKind::ContextOverflow);
            assert_eq!(status, Some(400));
            assert!(!kind.is_retryable());
            assert!(!kind.should_exclude_key());
        }
        AttemptOutcome::PassThrough { .. } => panic!("expected a 400 context-overflow failure"),
    }
}

#[tokio::test]
async fn dispatch_respects_upstream_concurrency_gate() {
    // maxConcurrentUpstream=1 means a second concurrent dispatch must fail
    // fast with ModelAtCapacity rather than queueing behind the first.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)).set_body_json(
            serde_json::json!({"id": "msg_3", "type": "message", "content": []}),
        ))
        .mount(&server)
        .await;

    let client = std::sync::Arc::new(UpstreamClient::new(server.uri(), 1, Duration::from_secs(5)));

    let held = {
        let client = std::sync::Arc::clone(&client);
        tokio::spawn(async move {
            client
                .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = client
        .dispatch("test-key", "/v1/messages", &echo_body(), Duration::from_secs(5), false)
        .await;
    match second {
        AttemptOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::ModelAtCapacity),
        AttemptOutcome::PassThrough { .. } => panic!("expected the gate to reject the second dispatch"),
    }

    let first = held.await.unwrap();
    assert!(matches!(first, AttemptOutcome::PassThrough { status: 200, .. }));
}
