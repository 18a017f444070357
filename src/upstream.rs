//! One upstream HTTPS attempt: concurrency gate, connection reuse, response
//! streaming, and outcome classification.
//!
//! Dispatch builds the request against the single z.ai wire shape, splits
//! streamed-vs-buffered responses, and classifies network/HTTP errors into
//! an outcome, plus the fresh-connection-on-hangup behavior that `reqwest`'s
//! connection pooling doesn't give you for free.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::{RwLock, Semaphore};

/// Error-event / status-code taxonomy. Each variant carries the
/// retry/exclude-key/fresh-connection policy as associated methods rather
/// than a separate lookup table, so the policy can never drift out of sync
/// with the variant list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    RateLimited,
    ServerError,
    AuthError,
    Timeout,
    SocketHangup,
    ConnectionRefused,
    BrokenPipe,
    DnsError,
    TlsError,
    HttpParseError,
    ClientDisconnect,
    ModelAtCapacity,
    ContextOverflow,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Success
                | ErrorKind::AuthError
                | ErrorKind::ClientDisconnect
                | ErrorKind::ContextOverflow
        )
    }

    pub fn should_exclude_key(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError
                | ErrorKind::AuthError
                | ErrorKind::ConnectionRefused
                | ErrorKind::TlsError
                | ErrorKind::HttpParseError
                | ErrorKind::Unknown
        )
    }

    pub fn wants_fresh_connection(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::SocketHangup | ErrorKind::BrokenPipe)
    }
}

/// Outcome of exactly one upstream dispatch attempt.
pub enum AttemptOutcome {
    /// A 2xx arrived; the handler must pipe `response` through to the
    /// client and must not retry regardless of anything that happens to the
    /// body afterward.
    PassThrough {
        status: u16,
        headers: reqwest::header::HeaderMap,
        response: reqwest::Response,
        latency_ms: u64,
    },
    Failure {
        kind: ErrorKind,
        status: Option<u16>,
        retry_after_ms: Option<u64>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

fn classify_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        200..=299 => ErrorKind::Success,
        401 | 403 => ErrorKind::AuthError,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}

/// z.ai reports an over-length prompt as a 400 with a message about the
/// context window rather than a dedicated status code, so the body has to
/// be sniffed the same way `classify_transport_error` sniffs error text.
fn is_context_overflow_body(body: &str) -> bool {
    let text = body.to_ascii_lowercase();
    (text.contains("context") && (text.contains("length") || text.contains("window")))
        || text.contains("too many tokens")
        || text.contains("maximum context")
}

/// Classifies a raw transport error using the same substrings z.ai (and any
/// other OpenAI-shaped upstream behind a standard TCP/TLS stack) surfaces
/// through `reqwest`'s `is_connect`/`is_timeout`/source-chain text, since
/// `reqwest` does not expose raw `errno` values directly.
pub fn classify_transport_error(err: &reqwest::Error, elapsed: Duration) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("connection refused") {
        ErrorKind::ConnectionRefused
    } else if text.contains("broken pipe") {
        ErrorKind::BrokenPipe
    } else if text.contains("dns") || text.contains("name resolution") || text.contains("lookup") {
        ErrorKind::DnsError
    } else if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        ErrorKind::TlsError
    } else if text.contains("connection reset") || text.contains("reset by peer") {
        // ECONNRESET shortly after the request opened reads as a hangup
        // rather than a genuine mid-stream failure.
        if elapsed < Duration::from_secs(2) {
            ErrorKind::SocketHangup
        } else {
            ErrorKind::Unknown
        }
    } else if err.is_decode() {
        ErrorKind::HttpParseError
    } else {
        ErrorKind::Unknown
    }
}

/// Counts consecutive hangups on the shared connection pool; past a
/// threshold, the shared `reqwest::Client` is recreated so a bad pooled
/// socket can't keep reproducing the same failure.
pub struct ConnectionHealthMonitor {
    consecutive_hangups: AtomicU32,
    threshold: u32,
}

impl ConnectionHealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_hangups: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_hangup(&self) -> bool {
        let count = self.consecutive_hangups.fetch_add(1, Ordering::SeqCst) + 1;
        count >= self.threshold
    }

    pub fn record_healthy(&self) {
        self.consecutive_hangups.store(0, Ordering::SeqCst);
    }
}

/// Holds the shared HTTPS client plus the upstream concurrency gate.
pub struct UpstreamClient {
    shared: RwLock<Arc<reqwest::Client>>,
    health: ConnectionHealthMonitor,
    semaphore: Arc<Semaphore>,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: String, max_concurrent_upstream: usize, request_timeout: Duration) -> Self {
        Self {
            shared: RwLock::new(Arc::new(build_client(request_timeout))),
            health: ConnectionHealthMonitor::new(5),
            semaphore: Arc::new(Semaphore::new(max_concurrent_upstream)),
            base_url,
        }
    }

    async fn client_for(&self, fresh: bool, request_timeout: Duration) -> Arc<reqwest::Client> {
        if fresh {
            Arc::new(build_client(request_timeout))
        } else {
            Arc::clone(&*self.shared.read().await)
        }
    }

    /// In-flight requests on the old agent keep running to completion on
    /// their existing sockets; only new dispatches observe the swap.
    async fn recreate_shared_if_unhealthy(&self, kind: ErrorKind, request_timeout: Duration) {
        if kind == ErrorKind::SocketHangup {
            if self.health.record_hangup() {
                tracing::warn!("upstream: recreating shared HTTPS agent after consecutive hangups");
                *self.shared.write().await = Arc::new(build_client(request_timeout));
                self.health.record_healthy();
            }
        } else {
            self.health.record_healthy();
        }
    }

    /// Acquires an upstream concurrency slot (bounded by
    /// `maxConcurrentUpstream`), dispatches one attempt, and releases the
    /// slot on completion regardless of outcome.
    pub async fn dispatch(
        &self,
        api_key: &str,
        path: &str,
        body: &serde_json::Value,
        request_timeout: Duration,
        use_fresh_connection: bool,
    ) -> AttemptOutcome {
        let _permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return AttemptOutcome::Failure {
                    kind: ErrorKind::ModelAtCapacity,
                    status: None,
                    retry_after_ms: Some(50),
                    message: "upstream concurrency slot unavailable".to_string(),
                };
            }
        };

        let client = self.client_for(use_fresh_connection, request_timeout).await;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let started = Instant::now();

        let response = client
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .timeout(request_timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                let kind = classify_status(status);
                self.recreate_shared_if_unhealthy(kind, request_timeout).await;

                match kind {
                    ErrorKind::Success => {
                        let headers = resp.headers().clone();
                        AttemptOutcome::PassThrough {
                            status: status.as_u16(),
                            headers,
                            response: resp,
                            latency_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                    ErrorKind::RateLimited => {
                        let retry_after_ms = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(|secs| secs * 1000);
                        let body_text = resp.text().await.unwrap_or_default();
                        AttemptOutcome::Failure {
                            kind,
                            status: Some(status.as_u16()),
                            retry_after_ms,
                            message: body_text,
                        }
                    }
                    _ => {
                        let body_text = resp.text().await.unwrap_or_default();
                        let kind = if status.as_u16() == 400 && is_context_overflow_body(&body_text) {
                            ErrorKind::ContextOverflow
                        } else {
                            kind
                        };
                        AttemptOutcome::Failure {
                            kind,
                            status: Some(status.as_u16()),
                            retry_after_ms: None,
                            message: body_text,
                        }
                    }
                }
            }
            Err(err) => {
                let elapsed = started.elapsed();
                let kind = classify_transport_error(&err, elapsed);
                self.recreate_shared_if_unhealthy(kind, request_timeout).await;
                AttemptOutcome::Failure {
                    kind,
                    status: None,
                    retry_after_ms: None,
                    message: err.to_string(),
                }
            }
        }
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("static reqwest client configuration is valid")
}

/// Best-effort extraction of a terminal token-usage event from a buffered
/// prefix of an SSE body, without blocking the pass-through stream on the
/// full body arriving. `buffer` should be capped by the caller at 64 KB.
pub fn parse_usage_from_sse_prefix(buffer: &[u8]) -> Option<UpstreamUsage> {
    let text = std::str::from_utf8(buffer).ok()?;
    let mut usage = None;
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(u) = value.get("usage") {
                let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                usage = Some(UpstreamUsage { input_tokens: input, output_tokens: output });
            }
        }
    }
    usage
}

pub fn bytes_len(chunk: &Bytes) -> usize {
    chunk.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_groups_2xx_as_success() {
        assert_eq!(classify_status(StatusCode::OK), ErrorKind::Success);
        assert_eq!(classify_status(StatusCode::CREATED), ErrorKind::Success);
    }

    #[test]
    fn classify_status_maps_auth_errors() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorKind::AuthError);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorKind::AuthError);
    }

    #[test]
    fn classify_status_maps_429_and_5xx() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::RateLimited);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorKind::ServerError);
    }

    #[test]
    fn context_overflow_body_detection_matches_known_phrasings() {
        assert!(is_context_overflow_body(
            "{\"error\": \"This model's maximum context length is 131072 tokens\"}"
        ));
        assert!(is_context_overflow_body("request exceeds the context window"));
        assert!(is_context_overflow_body("too many tokens in the prompt"));
        assert!(!is_context_overflow_body("{\"error\": \"invalid model field\"}"));
    }

    #[test]
    fn error_kind_retry_policy_matches_taxonomy() {
        assert!(!ErrorKind::Success.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::ClientDisconnect.is_retryable());
        assert!(!ErrorKind::ContextOverflow.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::SocketHangup.is_retryable());
    }

    #[test]
    fn error_kind_exclude_key_policy_matches_taxonomy() {
        assert!(ErrorKind::ServerError.should_exclude_key());
        assert!(ErrorKind::AuthError.should_exclude_key());
        assert!(ErrorKind::ConnectionRefused.should_exclude_key());
        assert!(!ErrorKind::BrokenPipe.should_exclude_key());
        assert!(!ErrorKind::DnsError.should_exclude_key());
        assert!(!ErrorKind::SocketHangup.should_exclude_key());
    }

    #[test]
    fn connection_health_monitor_trips_after_threshold() {
        let monitor = ConnectionHealthMonitor::new(3);
        assert!(!monitor.record_hangup());
        assert!(!monitor.record_hangup());
        assert!(monitor.record_hangup());
    }

    #[test]
    fn connection_health_monitor_resets_on_healthy() {
        let monitor = ConnectionHealthMonitor::new(2);
        monitor.record_hangup();
        monitor.record_healthy();
        assert!(!monitor.record_hangup());
    }

    #[test]
    fn parse_usage_from_sse_prefix_extracts_terminal_usage() {
        let body = b"data: {\"type\":\"content\"}\n\ndata: {\"usage\":{\"input_tokens\":10,\"output_tokens\":20}}\n\n";
        let usage = parse_usage_from_sse_prefix(body).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn parse_usage_from_sse_prefix_returns_none_without_usage_event() {
        let body = b"data: {\"type\":\"content\"}\n\n";
        assert!(parse_usage_from_sse_prefix(body).is_none());
    }
}
