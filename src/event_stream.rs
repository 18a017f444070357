//! SSE fan-out: named events with monotonic sequence numbers, redaction of
//! sensitive fields before emission, and the periodic `pool-status` publisher.
//!
//! Built on a `broadcast::Sender` with `tokio::select!` over `rx.recv()` for
//! keepalive ticks and lagged-receiver handling, plus a `tokio::spawn` +
//! `catch_unwind` background task that periodically publishes the router's
//! per-tier pool snapshot.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model_router::ModelRouter;

const SCHEMA_VERSION: u32 = 1;
const POOL_STATUS_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct NamedEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Truncates a request/response body preview and strips auth headers before
/// an event is allowed onto the wire.
pub fn redact_preview(body: &str, max_len: usize) -> String {
    let truncated: String = body.chars().take(max_len).collect();
    if body.chars().count() > max_len {
        format!("{truncated}...[truncated]")
    } else {
        truncated
    }
}

pub fn redact_headers(headers: &std::collections::HashMap<String, String>) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (k, v) in headers {
        let lower = k.to_ascii_lowercase();
        if lower == "authorization" || lower == "x-api-key" || lower.contains("secret") {
            out.insert(k.clone(), serde_json::json!("[redacted]"));
        } else {
            out.insert(k.clone(), serde_json::json!(v));
        }
    }
    serde_json::Value::Object(out)
}

pub struct EventStream {
    tx: broadcast::Sender<NamedEvent>,
    seq: AtomicU64,
}

impl EventStream {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            seq: AtomicU64::new(0),
        })
    }

    pub fn publish(&self, event_type: impl Into<String>, payload: serde_json::Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = NamedEvent {
            seq,
            ts: Utc::now(),
            schema_version: SCHEMA_VERSION,
            event_type: event_type.into(),
            payload,
        };
        // No active subscribers is not an error; the event is simply dropped.
        let _ = self.tx.send(event);
    }

    /// Spawns the 3-second `pool-status` publisher over the router's
    /// per-tier snapshot. Panics in the collector are caught so a bug there
    /// cannot take the whole server down.
    pub fn spawn_pool_status_publisher(self: &Arc<Self>, router: Arc<ModelRouter>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(async move {
                let mut interval = tokio::time::interval(POOL_STATUS_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let snapshot = router.pool_snapshot().await;
                    this.publish(
                        "pool-status",
                        serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
                    );
                }
            })
            .await;
            if let Err(err) = result {
                tracing::error!("pool-status publisher panicked: {:?}", err);
            }
        });
    }

    /// Subscribes and renders an SSE stream: an initial no-op is not sent
    /// (callers emit their own snapshot before subscribing if one is
    /// wanted), named events are forwarded as `event: <type>`, lag is
    /// surfaced as a synthetic `stream-lagged` event rather than silently
    /// dropped, and a comment keepalive prevents idle-timeout disconnects.
    pub fn subscribe_sse(self: &Arc<Self>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let mut rx = self.tx.subscribe();

        let stream = async_stream::stream! {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                let sse = Event::default()
                                    .event(event.event_type.clone())
                                    .json_data(&event)
                                    .unwrap_or_else(|_| Event::default().event("error"));
                                yield Ok(sse);
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                let sse = Event::default()
                                    .event("stream-lagged")
                                    .json_data(serde_json::json!({"skipped": skipped}))
                                    .unwrap();
                                yield Ok(sse);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = keepalive.tick() => {
                        yield Ok(Event::default().comment("keepalive"));
                    }
                }
            }
        };

        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL).text("keepalive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_increments_sequence_monotonically() {
        let stream = EventStream::new();
        let mut rx = stream.tx.subscribe();
        stream.publish("pool-status", serde_json::json!({}));
        stream.publish("pool-status", serde_json::json!({}));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.seq + 1, second.seq);
    }

    #[test]
    fn redact_preview_truncates_long_bodies() {
        let body = "a".repeat(100);
        let preview = redact_preview(&body, 10);
        assert!(preview.starts_with("aaaaaaaaaa"));
        assert!(preview.ends_with("[truncated]"));
    }

    #[test]
    fn redact_headers_masks_auth_fields() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer secret".to_string());
        headers.insert("X-Request-Id".to_string(), "abc".to_string());
        let redacted = redact_headers(&headers);
        assert_eq!(redacted["Authorization"], serde_json::json!("[redacted]"));
        assert_eq!(redacted["X-Request-Id"], serde_json::json!("abc"));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let stream = EventStream::new();
        stream.publish("pool-status", serde_json::json!({}));
    }
}
