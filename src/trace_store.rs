//! Bounded ring of request traces and their attempt/span detail.
//!
//! Holds one `RequestTrace` per client request behind a
//! `RwLock<VecDeque<_>>` with a fixed capacity and oldest-first eviction,
//! plus the query/export surface `/traces` and `/requests/search` need.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub span_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub attempt_number: u32,
    pub spans: Vec<Span>,
    pub error_type: Option<String>,
    pub retried: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            spans: Vec::new(),
            error_type: None,
            retried: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn push_span(&mut self, span_type: impl Into<String>, attributes: serde_json::Value) {
        self.spans.push(Span {
            span_type: span_type.into(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            attributes,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub trace_id: Uuid,
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: Vec<Attempt>,
    pub status: Option<u16>,
    pub success: Option<bool>,
    pub mapped_model: Option<String>,
    pub original_model: Option<String>,
    pub key_index: Option<usize>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl RequestTrace {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            started_at: Utc::now(),
            ended_at: None,
            attempts: Vec::new(),
            status: None,
            success: None,
            mapped_model: None,
            original_model: None,
            key_index: None,
            latency_ms: None,
            error: None,
        }
    }

    /// Marks the trace ended exactly once; subsequent calls are no-ops so a
    /// trace is immutable once ended, per the data-model invariant.
    pub fn end(&mut self, status: u16, success: bool, error: Option<String>) {
        if self.ended_at.is_some() {
            return;
        }
        let now = Utc::now();
        self.ended_at = Some(now);
        self.status = Some(status);
        self.success = Some(success);
        self.error = error;
        self.latency_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

/// Filter predicates for `TraceStore::query`.
#[derive(Debug, Default, Clone)]
pub struct TraceFilter {
    pub success: Option<bool>,
    pub model: Option<String>,
    pub has_retries: Option<bool>,
    pub min_duration_ms: Option<u64>,
    pub since: Option<DateTime<Utc>>,
}

impl TraceFilter {
    fn matches(&self, trace: &RequestTrace) -> bool {
        if let Some(success) = self.success {
            if trace.success != Some(success) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if trace.mapped_model.as_deref() != Some(model.as_str()) {
                return false;
            }
        }
        if let Some(has_retries) = self.has_retries {
            if (trace.attempts.len() > 1) != has_retries {
                return false;
            }
        }
        if let Some(min_duration) = self.min_duration_ms {
            if trace.latency_ms.unwrap_or(0) < min_duration {
                return false;
            }
        }
        if let Some(since) = self.since {
            if trace.started_at < since {
                return false;
            }
        }
        true
    }
}

/// Fixed-capacity ring of traces; oldest is evicted on overflow. Single
/// writer (the request handler), many readers (the `/traces` and
/// `/requests` endpoints).
pub struct TraceStore {
    capacity: usize,
    traces: RwLock<VecDeque<RequestTrace>>,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            traces: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Inserts or replaces a trace by `trace_id`; amortized O(1) for the
    /// common append case. Replacing lets the handler push the same trace
    /// again as attempts accumulate, then once more when it ends.
    pub async fn put(&self, trace: RequestTrace) {
        let mut traces = self.traces.write().await;
        if let Some(existing) = traces.iter_mut().find(|t| t.trace_id == trace.trace_id) {
            *existing = trace;
            return;
        }
        traces.push_back(trace);
        while traces.len() > self.capacity {
            traces.pop_front();
        }
    }

    pub async fn get(&self, trace_id: Uuid) -> Option<RequestTrace> {
        self.traces
            .read()
            .await
            .iter()
            .find(|t| t.trace_id == trace_id)
            .cloned()
    }

    /// O(n) over the ring, but n is bounded by `capacity`.
    pub async fn query(&self, filter: &TraceFilter) -> Vec<RequestTrace> {
        self.traces
            .read()
            .await
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub async fn recent(&self, limit: usize) -> Vec<RequestTrace> {
        let traces = self.traces.read().await;
        traces.iter().rev().take(limit).cloned().collect()
    }

    pub async fn export(&self) -> Vec<RequestTrace> {
        self.traces.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.traces.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_evicts_oldest_on_overflow() {
        let store = TraceStore::new(2);
        for i in 0..3 {
            let mut trace = RequestTrace::new("POST", "/v1/messages");
            trace.end(200, true, None);
            trace.mapped_model = Some(format!("model-{i}"));
            store.put(trace).await;
        }
        let all = store.export().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].mapped_model.as_deref(), Some("model-1"));
        assert_eq!(all[1].mapped_model.as_deref(), Some("model-2"));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let mut trace = RequestTrace::new("POST", "/v1/messages");
        trace.end(200, true, None);
        trace.end(500, false, Some("should not apply".to_string()));
        assert_eq!(trace.status, Some(200));
        assert!(trace.success.unwrap());
    }

    #[tokio::test]
    async fn query_filters_by_success_and_model() {
        let store = TraceStore::new(10);
        let mut ok = RequestTrace::new("POST", "/v1/messages");
        ok.mapped_model = Some("glm-4.7".to_string());
        ok.end(200, true, None);
        store.put(ok).await;

        let mut failed = RequestTrace::new("POST", "/v1/messages");
        failed.mapped_model = Some("glm-4.6".to_string());
        failed.end(503, false, Some("exhausted".to_string()));
        store.put(failed).await;

        let results = store
            .query(&TraceFilter {
                success: Some(false),
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].mapped_model.as_deref(), Some("glm-4.6"));
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let store = TraceStore::new(10);
        for i in 0..3 {
            let mut trace = RequestTrace::new("POST", "/v1/messages");
            trace.mapped_model = Some(format!("m{i}"));
            store.put(trace).await;
        }
        let recent = store.recent(2).await;
        assert_eq!(recent[0].mapped_model.as_deref(), Some("m2"));
        assert_eq!(recent[1].mapped_model.as_deref(), Some("m1"));
    }
}
