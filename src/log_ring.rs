//! Bounded in-memory ring of recent formatted log lines, for `/logs?limit=N`.
//!
//! `tracing-subscriber`'s `fmt::layer()` writes to stdout/stderr only; there
//! is no built-in "give me the last N lines" query. This adds a second,
//! lightweight `Layer` next to `fmt::layer()` in `main.rs` that mirrors each
//! event into a fixed-capacity `VecDeque<String>` instead of re-parsing
//! process stdout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_CAPACITY: usize = 2_000;

#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(DEFAULT_CAPACITY))),
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<String> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().rev().take(limit).cloned().collect()
    }

    fn push(&self, line: String) {
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() >= DEFAULT_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogRing {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        let line = format!(
            "{} {} {}: {}",
            chrono::Utc::now().to_rfc3339(),
            event.metadata().level(),
            event.metadata().target(),
            visitor.0
        );
        self.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_newest_first_and_respects_limit() {
        let ring = LogRing::new();
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.recent(2), vec!["c".to_string(), "b".to_string()]);
    }
}
