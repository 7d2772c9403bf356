//! In-memory log ring and process stats.
//!
//! A custom `tracing_subscriber` layer renders every event to one line and
//! keeps the most recent lines in a bounded ring, which the admin `logs`
//! action serves back. Stats helpers read coarse process counters.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Capacity of the recent-logs ring.
pub const LOG_RING_CAPACITY: usize = 200;

/// Bounded ring of rendered log lines, oldest first.
#[derive(Clone, Default)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl LogRing {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting the oldest when at capacity.
    pub fn push(&self, line: String) {
        let Ok(mut ring) = self.inner.lock() else {
            return;
        };
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    /// The most recent `n` lines, most recent last.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(ring) = self.inner.lock() else {
            return Vec::new();
        };
        ring.iter()
            .skip(ring.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}

/// `tracing` layer feeding the ring.
pub struct RingLayer {
    ring: LogRing,
}

impl RingLayer {
    /// Attach a layer to the given ring.
    #[must_use]
    pub fn new(ring: LogRing) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut line = format!(
            "{} {:>5} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            meta.level(),
            meta.target(),
            visitor.message
        );
        for (name, value) in visitor.fields {
            let _ = write!(line, " {name}={value}");
        }

        self.ring.push(line);
    }
}

/// Collects the `message` field plus remaining fields as `k=v` pairs.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}

/// Resident set size in megabytes, 0 where the proc filesystem is
/// unavailable.
#[must_use]
pub fn memory_rss_mb() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

/// Live tokio tasks on the current runtime.
#[must_use]
pub fn task_count() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let ring = LogRing::new();
        for i in 0..LOG_RING_CAPACITY + 5 {
            ring.push(format!("line {i}"));
        }

        let tail = ring.tail(LOG_RING_CAPACITY);
        assert_eq!(tail.len(), LOG_RING_CAPACITY);
        assert_eq!(tail.first().map(String::as_str), Some("line 5"));
        assert_eq!(
            tail.last().map(String::as_str),
            Some(format!("line {}", LOG_RING_CAPACITY + 4).as_str())
        );
    }

    #[test]
    fn tail_is_most_recent_last() {
        let ring = LogRing::new();
        ring.push("first".into());
        ring.push("second".into());
        ring.push("third".into());

        assert_eq!(ring.tail(2), vec!["second".to_string(), "third".to_string()]);
        assert_eq!(ring.tail(10).len(), 3);
    }
}
