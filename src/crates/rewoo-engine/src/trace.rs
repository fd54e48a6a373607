//! User-visible progress trace
//!
//! An append-only, ordered log of step notes shown to the end user while a
//! plan executes. The collector carries no business semantics; its output
//! format follows the frontend contract (`{type, content: [...]}`). An
//! optional push sink receives each entry as it is appended, which is how
//! streaming callers surface progress in real time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Push sink invoked once per appended entry
pub type TraceSink = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

/// One entry in the progress trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// 1-based position in the trace
    pub step: u64,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    /// Time the entry was appended
    pub at: DateTime<Utc>,
}

/// Frontend envelope for one or more trace entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Vec<TraceEntry>,
}

#[derive(Default)]
struct TraceInner {
    entries: Vec<TraceEntry>,
    counter: u64,
    sink: Option<TraceSink>,
}

/// Append-only ordered trace log
///
/// `add`/`add_text` are safe under concurrent append; entries keep a
/// monotonic counter so ordering survives interleaving from a parallel
/// fan-out. One collector per run — the trace is never shared across runs.
pub struct TraceCollector {
    event_type: String,
    inner: Mutex<TraceInner>,
}

impl TraceCollector {
    /// Create a collector with the frontend event type (usually `planning`)
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            inner: Mutex::new(TraceInner::default()),
        }
    }

    /// Install a push sink; each subsequent append is forwarded to it
    pub fn set_sink(&self, sink: TraceSink) {
        self.inner.lock().sink = Some(sink);
    }

    /// Append one entry with an optional subtitle
    pub fn add(&self, title: impl Into<String>, subtitle: impl Into<String>) -> TraceEntry {
        let (entry, sink) = {
            let mut inner = self.inner.lock();
            inner.counter += 1;
            let entry = TraceEntry {
                step: inner.counter,
                title: title.into(),
                subtitle: subtitle.into(),
                at: Utc::now(),
            };
            inner.entries.push(entry.clone());
            (entry, inner.sink.clone())
        };
        // Sink runs outside the lock so a sink that reads the trace back
        // cannot deadlock the appender.
        if let Some(sink) = sink {
            sink(&TraceEvent {
                event_type: self.event_type.clone(),
                content: vec![entry.clone()],
            });
        }
        entry
    }

    /// Append a title-only entry
    pub fn add_text(&self, text: impl Into<String>) -> TraceEntry {
        self.add(text, "")
    }

    /// Append an entry with a detail subtitle
    pub fn add_with_detail(
        &self,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> TraceEntry {
        self.add(title, detail)
    }

    /// Emit the full trace event
    pub fn emit_event(&self) -> TraceEvent {
        TraceEvent {
            event_type: self.event_type.clone(),
            content: self.inner.lock().entries.clone(),
        }
    }

    /// Emit only the latest entry (best for streaming)
    pub fn emit_last_event(&self) -> TraceEvent {
        let inner = self.inner.lock();
        TraceEvent {
            event_type: self.event_type.clone(),
            content: inner.entries.last().cloned().into_iter().collect(),
        }
    }

    /// Raw entry list
    pub fn dump(&self) -> Vec<TraceEntry> {
        self.inner.lock().entries.clone()
    }

    /// Number of entries appended so far
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if any entry title contains the given text
    pub fn contains(&self, needle: &str) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| e.title.contains(needle) || e.subtitle.contains(needle))
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new("planning")
    }
}

impl std::fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCollector")
            .field("event_type", &self.event_type)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn counter_is_monotonic() {
        let trace = TraceCollector::default();
        trace.add_text("first");
        trace.add_text("second");
        let entries = trace.dump();
        assert_eq!(entries[0].step, 1);
        assert_eq!(entries[1].step, 2);
    }

    #[test]
    fn sink_receives_each_entry() {
        let trace = TraceCollector::new("planning");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        trace.set_sink(Arc::new(move |event| {
            assert_eq!(event.content.len(), 1);
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        trace.add_text("one");
        trace.add_with_detail("two", "detail");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn emit_last_event_returns_latest_only() {
        let trace = TraceCollector::default();
        assert!(trace.emit_last_event().content.is_empty());
        trace.add_text("a");
        trace.add_text("b");
        let event = trace.emit_last_event();
        assert_eq!(event.event_type, "planning");
        assert_eq!(event.content.len(), 1);
        assert_eq!(event.content[0].title, "b");
    }

    #[test]
    fn concurrent_append_keeps_all_entries() {
        let trace = Arc::new(TraceCollector::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let trace = Arc::clone(&trace);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        trace.add_text(format!("t{i}-{j}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(trace.len(), 400);
        let steps: Vec<u64> = trace.dump().iter().map(|e| e.step).collect();
        let mut sorted = steps.clone();
        sorted.sort_unstable();
        assert_eq!(steps, sorted);
    }
}
