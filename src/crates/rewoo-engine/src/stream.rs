//! Streaming frame handling
//!
//! Streaming agents answer with newline-delimited frames. The dispatch
//! layer wraps the raw frames under [`STREAM_RAW_EVENTS_KEY`] inside the
//! step output; aggregation back into assistant text happens lazily at
//! consumption time (history appends, composition). Frames whose `type` is
//! [`GRAPH_TRACE_EVENT`] belong to the remote agent's own progress trace
//! and are excluded from text aggregation.

use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Sentinel key wrapping raw stream frames inside a step output
pub const STREAM_RAW_EVENTS_KEY: &str = "_stream_raw_events";

/// Frame type excluded from assistant-text aggregation
pub const GRAPH_TRACE_EVENT: &str = "graph_trace";

/// Lazy sequence of raw frames from a streaming agent
pub type FrameStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

/// Sink receiving each raw frame as it arrives
pub type RawFrameSink = Arc<dyn Fn(&Value) + Send + Sync>;

/// Result of aggregating a frame list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamAggregate {
    /// Concatenated assistant text from content-bearing frames
    pub assistant_text: String,
    /// Frames filtered out as remote graph traces
    pub trace_events: Vec<Value>,
}

/// Parse one wire line into a frame; non-JSON lines stay raw strings
pub fn parse_frame(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

/// Wrap raw frames into the sentinel step-output shape
pub fn wrap_raw_events(frames: Vec<Value>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(STREAM_RAW_EVENTS_KEY.to_string(), Value::Array(frames));
    Value::Object(map)
}

/// The raw frame list of a wrapped stream output, if it is one
pub fn raw_events(output: &Value) -> Option<&Vec<Value>> {
    output
        .as_object()
        .and_then(|map| map.get(STREAM_RAW_EVENTS_KEY))
        .and_then(Value::as_array)
}

fn frame_text(frame: &Value) -> Option<&str> {
    match frame {
        Value::String(s) => Some(s),
        Value::Object(map) => map
            .get("content")
            .or_else(|| map.get("text"))
            .and_then(Value::as_str),
        _ => None,
    }
}

/// Aggregate frames into assistant text plus filtered trace events
pub fn aggregate_frames(frames: &[Value]) -> StreamAggregate {
    let mut aggregate = StreamAggregate::default();
    for frame in frames {
        let is_graph_trace = frame
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t == GRAPH_TRACE_EVENT)
            .unwrap_or(false);
        if is_graph_trace {
            aggregate.trace_events.push(frame.clone());
            continue;
        }
        if let Some(text) = frame_text(frame) {
            aggregate.assistant_text.push_str(text);
        }
    }
    aggregate
}

/// Render a step output as plain text, stream-aware, truncated to `limit`
/// characters
///
/// Used for history appends where the assistant turn is capped. Truncation
/// counts characters, not bytes, so multi-byte text stays intact.
pub fn payload_text(payload: &Value, limit: usize) -> String {
    let text = if let Some(frames) = raw_events(payload) {
        aggregate_frames(frames).assistant_text
    } else {
        match payload {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    };
    truncate_chars(&text, limit)
}

/// Extract a human-readable text field from a plain (non-stream) payload
pub fn plain_text(payload: &Value) -> Option<String> {
    match payload {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("content"))
            .or_else(|| map.get("answer"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}
