//! Agent registry and dispatch executors
//!
//! The registry maps agent names to the capability an executor provides:
//! a synchronous-shaped `execute` and an optional `stream`. HTTP agents
//! POST a JSON payload and answer with a JSON body or newline-delimited
//! frames; local callables serve tests and in-process agents with the same
//! shape. Application failures are normalized at this boundary — a body
//! carrying `status: "fail"` becomes a failed dispatch with the agent's
//! stated reason.

use crate::config::{EndpointConfig, FleetConfig};
use crate::stream::{parse_frame, FrameStream};
use crate::{EngineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Reserved agent name meaning "no agent applies"
pub const OTHERS_AGENT: &str = "others";

/// Reserved registry entry for the intent router; never selected by
/// intent-prefix matching
pub const ROUTER_AGENT: &str = "RouterNode";

/// Builds the payload actually sent to an agent from the routed base
/// payload and the slots collected so far
pub type PayloadBuilder = Arc<dyn Fn(&Value, &serde_json::Map<String, Value>) -> Value + Send + Sync>;

/// Capability interface every registered agent satisfies
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Short human-readable descriptor used in errors and logs
    fn describe(&self) -> String {
        "agent executor".to_string()
    }

    /// Invoke the agent and return its parsed response body
    async fn execute(&self, payload: Value) -> Result<Value>;

    /// Invoke the agent in streaming mode
    async fn stream(&self, payload: Value) -> Result<FrameStream> {
        let _ = payload;
        Err(EngineError::Dispatch {
            agent: self.describe(),
            message: "streaming not supported".to_string(),
        })
    }
}

/// Dispatch outcome after application-error normalization
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedResult {
    /// Agent answered successfully; the body is the step output
    Ok(Value),
    /// Agent reported an application failure
    Fail { error: String, body: Value },
}

/// Normalize a response body: `status: "fail"` becomes a failed dispatch
/// with the reason taken from `reason`/`error`/`message`
pub fn normalize_result(body: Value) -> NormalizedResult {
    let failed = body.get("status").and_then(Value::as_str) == Some("fail");
    if failed {
        let error = ["reason", "error", "message"]
            .into_iter()
            .find_map(|key| body.get(key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        NormalizedResult::Fail { error, body }
    } else {
        NormalizedResult::Ok(body)
    }
}

fn env_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)\}").expect("env var regex"))
}

/// Substitute `${VAR}` tokens from the process environment
///
/// Unset variables substitute to the empty string. Applied once, at
/// registry construction.
pub fn interpolate_env(value: &str) -> String {
    let mut out = value.to_string();
    for caps in env_var_re().captures_iter(value) {
        let var = std::env::var(&caps[1]).unwrap_or_default();
        out = out.replace(&caps[0], &var);
    }
    out
}

/// HTTP agent executor: POST JSON, parse JSON, stream line frames
pub struct HttpExecutor {
    name: String,
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Build an executor for one endpoint; header values are env-interpolated
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        headers: &std::collections::HashMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let value = interpolate_env(value);
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    header_map.insert(header_name, header_value);
                }
                _ => {
                    warn!(agent = %name, header = %key, "dropping invalid endpoint header");
                }
            }
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client for '{name}': {e}")))?;
        Ok(Self {
            name,
            url: url.into(),
            headers: header_map,
            client,
        })
    }
}

#[async_trait]
impl AgentExecutor for HttpExecutor {
    fn describe(&self) -> String {
        format!("http agent '{}' at {}", self.name, self.url)
    }

    async fn execute(&self, payload: Value) -> Result<Value> {
        debug!(agent = %self.name, url = %self.url, "dispatching agent call");
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch {
                agent: self.name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| EngineError::Dispatch {
            agent: self.name.clone(),
            message: e.to_string(),
        })?;

        // Non-JSON bodies are preserved rather than treated as transport
        // failures; the evaluator decides what to make of them.
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| {
            serde_json::json!({
                "status_code": status.as_u16(),
                "text": text,
            })
        }))
    }

    async fn stream(&self, payload: Value) -> Result<FrameStream> {
        debug!(agent = %self.name, url = %self.url, "dispatching streaming agent call");
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch {
                agent: self.name.clone(),
                message: e.to_string(),
            })?;

        let mut body = response.bytes_stream();
        let frames = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line[..pos]);
                            let line = line.trim();
                            if !line.is_empty() {
                                yield parse_frame(line);
                            }
                        }
                    }
                    Err(e) => {
                        yield serde_json::json!({
                            "type": "stream_error",
                            "error": e.to_string(),
                        });
                        break;
                    }
                }
            }
            let tail = String::from_utf8_lossy(&buffer);
            let tail = tail.trim();
            if !tail.is_empty() {
                yield parse_frame(tail);
            }
        };
        Ok(Box::pin(frames))
    }
}

type LocalExecuteFn = dyn Fn(Value) -> Result<Value> + Send + Sync;
type LocalStreamFn = dyn Fn(Value) -> Vec<Value> + Send + Sync;

/// In-process agent executor with the same shape as an HTTP agent
pub struct LocalExecutor {
    name: String,
    execute_fn: Box<LocalExecuteFn>,
    stream_fn: Option<Box<LocalStreamFn>>,
}

impl LocalExecutor {
    /// Wrap a callable as an agent
    pub fn new<F>(name: impl Into<String>, execute_fn: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            execute_fn: Box::new(execute_fn),
            stream_fn: None,
        }
    }

    /// Add a streaming response producing raw frames for a payload
    pub fn with_stream<F>(mut self, stream_fn: F) -> Self
    where
        F: Fn(Value) -> Vec<Value> + Send + Sync + 'static,
    {
        self.stream_fn = Some(Box::new(stream_fn));
        self
    }
}

#[async_trait]
impl AgentExecutor for LocalExecutor {
    fn describe(&self) -> String {
        format!("local agent '{}'", self.name)
    }

    async fn execute(&self, payload: Value) -> Result<Value> {
        (self.execute_fn)(payload)
    }

    async fn stream(&self, payload: Value) -> Result<FrameStream> {
        match &self.stream_fn {
            Some(stream_fn) => {
                let frames = stream_fn(payload);
                Ok(Box::pin(futures::stream::iter(frames)))
            }
            None => Err(EngineError::Dispatch {
                agent: self.describe(),
                message: "streaming not supported".to_string(),
            }),
        }
    }
}

/// One registry entry
pub struct AgentEntry {
    /// Catalog line shown to the planner
    pub description: String,
    pub executor: Arc<dyn AgentExecutor>,
    /// Intent prefixes this agent serves (legacy intent dispatch)
    pub intent_space: Vec<String>,
    /// Payload builder; `None` uses [`default_payload_builder`]
    pub payload_builder: Option<PayloadBuilder>,
}

/// Default payload builder: base payload plus collected slots
pub fn default_payload_builder(base: &Value, slots: &serde_json::Map<String, Value>) -> Value {
    let mut map = base.as_object().cloned().unwrap_or_default();
    map.insert("slots".to_string(), Value::Object(slots.clone()));
    Value::Object(map)
}

/// Name → executor registry for the agent fleet
///
/// Insertion order is preserved; intent-prefix selection returns the first
/// matching entry.
#[derive(Default)]
pub struct AgentRegistry {
    entries: Vec<(String, AgentEntry)>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent; a duplicate name replaces the earlier entry
    pub fn register(&mut self, name: impl Into<String>, entry: AgentEntry) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = entry;
        } else {
            self.entries.push((name, entry));
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentEntry> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered agent names in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// First agent whose intent space contains a prefix of the intent tag;
    /// the reserved router entry is skipped
    pub fn select_by_intent(&self, intent: &str) -> Option<&str> {
        for (name, entry) in &self.entries {
            if name == ROUTER_AGENT {
                continue;
            }
            if entry
                .intent_space
                .iter()
                .any(|prefix| !prefix.is_empty() && intent.starts_with(prefix.as_str()))
            {
                return Some(name.as_str());
            }
        }
        None
    }

    /// Agent catalog handed to the planner prompt
    pub fn catalog(&self) -> String {
        self.entries
            .iter()
            .filter(|(name, _)| name != ROUTER_AGENT)
            .map(|(name, entry)| format!("{}: {}", name, entry.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Build a registry from fleet configuration
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, agent) in &config.agents {
            let executor: Arc<dyn AgentExecutor> = match &agent.endpoint {
                EndpointConfig::Http {
                    url,
                    timeout,
                    headers,
                } => Arc::new(HttpExecutor::new(
                    name.clone(),
                    url.clone(),
                    Duration::from_secs(*timeout),
                    headers,
                )?),
            };
            registry.register(
                name.clone(),
                AgentEntry {
                    description: agent.description.clone(),
                    executor,
                    intent_space: agent.intent_space.clone(),
                    payload_builder: None,
                },
            );
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(description: &str, intent_space: &[&str]) -> AgentEntry {
        AgentEntry {
            description: description.to_string(),
            executor: Arc::new(LocalExecutor::new("t", |_| Ok(json!({})))),
            intent_space: intent_space.iter().map(|s| s.to_string()).collect(),
            payload_builder: None,
        }
    }

    #[test]
    fn normalization_extracts_failure_reason_in_order() {
        match normalize_result(json!({"status": "fail", "reason": "timeout", "error": "x"})) {
            NormalizedResult::Fail { error, .. } => assert_eq!(error, "timeout"),
            other => panic!("unexpected: {other:?}"),
        }
        match normalize_result(json!({"status": "fail", "message": "broken"})) {
            NormalizedResult::Fail { error, .. } => assert_eq!(error, "broken"),
            other => panic!("unexpected: {other:?}"),
        }
        match normalize_result(json!({"status": "fail"})) {
            NormalizedResult::Fail { error, .. } => assert_eq!(error, ""),
            other => panic!("unexpected: {other:?}"),
        }
        match normalize_result(json!({"status": "ok", "balance": 1234})) {
            NormalizedResult::Ok(body) => assert_eq!(body["balance"], json!(1234)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn env_interpolation_substitutes_known_vars() {
        std::env::set_var("REWOO_TEST_TOKEN", "secret");
        assert_eq!(
            interpolate_env("Bearer ${REWOO_TEST_TOKEN}"),
            "Bearer secret"
        );
        assert_eq!(interpolate_env("Bearer ${REWOO_TEST_UNSET_VAR}"), "Bearer ");
        assert_eq!(interpolate_env("no vars"), "no vars");
    }

    #[test]
    fn intent_selection_returns_first_match_and_skips_router() {
        let mut registry = AgentRegistry::new();
        registry.register(ROUTER_AGENT, entry("router", &["acct"]));
        registry.register("account", entry("账户查询", &["acct"]));
        registry.register("wealth", entry("理财推荐", &["acct", "wealth"]));
        assert_eq!(registry.select_by_intent("acct_balance"), Some("account"));
        assert_eq!(registry.select_by_intent("wealth_pick"), Some("wealth"));
        assert_eq!(registry.select_by_intent("unknown"), None);
    }

    #[test]
    fn catalog_lists_fleet_without_router() {
        let mut registry = AgentRegistry::new();
        registry.register(ROUTER_AGENT, entry("router", &[]));
        registry.register("account", entry("账户查询", &[]));
        let catalog = registry.catalog();
        assert!(catalog.contains("account: 账户查询"));
        assert!(!catalog.contains(ROUTER_AGENT));
    }

    #[tokio::test]
    async fn local_executor_serves_both_modes() {
        let agent = LocalExecutor::new("echo", |payload| Ok(json!({"echo": payload})))
            .with_stream(|_| vec![json!({"content": "a"}), json!({"content": "b"})]);

        let body = agent.execute(json!({"query": "q"})).await.unwrap();
        assert_eq!(body["echo"]["query"], json!("q"));

        let frames: Vec<Value> = agent.stream(json!({})).await.unwrap().collect().await;
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn local_executor_without_stream_rejects_streaming() {
        let agent = LocalExecutor::new("plain", |_| Ok(json!({})));
        assert!(agent.stream(json!({})).await.is_err());
    }

    #[test]
    fn default_payload_builder_merges_slots() {
        let mut slots = serde_json::Map::new();
        slots.insert("city".to_string(), json!("上海"));
        let payload = default_payload_builder(&json!({"query": "q"}), &slots);
        assert_eq!(payload["query"], json!("q"));
        assert_eq!(payload["slots"]["city"], json!("上海"));
    }
}
