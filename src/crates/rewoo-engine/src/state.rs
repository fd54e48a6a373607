//! Execution state for one orchestrated run
//!
//! The state is split the way the run itself is layered: the immutable
//! [`RawInput`] the caller handed in, the mutable working copy the nodes
//! write to, the per-plan [`ExecutionState`] (steps, cursor, results), and
//! the cross-plan [`ReplanState`] that survives replan transitions.

use crate::plan::Step;
use crate::sop::RequiredStep;
use crate::trace::TraceCollector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Replan ceiling applied when the caller does not set `recursion_limit`
pub const DEFAULT_RECURSION_LIMIT: u32 = 10;

/// One turn of dialogue history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    /// A `user` turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// An `assistant` turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Caller-supplied run input
///
/// Read-only once the run starts; every node works on a cloned working
/// copy. Only `query`, `history`, `prev_intent`, `is_streaming`, and
/// `recursion_limit` affect the core — the remaining fields ride along
/// into agent payloads untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default)]
    pub request_id: String,
    pub query: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default)]
    pub prev_intent: String,
    #[serde(default)]
    pub knowledge_result: Value,
    #[serde(default)]
    pub customer_no: String,
    /// Intent tag, filled by the router during the run
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub enable_aigc: bool,
    /// Stream agent output instead of aggregating it
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub hotfix_query: String,
    /// Replan ceiling; defaults to [`DEFAULT_RECURSION_LIMIT`]
    #[serde(default)]
    pub recursion_limit: Option<u32>,
}

impl RawInput {
    /// Minimal input carrying just a query
    pub fn from_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Serialize to a JSON object for payload construction
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Fail,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::Fail => write!(f, "fail"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Immutable record of a step's outcome
///
/// Written exactly once per executed step; discarded only when a replan
/// throws the whole execution away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id, e.g. `E1`
    pub id: String,
    /// Tag name the step carried, e.g. `SerialCallAgent`
    pub tag: String,
    pub desc: String,
    pub status: StepStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub output: Value,
}

impl StepResult {
    /// Successful result with an output value
    pub fn ok(id: impl Into<String>, tag: impl Into<String>, desc: impl Into<String>, output: Value) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            desc: desc.into(),
            status: StepStatus::Ok,
            error: String::new(),
            output,
        }
    }

    /// Failed result with an error message
    pub fn fail(
        id: impl Into<String>,
        tag: impl Into<String>,
        desc: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            desc: desc.into(),
            status: StepStatus::Fail,
            error: error.into(),
            output: Value::Null,
        }
    }

    /// Skipped result (e.g. the reserved `others` agent)
    pub fn skipped(id: impl Into<String>, tag: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            desc: desc.into(),
            status: StepStatus::Skipped,
            error: String::new(),
            output: Value::Null,
        }
    }

    /// True when the result carries no status information at all
    pub fn is_empty(&self) -> bool {
        self.error.is_empty() && self.output.is_null()
    }
}

/// Insertion-ordered log of step results keyed by step id
///
/// The evaluator reads "the most recent result" by insertion order, so a
/// plain map will not do; lookups by id stay linear over a handful of
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultLog {
    entries: Vec<StepResult>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result; an existing entry with the same id is replaced
    pub fn insert(&mut self, result: StepResult) {
        match self.entries.iter_mut().find(|r| r.id == result.id) {
            Some(slot) => *slot = result,
            None => self.entries.push(result),
        }
    }

    /// Look up a result by step id (`E1`, not `#E1`)
    pub fn get(&self, id: &str) -> Option<&StepResult> {
        self.entries.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Most recently inserted result
    pub fn last(&self) -> Option<&StepResult> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.entries.iter()
    }

    /// Serialize as a JSON object in insertion order
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for result in &self.entries {
            map.insert(
                result.id.clone(),
                serde_json::to_value(result).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }
}

/// Per-item routing summary inside a parallel group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaItem {
    pub agent: String,
    pub query: String,
    pub status: Option<StepStatus>,
}

/// Routing metadata mirrored alongside each result
///
/// Lets the composer and evaluator read which agent served a step without
/// re-parsing the result payload. Exists iff the matching result exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    pub tag: String,
    pub agent: String,
    pub query: String,
    pub status: Option<StepStatus>,
    /// One summary per route of a parallel group, in route order
    #[serde(default)]
    pub items: Vec<MetaItem>,
}

/// Steps, cursor, and results for one plan attempt
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    /// Index of the next step to execute; `cursor == steps.len()` means
    /// drained
    pub cursor: usize,
    pub steps: Vec<Step>,
    pub results: ResultLog,
    pub result_meta: HashMap<String, ResultMeta>,
}

impl ExecutionState {
    /// Fresh execution over a parsed step list
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            cursor: 0,
            steps,
            results: ResultLog::new(),
            result_meta: HashMap::new(),
        }
    }

    /// The step at the cursor, if any remain
    pub fn current(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }

    /// The step after the cursor (used for worker transitions)
    pub fn peek_next(&self) -> Option<&Step> {
        self.steps.get(self.cursor + 1)
    }

    /// True once every step has been consumed
    pub fn drained(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    /// Record the cursor step's result and metadata, then advance
    pub fn record(&mut self, result: StepResult, meta: ResultMeta) {
        self.result_meta.insert(result.id.clone(), meta);
        self.results.insert(result);
        self.cursor += 1;
    }
}

/// Replan bookkeeping that survives plan attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplanState {
    /// Number of replan transitions taken so far
    pub count: u32,
    /// Ceiling; `count` may reach `max_iteration_limit + 1` on the
    /// terminal over-limit transition
    pub max_iteration_limit: u32,
    /// Earliest recorded failure cause
    pub last_failure: String,
    /// Plan text of the most recent failed attempt
    pub last_plan: String,
    /// Results of the most recent failed attempt
    pub last_results: Value,
}

impl ReplanState {
    /// True once the ceiling has been exceeded
    pub fn exhausted(&self) -> bool {
        self.max_iteration_limit > 0 && self.count > self.max_iteration_limit
    }
}

/// Evaluator verdict driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalStatus {
    Done,
    Failed,
    NeedReplan,
    NextQuery,
    /// Declared for SOP slot questions; terminal until an interactive
    /// transport exists
    NeedUser,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            EvalStatus::Done => "DONE",
            EvalStatus::Failed => "FAILED",
            EvalStatus::NeedReplan => "NEED_REPLAN",
            EvalStatus::NextQuery => "NEXT_QUERY",
            EvalStatus::NeedUser => "NEED_USER",
        };
        write!(f, "{tag}")
    }
}

/// A resolved dispatch target for one agent call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub agent: String,
    pub payload: Value,
    pub query: String,
    pub intent: String,
}

/// A slot question waiting on the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub key: String,
    pub question: String,
}

/// Full state of one orchestrated run
///
/// Owned by the engine driver and threaded mutably through the nodes. The
/// raw input is private so nothing downstream of construction can touch
/// it; all mutation happens on [`working_input`](Self::working_input).
pub struct EngineState {
    raw_input: RawInput,
    /// Run identifier (propagated into traces and logs)
    pub run_id: Uuid,
    /// Mutable working copy of the raw input
    pub working_input: RawInput,
    /// The task handed to the planner
    pub task: String,
    /// Sub-queries produced by a SplitQuery step, drained FIFO
    pub pending_queries: VecDeque<String>,
    /// Query the router is currently serving
    pub active_query: Option<String>,
    /// Verbatim planner output
    pub plan_string: String,
    /// Reasoning span extracted from the planner output
    pub reasoning_overview: String,
    pub execution: ExecutionState,
    /// Slots extracted from agent outputs by SOP rules
    pub slots: serde_json::Map<String, Value>,
    /// Steps the evaluator requires before the intent's SOP is satisfied
    pub required_steps: Vec<RequiredStep>,
    pub pending_question: Option<PendingQuestion>,
    pub eval_status: Option<EvalStatus>,
    /// Route prepared for the cursor step (serial)
    pub route: Option<Route>,
    /// Routes prepared for the cursor step (parallel group)
    pub routes: Option<Vec<Route>>,
    pub replan: ReplanState,
    /// Final answer value written by a FinalOutput step
    pub result: Value,
    pub trace: Arc<TraceCollector>,
}

impl EngineState {
    /// Seed a run from caller input
    pub fn new(raw_input: RawInput, trace: Arc<TraceCollector>) -> Self {
        let working_input = raw_input.clone();
        let task = raw_input.query.clone();
        Self {
            raw_input,
            run_id: Uuid::new_v4(),
            working_input,
            task,
            pending_queries: VecDeque::new(),
            active_query: None,
            plan_string: String::new(),
            reasoning_overview: String::new(),
            execution: ExecutionState::default(),
            slots: serde_json::Map::new(),
            required_steps: Vec::new(),
            pending_question: None,
            eval_status: None,
            route: None,
            routes: None,
            replan: ReplanState::default(),
            result: Value::Null,
            trace,
        }
    }

    /// The immutable caller input
    pub fn raw_input(&self) -> &RawInput {
        &self.raw_input
    }

    /// Whether this run streams agent output
    pub fn is_streaming(&self) -> bool {
        self.raw_input.is_streaming
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("run_id", &self.run_id)
            .field("task", &self.task)
            .field("cursor", &self.execution.cursor)
            .field("steps", &self.execution.steps.len())
            .field("eval_status", &self.eval_status)
            .field("replan_count", &self.replan.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_log_preserves_insertion_order() {
        let mut log = ResultLog::new();
        log.insert(StepResult::ok("E2", "SerialCallAgent", "b", json!(2)));
        log.insert(StepResult::ok("E1", "SerialCallAgent", "a", json!(1)));
        assert_eq!(log.last().unwrap().id, "E1");
        let ids: Vec<_> = log.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["E2", "E1"]);
        let value = log.to_value();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["E2", "E1"]);
    }

    #[test]
    fn record_advances_cursor_and_mirrors_meta() {
        let mut execution = ExecutionState::default();
        execution.record(
            StepResult::ok("E1", "SplitQuery", "", json!(["a"])),
            ResultMeta {
                tag: "SplitQuery".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(execution.cursor, 1);
        assert!(execution.results.contains("E1"));
        assert!(execution.result_meta.contains_key("E1"));
    }

    #[test]
    fn replan_exhaustion_respects_ceiling() {
        let replan = ReplanState {
            count: 3,
            max_iteration_limit: 2,
            ..Default::default()
        };
        assert!(replan.exhausted());
        let replan = ReplanState {
            count: 2,
            max_iteration_limit: 2,
            ..Default::default()
        };
        assert!(!replan.exhausted());
    }

    #[test]
    fn raw_input_round_trips_through_serde() {
        let raw = RawInput {
            request_id: "r-1".to_string(),
            query: "查余额".to_string(),
            history: vec![HistoryTurn::user("hi")],
            is_streaming: true,
            recursion_limit: Some(2),
            ..Default::default()
        };
        let value = raw.to_value();
        let back: RawInput = serde_json::from_value(value).unwrap();
        assert_eq!(back, raw);
    }
}
