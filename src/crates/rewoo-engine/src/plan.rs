//! Plan grammar and typed plan steps
//!
//! The planner emits line-oriented text:
//!
//! ```text
//! 思考过程：<reasoning>
//! Plan: <desc> | #E1 = SerialCallAgent[{"agent": "account_agent"}]
//! Plan: <desc> | #E2 = FinalOutput[#E1]
//! ```
//!
//! Parsing is pure and whitespace-insensitive around delimiters; fullwidth
//! `：｜＝＃` variants are accepted since the planner writes Chinese prose.
//! Tags become typed [`StepAction`] variants at the parser boundary — the
//! rest of the engine never dispatches on tag strings. Unknown tags are
//! preserved verbatim; the worker decides policy for them.

use crate::resolve;
use crate::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Serial vs parallel scheduling of a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    #[default]
    Serial,
    Parallel,
}

/// One agent call description inside a CallAgent payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Target agent name; empty means the planner left it out
    #[serde(default)]
    pub agent: String,
    /// Explicit query overriding the active query
    #[serde(default)]
    pub query: Option<String>,
    /// Input expression; `None` means `$WORKING_INPUT`
    #[serde(default)]
    pub input: Option<Value>,
}

/// Typed payload of a plan step
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Splits the task into sub-queries drained by later steps
    SplitQuery { queries: Vec<String> },
    /// One routed agent call
    SerialCallAgent { config: CallConfig },
    /// A group of agent calls fanned out with bounded parallelism
    ParallelCallAgent { configs: Vec<CallConfig> },
    /// Legacy: pick the agent whose intent space matches the current intent
    DispatchByIntent,
    /// Append a user/assistant exchange to the working history
    AppendHistory { payload_ref: String },
    /// Resolve an expression and publish it as the final answer
    FinalOutput { input: String },
    /// Tag the parser did not recognize, preserved verbatim
    Unknown { tag: String },
}

/// One unit of plan work
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Symbolic id, e.g. `E1`
    pub id: String,
    pub desc: String,
    pub mode: StepMode,
    /// Parallel batching group, when the planner assigns one
    pub group: Option<String>,
    /// Raw payload text between the brackets
    pub raw_input: String,
    /// Step ids this step references, explicit or inferred
    pub depends_on: Vec<String>,
    pub action: StepAction,
}

impl Step {
    /// Tag name as written in the plan
    pub fn tag_name(&self) -> &str {
        match &self.action {
            StepAction::SplitQuery { .. } => "SplitQuery",
            StepAction::SerialCallAgent { .. } => "SerialCallAgent",
            StepAction::ParallelCallAgent { .. } => "ParallelCallAgent",
            StepAction::DispatchByIntent => "DispatchByIntent",
            StepAction::AppendHistory { .. } => "AppendHistory",
            StepAction::FinalOutput { .. } => "FinalOutput",
            StepAction::Unknown { tag } => tag,
        }
    }

    /// True when the router must prepare a route before the worker runs
    pub fn needs_routing(&self) -> bool {
        matches!(
            self.action,
            StepAction::SerialCallAgent { .. } | StepAction::ParallelCallAgent { .. }
        )
    }
}

/// Parsed plan: ordered steps plus the planner's reasoning span
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPlan {
    pub steps: Vec<Step>,
    pub reasoning: String,
}

fn plan_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^Plan\s*[:：]\s*(.+?)\s*[|｜]\s*[#＃]E(\d+)\s*[=＝]\s*([A-Za-z_]\w*)\s*\[(.*)\]\s*$",
        )
        .expect("plan line regex")
    })
}

fn reasoning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)思考过程\s*[:：](.*?)(?:\nPlan\s*[:：]|\z)").expect("reasoning regex")
    })
}

/// Parse planner text into typed steps
///
/// Lines that do not match the grammar are ignored (malformed plans
/// produce zero steps, a caller-visible failure mode). A duplicate step id
/// fails the parse outright.
pub fn parse_plan(text: &str) -> Result<ParsedPlan> {
    let mut steps = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut last_split: Option<String> = None;

    for caps in plan_line_re().captures_iter(text) {
        let desc = caps[1].trim().to_string();
        let id = format!("E{}", &caps[2]);
        let tag = caps[3].trim().to_string();
        let raw = caps[4].to_string();

        if !seen.insert(id.clone()) {
            return Err(EngineError::PlanParse(format!(
                "duplicate step id #{id} in plan"
            )));
        }

        let action = build_action(&tag, &raw);
        let mode = match action {
            StepAction::ParallelCallAgent { .. } => StepMode::Parallel,
            _ => StepMode::Serial,
        };

        let mut depends_on = resolve::find_refs(&raw);
        if depends_on.is_empty() {
            // A CallAgent step with no explicit references inherits the
            // latest prior SplitQuery's result.
            if matches!(
                action,
                StepAction::SerialCallAgent { .. } | StepAction::ParallelCallAgent { .. }
            ) {
                if let Some(split_id) = &last_split {
                    depends_on.push(split_id.clone());
                }
            }
        }

        if matches!(action, StepAction::SplitQuery { .. }) {
            last_split = Some(id.clone());
        }

        steps.push(Step {
            id,
            desc,
            mode,
            group: None,
            raw_input: raw,
            depends_on,
            action,
        });
    }

    let reasoning = reasoning_re()
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_default();

    Ok(ParsedPlan { steps, reasoning })
}

fn build_action(tag: &str, raw: &str) -> StepAction {
    match tag {
        "SplitQuery" => StepAction::SplitQuery {
            queries: parse_split_queries(raw),
        },
        "SerialCallAgent" => StepAction::SerialCallAgent {
            config: parse_call_config(raw),
        },
        "ParallelCallAgent" => StepAction::ParallelCallAgent {
            configs: parse_call_configs(raw),
        },
        "DispatchByIntent" => StepAction::DispatchByIntent,
        "AppendHistory" => StepAction::AppendHistory {
            payload_ref: raw.trim().to_string(),
        },
        "FinalOutput" => StepAction::FinalOutput {
            input: raw.trim().to_string(),
        },
        _ => StepAction::Unknown {
            tag: tag.to_string(),
        },
    }
}

/// Parse a SplitQuery payload: JSON array first, comma-split fallback
pub fn parse_split_queries(raw: &str) -> Vec<String> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
    }
    raw.split(',')
        .map(|piece| piece.trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn parse_call_config(raw: &str) -> CallConfig {
    serde_json::from_str::<CallConfig>(raw).unwrap_or_default()
}

fn parse_call_configs(raw: &str) -> Vec<CallConfig> {
    serde_json::from_str::<Vec<CallConfig>>(raw).unwrap_or_default()
}
