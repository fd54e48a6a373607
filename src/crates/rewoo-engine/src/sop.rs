//! Standard Operating Procedures
//!
//! An SOP is a declarative bundle keyed by intent prefix: preconditions
//! (agent calls that must have happened), required slots (user/fact data
//! the procedure needs), slot questions, and slot extractors that pull
//! values out of prior agent outputs. The evaluator consults the matching
//! SOP after every successful step; unmet requirements drive a replan with
//! the missing steps as a planner hint.

use crate::resolve::get_by_path;
use crate::state::ExecutionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// An agent call that must precede the procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub id: String,
    pub agent: String,
    #[serde(default)]
    pub query: String,
}

/// One extraction rule for a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorRule {
    /// Agent whose output the value comes from
    pub from: String,
    /// JSON path into that output
    #[serde(default = "default_path")]
    pub path: String,
    /// Lower priority runs first
    #[serde(default)]
    pub priority: i32,
}

fn default_path() -> String {
    "$".to_string()
}

/// Slot requirements of a procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Slots the procedure cannot proceed without
    #[serde(default)]
    pub required: Vec<String>,
    /// Question asked for each slot when extraction comes up empty
    #[serde(default)]
    pub questions: HashMap<String, String>,
    /// Extraction rules per slot
    #[serde(default)]
    pub extractors: HashMap<String, Vec<ExtractorRule>>,
}

/// A Standard Operating Procedure bound to an intent prefix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sop {
    pub id: String,
    /// The SOP applies when the classified intent starts with this prefix
    pub intent_prefix: String,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default)]
    pub slots: SlotSpec,
}

/// A step the evaluator requires before an SOP is satisfied
///
/// Folded into the next plan as a replan hint. `AskUser` entries exist in
/// the data model but terminate a run until an interactive transport
/// exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequiredStep {
    AgentCall {
        id: String,
        desc: String,
        agent: String,
        query: String,
    },
    AskUser {
        id: String,
        desc: String,
        key: String,
        question: String,
    },
}

impl RequiredStep {
    pub fn id(&self) -> &str {
        match self {
            RequiredStep::AgentCall { id, .. } => id,
            RequiredStep::AskUser { id, .. } => id,
        }
    }

    /// Render one line of the replan hint handed to the planner
    pub fn hint_line(&self) -> String {
        match self {
            RequiredStep::AgentCall { agent, query, .. } => {
                if query.is_empty() {
                    format!("- 必须调用智能体 {agent}")
                } else {
                    format!("- 必须调用智能体 {agent}，查询：{query}")
                }
            }
            RequiredStep::AskUser { key, question, .. } => {
                format!("- 需要向用户确认 {key}：{question}")
            }
        }
    }
}

/// First SOP whose intent prefix matches the classified intent
pub fn find_sop<'a>(sops: &'a [Sop], intent: &str) -> Option<&'a Sop> {
    if intent.is_empty() {
        return None;
    }
    sops.iter()
        .find(|sop| !sop.intent_prefix.is_empty() && intent.starts_with(sop.intent_prefix.as_str()))
}

/// True when a slot value is effectively absent
fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

/// Fill missing slots from prior agent outputs
///
/// Rules are applied in priority order (lower first); results are scanned
/// in insertion order and the first non-empty value wins. Returns only the
/// newly extracted slots.
pub fn extract_patch(
    sop: &Sop,
    execution: &ExecutionState,
    slots: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut patch = serde_json::Map::new();

    for (slot_name, rules) in &sop.slots.extractors {
        if !is_missing(slots.get(slot_name)) {
            continue;
        }

        let mut ordered: Vec<&ExtractorRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.priority);

        'rules: for rule in ordered {
            for result in execution.results.iter() {
                let agent = execution
                    .result_meta
                    .get(&result.id)
                    .map(|meta| meta.agent.as_str())
                    .unwrap_or("");
                if agent != rule.from {
                    continue;
                }
                let value = get_by_path(&result.output, &rule.path);
                if !is_missing(Some(&value)) {
                    debug!(slot = %slot_name, from = %rule.from, "slot extracted");
                    patch.insert(slot_name.clone(), value);
                    break 'rules;
                }
            }
        }
    }

    patch
}

/// Compute the steps still required before the SOP is satisfied
///
/// Preconditions whose agent has not yet answered become agent calls;
/// required slots still missing after extraction become user questions.
pub fn required_steps(
    sop: &Sop,
    execution: &ExecutionState,
    slots: &serde_json::Map<String, Value>,
) -> Vec<RequiredStep> {
    let mut required = Vec::new();

    let mut done_agents: HashSet<&str> = HashSet::new();
    for meta in execution.result_meta.values() {
        if !meta.agent.is_empty() {
            done_agents.insert(meta.agent.as_str());
        }
        for item in &meta.items {
            if !item.agent.is_empty() {
                done_agents.insert(item.agent.as_str());
            }
        }
    }

    for precondition in &sop.preconditions {
        if precondition.agent.is_empty() || done_agents.contains(precondition.agent.as_str()) {
            continue;
        }
        let pc_id = if precondition.id.is_empty() {
            precondition.agent.clone()
        } else {
            precondition.id.clone()
        };
        required.push(RequiredStep::AgentCall {
            id: format!("PC_{pc_id}"),
            desc: format!("SOP前置需求：{pc_id}"),
            agent: precondition.agent.clone(),
            query: precondition.query.clone(),
        });
    }

    for key in &sop.slots.required {
        if !is_missing(slots.get(key)) {
            continue;
        }
        let question = sop
            .slots
            .questions
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("请补充{key}"));
        required.push(RequiredStep::AskUser {
            id: format!("ASK_{key}"),
            desc: format!("补齐信息：{key}"),
            key: key.clone(),
            question,
        });
    }

    dedup_by_id(required)
}

/// Drop later duplicates by required-step id
pub fn dedup_by_id(steps: Vec<RequiredStep>) -> Vec<RequiredStep> {
    let mut seen: HashSet<String> = HashSet::new();
    steps
        .into_iter()
        .filter(|step| seen.insert(step.id().to_string()))
        .collect()
}
