//! Engine context: injected collaborators and prompt templates
//!
//! The engine never talks to a concrete LLM or intent service. Both are
//! capability traits wired in through [`EngineContext`]; production code
//! plugs HTTP-backed implementations, tests plug scripted fakes.

use crate::compose::OutputLayout;
use crate::registry::AgentRegistry;
use crate::sop::Sop;
use crate::state::HistoryTurn;
use crate::stream::RawFrameSink;
use crate::trace::TraceSink;
use crate::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Planner/solver language model: a pure `prompt → text` function
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Intent classifier for routed agent calls
///
/// Returns an intent tag; `"others"` is reserved for "no agent applies".
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        query: &str,
        history: &[HistoryTurn],
        prev_intent: &str,
    ) -> Result<String>;
}

/// Default planner prompt template
///
/// Placeholders: `{task}`, `{replan_hint}`, `{agent_catalog}`.
pub const DEFAULT_PLANNER_PROMPT: &str = "你是一个银行智能助理的任务规划器，请针对用户任务制定执行计划。\n\
可用智能体：\n{agent_catalog}\n\n\
输出格式（逐行）：\n\
思考过程：<整体思路>\n\
Plan: <步骤描述> | #E1 = <标签>[<参数>]\n\
可用标签：SplitQuery、SerialCallAgent、ParallelCallAgent、AppendHistory、FinalOutput。\n\
{replan_hint}\n\
用户任务：{task}\n";

/// Default solver prompt template
///
/// Placeholders: `{reasoning_overview}`, `{plan}`, `{evidence}`.
pub const DEFAULT_SOLVER_PROMPT: &str = "请根据以下执行计划与证据，用中文直接回答用户的问题。\n\
整体思路：{reasoning_overview}\n\
执行计划：\n{plan}\n\
执行证据：\n{evidence}\n";

/// Immutable collaborators and configuration for one engine instance
pub struct EngineContext {
    pub llm: Arc<dyn LanguageModel>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub registry: Arc<AgentRegistry>,
    /// Standard Operating Procedures consulted by the evaluator
    pub sops: Vec<Sop>,
    pub planner_prompt: String,
    pub solver_prompt: String,
    pub layout: OutputLayout,
    /// Sink receiving raw stream frames during streaming runs
    pub raw_sink: Option<RawFrameSink>,
    /// Push sink receiving each trace entry as it is appended
    pub trace_sink: Option<TraceSink>,
}

impl EngineContext {
    pub fn builder() -> EngineContextBuilder {
        EngineContextBuilder::default()
    }

    /// Render the planner prompt for a task
    pub fn format_planner_prompt(&self, task: &str, replan_hint: &str, catalog: &str) -> String {
        self.planner_prompt
            .replace("{agent_catalog}", catalog)
            .replace("{replan_hint}", replan_hint)
            .replace("{task}", task)
    }

    /// Render the solver prompt over a finished execution
    pub fn format_solver_prompt(&self, reasoning: &str, plan: &str, evidence: &str) -> String {
        self.solver_prompt
            .replace("{reasoning_overview}", reasoning)
            .replace("{plan}", plan)
            .replace("{evidence}", evidence)
    }
}

/// Builder for [`EngineContext`]
#[derive(Default)]
pub struct EngineContextBuilder {
    llm: Option<Arc<dyn LanguageModel>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    registry: Option<Arc<AgentRegistry>>,
    sops: Vec<Sop>,
    planner_prompt: Option<String>,
    solver_prompt: Option<String>,
    layout: Option<OutputLayout>,
    raw_sink: Option<RawFrameSink>,
    trace_sink: Option<TraceSink>,
}

impl EngineContextBuilder {
    pub fn language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sops(mut self, sops: Vec<Sop>) -> Self {
        self.sops = sops;
        self
    }

    pub fn planner_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.planner_prompt = Some(prompt.into());
        self
    }

    pub fn solver_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.solver_prompt = Some(prompt.into());
        self
    }

    pub fn layout(mut self, layout: OutputLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn raw_sink(mut self, sink: RawFrameSink) -> Self {
        self.raw_sink = Some(sink);
        self
    }

    pub fn trace_sink(mut self, sink: TraceSink) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<EngineContext> {
        let llm = self
            .llm
            .ok_or_else(|| EngineError::Configuration("language model is required".to_string()))?;
        let classifier = self
            .classifier
            .ok_or_else(|| EngineError::Configuration("intent classifier is required".to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| EngineError::Configuration("agent registry is required".to_string()))?;
        Ok(EngineContext {
            llm,
            classifier,
            registry,
            sops: self.sops,
            planner_prompt: self
                .planner_prompt
                .unwrap_or_else(|| DEFAULT_PLANNER_PROMPT.to_string()),
            solver_prompt: self
                .solver_prompt
                .unwrap_or_else(|| DEFAULT_SOLVER_PROMPT.to_string()),
            layout: self.layout.unwrap_or_default(),
            raw_sink: self.raw_sink,
            trace_sink: self.trace_sink,
        })
    }
}
