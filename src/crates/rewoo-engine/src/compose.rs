//! Final answer composition
//!
//! Once a run reaches DONE or FAILED, the composer walks a declarative
//! layout of sections and renders the final answer: agent outputs
//! (aggregated text, or raw frames when streaming), an LLM summary over
//! the collected evidence, literal text, and the FinalOutput value.
//! Composition is read-only over the terminal state, so composing the same
//! state twice yields identical output.

use crate::context::EngineContext;
use crate::state::{EngineState, EvalStatus};
use crate::stream::{aggregate_frames, plain_text, raw_events};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One section of the output layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayoutSection {
    /// Outputs of a named agent, or of all agents when unnamed
    Agent {
        #[serde(default)]
        agent: String,
        #[serde(default)]
        title: String,
    },
    /// LLM summary over reasoning, plan, and collected results
    Summary {
        #[serde(default)]
        title: String,
    },
    /// Literal text
    Text {
        value: String,
        #[serde(default)]
        title: String,
    },
    /// The FinalOutput value, when a step wrote one
    Final {
        #[serde(default)]
        title: String,
    },
}

/// Declarative answer layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLayout {
    pub sections: Vec<LayoutSection>,
    /// Joined between non-empty sections
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "\n\n".to_string()
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            sections: vec![LayoutSection::Summary {
                title: String::new(),
            }],
            separator: default_separator(),
        }
    }
}

/// One piece of a streaming composition
#[derive(Debug, Clone, PartialEq)]
pub enum ComposedPiece {
    Text(String),
    /// A raw stream frame forwarded to the caller untouched
    Frame(Value),
}

struct AgentOutput {
    agent: String,
    output: Value,
}

fn collect_agent_outputs(state: &EngineState) -> Vec<AgentOutput> {
    let mut outputs = Vec::new();
    for result in state.execution.results.iter() {
        let meta = state.execution.result_meta.get(&result.id);
        match result.tag.as_str() {
            "SerialCallAgent" | "DispatchByIntent" => {
                outputs.push(AgentOutput {
                    agent: meta.map(|m| m.agent.clone()).unwrap_or_default(),
                    output: result.output.clone(),
                });
            }
            "ParallelCallAgent" => {
                let meta_items = meta.map(|m| m.items.as_slice()).unwrap_or(&[]);
                if let Some(items) = result.output.as_array() {
                    for (idx, item) in items.iter().enumerate() {
                        let agent = item
                            .get("agent")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string())
                            .or_else(|| meta_items.get(idx).map(|m| m.agent.clone()))
                            .unwrap_or_default();
                        let output = item.get("output").cloned().unwrap_or_else(|| item.clone());
                        outputs.push(AgentOutput { agent, output });
                    }
                }
            }
            _ => {}
        }
    }
    outputs
}

fn render_text(payload: &Value) -> String {
    if let Some(frames) = raw_events(payload) {
        return aggregate_frames(frames).assistant_text;
    }
    if let Some(text) = plain_text(payload) {
        return text;
    }
    match payload {
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn render_stream(payload: &Value) -> Vec<ComposedPiece> {
    if let Some(frames) = raw_events(payload) {
        return frames.iter().cloned().map(ComposedPiece::Frame).collect();
    }
    match payload {
        Value::Null => Vec::new(),
        other => vec![ComposedPiece::Frame(other.clone())],
    }
}

async fn build_summary(state: &EngineState, ctx: &EngineContext) -> Result<String> {
    let evidence = serde_json::to_string_pretty(&state.execution.results.to_value())?;
    let prompt =
        ctx.format_solver_prompt(&state.reasoning_overview, &state.plan_string, &evidence);
    ctx.llm.complete(&prompt).await
}

async fn compose_pieces(
    state: &EngineState,
    ctx: &EngineContext,
    streaming: bool,
) -> Result<Vec<ComposedPiece>> {
    if !matches!(
        state.eval_status,
        Some(EvalStatus::Done) | Some(EvalStatus::Failed)
    ) {
        return Ok(Vec::new());
    }

    let agent_outputs = collect_agent_outputs(state);
    let mut summary_cache: Option<String> = None;
    let mut pieces: Vec<ComposedPiece> = Vec::new();

    for section in &ctx.layout.sections {
        let mut chunks: Vec<ComposedPiece> = Vec::new();
        let title = match section {
            LayoutSection::Agent { agent, title } => {
                for output in agent_outputs
                    .iter()
                    .filter(|o| agent.is_empty() || o.agent == *agent)
                {
                    if streaming {
                        chunks.extend(render_stream(&output.output));
                    } else {
                        let text = render_text(&output.output);
                        if !text.is_empty() {
                            chunks.push(ComposedPiece::Text(text));
                        }
                    }
                }
                title
            }
            LayoutSection::Summary { title } => {
                if summary_cache.is_none() {
                    summary_cache = Some(build_summary(state, ctx).await?);
                }
                if let Some(summary) = summary_cache.as_ref().filter(|s| !s.is_empty()) {
                    chunks.push(ComposedPiece::Text(summary.clone()));
                }
                title
            }
            LayoutSection::Text { value, title } => {
                if !value.is_empty() {
                    chunks.push(ComposedPiece::Text(value.clone()));
                }
                title
            }
            LayoutSection::Final { title } => {
                let text = render_text(&state.result);
                if !text.is_empty() {
                    chunks.push(ComposedPiece::Text(text));
                }
                title
            }
        };

        if chunks.is_empty() {
            continue;
        }
        if !pieces.is_empty() && !ctx.layout.separator.is_empty() {
            pieces.push(ComposedPiece::Text(ctx.layout.separator.clone()));
        }
        if !title.is_empty() {
            pieces.push(ComposedPiece::Text(format!("{title}\n")));
        }
        pieces.extend(chunks);
    }

    debug!(pieces = pieces.len(), streaming, "composed final answer");
    Ok(pieces)
}

/// Render the final answer as a single string
pub async fn compose(state: &EngineState, ctx: &EngineContext) -> Result<String> {
    let pieces = compose_pieces(state, ctx, false).await?;
    Ok(pieces
        .into_iter()
        .map(|piece| match piece {
            ComposedPiece::Text(text) => text,
            ComposedPiece::Frame(frame) => frame.to_string(),
        })
        .collect())
}

/// Render the final answer as ordered pieces, raw frames preserved
pub async fn compose_stream(
    state: &EngineState,
    ctx: &EngineContext,
) -> Result<Vec<ComposedPiece>> {
    compose_pieces(state, ctx, true).await
}
