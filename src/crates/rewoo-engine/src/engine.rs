//! Engine driver
//!
//! Owns the state-machine loop tying the nodes together:
//!
//! ```text
//! plan → router → worker → {worker | router | evaluator}
//! evaluator → {END | router | replanner}
//! replanner → plan (or the end gate once the ceiling trips)
//! ```
//!
//! One node runs at a time; the only concurrency lives inside the worker's
//! parallel fan-out. A transition bound guards against plans that cannot
//! make progress.

use crate::compose;
use crate::context::EngineContext;
use crate::nodes;
use crate::state::{EngineState, EvalStatus, RawInput};
use crate::trace::TraceCollector;
use crate::{ComposedPiece, EngineError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound on node transitions for one run
const MAX_TRANSITIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Plan,
    Router,
    Worker,
    Evaluator,
    Replanner,
}

/// Terminal state plus the composed answer
pub struct RunOutcome {
    pub state: EngineState,
    /// Final answer rendered through the output layout
    pub answer: String,
}

/// Terminal state plus the composed answer pieces (streaming)
pub struct StreamOutcome {
    pub state: EngineState,
    /// Ordered answer pieces; raw stream frames are preserved as-is
    pub pieces: Vec<ComposedPiece>,
}

/// Plan execution engine
pub struct Engine {
    ctx: EngineContext,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Drive a run to its terminal state and compose the answer
    pub async fn run(&self, raw_input: RawInput) -> Result<RunOutcome> {
        let state = self.drive(raw_input).await?;
        let answer = compose::compose(&state, &self.ctx).await?;
        Ok(RunOutcome { state, answer })
    }

    /// Drive a run and compose answer pieces for streaming callers
    ///
    /// Raw agent frames are additionally forwarded through the context's
    /// raw sink while the run executes.
    pub async fn run_streaming(&self, raw_input: RawInput) -> Result<StreamOutcome> {
        let state = self.drive(raw_input).await?;
        let pieces = compose::compose_stream(&state, &self.ctx).await?;
        Ok(StreamOutcome { state, pieces })
    }

    /// Compose (again) over a terminal state
    pub async fn compose(&self, state: &EngineState) -> Result<String> {
        compose::compose(state, &self.ctx).await
    }

    async fn drive(&self, raw_input: RawInput) -> Result<EngineState> {
        let trace = Arc::new(TraceCollector::default());
        if let Some(sink) = &self.ctx.trace_sink {
            trace.set_sink(Arc::clone(sink));
        }
        let mut state = EngineState::new(raw_input, trace);
        info!(run_id = %state.run_id, task = %state.task, "run started");

        let mut node = Node::Plan;
        let mut transitions = 0usize;
        loop {
            transitions += 1;
            if transitions > MAX_TRANSITIONS {
                return Err(EngineError::General(format!(
                    "state machine exceeded {MAX_TRANSITIONS} transitions"
                )));
            }
            debug!(run_id = %state.run_id, node = ?node, "entering node");

            match node {
                Node::Plan => {
                    nodes::run_planner(&mut state, &self.ctx).await?;
                    node = Node::Router;
                }
                Node::Router => {
                    nodes::run_router(&mut state, &self.ctx).await?;
                    node = Node::Worker;
                }
                Node::Worker => {
                    let before = state.execution.cursor;
                    nodes::run_worker(&mut state, &self.ctx).await?;
                    node = self.after_worker(&state, before);
                }
                Node::Evaluator => {
                    nodes::run_evaluator(&mut state, &self.ctx).await?;
                    match state.eval_status {
                        Some(EvalStatus::Done)
                        | Some(EvalStatus::Failed)
                        | Some(EvalStatus::NeedUser) => break,
                        Some(EvalStatus::NextQuery) => node = Node::Router,
                        _ => node = Node::Replanner,
                    }
                }
                Node::Replanner => {
                    nodes::run_replanner(&mut state);
                    node = if state.eval_status == Some(EvalStatus::Failed) {
                        // Ceiling tripped; route to the end gate.
                        Node::Evaluator
                    } else {
                        Node::Plan
                    };
                }
            }
        }

        info!(
            run_id = %state.run_id,
            status = ?state.eval_status,
            replans = state.replan.count,
            "run finished"
        );
        Ok(state)
    }

    fn after_worker(&self, state: &EngineState, cursor_before: usize) -> Node {
        // Worker-declared terminal statuses go straight to the end gate.
        if matches!(
            state.eval_status,
            Some(EvalStatus::Failed) | Some(EvalStatus::NeedUser)
        ) {
            return Node::Evaluator;
        }
        // No progress (unknown tag): surface through the evaluator instead
        // of spinning on the same step.
        if state.execution.cursor == cursor_before {
            return Node::Evaluator;
        }
        if state.execution.drained() {
            return Node::Evaluator;
        }
        match state.execution.current() {
            Some(step) if step.needs_routing() => Node::Router,
            Some(_) => Node::Worker,
            None => Node::Evaluator,
        }
    }
}
