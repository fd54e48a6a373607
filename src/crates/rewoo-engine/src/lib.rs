//! Plan-and-execute orchestration engine for remote agent fleets
//!
//! This crate executes annotated plans against a fleet of networked worker
//! agents. An upstream planner (any [`LanguageModel`](context::LanguageModel)
//! implementation) turns a natural-language task into a line-oriented plan;
//! the engine drives that plan through a small state machine
//! (plan → route → execute → evaluate → replan|end), threading evidence
//! between steps by symbolic reference and re-planning on failure up to a
//! bounded number of retries.
//!
//! # Architecture
//!
//! ```text
//! START ──> planner ──> router ──> worker ──┬──> worker   (next step needs no routing)
//!              ▲                            ├──> router   (next step is a CallAgent)
//!              │                            └──> evaluator
//!              │                                   │
//!           replanner <── NEED_REPLAN ─────────────┤
//!                                     NEXT_QUERY ──┴──> router
//!                                     DONE | FAILED ──> END ──> composer
//! ```
//!
//! - [`plan`] parses planner text into typed steps
//! - [`resolve`] substitutes `$WORKING_INPUT` / `#Ek` references
//! - [`registry`] maps agent names to HTTP, streaming, or local executors
//! - [`nodes`] implements the five state-machine nodes
//! - [`engine`] owns the driver loop and terminal composition
//! - [`compose`] renders the final answer from a declarative layout
//!
//! # Example
//!
//! ```rust,ignore
//! use rewoo_engine::{Engine, EngineContext, RawInput};
//!
//! let ctx = EngineContext::builder()
//!     .language_model(llm)
//!     .classifier(classifier)
//!     .registry(registry)
//!     .build()?;
//!
//! let outcome = Engine::new(ctx)
//!     .run(RawInput::from_query("检查下我的账户状态。"))
//!     .await?;
//! println!("{}", outcome.answer);
//! ```

pub mod compose;
pub mod config;
pub mod context;
pub mod engine;
pub mod nodes;
pub mod plan;
pub mod registry;
pub mod resolve;
pub mod sop;
pub mod state;
pub mod stream;
pub mod trace;

use thiserror::Error;

/// Errors that can occur while driving a plan
///
/// Step-level failures are data, not errors: an agent returning
/// `status: "fail"` is recorded into a [`state::StepResult`] and handled by
/// the evaluator. `EngineError` covers the caller-visible failure modes —
/// bad configuration, unusable plan text, and collaborator breakage.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Plan text could not be turned into a usable step list
    #[error("plan parse error: {0}")]
    PlanParse(String),

    /// Fleet or layout configuration is invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport-level dispatch failure for a named agent
    #[error("agent dispatch failed for '{agent}': {message}")]
    Dispatch { agent: String, message: String },

    /// The planner/solver language model call failed
    #[error("language model call failed: {0}")]
    LanguageModel(String),

    /// The intent classifier call failed
    #[error("intent classification failed: {0}")]
    Classifier(String),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General engine error
    #[error("engine error: {0}")]
    General(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

pub use compose::{ComposedPiece, LayoutSection, OutputLayout};
pub use config::{AgentConfig, EndpointConfig, FleetConfig};
pub use context::{EngineContext, EngineContextBuilder, IntentClassifier, LanguageModel};
pub use engine::{Engine, RunOutcome, StreamOutcome};
pub use plan::{CallConfig, ParsedPlan, Step, StepAction, StepMode};
pub use registry::{AgentEntry, AgentExecutor, AgentRegistry, HttpExecutor, LocalExecutor};
pub use sop::{RequiredStep, Sop};
pub use state::{
    EngineState, EvalStatus, ExecutionState, HistoryTurn, RawInput, ReplanState, ResultLog,
    ResultMeta, Route, StepResult, StepStatus,
};
pub use stream::{FrameStream, RawFrameSink, StreamAggregate};
pub use trace::{TraceCollector, TraceEntry, TraceEvent, TraceSink};
