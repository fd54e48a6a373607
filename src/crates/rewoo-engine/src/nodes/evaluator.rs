//! Evaluator node
//!
//! The single point where step outcomes become control flow. Reads the
//! most recently recorded result and classifies the run: failed results
//! trigger a replan, an unmet SOP produces required steps, leftover
//! sub-queries rotate the router onto the next one, and anything else is
//! done. The retry ceiling overrides everything.

use crate::context::EngineContext;
use crate::nodes::{TRACE_AGENT_FAILED, TRACE_DONE, TRACE_EXHAUSTED, TRACE_NEXT_QUERY};
use crate::sop;
use crate::state::{EngineState, EvalStatus, StepResult, StepStatus};
use crate::Result;
use serde_json::Value;
use tracing::{debug, info};

pub(crate) async fn run_evaluator(state: &mut EngineState, ctx: &EngineContext) -> Result<()> {
    // FAILED and NEED_USER set by the worker pass straight through the end
    // gate; re-evaluating the last result would overwrite the verdict.
    if matches!(
        state.eval_status,
        Some(EvalStatus::Failed) | Some(EvalStatus::NeedUser)
    ) {
        enforce_ceiling(state);
        return Ok(());
    }

    match state.execution.results.last().cloned() {
        Some(last) => evaluate_last(state, ctx, &last),
        None => {
            // Zero steps produced (malformed plan): done with an empty
            // result, visible to the caller as such.
            state.eval_status = Some(EvalStatus::Done);
            state.trace.add_text(TRACE_DONE);
        }
    }

    enforce_ceiling(state);
    info!(run_id = %state.run_id, status = ?state.eval_status, "evaluation complete");
    Ok(())
}

fn evaluate_last(state: &mut EngineState, ctx: &EngineContext, last: &StepResult) {
    let nested_fail = last.output.get("status").and_then(Value::as_str) == Some("fail");

    if last.status == StepStatus::Fail || nested_fail {
        state.eval_status = Some(EvalStatus::NeedReplan);
        if state.replan.last_failure.is_empty() {
            // Preserve the earliest cause across replans.
            state.replan.last_failure = failure_cause(last);
        }
        state.trace.add_text(TRACE_AGENT_FAILED);
        return;
    }

    if last.is_empty() {
        // A result carrying no output and no error evaluates as done.
        state.eval_status = Some(EvalStatus::Done);
        state.trace.add_text(TRACE_DONE);
        return;
    }

    if let Some(sop) = sop::find_sop(&ctx.sops, &state.working_input.intent) {
        let patch = sop::extract_patch(sop, &state.execution, &state.slots);
        for (key, value) in patch {
            debug!(slot = %key, "slot filled from agent output");
            state.slots.insert(key, value);
        }
        let required = sop::required_steps(sop, &state.execution, &state.slots);
        if !required.is_empty() {
            debug!(sop = %sop.id, required = required.len(), "SOP requirements unmet");
            state.required_steps = required;
            state.eval_status = Some(EvalStatus::NeedReplan);
            return;
        }
    }

    if let Some(next) = state.pending_queries.pop_front() {
        // Rotate onto the next sub-query: the served intent becomes the
        // previous intent and the router classifies afresh.
        state.active_query = Some(next.clone());
        state.working_input.query = next;
        state.working_input.prev_intent = state.working_input.intent.clone();
        state.working_input.intent.clear();
        state.eval_status = Some(EvalStatus::NextQuery);
        state.trace.add_text(TRACE_NEXT_QUERY);
        return;
    }

    state.eval_status = Some(EvalStatus::Done);
    state.trace.add_text(TRACE_DONE);
}

fn failure_cause(last: &StepResult) -> String {
    if !last.error.is_empty() {
        return last.error.clone();
    }
    ["reason", "error", "message"]
        .into_iter()
        .find_map(|key| last.output.get(key).and_then(Value::as_str))
        .unwrap_or("agent returned fail")
        .to_string()
}

fn enforce_ceiling(state: &mut EngineState) {
    if state.replan.exhausted() {
        state.eval_status = Some(EvalStatus::Failed);
        state.trace.add_text(TRACE_EXHAUSTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EngineContext, IntentClassifier, LanguageModel};
    use crate::registry::AgentRegistry;
    use crate::sop::{Precondition, Sop};
    use crate::state::{HistoryTurn, RawInput, ResultMeta};
    use crate::trace::TraceCollector;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct NullModel;

    #[async_trait]
    impl LanguageModel for NullModel {
        async fn complete(&self, _prompt: &str) -> crate::Result<String> {
            Ok(String::new())
        }
    }

    struct NullClassifier;

    #[async_trait]
    impl IntentClassifier for NullClassifier {
        async fn classify(
            &self,
            _query: &str,
            _history: &[HistoryTurn],
            _prev_intent: &str,
        ) -> crate::Result<String> {
            Ok("others".to_string())
        }
    }

    fn ctx_with_sops(sops: Vec<Sop>) -> EngineContext {
        EngineContext::builder()
            .language_model(Arc::new(NullModel))
            .classifier(Arc::new(NullClassifier))
            .registry(Arc::new(AgentRegistry::new()))
            .sops(sops)
            .build()
            .unwrap()
    }

    fn state() -> EngineState {
        let mut state = EngineState::new(
            RawInput::from_query("查余额"),
            Arc::new(TraceCollector::default()),
        );
        state.replan.max_iteration_limit = 3;
        state
    }

    fn record_ok(state: &mut EngineState, id: &str, output: Value) {
        state.execution.record(
            StepResult::ok(id, "SerialCallAgent", "", output),
            ResultMeta {
                tag: "SerialCallAgent".to_string(),
                agent: "account".to_string(),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn failed_result_requests_replan_and_keeps_earliest_cause() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        state.execution.record(
            StepResult::fail("E1", "SerialCallAgent", "", "timeout"),
            ResultMeta::default(),
        );

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::NeedReplan));
        assert_eq!(state.replan.last_failure, "timeout");
        assert!(state.trace.contains(TRACE_AGENT_FAILED));

        // A later failure does not overwrite the recorded cause.
        state.execution.record(
            StepResult::fail("E2", "SerialCallAgent", "", "later"),
            ResultMeta::default(),
        );
        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.replan.last_failure, "timeout");
    }

    #[tokio::test]
    async fn nested_output_failure_counts_as_failure() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        record_ok(
            &mut state,
            "E1",
            json!({"status": "fail", "message": "余额服务不可用"}),
        );

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::NeedReplan));
        assert_eq!(state.replan.last_failure, "余额服务不可用");
    }

    #[tokio::test]
    async fn successful_result_without_leftovers_is_done() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        record_ok(&mut state, "E1", json!({"balance": 1234}));

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::Done));
        assert!(state.trace.contains(TRACE_DONE));
    }

    #[tokio::test]
    async fn empty_results_evaluate_done() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::Done));
    }

    #[tokio::test]
    async fn pending_queries_rotate_to_next_query() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        state.working_input.intent = "acct_balance".to_string();
        state.pending_queries.push_back("推荐理财".to_string());
        record_ok(&mut state, "E1", json!({"balance": 1234}));

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::NextQuery));
        assert_eq!(state.active_query.as_deref(), Some("推荐理财"));
        assert_eq!(state.working_input.prev_intent, "acct_balance");
        assert!(state.working_input.intent.is_empty());
        assert!(state.pending_queries.is_empty());
    }

    #[tokio::test]
    async fn unmet_sop_produces_required_steps() {
        let sop = Sop {
            id: "wealth".to_string(),
            intent_prefix: "wealth".to_string(),
            preconditions: vec![Precondition {
                id: "pc_profile".to_string(),
                agent: "profile_agent".to_string(),
                query: "查询画像".to_string(),
            }],
            ..Default::default()
        };
        let ctx = ctx_with_sops(vec![sop]);
        let mut state = state();
        state.working_input.intent = "wealth_pick".to_string();
        record_ok(&mut state, "E1", json!({"balance": 1234}));

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::NeedReplan));
        assert_eq!(state.required_steps.len(), 1);
    }

    #[tokio::test]
    async fn ceiling_overrides_everything() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        state.replan.count = 4;
        record_ok(&mut state, "E1", json!({"balance": 1234}));

        run_evaluator(&mut state, &ctx).await.unwrap();
        assert_eq!(state.eval_status, Some(EvalStatus::Failed));
        assert!(state.trace.contains(TRACE_EXHAUSTED));
    }

    #[tokio::test]
    async fn worker_set_failure_passes_the_end_gate_untouched() {
        let ctx = ctx_with_sops(Vec::new());
        let mut state = state();
        state.execution.record(
            StepResult::fail("E1", "SerialCallAgent", "", "agent not registered: ghost"),
            ResultMeta::default(),
        );
        state.eval_status = Some(EvalStatus::Failed);

        run_evaluator(&mut state, &ctx).await.unwrap();
        // Not converted into NEED_REPLAN.
        assert_eq!(state.eval_status, Some(EvalStatus::Failed));
        assert_eq!(state.replan.count, 0);
    }
}
