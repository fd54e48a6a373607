//! Replanner node
//!
//! Snapshots the failed attempt into the replan state, enforces the retry
//! ceiling, and clears the per-plan execution so the planner starts over.
//! Required steps collected by the evaluator survive the clear — the
//! planner folds them into its next prompt as a hint.

use crate::nodes::TRACE_REPLANNING;
use crate::state::{EngineState, EvalStatus, ExecutionState};
use tracing::{info, warn};

pub(crate) fn run_replanner(state: &mut EngineState) {
    state.replan.last_plan = state.plan_string.clone();
    state.replan.last_results = state.execution.results.to_value();
    if state.replan.last_failure.is_empty() {
        state.replan.last_failure = "unknown".to_string();
    }
    state.replan.count += 1;

    if state.replan.count > state.replan.max_iteration_limit {
        warn!(
            run_id = %state.run_id,
            count = state.replan.count,
            limit = state.replan.max_iteration_limit,
            "replan ceiling exceeded"
        );
        // Execution is left intact for the end gate, which emits the
        // user-facing apology exactly once.
        state.eval_status = Some(EvalStatus::Failed);
        return;
    }

    info!(
        run_id = %state.run_id,
        count = state.replan.count,
        cause = %state.replan.last_failure,
        "replanning"
    );

    // Keep only the newest history turn to limit prompt drift.
    let history = &mut state.working_input.history;
    if history.len() > 1 {
        let keep = history.split_off(history.len() - 1);
        *history = keep;
    }

    state.plan_string.clear();
    state.reasoning_overview.clear();
    state.execution = ExecutionState::default();
    state.pending_queries.clear();
    state.active_query = None;
    state.eval_status = None;
    state.route = None;
    state.routes = None;

    state.trace.add_text(TRACE_REPLANNING);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HistoryTurn, RawInput, ResultMeta, StepResult};
    use crate::trace::TraceCollector;
    use serde_json::json;
    use std::sync::Arc;

    fn failed_state() -> EngineState {
        let mut state = EngineState::new(
            RawInput::from_query("查余额"),
            Arc::new(TraceCollector::default()),
        );
        state.replan.max_iteration_limit = 2;
        state.plan_string = "Plan: 查询 | #E1 = SerialCallAgent[{}]".to_string();
        state.execution.record(
            StepResult::fail("E1", "SerialCallAgent", "", "timeout"),
            ResultMeta::default(),
        );
        state.replan.last_failure = "timeout".to_string();
        state.eval_status = Some(crate::state::EvalStatus::NeedReplan);
        state.working_input.history = vec![
            HistoryTurn::user("第一轮"),
            HistoryTurn::assistant("第一轮答案"),
            HistoryTurn::user("第二轮"),
        ];
        state
    }

    #[test]
    fn replan_snapshots_and_clears_execution() {
        let mut state = failed_state();
        run_replanner(&mut state);

        assert_eq!(state.replan.count, 1);
        assert!(state.replan.last_plan.contains("SerialCallAgent"));
        assert_eq!(state.replan.last_results["E1"]["error"], json!("timeout"));

        assert!(state.plan_string.is_empty());
        assert!(state.execution.steps.is_empty());
        assert!(state.execution.results.is_empty());
        assert!(state.pending_queries.is_empty());
        assert!(state.active_query.is_none());
        assert!(state.route.is_none());
        assert!(state.routes.is_none());
        assert!(state.eval_status.is_none());
        assert!(state.trace.contains(TRACE_REPLANNING));
    }

    #[test]
    fn history_is_truncated_to_its_last_turn() {
        let mut state = failed_state();
        run_replanner(&mut state);
        assert_eq!(state.working_input.history.len(), 1);
        assert_eq!(state.working_input.history[0].content, "第二轮");
    }

    #[test]
    fn exceeding_the_ceiling_fails_without_clearing() {
        let mut state = failed_state();
        state.replan.count = 2;
        run_replanner(&mut state);

        assert_eq!(state.replan.count, 3);
        assert_eq!(state.eval_status, Some(crate::state::EvalStatus::Failed));
        // The failed execution is preserved for the end gate.
        assert!(!state.execution.results.is_empty());
        // The user-facing apology belongs to the end gate, not this node.
        assert!(!state.trace.contains(TRACE_REPLANNING));
    }

    #[test]
    fn missing_failure_cause_defaults_to_unknown() {
        let mut state = failed_state();
        state.replan.last_failure.clear();
        run_replanner(&mut state);
        assert_eq!(state.replan.last_failure, "unknown");
    }
}
