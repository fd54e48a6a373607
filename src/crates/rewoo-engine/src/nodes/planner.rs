//! Planner node
//!
//! Formats the planner prompt, invokes the language model, parses the
//! resulting plan into typed steps, and seeds the execution state. Sub-
//! queries declared by SplitQuery steps are drained into the pending
//! queue here, at plan time.

use crate::context::EngineContext;
use crate::nodes::TRACE_PLANNING;
use crate::plan::{self, StepAction};
use crate::state::{EngineState, ExecutionState, DEFAULT_RECURSION_LIMIT};
use crate::Result;
use std::collections::VecDeque;
use tracing::{debug, info};

pub(crate) async fn run_planner(state: &mut EngineState, ctx: &EngineContext) -> Result<()> {
    state.trace.add_text(TRACE_PLANNING);

    // The replan ceiling comes from the caller, once, on the first pass.
    if state.replan.max_iteration_limit == 0 {
        state.replan.max_iteration_limit = state
            .raw_input()
            .recursion_limit
            .unwrap_or(DEFAULT_RECURSION_LIMIT);
    }

    let hint = build_replan_hint(state);
    let catalog = ctx.registry.catalog();
    let prompt = ctx.format_planner_prompt(&state.task, &hint, &catalog);

    let plan_text = ctx.llm.complete(&prompt).await?;
    let parsed = plan::parse_plan(&plan_text)?;
    info!(
        run_id = %state.run_id,
        steps = parsed.steps.len(),
        replan_count = state.replan.count,
        "plan parsed"
    );

    let mut pending: VecDeque<String> = VecDeque::new();
    for step in &parsed.steps {
        if let StepAction::SplitQuery { queries } = &step.action {
            pending.extend(queries.iter().cloned());
        }
    }
    if pending.is_empty() {
        pending.push_back(state.working_input.query.clone());
    }
    debug!(pending = pending.len(), "pending queries seeded");

    state.plan_string = plan_text;
    state.reasoning_overview = parsed.reasoning;
    state.execution = ExecutionState::new(parsed.steps);
    state.pending_queries = pending;
    state.active_query = None;
    state.eval_status = None;
    state.required_steps.clear();
    Ok(())
}

/// Render the replan hint from the previous attempt and required steps
fn build_replan_hint(state: &EngineState) -> String {
    let mut lines: Vec<String> = Vec::new();
    if state.replan.count > 0 {
        let cause = if state.replan.last_failure.is_empty() {
            "unknown"
        } else {
            state.replan.last_failure.as_str()
        };
        lines.push(format!(
            "这是第{}次重新规划，上次失败原因：{}",
            state.replan.count, cause
        ));
        if !state.replan.last_plan.is_empty() {
            lines.push(format!("上次计划：\n{}", state.replan.last_plan));
        }
        if !state.replan.last_results.is_null() {
            lines.push(format!("上次执行结果：{}", state.replan.last_results));
        }
    }
    if !state.required_steps.is_empty() {
        lines.push("新计划必须包含以下步骤：".to_string());
        for step in &state.required_steps {
            lines.push(step.hint_line());
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EngineContext, IntentClassifier, LanguageModel};
    use crate::registry::AgentRegistry;
    use crate::sop::RequiredStep;
    use crate::state::{HistoryTurn, RawInput};
    use crate::trace::TraceCollector;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> crate::Result<String> {
            self.prompts.lock().push(prompt.to_string());
            Ok(self.responses.lock().pop().unwrap_or_default())
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

    fn ctx(model: Arc<ScriptedModel>) -> EngineContext {
        EngineContext::builder()
            .language_model(model)
            .classifier(Arc::new(NullClassifier))
            .registry(Arc::new(AgentRegistry::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn seeds_pending_queries_from_split_query() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Plan: 拆分 | #E1 = SplitQuery[[\"查余额\", \"推荐理财\"]]\n\
             Plan: 并行 | #E2 = ParallelCallAgent[[{\"agent\": \"a\"}, {\"agent\": \"b\"}]]",
        ]));
        let ctx = ctx(Arc::clone(&model));
        let mut state = EngineState::new(
            RawInput::from_query("复合问题"),
            Arc::new(TraceCollector::default()),
        );

        run_planner(&mut state, &ctx).await.unwrap();
        assert_eq!(state.pending_queries.len(), 2);
        assert_eq!(state.execution.steps.len(), 2);
        assert_eq!(state.replan.max_iteration_limit, DEFAULT_RECURSION_LIMIT);
        assert!(state.active_query.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_working_query_without_split() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Plan: 查询 | #E1 = SerialCallAgent[{\"agent\": \"a\"}]",
        ]));
        let ctx = ctx(Arc::clone(&model));
        let mut state = EngineState::new(
            RawInput::from_query("查余额"),
            Arc::new(TraceCollector::default()),
        );

        run_planner(&mut state, &ctx).await.unwrap();
        assert_eq!(state.pending_queries.len(), 1);
        assert_eq!(state.pending_queries.front().unwrap(), "查余额");
    }

    #[tokio::test]
    async fn replan_hint_carries_failure_and_required_steps() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Plan: 查询 | #E1 = SerialCallAgent[{\"agent\": \"a\"}]",
        ]));
        let ctx = ctx(Arc::clone(&model));
        let mut state = EngineState::new(
            RawInput::from_query("查余额"),
            Arc::new(TraceCollector::default()),
        );
        state.replan.count = 1;
        state.replan.last_failure = "timeout".to_string();
        state.replan.max_iteration_limit = 3;
        state.required_steps = vec![RequiredStep::AgentCall {
            id: "PC_x".to_string(),
            desc: String::new(),
            agent: "account_agent".to_string(),
            query: "查询账户".to_string(),
        }];

        run_planner(&mut state, &ctx).await.unwrap();

        let prompts = model.prompts.lock();
        assert!(prompts[0].contains("timeout"));
        assert!(prompts[0].contains("account_agent"));
        // Required steps were folded into the hint and consumed.
        assert!(state.required_steps.is_empty());
        // The caller-provided ceiling is not reseeded on replans.
        assert_eq!(state.replan.max_iteration_limit, 3);
    }

    #[tokio::test]
    async fn malformed_plan_yields_zero_steps() {
        let model = Arc::new(ScriptedModel::new(vec!["抱歉，我无法规划。"]));
        let ctx = ctx(model);
        let mut state = EngineState::new(
            RawInput::from_query("查余额"),
            Arc::new(TraceCollector::default()),
        );

        run_planner(&mut state, &ctx).await.unwrap();
        assert!(state.execution.steps.is_empty());
        assert!(state.execution.drained());
    }
}
