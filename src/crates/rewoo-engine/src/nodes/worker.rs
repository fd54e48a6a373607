//! Worker node
//!
//! Consumes the step at the cursor: records exactly one result per step
//! and advances the cursor by one. Serial calls dispatch a single prepared
//! route; parallel groups fan out onto a bounded pool and re-order their
//! outputs back into route order. Per-route failures inside a parallel
//! group stay inside the output list and never fail the step itself.

use crate::context::EngineContext;
use crate::nodes::TRACE_STREAM_SEQUENTIAL;
use crate::plan::{Step, StepAction};
use crate::registry::{
    default_payload_builder, normalize_result, AgentRegistry, NormalizedResult, OTHERS_AGENT,
};
use crate::resolve;
use crate::state::{
    EngineState, EvalStatus, MetaItem, ResultMeta, Route, StepResult, StepStatus,
};
use crate::stream::{wrap_raw_events, FrameStream, RawFrameSink};
use crate::Result;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Concurrency ceiling for a parallel group
const MAX_PARALLEL_ROUTES: usize = 4;

/// Character cap for assistant turns appended to history
const HISTORY_TEXT_LIMIT: usize = 2000;

pub(crate) async fn run_worker(state: &mut EngineState, ctx: &EngineContext) -> Result<()> {
    let Some(step) = state.execution.current().cloned() else {
        return Ok(());
    };

    match &step.action {
        StepAction::SplitQuery { queries } => {
            // Sub-queries were drained into the pending queue at plan time;
            // the step itself just records what it produced.
            let output = json!(queries);
            finish(state, &step, StepResult::ok(&step.id, step.tag_name(), &step.desc, output), meta_for(&step, None));
        }
        StepAction::SerialCallAgent { .. } => run_serial(state, ctx, &step).await,
        StepAction::ParallelCallAgent { .. } => run_parallel(state, ctx, &step).await,
        StepAction::DispatchByIntent => run_dispatch_by_intent(state, ctx, &step).await,
        StepAction::AppendHistory { payload_ref } => {
            let payload_ref = payload_ref.clone();
            run_append_history(state, &step, &payload_ref);
        }
        StepAction::FinalOutput { input } => {
            let input = input.clone();
            run_final_output(state, &step, &input);
        }
        StepAction::Unknown { tag } => {
            // Policy for unknown tags: leave the cursor alone and let the
            // evaluator surface whatever the plan produced so far.
            warn!(step = %step.id, tag = %tag, "unknown step tag, not executing");
            state
                .trace
                .add_text(format!("未知步骤类型 {tag}，已停止执行"));
        }
    }
    Ok(())
}

fn meta_for(step: &Step, status: Option<StepStatus>) -> ResultMeta {
    ResultMeta {
        tag: step.tag_name().to_string(),
        status,
        ..Default::default()
    }
}

/// Record the result, mirror its metadata, advance the cursor, trace
fn finish(state: &mut EngineState, step: &Step, result: StepResult, mut meta: ResultMeta) {
    meta.status = Some(result.status);
    state.execution.record(result, meta);
    state
        .trace
        .add_text(format!("Finish {} -> #{}", step.desc, step.id));
}

async fn run_serial(state: &mut EngineState, ctx: &EngineContext, step: &Step) {
    let Some(route) = state.route.take() else {
        finish(
            state,
            step,
            StepResult::fail(&step.id, step.tag_name(), &step.desc, "route not prepared"),
            meta_for(step, None),
        );
        return;
    };

    let mut meta = meta_for(step, None);
    meta.agent = route.agent.clone();
    meta.query = route.query.clone();

    if route.agent == OTHERS_AGENT {
        // "others" is the classifier's way of saying no agent applies.
        state.eval_status = Some(EvalStatus::Done);
        finish(
            state,
            step,
            StepResult::skipped(&step.id, step.tag_name(), &step.desc),
            meta,
        );
        return;
    }

    if !ctx.registry.contains(&route.agent) {
        state.eval_status = Some(EvalStatus::Failed);
        finish(
            state,
            step,
            StepResult::fail(
                &step.id,
                step.tag_name(),
                &step.desc,
                format!("agent not registered: {}", route.agent),
            ),
            meta,
        );
        return;
    }

    let result = if state.is_streaming() {
        dispatch_streaming(ctx, step, &route, ctx.raw_sink.as_ref()).await
    } else {
        dispatch_plain(&ctx.registry, step, &route).await
    };
    finish(state, step, result, meta);
}

async fn dispatch_plain(registry: &AgentRegistry, step: &Step, route: &Route) -> StepResult {
    let entry = match registry.get(&route.agent) {
        Some(entry) => entry,
        None => {
            return StepResult::fail(
                &step.id,
                step.tag_name(),
                &step.desc,
                format!("agent not registered: {}", route.agent),
            )
        }
    };
    match entry.executor.execute(route.payload.clone()).await {
        Ok(body) => match normalize_result(body) {
            NormalizedResult::Ok(output) => {
                StepResult::ok(&step.id, step.tag_name(), &step.desc, output)
            }
            NormalizedResult::Fail { error, body } => StepResult {
                id: step.id.clone(),
                tag: step.tag_name().to_string(),
                desc: step.desc.clone(),
                status: StepStatus::Fail,
                error,
                output: body,
            },
        },
        Err(e) => StepResult::fail(&step.id, step.tag_name(), &step.desc, e.to_string()),
    }
}

async fn dispatch_streaming(
    ctx: &EngineContext,
    step: &Step,
    route: &Route,
    sink: Option<&RawFrameSink>,
) -> StepResult {
    let entry = match ctx.registry.get(&route.agent) {
        Some(entry) => entry,
        None => {
            return StepResult::fail(
                &step.id,
                step.tag_name(),
                &step.desc,
                format!("agent not registered: {}", route.agent),
            )
        }
    };
    match entry.executor.stream(route.payload.clone()).await {
        Ok(frames) => {
            let frames = collect_frames(frames, sink).await;
            StepResult::ok(
                &step.id,
                step.tag_name(),
                &step.desc,
                wrap_raw_events(frames),
            )
        }
        Err(e) => StepResult::fail(&step.id, step.tag_name(), &step.desc, e.to_string()),
    }
}

async fn collect_frames(mut frames: FrameStream, sink: Option<&RawFrameSink>) -> Vec<Value> {
    let mut collected = Vec::new();
    while let Some(frame) = frames.next().await {
        if let Some(sink) = sink {
            sink(&frame);
        }
        collected.push(frame);
    }
    collected
}

async fn run_parallel(state: &mut EngineState, ctx: &EngineContext, step: &Step) {
    let routes = state.routes.take().unwrap_or_default();
    if routes.is_empty() {
        finish(
            state,
            step,
            StepResult::fail(&step.id, step.tag_name(), &step.desc, "route not prepared"),
            meta_for(step, None),
        );
        return;
    }

    let items: Vec<Value> = if state.is_streaming() {
        // Streams cannot be multiplexed into one trace; degrade to
        // sequential execution.
        state.trace.add_text(TRACE_STREAM_SEQUENTIAL);
        let mut items = Vec::with_capacity(routes.len());
        for route in &routes {
            items.push(dispatch_route_streaming(ctx, route, ctx.raw_sink.as_ref()).await);
        }
        items
    } else {
        let concurrency = routes.len().min(MAX_PARALLEL_ROUTES);
        let trace = Arc::clone(&state.trace);
        let registry = Arc::clone(&ctx.registry);
        let mut indexed: Vec<(usize, Value)> =
            futures::stream::iter(routes.iter().cloned().enumerate())
                .map(|(idx, route)| {
                    let registry = Arc::clone(&registry);
                    let trace = Arc::clone(&trace);
                    async move {
                        let item = dispatch_route(registry.as_ref(), &route).await;
                        // Completion-order note; outputs are re-ordered below.
                        trace.add_text(format!("完成并行调用 {}", route.agent));
                        (idx, item)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, item)| item).collect()
    };

    let meta_items: Vec<MetaItem> = routes
        .iter()
        .zip(items.iter())
        .map(|(route, item)| MetaItem {
            agent: route.agent.clone(),
            query: route.query.clone(),
            status: item_status(item),
        })
        .collect();
    let mut meta = meta_for(step, None);
    meta.items = meta_items;

    finish(
        state,
        step,
        StepResult::ok(&step.id, step.tag_name(), &step.desc, Value::Array(items)),
        meta,
    );
}

fn item_status(item: &Value) -> Option<StepStatus> {
    match item.get("status").and_then(Value::as_str) {
        Some("ok") => Some(StepStatus::Ok),
        Some("fail") => Some(StepStatus::Fail),
        Some("skipped") => Some(StepStatus::Skipped),
        _ => None,
    }
}

/// Dispatch one route of a parallel group; failures stay in the item
async fn dispatch_route(registry: &AgentRegistry, route: &Route) -> Value {
    if route.agent == OTHERS_AGENT {
        return json!({
            "agent": route.agent,
            "query": route.query,
            "status": "skipped",
        });
    }
    let Some(entry) = registry.get(&route.agent) else {
        return json!({
            "agent": route.agent,
            "query": route.query,
            "status": "fail",
            "error": "agent not registered",
        });
    };
    match entry.executor.execute(route.payload.clone()).await {
        Ok(body) => match normalize_result(body) {
            NormalizedResult::Ok(output) => json!({
                "agent": route.agent,
                "query": route.query,
                "status": "ok",
                "output": output,
            }),
            NormalizedResult::Fail { error, body } => json!({
                "agent": route.agent,
                "query": route.query,
                "status": "fail",
                "error": error,
                "output": body,
            }),
        },
        Err(e) => json!({
            "agent": route.agent,
            "query": route.query,
            "status": "fail",
            "error": e.to_string(),
        }),
    }
}

async fn dispatch_route_streaming(
    ctx: &EngineContext,
    route: &Route,
    sink: Option<&RawFrameSink>,
) -> Value {
    if route.agent == OTHERS_AGENT {
        return json!({
            "agent": route.agent,
            "query": route.query,
            "status": "skipped",
        });
    }
    let Some(entry) = ctx.registry.get(&route.agent) else {
        return json!({
            "agent": route.agent,
            "query": route.query,
            "status": "fail",
            "error": "agent not registered",
        });
    };
    match entry.executor.stream(route.payload.clone()).await {
        Ok(frames) => {
            let frames = collect_frames(frames, sink).await;
            json!({
                "agent": route.agent,
                "query": route.query,
                "status": "ok",
                "output": wrap_raw_events(frames),
            })
        }
        Err(e) => json!({
            "agent": route.agent,
            "query": route.query,
            "status": "fail",
            "error": e.to_string(),
        }),
    }
}

async fn run_dispatch_by_intent(state: &mut EngineState, ctx: &EngineContext, step: &Step) {
    let intent = state.working_input.intent.clone();
    let Some(agent) = ctx.registry.select_by_intent(&intent).map(String::from) else {
        debug!(intent = %intent, "no agent serves this intent");
        finish(
            state,
            step,
            StepResult::ok(
                &step.id,
                step.tag_name(),
                &step.desc,
                json!({"status": "no_agent", "intent": intent}),
            ),
            meta_for(step, None),
        );
        return;
    };

    let base = state.working_input.to_value();
    let payload = match ctx.registry.get(&agent).and_then(|e| e.payload_builder.clone()) {
        Some(builder) => builder(&base, &state.slots),
        None => default_payload_builder(&base, &state.slots),
    };
    let route = Route {
        agent: agent.clone(),
        payload,
        query: state.working_input.query.clone(),
        intent,
    };

    let mut meta = meta_for(step, None);
    meta.agent = agent;
    meta.query = route.query.clone();
    let result = dispatch_plain(&ctx.registry, step, &route).await;
    finish(state, step, result, meta);
}

fn run_append_history(state: &mut EngineState, step: &Step, payload_ref: &str) {
    let resolved = resolve::resolve_str(payload_ref, &state.working_input, &state.execution.results);

    let user_text = state
        .active_query
        .clone()
        .unwrap_or_else(|| state.working_input.query.clone());
    let assistant_text = crate::stream::payload_text(&resolved, HISTORY_TEXT_LIMIT);

    if !user_text.is_empty() {
        state
            .working_input
            .history
            .push(crate::state::HistoryTurn::user(user_text));
    }
    if !assistant_text.is_empty() {
        state
            .working_input
            .history
            .push(crate::state::HistoryTurn::assistant(assistant_text));
    }

    finish(
        state,
        step,
        StepResult::ok(&step.id, step.tag_name(), &step.desc, resolved),
        meta_for(step, None),
    );
}

fn run_final_output(state: &mut EngineState, step: &Step, input: &str) {
    let resolved = resolve::resolve_str(input, &state.working_input, &state.execution.results);
    state.result = resolved.clone();
    finish(
        state,
        step,
        StepResult::ok(&step.id, step.tag_name(), &step.desc, resolved),
        meta_for(step, None),
    );
}
