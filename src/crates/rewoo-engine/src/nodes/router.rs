//! Router node
//!
//! Prepares dispatch routes for the step at the cursor without advancing
//! it. A serial call yields one route; a parallel group yields an ordered
//! route list, consuming pending sub-queries as it goes. Every routed
//! query is classified into an intent tag before dispatch.

use crate::context::EngineContext;
use crate::plan::{CallConfig, StepAction};
use crate::registry::default_payload_builder;
use crate::resolve::{self, WORKING_INPUT_REF};
use crate::state::{EngineState, Route};
use crate::Result;
use serde_json::Value;
use tracing::debug;

pub(crate) async fn run_router(state: &mut EngineState, ctx: &EngineContext) -> Result<()> {
    let Some(step) = state.execution.current().cloned() else {
        return Ok(());
    };
    match step.action {
        StepAction::SerialCallAgent { config } => route_serial(state, ctx, config).await,
        StepAction::ParallelCallAgent { configs } => route_parallel(state, ctx, configs).await,
        // Every other tag is handled by the worker directly.
        _ => Ok(()),
    }
}

async fn route_serial(
    state: &mut EngineState,
    ctx: &EngineContext,
    config: CallConfig,
) -> Result<()> {
    let active = state
        .active_query
        .clone()
        .or_else(|| state.pending_queries.pop_front())
        .unwrap_or_else(|| state.working_input.query.clone());
    // An explicit query in the call config overrides the active query.
    let active = config.query.clone().unwrap_or(active);

    state.active_query = Some(active.clone());
    state.working_input.query = active.clone();

    let intent = ctx
        .classifier
        .classify(
            &active,
            &state.working_input.history,
            &state.working_input.prev_intent,
        )
        .await?;
    state.working_input.intent = intent.clone();

    let payload = build_route_payload(state, ctx, &config, &active);
    state
        .trace
        .add_text(format!("Router: query = {active}, intent = {intent}"));
    debug!(agent = %config.agent, intent = %intent, "serial route prepared");

    state.route = Some(Route {
        agent: config.agent,
        payload,
        query: active,
        intent,
    });
    Ok(())
}

async fn route_parallel(
    state: &mut EngineState,
    ctx: &EngineContext,
    configs: Vec<CallConfig>,
) -> Result<()> {
    let mut routes = Vec::with_capacity(configs.len());
    for config in configs {
        let query = match &config.query {
            Some(q) => q.clone(),
            None => state
                .pending_queries
                .pop_front()
                .or_else(|| state.active_query.clone())
                .unwrap_or_else(|| state.working_input.query.clone()),
        };
        let intent = ctx
            .classifier
            .classify(
                &query,
                &state.working_input.history,
                &state.working_input.prev_intent,
            )
            .await?;
        let payload = build_route_payload(state, ctx, &config, &query);
        state
            .trace
            .add_text(format!("Router: query = {query}, intent = {intent}"));
        routes.push(Route {
            agent: config.agent,
            payload,
            query,
            intent,
        });
    }
    debug!(routes = routes.len(), "parallel routes prepared");
    state.pending_queries.clear();
    state.routes = Some(routes);
    Ok(())
}

/// Build the dispatch payload for one call config
///
/// The base payload is the working input with the routed query patched in.
/// A `#Ek` input replaces the payload wholesale; a mapping input is merged
/// over the base; anything else goes through the agent's payload builder
/// untouched.
fn build_route_payload(
    state: &EngineState,
    ctx: &EngineContext,
    config: &CallConfig,
    query: &str,
) -> Value {
    let mut base = state
        .working_input
        .to_value()
        .as_object()
        .cloned()
        .unwrap_or_default();
    base.insert("query".to_string(), Value::String(query.to_string()));
    let base = Value::Object(base);

    let builder = ctx
        .registry
        .get(&config.agent)
        .and_then(|entry| entry.payload_builder.clone());
    let apply = |value: &Value| match &builder {
        Some(builder) => builder(value, &state.slots),
        None => default_payload_builder(value, &state.slots),
    };

    match &config.input {
        Some(Value::String(s)) if s == WORKING_INPUT_REF => apply(&base),
        Some(Value::String(s)) if resolve::is_step_ref(s) => {
            resolve::resolve_str(s, &state.working_input, &state.execution.results)
        }
        Some(input @ Value::Object(_)) => {
            let resolved = resolve::resolve(input, &state.working_input, &state.execution.results);
            let mut merged = base.as_object().cloned().unwrap_or_default();
            if let Some(fields) = resolved.as_object() {
                for (key, value) in fields {
                    merged.insert(key.clone(), value.clone());
                }
            }
            apply(&Value::Object(merged))
        }
        _ => apply(&base),
    }
}
