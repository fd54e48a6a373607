//! State-machine nodes
//!
//! One module per node of the execution graph. Nodes mutate the
//! [`EngineState`](crate::state::EngineState) in place; the driver in
//! [`engine`](crate::engine) owns the transitions between them.

mod evaluator;
mod planner;
mod replanner;
mod router;
mod worker;

pub(crate) use evaluator::run_evaluator;
pub(crate) use planner::run_planner;
pub(crate) use replanner::run_replanner;
pub(crate) use router::run_router;
pub(crate) use worker::run_worker;

/// Fixed user-visible trace strings
pub(crate) const TRACE_PLANNING: &str = "正在为您规划任务";
pub(crate) const TRACE_REPLANNING: &str = "正在为您重新规划任务";
pub(crate) const TRACE_AGENT_FAILED: &str = "智能体返回错误，正在为您重新处理任务";
pub(crate) const TRACE_DONE: &str = "已经成功处理任务，正在为您整合答案";
pub(crate) const TRACE_NEXT_QUERY: &str = "正在为您处理下一个问题";
pub(crate) const TRACE_EXHAUSTED: &str =
    "任务请求尝试次数超限，处理失败。十分抱歉未能处理您的问题，如果需要请联系人工客服处理。";
pub(crate) const TRACE_STREAM_SEQUENTIAL: &str = "流式输出下并行任务将顺序执行";
