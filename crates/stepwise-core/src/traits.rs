use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::data::AccumulatedData;
use crate::error::Result;
use crate::types::*;

/// An external capability invoked with resolved parameters.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (matches the schema and plan entries).
    fn name(&self) -> &str;

    /// Invoke the tool. May block on network or browser I/O.
    fn invoke(
        &self,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<RawResult>>;

    /// Whether a transient failure may be retried without side effects.
    fn retry_safe(&self) -> bool {
        true
    }

    /// Timeout the tool itself declares, used when neither the subtask,
    /// config nor schema sets one.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Produces and revises plans. Its output is untrusted.
pub trait Planner: Send + Sync + 'static {
    /// Decompose a task description into a plan.
    fn plan<'a>(
        &'a self,
        task_description: &'a str,
        context: &'a PlanningContext,
    ) -> BoxFuture<'a, Result<Plan>>;

    /// Revise the remaining plan after a subtask failed.
    fn replan<'a>(
        &'a self,
        failure: &'a FailureContext,
        data: &'a AccumulatedData,
    ) -> BoxFuture<'a, Result<ReplanDecision>>;

    /// Adaptive mode: choose exactly the next subtask, or finish.
    fn next_step<'a>(
        &'a self,
        task_description: &'a str,
        data: &'a AccumulatedData,
        last: Option<&'a Observation>,
    ) -> BoxFuture<'a, Result<NextStep>>;
}

/// Turns accumulated outputs into the answer text.
///
/// Invoked once when plan execution ends, on success or bounded partial
/// failure. `gaps` lists every disclosed shortfall.
pub trait Synthesizer: Send + Sync + 'static {
    fn summarize<'a>(
        &'a self,
        task_description: &'a str,
        data: &'a AccumulatedData,
        gaps: &'a [Gap],
    ) -> BoxFuture<'a, Result<String>>;
}
