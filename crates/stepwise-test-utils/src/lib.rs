//! Scripted tools, planners, and synthesizers for exercising the engine
//! without network access.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use stepwise_core::config::StepwiseConfig;
use stepwise_core::data::AccumulatedData;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{Planner, Synthesizer, Tool};
use stepwise_core::types::*;

// ── Tool ────────────────────────────────────────────────────────────

/// One scripted tool outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(RawResult),
    Transient(String),
    Permanent(String),
    /// A generic I/O error; the executor classifies it by message.
    Io(String),
    /// Never returns; the executor's timeout must fire.
    Hang,
}

#[derive(Default)]
struct ToolScript {
    steps: VecDeque<Step>,
    otherwise: Option<Step>,
    calls: Vec<Map<String, Value>>,
}

/// A tool that replays queued outcomes and records every invocation.
///
/// Clones share the same script, so a test can register one clone and
/// inspect calls through another.
#[derive(Clone)]
pub struct ScriptedTool {
    name: String,
    retry_safe: bool,
    script: Arc<Mutex<ToolScript>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_safe: true,
            script: Arc::new(Mutex::new(ToolScript::default())),
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.lock().steps.push_back(step);
        self
    }

    pub fn then_ok(self, raw: RawResult) -> Self {
        self.then(Step::Ok(raw))
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(Step::Ok(RawResult::text(text)))
    }

    pub fn then_records(self, records: Vec<Value>) -> Self {
        self.then(Step::Ok(RawResult::records(
            records.iter().map(record).collect(),
        )))
    }

    pub fn then_transient(self, message: impl Into<String>) -> Self {
        self.then(Step::Transient(message.into()))
    }

    pub fn then_permanent(self, message: impl Into<String>) -> Self {
        self.then(Step::Permanent(message.into()))
    }

    pub fn then_hang(self) -> Self {
        self.then(Step::Hang)
    }

    /// Outcome used once the queue is empty.
    pub fn otherwise(self, step: Step) -> Self {
        self.lock().otherwise = Some(step);
        self
    }

    pub fn otherwise_records(self, records: Vec<Value>) -> Self {
        self.otherwise(Step::Ok(RawResult::records(
            records.iter().map(record).collect(),
        )))
    }

    pub fn otherwise_transient(self, message: impl Into<String>) -> Self {
        self.otherwise(Step::Transient(message.into()))
    }

    pub fn not_retry_safe(mut self) -> Self {
        self.retry_safe = false;
        self
    }

    /// Parameters of every invocation, in order.
    pub fn calls(&self) -> Vec<Map<String, Value>> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ToolScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_step(&self, params: Map<String, Value>) -> Option<Step> {
        let mut script = self.lock();
        script.calls.push(params);
        script.steps.pop_front().or_else(|| script.otherwise.clone())
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        params: Map<String, Value>,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<RawResult>> {
        let step = self.next_step(params);
        let name = self.name.clone();
        Box::pin(async move {
            match step {
                Some(Step::Ok(raw)) => Ok(raw),
                Some(Step::Transient(message)) => {
                    Err(StepwiseError::TransientTool { tool: name, message })
                }
                Some(Step::Permanent(message)) => {
                    Err(StepwiseError::PermanentTool { tool: name, message })
                }
                Some(Step::Io(message)) => Err(StepwiseError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    message,
                ))),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    Err(StepwiseError::PermanentTool {
                        tool: name,
                        message: "hang elapsed".into(),
                    })
                }
                None => Err(StepwiseError::PermanentTool {
                    tool: name,
                    message: "script exhausted".into(),
                }),
            }
        })
    }

    fn retry_safe(&self) -> bool {
        self.retry_safe
    }
}

// ── Planner ─────────────────────────────────────────────────────────

#[derive(Default)]
struct PlannerScript {
    plan: Option<Plan>,
    plan_error: Option<String>,
    replans: VecDeque<ReplanDecision>,
    steps: VecDeque<NextStep>,
    failures: Vec<FailureContext>,
    observations: Vec<Option<Observation>>,
    stalled: bool,
}

/// A planner returning a fixed plan and queued replan/next-step decisions.
#[derive(Clone, Default)]
pub struct ScriptedPlanner {
    script: Arc<Mutex<PlannerScript>>,
}

impl ScriptedPlanner {
    pub fn new(plan: Plan) -> Self {
        let planner = Self::default();
        planner.lock().plan = Some(plan);
        planner
    }

    /// A planner for adaptive mode, driven only by `next_step`.
    pub fn adaptive(steps: Vec<NextStep>) -> Self {
        let planner = Self::default();
        planner.lock().steps = steps.into();
        planner
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let planner = Self::default();
        planner.lock().plan_error = Some(message.into());
        planner
    }

    pub fn with_replan(self, decision: ReplanDecision) -> Self {
        self.lock().replans.push_back(decision);
        self
    }

    /// `replan` and `next_step` record their inputs, then never return.
    pub fn stalled(self) -> Self {
        self.lock().stalled = true;
        self
    }

    /// Failures the engine reported, in order.
    pub fn failures(&self) -> Vec<FailureContext> {
        self.lock().failures.clone()
    }

    /// The `last` observation passed to every `next_step` call.
    pub fn observations(&self) -> Vec<Option<Observation>> {
        self.lock().observations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlannerScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Planner for ScriptedPlanner {
    fn plan<'a>(
        &'a self,
        _task_description: &'a str,
        _context: &'a PlanningContext,
    ) -> BoxFuture<'a, Result<Plan>> {
        let script = self.lock();
        let result = match (&script.plan_error, &script.plan) {
            (Some(msg), _) => Err(StepwiseError::Planner(msg.clone())),
            (None, Some(plan)) => Ok(plan.clone()),
            (None, None) => Ok(Plan::new("", vec![])),
        };
        drop(script);
        Box::pin(async move { result })
    }

    fn replan<'a>(
        &'a self,
        failure: &'a FailureContext,
        _data: &'a AccumulatedData,
    ) -> BoxFuture<'a, Result<ReplanDecision>> {
        let mut script = self.lock();
        script.failures.push(failure.clone());
        if script.stalled {
            return Box::pin(futures::future::pending::<Result<ReplanDecision>>());
        }
        let decision = script
            .replans
            .pop_front()
            .unwrap_or_else(|| ReplanDecision::Irrecoverable {
                reason: "no replan scripted".into(),
            });
        drop(script);
        Box::pin(async move { Ok(decision) })
    }

    fn next_step<'a>(
        &'a self,
        _task_description: &'a str,
        _data: &'a AccumulatedData,
        last: Option<&'a Observation>,
    ) -> BoxFuture<'a, Result<NextStep>> {
        let mut script = self.lock();
        script.observations.push(last.cloned());
        if script.stalled {
            return Box::pin(futures::future::pending::<Result<NextStep>>());
        }
        let step = script.steps.pop_front().unwrap_or(NextStep::Done);
        drop(script);
        Box::pin(async move { Ok(step) })
    }
}

// ── Synthesizer ─────────────────────────────────────────────────────

/// What the synthesizer was shown.
#[derive(Debug, Clone)]
pub struct SynthesisCall {
    pub task_description: String,
    pub data: AccumulatedData,
    pub gaps: Vec<Gap>,
}

/// A synthesizer that records its inputs and reports record totals.
#[derive(Clone, Default)]
pub struct RecordingSynthesizer {
    calls: Arc<Mutex<Vec<SynthesisCall>>>,
    fail: bool,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SynthesisCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Synthesizer for RecordingSynthesizer {
    fn summarize<'a>(
        &'a self,
        task_description: &'a str,
        data: &'a AccumulatedData,
        gaps: &'a [Gap],
    ) -> BoxFuture<'a, Result<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SynthesisCall {
                task_description: task_description.to_string(),
                data: data.clone(),
                gaps: gaps.to_vec(),
            });
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(StepwiseError::Synthesis("synthesizer unavailable".into()));
            }
            Ok(format!(
                "{} entries, {} gaps",
                data.len(),
                gaps.len()
            ))
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

/// Convert a JSON object literal into a record map.
pub fn record(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// `n` records with `title` and `price` fields, numbered from `start`.
pub fn numbered_records(start: usize, n: usize) -> Vec<Value> {
    (start..start + n)
        .map(|i| serde_json::json!({"title": format!("Item {}", i), "price": i * 10}))
        .collect()
}

/// Search-style text digest mentioning each URL once.
pub fn text_with_urls(urls: &[&str]) -> String {
    let mut text = String::from("Search results:");
    for (i, url) in urls.iter().enumerate() {
        text.push_str(&format!(" [{}] {} ", i + 1, url));
    }
    text.push_str("(end of results)");
    text
}

/// Config with short, jitter-free backoff for fast deterministic tests.
pub fn test_config() -> StepwiseConfig {
    let mut config = StepwiseConfig::default();
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 1_000;
    config.retry.jitter = false;
    config
}

/// A fresh temporary directory for logs or config files.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|e| panic!("failed to create temp dir: {}", e))
}
