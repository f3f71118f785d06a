use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepwise_core::config::StepwiseConfig;
use stepwise_core::data::{AccumulatedData, Entry};
use stepwise_core::error::StepwiseError;
use stepwise_core::event::EventBus;
use stepwise_core::reference::templates_in_value;
use stepwise_core::schema::ToolSchema;
use stepwise_core::traits::{Planner, Synthesizer, Tool};
use stepwise_core::types::*;
use stepwise_tools::{AttemptNotice, Executor, Invocation, SchemaRegistry, ToolRegistry, ToolRun};

use crate::evaluator::CompletenessEvaluator;
use crate::follow_up::FollowUpPlanner;
use crate::resolver::{DataFlowResolver, ResolvedParameters};
use crate::validate::PlanValidator;

/// How a task's plan is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// The Planner produces the whole plan upfront.
    #[default]
    Sequential,
    /// The Planner is asked for one subtask at a time.
    Adaptive,
}

/// Everything a finished task leaves behind.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub answer: FinalAnswer,
    pub data: AccumulatedData,
    /// Every subtask the task ran or considered, with its final status.
    pub subtasks: Vec<SubtaskSpec>,
    pub elapsed_ms: u64,
}

type InFlight = BoxFuture<'static, (String, std::result::Result<ToolRun, JoinError>)>;

enum Readiness {
    Ready,
    Waiting,
    Blocked(String),
}

/// Drives plans through resolution, execution, evaluation and commit.
///
/// The engine itself is stateless between tasks; every task gets its own
/// plan, data and follow-up counters.
pub struct ExecutionEngine {
    config: StepwiseConfig,
    schemas: Arc<SchemaRegistry>,
    tools: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    synthesizer: Arc<dyn Synthesizer>,
    event_bus: Arc<EventBus>,
    executor: Arc<Executor>,
    resolver: DataFlowResolver,
    evaluator: CompletenessEvaluator,
}

impl ExecutionEngine {
    pub fn new(
        config: StepwiseConfig,
        tools: ToolRegistry,
        planner: Arc<dyn Planner>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let schemas = Arc::new(SchemaRegistry::from_config(&config));
        let executor =
            Arc::new(Executor::new(config.retry.clone()).with_event_bus(Arc::clone(&event_bus)));
        let evaluator = CompletenessEvaluator::new(config.evaluator.clone());
        Self {
            config,
            schemas,
            tools: Arc::new(tools),
            planner,
            synthesizer,
            event_bus,
            executor,
            resolver: DataFlowResolver::new(),
            evaluator,
        }
    }

    /// Replace the schema catalog built from config.
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }

    /// Share an event bus with other components (loggers, UIs).
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.executor = Arc::new(
            Executor::new(self.config.retry.clone()).with_event_bus(Arc::clone(&event_bus)),
        );
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &StepwiseConfig {
        &self.config
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Tools that have both a schema and an implementation.
    pub fn available_tools(&self) -> Vec<String> {
        self.tools
            .list()
            .into_iter()
            .filter(|t| self.schemas.contains(t))
            .map(String::from)
            .collect()
    }

    /// Plan and execute a task.
    pub async fn run_task(
        &self,
        task_id: TaskId,
        description: &str,
        mode: Mode,
        cancel: CancellationToken,
    ) -> TaskReport {
        if mode == Mode::Adaptive {
            return self.run_adaptive(task_id, description, cancel).await;
        }

        let context = PlanningContext {
            task_id: task_id.clone(),
            available_tools: self.available_tools(),
        };
        match self.planner.plan(description, &context).await {
            Ok(plan) => self.execute_plan(task_id, description, plan, cancel).await,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Planner failed to produce a plan");
                let mut run = TaskRun::new(self, task_id, description, cancel);
                run.started();
                run.failure = Some(e.to_string());
                run.finish().await
            }
        }
    }

    /// Execute an already-produced plan.
    pub async fn execute_plan(
        &self,
        task_id: TaskId,
        description: &str,
        mut plan: Plan,
        cancel: CancellationToken,
    ) -> TaskReport {
        let mut run = TaskRun::new(self, task_id, description, cancel);
        run.started();

        let validator = PlanValidator::new(&self.schemas).with_tools(&self.tools);
        if let Err(e) = validator.validate_plan(&mut plan, &HashSet::new()) {
            warn!(task_id = %run.task_id, error = %e, "Rejected plan");
            run.failure = Some(e.to_string());
            return run.finish().await;
        }

        let ceiling = self.config.engine.max_subtasks;
        if plan.subtasks.len() > ceiling {
            run.note(format!(
                "plan truncated to max_subtasks ({}) of {} subtasks",
                ceiling,
                plan.subtasks.len()
            ));
            plan.subtasks.truncate(ceiling);
        }
        info!(
            task_id = %run.task_id,
            plan_id = %plan.id,
            subtasks = plan.subtasks.len(),
            "Executing plan"
        );
        run.subtasks = plan.subtasks;
        run.drive().await;
        run.finish().await
    }

    /// Ask the Planner for one subtask at a time until it is done or a
    /// ceiling is reached.
    pub async fn run_adaptive(
        &self,
        task_id: TaskId,
        description: &str,
        cancel: CancellationToken,
    ) -> TaskReport {
        let mut run = TaskRun::new(self, task_id, description, cancel.clone());
        run.started();
        let validator = PlanValidator::new(&self.schemas).with_tools(&self.tools);
        let max_iterations = self.config.engine.max_iterations;
        let mut iterations = 0;

        loop {
            if run.cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }
            if run.failure.is_some() {
                break;
            }
            if iterations >= max_iterations {
                run.note(format!("adaptive iteration ceiling ({}) reached", max_iterations));
                break;
            }
            if run.subtasks.len() >= self.config.engine.max_subtasks {
                run.note(format!(
                    "max_subtasks ({}) reached",
                    self.config.engine.max_subtasks
                ));
                break;
            }
            iterations += 1;

            let step = tokio::select! {
                _ = cancel.cancelled() => {
                    run.cancelled = true;
                    break;
                }
                step = self.planner.next_step(&run.description, &run.data, run.last.as_ref()) => step,
            };
            match step {
                Ok(NextStep::Done) => {
                    info!(task_id = %run.task_id, iterations, "Planner finished adaptive task");
                    break;
                }
                Ok(NextStep::Subtask { mut subtask }) => {
                    match validator.validate_subtask(&mut subtask, &run.ids()) {
                        Ok(()) => {
                            debug!(
                                task_id = %run.task_id,
                                subtask = %subtask.id,
                                tool = %subtask.tool,
                                iteration = iterations,
                                "Adaptive step"
                            );
                            run.subtasks.push(subtask);
                            run.drive().await;
                        }
                        Err(e) => {
                            run.last = Some(Observation {
                                subtask_id: subtask.id,
                                tool: subtask.tool,
                                status: SubtaskStatus::Skipped,
                                report: None,
                                error: Some(e.to_string()),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(task_id = %run.task_id, error = %e, "Planner failed during adaptive step");
                    run.failure = Some(e.to_string());
                    break;
                }
            }
        }

        run.finish().await
    }

    fn timeout_for(&self, subtask: &SubtaskSpec, schema: &ToolSchema, tool: &dyn Tool) -> Duration {
        subtask
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.config.timeouts.for_tool(&subtask.tool))
            .or_else(|| schema.timeout_secs.map(Duration::from_secs))
            .or_else(|| tool.timeout_secs().map(Duration::from_secs))
            .unwrap_or_else(|| self.config.timeouts.default_timeout())
    }
}

/// Per-task mutable state. Only the coordinating loop touches it.
struct TaskRun<'a> {
    engine: &'a ExecutionEngine,
    task_id: TaskId,
    description: String,
    cancel: CancellationToken,
    started: Instant,
    subtasks: Vec<SubtaskSpec>,
    data: AccumulatedData,
    follow_ups: FollowUpPlanner,
    resolved: HashMap<String, ResolvedParameters>,
    errors: HashMap<String, String>,
    superseded: HashSet<String>,
    replans: usize,
    /// Ceilings that cut execution short.
    notes: Vec<String>,
    /// Set when the task cannot continue (planner gave up or failed).
    failure: Option<String>,
    last: Option<Observation>,
    cancelled: bool,
}

impl<'a> TaskRun<'a> {
    fn new(
        engine: &'a ExecutionEngine,
        task_id: TaskId,
        description: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            task_id,
            description: description.to_string(),
            cancel,
            started: Instant::now(),
            subtasks: vec![],
            data: AccumulatedData::new(),
            follow_ups: FollowUpPlanner::new(engine.config.engine.max_follow_ups),
            resolved: HashMap::new(),
            errors: HashMap::new(),
            superseded: HashSet::new(),
            replans: 0,
            notes: vec![],
            failure: None,
            last: None,
            cancelled: false,
        }
    }

    fn started(&self) {
        info!(task_id = %self.task_id, "Task started");
        self.engine.event_bus.publish(TaskEvent::TaskStarted {
            task_id: self.task_id.clone(),
            description: self.description.clone(),
        });
    }

    fn note(&mut self, note: String) {
        warn!(task_id = %self.task_id, "{}", StepwiseError::PlanExhausted(note.clone()));
        self.notes.push(note);
    }

    fn ids(&self) -> HashSet<String> {
        self.subtasks.iter().map(|s| s.id.clone()).collect()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.subtasks.iter().position(|s| s.id == id)
    }

    fn has_room(&self) -> bool {
        self.subtasks.len() < self.engine.config.engine.max_subtasks
    }

    fn set_status(&mut self, idx: usize, status: SubtaskStatus, preview: Option<String>) {
        let subtask = &mut self.subtasks[idx];
        subtask.status = status;
        debug!(
            task_id = %self.task_id,
            subtask_id = %subtask.id,
            tool = %subtask.tool,
            status = %status,
            "Subtask status"
        );
        self.engine.event_bus.publish(TaskEvent::SubtaskStatusChanged {
            task_id: self.task_id.clone(),
            subtask_id: subtask.id.clone(),
            tool: subtask.tool.clone(),
            status,
            preview,
        });
    }

    fn skip(&mut self, idx: usize, reason: String) {
        info!(
            task_id = %self.task_id,
            subtask_id = %self.subtasks[idx].id,
            reason = %reason,
            "Skipping subtask"
        );
        self.errors.insert(self.subtasks[idx].id.clone(), reason);
        self.set_status(idx, SubtaskStatus::Skipped, None);
    }

    fn observe(&mut self, idx: usize, report: Option<CompletenessReport>) {
        let subtask = &self.subtasks[idx];
        self.last = Some(Observation {
            subtask_id: subtask.id.clone(),
            tool: subtask.tool.clone(),
            status: subtask.status,
            report,
            error: self.errors.get(&subtask.id).cloned(),
        });
    }

    /// Run ready subtasks until nothing more can start or finish.
    async fn drive(&mut self) {
        let engine_config = &self.engine.config.engine;
        let limit = if engine_config.parallel {
            engine_config.max_concurrency.max(1)
        } else {
            1
        };
        let sequential = !engine_config.parallel;
        let cancel = self.cancel.clone();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let (notice_tx, mut notices) = mpsc::unbounded_channel();

        loop {
            if cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            if self.failure.is_none() {
                while in_flight.len() < limit {
                    let Some(idx) = self.next_ready(sequential) else {
                        break;
                    };
                    if let Some(job) = self.start(idx, &notice_tx).await {
                        in_flight.push(job);
                    }
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancelled = true;
                    break;
                }
                Some(notice) = notices.recv() => self.attempt(notice),
                Some((id, joined)) = in_flight.next() => {
                    self.complete(&id, joined).await;
                }
            }
        }

        if self.cancelled {
            // In-flight executors watch the same token and return promptly.
            while in_flight.next().await.is_some() {}
            for idx in 0..self.subtasks.len() {
                if !self.subtasks[idx].status.is_settled()
                    && self.subtasks[idx].status != SubtaskStatus::Pending
                {
                    self.errors
                        .insert(self.subtasks[idx].id.clone(), "cancelled".into());
                    self.set_status(idx, SubtaskStatus::Failed, None);
                }
            }
        }
    }

    /// First pending subtask whose dependencies allow it to start.
    ///
    /// Pending subtasks whose hard dependencies can never be met are skipped
    /// on the way.
    fn next_ready(&mut self, sequential: bool) -> Option<usize> {
        for idx in 0..self.subtasks.len() {
            if self.subtasks[idx].status != SubtaskStatus::Pending {
                continue;
            }
            match self.readiness(idx) {
                Readiness::Ready => return Some(idx),
                Readiness::Blocked(reason) => self.skip(idx, reason),
                Readiness::Waiting if sequential => return None,
                Readiness::Waiting => {}
            }
        }
        None
    }

    fn readiness(&self, idx: usize) -> Readiness {
        let subtask = &self.subtasks[idx];
        let mut waiting = false;

        // Explicit dependencies are hard.
        for dep in &subtask.depends_on {
            let dep = self.effective_dep(dep);
            let Some(dep_idx) = self.index_of(&dep) else {
                return Readiness::Blocked(format!("dependency '{}' does not exist", dep));
            };
            let status = self.subtasks[dep_idx].status;
            if status.is_accumulated() {
                if self.chain_open(&dep) {
                    waiting = true;
                }
            } else if status.is_settled() {
                return Readiness::Blocked(format!("dependency '{}' {}", dep, status));
            } else {
                waiting = true;
            }
        }

        // Template sources are hard once every candidate has settled.
        for source in template_sources(subtask) {
            let candidates = self.candidates(&source, idx);
            if candidates.is_empty() {
                continue;
            }
            if candidates.iter().any(|s| !s.is_settled()) {
                waiting = true;
            } else if !candidates.iter().any(|s| s.is_accumulated()) {
                return Readiness::Blocked(format!("no output from '{}'", source));
            }
        }

        // Schema sources are soft: wait for them, never skip on them.
        if let Some(schema) = self.engine.schemas.get(&subtask.tool) {
            let unsettled = schema
                .inputs
                .iter()
                .flat_map(|i| i.sources.iter())
                .any(|p| {
                    self.candidates(&p.source, idx)
                        .iter()
                        .any(|s| !s.is_settled())
                });
            if unsettled {
                waiting = true;
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Statuses of subtasks that could feed `source` for the subtask at `idx`:
    /// earlier subtasks, plus follow-ups of earlier subtasks.
    fn candidates(&self, source: &str, idx: usize) -> Vec<SubtaskStatus> {
        let earlier: HashSet<&str> = self.subtasks[..idx].iter().map(|s| s.id.as_str()).collect();
        self.subtasks
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                *i != idx
                    && (*i < idx
                        || matches!(&s.origin, Origin::FollowUp { root, .. } if earlier.contains(root.as_str())))
            })
            .filter(|(_, s)| s.id == source || s.tool == source)
            .map(|(_, s)| s.status)
            .collect()
    }

    /// Follow a dependency through any replan replacements.
    fn effective_dep(&self, id: &str) -> String {
        let mut current = id.to_string();
        for _ in 0..self.subtasks.len() {
            let replacement = self.subtasks.iter().find(
                |s| matches!(&s.origin, Origin::Replan { replaces } if *replaces == current),
            );
            match replacement {
                Some(s) => current = s.id.clone(),
                None => break,
            }
        }
        current
    }

    /// Whether a follow-up of `root` has yet to settle.
    fn chain_open(&self, root: &str) -> bool {
        self.subtasks.iter().any(|s| {
            matches!(&s.origin, Origin::FollowUp { root: r, .. } if r == root)
                && !s.status.is_settled()
        })
    }

    /// Mirror the executor's retry transitions onto the subtask status.
    fn attempt(&mut self, notice: AttemptNotice) {
        let (id, from, to) = match &notice {
            AttemptNotice::Retrying { subtask_id, .. } => {
                (subtask_id, SubtaskStatus::Running, SubtaskStatus::Retrying)
            }
            AttemptNotice::Resumed { subtask_id } => {
                (subtask_id, SubtaskStatus::Retrying, SubtaskStatus::Running)
            }
        };
        // A notice can trail the run it belongs to.
        if let Some(idx) = self.index_of(id).filter(|i| self.subtasks[*i].status == from) {
            self.set_status(idx, to, None);
        }
    }

    /// Resolve inputs and launch the tool for the subtask at `idx`.
    async fn start(
        &mut self,
        idx: usize,
        notices: &mpsc::UnboundedSender<AttemptNotice>,
    ) -> Option<InFlight> {
        let subtask = self.subtasks[idx].clone();
        self.set_status(idx, SubtaskStatus::Resolving, None);

        let schema = match self.engine.schemas.schema_for(&subtask.tool) {
            Ok(schema) => schema,
            Err(e) => {
                self.fail(idx, FailureKind::Permanent, e.to_string()).await;
                return None;
            }
        };
        let tool = match self.engine.tools.require(&subtask.tool) {
            Ok(tool) => tool,
            Err(e) => {
                self.fail(idx, FailureKind::Permanent, e.to_string()).await;
                return None;
            }
        };

        let resolved = match self.engine.resolver.resolve(&subtask, &schema, &self.data) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    task_id = %self.task_id,
                    subtask_id = %subtask.id,
                    tool = %subtask.tool,
                    error = %e,
                    "Resolution failed"
                );
                self.errors.insert(subtask.id.clone(), e.to_string());
                self.set_status(idx, SubtaskStatus::ResolutionFailed, None);
                self.observe(idx, None);
                self.escalate(idx, FailureKind::Resolution, e.to_string()).await;
                return None;
            }
        };
        self.set_status(idx, SubtaskStatus::Resolved, None);

        let timeout = self.engine.timeout_for(&subtask, &schema, tool.as_ref());
        let invocation = Invocation {
            task_id: self.task_id.clone(),
            subtask_id: subtask.id.clone(),
            timeout,
            cancel: self.cancel.child_token(),
            notices: Some(notices.clone()),
        };
        let params = resolved.values.clone();
        self.resolved.insert(subtask.id.clone(), resolved);
        self.set_status(idx, SubtaskStatus::Running, None);

        let executor = Arc::clone(&self.engine.executor);
        let handle =
            tokio::spawn(async move { executor.run(tool, schema, params, invocation).await });
        let id = subtask.id;
        Some(Box::pin(async move { (id, handle.await) }))
    }

    /// Commit a finished run, or escalate its failure.
    async fn complete(&mut self, id: &str, joined: std::result::Result<ToolRun, JoinError>) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        let run = match joined {
            Ok(run) => run,
            Err(e) => {
                error!(task_id = %self.task_id, subtask_id = %id, error = %e, "Tool task aborted");
                self.fail(idx, FailureKind::Permanent, e.to_string()).await;
                return;
            }
        };

        if let Some(err) = run.error {
            if matches!(err, StepwiseError::Cancelled) {
                self.errors.insert(id.to_string(), err.to_string());
                self.set_status(idx, SubtaskStatus::Failed, None);
                return;
            }
            let kind = if err.is_transient() {
                FailureKind::TransientExhausted
            } else {
                FailureKind::Permanent
            };
            self.fail(idx, kind, err.to_string()).await;
            return;
        }

        let subtask = self.subtasks[idx].clone();
        let schema = match self.engine.schemas.schema_for(&subtask.tool) {
            Ok(schema) => schema,
            Err(e) => {
                self.fail(idx, FailureKind::Permanent, e.to_string()).await;
                return;
            }
        };
        let resolved = self.resolved.remove(id).unwrap_or_default();
        let evaluator = &self.engine.evaluator;
        let requirement = evaluator.requirement_for(&subtask, &schema, &resolved.values);
        let report = evaluator.evaluate(&subtask, &schema, &run.result, &requirement);

        let ToolRun {
            mut result,
            extracted,
            ..
        } = run;
        let (context, truncated) = evaluator.context_view(&extracted.fields, &extracted.dynamic);
        result.metadata.truncated_fields = truncated;
        result.metadata.requested_count = report.requested_count;
        result.metadata.found_count = report.found_count;
        result.metadata.coverage = Some(report.coverage);

        let entry = Entry::new(id, subtask.tool.clone(), extracted.fields, result)
            .with_dynamic(extracted.dynamic)
            .with_context(context)
            .with_report(report.clone());
        let preview = serde_json::to_string(&entry.context)
            .ok()
            .map(|s| evaluator.preview(&s));
        if let Err(e) = self.data.commit(entry) {
            error!(task_id = %self.task_id, subtask_id = %id, error = %e, "Commit rejected");
            self.errors.insert(id.to_string(), e.to_string());
            self.set_status(idx, SubtaskStatus::Failed, None);
            return;
        }

        let chain_complete = self.follow_ups.observe(&subtask, &report).is_complete();
        let status = if chain_complete {
            SubtaskStatus::Succeeded
        } else {
            SubtaskStatus::Partial
        };
        self.set_status(idx, status, preview);
        self.observe(idx, Some(report.clone()));

        if chain_complete || report.complete {
            return;
        }
        if !self.has_room() {
            self.note(format!(
                "max_subtasks ({}) reached, no follow-up for '{}'",
                self.engine.config.engine.max_subtasks, id
            ));
            return;
        }
        let Some(mut follow_up) = self.follow_ups.next(
            &subtask,
            &schema,
            &resolved,
            &report,
            &self.data,
            &self.engine.schemas,
        ) else {
            return;
        };
        let ids = self.ids();
        if ids.contains(&follow_up.id) {
            let id = free_id(&follow_up.id, &ids);
            debug!(task_id = %self.task_id, taken = %follow_up.id, subtask_id = %id, "Follow-up id already in use");
            follow_up.id = id;
        }
        let validator = PlanValidator::new(&self.engine.schemas).with_tools(&self.engine.tools);
        if let Err(e) = validator.validate_subtask(&mut follow_up, &ids) {
            warn!(task_id = %self.task_id, subtask_id = %follow_up.id, error = %e, "Dropping follow-up");
            return;
        }
        self.engine.event_bus.publish(TaskEvent::FollowUpQueued {
            task_id: self.task_id.clone(),
            root: FollowUpPlanner::root_of(&follow_up).to_string(),
            subtask_id: follow_up.id.clone(),
            tool: follow_up.tool.clone(),
            action: report
                .suggested_next_action
                .unwrap_or(NextAction::FollowUpSameTool),
        });
        self.subtasks.push(follow_up);
    }

    async fn fail(&mut self, idx: usize, kind: FailureKind, error: String) {
        warn!(
            task_id = %self.task_id,
            subtask_id = %self.subtasks[idx].id,
            tool = %self.subtasks[idx].tool,
            kind = ?kind,
            error = %error,
            "Subtask failed"
        );
        self.errors.insert(self.subtasks[idx].id.clone(), error.clone());
        self.set_status(idx, SubtaskStatus::Failed, None);
        self.observe(idx, None);
        self.escalate(idx, kind, error).await;
    }

    /// Hand a failure to the Planner and apply its decision.
    async fn escalate(&mut self, idx: usize, kind: FailureKind, error: String) {
        let max_replans = self.engine.config.engine.max_replans;
        if self.replans >= max_replans {
            self.note(format!("replan ceiling ({}) reached", max_replans));
            return;
        }
        self.replans += 1;
        let failed = self.subtasks[idx].clone();
        self.engine.event_bus.publish(TaskEvent::ReplanRequested {
            task_id: self.task_id.clone(),
            subtask_id: failed.id.clone(),
            error: error.clone(),
        });

        let context = FailureContext {
            task_id: self.task_id.clone(),
            task_description: self.description.clone(),
            subtask: failed.clone(),
            kind,
            error,
            remaining: self
                .subtasks
                .iter()
                .filter(|s| s.status == SubtaskStatus::Pending)
                .cloned()
                .collect(),
        };
        let cancel = self.cancel.clone();
        let replanned = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task_id = %self.task_id, subtask_id = %failed.id, "Replan abandoned on cancellation");
                self.cancelled = true;
                return;
            }
            decision = self.engine.planner.replan(&context, &self.data) => decision,
        };
        let decision = match replanned {
            Ok(decision) => decision,
            Err(e) => {
                warn!(task_id = %self.task_id, subtask_id = %failed.id, error = %e, "Replan failed");
                return;
            }
        };

        let validator = PlanValidator::new(&self.engine.schemas).with_tools(&self.engine.tools);
        match decision {
            ReplanDecision::Plan { mut plan } => {
                if let Err(e) = validator.validate_plan(&mut plan, &self.ids()) {
                    warn!(task_id = %self.task_id, error = %e, "Discarding invalid replan");
                    return;
                }
                for i in 0..self.subtasks.len() {
                    if self.subtasks[i].status == SubtaskStatus::Pending {
                        self.superseded.insert(self.subtasks[i].id.clone());
                        self.skip(i, format!("superseded by replan after '{}'", failed.id));
                    }
                }
                info!(
                    task_id = %self.task_id,
                    replaces = %failed.id,
                    subtasks = plan.subtasks.len(),
                    "Applying revised plan"
                );
                for mut subtask in plan.subtasks {
                    if !self.has_room() {
                        self.note(format!(
                            "max_subtasks ({}) reached while applying replan",
                            self.engine.config.engine.max_subtasks
                        ));
                        break;
                    }
                    if subtask.origin == Origin::Planned {
                        subtask.origin = Origin::Replan {
                            replaces: failed.id.clone(),
                        };
                    }
                    self.subtasks.push(subtask);
                }
            }
            ReplanDecision::Subtask { mut subtask } => {
                if let Err(e) = validator.validate_subtask(&mut subtask, &self.ids()) {
                    warn!(task_id = %self.task_id, error = %e, "Discarding invalid replacement");
                    return;
                }
                if !self.has_room() {
                    self.note(format!(
                        "max_subtasks ({}) reached, replacement dropped",
                        self.engine.config.engine.max_subtasks
                    ));
                    return;
                }
                info!(
                    task_id = %self.task_id,
                    replaces = %failed.id,
                    subtask_id = %subtask.id,
                    tool = %subtask.tool,
                    "Inserting replacement subtask"
                );
                subtask.origin = Origin::Replan {
                    replaces: failed.id.clone(),
                };
                self.subtasks.insert(idx + 1, subtask);
            }
            ReplanDecision::Irrecoverable { reason } => {
                warn!(task_id = %self.task_id, subtask_id = %failed.id, reason = %reason, "Planner declared task irrecoverable");
                self.failure = Some(reason);
            }
        }
    }

    /// Whether a failed subtask was replaced by one that produced output.
    fn replaced(&self, id: &str) -> bool {
        self.subtasks.iter().any(|s| {
            matches!(&s.origin, Origin::Replan { replaces } if replaces == id)
                && (s.status.is_accumulated() || self.replaced(&s.id))
        })
    }

    fn gaps(&self) -> Vec<Gap> {
        let mut gaps = Vec::new();
        for chain in self.follow_ups.chains() {
            if chain.is_complete() {
                continue;
            }
            let report = chain.last_report.as_ref();
            let reason = match (chain.requested, report) {
                (Some(n), _) if chain.found < n => {
                    format!("requested {} records, found {}", n, chain.found)
                }
                (_, Some(r)) if !r.missing_fields.is_empty() => {
                    format!("missing fields: {}", r.missing_fields.join(", "))
                }
                (_, Some(r)) if r.short_text => "result text implausibly short".to_string(),
                _ => "incomplete result".to_string(),
            };
            gaps.push(Gap {
                subtask_id: chain.root.clone(),
                tool: chain.tool.clone(),
                coverage: chain.coverage(),
                missing_fields: report.map(|r| r.missing_fields.clone()).unwrap_or_default(),
                reason,
            });
        }
        for subtask in &self.subtasks {
            let disclose = match subtask.status {
                SubtaskStatus::Failed | SubtaskStatus::ResolutionFailed => {
                    !self.replaced(&subtask.id)
                }
                SubtaskStatus::Skipped => !self.superseded.contains(&subtask.id),
                _ => false,
            };
            if disclose {
                gaps.push(Gap {
                    subtask_id: subtask.id.clone(),
                    tool: subtask.tool.clone(),
                    coverage: 0.0,
                    missing_fields: vec![],
                    reason: self
                        .errors
                        .get(&subtask.id)
                        .cloned()
                        .unwrap_or_else(|| subtask.status.to_string()),
                });
            }
        }
        gaps
    }

    /// Settle leftovers, synthesize the answer and publish the final status.
    async fn finish(mut self) -> TaskReport {
        let leftover = if self.cancelled {
            "task cancelled".to_string()
        } else if self.failure.is_some() {
            "task halted".to_string()
        } else {
            "dependencies never satisfied".to_string()
        };
        for idx in 0..self.subtasks.len() {
            if self.subtasks[idx].status == SubtaskStatus::Pending {
                self.skip(idx, leftover.clone());
            }
        }

        let gaps = self.gaps();
        let status = if self.cancelled {
            TaskStatus::Cancelled
        } else if self.failure.is_some() {
            TaskStatus::Failed
        } else if gaps.is_empty() {
            TaskStatus::Succeeded
        } else if !self.data.is_empty() {
            TaskStatus::Partial
        } else {
            TaskStatus::Failed
        };
        let failure = if self.cancelled {
            Some("task cancelled".to_string())
        } else {
            self.failure
                .clone()
                .or_else(|| (!self.notes.is_empty()).then(|| self.notes.join("; ")))
        };

        let text = match self
            .engine
            .synthesizer
            .summarize(&self.description, &self.data, &gaps)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(task_id = %self.task_id, "Synthesizer returned empty text, using fallback");
                fallback_answer(&self.description, &self.data, &gaps, failure.as_deref())
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Synthesis failed, using fallback");
                fallback_answer(&self.description, &self.data, &gaps, failure.as_deref())
            }
        };

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            task_id = %self.task_id,
            status = ?status,
            subtasks = self.subtasks.len(),
            entries = self.data.len(),
            gaps = gaps.len(),
            elapsed_ms,
            "Task finished"
        );
        self.engine.event_bus.publish(TaskEvent::TaskFinished {
            task_id: self.task_id.clone(),
            status,
        });

        TaskReport {
            task_id: self.task_id,
            status,
            answer: FinalAnswer {
                text,
                status,
                gaps,
                failure,
            },
            data: self.data,
            subtasks: self.subtasks,
            elapsed_ms,
        }
    }
}

/// `base` with the first numeric suffix no subtask uses yet.
fn free_id(base: &str, taken: &HashSet<String>) -> String {
    let mut n = 2;
    loop {
        let id = format!("{}-{}", base, n);
        if !taken.contains(&id) {
            return id;
        }
        n += 1;
    }
}

/// Source names referenced by a subtask's inline templates.
fn template_sources(subtask: &SubtaskSpec) -> Vec<String> {
    let mut sources: Vec<String> =
        templates_in_value(&serde_json::Value::Object(subtask.params.clone()))
            .iter()
            .filter_map(|t| t.pattern().ok())
            .map(|p| p.source)
            .collect();
    sources.sort();
    sources.dedup();
    sources
}

/// Answer built from the context view when the Synthesizer cannot help.
fn fallback_answer(
    description: &str,
    data: &AccumulatedData,
    gaps: &[Gap],
    failure: Option<&str>,
) -> String {
    let mut text = format!("Results for: {}\n", description);
    if data.is_empty() {
        text.push_str("No results were collected.\n");
    } else {
        let view = serde_json::to_string_pretty(&data.context_view()).unwrap_or_default();
        text.push_str(&view);
        text.push('\n');
    }
    for gap in gaps {
        text.push_str(&format!(
            "Gap in {} ({}): {:.0}% coverage, {}\n",
            gap.subtask_id,
            gap.tool,
            gap.coverage * 100.0,
            gap.reason
        ));
    }
    if let Some(failure) = failure {
        text.push_str(&format!("Stopped early: {}\n", failure));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::schema::FollowUpPolicy;
    use stepwise_test_utils::{
        numbered_records, test_config, text_with_urls, RecordingSynthesizer, ScriptedPlanner,
        ScriptedTool,
    };

    fn engine_with(
        config: StepwiseConfig,
        tools: Vec<ScriptedTool>,
        planner: ScriptedPlanner,
        synthesizer: RecordingSynthesizer,
    ) -> ExecutionEngine {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        ExecutionEngine::new(config, registry, Arc::new(planner), Arc::new(synthesizer))
    }

    fn search_then_extract(count: usize) -> Plan {
        Plan::new(
            "find items",
            vec![
                SubtaskSpec::new("s1", "search").with_param("query", "desk lamps"),
                SubtaskSpec::new("x1", "extract")
                    .with_param("url", "{{search.urls[0]}}")
                    .with_requirement(Requirement::count(count)),
            ],
        )
    }

    #[tokio::test]
    async fn test_sequential_plan_succeeds() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example", "https://b.example"]));
        let extract = ScriptedTool::new("extract").then_records(numbered_records(0, 3));
        let synth = RecordingSynthesizer::new();
        let engine = engine_with(
            test_config(),
            vec![search, extract.clone()],
            ScriptedPlanner::default(),
            synth.clone(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "find items", search_then_extract(3), CancellationToken::new())
            .await;

        assert_eq!(report.status, TaskStatus::Succeeded);
        assert!(report.answer.gaps.is_empty());
        assert_eq!(extract.calls()[0]["url"], json!("https://a.example"));
        assert_eq!(synth.calls().len(), 1);
        assert_eq!(report.data.len(), 2);
    }

    #[tokio::test]
    async fn test_resolution_failure_never_invokes_tool() {
        let search = ScriptedTool::new("search").then_text("Search results: nothing relevant was found for this query.");
        let extract = ScriptedTool::new("extract").then_records(numbered_records(0, 3));
        let planner = ScriptedPlanner::default();
        let engine = engine_with(
            test_config(),
            vec![search, extract.clone()],
            planner.clone(),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "find items", search_then_extract(3), CancellationToken::new())
            .await;

        assert_eq!(extract.call_count(), 0);
        let x1 = report.subtasks.iter().find(|s| s.id == "x1").unwrap();
        assert_eq!(x1.status, SubtaskStatus::ResolutionFailed);
        let failures = planner.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Resolution);
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(!report.answer.text.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_subtask_recovers() {
        let search = ScriptedTool::new("search")
            .then_permanent("query rejected")
            .then_text(text_with_urls(&["https://c.example"]));
        let extract = ScriptedTool::new("extract").then_records(numbered_records(0, 2));
        let planner = ScriptedPlanner::default().with_replan(ReplanDecision::Subtask {
            subtask: SubtaskSpec::new("s1b", "search").with_param("query", "lamps"),
        });
        let engine = engine_with(
            test_config(),
            vec![search, extract.clone()],
            planner,
            RecordingSynthesizer::new(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "find items", search_then_extract(2), CancellationToken::new())
            .await;

        assert_eq!(report.status, TaskStatus::Succeeded, "{:?}", report.answer);
        assert_eq!(extract.calls()[0]["url"], json!("https://c.example"));
        let order: Vec<&str> = report.subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["s1", "s1b", "x1"]);
    }

    #[tokio::test]
    async fn test_irrecoverable_keeps_partial_data() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example"]));
        let extract = ScriptedTool::new("extract").then_permanent("page not found");
        let synth = RecordingSynthesizer::new();
        let planner = ScriptedPlanner::default().with_replan(ReplanDecision::Irrecoverable {
            reason: "no other sources".into(),
        });
        let engine = engine_with(
            test_config(),
            vec![search, extract],
            planner,
            synth.clone(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "find items", search_then_extract(2), CancellationToken::new())
            .await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.answer.failure.as_deref(), Some("no other sources"));
        assert_eq!(report.data.len(), 1);
        assert_eq!(synth.calls()[0].data.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_hard_dependency_skips_dependent() {
        let search = ScriptedTool::new("search").then_permanent("down");
        let export = ScriptedTool::new("export").then_text("written to out.csv, a plausible path");
        let plan = Plan::new(
            "export",
            vec![
                SubtaskSpec::new("s1", "search").with_param("query", "x"),
                SubtaskSpec::new("e1", "export")
                    .with_param("records", json!(["literal"]))
                    .with_depends_on(vec!["s1".into()]),
            ],
        );
        let mut config = test_config();
        config.engine.max_replans = 0;
        let engine = engine_with(
            config,
            vec![search, export.clone()],
            ScriptedPlanner::default(),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "export", plan, CancellationToken::new())
            .await;

        assert_eq!(export.call_count(), 0);
        let e1 = report.subtasks.iter().find(|s| s.id == "e1").unwrap();
        assert_eq!(e1.status, SubtaskStatus::Skipped);
        assert!(report.answer.gaps.iter().any(|g| g.subtask_id == "e1"));
    }

    #[tokio::test]
    async fn test_synthesizer_failure_falls_back() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example", "https://b.example"]));
        let plan = Plan::new(
            "search",
            vec![SubtaskSpec::new("s1", "search").with_param("query", "lamps")],
        );
        let engine = engine_with(
            test_config(),
            vec![search],
            ScriptedPlanner::default(),
            RecordingSynthesizer::failing(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "search", plan, CancellationToken::new())
            .await;

        assert_eq!(report.status, TaskStatus::Succeeded);
        assert!(report.answer.text.contains("https://a.example"));
    }

    #[tokio::test]
    async fn test_planner_failure_still_answers() {
        let engine = engine_with(
            test_config(),
            vec![],
            ScriptedPlanner::failing("model unavailable"),
            RecordingSynthesizer::new(),
        );
        let report = engine
            .run_task(TaskId::new(), "anything", Mode::Sequential, CancellationToken::new())
            .await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.answer.failure.unwrap().contains("model unavailable"));
        assert!(!report.answer.text.is_empty());
    }

    #[tokio::test]
    async fn test_adaptive_mode_observes_each_step() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example"]));
        let extract = ScriptedTool::new("extract").then_records(numbered_records(0, 1));
        let planner = ScriptedPlanner::adaptive(vec![
            NextStep::Subtask {
                subtask: SubtaskSpec::new("s1", "search").with_param("query", "lamps"),
            },
            NextStep::Subtask {
                subtask: SubtaskSpec::new("x1", "extract").with_param("url", "{{s1.urls[0]}}"),
            },
            NextStep::Done,
        ]);
        let engine = engine_with(
            test_config(),
            vec![search, extract.clone()],
            planner.clone(),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .run_task(TaskId::new(), "find a lamp", Mode::Adaptive, CancellationToken::new())
            .await;

        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(extract.calls()[0]["url"], json!("https://a.example"));
        let observations = planner.observations();
        assert_eq!(observations.len(), 3);
        assert!(observations[0].is_none());
        assert_eq!(observations[1].as_ref().unwrap().subtask_id, "s1");
        assert_eq!(observations[2].as_ref().unwrap().subtask_id, "x1");
    }

    #[tokio::test]
    async fn test_adaptive_iteration_ceiling() {
        let steps = (0..10)
            .map(|i| NextStep::Subtask {
                subtask: SubtaskSpec::new(format!("s{}", i), "search")
                    .with_param("query", "a query that returns enough text"),
            })
            .collect();
        let search = ScriptedTool::new("search").otherwise(stepwise_test_utils::Step::Ok(
            RawResult::text("a reasonably long search digest without links"),
        ));
        let mut config = test_config();
        config.engine.max_iterations = 3;
        let engine = engine_with(
            config,
            vec![search.clone()],
            ScriptedPlanner::adaptive(steps),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .run_task(TaskId::new(), "loop", Mode::Adaptive, CancellationToken::new())
            .await;

        assert_eq!(search.call_count(), 3);
        assert!(report.answer.failure.unwrap().contains("iteration ceiling"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_subtasks_run_concurrently() {
        let slow = ScriptedTool::new("browse").then_hang();
        let fast = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example", "https://b.example"]));
        let mut config = test_config();
        config.retry.max_retries = 0;
        config.engine.max_replans = 0;
        config.timeouts.tools.insert("browse".into(), 1);
        let plan = Plan::new(
            "both",
            vec![
                SubtaskSpec::new("b1", "browse").with_param("url", "https://slow.example"),
                SubtaskSpec::new("s1", "search").with_param("query", "lamps"),
            ],
        );
        let engine = engine_with(
            config,
            vec![slow, fast.clone()],
            ScriptedPlanner::default(),
            RecordingSynthesizer::new(),
        );
        let mut rx = engine.event_bus().subscribe();

        let report = engine
            .execute_plan(TaskId::new(), "both", plan, CancellationToken::new())
            .await;

        assert_eq!(fast.call_count(), 1);
        assert_eq!(report.status, TaskStatus::Partial);
        // s1 commits while b1 is still in flight.
        let mut committed = vec![];
        while let Ok(event) = rx.try_recv() {
            if let TaskEvent::SubtaskStatusChanged { subtask_id, status, .. } = event {
                if status.is_settled() {
                    committed.push(subtask_id);
                }
            }
        }
        assert_eq!(committed, vec!["s1", "b1"]);
    }

    #[tokio::test]
    async fn test_cancellation_preserves_data() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example"]));
        let browse = ScriptedTool::new("browse").then_hang();
        let plan = Plan::new(
            "cancel",
            vec![
                SubtaskSpec::new("s1", "search").with_param("query", "lamps"),
                SubtaskSpec::new("b1", "browse")
                    .with_param("url", "{{search.urls[0]}}")
                    .with_timeout_secs(3600),
            ],
        );
        let synth = RecordingSynthesizer::new();
        let engine = Arc::new(engine_with(
            test_config(),
            vec![search, browse],
            ScriptedPlanner::default(),
            synth.clone(),
        ));
        let cancel = CancellationToken::new();
        let mut rx = engine.event_bus().subscribe();

        let handle = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                engine
                    .execute_plan(TaskId::new(), "cancel", plan, cancel)
                    .await
            })
        };
        while let Ok(event) = rx.recv().await {
            if let TaskEvent::SubtaskStatusChanged { subtask_id, status: SubtaskStatus::Running, .. } = event {
                if subtask_id == "b1" {
                    break;
                }
            }
        }
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.status, TaskStatus::Cancelled);
        assert_eq!(report.data.len(), 1);
        let b1 = report.subtasks.iter().find(|s| s.id == "b1").unwrap();
        assert_eq!(b1.status, SubtaskStatus::Failed);
        assert_eq!(synth.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_switch_tool_follow_up() {
        let mut config = test_config();
        config.schemas.push(
            ToolSchema::new("catalog")
                .with_input(stepwise_core::InputSpec::required("query"))
                .with_output("records", stepwise_core::Extractor::Records)
                .with_follow_up(FollowUpPolicy {
                    advance_source: false,
                    offset_param: None,
                    alternates: vec!["inventory".into()],
                }),
        );
        config.schemas.push(
            ToolSchema::new("inventory")
                .with_input(stepwise_core::InputSpec::required("query"))
                .with_output("records", stepwise_core::Extractor::Records),
        );
        let catalog = ScriptedTool::new("catalog")
            .then_records(vec![json!({"title": "Lamp"})]);
        let inventory = ScriptedTool::new("inventory")
            .then_records(vec![json!({"title": "Lamp", "stock": 4})]);
        let plan = Plan::new(
            "stock",
            vec![SubtaskSpec::new("c1", "catalog")
                .with_param("query", "lamp")
                .with_requirement(Requirement::default().with_fields(vec!["stock".into()]))],
        );
        let engine = engine_with(
            config,
            vec![catalog, inventory.clone()],
            ScriptedPlanner::default(),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "stock", plan, CancellationToken::new())
            .await;

        assert_eq!(inventory.call_count(), 1);
        assert_eq!(inventory.calls()[0]["query"], json!("lamp"));
        assert_eq!(report.status, TaskStatus::Succeeded, "{:?}", report.answer.gaps);
        assert_eq!(report.subtasks[1].id, "c1-f1");
    }

    #[tokio::test]
    async fn test_follow_up_takes_free_id() {
        let search = ScriptedTool::new("search")
            .then_text(text_with_urls(&["https://a.example", "https://b.example"]));
        let extract = ScriptedTool::new("extract")
            .then_records(numbered_records(0, 3))
            .then_records(numbered_records(3, 2));
        let calculate = ScriptedTool::new("calculate").then_ok(RawResult::new(
            Payload::StructuredMap(stepwise_test_utils::record(&json!({"result": 4}))),
        ));
        let mut plan = search_then_extract(5);
        plan.subtasks
            .push(SubtaskSpec::new("x1-f1", "calculate").with_param("expression", "2 + 2"));
        let mut config = test_config();
        config.engine.parallel = false;
        let engine = engine_with(
            config,
            vec![search, extract.clone(), calculate],
            ScriptedPlanner::default(),
            RecordingSynthesizer::new(),
        );

        let report = engine
            .execute_plan(TaskId::new(), "find items", plan, CancellationToken::new())
            .await;

        assert_eq!(extract.call_count(), 2);
        assert_eq!(extract.calls()[1]["url"], json!("https://b.example"));
        let follow_up = report.subtasks.iter().find(|s| s.id == "x1-f1-2").unwrap();
        assert_eq!(
            follow_up.origin,
            Origin::FollowUp {
                root: "x1".into(),
                attempt: 1
            }
        );
        assert_eq!(report.subtasks.iter().filter(|s| s.id == "x1-f1").count(), 1);
        assert_eq!(report.status, TaskStatus::Succeeded, "{:?}", report.answer.gaps);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_replan() {
        let search = ScriptedTool::new("search").then_permanent("400 bad query");
        let planner = ScriptedPlanner::default().stalled();
        let engine = Arc::new(engine_with(
            test_config(),
            vec![search],
            planner.clone(),
            RecordingSynthesizer::new(),
        ));
        let cancel = CancellationToken::new();
        let mut rx = engine.event_bus().subscribe();
        let plan = Plan::new(
            "stall",
            vec![SubtaskSpec::new("s1", "search").with_param("query", "((")],
        );

        let handle = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.execute_plan(TaskId::new(), "stall", plan, cancel).await })
        };
        while let Ok(event) = rx.recv().await {
            if matches!(event, TaskEvent::ReplanRequested { .. }) {
                break;
            }
        }
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancellation should not wait for the planner")
            .unwrap();

        assert_eq!(report.status, TaskStatus::Cancelled);
        assert_eq!(planner.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_next_step() {
        let planner = ScriptedPlanner::default().stalled();
        let engine = Arc::new(engine_with(
            test_config(),
            vec![],
            planner.clone(),
            RecordingSynthesizer::new(),
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                engine
                    .run_task(TaskId::new(), "open-ended", Mode::Adaptive, cancel)
                    .await
            })
        };
        while planner.observations().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancellation should not wait for the planner")
            .unwrap();

        assert_eq!(report.status, TaskStatus::Cancelled);
        assert!(!report.answer.text.is_empty());
    }
}
