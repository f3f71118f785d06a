use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stepwise_core::data::AccumulatedData;
use stepwise_core::types::{FinalAnswer, Plan, TaskId, TaskStatus};

use crate::engine::{ExecutionEngine, Mode, TaskReport};
use crate::run_log::RunLogger;

/// Caller's reference to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: TaskId,
}

/// What `result` hands back: the answer plus everything collected.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub answer: FinalAnswer,
    pub data: AccumulatedData,
}

impl From<&TaskReport> for TaskOutcome {
    fn from(report: &TaskReport) -> Self {
        Self {
            answer: report.answer.clone(),
            data: report.data.clone(),
        }
    }
}

struct TaskSlot {
    cancel: CancellationToken,
    status: watch::Receiver<TaskStatus>,
}

/// Runs tasks in the background and tracks them by handle.
///
/// Every task gets its own cancellation token and status channel; tasks
/// share nothing but the engine's immutable configuration.
pub struct TaskManager {
    engine: Arc<ExecutionEngine>,
    tasks: Mutex<HashMap<TaskId, TaskSlot>>,
    reports: Arc<Mutex<HashMap<TaskId, Arc<TaskReport>>>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            tasks: Mutex::new(HashMap::new()),
            reports: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Start a task; the Planner produces its plan.
    pub async fn submit(&self, description: impl Into<String>, mode: Mode) -> TaskHandle {
        let description = description.into();
        self.spawn(description, move |engine, task_id, description, cancel| {
            Box::pin(async move { engine.run_task(task_id, &description, mode, cancel).await })
        })
        .await
    }

    /// Start a task from a plan the caller already has.
    pub async fn submit_plan(&self, description: impl Into<String>, plan: Plan) -> TaskHandle {
        let description = description.into();
        self.spawn(description, move |engine, task_id, description, cancel| {
            Box::pin(async move {
                engine
                    .execute_plan(task_id, &description, plan, cancel)
                    .await
            })
        })
        .await
    }

    async fn spawn<F>(&self, description: String, run: F) -> TaskHandle
    where
        F: FnOnce(
                Arc<ExecutionEngine>,
                TaskId,
                String,
                CancellationToken,
            ) -> futures::future::BoxFuture<'static, TaskReport>
            + Send
            + 'static,
    {
        let task_id = TaskId::new();
        let cancel = self.shutdown.child_token();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Pending);

        if let Some(log) = self.engine.config().log.as_ref().filter(|l| l.enabled) {
            // Subscribe now so TaskStarted is not missed.
            let rx = self.engine.event_bus().subscribe();
            let logger = RunLogger::new(log.dir(), log.level);
            tokio::spawn(logger.run_with(rx, task_id.clone(), self.shutdown.child_token()));
        }

        self.tasks.lock().await.insert(
            task_id.clone(),
            TaskSlot {
                cancel: cancel.clone(),
                status: status_rx,
            },
        );
        info!(task_id = %task_id, "Task submitted");

        let engine = Arc::clone(&self.engine);
        let reports = Arc::clone(&self.reports);
        let id = task_id.clone();
        tokio::spawn(async move {
            status_tx.send_replace(TaskStatus::Running);
            let report = run(engine, id.clone(), description, cancel).await;
            let status = report.status;
            reports.lock().await.insert(id.clone(), Arc::new(report));
            // Report is stored before the terminal status becomes visible.
            status_tx.send_replace(status);
            debug!(task_id = %id, status = ?status, "Task slot settled");
        });

        TaskHandle { task_id }
    }

    /// Current status, or `None` for an unknown handle.
    pub async fn status(&self, handle: &TaskHandle) -> Option<TaskStatus> {
        let tasks = self.tasks.lock().await;
        tasks.get(&handle.task_id).map(|slot| *slot.status.borrow())
    }

    /// A receiver that observes every status change of the task.
    pub async fn watch(&self, handle: &TaskHandle) -> Option<watch::Receiver<TaskStatus>> {
        let tasks = self.tasks.lock().await;
        tasks.get(&handle.task_id).map(|slot| slot.status.clone())
    }

    /// Signal cancellation. Returns false for an unknown handle.
    ///
    /// In-flight tools are cancelled and data collected so far is kept for
    /// the answer.
    pub async fn cancel(&self, handle: &TaskHandle) -> bool {
        let tasks = self.tasks.lock().await;
        match tasks.get(&handle.task_id) {
            Some(slot) => {
                info!(task_id = %handle.task_id, "Task cancellation requested");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the task to settle and return its outcome.
    pub async fn result(&self, handle: &TaskHandle) -> Option<TaskOutcome> {
        self.report(handle).await.map(|r| TaskOutcome::from(r.as_ref()))
    }

    /// Wait for the task to settle and return the full report.
    pub async fn report(&self, handle: &TaskHandle) -> Option<Arc<TaskReport>> {
        let mut status = self.watch(handle).await?;
        status.wait_for(|s| s.is_terminal()).await.ok()?;
        self.reports.lock().await.get(&handle.task_id).cloned()
    }

    /// The report if the task already settled, without waiting.
    pub async fn try_result(&self, handle: &TaskHandle) -> Option<TaskOutcome> {
        let reports = self.reports.lock().await;
        reports
            .get(&handle.task_id)
            .map(|r| TaskOutcome::from(r.as_ref()))
    }

    /// Drop a settled task and hand back its report.
    ///
    /// Running tasks are left alone and yield `None`, as do unknown handles.
    pub async fn forget(&self, handle: &TaskHandle) -> Option<Arc<TaskReport>> {
        let mut tasks = self.tasks.lock().await;
        let settled = tasks
            .get(&handle.task_id)
            .is_some_and(|slot| slot.status.borrow().is_terminal());
        if !settled {
            return None;
        }
        tasks.remove(&handle.task_id);
        let report = self.reports.lock().await.remove(&handle.task_id);
        debug!(task_id = %handle.task_id, "Task forgotten");
        report
    }

    pub async fn list(&self) -> Vec<(TaskId, TaskStatus)> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .map(|(id, slot)| (id.clone(), *slot.status.borrow()))
            .collect()
    }

    /// Cancel every task and stop their loggers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
