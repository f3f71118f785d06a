use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepwise_core::event::EventBus;
use stepwise_core::types::{TaskEvent, TaskId};

/// JSONL task logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single task. Lines already written survive a crash mid-task.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    task_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtask_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs are written to `{log_dir}/{task_id}/{timestamp}.jsonl`.
    /// `level`: 1 = task start/finish, 2 = subtask transitions, 3 = retries
    /// and output previews.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run until cancellation or the task's `TaskFinished` event.
    ///
    /// Subscribe order matters: spawn this before the task starts or early
    /// events are missed.
    pub async fn run(self, event_bus: Arc<EventBus>, task_id: TaskId, cancel: CancellationToken) {
        let rx = event_bus.subscribe();
        self.run_with(rx, task_id, cancel).await
    }

    /// Like `run`, with a receiver subscribed by the caller.
    pub async fn run_with(
        self,
        mut rx: tokio::sync::broadcast::Receiver<TaskEvent>,
        task_id: TaskId,
        cancel: CancellationToken,
    ) {
        let task_dir = self.log_dir.join(&task_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&task_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = task_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), task_id = %task_id, "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.task_id() != &task_id {
                                continue;
                            }
                            let finished = matches!(event, TaskEvent::TaskFinished { .. });
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if finished {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a TaskEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &TaskEvent) -> Option<LogEntry> {
        let entry = |event_type: &str,
                     subtask_id: Option<&str>,
                     detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            task_id: event.task_id().0.clone(),
            event_type: event_type.to_string(),
            subtask_id: subtask_id.map(String::from),
            detail,
        };

        match event {
            TaskEvent::TaskStarted { description, .. } => Some(entry(
                "task_started",
                None,
                Some(serde_json::json!({ "description": description })),
            )),
            TaskEvent::TaskFinished { status, .. } => Some(entry(
                "task_finished",
                None,
                Some(serde_json::json!({ "status": status })),
            )),

            TaskEvent::SubtaskStatusChanged {
                subtask_id,
                tool,
                status,
                preview,
                ..
            } if self.level >= 2 => {
                let mut detail = serde_json::json!({ "tool": tool, "status": status });
                if let (Some(preview), true) = (preview, self.level >= 3) {
                    detail["preview"] = serde_json::Value::String(preview.clone());
                }
                Some(entry("subtask_status", Some(subtask_id.as_str()), Some(detail)))
            }
            TaskEvent::FollowUpQueued {
                root,
                subtask_id,
                tool,
                action,
                ..
            } if self.level >= 2 => Some(entry(
                "follow_up_queued",
                Some(subtask_id.as_str()),
                Some(serde_json::json!({ "root": root, "tool": tool, "action": action })),
            )),
            TaskEvent::ReplanRequested {
                subtask_id, error, ..
            } if self.level >= 2 => Some(entry(
                "replan_requested",
                Some(subtask_id.as_str()),
                Some(serde_json::json!({ "error": error })),
            )),

            TaskEvent::SubtaskRetrying {
                subtask_id,
                tool,
                attempt,
                backoff_ms,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "subtask_retrying",
                Some(subtask_id.as_str()),
                Some(serde_json::json!({
                    "tool": tool,
                    "attempt": attempt,
                    "backoff_ms": backoff_ms,
                    "error": error,
                })),
            )),

            _ => None,
        }
    }
}
