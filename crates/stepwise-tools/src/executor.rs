use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepwise_core::config::RetryConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::event::EventBus;
use stepwise_core::schema::ToolSchema;
use stepwise_core::traits::Tool;
use stepwise_core::types::{TaskEvent, TaskId, ToolResult};

use crate::extract::{extract, Extracted};

/// Who is invoking, and under which budget.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task_id: TaskId,
    pub subtask_id: String,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Receives attempt transitions while the run is in progress.
    pub notices: Option<mpsc::UnboundedSender<AttemptNotice>>,
}

impl Invocation {
    fn notify(&self, notice: AttemptNotice) {
        if let Some(tx) = &self.notices {
            // The caller may have stopped listening.
            let _ = tx.send(notice);
        }
    }
}

/// Attempt transitions reported to the caller of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptNotice {
    /// A transient failure; the next attempt starts after the backoff.
    Retrying { subtask_id: String, attempt: u32 },
    /// The backoff elapsed and the tool is invoked again.
    Resumed { subtask_id: String },
}

/// Outcome of running one subtask's tool, retries included.
#[derive(Debug)]
pub struct ToolRun {
    /// Raw result with attempt and backoff bookkeeping filled in.
    pub result: ToolResult,
    pub extracted: Extracted,
    /// Set when every attempt failed, or a permanent failure stopped retries.
    pub error: Option<StepwiseError>,
}

impl ToolRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs tools with a per-invocation timeout and bounded exponential backoff.
///
/// Only transient failures are retried, and only for tools that declare
/// retries safe. Permanent failures return after the first attempt.
pub struct Executor {
    retry: RetryConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Executor {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn run(
        &self,
        tool: Arc<dyn Tool>,
        schema: Arc<ToolSchema>,
        params: Map<String, Value>,
        inv: Invocation,
    ) -> ToolRun {
        let started = Instant::now();
        let name = tool.name().to_string();
        let max_retries = if tool.retry_safe() {
            self.retry.max_retries
        } else {
            0
        };
        let mut backoffs: Vec<u64> = Vec::new();
        let mut attempts = 0u32;
        let mut last_err = None;

        for attempt in 0..=max_retries {
            attempts = attempt + 1;
            let outcome = tokio::select! {
                _ = inv.cancel.cancelled() => {
                    last_err = Some(StepwiseError::Cancelled);
                    break;
                }
                r = tokio::time::timeout(inv.timeout, tool.invoke(params.clone(), inv.timeout)) => r,
            };

            let err = match outcome {
                Ok(Ok(raw)) => {
                    let mut result = ToolResult::success(raw);
                    result.metadata.attempts = attempts;
                    result.metadata.backoff_ms = backoffs;
                    result.metadata.elapsed_ms = started.elapsed().as_millis() as u64;
                    let extracted = result
                        .payload
                        .as_ref()
                        .map(|p| extract(&schema, p))
                        .unwrap_or_default();
                    debug!(
                        tool = %name,
                        subtask = %inv.subtask_id,
                        attempts,
                        fields = extracted.fields.len(),
                        "Tool succeeded"
                    );
                    return ToolRun {
                        result,
                        extracted,
                        error: None,
                    };
                }
                Ok(Err(e)) => classify(&name, e),
                Err(_) => StepwiseError::ToolTimeout {
                    tool: name.clone(),
                    timeout_ms: inv.timeout.as_millis() as u64,
                },
            };

            if !err.is_transient() {
                warn!(tool = %name, subtask = %inv.subtask_id, error = %err, "Permanent tool failure");
                last_err = Some(err);
                break;
            }
            if attempt == max_retries {
                warn!(
                    tool = %name,
                    subtask = %inv.subtask_id,
                    attempts,
                    error = %err,
                    "Retries exhausted"
                );
                last_err = Some(err);
                break;
            }

            let backoff = calculate_backoff(attempt, &self.retry);
            let backoff_ms = backoff.as_millis() as u64;
            warn!(
                tool = %name,
                subtask = %inv.subtask_id,
                attempt = attempt + 1,
                max_retries,
                backoff_ms,
                error = %err,
                "Retrying tool"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(TaskEvent::SubtaskRetrying {
                    task_id: inv.task_id.clone(),
                    subtask_id: inv.subtask_id.clone(),
                    tool: name.clone(),
                    attempt: attempt + 1,
                    backoff_ms,
                    error: err.to_string(),
                });
            }
            inv.notify(AttemptNotice::Retrying {
                subtask_id: inv.subtask_id.clone(),
                attempt: attempt + 1,
            });
            backoffs.push(backoff_ms);
            last_err = Some(err);

            tokio::select! {
                _ = inv.cancel.cancelled() => {
                    last_err = Some(StepwiseError::Cancelled);
                    break;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            inv.notify(AttemptNotice::Resumed {
                subtask_id: inv.subtask_id.clone(),
            });
        }

        let err = last_err.unwrap_or_else(|| StepwiseError::PermanentTool {
            tool: name.clone(),
            message: "no attempt was made".into(),
        });
        let mut result = ToolResult::failure(err.to_string());
        result.metadata.attempts = attempts;
        result.metadata.backoff_ms = backoffs;
        result.metadata.elapsed_ms = started.elapsed().as_millis() as u64;
        ToolRun {
            result,
            extracted: Extracted::default(),
            error: Some(err),
        }
    }
}

/// Map an arbitrary tool error onto the transient/permanent split.
///
/// Errors the tool already classified pass through. Anything else is
/// transient only if its message looks like a network or availability fault.
pub fn classify(tool: &str, err: StepwiseError) -> StepwiseError {
    match err {
        e @ (StepwiseError::TransientTool { .. }
        | StepwiseError::PermanentTool { .. }
        | StepwiseError::ToolTimeout { .. }
        | StepwiseError::Cancelled) => e,
        other => {
            let message = other.to_string();
            if is_transient_message(&message) {
                StepwiseError::TransientTool {
                    tool: tool.to_string(),
                    message,
                }
            } else {
                StepwiseError::PermanentTool {
                    tool: tool.to_string(),
                    message,
                }
            }
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("429")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
        || msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("rate limit")
        || msg.contains("connection")
        || msg.contains("network")
        || msg.contains("temporarily unavailable")
}

/// Exponential backoff: `initial * 2^attempt` with optional 0.8x to 1.2x
/// jitter, then capped. Delays strictly increase until the cap and stay
/// there after it.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let ms = if config.jitter {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        (ms as f64 * jitter) as u64
    } else {
        ms
    };
    Duration::from_millis(ms.min(config.max_backoff_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::types::RawResult;
    use stepwise_test_utils::{ScriptedTool, Step};

    fn retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 60_000,
            jitter: true,
        }
    }

    fn inv(timeout_ms: u64) -> Invocation {
        Invocation {
            task_id: TaskId::from_str("t1"),
            subtask_id: "s1".into(),
            timeout: Duration::from_millis(timeout_ms),
            cancel: CancellationToken::new(),
            notices: None,
        }
    }

    fn schema() -> Arc<ToolSchema> {
        Arc::new(ToolSchema::new("search").with_output("urls", stepwise_core::Extractor::Urls))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(8, &config), Duration::from_millis(1_000));
        assert_eq!(calculate_backoff(70, &config), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jittered_backoff_strictly_increases() {
        let config = retry(5);
        for _ in 0..50 {
            let delays: Vec<_> = (0..5).map(|a| calculate_backoff(a, &config)).collect();
            assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
        }
    }

    #[test]
    fn test_jittered_backoff_never_shrinks_past_cap() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: true,
        };
        for _ in 0..50 {
            let delays: Vec<_> = (0..10).map(|a| calculate_backoff(a, &config)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
            assert_eq!(delays[9], Duration::from_millis(1_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_notices_sent_around_backoff() {
        let tool = ScriptedTool::new("search")
            .then_transient("503")
            .then_text("see https://a.example");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut invocation = inv(1_000);
        invocation.notices = Some(tx);
        let run = Executor::new(retry(2))
            .run(Arc::new(tool), schema(), Map::new(), invocation)
            .await;
        assert!(run.is_success());

        assert_eq!(
            rx.recv().await,
            Some(AttemptNotice::Retrying {
                subtask_id: "s1".into(),
                attempt: 1
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(AttemptNotice::Resumed {
                subtask_id: "s1".into()
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untyped_io_errors_classified_by_message() {
        let tool = ScriptedTool::new("browse")
            .then(Step::Io("connection reset by peer".into()))
            .then(Step::Io("permission denied".into()))
            .then_text("never reached");
        let run = Executor::new(retry(3))
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(1_000))
            .await;

        assert_eq!(tool.call_count(), 2);
        assert_eq!(run.result.metadata.attempts, 2);
        assert!(matches!(run.error, Some(StepwiseError::PermanentTool { .. })));
    }

    #[test]
    fn test_classify() {
        let io = StepwiseError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "connection reset by peer",
        ));
        assert!(classify("browse", io).is_transient());

        let json_err = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(!classify("browse", StepwiseError::Json(json_err)).is_transient());

        let explicit = StepwiseError::PermanentTool {
            tool: "browse".into(),
            message: "503 forbidden by policy".into(),
        };
        assert!(!classify("browse", explicit).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_succeeds() {
        let tool = ScriptedTool::new("search")
            .then_transient("503 service busy")
            .then_transient("rate limit")
            .then_text("see https://a.example");
        let exec = Executor::new(retry(3));
        let run = exec
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(1_000))
            .await;

        assert!(run.is_success());
        assert_eq!(tool.call_count(), 3);
        assert_eq!(run.result.metadata.attempts, 3);
        let b = &run.result.metadata.backoff_ms;
        assert_eq!(b.len(), 2);
        assert!(b[0] < b[1]);
        assert_eq!(run.extracted.fields["urls"], serde_json::json!(["https://a.example"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion() {
        let tool = ScriptedTool::new("search").otherwise_transient("connection refused");
        let exec = Executor::new(retry(3));
        let run = exec
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(1_000))
            .await;

        assert_eq!(tool.call_count(), 4);
        assert!(matches!(run.error, Some(StepwiseError::TransientTool { .. })));
        assert!(!run.result.success);
        let b = &run.result.metadata.backoff_ms;
        assert_eq!(b.len(), 3);
        assert!(b.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let tool = ScriptedTool::new("search")
            .then_permanent("invalid query")
            .then_text("never reached");
        let exec = Executor::new(retry(3));
        let run = exec
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(1_000))
            .await;

        assert_eq!(tool.call_count(), 1);
        assert!(matches!(run.error, Some(StepwiseError::PermanentTool { .. })));
        assert!(run.result.metadata.backoff_ms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let tool = ScriptedTool::new("browse")
            .then_hang()
            .then_text("page text");
        let exec = Executor::new(retry(1));
        let run = exec
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(50))
            .await;

        assert!(run.is_success());
        assert_eq!(tool.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_tool_gets_one_attempt() {
        let tool = ScriptedTool::new("export")
            .not_retry_safe()
            .otherwise_transient("503");
        let exec = Executor::new(retry(3));
        let run = exec
            .run(Arc::new(tool.clone()), schema(), Map::new(), inv(1_000))
            .await;

        assert_eq!(tool.call_count(), 1);
        assert!(run.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let tool = ScriptedTool::new("search").otherwise_transient("503");
        let exec = Executor::new(retry(3));
        let invocation = inv(1_000);
        let cancel = invocation.cancel.clone();
        let handle = tokio::spawn(async move {
            exec.run(Arc::new(tool), schema(), Map::new(), invocation)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let run = handle.await.unwrap();
        assert!(matches!(run.error, Some(StepwiseError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_event_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let tool = ScriptedTool::new("search")
            .then_transient("timeout")
            .then_ok(RawResult::text("ok"));
        let exec = Executor::new(retry(2)).with_event_bus(bus);
        let run = exec.run(Arc::new(tool), schema(), Map::new(), inv(1_000)).await;
        assert!(run.is_success());

        match rx.recv().await.unwrap() {
            TaskEvent::SubtaskRetrying { attempt, tool, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(tool, "search");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
