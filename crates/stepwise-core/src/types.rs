use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single subtask.
///
/// `pending → resolving → (resolved | resolution_failed) → running →
/// (retrying →)* (succeeded | partial | failed)`, or `skipped` when a hard
/// dependency never produced output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Resolving,
    Resolved,
    ResolutionFailed,
    Running,
    Retrying,
    Succeeded,
    /// Committed with incomplete coverage that the engine accepted.
    Partial,
    Failed,
    Skipped,
}

impl SubtaskStatus {
    /// No further transitions will happen.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Partial | Self::Failed | Self::ResolutionFailed | Self::Skipped
        )
    }

    /// Output was committed to AccumulatedData.
    pub fn is_accumulated(self) -> bool {
        matches!(self, Self::Succeeded | Self::Partial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::ResolutionFailed => "resolution_failed",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the originating request asked of a subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    /// Number of records requested.
    #[serde(default)]
    pub count: Option<usize>,
    /// Fields every returned record should carry.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Minimum plausible length of a text result, overriding the default.
    #[serde(default)]
    pub min_text_chars: Option<usize>,
}

impl Requirement {
    pub fn count(n: usize) -> Self {
        Self {
            count: Some(n),
            ..Default::default()
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

/// Why a subtask is in the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Planned,
    /// Appended to close a completeness shortfall of `root`.
    FollowUp { root: String, attempt: usize },
    /// Issued by the Planner after `replaces` failed.
    Replan { replaces: String },
}

/// One tool invocation within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: String,
    pub tool: String,
    /// Literal values or strings containing `{{source.field[index]}}` templates.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Subtask ids that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requirement: Option<Requirement>,
    /// Per-subtask timeout override.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default)]
    pub origin: Origin,
}

impl SubtaskSpec {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params: Map::new(),
            depends_on: vec![],
            requirement: None,
            timeout_secs: None,
            status: SubtaskStatus::Pending,
            origin: Origin::Planned,
        }
    }

    /// Set a parameter (literal or template string).
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = Some(requirement);
        self
    }

    pub fn with_depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }
}

/// The ordered set of subtasks produced for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_plan_id")]
    pub id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
}

fn new_plan_id() -> String {
    Uuid::new_v4().to_string()
}

impl Plan {
    pub fn new(goal: impl Into<String>, subtasks: Vec<SubtaskSpec>) -> Self {
        Self {
            id: new_plan_id(),
            goal: goal.into(),
            subtasks,
        }
    }

    pub fn get(&self, id: &str) -> Option<&SubtaskSpec> {
        self.subtasks.iter().find(|s| s.id == id)
    }
}

/// Keys under which a structured map usually nests its record list.
const LIST_KEYS: &[&str] = &["items", "results", "records", "data"];

/// A tool's result payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    RecordList(Vec<Map<String, Value>>),
    Record(Map<String, Value>),
    StructuredMap(Map<String, Value>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::RecordList(_) => "record_list",
            Self::Record(_) => "record",
            Self::StructuredMap(_) => "structured_map",
        }
    }

    /// JSON view of the payload, used by extractors.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(t) => Value::String(t.clone()),
            Self::RecordList(items) => {
                Value::Array(items.iter().cloned().map(Value::Object).collect())
            }
            Self::Record(map) | Self::StructuredMap(map) => Value::Object(map.clone()),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The records this payload carries. Text carries none.
    pub fn records(&self) -> Vec<&Map<String, Value>> {
        match self {
            Self::Text(_) => vec![],
            Self::RecordList(items) => items.iter().collect(),
            Self::Record(map) => vec![map],
            Self::StructuredMap(map) => LIST_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_array()))
                .map(|items| items.iter().filter_map(|v| v.as_object()).collect())
                .unwrap_or_default(),
        }
    }

    /// Number of records, or `None` when the payload is not countable.
    pub fn record_count(&self) -> Option<usize> {
        match self {
            Self::Text(_) => None,
            Self::RecordList(items) => Some(items.len()),
            Self::Record(_) => Some(1),
            Self::StructuredMap(map) => LIST_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_array()))
                .map(|items| items.len()),
        }
    }
}

/// What a Tool hands back on success, before extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawResult {
    pub payload: Payload,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RawResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    pub fn records(records: Vec<Map<String, Value>>) -> Self {
        Self::new(Payload::RecordList(records))
    }

    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            metadata: Map::new(),
        }
    }
}

/// Bookkeeping attached to every ToolResult.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    #[serde(default)]
    pub requested_count: Option<usize>,
    #[serde(default)]
    pub found_count: Option<usize>,
    #[serde(default)]
    pub coverage: Option<f64>,
    /// Invocations made, including the first.
    #[serde(default)]
    pub attempts: u32,
    /// Backoff slept before each retry, in order.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Fields capped in the context-facing view.
    #[serde(default)]
    pub truncated_fields: Vec<String>,
    /// Metadata the tool itself reported.
    #[serde(default)]
    pub tool: Map<String, Value>,
}

/// Outcome of one executed subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl ToolResult {
    pub fn success(raw: RawResult) -> Self {
        Self {
            success: true,
            payload: Some(raw.payload),
            error: None,
            metadata: ResultMetadata {
                tool: raw.metadata,
                ..Default::default()
            },
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            metadata: ResultMetadata::default(),
        }
    }
}

/// Evaluator verdict on how to close a shortfall.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Retry,
    FollowUpSameTool,
    SwitchTool,
    AcceptPartial,
}

/// How fully a result satisfies its requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletenessReport {
    pub complete: bool,
    /// Fraction of the requirement met, in `[0, 1]`.
    pub coverage: f64,
    #[serde(default)]
    pub requested_count: Option<usize>,
    #[serde(default)]
    pub found_count: Option<usize>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    /// Text result shorter than the plausibility threshold.
    #[serde(default)]
    pub short_text: bool,
    /// `None` when complete.
    #[serde(default)]
    pub suggested_next_action: Option<NextAction>,
}

impl CompletenessReport {
    pub fn complete() -> Self {
        Self {
            complete: true,
            coverage: 1.0,
            requested_count: None,
            found_count: None,
            missing_fields: vec![],
            short_text: false,
            suggested_next_action: None,
        }
    }
}

/// An explicitly disclosed shortfall in the final answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gap {
    pub subtask_id: String,
    pub tool: String,
    pub coverage: f64,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub reason: String,
}

/// Task-level status as seen through the engine surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// What the user ultimately receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub gaps: Vec<Gap>,
    #[serde(default)]
    pub failure: Option<String>,
}

/// Kind of failure handed to the Planner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    TransientExhausted,
    Permanent,
}

/// Everything the Planner needs to revise a failing plan.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub task_id: TaskId,
    pub task_description: String,
    pub subtask: SubtaskSpec,
    pub kind: FailureKind,
    pub error: String,
    /// Subtasks that have not run yet.
    pub remaining: Vec<SubtaskSpec>,
}

/// Planner response to a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplanDecision {
    /// Replace all not-yet-run subtasks.
    Plan { plan: Plan },
    /// Run one replacement subtask.
    Subtask { subtask: SubtaskSpec },
    Irrecoverable { reason: String },
}

/// What the engine saw after the last adaptive step.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub subtask_id: String,
    pub tool: String,
    pub status: SubtaskStatus,
    pub report: Option<CompletenessReport>,
    pub error: Option<String>,
}

/// Planner response in adaptive mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextStep {
    Subtask { subtask: SubtaskSpec },
    Done,
}

/// Context passed to `Planner::plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningContext {
    pub task_id: TaskId,
    /// Tools the engine can actually run.
    pub available_tools: Vec<String>,
}

/// Event broadcast to all subscribers while a task runs.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskStarted {
        task_id: TaskId,
        description: String,
    },
    /// A subtask moved to a new status. `preview` is a capped rendering of
    /// the committed output.
    SubtaskStatusChanged {
        task_id: TaskId,
        subtask_id: String,
        tool: String,
        status: SubtaskStatus,
        preview: Option<String>,
    },
    SubtaskRetrying {
        task_id: TaskId,
        subtask_id: String,
        tool: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    FollowUpQueued {
        task_id: TaskId,
        root: String,
        subtask_id: String,
        tool: String,
        action: NextAction,
    },
    ReplanRequested {
        task_id: TaskId,
        subtask_id: String,
        error: String,
    },
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::SubtaskStatusChanged { task_id, .. }
            | Self::SubtaskRetrying { task_id, .. }
            | Self::FollowUpQueued { task_id, .. }
            | Self::ReplanRequested { task_id, .. }
            | Self::TaskFinished { task_id, .. } => task_id,
        }
    }
}
