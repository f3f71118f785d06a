use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Resolution errors
    #[error("Required input unresolvable: {subtask}: {input}")]
    Resolution { subtask: String, input: String },

    #[error("Invalid source reference: {0}")]
    InvalidReference(String),

    #[error("Output already committed for subtask: {0}")]
    DuplicateEntry(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("No schema registered for tool: {0}")]
    UnknownSchema(String),

    #[error("Transient tool failure: {tool}: {message}")]
    TransientTool { tool: String, message: String },

    #[error("Permanent tool failure: {tool}: {message}")]
    PermanentTool { tool: String, message: String },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    // Plan errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Plan exhausted: {0}")]
    PlanExhausted(String),

    #[error("Planner failed: {0}")]
    Planner(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Task cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    /// Whether the failure is worth retrying with the same parameters.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StepwiseError::TransientTool { .. } | StepwiseError::ToolTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = StepwiseError::ToolTimeout {
            tool: "browse".into(),
            timeout_ms: 100,
        };
        assert!(timeout.is_transient());

        let permanent = StepwiseError::PermanentTool {
            tool: "browse".into(),
            message: "404 not found".into(),
        };
        assert!(!permanent.is_transient());
        assert!(!StepwiseError::Cancelled.is_transient());
    }

    #[test]
    fn test_resolution_message_names_input() {
        let err = StepwiseError::Resolution {
            subtask: "s2".into(),
            input: "url".into(),
        };
        assert_eq!(err.to_string(), "Required input unresolvable: s2: url");
    }
}
