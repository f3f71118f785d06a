use std::collections::HashSet;

use tracing::warn;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::reference::templates_in_value;
use stepwise_core::types::{Plan, SubtaskSpec, SubtaskStatus};
use stepwise_tools::{SchemaRegistry, ToolRegistry};

/// Structural checks on Planner output before the engine accepts it.
pub struct PlanValidator<'a> {
    schemas: &'a SchemaRegistry,
    tools: Option<&'a ToolRegistry>,
}

impl<'a> PlanValidator<'a> {
    /// Validate against schemas only (no runnable tools needed).
    pub fn new(schemas: &'a SchemaRegistry) -> Self {
        Self {
            schemas,
            tools: None,
        }
    }

    /// Also require every tool to be registered and runnable.
    pub fn with_tools(mut self, tools: &'a ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Validate a whole plan. `existing` holds ids already in the running task.
    ///
    /// Statuses are reset to `pending`; Planner-supplied statuses are ignored.
    pub fn validate_plan(&self, plan: &mut Plan, existing: &HashSet<String>) -> Result<()> {
        let mut known = existing.clone();
        for subtask in &plan.subtasks {
            if subtask.id.trim().is_empty() {
                return Err(StepwiseError::InvalidPlan("subtask with empty id".into()));
            }
            if !known.insert(subtask.id.clone()) {
                return Err(StepwiseError::InvalidPlan(format!(
                    "duplicate subtask id '{}'",
                    subtask.id
                )));
            }
        }
        for subtask in &mut plan.subtasks {
            self.check(subtask, &known)?;
            subtask.status = SubtaskStatus::Pending;
        }
        Ok(())
    }

    /// Validate one subtask about to be appended to a running task.
    pub fn validate_subtask(
        &self,
        subtask: &mut SubtaskSpec,
        existing: &HashSet<String>,
    ) -> Result<()> {
        if subtask.id.trim().is_empty() {
            return Err(StepwiseError::InvalidPlan("subtask with empty id".into()));
        }
        if existing.contains(&subtask.id) {
            return Err(StepwiseError::InvalidPlan(format!(
                "duplicate subtask id '{}'",
                subtask.id
            )));
        }
        let mut known = existing.clone();
        known.insert(subtask.id.clone());
        self.check(subtask, &known)?;
        subtask.status = SubtaskStatus::Pending;
        Ok(())
    }

    fn check(&self, subtask: &SubtaskSpec, known: &HashSet<String>) -> Result<()> {
        let invalid = |msg: String| {
            warn!(subtask = %subtask.id, tool = %subtask.tool, reason = %msg, "Rejected planner output");
            StepwiseError::InvalidPlan(msg)
        };

        if !self.schemas.contains(&subtask.tool) {
            return Err(invalid(format!(
                "subtask '{}' names unknown tool '{}'",
                subtask.id, subtask.tool
            )));
        }
        if let Some(tools) = self.tools {
            if !tools.contains(&subtask.tool) {
                return Err(invalid(format!(
                    "subtask '{}' names tool '{}' with no registered implementation",
                    subtask.id, subtask.tool
                )));
            }
        }
        for dep in &subtask.depends_on {
            if dep == &subtask.id {
                return Err(invalid(format!("subtask '{}' depends on itself", subtask.id)));
            }
            if !known.contains(dep) {
                return Err(invalid(format!(
                    "subtask '{}' depends on unknown subtask '{}'",
                    subtask.id, dep
                )));
            }
        }
        for template in templates_in_value(&serde_json::Value::Object(subtask.params.clone())) {
            if let Err(e) = template.pattern() {
                return Err(invalid(format!("subtask '{}': {}", subtask.id, e)));
            }
        }
        Ok(())
    }
}
