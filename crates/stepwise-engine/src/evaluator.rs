use serde_json::{Map, Value};
use tracing::debug;

use stepwise_core::config::EvaluatorConfig;
use stepwise_core::schema::ToolSchema;
use stepwise_core::types::{
    CompletenessReport, NextAction, Payload, Requirement, SubtaskSpec, ToolResult,
};

/// Judges whether a result satisfies the requirement that produced it.
///
/// A shortfall is never an error: the report only tells the engine how to
/// extend the plan.
#[derive(Debug, Clone)]
pub struct CompletenessEvaluator {
    config: EvaluatorConfig,
}

impl CompletenessEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    /// The effective requirement for a subtask.
    ///
    /// Without an explicit count, the schema's `count_param` is read from the
    /// resolved parameters.
    pub fn requirement_for(
        &self,
        subtask: &SubtaskSpec,
        schema: &ToolSchema,
        params: &Map<String, Value>,
    ) -> Requirement {
        let mut requirement = subtask.requirement.clone().unwrap_or_default();
        if requirement.count.is_none() {
            requirement.count = schema
                .count_param
                .as_ref()
                .and_then(|p| params.get(p))
                .and_then(as_count);
        }
        requirement
    }

    pub fn evaluate(
        &self,
        subtask: &SubtaskSpec,
        schema: &ToolSchema,
        result: &ToolResult,
        requirement: &Requirement,
    ) -> CompletenessReport {
        let mut report = CompletenessReport::complete();
        let Some(payload) = result.payload.as_ref().filter(|_| result.success) else {
            report.complete = false;
            report.coverage = 0.0;
            report.suggested_next_action = Some(NextAction::Retry);
            return report;
        };

        let mut coverage: f64 = 1.0;
        let mut action = None;

        // Count shortfall. Payloads without records are not countable.
        if let (Some(requested), Some(found)) = (requirement.count, payload.record_count()) {
            report.requested_count = Some(requested);
            report.found_count = Some(found);
            if requested > 0 && found < requested {
                coverage = coverage.min(found as f64 / requested as f64);
                action.get_or_insert(NextAction::FollowUpSameTool);
            }
        }

        // Required fields.
        if !requirement.fields.is_empty() {
            let records = payload.records();
            let missing: Vec<String> = requirement
                .fields
                .iter()
                .filter(|f| records.is_empty() || records.iter().any(|r| is_absent(r.get(*f))))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let present = requirement.fields.len() - missing.len();
                coverage = coverage.min(present as f64 / requirement.fields.len() as f64);
                action.get_or_insert(if schema.follow_up.alternates.is_empty() {
                    NextAction::FollowUpSameTool
                } else {
                    NextAction::SwitchTool
                });
                report.missing_fields = missing;
            }
        }

        // Implausibly short text.
        if let Payload::Text(text) = payload {
            let min = requirement
                .min_text_chars
                .unwrap_or(self.config.min_text_chars);
            let len = text.trim().chars().count();
            if min > 0 && len < min {
                report.short_text = true;
                coverage = coverage.min(len as f64 / min as f64);
                action.get_or_insert(NextAction::Retry);
            }
        }

        report.coverage = coverage;
        report.complete = action.is_none();
        report.suggested_next_action = action;
        if !report.complete {
            debug!(
                subtask = %subtask.id,
                tool = %subtask.tool,
                coverage = report.coverage,
                action = ?report.suggested_next_action,
                "Result incomplete"
            );
        }
        report
    }

    /// Context-facing view of extracted outputs with long strings capped.
    ///
    /// Returns the view and the paths of every field that was capped. The
    /// inputs are left untouched.
    pub fn context_view(
        &self,
        fields: &Map<String, Value>,
        dynamic: &Map<String, Value>,
    ) -> (Map<String, Value>, Vec<String>) {
        let mut truncated = Vec::new();
        let mut view = Map::new();
        for (key, value) in dynamic.iter().chain(fields.iter()) {
            view.insert(key.clone(), self.cap(key, value, &mut truncated));
        }
        truncated.sort();
        truncated.dedup();
        (view, truncated)
    }

    fn cap(&self, path: &str, value: &Value, truncated: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) if s.chars().count() > self.config.truncate_above_chars => {
                truncated.push(path.to_string());
                let mut preview: String = s.chars().take(self.config.preview_chars).collect();
                preview.push_str(&self.config.truncation_marker);
                Value::String(preview)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.cap(&format!("{}[{}]", path, i), v, truncated))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.cap(&format!("{}.{}", path, k), v, truncated)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Cap a string for previews in events and logs.
    pub fn preview(&self, text: &str) -> String {
        if text.chars().count() <= self.config.preview_chars {
            return text.to_string();
        }
        let mut preview: String = text.chars().take(self.config.preview_chars).collect();
        preview.push_str(&self.config.truncation_marker);
        preview
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
