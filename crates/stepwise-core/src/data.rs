use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, StepwiseError};
use crate::reference::{walk, SourcePattern};
use crate::types::{CompletenessReport, Payload, RawResult, ToolResult};

/// The committed output of one completed subtask. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// Commit order within the task, assigned by `AccumulatedData::commit`.
    pub seq: usize,
    pub subtask_id: String,
    pub tool: String,
    /// Named fields produced by the schema's extractors.
    pub fields: Map<String, Value>,
    /// Top-level output keys no extractor claimed, preserved verbatim.
    pub dynamic: Map<String, Value>,
    /// Context-facing view of `fields` + `dynamic` with long text capped.
    pub context: Map<String, Value>,
    /// The untruncated result.
    pub raw: ToolResult,
    pub report: Option<CompletenessReport>,
    /// Committed with a coverage shortfall.
    pub partial: bool,
    pub recorded_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(
        subtask_id: impl Into<String>,
        tool: impl Into<String>,
        fields: Map<String, Value>,
        raw: ToolResult,
    ) -> Self {
        Self {
            seq: 0,
            subtask_id: subtask_id.into(),
            tool: tool.into(),
            context: fields.clone(),
            fields,
            dynamic: Map::new(),
            raw,
            report: None,
            partial: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_dynamic(mut self, dynamic: Map<String, Value>) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_report(mut self, report: CompletenessReport) -> Self {
        self.partial = !report.complete;
        self.report = Some(report);
        self
    }

    /// Look up a pattern's path in this entry's fields, then its dynamic bucket.
    pub fn lookup(&self, pattern: &SourcePattern) -> Option<&Value> {
        let key = pattern.field();
        let root = self.fields.get(key).or_else(|| self.dynamic.get(key))?;
        walk(root, pattern.path.get(1..).unwrap_or(&[]))
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.raw.payload.as_ref()
    }
}

/// Append-only, task-scoped store of completed subtask outputs.
///
/// Entries are shared behind `Arc` and never mutated after commit, so a
/// cloned `AccumulatedData` is a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct AccumulatedData {
    entries: Vec<Arc<Entry>>,
}

impl AccumulatedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON object of `{ name: { field: value, ... } }`.
    ///
    /// Each top-level key becomes one entry whose subtask id and tool are both
    /// the key. Used for dry runs and fixtures.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            StepwiseError::Config("accumulated data must be a JSON object".into())
        })?;
        let mut data = Self::new();
        for (name, fields) in obj {
            let fields = fields.as_object().cloned().ok_or_else(|| {
                StepwiseError::Config(format!("entry '{}' must be a JSON object", name))
            })?;
            let raw = ToolResult::success(RawResult::new(Payload::StructuredMap(fields.clone())));
            data.commit(Entry::new(name.clone(), name.clone(), fields, raw))?;
        }
        Ok(data)
    }

    /// Commit a completed subtask's output. The one and only write path.
    pub fn commit(&mut self, mut entry: Entry) -> Result<Arc<Entry>> {
        if self.get(&entry.subtask_id).is_some() {
            return Err(StepwiseError::DuplicateEntry(entry.subtask_id));
        }
        entry.seq = self.entries.len();
        let entry = Arc::new(entry);
        self.entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn entries(&self) -> &[Arc<Entry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a specific subtask id.
    pub fn get(&self, subtask_id: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.subtask_id == subtask_id)
            .map(|e| e.as_ref())
    }

    /// Successful runs of a tool, most recent first.
    pub fn runs_of(&self, tool: &str) -> impl Iterator<Item = &Entry> + '_ {
        let tool = tool.to_string();
        self.entries
            .iter()
            .rev()
            .filter(move |e| e.tool == tool && e.raw.success)
            .map(|e| e.as_ref())
    }

    /// Whether `source` names any committed subtask or tool.
    pub fn has_source(&self, source: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.subtask_id == source || e.tool == source)
    }

    /// Resolve a pattern against committed outputs.
    ///
    /// A source naming a subtask id reads exactly that entry. A source naming
    /// a tool walks its successful runs most-recent-first and returns the
    /// first run whose path resolves.
    pub fn resolve(&self, pattern: &SourcePattern) -> Option<(&Entry, &Value)> {
        if let Some(entry) = self.get(&pattern.source) {
            return entry.lookup(pattern).map(|v| (entry, v));
        }
        self.runs_of(&pattern.source)
            .find_map(|entry| entry.lookup(pattern).map(|v| (entry, v)))
    }

    /// Union of every record produced by a tool, in commit order.
    pub fn records(&self, tool: &str) -> Vec<Map<String, Value>> {
        self.entries
            .iter()
            .filter(|e| e.tool == tool)
            .filter_map(|e| e.raw.payload.as_ref())
            .flat_map(|p| p.records().into_iter().cloned())
            .collect()
    }

    /// Truncated view keyed by subtask id, for planners and synthesizers.
    pub fn context_view(&self) -> Value {
        let mut view = Map::new();
        for entry in &self.entries {
            let mut item = Map::new();
            item.insert("tool".into(), Value::String(entry.tool.clone()));
            item.insert("fields".into(), Value::Object(entry.context.clone()));
            if entry.partial {
                item.insert("partial".into(), Value::Bool(true));
            }
            view.insert(entry.subtask_id.clone(), Value::Object(item));
        }
        Value::Object(view)
    }
}
