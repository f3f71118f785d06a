use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use stepwise_core::data::AccumulatedData;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::reference::{templates_in, whole_template, SourcePattern};
use stepwise_core::schema::ToolSchema;
use stepwise_core::types::SubtaskSpec;

/// Where a resolved parameter value came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum Provenance {
    Literal,
    /// An inline `{{...}}` reference in the parameter value (the first one,
    /// when the value holds several).
    Template(SourcePattern),
    /// A candidate source declared by the tool schema.
    Schema(SourcePattern),
}

impl Provenance {
    /// The pattern that produced the value, if any.
    pub fn pattern(&self) -> Option<&SourcePattern> {
        match self {
            Provenance::Literal => None,
            Provenance::Template(p) | Provenance::Schema(p) => Some(p),
        }
    }
}

/// A subtask's parameters with every template substituted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedParameters {
    pub values: Map<String, Value>,
    pub provenance: BTreeMap<String, Provenance>,
    /// Optional parameters left out because their templates did not resolve.
    pub dropped: Vec<String>,
}

impl ResolvedParameters {
    fn insert(&mut self, key: &str, value: Value, provenance: Provenance) {
        self.values.insert(key.to_string(), value);
        self.provenance.insert(key.to_string(), provenance);
    }
}

enum Substituted {
    Literal,
    Resolved(Value, SourcePattern),
    Unresolved(String),
}

/// Fills a subtask's inputs from accumulated outputs.
///
/// Resolution is a pure function of the subtask, its schema and the data,
/// so resolving twice against the same data yields identical parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataFlowResolver;

impl DataFlowResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        subtask: &SubtaskSpec,
        schema: &ToolSchema,
        data: &AccumulatedData,
    ) -> Result<ResolvedParameters> {
        let mut resolved = ResolvedParameters::default();

        for (key, value) in &subtask.params {
            let required = schema.input(key).map(|i| i.required).unwrap_or(false);
            match substitute(value, data) {
                Substituted::Literal => {
                    if required && is_missing(value) {
                        debug!(subtask = %subtask.id, input = %key, "Empty literal for required input");
                        continue;
                    }
                    resolved.insert(key, value.clone(), Provenance::Literal);
                }
                Substituted::Resolved(v, pattern) => {
                    if required && is_missing(&v) {
                        debug!(subtask = %subtask.id, input = %key, pattern = %pattern, "Template resolved to empty value");
                        continue;
                    }
                    resolved.insert(key, v, Provenance::Template(pattern));
                }
                Substituted::Unresolved(reference) => {
                    if required {
                        debug!(
                            subtask = %subtask.id,
                            input = %key,
                            reference = %reference,
                            "Template unresolved, trying schema sources"
                        );
                    } else {
                        debug!(
                            subtask = %subtask.id,
                            param = %key,
                            reference = %reference,
                            "Dropping optional parameter with unresolved template"
                        );
                        resolved.dropped.push(key.clone());
                    }
                }
            }
        }

        for input in schema.required_inputs() {
            if resolved.values.contains_key(&input.name) {
                continue;
            }
            let found = input.sources.iter().find_map(|pattern| {
                data.resolve(pattern)
                    .filter(|(_, v)| !is_missing(v))
                    .map(|(_, v)| (pattern, v.clone()))
            });
            match found {
                Some((pattern, value)) => {
                    debug!(
                        subtask = %subtask.id,
                        input = %input.name,
                        pattern = %pattern,
                        "Input filled from schema source"
                    );
                    resolved.insert(&input.name, value, Provenance::Schema(pattern.clone()));
                }
                None => {
                    return Err(StepwiseError::Resolution {
                        subtask: subtask.id.clone(),
                        input: input.name.clone(),
                    })
                }
            }
        }

        Ok(resolved)
    }
}

/// Null, blank strings and empty collections never count as a provided value.
fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn substitute(value: &Value, data: &AccumulatedData) -> Substituted {
    match value {
        Value::String(s) => substitute_str(s, data),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut first = None;
            for item in items {
                match substitute(item, data) {
                    Substituted::Literal => out.push(item.clone()),
                    Substituted::Resolved(v, pattern) => {
                        first.get_or_insert(pattern);
                        out.push(v);
                    }
                    Substituted::Unresolved(r) => return Substituted::Unresolved(r),
                }
            }
            match first {
                Some(pattern) => Substituted::Resolved(Value::Array(out), pattern),
                None => Substituted::Literal,
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            let mut first = None;
            for (k, item) in map {
                match substitute(item, data) {
                    Substituted::Literal => {
                        out.insert(k.clone(), item.clone());
                    }
                    Substituted::Resolved(v, pattern) => {
                        first.get_or_insert(pattern);
                        out.insert(k.clone(), v);
                    }
                    Substituted::Unresolved(r) => return Substituted::Unresolved(r),
                }
            }
            match first {
                Some(pattern) => Substituted::Resolved(Value::Object(out), pattern),
                None => Substituted::Literal,
            }
        }
        _ => Substituted::Literal,
    }
}

fn substitute_str(text: &str, data: &AccumulatedData) -> Substituted {
    // A lone template keeps the referenced value's JSON type.
    if let Some(whole) = whole_template(text) {
        let Ok(pattern) = whole.pattern() else {
            return Substituted::Unresolved(whole.raw);
        };
        return match data.resolve(&pattern) {
            Some((_, v)) => Substituted::Resolved(v.clone(), pattern),
            None => Substituted::Unresolved(whole.raw),
        };
    }

    let refs = templates_in(text);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut first = None;
    for r in &refs {
        let Ok(pattern) = r.pattern() else {
            return Substituted::Unresolved(r.raw.clone());
        };
        let Some((_, v)) = data.resolve(&pattern) else {
            return Substituted::Unresolved(r.raw.clone());
        };
        out.push_str(&text[last..r.span.start]);
        match v {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = r.span.end;
        first.get_or_insert(pattern);
    }
    match first {
        Some(pattern) => {
            out.push_str(&text[last..]);
            Substituted::Resolved(Value::String(out), pattern)
        }
        None => Substituted::Literal,
    }
}
