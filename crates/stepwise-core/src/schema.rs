use serde::{Deserialize, Serialize};

use crate::reference::SourcePattern;

/// Declarative description of one tool's inputs and outputs.
///
/// Schemas are the single place where "which output feeds which input" is
/// declared. They are static configuration, never computed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub tool: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputField>,
    /// Pass output keys no extractor claims through into the dynamic bucket.
    #[serde(default)]
    pub allow_dynamic: bool,
    /// Parameter carrying the requested record count (e.g. `max_results`).
    #[serde(default)]
    pub count_param: Option<String>,
    #[serde(default)]
    pub follow_up: FollowUpPolicy,
    /// Timeout budget for this tool, overriding the global default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolSchema {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            description: String::new(),
            inputs: vec![],
            outputs: vec![],
            allow_dynamic: false,
            count_param: None,
            follow_up: FollowUpPolicy::default(),
            timeout_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, extractor: Extractor) -> Self {
        self.outputs.push(OutputField {
            name: name.into(),
            extractor,
        });
        self
    }

    pub fn with_dynamic(mut self, allow: bool) -> Self {
        self.allow_dynamic = allow;
        self
    }

    pub fn with_count_param(mut self, param: impl Into<String>) -> Self {
        self.count_param = Some(param.into());
        self
    }

    pub fn with_follow_up(mut self, policy: FollowUpPolicy) -> Self {
        self.follow_up = policy;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &InputSpec> {
        self.inputs.iter().filter(|i| i.required)
    }
}

/// A declared input and the ranked sources that can fill it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Candidate sources in priority order; the first that resolves wins.
    #[serde(default)]
    pub sources: Vec<SourcePattern>,
}

fn default_required() -> bool {
    true
}

impl InputSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            sources: vec![],
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            sources: vec![],
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourcePattern>) -> Self {
        self.sources = sources;
        self
    }
}

/// A named output produced by applying an extractor to the raw result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub extractor: Extractor,
}

/// How to pull one named field out of a heterogeneous tool payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extractor {
    /// Every distinct http(s) URL in the payload's text, in order.
    Urls,
    /// The value at a field path of a record or structured map.
    Path { path: String },
    /// The payload's records as an array.
    Records,
    /// One field collected from every record.
    Pluck { field: String },
    /// The payload text.
    Text,
    /// The number of records.
    Count,
    /// Every match (or capture group) of a regular expression over the text.
    Regex {
        pattern: String,
        #[serde(default)]
        group: usize,
    },
}

impl Extractor {
    /// The top-level payload keys this extractor consumes, if any.
    pub fn claimed_key(&self) -> Option<&str> {
        match self {
            Extractor::Path { path } => path.split(['.', '[']).next(),
            _ => None,
        }
    }
}

/// How the engine may close a completeness shortfall for this tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpPolicy {
    /// Re-run against the next index of the indexed source that fed an input.
    #[serde(default = "default_advance_source")]
    pub advance_source: bool,
    /// Parameter to advance by the number of records already found.
    #[serde(default)]
    pub offset_param: Option<String>,
    /// Alternate tools to switch to, in preference order.
    #[serde(default)]
    pub alternates: Vec<String>,
}

fn default_advance_source() -> bool {
    true
}

impl Default for FollowUpPolicy {
    fn default() -> Self {
        Self {
            advance_source: default_advance_source(),
            offset_param: None,
            alternates: vec![],
        }
    }
}
