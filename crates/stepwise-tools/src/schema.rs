use std::collections::HashMap;
use std::sync::Arc;

use stepwise_core::config::StepwiseConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::reference::SourcePattern;
use stepwise_core::schema::{Extractor, FollowUpPolicy, InputSpec, ToolSchema};

/// Read-only catalog of tool schemas.
///
/// Built once from static configuration; a task holds an `Arc` snapshot and
/// never sees later registrations.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<ToolSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one for the same tool.
    pub fn register(&mut self, schema: ToolSchema) {
        self.schemas.insert(schema.tool.clone(), Arc::new(schema));
    }

    pub fn get(&self, tool: &str) -> Option<Arc<ToolSchema>> {
        self.schemas.get(tool).cloned()
    }

    /// Schema lookup that fails for unknown tools.
    pub fn schema_for(&self, tool: &str) -> Result<Arc<ToolSchema>> {
        self.get(tool)
            .ok_or_else(|| StepwiseError::UnknownSchema(tool.to_string()))
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.schemas.contains_key(tool)
    }

    /// Tool names, sorted.
    pub fn tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Built-in catalog with config-declared schemas merged over it.
    pub fn from_config(config: &StepwiseConfig) -> Self {
        let mut registry = Self::with_builtins();
        for schema in &config.schemas {
            registry.register(schema.clone());
        }
        registry
    }

    /// Create a registry with the built-in tool schemas.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(
            ToolSchema::new("search")
                .with_description("Web search returning a text digest of results")
                .with_input(InputSpec::required("query"))
                .with_input(InputSpec::optional("max_results"))
                .with_input(InputSpec::optional("offset"))
                .with_output("urls", Extractor::Urls)
                .with_output("summary", Extractor::Text)
                .with_count_param("max_results")
                .with_follow_up(FollowUpPolicy {
                    advance_source: false,
                    offset_param: Some("offset".into()),
                    alternates: vec![],
                })
                .with_dynamic(true),
        );

        registry.register(
            ToolSchema::new("browse")
                .with_description("Load a page and return its visible text")
                .with_input(
                    InputSpec::required("url").with_sources(patterns(&["search.urls[0]"])),
                )
                .with_output("text", Extractor::Text)
                .with_output("links", Extractor::Urls)
                .with_timeout_secs(120)
                .with_dynamic(true),
        );

        registry.register(
            ToolSchema::new("extract")
                .with_description("Extract structured records from a page")
                .with_input(InputSpec::required("url").with_sources(patterns(&[
                    "search.urls[0]",
                    "browse.links[0]",
                ])))
                .with_input(InputSpec::optional("fields"))
                .with_input(InputSpec::optional("limit"))
                .with_output("records", Extractor::Records)
                .with_output("count", Extractor::Count)
                .with_output(
                    "titles",
                    Extractor::Pluck {
                        field: "title".into(),
                    },
                )
                .with_count_param("limit")
                .with_timeout_secs(90)
                .with_dynamic(true),
        );

        registry.register(
            ToolSchema::new("calculate")
                .with_description("Evaluate an arithmetic expression")
                .with_input(InputSpec::required("expression"))
                .with_output(
                    "value",
                    Extractor::Path {
                        path: "result".into(),
                    },
                ),
        );

        registry.register(
            ToolSchema::new("export")
                .with_description("Write records to a file")
                .with_input(InputSpec::required("records").with_sources(patterns(&[
                    "extract.records",
                    "search.urls",
                ])))
                .with_input(InputSpec::optional("format"))
                .with_output(
                    "path",
                    Extractor::Path {
                        path: "path".into(),
                    },
                ),
        );

        registry
    }
}

// Built-in patterns are literals; a typo is dropped rather than panicking.
fn patterns(raw: &[&str]) -> Vec<SourcePattern> {
    raw.iter().filter_map(|p| SourcePattern::parse(p).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = SchemaRegistry::with_builtins();
        assert_eq!(
            registry.tools(),
            vec!["browse", "calculate", "export", "extract", "search"]
        );
        let extract = registry.schema_for("extract").unwrap();
        let url = extract.input("url").unwrap();
        assert!(url.required);
        assert_eq!(url.sources[0].to_string(), "search.urls[0]");
        assert_eq!(url.sources[1].to_string(), "browse.links[0]");
    }

    #[test]
    fn test_unknown_schema() {
        let registry = SchemaRegistry::with_builtins();
        assert!(matches!(
            registry.schema_for("teleport"),
            Err(StepwiseError::UnknownSchema(_))
        ));
    }

    #[test]
    fn test_config_schemas_override_builtins() {
        let toml_str = r#"
[[schemas]]
tool = "search"
[[schemas.inputs]]
name = "q"

[[schemas]]
tool = "lookup"
[[schemas.outputs]]
name = "answer"
extractor = { type = "text" }
"#;
        let config = StepwiseConfig::from_toml(toml_str).unwrap();
        let registry = SchemaRegistry::from_config(&config);
        assert!(registry.contains("lookup"));
        let search = registry.schema_for("search").unwrap();
        assert_eq!(search.inputs.len(), 1);
        assert_eq!(search.inputs[0].name, "q");
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let mut registry = SchemaRegistry::with_builtins();
        let snapshot = Arc::new(registry.clone());
        registry.register(ToolSchema::new("late"));
        assert!(!snapshot.contains("late"));
        assert!(registry.contains("late"));
    }
}
