use std::io::Write;
use std::time::Duration;

use stepwise_core::config::StepwiseConfig;
use stepwise_core::schema::Extractor;
use stepwise_tools::SchemaRegistry;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_subtasks = 12
max_iterations = 6
max_follow_ups = 2
max_replans = 1
max_concurrency = 8
parallel = false

[retry]
max_retries = 5
initial_backoff_ms = 250
max_backoff_ms = 4000
jitter = false

[evaluator]
min_text_chars = 20
truncate_above_chars = 400
preview_chars = 200

[timeouts]
default_secs = 15

[timeouts.tools]
browse = 180

[log]
log_dir = "/tmp/stepwise-test-logs"
level = 3

[[schemas]]
tool = "catalog"
count_param = "limit"

[[schemas.inputs]]
name = "query"
sources = ["search.summary"]

[[schemas.outputs]]
name = "records"
extractor = { type = "records" }
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = StepwiseConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_subtasks, 12);
    assert_eq!(config.engine.max_follow_ups, 2);
    assert!(!config.engine.parallel);
    assert_eq!(config.retry.max_retries, 5);
    assert!(!config.retry.jitter);
    assert_eq!(config.evaluator.preview_chars, 200);
    assert_eq!(config.evaluator.truncation_marker, "…[truncated]");
    assert_eq!(config.timeouts.for_tool("browse"), Some(Duration::from_secs(180)));
    assert_eq!(config.timeouts.for_tool("search"), None);
    assert_eq!(config.timeouts.default_timeout(), Duration::from_secs(15));

    let log = config.log.as_ref().expect("log section");
    assert!(log.enabled);
    assert_eq!(log.level, 3);

    let schemas = SchemaRegistry::from_config(&config);
    let catalog = schemas.get("catalog").expect("catalog schema");
    assert_eq!(catalog.count_param.as_deref(), Some("limit"));
    assert_eq!(catalog.inputs[0].sources[0].to_string(), "search.summary");
    assert_eq!(catalog.outputs[0].extractor, Extractor::Records);
    assert!(schemas.contains("search"), "built-ins stay alongside config schemas");
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("STEPWISE_TEST_LOG_DIR", "/var/log/stepwise-ci");
    let config = StepwiseConfig::from_toml(
        r#"
[log]
log_dir = "${STEPWISE_TEST_LOG_DIR}"
"#,
    )
    .expect("parse");
    assert_eq!(
        config.log.unwrap().dir().to_string_lossy(),
        "/var/log/stepwise-ci"
    );
}

#[test]
fn test_empty_file_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    let config = StepwiseConfig::load(tmp.path()).expect("load empty config");

    assert_eq!(config.engine.max_subtasks, 50);
    assert_eq!(config.engine.max_iterations, 20);
    assert_eq!(config.engine.max_follow_ups, 5);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.initial_backoff_ms, 500);
    assert_eq!(config.evaluator.truncate_above_chars, 500);
    assert!(config.log.is_none());
    assert!(config.schemas.is_empty());
}

#[test]
fn test_config_schema_overrides_builtin() {
    let config = StepwiseConfig::from_toml(
        r#"
[[schemas]]
tool = "search"
timeout_secs = 5

[[schemas.inputs]]
name = "q"
"#,
    )
    .expect("parse");

    let schemas = SchemaRegistry::from_config(&config);
    let search = schemas.get("search").unwrap();
    assert_eq!(search.timeout_secs, Some(5));
    assert_eq!(search.inputs[0].name, "q");
}

#[test]
fn test_invalid_config_rejected() {
    let zero_ceiling = StepwiseConfig::from_toml("[engine]\nmax_iterations = 0\n");
    assert!(zero_ceiling.is_err());

    let preview_too_long = StepwiseConfig::from_toml(
        "[evaluator]\ntruncate_above_chars = 100\npreview_chars = 300\n",
    );
    assert!(preview_too_long.is_err());

    let bad_pattern = StepwiseConfig::from_toml(
        r#"
[[schemas]]
tool = "broken"

[[schemas.inputs]]
name = "url"
sources = ["search..urls"]
"#,
    );
    assert!(bad_pattern.is_err());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = StepwiseConfig::load(std::path::Path::new("/nonexistent/stepwise.toml"))
        .unwrap_err();
    assert!(matches!(
        err,
        stepwise_core::StepwiseError::ConfigNotFound(_)
    ));
}
