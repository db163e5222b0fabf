use std::io::Write;
use std::sync::Arc;

use stepwise_core::config::{RenderFormat, StepwiseConfig};
use stepwise_core::error::StepwiseError;
use stepwise_core::event::EventBus;
use stepwise_core::types::BreakpointKind;
use stepwise_debug::ExecutionController;
use stepwise_graph::{Edge, GraphModel, Node};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[debugger]
interactive = true
step_mode = true
recent_events = 8
max_visits_per_node = 3

[visualizer]
max_path_depth = 4
format = "mermaid"

[log]
log_dir = "/tmp/stepwise-test-logs"
level = 3

[[breakpoints]]
target = "validate"
kind = "node_exit"
condition = "score < 0.5"

[[breakpoints]]
target = "*"
kind = "error"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = StepwiseConfig::load(tmp.path()).expect("load config");

    assert!(config.debugger.interactive);
    assert!(config.debugger.step_mode);
    assert_eq!(config.debugger.recent_events, 8);
    assert_eq!(config.debugger.max_visits_per_node, 3);
    assert_eq!(config.visualizer.max_path_depth, 4);
    assert_eq!(config.visualizer.format, RenderFormat::Mermaid);

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        log.resolved_dir(),
        std::path::PathBuf::from("/tmp/stepwise-test-logs")
    );

    assert_eq!(config.breakpoints.len(), 2);
    assert_eq!(config.breakpoints[0].kind, BreakpointKind::NodeExit);
    assert_eq!(config.breakpoints[0].condition.as_deref(), Some("score < 0.5"));
    assert_eq!(config.breakpoints[1].target, "*");
    assert_eq!(config.breakpoints[1].kind, BreakpointKind::Error);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPWISE_TEST_LOG_DIR", "/tmp/expanded-logs");

    let toml_content = r#"
[log]
log_dir = "${STEPWISE_TEST_LOG_DIR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = StepwiseConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.log.expect("log present").log_dir.as_deref(),
        Some("/tmp/expanded-logs")
    );

    std::env::remove_var("STEPWISE_TEST_LOG_DIR");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"# nothing configured\n").expect("write toml");

    let config = StepwiseConfig::load(tmp.path()).expect("load config");

    assert!(!config.debugger.interactive);
    assert!(!config.debugger.step_mode);
    assert_eq!(config.debugger.recent_events, 5);
    assert_eq!(config.debugger.max_visits_per_node, 5);
    assert_eq!(config.visualizer.max_path_depth, 10);
    assert_eq!(config.visualizer.format, RenderFormat::Ascii);
    assert!(config.log.is_none());
    assert!(config.breakpoints.is_empty());
}

#[test]
fn test_missing_and_malformed_files() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("stepwise.toml");

    assert!(matches!(
        StepwiseConfig::load(&missing),
        Err(StepwiseError::ConfigNotFound(_))
    ));
    let fallback = StepwiseConfig::load_or_default(&missing).expect("defaults");
    assert!(fallback.breakpoints.is_empty());

    std::fs::write(&missing, "[debugger\ninteractive = yes").expect("write toml");
    assert!(matches!(
        StepwiseConfig::load(&missing),
        Err(StepwiseError::Config(_))
    ));
}

#[test]
fn test_config_breakpoints_populate_controller() {
    let toml_content = r#"
[[breakpoints]]
target = "transform"

[[breakpoints]]
target = "transform"
kind = "tool_call"
condition = "exists records"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    let config = StepwiseConfig::load(tmp.path()).expect("load config");

    let graph = Arc::new(
        GraphModel::new(
            vec![Node::new("load", "Load"), Node::new("transform", "Transform")],
            vec![Edge::always("load", "transform")],
            "load",
        )
        .expect("valid graph"),
    );
    let controller = ExecutionController::from_config(&config, graph, Arc::new(EventBus::default()))
        .expect("controller");

    let registry = controller.registry();
    assert_eq!(registry.len(), 2);
    assert!(registry.get("transform", BreakpointKind::NodeEnter).is_some());
    let tool = registry
        .get("transform", BreakpointKind::ToolCall)
        .expect("tool breakpoint");
    assert!(tool.condition.is_some());
}

#[test]
fn test_bad_breakpoint_condition_is_a_config_error() {
    let toml_content = r#"
[[breakpoints]]
target = "validate"
condition = "score <"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    let config = StepwiseConfig::load(tmp.path()).expect("load config");

    let graph = Arc::new(
        GraphModel::new(vec![Node::new("validate", "Validate")], vec![], "validate")
            .expect("valid graph"),
    );
    let result = ExecutionController::from_config(&config, graph, Arc::new(EventBus::default()));
    assert!(matches!(result, Err(StepwiseError::Config(_))));
}
