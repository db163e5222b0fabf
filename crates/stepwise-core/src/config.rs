use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StepwiseError};
use crate::types::BreakpointKind;

/// Top-level stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub visualizer: VisualizerConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub breakpoints: Vec<BreakpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerConfig {
    /// Block at breakpoints and wait for operator commands.
    #[serde(default)]
    pub interactive: bool,
    /// Start in single-step mode (pause before every node).
    #[serde(default)]
    pub step_mode: bool,
    /// Number of trace events included in a pause report.
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,
    /// The reference executor stops a walk once a node exceeds this many visits.
    #[serde(default = "default_max_visits_per_node")]
    pub max_visits_per_node: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            step_mode: false,
            recent_events: default_recent_events(),
            max_visits_per_node: default_max_visits_per_node(),
        }
    }
}

fn default_recent_events() -> usize { 5 }
fn default_max_visits_per_node() -> usize { 5 }

/// Output format for static graph rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    #[default]
    Ascii,
    Mermaid,
    Dot,
}

impl std::str::FromStr for RenderFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ascii" | "text" => Ok(Self::Ascii),
            "mermaid" => Ok(Self::Mermaid),
            "dot" | "graphviz" => Ok(Self::Dot),
            other => Err(format!("unknown render format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizerConfig {
    /// Maximum number of edges in an enumerated path.
    #[serde(default = "default_max_path_depth")]
    pub max_path_depth: usize,
    #[serde(default)]
    pub format: RenderFormat,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            max_path_depth: default_max_path_depth(),
            format: RenderFormat::default(),
        }
    }
}

fn default_max_path_depth() -> usize { 10 }

/// Debug event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./stepwise-logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = session summary, 2 = breakpoints and pauses, 3 = per-node (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolved_dir(&self) -> PathBuf {
        match self.log_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => PathBuf::from("stepwise-logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// A breakpoint declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointConfig {
    pub target: String,
    #[serde(default = "default_breakpoint_kind")]
    pub kind: BreakpointKind,
    /// Optional textual condition, e.g. `attempts > 1`.
    #[serde(default)]
    pub condition: Option<String>,
}

fn default_breakpoint_kind() -> BreakpointKind {
    BreakpointKind::NodeEnter
}

impl StepwiseConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepwiseError::Config(e.to_string()))?;
        debug!(
            path = %path.display(),
            breakpoints = config.breakpoints.len(),
            interactive = config.debugger.interactive,
            "Config loaded"
        );
        Ok(config)
    }

    /// Load the config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPWISE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPWISE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPWISE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: StepwiseConfig = toml::from_str("").unwrap();
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
    fn test_breakpoint_kind_defaults_to_node_enter() {
        let toml_str = r#"
[[breakpoints]]
target = "transform"

[[breakpoints]]
target = "web_search"
kind = "tool_call"
condition = 'query contains "rust"'
"#;
        let config: StepwiseConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.breakpoints.len(), 2);
        assert_eq!(config.breakpoints[0].kind, BreakpointKind::NodeEnter);
        assert!(config.breakpoints[0].condition.is_none());
        assert_eq!(config.breakpoints[1].kind, BreakpointKind::ToolCall);
        assert_eq!(
            config.breakpoints[1].condition.as_deref(),
            Some(r#"query contains "rust""#)
        );
    }

    #[test]
    fn test_log_section_defaults() {
        let config: StepwiseConfig = toml::from_str("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
        assert_eq!(log.resolved_dir(), PathBuf::from("stepwise-logs"));
    }

    #[test]
    fn test_render_format_parse() {
        assert_eq!("graphviz".parse::<RenderFormat>(), Ok(RenderFormat::Dot));
        assert_eq!("Mermaid".parse::<RenderFormat>(), Ok(RenderFormat::Mermaid));
        assert!("svg".parse::<RenderFormat>().is_err());
    }
}
