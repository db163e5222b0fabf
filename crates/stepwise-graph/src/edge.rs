use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A directed edge connecting two nodes in the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge id. Left empty in a definition, it is derived as `from->to`.
    #[serde(default)]
    pub id: String,
    /// Source node id.
    #[serde(alias = "source")]
    pub from: String,
    /// Target node id.
    #[serde(alias = "target")]
    pub to: String,
    /// What makes the engine take this edge.
    #[serde(default, alias = "condition")]
    pub trigger: EdgeTrigger,
}

/// Trigger for traversing an edge: a named signal or a condition expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeTrigger {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source node succeeded.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if an expression over the context matches.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl EdgeTrigger {
    /// Signal name, without the expression.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::Conditional { .. } => "conditional",
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::Conditional { expr } => Some(expr),
            _ => None,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional { .. })
    }
}

impl fmt::Display for EdgeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conditional { expr } => write!(f, "conditional: {}", expr),
            other => f.write_str(other.label()),
        }
    }
}

impl Edge {
    fn with_trigger(from: impl Into<String>, to: impl Into<String>, trigger: EdgeTrigger) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: derived_id(&from, &to),
            from,
            to,
            trigger,
        }
    }

    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_trigger(from, to, EdgeTrigger::Always)
    }

    /// Create an edge that fires on success.
    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_trigger(from, to, EdgeTrigger::OnSuccess)
    }

    /// Create an edge that fires on failure.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_trigger(from, to, EdgeTrigger::OnFailure)
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::with_trigger(from, to, EdgeTrigger::Conditional { expr: expr.into() })
    }

    /// Override the derived id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

pub(crate) fn derived_id(from: &str, to: &str) -> String {
    format!("{}->{}", from, to)
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return context
            .get(key)
            .is_some_and(|v| !value_matches(v, value));
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return context.get(key).is_some_and(|v| value_matches(v, value));
    }

    false
}

/// Compare a context value with an expression literal. Strings compare by
/// content, everything else by its JSON rendering (`true`, `3`, `null`).
fn value_matches(value: &serde_json::Value, literal: &str) -> bool {
    match value {
        serde_json::Value::String(s) => s == literal,
        other => other.to_string() == literal,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
