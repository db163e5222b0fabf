use std::collections::BTreeMap;

use tracing::{debug, warn};

use stepwise_core::config::BreakpointConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::BreakpointKind;
use stepwise_graph::ExecutionContext;

use crate::predicate::{Predicate, PredicateError};

/// Target that matches every node, edge, or tool for its kind.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub target: String,
    pub kind: BreakpointKind,
    pub condition: Option<Predicate>,
    pub enabled: bool,
    pub hit_count: u64,
}

impl Breakpoint {
    fn matches(&self, context: &ExecutionContext) -> std::result::Result<bool, PredicateError> {
        if !self.enabled {
            return Ok(false);
        }
        match &self.condition {
            Some(predicate) => predicate.evaluate(context),
            None => Ok(true),
        }
    }
}

/// Outcome of asking the registry whether to suspend.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub hit: bool,
    /// Target of the breakpoint that fired (`*` for a wildcard).
    pub matched: Option<String>,
    /// A condition that failed to evaluate. Such a breakpoint counts as not hit.
    pub warning: Option<PredicateError>,
}

/// Configured breakpoints keyed by (target, kind).
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    breakpoints: BTreeMap<(String, BreakpointKind), Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `[[breakpoints]]` config entries.
    pub fn from_config(entries: &[BreakpointConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for entry in entries {
            let condition = entry
                .condition
                .as_deref()
                .map(Predicate::parse)
                .transpose()
                .map_err(|e| StepwiseError::Config(e.to_string()))?;
            registry.set(&entry.target, entry.kind, condition);
        }
        Ok(registry)
    }

    /// Install a breakpoint, replacing any existing one at the same key.
    /// Returns the replaced breakpoint.
    pub fn set(
        &mut self,
        target: &str,
        kind: BreakpointKind,
        condition: Option<Predicate>,
    ) -> Option<Breakpoint> {
        debug!(breakpoint = target, %kind, conditional = condition.is_some(), "Breakpoint set");
        self.breakpoints.insert(
            (target.to_string(), kind),
            Breakpoint {
                target: target.to_string(),
                kind,
                condition,
                enabled: true,
                hit_count: 0,
            },
        )
    }

    /// Remove a breakpoint. Returns whether one was present.
    pub fn clear(&mut self, target: &str, kind: BreakpointKind) -> bool {
        self.breakpoints.remove(&(target.to_string(), kind)).is_some()
    }

    pub fn clear_all(&mut self) {
        self.breakpoints.clear();
    }

    pub fn enable(&mut self, target: &str, kind: BreakpointKind) -> bool {
        self.set_enabled(target, kind, true)
    }

    pub fn disable(&mut self, target: &str, kind: BreakpointKind) -> bool {
        self.set_enabled(target, kind, false)
    }

    fn set_enabled(&mut self, target: &str, kind: BreakpointKind, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&(target.to_string(), kind)) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, target: &str, kind: BreakpointKind) -> Option<&Breakpoint> {
        self.breakpoints.get(&(target.to_string(), kind))
    }

    /// All breakpoints ordered by target, then kind.
    pub fn list(&self) -> Vec<&Breakpoint> {
        self.breakpoints.values().collect()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Decide whether `target` at lifecycle point `kind` should suspend.
    /// An exact-target breakpoint is consulted before a wildcard one.
    pub fn evaluate(
        &self,
        kind: BreakpointKind,
        target: &str,
        context: &ExecutionContext,
    ) -> Evaluation {
        let mut evaluation = Evaluation::default();

        for key in [target, WILDCARD] {
            let Some(bp) = self.breakpoints.get(&(key.to_string(), kind)) else {
                continue;
            };
            match bp.matches(context) {
                Ok(true) => {
                    evaluation.hit = true;
                    evaluation.matched = Some(key.to_string());
                    return evaluation;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(breakpoint = key, %kind, error = %e, "Breakpoint condition failed, treating as not hit");
                    evaluation.warning = Some(e);
                }
            }
            if key == WILDCARD {
                break;
            }
        }

        evaluation
    }

    /// Bump the hit counter of the breakpoint at this key.
    pub fn record_hit(&mut self, target: &str, kind: BreakpointKind) -> u64 {
        match self.breakpoints.get_mut(&(target.to_string(), kind)) {
            Some(bp) => {
                bp.hit_count += 1;
                bp.hit_count
            }
            None => 0,
        }
    }

    /// One line per breakpoint for operator display.
    pub fn render(&self) -> String {
        if self.breakpoints.is_empty() {
            return "No breakpoints set".to_string();
        }
        self.breakpoints
            .values()
            .map(|bp| {
                let mut line = format!(
                    "{} {} @ {} (hits: {})",
                    if bp.enabled { "●" } else { "○" },
                    bp.kind,
                    bp.target,
                    bp.hit_count
                );
                if let Some(cond) = &bp.condition {
                    line.push_str(&format!(" if {}", cond));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> ExecutionContext {
        ExecutionContext::from_json(value).unwrap()
    }

    #[test]
    fn unconditional_breakpoint_hits() {
        let mut reg = BreakpointRegistry::new();
        reg.set("transform", BreakpointKind::NodeEnter, None);

        let eval = reg.evaluate(BreakpointKind::NodeEnter, "transform", &ExecutionContext::new());
        assert!(eval.hit);
        assert_eq!(eval.matched.as_deref(), Some("transform"));
        assert!(!reg.evaluate(BreakpointKind::NodeExit, "transform", &ExecutionContext::new()).hit);
        assert!(!reg.evaluate(BreakpointKind::NodeEnter, "load", &ExecutionContext::new()).hit);
    }

    #[test]
    fn set_replaces_existing() {
        let mut reg = BreakpointRegistry::new();
        assert!(reg.set("a", BreakpointKind::NodeEnter, None).is_none());
        let replaced = reg.set("a", BreakpointKind::NodeEnter, Some(Predicate::exists("k")));
        assert!(replaced.is_some());
        assert_eq!(reg.len(), 1);
        assert!(reg.get("a", BreakpointKind::NodeEnter).unwrap().condition.is_some());
    }

    #[test]
    fn clear_is_noop_when_absent() {
        let mut reg = BreakpointRegistry::new();
        reg.set("a", BreakpointKind::NodeEnter, None);
        assert!(reg.clear("a", BreakpointKind::NodeEnter));
        assert!(!reg.clear("a", BreakpointKind::NodeEnter));
        assert!(reg.is_empty());
    }

    #[test]
    fn disabled_breakpoint_never_hits() {
        let mut reg = BreakpointRegistry::new();
        reg.set("a", BreakpointKind::NodeEnter, None);
        assert!(reg.disable("a", BreakpointKind::NodeEnter));
        assert!(!reg.evaluate(BreakpointKind::NodeEnter, "a", &ExecutionContext::new()).hit);
        assert!(reg.enable("a", BreakpointKind::NodeEnter));
        assert!(reg.evaluate(BreakpointKind::NodeEnter, "a", &ExecutionContext::new()).hit);
        assert!(!reg.enable("missing", BreakpointKind::NodeEnter));
    }

    #[test]
    fn conditional_breakpoint() {
        let mut reg = BreakpointRegistry::new();
        let cond = Predicate::parse(r#"validate_status == "failure""#).unwrap();
        reg.set("transform", BreakpointKind::NodeEnter, Some(cond));

        let failing = ctx(json!({"validate_status": "failure"}));
        let passing = ctx(json!({"validate_status": "success"}));
        assert!(reg.evaluate(BreakpointKind::NodeEnter, "transform", &failing).hit);
        assert!(!reg.evaluate(BreakpointKind::NodeEnter, "transform", &passing).hit);
    }

    #[test]
    fn failing_condition_is_fail_open_with_warning() {
        let mut reg = BreakpointRegistry::new();
        reg.set("a", BreakpointKind::NodeEnter, Some(Predicate::parse("name > 1").unwrap()));

        let eval = reg.evaluate(BreakpointKind::NodeEnter, "a", &ctx(json!({"name": "x"})));
        assert!(!eval.hit);
        assert!(matches!(eval.warning, Some(PredicateError::NotNumeric { .. })));
    }

    #[test]
    fn wildcard_matches_any_target() {
        let mut reg = BreakpointRegistry::new();
        reg.set(WILDCARD, BreakpointKind::Error, None);
        let eval = reg.evaluate(BreakpointKind::Error, "anything", &ExecutionContext::new());
        assert!(eval.hit);
        assert_eq!(eval.matched.as_deref(), Some("*"));
    }

    #[test]
    fn record_hit_counts() {
        let mut reg = BreakpointRegistry::new();
        reg.set("a", BreakpointKind::ToolCall, None);
        assert_eq!(reg.record_hit("a", BreakpointKind::ToolCall), 1);
        assert_eq!(reg.record_hit("a", BreakpointKind::ToolCall), 2);
        assert_eq!(reg.record_hit("b", BreakpointKind::ToolCall), 0);
    }

    #[test]
    fn list_is_deterministic() {
        let mut reg = BreakpointRegistry::new();
        reg.set("b", BreakpointKind::NodeExit, None);
        reg.set("a", BreakpointKind::NodeExit, None);
        reg.set("a", BreakpointKind::NodeEnter, None);
        let keys: Vec<_> = reg.list().iter().map(|bp| (bp.target.as_str(), bp.kind)).collect();
        assert_eq!(
            keys,
            vec![
                ("a", BreakpointKind::NodeEnter),
                ("a", BreakpointKind::NodeExit),
                ("b", BreakpointKind::NodeExit),
            ]
        );
    }

    #[test]
    fn from_config_parses_conditions() {
        let entries = vec![
            BreakpointConfig {
                target: "validate".into(),
                kind: BreakpointKind::NodeExit,
                condition: Some("score < 0.5".into()),
            },
            BreakpointConfig {
                target: "x".into(),
                kind: BreakpointKind::NodeEnter,
                condition: Some("a ==".into()),
            },
        ];
        let err = BreakpointRegistry::from_config(&entries).unwrap_err();
        assert!(matches!(err, StepwiseError::Config(_)));

        let reg = BreakpointRegistry::from_config(&entries[..1]).unwrap();
        assert_eq!(reg.render(), "● node_exit @ validate (hits: 0) if score < 0.5");
    }
}
