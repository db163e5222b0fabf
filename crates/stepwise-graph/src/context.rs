use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Execution context shared by the nodes of a run.
///
/// Keys are strings; values are JSON for maximum flexibility. Cloning is a
/// deep copy, so a cloned context never observes later mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    data: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Build a context from a JSON object. Non-object values yield `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(Self {
                data: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &ExecutionContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Record the `<node>_status` key conditional edges route on.
    pub fn record_status(&mut self, node_id: &str, succeeded: bool) {
        self.set_str(
            format!("{}_status", node_id),
            if succeeded { "success" } else { "failure" },
        );
    }

    /// Extract output values for the given keys from a node's output.
    ///
    /// If the output is a JSON object, each declared key is copied from it.
    /// Otherwise the full output text is stored under every key.
    pub fn ingest_output(&mut self, output_keys: &[String], output_text: &str) {
        if output_keys.is_empty() {
            return;
        }

        if let Ok(serde_json::Value::Object(obj)) =
            serde_json::from_str::<serde_json::Value>(output_text)
        {
            for key in output_keys {
                if let Some(val) = obj.get(key) {
                    self.data.insert(key.clone(), val.clone());
                }
            }
            return;
        }

        for key in output_keys {
            self.data.insert(
                key.clone(),
                serde_json::Value::String(output_text.to_string()),
            );
        }
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn into_inner(self) -> HashMap<String, serde_json::Value> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", serde_json::json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.keys(), vec!["count", "name"]);
    }

    #[test]
    fn test_merge() {
        let mut ctx1 = ExecutionContext::new();
        ctx1.set_str("a", "1");
        ctx1.set_str("b", "2");

        let mut ctx2 = ExecutionContext::new();
        ctx2.set_str("b", "overwritten");
        ctx2.set_str("c", "3");

        ctx1.merge(&ctx2);

        assert_eq!(ctx1.get_str("a"), Some("1"));
        assert_eq!(ctx1.get_str("b"), Some("overwritten"));
        assert_eq!(ctx1.get_str("c"), Some("3"));
    }

    #[test]
    fn test_ingest_json_output() {
        let mut ctx = ExecutionContext::new();
        let output = r#"{"findings": "Rust is fast", "score": 9.5}"#;
        ctx.ingest_output(&["findings".into(), "score".into()], output);

        assert_eq!(ctx.get_str("findings"), Some("Rust is fast"));
        assert_eq!(ctx.get("score"), Some(&serde_json::json!(9.5)));
    }

    #[test]
    fn test_ingest_plain_text_output() {
        let mut ctx = ExecutionContext::new();
        ctx.ingest_output(&["summary".into()], "This is a plain text result.");
        assert_eq!(ctx.get_str("summary"), Some("This is a plain text result."));

        let mut empty = ExecutionContext::new();
        empty.ingest_output(&[], "anything");
        assert!(empty.is_empty());
    }

    #[test]
    fn test_record_status() {
        let mut ctx = ExecutionContext::new();
        ctx.record_status("validate", false);
        assert_eq!(ctx.get_str("validate_status"), Some("failure"));
    }

    #[test]
    fn test_clone_does_not_alias() {
        let mut ctx = ExecutionContext::new();
        ctx.set("rows", serde_json::json!([1, 2]));
        let copy = ctx.clone();
        ctx.set("rows", serde_json::json!([1, 2, 3]));
        assert_eq!(copy.get("rows"), Some(&serde_json::json!([1, 2])));
    }

    #[test]
    fn test_from_json() {
        let ctx = ExecutionContext::from_json(serde_json::json!({"file_path": "in.csv"})).unwrap();
        assert_eq!(ctx.get_str("file_path"), Some("in.csv"));
        assert!(ExecutionContext::from_json(serde_json::json!([1])).is_none());
    }
}
