use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::Result;

use crate::context::ExecutionContext;
use crate::model::GraphModel;

const PROMPT_PREVIEW_CHARS: usize = 200;
const VALUE_PREVIEW_CHARS: usize = 100;
const COLLECTION_PREVIEW_ITEMS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: String,
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
    pub tools: Vec<String>,
    pub system_prompt_preview: String,
}

/// One declared key of a node, looked up in a live context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyInspection {
    Present {
        value: Value,
        #[serde(rename = "type")]
        value_type: String,
        size: String,
    },
    Absent {
        status: KeyStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Declared input not yet in the context.
    Missing,
    /// Declared output the node has not written.
    NotProduced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionInfo {
    pub node_id: String,
    pub status: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata and input/output views of individual nodes.
pub struct NodeInspector {
    graph: Arc<GraphModel>,
    history: Vec<NodeExecutionInfo>,
}

impl NodeInspector {
    pub fn new(graph: Arc<GraphModel>) -> Self {
        Self {
            graph,
            history: Vec::new(),
        }
    }

    pub fn inspect_node(&self, node_id: &str) -> Result<NodeDetails> {
        let node = self.graph.node(node_id)?;
        Ok(NodeDetails {
            id: node.id.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            kind: node.kind.clone(),
            input_keys: node.input_keys.clone(),
            output_keys: node.output_keys.clone(),
            tools: node.tools.clone(),
            system_prompt_preview: preview_text(
                node.system_prompt.as_deref().unwrap_or_default(),
                PROMPT_PREVIEW_CHARS,
            ),
        })
    }

    pub fn inspect_inputs(
        &self,
        node_id: &str,
        context: &ExecutionContext,
    ) -> Result<BTreeMap<String, KeyInspection>> {
        let node = self.graph.node(node_id)?;
        Ok(inspect_keys(&node.input_keys, context, KeyStatus::Missing))
    }

    pub fn inspect_outputs(
        &self,
        node_id: &str,
        context: &ExecutionContext,
    ) -> Result<BTreeMap<String, KeyInspection>> {
        let node = self.graph.node(node_id)?;
        Ok(inspect_keys(&node.output_keys, context, KeyStatus::NotProduced))
    }

    pub fn record_execution(&mut self, info: NodeExecutionInfo) {
        self.history.push(info);
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Execution records, optionally filtered to one node.
    pub fn history(&self, node_id: Option<&str>) -> Vec<&NodeExecutionInfo> {
        self.history
            .iter()
            .filter(|info| node_id.is_none_or(|id| info.node_id == id))
            .collect()
    }
}

fn inspect_keys(
    keys: &[String],
    context: &ExecutionContext,
    absent: KeyStatus,
) -> BTreeMap<String, KeyInspection> {
    keys.iter()
        .map(|key| {
            let inspection = match context.get(key) {
                Some(value) => KeyInspection::Present {
                    value: preview_value(value),
                    value_type: type_name(value).to_string(),
                    size: size_of(value),
                },
                None => KeyInspection::Absent { status: absent },
            };
            (key.clone(), inspection)
        })
        .collect()
}

/// Shorten a value for display. Long strings are truncated, large arrays
/// and objects collapse into a one-line summary string.
pub fn preview_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(preview_text(s, VALUE_PREVIEW_CHARS)),
        Value::Array(items) if items.len() > COLLECTION_PREVIEW_ITEMS => {
            let head: Vec<String> = items.iter().take(2).map(|v| v.to_string()).collect();
            Value::String(format!("[{} items] [{}]...", items.len(), head.join(", ")))
        }
        Value::Object(map) if map.len() > COLLECTION_PREVIEW_ITEMS => {
            let keys: Vec<&str> = map.keys().take(3).map(String::as_str).collect();
            Value::String(format!("{{{} keys}} [{}]...", map.len(), keys.join(", ")))
        }
        other => other.clone(),
    }
}

pub fn preview_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn size_of(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{} chars", s.chars().count()),
        Value::Array(items) => format!("{} items", items.len()),
        Value::Object(map) => format!("{} keys", map.len()),
        _ => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;
    use serde_json::json;

    fn inspector() -> NodeInspector {
        let graph = GraphModel::new(
            vec![
                Node::new("fetch", "Fetch")
                    .with_kind("llm_tool_use")
                    .with_inputs(vec!["url".into(), "headers".into()])
                    .with_outputs(vec!["body".into(), "status".into()])
                    .with_tools(vec!["http_get".into()])
                    .with_prompt("x".repeat(250)),
                Node::new("done", "Done"),
            ],
            vec![Edge::always("fetch", "done")],
            "fetch",
        )
        .unwrap();
        NodeInspector::new(Arc::new(graph))
    }

    #[test]
    fn node_details_truncate_prompt() {
        let details = inspector().inspect_node("fetch").unwrap();
        assert_eq!(details.kind, "llm_tool_use");
        assert_eq!(details.tools, vec!["http_get"]);
        assert_eq!(details.system_prompt_preview.len(), 203);
        assert!(details.system_prompt_preview.ends_with("..."));

        let done = inspector().inspect_node("done").unwrap();
        assert_eq!(done.system_prompt_preview, "");
        assert!(inspector().inspect_node("ghost").is_err());
    }

    #[test]
    fn inputs_report_missing_keys() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str("url", "https://example.com");

        let inputs = inspector().inspect_inputs("fetch", &ctx).unwrap();
        assert_eq!(
            inputs["url"],
            KeyInspection::Present {
                value: json!("https://example.com"),
                value_type: "str".into(),
                size: "19 chars".into(),
            }
        );
        assert_eq!(
            inputs["headers"],
            KeyInspection::Absent {
                status: KeyStatus::Missing
            }
        );
    }

    #[test]
    fn outputs_report_not_produced() {
        let mut ctx = ExecutionContext::new();
        ctx.set("status", json!(200));

        let outputs = inspector().inspect_outputs("fetch", &ctx).unwrap();
        let rendered = serde_json::to_value(&outputs).unwrap();
        assert_eq!(rendered["body"], json!({"status": "not_produced"}));
        assert_eq!(rendered["status"], json!({"value": 200, "type": "int", "size": "N/A"}));
    }

    #[test]
    fn previews_summarize_large_values() {
        let long = "a".repeat(150);
        assert_eq!(preview_value(&json!(long)).as_str().unwrap().len(), 103);

        let list = json!([1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(preview_value(&list), json!("[7 items] [1, 2]..."));
        assert_eq!(preview_value(&json!([1, 2])), json!([1, 2]));

        let obj = json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6});
        assert_eq!(preview_value(&obj), json!("{6 keys} [a, b, c]..."));
    }

    #[test]
    fn history_filters_by_node() {
        let mut insp = inspector();
        insp.record_execution(NodeExecutionInfo {
            node_id: "fetch".into(),
            status: "success".into(),
            duration_ms: 12,
            error: None,
        });
        insp.record_execution(NodeExecutionInfo {
            node_id: "done".into(),
            status: "success".into(),
            duration_ms: 1,
            error: None,
        });
        assert_eq!(insp.history(Some("fetch")).len(), 1);
        assert_eq!(insp.history(None).len(), 2);
    }
}
