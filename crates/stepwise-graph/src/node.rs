use serde::{Deserialize, Serialize};

/// A node in the execution graph.
///
/// The debugger treats a node as opaque metadata: what it does is up to the
/// engine. Input/output keys declare which context entries the node reads
/// and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Node kind, e.g. `llm_generate` or `function`.
    #[serde(default = "default_kind", alias = "node_type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Keys this node reads from the execution context.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this node writes to the execution context.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Tool names available to this node.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_kind() -> String {
    "function".to_string()
}

impl Node {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: default_kind(),
            description: String::new(),
            input_keys: vec![],
            output_keys: vec![],
            tools: vec![],
            system_prompt: None,
        }
    }

    /// Set the node kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the input keys.
    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    /// Set the output keys.
    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    /// Set the tool names.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the system prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
