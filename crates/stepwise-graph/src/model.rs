use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};

use crate::edge::{derived_id, Edge};
use crate::node::Node;

/// Serialized form of a graph, as found in agent export files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(alias = "entry_point", alias = "entry")]
    pub entry_node: String,
}

/// Agent export files wrap the graph in a top-level `graph` object.
#[derive(Deserialize)]
struct Wrapped {
    graph: GraphDefinition,
}

impl GraphDefinition {
    /// Parse a JSON document, bare or wrapped in `{"graph": ...}`.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        if value.get("graph").is_some() {
            let wrapped: Wrapped = serde_json::from_value(value)?;
            return Ok(wrapped.graph);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| StepwiseError::InvalidGraph(e.to_string()))
    }
}

/// Read-only view over a validated execution graph.
///
/// Nodes keep their declaration order so renderings are deterministic.
/// The model is immutable after construction and can be shared across
/// threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct GraphModel {
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    edges: Vec<Edge>,
    edge_index: HashMap<String, usize>,
    entry: String,
}

impl GraphModel {
    /// Build and validate a graph.
    ///
    /// Fails with `InvalidGraph` on duplicate ids, dangling edge endpoints,
    /// or an unknown entry node. Edges without an id get `from->to`.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>, entry: impl Into<String>) -> Result<Self> {
        let entry = entry.into();

        let mut node_index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(StepwiseError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        if !node_index.contains_key(&entry) {
            return Err(StepwiseError::InvalidGraph(format!(
                "entry node '{}' is not declared",
                entry
            )));
        }

        let mut edges = edges;
        let mut edge_index = HashMap::with_capacity(edges.len());
        for (i, edge) in edges.iter_mut().enumerate() {
            for endpoint in [&edge.from, &edge.to] {
                if !node_index.contains_key(endpoint) {
                    return Err(StepwiseError::InvalidGraph(format!(
                        "edge '{}' references unknown node '{}'",
                        if edge.id.is_empty() { derived_id(&edge.from, &edge.to) } else { edge.id.clone() },
                        endpoint
                    )));
                }
            }
            if edge.id.is_empty() {
                edge.id = derived_id(&edge.from, &edge.to);
            }
            if edge_index.insert(edge.id.clone(), i).is_some() {
                return Err(StepwiseError::InvalidGraph(format!(
                    "duplicate edge id '{}'",
                    edge.id
                )));
            }
        }

        debug!(nodes = nodes.len(), edges = edges.len(), entry = %entry, "Graph model built");

        Ok(Self {
            nodes,
            node_index,
            edges,
            edge_index,
            entry,
        })
    }

    pub fn from_definition(def: GraphDefinition) -> Result<Self> {
        Self::new(def.nodes, def.edges, def.entry_node)
    }

    /// Load a graph file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let def = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => GraphDefinition::from_toml_str(&content)?,
            _ => GraphDefinition::from_json_str(&content)?,
        };
        Self::from_definition(def)
    }

    pub fn to_definition(&self) -> GraphDefinition {
        GraphDefinition {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            entry_node: self.entry.clone(),
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Result<&Node> {
        self.node_index
            .get(id)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| StepwiseError::node_not_found(id))
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &str) -> Result<&Edge> {
        self.edge_index
            .get(id)
            .map(|&i| &self.edges[i])
            .ok_or_else(|| StepwiseError::edge_not_found(id))
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Edges in declaration order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Edges leaving `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == node_id).collect()
    }

    /// Edges arriving at `node_id`, in declaration order.
    pub fn incoming(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.to == node_id).collect()
    }

    pub fn is_entry(&self, node_id: &str) -> bool {
        self.entry == node_id
    }

    /// A terminal node has no outgoing edges.
    pub fn is_terminal(&self, node_id: &str) -> bool {
        !self.edges.iter().any(|e| e.from == node_id)
    }
}
