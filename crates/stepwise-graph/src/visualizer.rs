use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use stepwise_core::config::RenderFormat;
use stepwise_core::error::{Result, StepwiseError};

use crate::edge::{Edge, EdgeTrigger};
use crate::model::GraphModel;

const RULE_WIDTH: usize = 70;

/// An edge arriving at an inspected node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEdge {
    pub edge_id: String,
    pub source: String,
    pub condition: String,
}

/// An edge leaving an inspected node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEdge {
    pub edge_id: String,
    pub target: String,
    pub condition: String,
}

/// Incoming/outgoing edges of a node plus its entry/terminal flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub node_id: String,
    pub incoming_edges: Vec<IncomingEdge>,
    pub outgoing_edges: Vec<OutgoingEdge>,
    pub is_entry_point: bool,
    pub is_terminal: bool,
}

/// One enumerated walk through the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathWalk {
    /// Visited node ids, starting node first.
    pub nodes: Vec<String>,
    /// Edge ids taken between consecutive nodes.
    pub edges: Vec<String>,
    /// The walk visits some node more than once.
    pub loops: bool,
    /// The walk ends at a node with no outgoing edges.
    pub terminal: bool,
}

/// Renders a [`GraphModel`] as text and answers structural queries.
///
/// Every rendering is a pure function of the model: rendering the same
/// graph twice yields byte-identical output.
pub struct GraphVisualizer<'a> {
    graph: &'a GraphModel,
}

impl<'a> GraphVisualizer<'a> {
    pub fn new(graph: &'a GraphModel) -> Self {
        Self { graph }
    }

    pub fn render(&self, format: RenderFormat) -> String {
        match format {
            RenderFormat::Ascii => self.render_ascii(),
            RenderFormat::Mermaid => self.render_mermaid(),
            RenderFormat::Dot => self.render_dot(),
        }
    }

    /// Plain-text listing of every node with its outgoing edges.
    pub fn render_ascii(&self) -> String {
        let g = self.graph;
        let mut lines = vec![
            "=".repeat(RULE_WIDTH),
            "GRAPH STRUCTURE".to_string(),
            "=".repeat(RULE_WIDTH),
            String::new(),
            format!("Entry point: {}", g.entry()),
            format!("Nodes: {}", g.nodes().len()),
            format!("Edges: {}", g.edges().len()),
            String::new(),
            "-".repeat(RULE_WIDTH),
        ];

        for node in g.nodes() {
            lines.push(String::new());
            lines.push(format!("┌─ {}", node.id));
            lines.push(format!("│  Name: {}", node.name));
            lines.push(format!("│  Type: {}", node.kind));

            let outgoing = g.outgoing(&node.id);
            if outgoing.is_empty() {
                lines.push("│  No outgoing edges (terminal node)".to_string());
            } else {
                lines.push("│  Outgoing edges:".to_string());
                for edge in outgoing {
                    lines.push(format!("│    → {} (via {}, {})", edge.to, edge.id, edge.trigger));
                }
            }
            lines.push(format!("└{}", "─".repeat(RULE_WIDTH - 2)));
        }

        lines.push(String::new());
        lines.push("=".repeat(RULE_WIDTH));
        lines.join("\n")
    }

    /// Mermaid flowchart. Node ids are replaced by positional ids so that
    /// arbitrary graph ids never break the syntax.
    pub fn render_mermaid(&self) -> String {
        let g = self.graph;
        let mut out = String::from("flowchart TD\n");

        for (i, node) in g.nodes().iter().enumerate() {
            let label = format!("{}<br/>({})", escape_mermaid(&node.name), escape_mermaid(&node.kind));
            if g.is_entry(&node.id) {
                out.push_str(&format!("    n{}((\"{}\"))\n", i, label));
            } else {
                out.push_str(&format!("    n{}[\"{}\"]\n", i, label));
            }
        }

        for edge in g.edges() {
            let arrow = match edge.trigger {
                EdgeTrigger::OnFailure | EdgeTrigger::Conditional { .. } => "-.->",
                _ => "-->",
            };
            out.push_str(&format!(
                "    n{} {}|\"{}\"| n{}\n",
                self.position(&edge.from),
                arrow,
                mermaid_edge_label(edge),
                self.position(&edge.to),
            ));
        }

        out
    }

    /// Graphviz DOT document.
    pub fn render_dot(&self) -> String {
        let g = self.graph;
        let mut out = String::new();
        out.push_str("digraph agent {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n");
        out.push('\n');

        for node in g.nodes() {
            let mut attrs = vec![format!(
                "label=\"{}\\n({})\"",
                escape_dot(&node.name),
                escape_dot(&node.kind)
            )];
            if g.is_entry(&node.id) {
                attrs.push("style=\"rounded,bold\"".to_string());
                attrs.push("color=\"blue\"".to_string());
            }
            if g.is_terminal(&node.id) {
                attrs.push("peripheries=2".to_string());
            }
            out.push_str(&format!("    \"{}\" [{}];\n", escape_dot(&node.id), attrs.join(", ")));
        }

        out.push('\n');

        for edge in g.edges() {
            let mut attrs = vec![format!("label=\"{}\"", escape_dot(&edge_label(edge, "\n")))];
            match edge.trigger {
                EdgeTrigger::Conditional { .. } => attrs.push("style=\"dashed\"".to_string()),
                EdgeTrigger::OnFailure => attrs.push("color=\"red\"".to_string()),
                _ => {}
            }
            out.push_str(&format!(
                "    \"{}\" -> \"{}\" [{}];\n",
                escape_dot(&edge.from),
                escape_dot(&edge.to),
                attrs.join(", ")
            ));
        }

        out.push_str("}\n");
        out
    }

    /// Incoming and outgoing edges of a node.
    pub fn connectivity(&self, node_id: &str) -> Result<Connectivity> {
        let g = self.graph;
        g.node(node_id)?;

        let incoming_edges = g
            .incoming(node_id)
            .into_iter()
            .map(|e| IncomingEdge {
                edge_id: e.id.clone(),
                source: e.from.clone(),
                condition: e.trigger.to_string(),
            })
            .collect();
        let outgoing_edges: Vec<OutgoingEdge> = g
            .outgoing(node_id)
            .into_iter()
            .map(|e| OutgoingEdge {
                edge_id: e.id.clone(),
                target: e.to.clone(),
                condition: e.trigger.to_string(),
            })
            .collect();

        Ok(Connectivity {
            node_id: node_id.to_string(),
            is_entry_point: g.is_entry(node_id),
            is_terminal: outgoing_edges.is_empty(),
            incoming_edges,
            outgoing_edges,
        })
    }

    /// Every walk from the entry node with at most `max_depth` edges.
    pub fn find_paths(&self, max_depth: usize) -> Vec<Vec<String>> {
        self.walks_from(self.graph.entry(), max_depth)
            .into_iter()
            .map(|w| w.nodes)
            .collect()
    }

    /// Walk records from `start` with at most `max_depth` edges.
    pub fn enumerate_paths(&self, start: &str, max_depth: usize) -> Result<Vec<PathWalk>> {
        if !self.graph.contains_node(start) {
            return Err(StepwiseError::node_not_found(start));
        }
        Ok(self.walks_from(start, max_depth))
    }

    /// Depth-first enumeration with an explicit stack.
    ///
    /// Each frame carries its own path and visited set, so a node seen on
    /// one branch stays reachable on every other branch, and a loop can be
    /// walked again on the same branch. Only `max_depth` bounds the search.
    fn walks_from(&self, start: &str, max_depth: usize) -> Vec<PathWalk> {
        struct Frame {
            nodes: Vec<String>,
            edges: Vec<String>,
            visited: HashSet<String>,
            loops: bool,
        }

        let mut walks = Vec::new();
        let mut stack = vec![Frame {
            nodes: vec![start.to_string()],
            edges: vec![],
            visited: HashSet::from([start.to_string()]),
            loops: false,
        }];

        while let Some(frame) = stack.pop() {
            let current = frame.nodes.last().cloned().unwrap_or_default();
            let outgoing = self.graph.outgoing(&current);

            if frame.edges.len() < max_depth {
                // Reverse so declared edge order comes off the stack first.
                for edge in outgoing.iter().rev() {
                    let mut nodes = frame.nodes.clone();
                    nodes.push(edge.to.clone());
                    let mut edges = frame.edges.clone();
                    edges.push(edge.id.clone());
                    let mut visited = frame.visited.clone();
                    let revisit = !visited.insert(edge.to.clone());
                    stack.push(Frame {
                        nodes,
                        edges,
                        visited,
                        loops: frame.loops || revisit,
                    });
                }
            }

            walks.push(PathWalk {
                terminal: outgoing.is_empty(),
                nodes: frame.nodes,
                edges: frame.edges,
                loops: frame.loops,
            });
        }

        walks
    }

    fn position(&self, node_id: &str) -> usize {
        self.graph
            .nodes()
            .iter()
            .position(|n| n.id == node_id)
            .unwrap_or_default()
    }
}

/// Trigger label with the condition expression on a second line.
fn edge_label(edge: &Edge, line_break: &str) -> String {
    match edge.trigger.expression() {
        Some(expr) => format!("{}{}{}", edge.trigger.label(), line_break, expr),
        None => edge.trigger.label().to_string(),
    }
}

fn mermaid_edge_label(edge: &Edge) -> String {
    match edge.trigger.expression() {
        Some(expr) => format!("{}<br/>{}", edge.trigger.label(), escape_mermaid(expr)),
        None => edge.trigger.label().to_string(),
    }
}

/// Escape a string for DOT labels.
fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Escape a string for Mermaid labels.
fn escape_mermaid(s: &str) -> String {
    s.replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn retry_pipeline() -> GraphModel {
        GraphModel::new(
            vec![
                Node::new("load", "Load Data"),
                Node::new("transform", "Transform").with_kind("llm_tool_use"),
                Node::new("validate", "Validate"),
                Node::new("save", "Save"),
            ],
            vec![
                Edge::on_success("load", "transform"),
                Edge::on_success("transform", "validate"),
                Edge::on_success("validate", "save"),
                Edge::on_failure("validate", "transform").with_id("retry"),
            ],
            "load",
        )
        .unwrap()
    }

    fn two_cycle() -> GraphModel {
        GraphModel::new(
            vec![Node::new("A", "A"), Node::new("B", "B")],
            vec![Edge::always("A", "B"), Edge::always("B", "A")],
            "A",
        )
        .unwrap()
    }

    #[test]
    fn ascii_lists_nodes_and_edges() {
        let g = retry_pipeline();
        let text = GraphVisualizer::new(&g).render_ascii();
        assert!(text.contains("Entry point: load"));
        assert!(text.contains("Nodes: 4"));
        assert!(text.contains("┌─ transform"));
        assert!(text.contains("│  Type: llm_tool_use"));
        assert!(text.contains("→ transform (via retry, on_failure)"));
        assert!(text.contains("No outgoing edges (terminal node)"));
    }

    #[test]
    fn mermaid_uses_positional_ids() {
        let g = retry_pipeline();
        let m = GraphVisualizer::new(&g).render_mermaid();
        assert!(m.starts_with("flowchart TD\n"));
        assert!(m.contains("n0((\"Load Data<br/>(function)\"))"));
        assert!(m.contains("n1[\"Transform<br/>(llm_tool_use)\"]"));
        assert!(m.contains("n0 -->|\"on_success\"| n1"));
        assert!(m.contains("n2 -.->|\"on_failure\"| n1"));
    }

    #[test]
    fn dot_marks_entry_and_conditional_edges() {
        let g = GraphModel::new(
            vec![Node::new("a", "Say \"hi\""), Node::new("b", "B")],
            vec![Edge::conditional("a", "b", r#"status == "ok""#)],
            "a",
        )
        .unwrap();
        let dot = GraphVisualizer::new(&g).render_dot();
        assert!(dot.starts_with("digraph agent {"));
        assert!(dot.contains(r#""a" [label="Say \"hi\"\n(function)", style="rounded,bold", color="blue"];"#));
        assert!(dot.contains(r#""b" [label="B\n(function)", peripheries=2];"#));
        assert!(dot.contains(r#"style="dashed""#));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn renderings_are_deterministic() {
        let g = retry_pipeline();
        let v = GraphVisualizer::new(&g);
        for format in [RenderFormat::Ascii, RenderFormat::Mermaid, RenderFormat::Dot] {
            assert_eq!(v.render(format), v.render(format));
        }
        let rebuilt = retry_pipeline();
        assert_eq!(v.render_dot(), GraphVisualizer::new(&rebuilt).render_dot());
    }

    #[test]
    fn connectivity_reports_both_directions() {
        let g = retry_pipeline();
        let c = GraphVisualizer::new(&g).connectivity("transform").unwrap();
        assert_eq!(c.incoming_edges.len(), 2);
        assert_eq!(c.incoming_edges[1].edge_id, "retry");
        assert_eq!(c.incoming_edges[1].source, "validate");
        assert_eq!(c.outgoing_edges[0].target, "validate");
        assert!(!c.is_entry_point);
        assert!(!c.is_terminal);

        let save = GraphVisualizer::new(&g).connectivity("save").unwrap();
        assert!(save.is_terminal);

        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("incoming_edges").is_some());
        assert!(json.get("is_entry_point").is_some());
        assert!(GraphVisualizer::new(&g).connectivity("ghost").is_err());
    }

    #[test]
    fn two_cycle_paths_are_finite_and_revisit() {
        let g = two_cycle();
        let paths = GraphVisualizer::new(&g).find_paths(3);
        let expect = |p: &[&str]| paths.contains(&p.iter().map(|s| s.to_string()).collect());
        assert!(expect(&["A"]));
        assert!(expect(&["A", "B"]));
        assert!(expect(&["A", "B", "A"]));
        assert!(expect(&["A", "B", "A", "B"]));
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn paths_respect_depth_and_declared_edges() {
        let g = retry_pipeline();
        let v = GraphVisualizer::new(&g);
        for depth in 0..6 {
            for path in v.find_paths(depth) {
                assert!(path.len() - 1 <= depth);
                for pair in path.windows(2) {
                    assert!(g.outgoing(&pair[0]).iter().any(|e| e.to == pair[1]));
                }
            }
        }
        assert_eq!(v.find_paths(0), vec![vec!["load".to_string()]]);
    }

    #[test]
    fn walk_records_flag_loops_and_terminals() {
        let g = retry_pipeline();
        let walks = GraphVisualizer::new(&g).enumerate_paths("load", 5).unwrap();
        let happy = walks
            .iter()
            .find(|w| w.nodes == ["load", "transform", "validate", "save"])
            .unwrap();
        assert!(happy.terminal);
        assert!(!happy.loops);
        assert_eq!(happy.edges, ["load->transform", "transform->validate", "validate->save"]);

        let retried = walks
            .iter()
            .find(|w| w.nodes == ["load", "transform", "validate", "transform"])
            .unwrap();
        assert!(retried.loops);
        assert!(!retried.terminal);

        assert!(GraphVisualizer::new(&g).enumerate_paths("ghost", 3).is_err());
    }

    /// Up to five nodes with arbitrary directed edges, self-loops included.
    fn small_graph() -> impl Strategy<Value = (GraphModel, BTreeSet<(String, String)>)> {
        (1_usize..5)
            .prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 0..10)))
            .prop_map(|(n, pairs)| {
                let name = |i: usize| format!("n{}", i);
                let declared: BTreeSet<(String, String)> =
                    pairs.into_iter().map(|(a, b)| (name(a), name(b))).collect();
                let graph = GraphModel::new(
                    (0..n).map(|i| Node::new(name(i), name(i))).collect(),
                    declared.iter().map(|(a, b)| Edge::always(a, b)).collect(),
                    "n0",
                )
                .unwrap();
                (graph, declared)
            })
    }

    proptest! {
        #[test]
        fn paths_follow_declared_edges((graph, declared) in small_graph(), max_depth in 0_usize..4) {
            let paths = GraphVisualizer::new(&graph).find_paths(max_depth);
            prop_assert!(paths.contains(&vec!["n0".to_string()]));

            for path in &paths {
                prop_assert_eq!(path[0].as_str(), "n0");
                prop_assert!(path.len() - 1 <= max_depth);
                for step in path.windows(2) {
                    prop_assert!(
                        declared.contains(&(step[0].clone(), step[1].clone())),
                        "{} -> {} is not an edge", step[0], step[1]
                    );
                }
            }

            let distinct: BTreeSet<&Vec<String>> = paths.iter().collect();
            prop_assert_eq!(distinct.len(), paths.len());
        }
    }
}
