use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};

use crate::context::ExecutionContext;
use crate::model::GraphModel;

const RULE_WIDTH: usize = 70;

/// Which edge fired at a step and which siblings were passed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub edge_id: String,
    pub step: usize,
    pub reason: String,
    pub skipped_edges: Vec<String>,
    /// Context keys present when the decision was made.
    pub context_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeUsageStats {
    pub total_traversals: usize,
    pub unique_edges_used: usize,
    pub edge_counts: BTreeMap<String, usize>,
    /// Ties go to the edge that was traversed first.
    pub most_used_edge: Option<(String, usize)>,
}

/// Ordered log of the routing decisions a run actually took.
pub struct EdgeRouteVisualizer {
    graph: Arc<GraphModel>,
    decisions: Vec<RoutingDecision>,
}

impl EdgeRouteVisualizer {
    pub fn new(graph: Arc<GraphModel>) -> Self {
        Self {
            graph,
            decisions: Vec::new(),
        }
    }

    /// Append a decision; returns its step index.
    pub fn record(
        &mut self,
        edge_id: &str,
        context: &ExecutionContext,
        reason: impl Into<String>,
        skipped_edges: Vec<String>,
    ) -> Result<usize> {
        self.graph.edge(edge_id)?;
        let step = self.decisions.len();
        self.decisions.push(RoutingDecision {
            edge_id: edge_id.to_string(),
            step,
            reason: reason.into(),
            skipped_edges,
            context_keys: context.keys(),
        });
        Ok(step)
    }

    pub fn decisions(&self) -> &[RoutingDecision] {
        &self.decisions
    }

    pub fn reset(&mut self) {
        self.decisions.clear();
    }

    /// Render the decision taken at `step`.
    pub fn decision_at(&self, step: usize) -> Result<String> {
        let decision = self.decisions.get(step).ok_or_else(|| StepwiseError::NotFound {
            what: "Routing step",
            id: step.to_string(),
        })?;
        let edge = self.graph.edge(&decision.edge_id)?;

        let mut lines = vec![
            "=".repeat(RULE_WIDTH),
            format!("ROUTING DECISION - Step {}", step),
            "=".repeat(RULE_WIDTH),
            String::new(),
            format!("Edge taken: {}", edge.id),
            format!("  {} → {}", edge.from, edge.to),
            format!("  Condition: {}", edge.trigger),
            String::new(),
            format!("Reason: {}", decision.reason),
        ];

        if !decision.skipped_edges.is_empty() {
            lines.push(String::new());
            lines.push(format!("Skipped edges ({}):", decision.skipped_edges.len()));
            for skipped_id in &decision.skipped_edges {
                match self.graph.edge(skipped_id) {
                    Ok(skipped) => lines.push(format!(
                        "  ✗ {}: {} → {} ({})",
                        skipped_id, skipped.from, skipped.to, skipped.trigger
                    )),
                    Err(_) => lines.push(format!("  ✗ {}: <unknown edge>", skipped_id)),
                }
            }
        }

        lines.push(String::new());
        lines.push("=".repeat(RULE_WIDTH));
        Ok(lines.join("\n"))
    }

    /// Render the static graph with `node_sequence` highlighted.
    pub fn path_overlay(&self, node_sequence: &[String]) -> String {
        let taken = taken_edges(&self.graph, node_sequence);
        let mut visits: HashMap<&str, usize> = HashMap::new();
        for node_id in node_sequence {
            *visits.entry(node_id.as_str()).or_default() += 1;
        }

        let mut lines = vec![
            "=".repeat(RULE_WIDTH),
            "EXECUTION PATH".to_string(),
            "=".repeat(RULE_WIDTH),
            String::new(),
        ];

        for (i, node_id) in node_sequence.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, node_id));
            if let Some(Some(edge_id)) = taken.get(i) {
                if let Ok(edge) = self.graph.edge(edge_id) {
                    lines.push(format!("   ↓ via {} ({})", edge.id, edge.trigger));
                }
            }
        }

        lines.push(String::new());
        lines.push("-".repeat(RULE_WIDTH));
        lines.push("GRAPH OVERLAY (● visited, ○ not visited, ⇒ taken)".to_string());
        lines.push("-".repeat(RULE_WIDTH));

        for node in self.graph.nodes() {
            match visits.get(node.id.as_str()) {
                Some(count) => lines.push(format!("● {} (visited {}x)", node.id, count)),
                None => lines.push(format!("○ {}", node.id)),
            }
            for edge in self.graph.outgoing(&node.id) {
                let used = taken.iter().flatten().filter(|id| **id == edge.id).count();
                if used > 0 {
                    lines.push(format!("    ⇒ {} (via {}, taken {}x)", edge.to, edge.id, used));
                } else {
                    lines.push(format!("    → {} (via {})", edge.to, edge.id));
                }
            }
        }

        lines.push(String::new());
        lines.push("=".repeat(RULE_WIDTH));
        lines.join("\n")
    }

    /// Mermaid flowchart with visited nodes and taken edges styled.
    pub fn path_overlay_mermaid(&self, node_sequence: &[String]) -> String {
        let taken = taken_edges(&self.graph, node_sequence);
        let g = &self.graph;
        let mut out = String::from("flowchart TD\n");
        out.push_str("    classDef visited fill:#d4f7d4,stroke:#2b8a3e,stroke-width:2px\n");

        for (i, node) in g.nodes().iter().enumerate() {
            let class = if node_sequence.contains(&node.id) { ":::visited" } else { "" };
            out.push_str(&format!("    n{}[\"{}\"]{}\n", i, node.name.replace('"', "&quot;"), class));
        }

        for (link, edge) in g.edges().iter().enumerate() {
            let from = g.nodes().iter().position(|n| n.id == edge.from).unwrap_or_default();
            let to = g.nodes().iter().position(|n| n.id == edge.to).unwrap_or_default();
            out.push_str(&format!("    n{} -->|\"{}\"| n{}\n", from, edge.trigger.label(), to));
            if taken.iter().flatten().any(|id| *id == edge.id) {
                out.push_str(&format!("    linkStyle {} stroke:#2b8a3e,stroke-width:3px\n", link));
            }
        }

        out
    }

    /// Traversal counts per edge.
    pub fn usage_stats(&self) -> EdgeUsageStats {
        let mut edge_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut first_seen: Vec<&str> = Vec::new();

        for decision in &self.decisions {
            let count = edge_counts.entry(decision.edge_id.clone()).or_default();
            if *count == 0 {
                first_seen.push(&decision.edge_id);
            }
            *count += 1;
        }

        let mut most_used_edge: Option<(String, usize)> = None;
        for edge_id in first_seen {
            let count = edge_counts[edge_id];
            if most_used_edge.as_ref().is_none_or(|(_, best)| count > *best) {
                most_used_edge = Some((edge_id.to_string(), count));
            }
        }

        EdgeUsageStats {
            total_traversals: self.decisions.len(),
            unique_edges_used: edge_counts.len(),
            edge_counts,
            most_used_edge,
        }
    }
}

/// For each position in the sequence, the first declared edge leading to
/// the next node (None on the last node or when no edge connects them).
fn taken_edges(graph: &GraphModel, node_sequence: &[String]) -> Vec<Option<String>> {
    node_sequence
        .iter()
        .enumerate()
        .map(|(i, node_id)| {
            let next = node_sequence.get(i + 1)?;
            graph
                .outgoing(node_id)
                .into_iter()
                .find(|e| &e.to == next)
                .map(|e| e.id.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;

    fn graph() -> Arc<GraphModel> {
        Arc::new(
            GraphModel::new(
                vec![
                    Node::new("load", "Load"),
                    Node::new("transform", "Transform"),
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
            .unwrap(),
        )
    }

    fn seq(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn record_and_render_decision() {
        let mut routes = EdgeRouteVisualizer::new(graph());
        let mut ctx = ExecutionContext::new();
        ctx.set_str("validate_status", "failure");

        let step = routes
            .record("retry", &ctx, "validation failed", vec!["validate->save".into()])
            .unwrap();
        assert_eq!(step, 0);
        assert_eq!(routes.decisions()[0].context_keys, vec!["validate_status"]);

        let text = routes.decision_at(0).unwrap();
        assert!(text.contains("ROUTING DECISION - Step 0"));
        assert!(text.contains("Edge taken: retry"));
        assert!(text.contains("validate → transform"));
        assert!(text.contains("Reason: validation failed"));
        assert!(text.contains("✗ validate->save: validate → save (on_success)"));

        assert!(routes.decision_at(1).is_err());
        assert!(routes.record("ghost", &ctx, "", vec![]).is_err());
    }

    #[test]
    fn usage_stats_break_ties_by_first_traversal() {
        let mut routes = EdgeRouteVisualizer::new(graph());
        let ctx = ExecutionContext::new();
        for edge in ["load->transform", "transform->validate", "retry", "transform->validate", "retry"] {
            routes.record(edge, &ctx, "matched", vec![]).unwrap();
        }

        let stats = routes.usage_stats();
        assert_eq!(stats.total_traversals, 5);
        assert_eq!(stats.unique_edges_used, 3);
        assert_eq!(stats.edge_counts["retry"], 2);
        assert_eq!(stats.edge_counts["transform->validate"], 2);
        assert_eq!(stats.most_used_edge, Some(("transform->validate".to_string(), 2)));
    }

    #[test]
    fn empty_usage_stats() {
        let routes = EdgeRouteVisualizer::new(graph());
        let stats = routes.usage_stats();
        assert_eq!(stats.total_traversals, 0);
        assert!(stats.most_used_edge.is_none());
    }

    #[test]
    fn overlay_highlights_realized_path() {
        let routes = EdgeRouteVisualizer::new(graph());
        let path = seq(&["load", "transform", "validate", "transform", "validate", "save"]);
        let text = routes.path_overlay(&path);
        assert!(text.contains("1. load"));
        assert!(text.contains("   ↓ via retry (on_failure)"));
        assert!(text.contains("● transform (visited 2x)"));
        assert!(text.contains("⇒ transform (via retry, taken 1x)"));
        assert!(text.contains("⇒ validate (via transform->validate, taken 2x)"));

        let partial = routes.path_overlay(&seq(&["load", "transform"]));
        assert!(partial.contains("○ save"));
        assert!(partial.contains("→ save (via validate->save)"));
    }

    #[test]
    fn mermaid_overlay_styles_taken_links() {
        let routes = EdgeRouteVisualizer::new(graph());
        let m = routes.path_overlay_mermaid(&seq(&["load", "transform"]));
        assert!(m.contains("n0[\"Load\"]:::visited"));
        assert!(m.contains("n3[\"Save\"]\n"));
        assert!(m.contains("linkStyle 0 "));
        assert!(!m.contains("linkStyle 1 "));
    }
}
