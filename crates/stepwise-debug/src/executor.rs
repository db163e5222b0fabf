use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_graph::{evaluate_condition, Edge, EdgeTrigger, ExecutionContext, GraphModel, Node};

use crate::hooks::{EdgeEvent, Engine, ExecutionHooks};

/// Result of running a single node.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    /// Text ingested into the context under the node's output keys.
    pub output: String,
    pub succeeded: bool,
}

impl NodeOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            succeeded: true,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            succeeded: false,
        }
    }
}

/// Runs the business logic of a node. Tool invocations go through `hooks`
/// so the debugger can trace them.
pub trait NodeHandler: Send + Sync {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        context: &'a ExecutionContext,
        hooks: &'a mut dyn ExecutionHooks,
    ) -> BoxFuture<'a, Result<NodeOutcome>>;
}

/// Walks a [`GraphModel`] from its entry node.
///
/// Each node runs through the [`NodeHandler`], its status is stored as
/// `<node>_status`, and the first outgoing edge whose trigger matches is
/// followed. The walk ends at a node with no matching edge, or once a node
/// has been visited more than `max_visits` times.
pub struct GraphExecutor {
    graph: Arc<GraphModel>,
    handler: Arc<dyn NodeHandler>,
    max_visits: usize,
}

impl GraphExecutor {
    pub fn new(graph: Arc<GraphModel>, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            graph,
            handler,
            max_visits: 5,
        }
    }

    pub fn with_max_visits(mut self, max_visits: usize) -> Self {
        self.max_visits = max_visits;
        self
    }

    pub fn graph(&self) -> &Arc<GraphModel> {
        &self.graph
    }

    async fn walk(
        &self,
        initial_context: ExecutionContext,
        hooks: &mut dyn ExecutionHooks,
    ) -> Result<ExecutionContext> {
        let start = Instant::now();
        let mut context = initial_context;
        let mut current_node_id = self.graph.entry().to_string();
        let mut visits: HashMap<String, usize> = HashMap::new();

        loop {
            let count = visits.entry(current_node_id.clone()).or_default();
            *count += 1;
            if *count > self.max_visits {
                warn!(
                    node_id = %current_node_id,
                    max_visits = self.max_visits,
                    "Node visit limit reached, terminating graph"
                );
                break;
            }

            let node = self.graph.node(&current_node_id)?;
            if hooks.before_node(&node.id, &context).await.is_abort() {
                return Err(StepwiseError::CancelledByOperator);
            }

            info!(node_id = %node.id, node_name = %node.name, "Executing graph node");
            let node_start = Instant::now();

            let outcome = match self.handler.run(node, &context, hooks).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(node_id = %node.id, error = %e, "Graph node failed");
                    context.record_status(&node.id, false);
                    // The error propagates whatever the hook decides.
                    hooks.on_error(&node.id, &e.to_string(), &context).await;
                    return Err(e);
                }
            };

            context.ingest_output(&node.output_keys, &outcome.output);
            context.record_status(&node.id, outcome.succeeded);

            debug!(
                node_id = %node.id,
                succeeded = outcome.succeeded,
                elapsed_ms = node_start.elapsed().as_millis() as u64,
                "Node execution complete"
            );
            hooks.after_node(&node.id, &context).await;

            let outgoing = self.graph.outgoing(&node.id);
            let Some((taken, reason)) = select_edge(&outgoing, outcome.succeeded, &context) else {
                debug!(node_id = %node.id, "No edge matched, graph complete");
                break;
            };

            let event = EdgeEvent {
                edge_id: taken.id.clone(),
                from: taken.from.clone(),
                to: taken.to.clone(),
                trigger: taken.trigger.clone(),
                reason,
                skipped: outgoing
                    .iter()
                    .filter(|e| e.id != taken.id)
                    .map(|e| e.id.clone())
                    .collect(),
            };
            if hooks.before_edge(&event, &context).await.is_abort() {
                return Err(StepwiseError::CancelledByOperator);
            }
            current_node_id = event.to;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            nodes = visits.values().sum::<usize>(),
            "Graph walk finished"
        );
        Ok(context)
    }
}

/// First outgoing edge whose trigger matches, with the reason it matched.
fn select_edge<'e>(
    outgoing: &[&'e Edge],
    succeeded: bool,
    context: &ExecutionContext,
) -> Option<(&'e Edge, String)> {
    outgoing.iter().find_map(|edge| {
        let reason = match &edge.trigger {
            EdgeTrigger::Always => Some("always".to_string()),
            EdgeTrigger::OnSuccess if succeeded => Some(format!("{} succeeded", edge.from)),
            EdgeTrigger::OnFailure if !succeeded => Some(format!("{} failed", edge.from)),
            EdgeTrigger::Conditional { expr } if evaluate_condition(expr, context.data()) => {
                Some(format!("condition matched: {}", expr))
            }
            _ => None,
        }?;
        Some((*edge, reason))
    })
}

impl Engine for GraphExecutor {
    fn execute<'a>(
        &'a self,
        initial_context: ExecutionContext,
        hooks: &'a mut dyn ExecutionHooks,
    ) -> BoxFuture<'a, Result<ExecutionContext>> {
        Box::pin(self.walk(initial_context, hooks))
    }
}

/// Scripted result for one visit of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Success,
    Failure,
    /// The handler itself errors; the run stops with this message.
    Error(String),
}

/// Dry-run handler that replays per-node outcome scripts.
///
/// Visits past the end of a node's script succeed. Outputs are
/// placeholders for the declared output keys, and every declared tool is
/// called once per visit.
#[derive(Default)]
pub struct ScriptedHandler {
    scripts: HashMap<String, Vec<ScriptedOutcome>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for successive visits of `node_id`.
    pub fn script(mut self, node_id: impl Into<String>, outcomes: Vec<ScriptedOutcome>) -> Self {
        self.scripts.insert(node_id.into(), outcomes);
        self
    }

    /// Fail the first visit of `node_id`.
    pub fn fail_once(self, node_id: impl Into<String>) -> Self {
        self.script(node_id, vec![ScriptedOutcome::Failure])
    }

    async fn next_outcome(&self, node_id: &str) -> ScriptedOutcome {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(node_id.to_string()).or_default();
        let outcome = self
            .scripts
            .get(node_id)
            .and_then(|script| script.get(*cursor))
            .cloned()
            .unwrap_or(ScriptedOutcome::Success);
        *cursor += 1;
        outcome
    }

    async fn run_node(
        &self,
        node: &Node,
        hooks: &mut dyn ExecutionHooks,
    ) -> Result<NodeOutcome> {
        let outcome = self.next_outcome(&node.id).await;

        for tool in &node.tools {
            let arguments = json!({ "node": node.id });
            let call_id = hooks.before_tool_call(tool, &arguments).await;
            let result = match &outcome {
                ScriptedOutcome::Error(msg) => Err(msg.clone()),
                _ => Ok(Value::String(format!("{} ok", tool))),
            };
            hooks.after_tool_call(&call_id, result).await;
        }

        match outcome {
            ScriptedOutcome::Success => {
                let output: serde_json::Map<String, Value> = node
                    .output_keys
                    .iter()
                    .map(|key| (key.clone(), Value::String(format!("<{}.{}>", node.id, key))))
                    .collect();
                Ok(NodeOutcome::success(Value::Object(output).to_string()))
            }
            ScriptedOutcome::Failure => Ok(NodeOutcome::failure(format!("{} failed", node.id))),
            ScriptedOutcome::Error(msg) => Err(StepwiseError::engine(msg)),
        }
    }
}

impl NodeHandler for ScriptedHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        _context: &'a ExecutionContext,
        hooks: &'a mut dyn ExecutionHooks,
    ) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(self.run_node(node, hooks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::PassthroughHooks;

    fn pipeline() -> Arc<GraphModel> {
        Arc::new(
            GraphModel::new(
                vec![
                    Node::new("load", "Load").with_outputs(vec!["records".into()]),
                    Node::new("transform", "Transform").with_tools(vec!["normalize".into()]),
                    Node::new("validate", "Validate"),
                    Node::new("save", "Save"),
                ],
                vec![
                    Edge::on_success("load", "transform"),
                    Edge::on_success("transform", "validate"),
                    Edge::on_success("validate", "save"),
                    Edge::on_failure("validate", "transform"),
                ],
                "load",
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn walks_happy_path() {
        let executor = GraphExecutor::new(pipeline(), Arc::new(ScriptedHandler::new()));
        let mut hooks = PassthroughHooks::default();
        let ctx = executor.execute(ExecutionContext::new(), &mut hooks).await.unwrap();

        assert_eq!(hooks.nodes_entered, vec!["load", "transform", "validate", "save"]);
        assert_eq!(ctx.get_str("save_status"), Some("success"));
        assert_eq!(ctx.get_str("records"), Some("<load.records>"));
    }

    #[tokio::test]
    async fn failure_takes_retry_edge() {
        let handler = ScriptedHandler::new().fail_once("validate");
        let executor = GraphExecutor::new(pipeline(), Arc::new(handler));
        let mut hooks = PassthroughHooks::default();
        executor.execute(ExecutionContext::new(), &mut hooks).await.unwrap();

        assert_eq!(
            hooks.nodes_entered,
            vec!["load", "transform", "validate", "transform", "validate", "save"]
        );
        assert!(hooks.edges_taken.contains(&"validate->transform".to_string()));
    }

    #[tokio::test]
    async fn visit_limit_stops_endless_loop() {
        let handler = ScriptedHandler::new().script("validate", vec![ScriptedOutcome::Failure; 10]);
        let executor = GraphExecutor::new(pipeline(), Arc::new(handler)).with_max_visits(2);
        let mut hooks = PassthroughHooks::default();
        executor.execute(ExecutionContext::new(), &mut hooks).await.unwrap();

        let transform_visits = hooks.nodes_entered.iter().filter(|n| *n == "transform").count();
        assert_eq!(transform_visits, 2);
    }

    #[tokio::test]
    async fn handler_error_goes_through_on_error() {
        let handler = ScriptedHandler::new().script("transform", vec![ScriptedOutcome::Error("disk full".into())]);
        let executor = GraphExecutor::new(pipeline(), Arc::new(handler));
        let mut hooks = PassthroughHooks::default();
        let err = executor.execute(ExecutionContext::new(), &mut hooks).await.unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert_eq!(hooks.errors, vec!["transform: disk full"]);
    }

    #[test]
    fn conditional_edges_carry_reason() {
        let a_to_b = Edge::conditional("a", "b", r#"mode == "fast""#);
        let a_to_c = Edge::always("a", "c");
        let mut ctx = ExecutionContext::new();
        ctx.set_str("mode", "fast");

        let (edge, reason) = select_edge(&[&a_to_b, &a_to_c], true, &ctx).unwrap();
        assert_eq!(edge.to, "b");
        assert_eq!(reason, r#"condition matched: mode == "fast""#);

        ctx.set_str("mode", "slow");
        let (edge, reason) = select_edge(&[&a_to_b, &a_to_c], true, &ctx).unwrap();
        assert_eq!(edge.to, "c");
        assert_eq!(reason, "always");
    }
}
