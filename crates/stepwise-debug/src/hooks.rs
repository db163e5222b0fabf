use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::Result;
use stepwise_graph::{EdgeTrigger, ExecutionContext};

use crate::tracer::ToolOutcome;

/// What the engine should do after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Abort,
}

impl HookDecision {
    pub fn is_abort(self) -> bool {
        self == Self::Abort
    }
}

/// A routing decision the engine is about to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub edge_id: String,
    pub from: String,
    pub to: String,
    pub trigger: EdgeTrigger,
    /// Why this edge matched.
    pub reason: String,
    /// Outgoing siblings that were not taken.
    pub skipped: Vec<String>,
}

/// Lifecycle callbacks an engine awaits while it runs a graph.
pub trait ExecutionHooks: Send {
    fn before_node<'a>(
        &'a mut self,
        node_id: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision>;

    fn after_node<'a>(
        &'a mut self,
        node_id: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, ()>;

    fn before_edge<'a>(
        &'a mut self,
        edge: &'a EdgeEvent,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision>;

    /// Returns the call id to pass back to `after_tool_call`.
    fn before_tool_call<'a>(
        &'a mut self,
        tool_name: &'a str,
        arguments: &'a Value,
    ) -> BoxFuture<'a, String>;

    fn after_tool_call<'a>(
        &'a mut self,
        call_id: &'a str,
        outcome: ToolOutcome,
    ) -> BoxFuture<'a, ()>;

    /// Called before an engine error propagates. The error is re-raised
    /// whatever the decision.
    fn on_error<'a>(
        &'a mut self,
        node_id: &'a str,
        error: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision>;
}

/// Something that runs a graph and reports its lifecycle through hooks.
pub trait Engine: Send + Sync {
    fn execute<'a>(
        &'a self,
        initial_context: ExecutionContext,
        hooks: &'a mut dyn ExecutionHooks,
    ) -> BoxFuture<'a, Result<ExecutionContext>>;
}

/// Hooks that never suspend. Used to run an engine without a debugger.
#[derive(Debug, Default)]
pub struct PassthroughHooks {
    next_call: u64,
    pub nodes_entered: Vec<String>,
    pub edges_taken: Vec<String>,
    pub errors: Vec<String>,
}

impl ExecutionHooks for PassthroughHooks {
    fn before_node<'a>(
        &'a mut self,
        node_id: &'a str,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        self.nodes_entered.push(node_id.to_string());
        Box::pin(async { HookDecision::Proceed })
    }

    fn after_node<'a>(
        &'a mut self,
        _node_id: &'a str,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn before_edge<'a>(
        &'a mut self,
        edge: &'a EdgeEvent,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        self.edges_taken.push(edge.edge_id.clone());
        Box::pin(async { HookDecision::Proceed })
    }

    fn before_tool_call<'a>(
        &'a mut self,
        _tool_name: &'a str,
        _arguments: &'a Value,
    ) -> BoxFuture<'a, String> {
        self.next_call += 1;
        let id = format!("call-{:04}", self.next_call);
        Box::pin(async move { id })
    }

    fn after_tool_call<'a>(
        &'a mut self,
        _call_id: &'a str,
        _outcome: ToolOutcome,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_error<'a>(
        &'a mut self,
        node_id: &'a str,
        error: &'a str,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        self.errors.push(format!("{}: {}", node_id, error));
        Box::pin(async { HookDecision::Proceed })
    }
}
