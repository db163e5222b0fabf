use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use stepwise_core::config::{DebuggerConfig, StepwiseConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::EventBus;
use stepwise_core::types::{BreakpointKind, DebugEvent, SessionId};
use stepwise_graph::inspector::preview_value;
use stepwise_graph::{
    EdgeRouteVisualizer, ExecutionContext, GraphModel, NodeExecutionInfo, NodeInspector,
};

use crate::breakpoint::BreakpointRegistry;
use crate::hooks::{EdgeEvent, Engine, ExecutionHooks, HookDecision};
use crate::snapshot::{ContextSnapshot, StateSnapshotStore};
use crate::tracer::{ExecutionTracer, TraceHandle, TraceSession, ToolOutcome};

/// Capacity of the operator command channel.
const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    /// Pause before every node until the operator continues.
    Stepping,
    Aborted,
}

/// Operator answer to a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    Continue,
    Step,
    /// Publish a state dump and stay paused.
    Inspect,
    Abort,
}

impl DebugCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Step => "step",
            Self::Inspect => "inspect",
            Self::Abort => "abort",
        }
    }
}

impl std::str::FromStr for DebugCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" | "continue" => Ok(Self::Continue),
            "s" | "step" | "n" | "next" => Ok(Self::Step),
            "i" | "inspect" | "p" | "print" => Ok(Self::Inspect),
            "q" | "quit" | "a" | "abort" => Ok(Self::Abort),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// One entry of the controller's event history.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub step: u64,
    pub kind: BreakpointKind,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.step, self.kind, self.target)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// A breakpoint that fired during a run.
#[derive(Debug, Clone, Serialize)]
pub struct BreakpointHit {
    pub kind: BreakpointKind,
    pub target: String,
    /// Registry key that matched; `*` for a wildcard.
    pub matched: String,
    pub step: u64,
    /// Whether the run actually waited for the operator.
    pub blocking: bool,
    pub timestamp: DateTime<Utc>,
}

/// What the operator sees while execution is suspended.
#[derive(Debug, Clone)]
pub struct PauseReport {
    pub kind: BreakpointKind,
    pub target: String,
    pub step: u64,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
    pub recent_events: Vec<TraceEvent>,
    pub snapshot: Option<ContextSnapshot>,
}

impl PauseReport {
    pub fn render(&self) -> String {
        let mut lines = vec![
            "=".repeat(70),
            format!("PAUSED at {} {} (step {})", self.kind, self.target, self.step),
            "=".repeat(70),
            format!("Current node: {}", self.node_id.as_deref().unwrap_or("-")),
            format!("Current edge: {}", self.edge_id.as_deref().unwrap_or("-")),
        ];

        if !self.recent_events.is_empty() {
            lines.push(String::new());
            lines.push("Recent events:".to_string());
            for event in &self.recent_events {
                lines.push(format!("  {}", event));
            }
        }

        if let Some(snap) = &self.snapshot {
            lines.push(String::new());
            lines.push(format!(
                "Latest snapshot: step {} after {} ({} keys)",
                snap.step,
                snap.node_id,
                snap.context.len()
            ));
        }

        lines.push(String::new());
        lines.push("Commands: [c]ontinue  [s]tep  [i]nspect  [q]uit".to_string());
        lines.join("\n")
    }
}

/// Drives an [`Engine`] and reacts to its lifecycle hooks: traces every
/// event, snapshots the context after each node, records routing decisions,
/// and suspends at breakpoints.
///
/// With an operator attached (see [`attach_operator`](Self::attach_operator))
/// a suspension publishes [`DebugEvent::Paused`] and waits for a
/// [`DebugCommand`]. Without one, hits are recorded and the run continues.
pub struct ExecutionController {
    config: DebuggerConfig,
    registry: BreakpointRegistry,
    tracer: ExecutionTracer,
    snapshots: StateSnapshotStore,
    routes: EdgeRouteVisualizer,
    inspector: NodeInspector,
    event_bus: Arc<EventBus>,
    operator: Option<mpsc::Receiver<DebugCommand>>,

    state: RunState,
    step: u64,
    session_id: SessionId,
    next_session: Option<SessionId>,
    handle: Option<TraceHandle>,
    current_node: Option<String>,
    current_edge: Option<String>,
    node_started: Option<Instant>,
    last_context: ExecutionContext,
    last_pause: Option<PauseReport>,
    untraced_calls: u64,

    history: Vec<TraceEvent>,
    hits: Vec<BreakpointHit>,
    warnings: Vec<String>,
}

impl ExecutionController {
    pub fn new(graph: Arc<GraphModel>, event_bus: Arc<EventBus>, config: DebuggerConfig) -> Self {
        Self {
            config,
            registry: BreakpointRegistry::new(),
            tracer: ExecutionTracer::new(),
            snapshots: StateSnapshotStore::new(),
            routes: EdgeRouteVisualizer::new(graph.clone()),
            inspector: NodeInspector::new(graph),
            event_bus,
            operator: None,
            state: RunState::Running,
            step: 0,
            session_id: SessionId::new(),
            next_session: None,
            handle: None,
            current_node: None,
            current_edge: None,
            node_started: None,
            last_context: ExecutionContext::new(),
            last_pause: None,
            untraced_calls: 0,
            history: Vec::new(),
            hits: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Build a controller with the breakpoints declared in the config.
    pub fn from_config(
        config: &StepwiseConfig,
        graph: Arc<GraphModel>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let mut controller = Self::new(graph, event_bus, config.debugger.clone());
        controller.registry = BreakpointRegistry::from_config(&config.breakpoints)?;
        Ok(controller)
    }

    /// Make suspensions blocking and return the sender operators answer on.
    /// Dropping every sender while paused aborts the run.
    pub fn attach_operator(&mut self) -> mpsc::Sender<DebugCommand> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        self.operator = Some(rx);
        tx
    }

    /// Use `session_id` for the next run instead of a fresh one, so
    /// subscribers can be set up for it before the run starts.
    pub fn prepare_session(&mut self, session_id: SessionId) {
        self.next_session = Some(session_id);
    }

    pub fn is_interactive(&self) -> bool {
        self.operator.is_some()
    }

    pub fn registry(&self) -> &BreakpointRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut BreakpointRegistry {
        &mut self.registry
    }

    pub fn tracer(&self) -> &ExecutionTracer {
        &self.tracer
    }

    pub fn snapshots(&self) -> &StateSnapshotStore {
        &self.snapshots
    }

    pub fn routes(&self) -> &EdgeRouteVisualizer {
        &self.routes
    }

    /// Node metadata plus one execution record per finished node visit.
    pub fn inspector(&self) -> &NodeInspector {
        &self.inspector
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Every event seen during the last run, in order.
    pub fn history(&self) -> &[TraceEvent] {
        &self.history
    }

    /// Every breakpoint that fired during the last run, blocking or not.
    pub fn hits(&self) -> &[BreakpointHit] {
        &self.hits
    }

    /// Breakpoint conditions that failed to evaluate.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn last_pause(&self) -> Option<&PauseReport> {
        self.last_pause.as_ref()
    }

    /// The trace of the last finished run.
    pub fn last_session(&self) -> Option<&TraceSession> {
        self.tracer.completed().last()
    }

    /// Run `engine` to completion under the debugger.
    ///
    /// Engine errors are returned as-is, even if the operator also aborted.
    /// An abort with no engine error yields `CancelledByOperator`.
    pub async fn run<E>(&mut self, engine: &E, initial_context: ExecutionContext) -> Result<ExecutionContext>
    where
        E: Engine + ?Sized,
    {
        self.begin_run(&initial_context)?;
        let result = engine.execute(initial_context, self).await;
        self.finish_run();

        match result {
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Run failed");
                Err(e)
            }
            Ok(_) if self.state == RunState::Aborted => {
                info!(session_id = %self.session_id, "Run aborted by operator");
                Err(StepwiseError::CancelledByOperator)
            }
            Ok(context) => {
                info!(session_id = %self.session_id, steps = self.step, "Run complete");
                Ok(context)
            }
        }
    }

    fn begin_run(&mut self, initial_context: &ExecutionContext) -> Result<()> {
        if self.tracer.is_open() {
            self.tracer.discard();
        }
        self.session_id = self.next_session.take().unwrap_or_default();
        self.handle = Some(self.tracer.start(self.session_id.clone())?);
        self.state = if self.config.step_mode {
            RunState::Stepping
        } else {
            RunState::Running
        };
        self.step = 0;
        self.current_node = None;
        self.current_edge = None;
        self.node_started = None;
        self.last_context = initial_context.clone();
        self.last_pause = None;
        self.history.clear();
        self.hits.clear();
        self.warnings.clear();
        self.snapshots.clear();
        self.routes.reset();
        self.inspector.clear_history();

        info!(
            session_id = %self.session_id,
            breakpoints = self.registry.len(),
            interactive = self.is_interactive(),
            "Debug session started"
        );
        self.event_bus.publish(DebugEvent::SessionStarted {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }

    fn finish_run(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.tracer.end(&handle) {
            Ok(session) => {
                self.event_bus.publish(DebugEvent::SessionEnded {
                    session_id: self.session_id.clone(),
                    nodes_visited: session.node_sequence.len(),
                    tool_calls: session.tool_calls.len(),
                });
            }
            Err(e) => warn!(error = %e, "Failed to close trace session"),
        }
    }

    fn push_history(&mut self, kind: BreakpointKind, target: &str, detail: Option<String>) {
        self.history.push(TraceEvent {
            step: self.step,
            kind,
            target: target.to_string(),
            detail,
            timestamp: Utc::now(),
        });
    }

    /// Consult the registry and suspend if a breakpoint fires, or if the
    /// operator is single-stepping and this is a node entry.
    async fn checkpoint(
        &mut self,
        kind: BreakpointKind,
        target: &str,
        context: Option<&ExecutionContext>,
    ) -> HookDecision {
        if self.state == RunState::Aborted {
            return HookDecision::Abort;
        }

        let evaluation = self
            .registry
            .evaluate(kind, target, context.unwrap_or(&self.last_context));

        if let Some(warning) = evaluation.warning {
            let message = warning.to_string();
            self.warnings.push(format!("{} {}: {}", kind, target, message));
            self.event_bus.publish(DebugEvent::PredicateWarning {
                kind,
                target: target.to_string(),
                message,
            });
        }

        let stepping = kind == BreakpointKind::NodeEnter && self.state == RunState::Stepping;
        let interactive = self.is_interactive();

        if let Some(matched) = evaluation.matched {
            let count = self.registry.record_hit(&matched, kind);
            debug!(%kind, target, matched = %matched, count, "Breakpoint hit");
            self.hits.push(BreakpointHit {
                kind,
                target: target.to_string(),
                matched,
                step: self.step,
                blocking: interactive,
                timestamp: Utc::now(),
            });
            self.event_bus.publish(DebugEvent::BreakpointHit {
                kind,
                target: target.to_string(),
                step: self.step,
                blocking: interactive,
            });
        } else if !stepping {
            return HookDecision::Proceed;
        }

        if !interactive {
            // Non-blocking suspensions resume with continue semantics.
            if self.state == RunState::Stepping {
                self.state = RunState::Running;
            }
            return HookDecision::Proceed;
        }

        self.pause(kind, target).await
    }

    async fn pause(&mut self, kind: BreakpointKind, target: &str) -> HookDecision {
        self.state = RunState::Paused;
        let report = PauseReport {
            kind,
            target: target.to_string(),
            step: self.step,
            node_id: self.current_node.clone(),
            edge_id: self.current_edge.clone(),
            recent_events: self.recent_events(),
            snapshot: self.snapshots.latest().cloned(),
        };
        info!(%kind, target, step = self.step, "Execution paused");
        self.event_bus.publish(DebugEvent::Paused {
            step: self.step,
            report: report.render(),
        });
        self.last_pause = Some(report);

        loop {
            let command = match self.operator.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            let command = match command {
                Some(cmd) => cmd,
                None => {
                    warn!(step = self.step, "Operator channel closed while paused, aborting run");
                    DebugCommand::Abort
                }
            };

            let decision = match command {
                DebugCommand::Inspect => {
                    self.event_bus.publish(DebugEvent::StateDump {
                        dump: self.state_dump(),
                    });
                    continue;
                }
                DebugCommand::Continue => {
                    self.state = RunState::Running;
                    HookDecision::Proceed
                }
                DebugCommand::Step => {
                    self.state = RunState::Stepping;
                    HookDecision::Proceed
                }
                DebugCommand::Abort => {
                    self.state = RunState::Aborted;
                    HookDecision::Abort
                }
            };

            debug!(command = command.as_str(), "Execution resumed");
            self.event_bus.publish(DebugEvent::Resumed {
                command: command.as_str().to_string(),
            });
            return decision;
        }
    }

    fn recent_events(&self) -> Vec<TraceEvent> {
        let n = self.config.recent_events;
        let start = self.history.len().saturating_sub(n);
        self.history[start..].to_vec()
    }

    /// Full textual view of the context and breakpoints while paused.
    pub fn state_dump(&self) -> String {
        let mut lines = vec![
            format!(
                "STATE DUMP (step {}, node {}, edge {})",
                self.step,
                self.current_node.as_deref().unwrap_or("-"),
                self.current_edge.as_deref().unwrap_or("-"),
            ),
            format!("Context ({} keys):", self.last_context.len()),
        ];
        for key in self.last_context.keys() {
            if let Some(value) = self.last_context.get(&key) {
                lines.push(format!("  {} = {}", key, preview_value(value)));
            }
        }

        if let Some(snap) = self.snapshots.latest() {
            let previous = self
                .snapshots
                .all()
                .iter()
                .rev()
                .nth(1)
                .map(|s| s.step);
            if let Some(prev) = previous {
                if let Ok(diff) = self.snapshots.compare(prev, snap.step) {
                    lines.push(format!(
                        "Since step {}: added {:?}, removed {:?}, changed {:?}",
                        prev, diff.added, diff.removed, diff.changed
                    ));
                }
            }
        }

        lines.push("Breakpoints:".to_string());
        for line in self.registry.render().lines() {
            lines.push(format!("  {}", line));
        }
        lines.join("\n")
    }

    async fn handle_node_enter(&mut self, node_id: &str, context: &ExecutionContext) -> HookDecision {
        if self.state == RunState::Aborted {
            return HookDecision::Abort;
        }
        self.step += 1;
        self.current_node = Some(node_id.to_string());
        self.node_started = Some(Instant::now());
        self.last_context = context.clone();

        if let Some(handle) = &self.handle {
            if let Err(e) = self.tracer.record_node_enter(handle, node_id) {
                warn!(node_id, error = %e, "Failed to trace node entry");
            }
        }
        self.push_history(BreakpointKind::NodeEnter, node_id, None);
        self.event_bus.publish(DebugEvent::NodeEntered {
            node_id: node_id.to_string(),
            step: self.step,
        });

        self.checkpoint(BreakpointKind::NodeEnter, node_id, Some(context)).await
    }

    async fn handle_node_exit(&mut self, node_id: &str, context: &ExecutionContext) {
        self.last_context = context.clone();
        let status = context
            .get_str(&format!("{}_status", node_id))
            .unwrap_or("success")
            .to_string();
        self.record_node_execution(node_id, status, None);
        if let Err(e) = self.snapshots.take(self.step, node_id, context) {
            warn!(node_id, step = self.step, error = %e, "Snapshot skipped");
        }
        self.push_history(BreakpointKind::NodeExit, node_id, None);
        self.event_bus.publish(DebugEvent::NodeExited {
            node_id: node_id.to_string(),
            step: self.step,
        });

        // An abort here takes effect at the next hook that can refuse.
        self.checkpoint(BreakpointKind::NodeExit, node_id, Some(context))
            .await;
    }

    fn record_node_execution(&mut self, node_id: &str, status: String, error: Option<String>) {
        let duration_ms = self
            .node_started
            .take()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.inspector.record_execution(NodeExecutionInfo {
            node_id: node_id.to_string(),
            status,
            duration_ms,
            error,
        });
    }

    async fn handle_edge(&mut self, edge: &EdgeEvent, context: &ExecutionContext) -> HookDecision {
        if self.state == RunState::Aborted {
            return HookDecision::Abort;
        }
        self.current_edge = Some(edge.edge_id.clone());
        self.last_context = context.clone();

        if let Some(handle) = &self.handle {
            if let Err(e) = self
                .tracer
                .record_edge_traversal(handle, &edge.edge_id, &edge.from, &edge.to, &edge.trigger)
            {
                warn!(edge_id = %edge.edge_id, error = %e, "Failed to trace edge traversal");
            }
        }
        if let Err(e) = self
            .routes
            .record(&edge.edge_id, context, edge.reason.clone(), edge.skipped.clone())
        {
            warn!(edge_id = %edge.edge_id, error = %e, "Routing decision not recorded");
        }
        self.push_history(
            BreakpointKind::EdgeTraverse,
            &edge.edge_id,
            Some(format!("{} → {}", edge.from, edge.to)),
        );

        if edge.trigger.is_conditional() {
            let decision = self
                .checkpoint(BreakpointKind::ConditionEval, &edge.edge_id, Some(context))
                .await;
            if decision.is_abort() {
                return decision;
            }
        }
        self.checkpoint(BreakpointKind::EdgeTraverse, &edge.edge_id, Some(context))
            .await
    }

    async fn handle_tool_start(&mut self, tool_name: &str, arguments: &Value) -> String {
        let traced = match &self.handle {
            Some(handle) => self
                .tracer
                .record_tool_call_start(handle, tool_name, arguments.clone())
                .map_err(|e| warn!(tool = tool_name, error = %e, "Failed to trace tool call"))
                .ok(),
            None => None,
        };
        let call_id = traced.unwrap_or_else(|| {
            self.untraced_calls += 1;
            format!("untraced-{:04}", self.untraced_calls)
        });

        self.push_history(BreakpointKind::ToolCall, tool_name, Some(call_id.clone()));
        self.checkpoint(BreakpointKind::ToolCall, tool_name, None).await;
        call_id
    }

    fn handle_tool_end(&mut self, call_id: &str, outcome: ToolOutcome) {
        let detail = match &outcome {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("error: {}", e),
        };
        if let Some(handle) = &self.handle {
            if let Err(e) = self.tracer.record_tool_call_end(handle, call_id, outcome) {
                debug!(call_id, error = %e, "Tool call end not recorded");
            }
        }
        self.push_history(BreakpointKind::ToolCall, call_id, Some(detail));
    }

    async fn handle_error(
        &mut self,
        node_id: &str,
        error: &str,
        context: &ExecutionContext,
    ) -> HookDecision {
        self.last_context = context.clone();
        self.record_node_execution(node_id, "error".to_string(), Some(error.to_string()));
        self.push_history(BreakpointKind::Error, node_id, Some(error.to_string()));
        self.event_bus.publish(DebugEvent::RunError {
            node_id: node_id.to_string(),
            error: error.to_string(),
        });
        self.checkpoint(BreakpointKind::Error, node_id, Some(context))
            .await
    }
}

impl ExecutionHooks for ExecutionController {
    fn before_node<'a>(
        &'a mut self,
        node_id: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        Box::pin(self.handle_node_enter(node_id, context))
    }

    fn after_node<'a>(
        &'a mut self,
        node_id: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.handle_node_exit(node_id, context))
    }

    fn before_edge<'a>(
        &'a mut self,
        edge: &'a EdgeEvent,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        Box::pin(self.handle_edge(edge, context))
    }

    fn before_tool_call<'a>(
        &'a mut self,
        tool_name: &'a str,
        arguments: &'a Value,
    ) -> BoxFuture<'a, String> {
        Box::pin(self.handle_tool_start(tool_name, arguments))
    }

    fn after_tool_call<'a>(
        &'a mut self,
        call_id: &'a str,
        outcome: ToolOutcome,
    ) -> BoxFuture<'a, ()> {
        self.handle_tool_end(call_id, outcome);
        Box::pin(async {})
    }

    fn on_error<'a>(
        &'a mut self,
        node_id: &'a str,
        error: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, HookDecision> {
        Box::pin(self.handle_error(node_id, error, context))
    }
}
