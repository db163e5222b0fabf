use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique trace session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle point a breakpoint is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    NodeEnter,
    NodeExit,
    EdgeTraverse,
    ConditionEval,
    ToolCall,
    Error,
}

impl BreakpointKind {
    pub const ALL: [BreakpointKind; 6] = [
        Self::NodeEnter,
        Self::NodeExit,
        Self::EdgeTraverse,
        Self::ConditionEval,
        Self::ToolCall,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeEnter => "node_enter",
            Self::NodeExit => "node_exit",
            Self::EdgeTraverse => "edge_traverse",
            Self::ConditionEval => "condition_eval",
            Self::ToolCall => "tool_call",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BreakpointKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "node_enter" | "enter" => Ok(Self::NodeEnter),
            "node_exit" | "exit" => Ok(Self::NodeExit),
            "edge_traverse" | "edge" => Ok(Self::EdgeTraverse),
            "condition_eval" | "condition" => Ok(Self::ConditionEval),
            "tool_call" | "tool" => Ok(Self::ToolCall),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown breakpoint kind: {}", other)),
        }
    }
}

/// Debugger event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// A trace session was opened for a run.
    SessionStarted { session_id: SessionId },
    /// The trace session was closed.
    SessionEnded {
        session_id: SessionId,
        nodes_visited: usize,
        tool_calls: usize,
    },
    /// The engine entered a node.
    NodeEntered { node_id: String, step: u64 },
    /// The engine finished a node.
    NodeExited { node_id: String, step: u64 },
    /// A breakpoint matched. `blocking` is false in non-interactive mode.
    BreakpointHit {
        kind: BreakpointKind,
        target: String,
        step: u64,
        blocking: bool,
    },
    /// Execution is suspended awaiting an operator command.
    Paused { step: u64, report: String },
    /// Answer to an inspect command while paused.
    StateDump { dump: String },
    /// Execution resumed after a pause.
    Resumed { command: String },
    /// A breakpoint condition failed to evaluate and was treated as not hit.
    PredicateWarning {
        kind: BreakpointKind,
        target: String,
        message: String,
    },
    /// The engine reported an error for a node.
    RunError { node_id: String, error: String },
}

impl DebugEvent {
    /// Stable snake_case name used in logs and exports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::NodeEntered { .. } => "node_entered",
            Self::NodeExited { .. } => "node_exited",
            Self::BreakpointHit { .. } => "breakpoint_hit",
            Self::Paused { .. } => "paused",
            Self::StateDump { .. } => "state_dump",
            Self::Resumed { .. } => "resumed",
            Self::PredicateWarning { .. } => "predicate_warning",
            Self::RunError { .. } => "run_error",
        }
    }
}
