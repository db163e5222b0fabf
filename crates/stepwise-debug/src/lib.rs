//! Interactive debugging for stepwise graph runs.
//!
//! An [`Engine`] drives execution and reports each lifecycle point through
//! [`ExecutionHooks`]. The [`ExecutionController`] implements those hooks:
//! it traces the run, snapshots the context after every node, records
//! routing decisions, and suspends at breakpoints until an operator answers
//! on its command channel.

pub mod breakpoint;
pub mod controller;
pub mod executor;
pub mod hooks;
pub mod predicate;
pub mod run_log;
pub mod snapshot;
pub mod tracer;

pub use breakpoint::{Breakpoint, BreakpointRegistry, Evaluation, WILDCARD};
pub use controller::{
    BreakpointHit, DebugCommand, ExecutionController, PauseReport, RunState, TraceEvent,
};
pub use executor::{GraphExecutor, NodeHandler, NodeOutcome, ScriptedHandler, ScriptedOutcome};
pub use hooks::{EdgeEvent, Engine, ExecutionHooks, HookDecision, PassthroughHooks};
pub use predicate::{Predicate, PredicateError, PredicateNode};
pub use run_log::DebugRunLogger;
pub use snapshot::{ContextSnapshot, SnapshotDiff, StateSnapshotStore};
pub use tracer::{
    ExecutionTracer, TimingStats, ToolCallRecord, ToolCallStatus, ToolOutcome, ToolStats,
    TraceHandle, TraceSession, TraceStats,
};
