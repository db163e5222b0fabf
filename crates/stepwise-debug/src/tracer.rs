use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::SessionId;
use stepwise_graph::EdgeTrigger;

/// Result reported by the engine when a tool call finishes.
pub type ToolOutcome = std::result::Result<Value, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Node that was executing when the call started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Index into `node_sequence` of the visit the call belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit: Option<usize>,
    /// Number of calls still open when this one started.
    #[serde(default)]
    pub call_stack_depth: usize,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTraversal {
    pub edge_id: String,
    pub from: String,
    pub to: String,
    /// Trigger of the edge that was taken.
    #[serde(default)]
    pub condition: EdgeTrigger,
    pub timestamp: DateTime<Utc>,
}

/// Everything recorded for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSession {
    pub trace_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub node_sequence: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub edge_traversals: Vec<EdgeTraversal>,
    /// Tool-call ends that named an unknown or already-closed call.
    #[serde(default)]
    pub dropped_tool_call_ends: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub total_ms: u64,
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl TimingStats {
    fn from_durations(durations: &[u64]) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        let total_ms: u64 = durations.iter().sum();
        Self {
            total_ms,
            average_ms: total_ms as f64 / durations.len() as f64,
            min_ms: durations.iter().copied().min().unwrap_or_default(),
            max_ms: durations.iter().copied().max().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub count: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(flatten)]
    pub timing: TimingStats,
}

/// Derived statistics over the closed tool calls of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    pub total_calls: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    pub tools_used: Vec<String>,
    #[serde(flatten)]
    pub timing: TimingStats,
    pub by_tool: BTreeMap<String, ToolStats>,
}

impl TraceSession {
    fn new(trace_id: SessionId, start_time: DateTime<Utc>) -> Self {
        Self {
            trace_id,
            start_time,
            end_time: None,
            total_duration_ms: None,
            node_sequence: Vec::new(),
            tool_calls: Vec::new(),
            edge_traversals: Vec::new(),
            dropped_tool_call_ends: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();
        let mut durations = Vec::new();
        let mut per_tool: BTreeMap<String, (ToolStats, Vec<u64>)> = BTreeMap::new();

        for call in &self.tool_calls {
            if call.status == ToolCallStatus::Pending {
                stats.pending += 1;
                continue;
            }
            let duration = call.duration_ms.unwrap_or_default();
            let ok = call.status == ToolCallStatus::Success;

            stats.total_calls += 1;
            if ok {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            durations.push(duration);

            let (tool, tool_durations) = per_tool.entry(call.tool_name.clone()).or_default();
            tool.count += 1;
            if ok {
                tool.successful += 1;
            } else {
                tool.failed += 1;
            }
            tool_durations.push(duration);
        }

        stats.timing = TimingStats::from_durations(&durations);
        stats.by_tool = per_tool
            .into_iter()
            .map(|(name, (mut tool, durations))| {
                tool.timing = TimingStats::from_durations(&durations);
                (name, tool)
            })
            .collect();

        let mut tools_used: Vec<String> = self.tool_calls.iter().map(|c| c.tool_name.clone()).collect();
        tools_used.sort();
        tools_used.dedup();
        stats.tools_used = tools_used;

        stats
    }

    /// Serialize a closed session.
    pub fn export(&self) -> Result<String> {
        if !self.is_closed() {
            return Err(StepwiseError::SessionNotClosed(self.trace_id.to_string()));
        }
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Human-readable trace listing.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "=".repeat(70),
            format!("EXECUTION TRACE: {}", self.trace_id),
            "=".repeat(70),
        ];
        match self.total_duration_ms {
            Some(ms) => lines.push(format!("Duration: {}ms", ms)),
            None => lines.push("Duration: (session open)".to_string()),
        }
        lines.push(String::new());
        lines.push(format!("Nodes executed ({}):", self.node_sequence.len()));

        for (i, node_id) in self.node_sequence.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, node_id));
            for call in self.tool_calls.iter().filter(|c| c.visit == Some(i)) {
                lines.push(render_call(call));
            }
        }

        let unattributed: Vec<&ToolCallRecord> =
            self.tool_calls.iter().filter(|c| c.visit.is_none()).collect();
        if !unattributed.is_empty() {
            lines.push("  (outside any node)".to_string());
            for call in unattributed {
                lines.push(render_call(call));
            }
        }

        if !self.edge_traversals.is_empty() {
            lines.push(String::new());
            lines.push("Edges traversed:".to_string());
            for t in &self.edge_traversals {
                lines.push(format!(
                    "  {} → {} (via {}, {})",
                    t.from, t.to, t.edge_id, t.condition
                ));
            }
        }

        if self.dropped_tool_call_ends > 0 {
            lines.push(String::new());
            lines.push(format!("Dropped tool-call ends: {}", self.dropped_tool_call_ends));
        }

        lines.push("=".repeat(70));
        lines.join("\n")
    }
}

fn render_call(call: &ToolCallRecord) -> String {
    let status = match call.status {
        ToolCallStatus::Success => "✓",
        ToolCallStatus::Error => "✗",
        ToolCallStatus::Pending => "…",
    };
    let duration = call
        .duration_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "pending".to_string());
    let indent = "  ".repeat(call.call_stack_depth);
    let mut line = format!(
        "     {}{} {} ({})",
        indent, status, call.tool_name, duration
    );
    if let Some(err) = &call.error {
        line.push_str(&format!(" error: {}", err));
    }
    line
}

/// Proof that the caller opened the session it is recording into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHandle {
    session_id: SessionId,
    generation: u64,
}

impl TraceHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Append-only recorder of node visits, tool calls, and edge traversals.
///
/// At most one session is open at a time. Every record call takes the
/// [`TraceHandle`] returned by [`start`](Self::start); a handle from an
/// ended or discarded session is rejected with `NoOpenSession`.
#[derive(Debug, Default)]
pub struct ExecutionTracer {
    open: Option<TraceSession>,
    generation: u64,
    /// Tool calls started and not yet ended in the open session.
    call_depth: usize,
    completed: Vec<TraceSession>,
}

impl ExecutionTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, session_id: SessionId) -> Result<TraceHandle> {
        self.start_at(session_id, Utc::now())
    }

    pub fn start_at(&mut self, session_id: SessionId, at: DateTime<Utc>) -> Result<TraceHandle> {
        if let Some(open) = &self.open {
            return Err(StepwiseError::AlreadyOpen(open.trace_id.to_string()));
        }
        self.generation += 1;
        self.call_depth = 0;
        info!(trace_id = %session_id, "Trace session started");
        self.open = Some(TraceSession::new(session_id.clone(), at));
        Ok(TraceHandle {
            session_id,
            generation: self.generation,
        })
    }

    /// Drop the open session without closing it.
    pub fn discard(&mut self) -> Option<TraceSession> {
        let dropped = self.open.take();
        if let Some(session) = &dropped {
            warn!(trace_id = %session.trace_id, "Trace session discarded");
            self.generation += 1;
            self.call_depth = 0;
        }
        dropped
    }

    fn session_mut(&mut self, handle: &TraceHandle) -> Result<&mut TraceSession> {
        if handle.generation != self.generation {
            return Err(StepwiseError::NoOpenSession);
        }
        match self.open.as_mut() {
            Some(session) if session.trace_id == handle.session_id => Ok(session),
            _ => Err(StepwiseError::NoOpenSession),
        }
    }

    pub fn record_node_enter(&mut self, handle: &TraceHandle, node_id: &str) -> Result<()> {
        let session = self.session_mut(handle)?;
        session.node_sequence.push(node_id.to_string());
        debug!(node_id, visit = session.node_sequence.len(), "Trace: node entered");
        Ok(())
    }

    /// Open a tool call and return its call id.
    pub fn record_tool_call_start(
        &mut self,
        handle: &TraceHandle,
        tool_name: &str,
        arguments: Value,
    ) -> Result<String> {
        self.record_tool_call_start_at(handle, tool_name, arguments, Utc::now())
    }

    pub fn record_tool_call_start_at(
        &mut self,
        handle: &TraceHandle,
        tool_name: &str,
        arguments: Value,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let depth = self.call_depth;
        let session = self.session_mut(handle)?;
        let call_id = format!("call-{:04}", session.tool_calls.len() + 1);
        let visit = session.node_sequence.len().checked_sub(1);
        session.tool_calls.push(ToolCallRecord {
            call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
            node_id: session.node_sequence.last().cloned(),
            visit,
            call_stack_depth: depth,
            start_time: at,
            end_time: None,
            duration_ms: None,
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        });
        debug!(tool = tool_name, call_id = %call_id, depth, "Trace: tool call started");
        self.call_depth += 1;
        Ok(call_id)
    }

    /// Close a tool call. An unknown or already-closed call id is counted
    /// in `dropped_tool_call_ends` and reported as an `Ordering` error.
    pub fn record_tool_call_end(
        &mut self,
        handle: &TraceHandle,
        call_id: &str,
        outcome: ToolOutcome,
    ) -> Result<()> {
        self.record_tool_call_end_at(handle, call_id, outcome, Utc::now())
    }

    pub fn record_tool_call_end_at(
        &mut self,
        handle: &TraceHandle,
        call_id: &str,
        outcome: ToolOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let session = self.session_mut(handle)?;
        let open_call = session
            .tool_calls
            .iter_mut()
            .find(|c| c.call_id == call_id && c.status == ToolCallStatus::Pending);

        let Some(call) = open_call else {
            session.dropped_tool_call_ends += 1;
            warn!(call_id, "Tool call end without a matching open call, dropped");
            return Err(StepwiseError::Ordering(format!(
                "no open tool call with id {}",
                call_id
            )));
        };

        let elapsed = (at - call.start_time).num_milliseconds().max(0) as u64;
        call.end_time = Some(at);
        call.duration_ms = Some(elapsed);
        match outcome {
            Ok(result) => {
                call.status = ToolCallStatus::Success;
                call.result = Some(result);
            }
            Err(error) => {
                call.status = ToolCallStatus::Error;
                call.error = Some(error);
            }
        }
        debug!(call_id, duration_ms = elapsed, status = ?call.status, "Trace: tool call ended");
        self.call_depth = self.call_depth.saturating_sub(1);
        Ok(())
    }

    pub fn record_edge_traversal(
        &mut self,
        handle: &TraceHandle,
        edge_id: &str,
        from: &str,
        to: &str,
        condition: &EdgeTrigger,
    ) -> Result<()> {
        let session = self.session_mut(handle)?;
        session.edge_traversals.push(EdgeTraversal {
            edge_id: edge_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            condition: condition.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Close and freeze the session. A copy stays in the completed list.
    pub fn end(&mut self, handle: &TraceHandle) -> Result<TraceSession> {
        self.end_at(handle, Utc::now())
    }

    pub fn end_at(&mut self, handle: &TraceHandle, at: DateTime<Utc>) -> Result<TraceSession> {
        self.session_mut(handle)?;
        let mut session = self.open.take().ok_or(StepwiseError::NoOpenSession)?;
        session.end_time = Some(at);
        session.total_duration_ms = Some((at - session.start_time).num_milliseconds().max(0) as u64);
        self.generation += 1;
        self.call_depth = 0;

        info!(
            trace_id = %session.trace_id,
            nodes = session.node_sequence.len(),
            tool_calls = session.tool_calls.len(),
            dropped = session.dropped_tool_call_ends,
            "Trace session ended"
        );
        self.completed.push(session.clone());
        Ok(session)
    }

    /// The open session, if any.
    pub fn current(&self) -> Option<&TraceSession> {
        self.open.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Closed sessions, oldest first.
    pub fn completed(&self) -> &[TraceSession] {
        &self.completed
    }

    /// Stats for the open session, else the most recently closed one.
    pub fn stats(&self) -> Option<TraceStats> {
        self.open
            .as_ref()
            .or_else(|| self.completed.last())
            .map(TraceSession::stats)
    }
}
