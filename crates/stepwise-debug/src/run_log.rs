use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepwise_core::event::EventBus;
use stepwise_core::types::{DebugEvent, SessionId};

/// JSONL log of debugger events.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{session_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crashed run still leaves a readable log.
pub struct DebugRunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log line.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl DebugRunLogger {
    /// `level` controls verbosity: 1 = session summary, 2 = + breakpoints
    /// and pauses, 3 = + every node entry and exit.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run the logger until the session ends, the bus closes, or `cancel`
    /// fires. Subscribe before the run starts or early events are missed.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let mut rx = event_bus.subscribe();

        let session_dir = self.log_dir.join(session_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "Debug run logger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let sid = session_id.to_string();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Debug run logger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&sid, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, DebugEvent::SessionEnded { .. }) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Debug run logger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, debug run logger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Debug run logger finished");
        Some(log_path)
    }

    /// Convert an event to a log line, or `None` if the level filters it out.
    fn event_to_entry(&self, session_id: &str, event: &DebugEvent) -> Option<LogEntry> {
        let (step, detail) = match event {
            // L1: session summary
            DebugEvent::SessionStarted { session_id: run } => {
                (None, Some(serde_json::json!({ "run_session": run.as_str() })))
            }
            DebugEvent::SessionEnded {
                nodes_visited,
                tool_calls,
                ..
            } => (
                None,
                Some(serde_json::json!({
                    "nodes_visited": nodes_visited,
                    "tool_calls": tool_calls,
                })),
            ),
            DebugEvent::RunError { node_id, error } => (
                None,
                Some(serde_json::json!({ "node_id": node_id, "error": error })),
            ),

            // L2: breakpoints and pauses
            DebugEvent::BreakpointHit {
                kind,
                target,
                step,
                blocking,
            } if self.level >= 2 => (
                Some(*step),
                Some(serde_json::json!({
                    "kind": kind.as_str(),
                    "target": target,
                    "blocking": blocking,
                })),
            ),
            DebugEvent::Paused { step, .. } if self.level >= 2 => (Some(*step), None),
            DebugEvent::Resumed { command } if self.level >= 2 => {
                (None, Some(serde_json::json!({ "command": command })))
            }
            DebugEvent::PredicateWarning {
                kind,
                target,
                message,
            } if self.level >= 2 => (
                None,
                Some(serde_json::json!({
                    "kind": kind.as_str(),
                    "target": target,
                    "message": message,
                })),
            ),
            DebugEvent::StateDump { dump } if self.level >= 2 => (
                None,
                Some(serde_json::json!({ "dump": truncate_str(dump, 2000) })),
            ),

            // L3: per-node events
            DebugEvent::NodeEntered { node_id, step } | DebugEvent::NodeExited { node_id, step }
                if self.level >= 3 =>
            {
                (Some(*step), Some(serde_json::json!({ "node_id": node_id })))
            }

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            event_type: event.name(),
            step,
            detail,
        })
    }
}

/// Truncate a string for logging on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
