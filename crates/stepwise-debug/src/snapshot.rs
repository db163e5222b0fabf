use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_graph::inspector::{preview_value, type_name};
use stepwise_graph::ExecutionContext;

/// Deep copy of the execution context taken after a node ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub step: u64,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub context: ExecutionContext,
}

/// Key-level difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub step1: u64,
    pub step2: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub common: Vec<String>,
    /// Common keys whose values differ.
    pub changed: Vec<String>,
    pub step_diff: i64,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StateSnapshotStore {
    snapshots: BTreeMap<u64, ContextSnapshot>,
}

impl StateSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self, step: u64, node_id: &str, context: &ExecutionContext) -> Result<()> {
        if self.snapshots.contains_key(&step) {
            return Err(StepwiseError::DuplicateStep(step));
        }
        self.snapshots.insert(
            step,
            ContextSnapshot {
                step,
                node_id: node_id.to_string(),
                timestamp: Utc::now(),
                context: context.clone(),
            },
        );
        debug!(step, node_id, keys = context.len(), "Snapshot taken");
        Ok(())
    }

    pub fn get(&self, step: u64) -> Option<&ContextSnapshot> {
        self.snapshots.get(&step)
    }

    pub fn latest(&self) -> Option<&ContextSnapshot> {
        self.snapshots.values().next_back()
    }

    /// Every snapshot in step order.
    pub fn all(&self) -> Vec<&ContextSnapshot> {
        self.snapshots.values().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    fn require(&self, step: u64) -> Result<&ContextSnapshot> {
        self.get(step).ok_or_else(|| StepwiseError::NotFound {
            what: "Snapshot",
            id: step.to_string(),
        })
    }

    pub fn compare(&self, step1: u64, step2: u64) -> Result<SnapshotDiff> {
        let before = self.require(step1)?.context.data();
        let after = self.require(step2)?.context.data();

        let mut diff = SnapshotDiff {
            step1,
            step2,
            added: Vec::new(),
            removed: Vec::new(),
            common: Vec::new(),
            changed: Vec::new(),
            step_diff: step2 as i64 - step1 as i64,
        };

        for (key, value) in before {
            match after.get(key) {
                Some(other) => {
                    diff.common.push(key.clone());
                    if other != value {
                        diff.changed.push(key.clone());
                    }
                }
                None => diff.removed.push(key.clone()),
            }
        }
        diff.added = after
            .keys()
            .filter(|k| !before.contains_key(*k))
            .cloned()
            .collect();

        diff.added.sort();
        diff.removed.sort();
        diff.common.sort();
        diff.changed.sort();
        Ok(diff)
    }

    /// Textual dump of one snapshot with value previews.
    pub fn render(&self, step: u64) -> Result<String> {
        let snapshot = self.require(step)?;
        let mut lines = vec![
            format!("SNAPSHOT step {} after {}", snapshot.step, snapshot.node_id),
            format!("Taken: {}", snapshot.timestamp.to_rfc3339()),
            format!("Keys ({}):", snapshot.context.len()),
        ];
        for key in snapshot.context.keys() {
            if let Some(value) = snapshot.context.get(&key) {
                lines.push(format!(
                    "  {} ({}): {}",
                    key,
                    type_name(value),
                    preview_value(value)
                ));
            }
        }
        Ok(lines.join("\n"))
    }
}
