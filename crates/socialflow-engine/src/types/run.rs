//! Runs, their trail, and the per-flow projections derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::SocialEvent;
use super::flow::{FlowDefinition, FlowSettings, NodeData, NodeKind};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The flow as it was when a run was created. Later edits to the flow never
/// reach a run that already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub flow_name: String,
    pub definition: FlowDefinition,
    pub settings: FlowSettings,
    /// SHA-256 of the canonical definition JSON.
    pub content_hash: String,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution of a flow for one matched event.
///
/// A `Run` is a projection of its ledger events (see
/// [`reconstruct_run`](crate::defaults::reconstruct::reconstruct_run)); it is
/// never written directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Run {
    pub id: String,
    pub flow_id: String,
    pub snapshot: FlowSnapshot,
    pub event: SocialEvent,
    pub origin: RunOrigin,
    pub status: RunStatus,
    /// Node the run is at: the trigger right after creation, then the front
    /// of `pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    /// Nodes queued for execution, in order.
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Creation time plus the flow's timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trail: Vec<TrailEntry>,
    /// Replies recorded from the contact while the run was live.
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    /// Events discarded because this run was still live.
    #[serde(default)]
    pub suppressed_events: u32,
    /// Node whose side effect an executor has started but not yet recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<StepClaim>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Highest ledger sequence number folded into this projection.
    pub last_seq: u64,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_test(&self) -> bool {
        matches!(self.origin, RunOrigin::Test { .. })
    }

    /// Ids of nodes that have an entry in the trail, in execution order.
    pub fn executed_nodes(&self) -> Vec<&str> {
        self.trail.iter().map(|e| e.node_id.as_str()).collect()
    }

    /// Tags successfully attached to the contact during this run.
    pub fn applied_tags(&self) -> Vec<&str> {
        self.trail
            .iter()
            .filter(|e| e.kind == NodeKind::Tag && matches!(e.outcome, StepOutcome::Executed))
            .filter_map(|e| match self.snapshot.definition.node(&e.node_id) {
                Some(node) => match &node.data {
                    NodeData::Tag { tag_name } => Some(tag_name.as_str()),
                    _ => None,
                },
                None => None,
            })
            .collect()
    }
}

/// An executor's claim on the node at the front of the frontier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct StepClaim {
    pub node_id: String,
    pub claimed_by: String,
    pub at: DateTime<Utc>,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Suspended on a delay node until `resume_at`.
    Waiting,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Terminal runs never advance and are never overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// How a run was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunOrigin {
    /// A real social event matched the flow's trigger.
    Event,
    /// The owner's dry-run test trigger.
    Test { principal: String },
}

/// One executed node in a run's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct TrailEntry {
    pub node_id: String,
    pub kind: NodeKind,
    pub outcome: StepOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepOutcome {
    Executed,
    /// Adapter call failed. The run may still have continued.
    Failed { error: String },
    Delayed { until: DateTime<Utc> },
    Branched { outcome: String, matched: bool },
}

/// Why a run ended anywhere other than `completed` with nothing to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum TerminationReason {
    /// An adapter failed with `stop_on_error` set.
    Adapter { node_id: String, message: String },
    /// The run outlived the flow's `timeout_minutes`.
    Timeout { timeout_minutes: u32 },
    /// A condition produced an outcome with no matching edge.
    UnmatchedBranch { node_id: String, outcome: String },
    /// The snapshot referenced a node that does not exist.
    InvalidGraph { message: String },
    /// Stopped through the management surface.
    Stopped { reason: String },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter { node_id, message } => write!(f, "adapter failed at {node_id}: {message}"),
            Self::Timeout { timeout_minutes } => write!(f, "timed out after {timeout_minutes}m"),
            Self::UnmatchedBranch { node_id, outcome } => {
                write!(f, "no branch for '{outcome}' at {node_id}")
            }
            Self::InvalidGraph { message } => write!(f, "invalid graph: {message}"),
            Self::Stopped { reason } => write!(f, "stopped: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Per-flow aggregates recomputed from the run ledger.
///
/// `total_triggers >= total_completions` holds by construction: every
/// completed run counted here is also counted as a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowStats {
    pub flow_id: String,
    pub total_triggers: u64,
    pub total_completions: u64,
    pub total_failures: u64,
    /// Test-trigger runs, reported whether or not they are counted above.
    pub test_runs: u64,
    pub active_runs: u64,
    pub suppressed_events: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn termination_reason_display() {
        let reason = TerminationReason::Timeout { timeout_minutes: 30 };
        assert_eq!(reason.to_string(), "timed out after 30m");
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "timeout");
    }
}
