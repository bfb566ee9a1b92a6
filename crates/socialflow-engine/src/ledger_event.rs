//! The single event enum for everything that happens to a run.
//!
//! A run's ledger is an append-only sequence of these events. Every variant
//! carries a per-run monotonic `seq` (assigned by the executor at commit
//! time) and a `schema_version` for forward-compatible deserialization.
//! [`Run`](crate::types::Run) is rebuilt by folding them in `seq` order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    FlowSnapshot, RunOrigin, RunStatus, SocialEvent, TerminationReason, TrailEntry,
    LEDGER_SCHEMA_VERSION,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "event_type")]
#[non_exhaustive]
pub enum LedgerEvent {
    /// First event of every run. Snapshot and event are boxed to keep
    /// variant sizes uniform.
    RunCreated {
        seq: u64,
        schema_version: u16,
        run_id: String,
        flow_id: String,
        snapshot: Box<FlowSnapshot>,
        event: Box<SocialEvent>,
        origin: RunOrigin,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// Run moved to `running`, either right after creation or after a delay.
    RunActivated {
        seq: u64,
        schema_version: u16,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_from: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Replaces the run's frontier.
    FrontierSet {
        seq: u64,
        schema_version: u16,
        run_id: String,
        pending: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    StepRecorded {
        seq: u64,
        schema_version: u16,
        run_id: String,
        entry: TrailEntry,
        timestamp: DateTime<Utc>,
    },
    /// An executor is about to perform `node_id`'s side effect. Another
    /// executor seeing a fresh claim by someone else leaves the run alone.
    StepClaimed {
        seq: u64,
        schema_version: u16,
        run_id: String,
        node_id: String,
        claimed_by: String,
        timestamp: DateTime<Utc>,
    },
    /// Run suspended on a delay node.
    RunWaiting {
        seq: u64,
        schema_version: u16,
        run_id: String,
        node_id: String,
        resume_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    ResponseRecorded {
        seq: u64,
        schema_version: u16,
        run_id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// A matching event arrived while this run was live and the flow does
    /// not allow multiple runs per contact.
    DuplicateSuppressed {
        seq: u64,
        schema_version: u16,
        run_id: String,
        event: Box<SocialEvent>,
        timestamp: DateTime<Utc>,
    },
    /// Last event of every terminal run.
    RunFinished {
        seq: u64,
        schema_version: u16,
        run_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        termination: Option<TerminationReason>,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn run_created(
        run_id: &str,
        snapshot: FlowSnapshot,
        event: SocialEvent,
        origin: RunOrigin,
        deadline: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::RunCreated {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            flow_id: snapshot.flow_id.clone(),
            snapshot: Box::new(snapshot),
            event: Box::new(event),
            origin,
            deadline,
            timestamp,
        }
    }

    pub fn run_activated(run_id: &str, resumed_from: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Self::RunActivated {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            resumed_from,
            timestamp,
        }
    }

    pub fn frontier_set(run_id: &str, pending: Vec<String>, timestamp: DateTime<Utc>) -> Self {
        Self::FrontierSet {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            pending,
            timestamp,
        }
    }

    pub fn step_recorded(run_id: &str, entry: TrailEntry) -> Self {
        let timestamp = entry.at;
        Self::StepRecorded {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            entry,
            timestamp,
        }
    }

    pub fn step_claimed(
        run_id: &str,
        node_id: &str,
        claimed_by: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::StepClaimed {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            claimed_by: claimed_by.to_string(),
            timestamp,
        }
    }

    pub fn run_waiting(
        run_id: &str,
        node_id: &str,
        resume_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::RunWaiting {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            resume_at,
            timestamp,
        }
    }

    pub fn response_recorded(run_id: &str, content: String, timestamp: DateTime<Utc>) -> Self {
        Self::ResponseRecorded {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            content,
            timestamp,
        }
    }

    pub fn duplicate_suppressed(run_id: &str, event: SocialEvent, timestamp: DateTime<Utc>) -> Self {
        Self::DuplicateSuppressed {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            event: Box::new(event),
            timestamp,
        }
    }

    pub fn run_finished(
        run_id: &str,
        status: RunStatus,
        termination: Option<TerminationReason>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::RunFinished {
            seq: 0,
            schema_version: LEDGER_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            status,
            termination,
            timestamp,
        }
    }

    /// Returns the sequence number of this event.
    pub fn seq(&self) -> u64 {
        match self {
            Self::RunCreated { seq, .. }
            | Self::RunActivated { seq, .. }
            | Self::FrontierSet { seq, .. }
            | Self::StepRecorded { seq, .. }
            | Self::StepClaimed { seq, .. }
            | Self::RunWaiting { seq, .. }
            | Self::ResponseRecorded { seq, .. }
            | Self::DuplicateSuppressed { seq, .. }
            | Self::RunFinished { seq, .. } => *seq,
        }
    }

    /// Sets the sequence number on this event.
    pub fn set_seq(&mut self, new_seq: u64) {
        match self {
            Self::RunCreated { seq, .. }
            | Self::RunActivated { seq, .. }
            | Self::FrontierSet { seq, .. }
            | Self::StepRecorded { seq, .. }
            | Self::StepClaimed { seq, .. }
            | Self::RunWaiting { seq, .. }
            | Self::ResponseRecorded { seq, .. }
            | Self::DuplicateSuppressed { seq, .. }
            | Self::RunFinished { seq, .. } => *seq = new_seq,
        }
    }

    /// Returns the run_id associated with this event.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunActivated { run_id, .. }
            | Self::FrontierSet { run_id, .. }
            | Self::StepRecorded { run_id, .. }
            | Self::StepClaimed { run_id, .. }
            | Self::RunWaiting { run_id, .. }
            | Self::ResponseRecorded { run_id, .. }
            | Self::DuplicateSuppressed { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunCreated { timestamp, .. }
            | Self::RunActivated { timestamp, .. }
            | Self::FrontierSet { timestamp, .. }
            | Self::StepRecorded { timestamp, .. }
            | Self::StepClaimed { timestamp, .. }
            | Self::RunWaiting { timestamp, .. }
            | Self::ResponseRecorded { timestamp, .. }
            | Self::DuplicateSuppressed { timestamp, .. }
            | Self::RunFinished { timestamp, .. } => *timestamp,
        }
    }
}
