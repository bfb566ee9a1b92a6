//! Shared projection logic for building runs and stats from ledger events.
//!
//! Every [`RunStore`](crate::traits::RunStore) is event-sourced; this module
//! provides the common fold from a run's `Vec<LedgerEvent>` to its [`Run`],
//! and from a flow's runs to its [`FlowStats`], plus the sequencing check
//! every append goes through.

use crate::errors::RunStoreError;
use crate::ledger_event::LedgerEvent;
use crate::types::{FlowStats, Run, RunStatus, StepClaim};

/// Reconstruct a `Run` from events ordered by seq.
///
/// Returns `None` if the events do not start with `RunCreated`. Once a
/// `RunFinished` has been folded, later events are ignored: terminal state
/// is never overwritten.
pub fn reconstruct_run(events: &[LedgerEvent]) -> Option<Run> {
    let mut iter = events.iter();
    let mut run = match iter.next()? {
        LedgerEvent::RunCreated {
            seq,
            run_id,
            flow_id,
            snapshot,
            event,
            origin,
            deadline,
            timestamp,
            ..
        } => Run {
            id: run_id.clone(),
            flow_id: flow_id.clone(),
            current_node: snapshot.definition.trigger_node().map(|n| n.id.clone()),
            snapshot: (**snapshot).clone(),
            event: (**event).clone(),
            origin: origin.clone(),
            status: RunStatus::Pending,
            pending: Vec::new(),
            resume_at: None,
            deadline: *deadline,
            trail: Vec::new(),
            responses: Vec::new(),
            termination: None,
            suppressed_events: 0,
            claim: None,
            created_at: *timestamp,
            updated_at: *timestamp,
            completed_at: None,
            last_seq: *seq,
        },
        _ => return None,
    };

    for event in iter {
        if run.is_terminal() {
            break;
        }
        match event {
            LedgerEvent::RunCreated { .. } => {}
            LedgerEvent::RunActivated { .. } => {
                run.status = RunStatus::Running;
                run.resume_at = None;
            }
            LedgerEvent::FrontierSet { pending, .. } => {
                run.pending = pending.clone();
                run.current_node = pending.first().cloned();
            }
            LedgerEvent::StepClaimed {
                node_id,
                claimed_by,
                timestamp,
                ..
            } => {
                run.claim = Some(StepClaim {
                    node_id: node_id.clone(),
                    claimed_by: claimed_by.clone(),
                    at: *timestamp,
                });
            }
            LedgerEvent::StepRecorded { entry, .. } => {
                run.trail.push(entry.clone());
                run.claim = None;
            }
            LedgerEvent::RunWaiting {
                node_id, resume_at, ..
            } => {
                run.claim = None;
                run.status = RunStatus::Waiting;
                run.resume_at = Some(*resume_at);
                run.current_node = Some(node_id.clone());
            }
            LedgerEvent::ResponseRecorded { content, .. } => {
                run.responses.push(content.clone());
            }
            LedgerEvent::DuplicateSuppressed { .. } => {
                run.suppressed_events += 1;
            }
            LedgerEvent::RunFinished {
                status,
                termination,
                timestamp,
                ..
            } => {
                run.status = *status;
                run.termination = termination.clone();
                run.completed_at = Some(*timestamp);
                run.claim = None;
                run.pending.clear();
                run.resume_at = None;
            }
        }
        run.last_seq = event.seq();
        run.updated_at = run.updated_at.max(event.timestamp());
    }

    Some(run)
}

/// Select the events of `incoming` that extend `existing` (one run's
/// ledger, ordered by seq).
///
/// An event whose seq is already taken is skipped when it is identical to
/// the stored one, so replaying a batch is harmless. A different event at a
/// taken seq, or a gap, is a [`RunStoreError::Conflict`] and nothing of the
/// batch may be written.
pub fn fresh_events<'a>(
    run_id: &str,
    existing: &[LedgerEvent],
    mut incoming: Vec<&'a LedgerEvent>,
) -> Result<Vec<&'a LedgerEvent>, RunStoreError> {
    incoming.sort_by_key(|e| e.seq());
    let mut next = existing.last().map_or(1, |e| e.seq() + 1);
    let mut fresh: Vec<&LedgerEvent> = Vec::new();
    for event in incoming {
        let seq = event.seq();
        if seq < next {
            let stored = existing
                .iter()
                .find(|e| e.seq() == seq)
                .or_else(|| fresh.iter().copied().find(|e| e.seq() == seq));
            if stored == Some(event) {
                continue;
            }
        }
        if seq != next {
            return Err(RunStoreError::Conflict {
                run_id: run_id.to_string(),
                seq,
                expected: next,
            });
        }
        fresh.push(event);
        next += 1;
    }
    Ok(fresh)
}

/// Fold a flow's runs into its aggregates.
///
/// Test runs always count toward `test_runs`; they count toward triggers,
/// completions and failures only when `count_test_runs` is set.
pub fn flow_stats_from_runs(flow_id: &str, runs: &[Run], count_test_runs: bool) -> FlowStats {
    let mut stats = FlowStats {
        flow_id: flow_id.to_string(),
        ..FlowStats::default()
    };
    for run in runs.iter().filter(|r| r.flow_id == flow_id) {
        stats.suppressed_events += u64::from(run.suppressed_events);
        if !run.is_terminal() {
            stats.active_runs += 1;
        }
        if run.is_test() {
            stats.test_runs += 1;
            if !count_test_runs {
                continue;
            }
        }
        stats.total_triggers += 1;
        match run.status {
            RunStatus::Completed => stats.total_completions += 1,
            RunStatus::Failed => stats.total_failures += 1,
            _ => {}
        }
        if stats.last_triggered.map_or(true, |t| run.created_at > t) {
            stats.last_triggered = Some(run.created_at);
        }
    }
    stats
}
