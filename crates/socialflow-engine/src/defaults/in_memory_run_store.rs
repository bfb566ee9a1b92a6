//! In-memory run ledger for testing and lightweight usage.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::reconstruct::{fresh_events, reconstruct_run};
use crate::errors::RunStoreError;
use crate::ledger_event::LedgerEvent;
use crate::traits::{RunFilter, RunPage, RunStore};
use crate::types::Run;

/// In-memory implementation of [`RunStore`].
///
/// Uses `BTreeMap` for deterministic iteration order. Projections are
/// rebuilt on every append so reads never fold.
pub struct InMemoryRunStore {
    events: Arc<RwLock<BTreeMap<String, Vec<LedgerEvent>>>>,
    runs: Arc<RwLock<BTreeMap<String, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(BTreeMap::new())),
            runs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn append(&self, new_events: &[LedgerEvent]) -> Result<(), RunStoreError> {
        let mut by_run: HashMap<&str, Vec<&LedgerEvent>> = HashMap::new();
        for event in new_events {
            by_run.entry(event.run_id()).or_default().push(event);
        }

        let mut events_map = self.events.write().await;
        let mut runs_map = self.runs.write().await;

        // Check every run's batch before writing any of them.
        let mut accepted = Vec::with_capacity(by_run.len());
        for (run_id, batch) in by_run {
            let stored = events_map.get(run_id).map(Vec::as_slice).unwrap_or_default();
            let fresh = fresh_events(run_id, stored, batch)?;
            if !fresh.is_empty() {
                accepted.push((run_id, fresh));
            }
        }

        for (run_id, fresh) in accepted {
            let stored = events_map.entry(run_id.to_string()).or_default();
            stored.extend(fresh.into_iter().cloned());
            if let Some(run) = reconstruct_run(stored) {
                runs_map.insert(run_id.to_string(), run);
            }
        }

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RunStoreError> {
        let runs = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(filter.page(runs))
    }

    async fn events(&self, run_id: &str) -> Result<Vec<LedgerEvent>, RunStoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::guide_flow;
    use crate::types::{FlowSnapshot, Platform, RunOrigin, RunStatus, SocialEvent};
    use chrono::{Duration, Utc};

    fn created(run_id: &str, user: &str, seq: u64) -> LedgerEvent {
        let mut ev = LedgerEvent::run_created(
            run_id,
            FlowSnapshot::capture(&guide_flow()),
            SocialEvent::new(Platform::Instagram, user, "guide"),
            RunOrigin::Event,
            None,
            Utc::now(),
        );
        ev.set_seq(seq);
        ev
    }

    fn seq(mut ev: LedgerEvent, n: u64) -> LedgerEvent {
        ev.set_seq(n);
        ev
    }

    #[tokio::test]
    async fn append_and_project() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        store
            .append(&[
                created("run-1", "u1", 1),
                seq(LedgerEvent::run_activated("run-1", None, now), 2),
            ])
            .await
            .unwrap();

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.last_seq, 2);
        assert_eq!(store.events("run-1").await.unwrap().len(), 2);
        assert!(store.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_seq_is_skipped() {
        let store = InMemoryRunStore::new();
        let batch = vec![created("run-1", "u1", 1)];
        store.append(&batch).await.unwrap();
        store.append(&batch).await.unwrap();
        assert_eq!(store.events("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rival_write_at_taken_seq_is_refused() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        store.append(&[created("run-1", "u1", 1)]).await.unwrap();
        store
            .append(&[seq(LedgerEvent::step_claimed("run-1", "welcome", "a", now), 2)])
            .await
            .unwrap();

        let err = store
            .append(&[seq(LedgerEvent::step_claimed("run-1", "welcome", "b", now), 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::Conflict { seq: 2, .. }));

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.claim.unwrap().claimed_by, "a");
        assert_eq!(store.events("run-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn active_run_for_ignores_terminal_runs() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        store
            .append(&[
                created("done", "u1", 1),
                seq(
                    LedgerEvent::run_finished("done", RunStatus::Completed, None, now),
                    2,
                ),
                created("live", "u1", 1),
                created("other", "u2", 1),
            ])
            .await
            .unwrap();

        let active = store
            .active_run_for("flow-guide", Platform::Instagram, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, "live");
        assert!(store
            .active_run_for("flow-guide", Platform::Facebook, "u1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn due_runs_picks_elapsed_waits() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        store
            .append(&[
                created("soon", "u1", 1),
                seq(
                    LedgerEvent::run_waiting("soon", "wait", now + Duration::minutes(10), now),
                    2,
                ),
                created("ready", "u2", 1),
                seq(
                    LedgerEvent::run_waiting("ready", "wait", now - Duration::minutes(1), now),
                    2,
                ),
            ])
            .await
            .unwrap();

        let due = store.due_runs(now, None).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ready"]);
    }
}
