//! File-system backed run ledger using JSONL event files.
//!
//! Layout:
//! ```text
//! {base_dir}/runs/{run_id}/ledger.jsonl
//! ```
//!
//! Each line is a JSON-serialized [`LedgerEvent`]. Writes are all-or-nothing
//! via temp-file-then-rename. Replayed events are skipped; a different event
//! at a taken seq is refused with [`RunStoreError::Conflict`].
//!
//! Appends to one run are serialized inside the process. Files carry no
//! cross-process lock, so one process owns a data directory at a time.
//!
//! Opening the store scans every ledger once to build an in-memory index of
//! live runs and of run ids per flow. Due-run, live-run and per-flow stats
//! queries are answered from the index and the flow's own ledgers, so
//! finished runs of other flows are never re-read.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::reconstruct::{self, flow_stats_from_runs, fresh_events};
use crate::errors::RunStoreError;
use crate::locks::KeyedLocks;
use crate::ledger_event::LedgerEvent;
use crate::traits::{is_due, RunFilter, RunPage, RunStore};
use crate::types::{FlowStats, Platform, Run};

/// File-system backed run ledger.
///
/// `get_run` projects from the ledger on every read, so a process that
/// restarts sees exactly what was durably appended.
pub struct FileRunStore {
    runs_dir: PathBuf,
    append_locks: KeyedLocks,
    index: RwLock<RunIndex>,
}

/// Live runs by id, and every run id by flow.
#[derive(Default)]
struct RunIndex {
    live: HashMap<String, Run>,
    by_flow: HashMap<String, HashSet<String>>,
}

impl RunIndex {
    fn record(&mut self, run: &Run) {
        self.by_flow
            .entry(run.flow_id.clone())
            .or_default()
            .insert(run.id.clone());
        if run.is_terminal() {
            self.live.remove(&run.id);
        } else {
            self.live.insert(run.id.clone(), run.clone());
        }
    }
}

impl FileRunStore {
    /// Create a new `FileRunStore` rooted at `base_dir`.
    ///
    /// Creates `{base_dir}/runs/` if it doesn't exist, then indexes the
    /// runs already there.
    pub fn new(base_dir: PathBuf) -> Result<Self, RunStoreError> {
        let runs_dir = base_dir.join("runs");
        std::fs::create_dir_all(&runs_dir).map_err(|e| RunStoreError::Store {
            message: format!("failed to create runs directory: {e}"),
        })?;
        let store = Self {
            runs_dir,
            append_locks: KeyedLocks::new(),
            index: RwLock::new(RunIndex::default()),
        };

        let mut index = RunIndex::default();
        for run_id in store.run_ids()? {
            if let Some(run) = store.load_run(&run_id)? {
                index.record(&run);
            }
        }
        tracing::debug!(
            runs = index.by_flow.values().map(HashSet::len).sum::<usize>(),
            live = index.live.len(),
            "run index loaded"
        );
        *store.index.write() = index;
        Ok(store)
    }

    /// Ids of every run directory.
    fn run_ids(&self) -> Result<Vec<String>, RunStoreError> {
        let entries = std::fs::read_dir(&self.runs_dir).map_err(|e| RunStoreError::Store {
            message: format!("failed to read runs directory: {e}"),
        })?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RunStoreError::Store {
                message: format!("failed to read dir entry: {e}"),
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            if check_id(&run_id).is_ok() {
                ids.push(run_id);
            }
        }
        Ok(ids)
    }

    fn load_runs(&self, run_ids: impl IntoIterator<Item = String>) -> Result<Vec<Run>, RunStoreError> {
        let mut runs = Vec::new();
        for run_id in run_ids {
            if let Some(run) = self.load_run(&run_id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, RunStoreError> {
        check_id(run_id)?;
        Ok(self.runs_dir.join(run_id))
    }

    fn ledger_path(&self, run_id: &str) -> Result<PathBuf, RunStoreError> {
        Ok(self.run_dir(run_id)?.join("ledger.jsonl"))
    }

    /// Read all events for a run, ordered by seq.
    fn read_events(&self, run_id: &str) -> Result<Vec<LedgerEvent>, RunStoreError> {
        let path = self.ledger_path(run_id)?;
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| RunStoreError::Store {
            message: format!("failed to read ledger file: {e}"),
        })?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: LedgerEvent =
                serde_json::from_str(line).map_err(|e| RunStoreError::Store {
                    message: format!("failed to deserialize ledger event: {e}"),
                })?;
            events.push(event);
        }
        events.sort_by_key(|e| e.seq());
        Ok(events)
    }

    fn load_run(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        let events = self.read_events(run_id)?;
        Ok(reconstruct::reconstruct_run(&events))
    }
}

/// Run ids become directory names.
fn check_id(run_id: &str) -> Result<(), RunStoreError> {
    let ok = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(RunStoreError::Store {
            message: format!("invalid run id: {run_id:?}"),
        })
    }
}

fn write_lines(path: &Path, events: &[LedgerEvent]) -> Result<(), RunStoreError> {
    let temp_path = path.with_extension("jsonl.tmp");
    let mut file = std::fs::File::create(&temp_path).map_err(|e| RunStoreError::Store {
        message: format!("failed to create temp file: {e}"),
    })?;
    for event in events {
        let line = serde_json::to_string(event).map_err(|e| RunStoreError::Store {
            message: format!("failed to serialize ledger event: {e}"),
        })?;
        writeln!(file, "{line}").map_err(|e| RunStoreError::Store {
            message: format!("failed to write ledger event: {e}"),
        })?;
    }
    file.sync_all().map_err(|e| RunStoreError::Store {
        message: format!("failed to fsync: {e}"),
    })?;
    drop(file);
    std::fs::rename(&temp_path, path).map_err(|e| RunStoreError::Store {
        message: format!("failed to rename temp file: {e}"),
    })
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn append(&self, events: &[LedgerEvent]) -> Result<(), RunStoreError> {
        let mut by_run: HashMap<&str, Vec<&LedgerEvent>> = HashMap::new();
        for event in events {
            by_run.entry(event.run_id()).or_default().push(event);
        }

        for (run_id, incoming) in by_run {
            let run_dir = self.run_dir(run_id)?;
            let _guard = self.append_locks.lock(run_id).await;
            std::fs::create_dir_all(&run_dir).map_err(|e| RunStoreError::Store {
                message: format!("failed to create run directory: {e}"),
            })?;

            let mut ledger = self.read_events(run_id)?;
            let fresh: Vec<LedgerEvent> = fresh_events(run_id, &ledger, incoming)?
                .into_iter()
                .cloned()
                .collect();
            if fresh.is_empty() {
                continue;
            }

            ledger.extend(fresh);
            write_lines(&self.ledger_path(run_id)?, &ledger)?;
            if let Some(run) = reconstruct::reconstruct_run(&ledger) {
                self.index.write().record(&run);
            }
        }

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        self.load_run(run_id)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RunStoreError> {
        let run_ids = match &filter.flow_id {
            Some(flow_id) => self.flow_run_ids(flow_id),
            None => self.run_ids()?,
        };
        let mut runs = self.load_runs(run_ids)?;
        runs.retain(|run| filter.matches(run));
        Ok(filter.page(runs))
    }

    async fn events(&self, run_id: &str) -> Result<Vec<LedgerEvent>, RunStoreError> {
        self.read_events(run_id)
    }

    async fn active_run_for(
        &self,
        flow_id: &str,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let index = self.index.read();
        let mut live: Vec<&Run> = index
            .live
            .values()
            .filter(|r| {
                r.flow_id == flow_id
                    && r.event.platform == platform
                    && r.event.platform_user_id == platform_user_id
            })
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(live.first().map(|r| (*r).clone()))
    }

    async fn due_runs(
        &self,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Run>, RunStoreError> {
        let mut due: Vec<Run> = self
            .index
            .read()
            .live
            .values()
            .filter(|r| is_due(r, now, stale_before))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn flow_stats(
        &self,
        flow_id: &str,
        count_test_runs: bool,
    ) -> Result<FlowStats, RunStoreError> {
        let runs = self.load_runs(self.flow_run_ids(flow_id))?;
        Ok(flow_stats_from_runs(flow_id, &runs, count_test_runs))
    }
}

impl FileRunStore {
    fn flow_run_ids(&self, flow_id: &str) -> Vec<String> {
        self.index
            .read()
            .by_flow
            .get(flow_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}
