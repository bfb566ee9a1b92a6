//! Plugin trait interfaces for the automation engine.
//!
//! Every pluggable component is an async trait object shared behind `Arc`.
//! Default implementations live in [`defaults`](crate::defaults). Adding a
//! method to any trait requires a default implementation to preserve
//! backward compatibility.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::defaults::reconstruct::flow_stats_from_runs;
use super::errors::*;
use super::ledger_event::LedgerEvent;
use super::types::*;

// ---------------------------------------------------------------------------
// Action adapters
// ---------------------------------------------------------------------------

/// Sends a direct message to a contact through a connected account.
#[async_trait]
pub trait MessageAdapter: Send + Sync {
    /// `account_id` is the connected account the triggering event arrived on,
    /// when the platform reported one. `content` is already rendered.
    async fn send_message(
        &self,
        account_id: Option<&str>,
        recipient: &Recipient,
        content: &str,
        media: &[String],
    ) -> Result<(), AdapterError>;
}

/// Delivers a JSON payload to an external URL.
#[async_trait]
pub trait WebhookAdapter: Send + Sync {
    async fn call_webhook(&self, url: &str, payload: &Value) -> Result<(), AdapterError>;
}

/// A deliverable attached to a resource node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub locator: String,
}

/// Delivers a link, file, course or product to a contact.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    async fn deliver_resource(
        &self,
        recipient: &Recipient,
        resource: &ResourceRef,
    ) -> Result<(), AdapterError>;
}

/// Attaches a tag to a contact in the storefront's CRM.
#[async_trait]
pub trait TagAdapter: Send + Sync {
    async fn tag_contact(&self, recipient: &Recipient, tag: &str) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------------------
// AccountRegistry
// ---------------------------------------------------------------------------

/// Which connected accounts the engine may act for.
///
/// Owned by the OAuth/connection layer. The engine only reads it: events
/// received on an account that is not authorized are dropped before any
/// flow is matched.
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn is_authorized(&self, platform: Platform, account_id: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source. Delay, timeout and time-window decisions all read
/// the time from here so tests can move it by simulated minutes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

/// Where flow definitions live.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert or replace a flow by id.
    async fn put_flow(&self, flow: &AutomationFlow) -> Result<(), FlowStoreError>;

    async fn get_flow(&self, flow_id: &str) -> Result<Option<AutomationFlow>, FlowStoreError>;

    /// Flows sorted by `created_at`, then id. `store_id` narrows to one
    /// storefront.
    async fn list_flows(&self, store_id: Option<&str>)
        -> Result<Vec<AutomationFlow>, FlowStoreError>;

    /// Returns whether a flow was removed.
    async fn delete_flow(&self, flow_id: &str) -> Result<bool, FlowStoreError>;
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// The run ledger.
///
/// Runs are never written directly: stores persist [`LedgerEvent`]s and
/// serve [`Run`] as a projection of them. Counters and stats are further
/// projections (see [`flow_stats`](Self::flow_stats)).
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Append a batch of events. Must be all-or-nothing.
    ///
    /// An event identical to the one already stored at its `(run_id, seq)`
    /// is skipped. Any other event must continue its run's ledger at the
    /// next seq, otherwise the whole batch fails with
    /// [`RunStoreError::Conflict`].
    async fn append(&self, events: &[LedgerEvent]) -> Result<(), RunStoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, RunStoreError>;

    /// Runs sorted by `created_at`, then id.
    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RunStoreError>;

    /// The full event log for a run, ordered by seq.
    async fn events(&self, run_id: &str) -> Result<Vec<LedgerEvent>, RunStoreError>;

    /// The live run of `flow_id` for this contact, if any.
    async fn active_run_for(
        &self,
        flow_id: &str,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let page = self
            .list_runs(&RunFilter {
                flow_id: Some(flow_id.to_string()),
                platform: Some(platform),
                platform_user_id: Some(platform_user_id.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(page.runs.into_iter().find(|r| !r.is_terminal()))
    }

    /// Non-terminal runs that need an `advance`: waiting runs whose
    /// `resume_at` has passed, any run past its deadline, and running or
    /// pending runs not touched since `stale_before` (an advance that
    /// died mid-way).
    async fn due_runs(
        &self,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Run>, RunStoreError> {
        let page = self.list_runs(&RunFilter::default()).await?;
        Ok(page
            .runs
            .into_iter()
            .filter(|r| is_due(r, now, stale_before))
            .collect())
    }

    /// Aggregates for one flow, recomputed from its runs.
    async fn flow_stats(
        &self,
        flow_id: &str,
        count_test_runs: bool,
    ) -> Result<FlowStats, RunStoreError> {
        let page = self
            .list_runs(&RunFilter {
                flow_id: Some(flow_id.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(flow_stats_from_runs(flow_id, &page.runs, count_test_runs))
    }
}

pub(crate) fn is_due(run: &Run, now: DateTime<Utc>, stale_before: Option<DateTime<Utc>>) -> bool {
    if run.is_terminal() {
        return false;
    }
    if run.deadline.is_some_and(|d| d <= now) {
        return true;
    }
    match run.status {
        RunStatus::Waiting => run.resume_at.is_some_and(|at| at <= now),
        _ => stale_before.is_some_and(|cutoff| run.updated_at <= cutoff),
    }
}

/// Filter criteria for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub flow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub platform: Option<Platform>,
    pub platform_user_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.flow_id.as_ref().map_or(true, |id| &run.flow_id == id)
            && self.status.map_or(true, |s| run.status == s)
            && self.platform.map_or(true, |p| run.event.platform == p)
            && self
                .platform_user_id
                .as_ref()
                .map_or(true, |u| &run.event.platform_user_id == u)
    }

    /// Sort, count, then apply offset and limit.
    pub fn page(&self, mut runs: Vec<Run>) -> RunPage {
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = runs.len();
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        let runs = runs.into_iter().skip(offset).take(limit).collect();
        RunPage { runs, total }
    }
}

/// Paginated run listing result.
#[derive(Debug, Clone, Serialize)]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub total: usize,
}
