//! Engine-wide configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "adapter_timeout_ms": 10000,
//!   "scheduler_interval_ms": 15000,
//!   "unmatched_branch": "complete",
//!   "count_test_runs": true
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when a condition evaluates to an outcome that has no
/// outbound edge. `stop_on_error` flows always fail regardless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedBranchPolicy {
    /// The branch ends. The run completes once nothing else is queued.
    #[default]
    Complete,
    /// The run fails with an unmatched-branch reason.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Upper bound on a single adapter call. Default: 10s.
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    /// How often the resume scheduler polls for due runs. Default: 15s.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    /// Maximum runs advanced per scheduler tick. Default: 100.
    #[serde(default = "default_scheduler_batch_size")]
    pub scheduler_batch_size: usize,
    /// A running run untouched for this long is picked up again by the
    /// scheduler. Default: 5 minutes.
    #[serde(default = "default_stale_run_after_ms")]
    pub stale_run_after_ms: u64,
    /// Node steps one `advance` call may take before yielding. Default: 1000.
    #[serde(default = "default_max_steps_per_advance")]
    pub max_steps_per_advance: usize,
    #[serde(default)]
    pub unmatched_branch: UnmatchedBranchPolicy,
    /// Whether test-trigger runs count toward `total_triggers` and
    /// `total_completions`. Default: true.
    #[serde(default = "default_true")]
    pub count_test_runs: bool,
}

fn default_adapter_timeout_ms() -> u64 {
    10_000
}

fn default_scheduler_interval_ms() -> u64 {
    15_000
}

fn default_scheduler_batch_size() -> usize {
    100
}

fn default_stale_run_after_ms() -> u64 {
    300_000
}

fn default_max_steps_per_advance() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: default_adapter_timeout_ms(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            scheduler_batch_size: default_scheduler_batch_size(),
            stale_run_after_ms: default_stale_run_after_ms(),
            max_steps_per_advance: default_max_steps_per_advance(),
            unmatched_branch: UnmatchedBranchPolicy::default(),
            count_test_runs: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn stale_run_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.stale_run_after_ms).unwrap_or(i64::MAX))
    }
}
