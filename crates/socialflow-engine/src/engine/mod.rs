//! Engine runtime: the single entry point for hosts.
//!
//! The [`Engine`] owns the flow and run stores, the trigger matcher, the
//! executor and the resume scheduler, and exposes the management surface
//! the storefront calls. Construct via [`Engine::builder()`].
//!
//! ```rust,ignore
//! let engine = Engine::builder()
//!     .data_dir("/var/lib/socialflow")
//!     .message_adapter(InstagramMessenger::new(token))
//!     .build()
//!     .await?;
//!
//! engine.start_scheduler().await;
//! let outcomes = engine.handle_event(event).await?;
//! ```

mod builder;
pub mod error;

pub use builder::EngineBuilder;
pub use error::EngineError;

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::errors::ValidationError;
use crate::executor::{Executor, StartOutcome};
use crate::ledger_event::LedgerEvent;
use crate::traits::{AccountRegistry, FlowStore, RunFilter, RunPage, RunStore};
use crate::triggers::{ResumeScheduler, TriggerMatcher};
use crate::types::{AutomationFlow, FlowStats, Run, RunOrigin, SocialEvent};
use crate::validate::{validate_definition, validate_flow};

/// The assembled automation engine.
pub struct Engine {
    pub(super) executor: Arc<Executor>,
    pub(super) flow_store: Arc<dyn FlowStore>,
    pub(super) run_store: Arc<dyn RunStore>,
    pub(super) accounts: Arc<dyn AccountRegistry>,
    pub(super) matcher: TriggerMatcher,
    pub(super) scheduler: Arc<ResumeScheduler>,
    /// Shutdown sender and task of the background scheduler, once started.
    pub(super) scheduler_task: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl Engine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Store a new flow. An active flow must validate. Counters start at
    /// zero whatever the caller passed.
    pub async fn create_flow(
        &self,
        mut flow: AutomationFlow,
    ) -> Result<AutomationFlow, EngineError> {
        let _guard = self.executor.flow_locks().lock(&flow.id).await;
        if self.flow_store.get_flow(&flow.id).await?.is_some() {
            return Err(EngineError::FlowExists { flow_id: flow.id });
        }
        if flow.is_active {
            validate_flow(&flow)?;
        }
        let now = self.executor.clock().now();
        flow.total_triggers = 0;
        flow.total_completions = 0;
        flow.last_triggered = None;
        flow.created_at = now;
        flow.updated_at = now;
        self.flow_store.put_flow(&flow).await?;
        tracing::info!(flow_id = %flow.id, store_id = %flow.store_id, active = flow.is_active, "flow created");
        Ok(flow)
    }

    /// Replace a flow's definition, trigger and settings. Counters and
    /// `created_at` are kept. Runs already in flight keep the snapshot they
    /// started with.
    pub async fn update_flow(
        &self,
        mut flow: AutomationFlow,
    ) -> Result<AutomationFlow, EngineError> {
        let _guard = self.executor.flow_locks().lock(&flow.id).await;
        let existing = self.require_flow(&flow.id).await?;
        if flow.is_active {
            validate_flow(&flow)?;
        }
        flow.total_triggers = existing.total_triggers;
        flow.total_completions = existing.total_completions;
        flow.last_triggered = existing.last_triggered;
        flow.created_at = existing.created_at;
        flow.updated_at = self.executor.clock().now();
        self.flow_store.put_flow(&flow).await?;
        self.matcher.forget_flow(&flow.id);
        tracing::info!(flow_id = %flow.id, "flow updated");
        Ok(flow)
    }

    /// Activate or deactivate a flow. Activation is where validation is
    /// enforced. Deactivation stops new runs only; live runs continue.
    pub async fn set_active(
        &self,
        flow_id: &str,
        active: bool,
    ) -> Result<AutomationFlow, EngineError> {
        let _guard = self.executor.flow_locks().lock(flow_id).await;
        let mut flow = self.require_flow(flow_id).await?;
        if active {
            validate_flow(&flow)?;
        }
        if flow.is_active != active {
            flow.is_active = active;
            flow.updated_at = self.executor.clock().now();
            self.flow_store.put_flow(&flow).await?;
            if !active {
                self.matcher.forget_flow(flow_id);
            }
            tracing::info!(flow_id = %flow_id, active, "flow activation changed");
        }
        Ok(flow)
    }

    /// Delete a flow. Its runs stay in the ledger and live runs finish on
    /// their snapshot.
    pub async fn delete_flow(&self, flow_id: &str) -> Result<(), EngineError> {
        let _guard = self.executor.flow_locks().lock(flow_id).await;
        if !self.flow_store.delete_flow(flow_id).await? {
            return Err(EngineError::FlowNotFound {
                flow_id: flow_id.to_string(),
            });
        }
        self.matcher.forget_flow(flow_id);
        tracing::info!(flow_id = %flow_id, "flow deleted");
        Ok(())
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<AutomationFlow, EngineError> {
        self.require_flow(flow_id).await
    }

    pub async fn list_flows(
        &self,
        store_id: Option<&str>,
    ) -> Result<Vec<AutomationFlow>, EngineError> {
        Ok(self.flow_store.list_flows(store_id).await?)
    }

    // -----------------------------------------------------------------------
    // Events and runs
    // -----------------------------------------------------------------------

    /// Match an inbound event against every active flow and start a run for
    /// each match. Events on an unauthorized account are dropped. A flow
    /// whose run cannot be started is logged and skipped; the others still
    /// run.
    pub async fn handle_event(&self, event: SocialEvent) -> Result<Vec<StartOutcome>, EngineError> {
        if let Some(account_id) = &event.account_id {
            if !self.accounts.is_authorized(event.platform, account_id).await {
                tracing::warn!(
                    platform = %event.platform,
                    account_id = %account_id,
                    event_id = %event.event_id,
                    "dropping event for unauthorized account"
                );
                return Ok(Vec::new());
            }
        }

        let flows: Vec<AutomationFlow> = self
            .flow_store
            .list_flows(None)
            .await?
            .into_iter()
            .filter(|f| f.is_active)
            .collect();
        let matched = self.matcher.match_event(&event, &flows);

        let mut outcomes = Vec::with_capacity(matched.len());
        for m in matched {
            match self
                .executor
                .start(&m.flow, event.clone(), RunOrigin::Event)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(
                        flow_id = %m.flow.id,
                        event_id = %event.event_id,
                        error = %e,
                        "failed to start run"
                    );
                }
            }
        }
        Ok(outcomes)
    }

    /// Start a dry run of a flow for its owner, bypassing the matcher. Works
    /// for inactive and manual flows. The synthetic contact is
    /// `test:{principal}` on the flow's first platform; `content` defaults to
    /// the first keyword.
    pub async fn test_trigger(
        &self,
        flow_id: &str,
        principal: &str,
        content: Option<&str>,
    ) -> Result<StartOutcome, EngineError> {
        let flow = self.require_flow(flow_id).await?;
        // Inactive flows are stored unvalidated.
        validate_definition(&flow.flow_definition)?;
        let conditions = &flow.trigger_conditions;
        let Some(platform) = conditions.platforms.iter().next().copied() else {
            return Err(ValidationError::new(vec![
                "Trigger conditions list no platforms".to_string(),
            ])
            .into());
        };
        let content = content
            .map(str::to_string)
            .or_else(|| conditions.keywords.first().cloned())
            .unwrap_or_default();

        let mut event = SocialEvent::new(platform, format!("test:{principal}"), content)
            .with_username(principal)
            .received_at(self.executor.clock().now());
        if let Some(account_id) = conditions.account_ids.as_ref().and_then(|a| a.iter().next()) {
            event = event.with_account(account_id.clone());
        }

        tracing::info!(flow_id = %flow_id, principal, "test trigger");
        let origin = RunOrigin::Test {
            principal: principal.to_string(),
        };
        Ok(self.executor.start(&flow, event, origin).await?)
    }

    /// Advance a run as far as it can go now. A no-op on terminal runs and
    /// on waiting runs that are not yet due.
    pub async fn advance_run(&self, run_id: &str) -> Result<Run, EngineError> {
        Ok(self.executor.advance(run_id).await?)
    }

    /// Stop a live run. Stopping a terminal run returns it unchanged.
    pub async fn stop_run(&self, run_id: &str, reason: &str) -> Result<Run, EngineError> {
        Ok(self.executor.stop(run_id, reason).await?)
    }

    /// Record a reply from the run's contact, then advance the run so a
    /// pending `user_response` condition sees it.
    pub async fn record_response(&self, run_id: &str, content: &str) -> Result<Run, EngineError> {
        self.executor.record_response(run_id, content).await?;
        Ok(self.executor.advance(run_id).await?)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, EngineError> {
        self.run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, EngineError> {
        Ok(self.run_store.list_runs(filter).await?)
    }

    /// The run's ledger, ordered by seq.
    pub async fn run_events(&self, run_id: &str) -> Result<Vec<LedgerEvent>, EngineError> {
        Ok(self.run_store.events(run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    /// Aggregates for a flow, computed from the ledger. Available for deleted
    /// flows too.
    pub async fn flow_stats(&self, flow_id: &str) -> Result<FlowStats, EngineError> {
        let count_test_runs = self.executor.config().count_test_runs;
        Ok(self.run_store.flow_stats(flow_id, count_test_runs).await?)
    }

    /// Rebuild a flow's cached counters from the ledger.
    pub async fn recompute_counters(&self, flow_id: &str) -> Result<AutomationFlow, EngineError> {
        self.executor
            .sync_counters(flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Advance one batch of due runs now. For hosts that drive resumption
    /// from their own job scheduler instead of [`start_scheduler`](Self::start_scheduler).
    pub async fn resume_due(&self) -> usize {
        self.scheduler.tick().await
    }

    /// Start the background resume scheduler. Calling it again while it runs
    /// does nothing.
    pub async fn start_scheduler(&self) {
        let mut task = self.scheduler_task.lock().await;
        if task.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Arc::clone(&self.scheduler).spawn(shutdown_rx);
        *task = Some((shutdown_tx, handle));
        tracing::info!("resume scheduler started");
    }

    /// Stop the background scheduler and wait for its current tick.
    pub async fn shutdown(&self) {
        let Some((shutdown_tx, handle)) = self.scheduler_task.lock().await.take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "resume scheduler task failed");
        }
    }

    async fn require_flow(&self, flow_id: &str) -> Result<AutomationFlow, EngineError> {
        self.flow_store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }
}
