//! Engine builder: assembles stores, adapters and the executor into an
//! [`Engine`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::error::EngineError;
use super::Engine;
use crate::config::EngineConfig;
use crate::defaults::{
    FileFlowStore, FileRunStore, HttpWebhookAdapter, InMemoryFlowStore, InMemoryRunStore,
    LoggingAdapter, OpenAccountRegistry, SystemClock,
};
use crate::executor::{ActionAdapters, Executor};
use crate::traits::{
    AccountRegistry, Clock, FlowStore, MessageAdapter, ResourceAdapter, RunStore, TagAdapter,
    WebhookAdapter,
};
use crate::triggers::{ResumeScheduler, TriggerMatcher};
use crate::types::RunStatus;

/// Builder for assembling the [`Engine`].
///
/// All provider fields are optional. Sensible defaults are applied during
/// [`build()`](EngineBuilder::build): file-backed stores under `./data`,
/// logging adapters for message, resource and tag, an HTTP webhook adapter,
/// an open account registry and the system clock.
pub struct EngineBuilder {
    config: EngineConfig,
    data_dir: PathBuf,
    run_store: Option<Arc<dyn RunStore>>,
    flow_store: Option<Arc<dyn FlowStore>>,
    message: Option<Arc<dyn MessageAdapter>>,
    webhook: Option<Arc<dyn WebhookAdapter>>,
    resource: Option<Arc<dyn ResourceAdapter>>,
    tag: Option<Arc<dyn TagAdapter>>,
    accounts: Option<Arc<dyn AccountRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    crash_recovery: bool,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            data_dir: PathBuf::from("./data"),
            run_store: None,
            flow_store: None,
            message: None,
            webhook: None,
            resource: None,
            tag: None,
            accounts: None,
            clock: None,
            crash_recovery: true,
        }
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Root directory for the default file-backed stores. Default: `./data`.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the run store. Default: [`FileRunStore`].
    pub fn run_store(mut self, store: impl RunStore + 'static) -> Self {
        self.run_store = Some(Arc::new(store));
        self
    }

    /// Set the flow store. Default: [`FileFlowStore`].
    pub fn flow_store(mut self, store: impl FlowStore + 'static) -> Self {
        self.flow_store = Some(Arc::new(store));
        self
    }

    /// Use in-memory flow and run stores. Delays do not survive a restart.
    pub fn in_memory(self) -> Self {
        self.flow_store(InMemoryFlowStore::new())
            .run_store(InMemoryRunStore::new())
    }

    /// Set all four action adapters at once.
    pub fn adapters(mut self, adapters: ActionAdapters) -> Self {
        self.message = Some(adapters.message);
        self.webhook = Some(adapters.webhook);
        self.resource = Some(adapters.resource);
        self.tag = Some(adapters.tag);
        self
    }

    /// Set the message adapter. Default: [`LoggingAdapter`].
    pub fn message_adapter(mut self, adapter: impl MessageAdapter + 'static) -> Self {
        self.message = Some(Arc::new(adapter));
        self
    }

    /// Set the webhook adapter. Default: [`HttpWebhookAdapter`].
    pub fn webhook_adapter(mut self, adapter: impl WebhookAdapter + 'static) -> Self {
        self.webhook = Some(Arc::new(adapter));
        self
    }

    /// Set the resource adapter. Default: [`LoggingAdapter`].
    pub fn resource_adapter(mut self, adapter: impl ResourceAdapter + 'static) -> Self {
        self.resource = Some(Arc::new(adapter));
        self
    }

    /// Set the tag adapter. Default: [`LoggingAdapter`].
    pub fn tag_adapter(mut self, adapter: impl TagAdapter + 'static) -> Self {
        self.tag = Some(Arc::new(adapter));
        self
    }

    /// Set the account registry. Default: [`OpenAccountRegistry`].
    pub fn account_registry(mut self, registry: impl AccountRegistry + 'static) -> Self {
        self.accounts = Some(Arc::new(registry));
        self
    }

    /// Set the clock. Shared so tests can keep a handle to a
    /// [`ManualClock`](crate::defaults::ManualClock). Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Advance runs left running or due by a previous process during
    /// `build()`. Default: true.
    pub fn crash_recovery(mut self, enabled: bool) -> Self {
        self.crash_recovery = enabled;
        self
    }

    /// Assemble the engine. Applies defaults for any unset providers, then
    /// resumes interrupted runs if crash recovery is enabled.
    pub async fn build(self) -> Result<Engine, EngineError> {
        // 1. Apply defaults for unset providers.
        let flow_store: Arc<dyn FlowStore> = match self.flow_store {
            Some(s) => s,
            None => {
                let store = FileFlowStore::new(self.data_dir.clone()).map_err(|e| {
                    EngineError::Build {
                        message: format!("failed to create default flow store: {e}"),
                    }
                })?;
                Arc::new(store)
            }
        };

        let run_store: Arc<dyn RunStore> = match self.run_store {
            Some(s) => s,
            None => {
                let store =
                    FileRunStore::new(self.data_dir.clone()).map_err(|e| EngineError::Build {
                        message: format!("failed to create default run store: {e}"),
                    })?;
                Arc::new(store)
            }
        };

        let adapters = ActionAdapters {
            message: self.message.unwrap_or_else(|| Arc::new(LoggingAdapter)),
            webhook: self
                .webhook
                .unwrap_or_else(|| Arc::new(HttpWebhookAdapter::new())),
            resource: self.resource.unwrap_or_else(|| Arc::new(LoggingAdapter)),
            tag: self.tag.unwrap_or_else(|| Arc::new(LoggingAdapter)),
        };

        let accounts: Arc<dyn AccountRegistry> = self
            .accounts
            .unwrap_or_else(|| Arc::new(OpenAccountRegistry));

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        // 2. Create the executor.
        let executor = Arc::new(Executor::new(
            self.config,
            Arc::clone(&run_store),
            Arc::clone(&flow_store),
            adapters,
            clock,
        ));

        // 3. Crash recovery: every run a previous process left mid-step or
        //    that became due while nothing was polling.
        if self.crash_recovery {
            let now = executor.clock().now();
            match run_store.due_runs(now, Some(now)).await {
                Ok(due) if !due.is_empty() => {
                    let interrupted = due
                        .iter()
                        .filter(|r| matches!(r.status, RunStatus::Running | RunStatus::Pending))
                        .count();
                    tracing::warn!(
                        count = due.len(),
                        interrupted,
                        "Resuming runs from previous session"
                    );
                    for run in &due {
                        if let Err(e) = executor.advance(&run.id).await {
                            tracing::error!(
                                run_id = %run.id,
                                error = %e,
                                "Failed to resume run"
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Crash recovery scan failed"),
                _ => {}
            }
        }

        let scheduler = ResumeScheduler::new(Arc::clone(&executor), Arc::clone(&run_store));

        Ok(Engine {
            executor,
            flow_store,
            run_store,
            accounts,
            matcher: TriggerMatcher::new(),
            scheduler: Arc::new(scheduler),
            scheduler_task: Mutex::new(None),
        })
    }
}
