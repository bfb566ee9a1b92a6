//! Flow executor: the run state machine.
//!
//! A run advances one node step at a time. Each step takes the run's lock,
//! re-reads the run from the ledger, performs at most one node's effect,
//! and commits the resulting [`LedgerEvent`]s before releasing the lock.
//! Calling [`Executor::advance`] twice for the same run, concurrently or
//! not, never repeats a node effect.
//!
//! Before an adapter call the executor appends a `StepClaimed` event. The
//! ledger refuses a second event at the same seq, so when several executors
//! share one [`RunStore`] only the one whose claim landed performs the
//! effect; the others see the claim, or a [`RunStoreError::Conflict`], and
//! yield. A claim older than `stale_run_after` is taken over, which makes a
//! crash mid-call at-least-once for that node.
//!
//! Delays suspend the run (`waiting` with a persisted `resume_at`); the
//! [`ResumeScheduler`](crate::triggers::ResumeScheduler) or any caller
//! advances it again once due.

pub mod condition;
pub mod template;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::config::{EngineConfig, UnmatchedBranchPolicy};
use crate::errors::{AdapterError, FlowStoreError, RunStoreError, ValidationError};
use crate::graph::FlowGraph;
use crate::ledger_event::LedgerEvent;
use crate::locks::KeyedLocks;
use crate::traits::{
    Clock, FlowStore, MessageAdapter, ResourceAdapter, ResourceRef, RunStore, TagAdapter,
    WebhookAdapter,
};
use crate::types::*;

use template::{render, render_value, TemplateVars};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Errors from the executor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
    /// The run already reached a terminal state.
    #[error("run {run_id} is already {status:?}")]
    Terminal { run_id: String, status: RunStatus },
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("flow store error: {0}")]
    FlowStore(#[from] FlowStoreError),
}

/// The four action adapters a run's nodes call.
#[derive(Clone)]
pub struct ActionAdapters {
    pub message: Arc<dyn MessageAdapter>,
    pub webhook: Arc<dyn WebhookAdapter>,
    pub resource: Arc<dyn ResourceAdapter>,
    pub tag: Arc<dyn TagAdapter>,
}

/// What [`Executor::start`] did with an event.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A run was created and advanced as far as it could go.
    Started(Run),
    /// The contact already had a live run of this flow. The event was
    /// recorded on that run and nothing else happened.
    Suppressed { existing_run_id: String },
}

impl StartOutcome {
    pub fn run(&self) -> Option<&Run> {
        match self {
            Self::Started(run) => Some(run),
            Self::Suppressed { .. } => None,
        }
    }
}

/// Result of one node step.
enum Step {
    /// Progress was made; take another step.
    Continue,
    /// Nothing to do right now (waiting, or already terminal).
    Yield(Run),
    /// The run reached a terminal state in this step.
    Finished(Run),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    /// Written into step claims to tell this executor's claims from others'.
    instance_id: String,
    config: EngineConfig,
    run_store: Arc<dyn RunStore>,
    flow_store: Arc<dyn FlowStore>,
    adapters: ActionAdapters,
    clock: Arc<dyn Clock>,
    run_locks: KeyedLocks,
    contact_locks: KeyedLocks,
    flow_locks: KeyedLocks,
}

impl Executor {
    pub fn new(
        config: EngineConfig,
        run_store: Arc<dyn RunStore>,
        flow_store: Arc<dyn FlowStore>,
        adapters: ActionAdapters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            config,
            run_store,
            flow_store,
            adapters,
            clock,
            run_locks: KeyedLocks::new(),
            contact_locks: KeyedLocks::new(),
            flow_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Serializes writes to a stored flow. Held while cached counters are
    /// rewritten, and by the engine while it updates the flow.
    pub(crate) fn flow_locks(&self) -> &KeyedLocks {
        &self.flow_locks
    }

    /// Create a run of `flow` for `event` and advance it.
    ///
    /// The definition is taken as valid: the engine validates flows when
    /// they are activated and before a test trigger.
    ///
    /// Unless the flow allows multiple runs (or this is a test run), an
    /// event from a contact that already has a live run of the same flow is
    /// recorded on that run as a suppressed duplicate instead.
    pub async fn start(
        &self,
        flow: &AutomationFlow,
        event: SocialEvent,
        origin: RunOrigin,
    ) -> Result<StartOutcome, ExecutorError> {
        let Some(trigger) = flow.flow_definition.trigger_node() else {
            return Err(ValidationError::new(vec!["Flow has no trigger node".into()]).into());
        };

        let dedup = !flow.settings.allow_multiple_runs && matches!(origin, RunOrigin::Event);
        let contact_key = format!(
            "{}:{}:{}",
            flow.id, event.platform, event.platform_user_id
        );
        let _contact_guard = if dedup {
            Some(self.contact_locks.lock(&contact_key).await)
        } else {
            None
        };

        if dedup {
            if let Some(existing_run_id) = self.suppress_duplicate(flow, &event).await? {
                return Ok(StartOutcome::Suppressed { existing_run_id });
            }
        }

        let now = self.clock.now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let snapshot = FlowSnapshot::capture(flow);
        let deadline = flow
            .settings
            .timeout_minutes
            .map(|m| now + Duration::minutes(i64::from(m)));
        let first = FlowGraph::new(&snapshot.definition).successors(&trigger.id);
        let trigger_entry = TrailEntry {
            node_id: trigger.id.clone(),
            kind: NodeKind::Trigger,
            outcome: StepOutcome::Executed,
            at: now,
        };

        let events = vec![
            LedgerEvent::run_created(&run_id, snapshot, event, origin, deadline, now),
            LedgerEvent::step_recorded(&run_id, trigger_entry),
            LedgerEvent::frontier_set(&run_id, first, now),
            LedgerEvent::run_activated(&run_id, None, now),
        ];
        {
            let _run_guard = self.run_locks.lock(&run_id).await;
            self.commit(&run_id, 0, events).await?;
        }
        drop(_contact_guard);

        tracing::info!(flow_id = %flow.id, run_id = %run_id, "run created");
        self.refresh_counters(&flow.id).await;

        let run = self.advance(&run_id).await?;
        Ok(StartOutcome::Started(run))
    }

    /// Record `event` on the contact's live run, if there is one.
    async fn suppress_duplicate(
        &self,
        flow: &AutomationFlow,
        event: &SocialEvent,
    ) -> Result<Option<String>, ExecutorError> {
        let Some(existing) = self
            .run_store
            .active_run_for(&flow.id, event.platform, &event.platform_user_id)
            .await?
        else {
            return Ok(None);
        };

        let _run_guard = self.run_locks.lock(&existing.id).await;
        let Some(current) = self.run_store.get_run(&existing.id).await? else {
            return Ok(None);
        };
        if current.is_terminal() {
            return Ok(None);
        }
        let now = self.clock.now();
        self.commit(
            &current.id,
            current.last_seq,
            vec![LedgerEvent::duplicate_suppressed(&current.id, event.clone(), now)],
        )
        .await?;
        tracing::info!(
            flow_id = %flow.id,
            run_id = %current.id,
            event_id = %event.event_id,
            "contact already has a live run, duplicate event suppressed"
        );
        Ok(Some(current.id))
    }

    /// Advance a run as far as it can go right now.
    ///
    /// Terminal runs and waiting runs whose `resume_at` has not passed are
    /// returned unchanged.
    pub async fn advance(&self, run_id: &str) -> Result<Run, ExecutorError> {
        let mut steps = 0;
        loop {
            let step = match self.step(run_id).await {
                Err(ExecutorError::RunStore(RunStoreError::Conflict { seq, .. })) => {
                    tracing::debug!(
                        run_id = %run_id,
                        seq,
                        "run advanced by another executor, yielding"
                    );
                    return self.load(run_id).await;
                }
                other => other?,
            };
            match step {
                Step::Continue => {
                    steps += 1;
                    if steps >= self.config.max_steps_per_advance {
                        tracing::warn!(run_id = %run_id, steps, "step budget exhausted, yielding");
                        return self.load(run_id).await;
                    }
                }
                Step::Yield(run) => return Ok(run),
                Step::Finished(run) => {
                    self.refresh_counters(&run.flow_id).await;
                    return Ok(run);
                }
            }
        }
    }

    /// Mark a live run `stopped`. Terminal runs are returned unchanged.
    pub async fn stop(&self, run_id: &str, reason: &str) -> Result<Run, ExecutorError> {
        let run = {
            let _guard = self.run_locks.lock(run_id).await;
            let run = self.load(run_id).await?;
            if run.is_terminal() {
                return Ok(run);
            }
            let now = self.clock.now();
            let termination = TerminationReason::Stopped {
                reason: reason.to_string(),
            };
            tracing::info!(flow_id = %run.flow_id, run_id = %run_id, reason, "run stopped");
            self.commit(
                run_id,
                run.last_seq,
                vec![LedgerEvent::run_finished(
                    run_id,
                    RunStatus::Stopped,
                    Some(termination),
                    now,
                )],
            )
            .await?
        };
        self.refresh_counters(&run.flow_id).await;
        Ok(run)
    }

    /// Append a reply from the contact to a live run's context. Later
    /// `user_response` conditions read the most recent one.
    pub async fn record_response(&self, run_id: &str, content: &str) -> Result<Run, ExecutorError> {
        let _guard = self.run_locks.lock(run_id).await;
        let run = self.load(run_id).await?;
        if run.is_terminal() {
            return Err(ExecutorError::Terminal {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let now = self.clock.now();
        self.commit(
            run_id,
            run.last_seq,
            vec![LedgerEvent::response_recorded(run_id, content.to_string(), now)],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn step(&self, run_id: &str) -> Result<Step, ExecutorError> {
        let _guard = self.run_locks.lock(run_id).await;
        let run = self.load(run_id).await?;
        if run.is_terminal() {
            return Ok(Step::Yield(run));
        }

        let now = self.clock.now();
        if let Some(claim) = &run.claim {
            let fresh = now - claim.at < self.config.stale_run_after();
            if claim.claimed_by != self.instance_id && fresh {
                tracing::debug!(
                    run_id = %run.id,
                    node_id = %claim.node_id,
                    claimed_by = %claim.claimed_by,
                    "step claimed by another executor, yielding"
                );
                return Ok(Step::Yield(run));
            }
        }

        if run.deadline.is_some_and(|d| now >= d) {
            let timeout_minutes = run.snapshot.settings.timeout_minutes.unwrap_or_default();
            tracing::warn!(flow_id = %run.flow_id, run_id = %run.id, timeout_minutes, "run timed out");
            let termination = TerminationReason::Timeout { timeout_minutes };
            return self.finish(&run, RunStatus::Failed, Some(termination), now).await;
        }

        match run.status {
            RunStatus::Waiting => {
                if run.resume_at.is_some_and(|at| now < at) {
                    return Ok(Step::Yield(run));
                }
                let delay_node = run.pending.first().cloned();
                let mut pending: Vec<String> = run.pending.iter().skip(1).cloned().collect();
                if let Some(node_id) = &delay_node {
                    let graph = FlowGraph::new(&run.snapshot.definition);
                    enqueue(&run, &graph, node_id, &mut pending, graph.successors(node_id));
                }
                tracing::debug!(run_id = %run.id, "resuming delayed run");
                let events = vec![
                    LedgerEvent::run_activated(&run.id, delay_node, now),
                    LedgerEvent::frontier_set(&run.id, pending, now),
                ];
                self.commit(&run.id, run.last_seq, events).await?;
                return Ok(Step::Continue);
            }
            RunStatus::Pending => {
                let events = vec![LedgerEvent::run_activated(&run.id, None, now)];
                self.commit(&run.id, run.last_seq, events).await?;
                return Ok(Step::Continue);
            }
            _ => {}
        }

        let Some(node_id) = run.pending.first().cloned() else {
            tracing::info!(flow_id = %run.flow_id, run_id = %run.id, "run completed");
            return self.finish(&run, RunStatus::Completed, None, now).await;
        };
        let Some(node) = run.snapshot.definition.node(&node_id).cloned() else {
            let termination = TerminationReason::InvalidGraph {
                message: format!("node {node_id} is not in the flow snapshot"),
            };
            return self.finish(&run, RunStatus::Failed, Some(termination), now).await;
        };
        self.execute_node(&run, &node, now).await
    }

    async fn execute_node(
        &self,
        run: &Run,
        node: &FlowNode,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let graph = FlowGraph::new(&run.snapshot.definition);
        let vars = TemplateVars::for_run(run);
        let recipient = run.event.recipient();

        match &node.data {
            NodeData::Trigger => {
                self.proceed(run, node, StepOutcome::Executed, graph.successors(&node.id), now)
                    .await
            }
            NodeData::Message { content, media } => {
                let claimed = self.claim(run, node, now).await?;
                let adapter = Arc::clone(&self.adapters.message);
                let account_id = run.event.account_id.clone();
                let content = render(content, &vars);
                let media = media.clone();
                let result = self
                    .call_adapter(async move {
                        adapter
                            .send_message(account_id.as_deref(), &recipient, &content, &media)
                            .await
                    })
                    .await;
                self.after_action(&claimed, node, result, &graph, now).await
            }
            NodeData::Resource {
                resource_type,
                locator,
            } => {
                let claimed = self.claim(run, node, now).await?;
                let adapter = Arc::clone(&self.adapters.resource);
                let resource = ResourceRef {
                    resource_type: *resource_type,
                    locator: render(locator, &vars),
                };
                let result = self
                    .call_adapter(async move { adapter.deliver_resource(&recipient, &resource).await })
                    .await;
                self.after_action(&claimed, node, result, &graph, now).await
            }
            NodeData::Tag { tag_name } => {
                let claimed = self.claim(run, node, now).await?;
                let adapter = Arc::clone(&self.adapters.tag);
                let tag = tag_name.clone();
                let result = self
                    .call_adapter(async move { adapter.tag_contact(&recipient, &tag).await })
                    .await;
                self.after_action(&claimed, node, result, &graph, now).await
            }
            NodeData::Webhook {
                url,
                payload_template,
            } => {
                let claimed = self.claim(run, node, now).await?;
                let adapter = Arc::clone(&self.adapters.webhook);
                let url = url.clone();
                let payload = render_value(payload_template, &vars);
                let result = self
                    .call_adapter(async move { adapter.call_webhook(&url, &payload).await })
                    .await;
                let outcome = match result {
                    Ok(()) => StepOutcome::Executed,
                    Err(e) => {
                        // Webhook failures never stop the run.
                        tracing::warn!(
                            flow_id = %run.flow_id,
                            run_id = %run.id,
                            node_id = %node.id,
                            error = %e,
                            "webhook call failed"
                        );
                        StepOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                self.proceed(&claimed, node, outcome, graph.successors(&node.id), now)
                    .await
            }
            NodeData::Delay { delay_minutes } => {
                if *delay_minutes == 0 {
                    return self
                        .proceed(run, node, StepOutcome::Executed, graph.successors(&node.id), now)
                        .await;
                }
                let until = now + Duration::minutes(i64::from(*delay_minutes));
                let entry = TrailEntry {
                    node_id: node.id.clone(),
                    kind: NodeKind::Delay,
                    outcome: StepOutcome::Delayed { until },
                    at: now,
                };
                let events = vec![
                    LedgerEvent::step_recorded(&run.id, entry),
                    LedgerEvent::run_waiting(&run.id, &node.id, until, now),
                ];
                let run = self.commit(&run.id, run.last_seq, events).await?;
                tracing::debug!(run_id = %run.id, resume_at = %until, "run waiting on delay");
                Ok(Step::Yield(run))
            }
            NodeData::Condition {
                condition_type,
                condition_value,
            } => {
                let outcome = condition::evaluate(*condition_type, condition_value, run, now);
                let mut label = outcome.label().to_string();
                let mut targets = Vec::new();
                if let Some(value) = &outcome.value {
                    targets = graph.next_nodes(&node.id, Some(value));
                    if !targets.is_empty() {
                        label = value.clone();
                    }
                }
                if targets.is_empty() {
                    targets = graph.next_nodes(&node.id, Some(outcome.label()));
                }
                let step_outcome = StepOutcome::Branched {
                    outcome: label.clone(),
                    matched: outcome.matched,
                };

                if targets.is_empty() {
                    let fail = run.snapshot.settings.stop_on_error
                        || self.config.unmatched_branch == UnmatchedBranchPolicy::Fail;
                    if fail {
                        tracing::warn!(
                            flow_id = %run.flow_id,
                            run_id = %run.id,
                            node_id = %node.id,
                            outcome = %label,
                            "no branch for condition outcome, failing run"
                        );
                        let entry = TrailEntry {
                            node_id: node.id.clone(),
                            kind: NodeKind::Condition,
                            outcome: step_outcome,
                            at: now,
                        };
                        let termination = TerminationReason::UnmatchedBranch {
                            node_id: node.id.clone(),
                            outcome: label,
                        };
                        let events = vec![
                            LedgerEvent::step_recorded(&run.id, entry),
                            LedgerEvent::run_finished(
                                &run.id,
                                RunStatus::Failed,
                                Some(termination),
                                now,
                            ),
                        ];
                        let run = self.commit(&run.id, run.last_seq, events).await?;
                        return Ok(Step::Finished(run));
                    }
                    tracing::info!(
                        run_id = %run.id,
                        node_id = %node.id,
                        outcome = %label,
                        "no branch for condition outcome, branch ends"
                    );
                }
                self.proceed(run, node, step_outcome, targets, now).await
            }
        }
    }

    /// Record an adapter-backed node and apply the failure policy.
    async fn after_action(
        &self,
        run: &Run,
        node: &FlowNode,
        result: Result<(), AdapterError>,
        graph: &FlowGraph<'_>,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let error = match result {
            Ok(()) => {
                return self
                    .proceed(run, node, StepOutcome::Executed, graph.successors(&node.id), now)
                    .await
            }
            Err(e) => e,
        };

        tracing::warn!(
            flow_id = %run.flow_id,
            run_id = %run.id,
            node_id = %node.id,
            kind = %node.kind(),
            error = %error,
            "adapter call failed"
        );
        let outcome = StepOutcome::Failed {
            error: error.to_string(),
        };
        if !run.snapshot.settings.stop_on_error {
            return self
                .proceed(run, node, outcome, graph.successors(&node.id), now)
                .await;
        }

        let entry = TrailEntry {
            node_id: node.id.clone(),
            kind: node.kind(),
            outcome,
            at: now,
        };
        let termination = TerminationReason::Adapter {
            node_id: node.id.clone(),
            message: error.to_string(),
        };
        let events = vec![
            LedgerEvent::step_recorded(&run.id, entry),
            LedgerEvent::run_finished(&run.id, RunStatus::Failed, Some(termination), now),
        ];
        let run = self.commit(&run.id, run.last_seq, events).await?;
        Ok(Step::Finished(run))
    }

    /// Record `node` in the trail and replace it in the frontier with
    /// `targets` that have not run and are not already queued.
    async fn proceed(
        &self,
        run: &Run,
        node: &FlowNode,
        outcome: StepOutcome,
        targets: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let graph = FlowGraph::new(&run.snapshot.definition);
        let mut pending: Vec<String> = run.pending.iter().skip(1).cloned().collect();
        enqueue(run, &graph, &node.id, &mut pending, targets);
        let entry = TrailEntry {
            node_id: node.id.clone(),
            kind: node.kind(),
            outcome,
            at: now,
        };
        let events = vec![
            LedgerEvent::step_recorded(&run.id, entry),
            LedgerEvent::frontier_set(&run.id, pending, now),
        ];
        self.commit(&run.id, run.last_seq, events).await?;
        Ok(Step::Continue)
    }

    async fn finish(
        &self,
        run: &Run,
        status: RunStatus,
        termination: Option<TerminationReason>,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let events = vec![LedgerEvent::run_finished(&run.id, status, termination, now)];
        let run = self.commit(&run.id, run.last_seq, events).await?;
        Ok(Step::Finished(run))
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Record that this executor is about to perform `node`'s effect.
    async fn claim(
        &self,
        run: &Run,
        node: &FlowNode,
        now: DateTime<Utc>,
    ) -> Result<Run, ExecutorError> {
        let event = LedgerEvent::step_claimed(&run.id, &node.id, &self.instance_id, now);
        self.commit(&run.id, run.last_seq, vec![event]).await
    }

    /// Run an adapter call in its own task, bounded by the adapter timeout.
    /// A panic inside the adapter becomes [`AdapterError::Panicked`].
    async fn call_adapter<F>(&self, call: F) -> Result<(), AdapterError>
    where
        F: Future<Output = Result<(), AdapterError>> + Send + 'static,
    {
        let timeout = self.config.adapter_timeout();
        let mut handle = tokio::spawn(call);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AdapterError::Panicked {
                message: panic_message(join_error),
            }),
            Err(_elapsed) => {
                handle.abort();
                Err(AdapterError::Timeout {
                    timeout_ms: self.config.adapter_timeout_ms,
                })
            }
        }
    }

    /// Assign sequence numbers after `last_seq`, append, and re-read.
    async fn commit(
        &self,
        run_id: &str,
        last_seq: u64,
        mut events: Vec<LedgerEvent>,
    ) -> Result<Run, ExecutorError> {
        for (i, event) in events.iter_mut().enumerate() {
            event.set_seq(last_seq + 1 + i as u64);
        }
        self.run_store.append(&events).await?;
        self.load(run_id).await
    }

    async fn load(&self, run_id: &str) -> Result<Run, ExecutorError> {
        self.run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Rewrite the flow's cached counters from the ledger. The counters are
    /// a cache, so failures are logged and otherwise ignored.
    pub(crate) async fn refresh_counters(&self, flow_id: &str) {
        if let Err(e) = self.sync_counters(flow_id).await {
            tracing::warn!(flow_id = %flow_id, error = %e, "failed to refresh flow counters");
        }
    }

    /// Recompute the flow's counters from its runs and store them when they
    /// changed. Returns `None` for a deleted flow: its runs remain but there
    /// is nothing to update.
    pub(crate) async fn sync_counters(
        &self,
        flow_id: &str,
    ) -> Result<Option<AutomationFlow>, ExecutorError> {
        let _guard = self.flow_locks.lock(flow_id).await;
        let stats = self
            .run_store
            .flow_stats(flow_id, self.config.count_test_runs)
            .await?;
        let Some(mut flow) = self.flow_store.get_flow(flow_id).await? else {
            return Ok(None);
        };
        if flow.total_triggers == stats.total_triggers
            && flow.total_completions == stats.total_completions
            && flow.last_triggered == stats.last_triggered
        {
            return Ok(Some(flow));
        }
        flow.total_triggers = stats.total_triggers;
        flow.total_completions = stats.total_completions;
        flow.last_triggered = stats.last_triggered;
        self.flow_store.put_flow(&flow).await?;
        tracing::debug!(
            flow_id = %flow_id,
            total_triggers = flow.total_triggers,
            total_completions = flow.total_completions,
            "flow counters refreshed"
        );
        Ok(Some(flow))
    }
}

/// Append `targets` to `pending`, skipping nodes that already ran, the node
/// being completed, and nodes already queued.
///
/// Queued nodes are then reordered so that a node runs only after each of
/// its predecessors has run or can no longer be reached from the frontier.
/// A fan-in node therefore waits for every branch still heading its way,
/// and a branch a condition did not take does not hold it back.
fn enqueue(
    run: &Run,
    graph: &FlowGraph<'_>,
    current: &str,
    pending: &mut Vec<String>,
    targets: Vec<String>,
) {
    let mut ran: HashSet<&str> = run.trail.iter().map(|e| e.node_id.as_str()).collect();
    ran.insert(current);
    for target in targets {
        if ran.contains(target.as_str()) || pending.contains(&target) {
            continue;
        }
        pending.push(target);
    }

    let live: HashSet<&str> = pending
        .iter()
        .flat_map(|id| graph.reachable_from(id))
        .collect();
    let settled = |id: &String| {
        graph.incoming(id).iter().all(|conn| {
            let from = conn.from.as_str();
            from == id.as_str() || ran.contains(from) || !live.contains(from)
        })
    };
    let (ready, blocked): (Vec<String>, Vec<String>) = pending.drain(..).partition(settled);
    pending.extend(ready);
    pending.extend(blocked);
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "adapter task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryFlowStore, InMemoryRunStore, ManualClock};
    use crate::test_support::{guide_flow, AdapterCall, Fault, RecordingAdapter};
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        executor: Executor,
        runs: Arc<InMemoryRunStore>,
        flows: Arc<InMemoryFlowStore>,
        adapter: Arc<RecordingAdapter>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        fn with_config(config: EngineConfig) -> Self {
            let runs = Arc::new(InMemoryRunStore::new());
            let flows = Arc::new(InMemoryFlowStore::new());
            let adapter = RecordingAdapter::new();
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
            ));
            let executor = Executor::new(
                config,
                runs.clone(),
                flows.clone(),
                adapter.adapters(),
                clock.clone(),
            );
            Self {
                executor,
                runs,
                flows,
                adapter,
                clock,
            }
        }

        async fn install(&self, flow: &AutomationFlow) {
            self.flows.put_flow(flow).await.unwrap();
        }

        async fn fire(&self, flow: &AutomationFlow, user: &str, content: &str) -> StartOutcome {
            let event = SocialEvent::new(Platform::Instagram, user, content).with_username("ada");
            self.executor
                .start(flow, event, RunOrigin::Event)
                .await
                .unwrap()
        }

        async fn started(&self, flow: &AutomationFlow, user: &str, content: &str) -> Run {
            match self.fire(flow, user, content).await {
                StartOutcome::Started(run) => run,
                other => panic!("expected a new run, got {other:?}"),
            }
        }

        async fn stored(&self, flow_id: &str) -> AutomationFlow {
            self.flows.get_flow(flow_id).await.unwrap().unwrap()
        }

        fn after_minutes(&self, minutes: i64) {
            self.clock.advance(Duration::minutes(minutes));
        }
    }

    fn edge(from: &str, to: &str) -> FlowConnection {
        FlowConnection::new(format!("{from}-{to}"), from, to)
    }

    fn message(id: &str, content: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Message {
                content: content.into(),
                media: vec![],
            },
        )
    }

    fn delay(id: &str, minutes: u32) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Delay {
                delay_minutes: minutes,
            },
        )
    }

    fn resource(id: &str, locator: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Resource {
                resource_type: ResourceType::Link,
                locator: locator.into(),
            },
        )
    }

    fn tag(id: &str, name: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Tag {
                tag_name: name.into(),
            },
        )
    }

    fn keyword_condition(id: &str, values: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Condition {
                condition_type: ConditionType::Keyword,
                condition_value: values.into(),
            },
        )
    }

    fn flow(id: &str, nodes: Vec<FlowNode>, connections: Vec<FlowConnection>) -> AutomationFlow {
        let mut flow = guide_flow().with_id(id).activated();
        flow.flow_definition = FlowDefinition { nodes, connections };
        flow
    }

    /// trigger -> thanks (message) -> wait (delay) -> guide (resource)
    fn delayed_guide(delay_minutes: u32) -> AutomationFlow {
        flow(
            "flow-delayed",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                message("thanks", "Thanks!"),
                delay("wait", delay_minutes),
                resource("guide", "https://example.com/guide.pdf"),
            ],
            vec![
                edge("trigger", "thanks"),
                edge("thanks", "wait"),
                edge("wait", "guide"),
            ],
        )
    }

    fn with_settings(mut flow: AutomationFlow, f: impl FnOnce(&mut FlowSettings)) -> AutomationFlow {
        f(&mut flow.settings);
        flow
    }

    #[tokio::test]
    async fn guide_flow_runs_every_node_once() {
        let h = Harness::new();
        let flow = guide_flow().activated();
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "send me the guide").await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "welcome", "guide", "tag"]);
        assert!(run.termination.is_none());
        assert!(run.completed_at.is_some());

        let calls = h.adapter.calls();
        assert_eq!(calls.len(), 3);
        match &calls[0] {
            AdapterCall::Message { content, recipient, .. } => {
                assert_eq!(content, "Thanks ada! Here is your guide.");
                assert_eq!(recipient.platform_user_id, "u1");
            }
            other => panic!("unexpected first call: {other:?}"),
        }
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
        assert_eq!(
            h.adapter.calls_of(NodeKind::Tag),
            vec![AdapterCall::Tag {
                recipient: run.event.recipient(),
                tag: "guide-lead".into(),
            }]
        );

        let stored = h.stored(&flow.id).await;
        assert_eq!(stored.total_triggers, 1);
        assert_eq!(stored.total_completions, 1);
        assert_eq!(stored.last_triggered, Some(run.created_at));
    }

    #[tokio::test]
    async fn delay_suspends_until_resume_time() {
        let h = Harness::new();
        let flow = delayed_guide(5);
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "guide please").await;
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(run.current_node.as_deref(), Some("wait"));
        assert_eq!(run.resume_at, Some(run.created_at + Duration::minutes(5)));
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 1);
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());

        let stored = h.stored(&flow.id).await;
        assert_eq!(stored.total_triggers, 1);
        assert_eq!(stored.total_completions, 0);

        h.after_minutes(4);
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());

        h.after_minutes(1);
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "thanks", "wait", "guide"]);
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 1);
        assert_eq!(h.stored(&flow.id).await.total_completions, 1);
    }

    #[tokio::test]
    async fn resource_is_not_sent_a_second_early() {
        let h = Harness::new();
        let flow = delayed_guide(10);
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;

        h.clock.advance(Duration::minutes(10) - Duration::seconds(1));
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());

        h.clock.advance(Duration::seconds(1));
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn failed_message_stops_run_when_stop_on_error() {
        let h = Harness::new();
        let flow = with_settings(guide_flow().activated(), |s| s.stop_on_error = true);
        h.install(&flow).await;
        h.adapter.fail(NodeKind::Message, Fault::Reject);

        let run = h.started(&flow, "u1", "guide").await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.termination,
            Some(TerminationReason::Adapter {
                node_id: "welcome".into(),
                message: "rejected: message refused".into(),
            })
        );
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());
        assert!(h.adapter.calls_of(NodeKind::Tag).is_empty());

        let stored = h.stored(&flow.id).await;
        assert_eq!(stored.total_triggers, 1);
        assert_eq!(stored.total_completions, 0);
    }

    #[tokio::test]
    async fn failed_message_is_recorded_and_run_continues_by_default() {
        let h = Harness::new();
        let flow = guide_flow().activated();
        h.install(&flow).await;
        h.adapter.fail(NodeKind::Message, Fault::Reject);

        let run = h.started(&flow, "u1", "guide").await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.trail[1].outcome,
            StepOutcome::Failed {
                error: "rejected: message refused".into()
            }
        );
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 1);
    }

    #[tokio::test]
    async fn webhook_failure_never_stops_the_run() {
        let h = Harness::new();
        let flow = with_settings(
            flow(
                "flow-hook",
                vec![
                    FlowNode::new("trigger", NodeData::Trigger),
                    FlowNode::new(
                        "notify",
                        NodeData::Webhook {
                            url: "https://hooks.example.com/leads".into(),
                            payload_template: json!({"user": "{{username}}", "said": "{{content}}"}),
                        },
                    ),
                    tag("tag", "hooked"),
                ],
                vec![edge("trigger", "notify"), edge("notify", "tag")],
            ),
            |s| s.stop_on_error = true,
        );
        h.install(&flow).await;
        h.adapter.fail(NodeKind::Webhook, Fault::Reject);

        let run = h.started(&flow, "u1", "guide").await;

        assert_eq!(run.status, RunStatus::Completed);
        assert!(matches!(run.trail[1].outcome, StepOutcome::Failed { .. }));
        assert_eq!(
            h.adapter.calls_of(NodeKind::Webhook),
            vec![AdapterCall::Webhook {
                url: "https://hooks.example.com/leads".into(),
                payload: json!({"user": "ada", "said": "guide"}),
            }]
        );
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 1);
    }

    #[tokio::test]
    async fn panicking_adapter_fails_only_its_node() {
        let h = Harness::new();
        let flow = guide_flow().activated();
        h.install(&flow).await;
        h.adapter.fail(NodeKind::Message, Fault::Panic);

        let run = h.started(&flow, "u1", "guide").await;

        assert_eq!(run.status, RunStatus::Completed);
        match &run.trail[1].outcome {
            StepOutcome::Failed { error } => {
                assert!(error.contains("message adapter exploded"), "{error}")
            }
            other => panic!("expected a failed step, got {other:?}"),
        }
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 1);
    }

    #[tokio::test]
    async fn hanging_adapter_times_out() {
        let h = Harness::with_config(EngineConfig {
            adapter_timeout_ms: 50,
            ..EngineConfig::default()
        });
        let flow = guide_flow().activated();
        h.install(&flow).await;
        h.adapter.fail(NodeKind::Resource, Fault::Hang);

        let run = h.started(&flow, "u1", "guide").await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.trail[2].outcome,
            StepOutcome::Failed {
                error: AdapterError::Timeout { timeout_ms: 50 }.to_string()
            }
        );
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 1);
    }

    #[tokio::test]
    async fn live_run_suppresses_duplicate_events() {
        let h = Harness::new();
        let flow = delayed_guide(30);
        h.install(&flow).await;

        let first = h.started(&flow, "u1", "guide").await;
        let second = h.fire(&flow, "u1", "guide again").await;
        match second {
            StartOutcome::Suppressed { existing_run_id } => assert_eq!(existing_run_id, first.id),
            other => panic!("expected suppression, got {other:?}"),
        }

        let run = h.runs.get_run(&first.id).await.unwrap().unwrap();
        assert_eq!(run.suppressed_events, 1);
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 1);

        // Another contact is not affected.
        let other = h.started(&flow, "u2", "guide").await;
        assert_ne!(other.id, first.id);
        assert_eq!(h.stored(&flow.id).await.total_triggers, 2);
    }

    #[tokio::test]
    async fn finished_run_does_not_suppress_new_events() {
        let h = Harness::new();
        let flow = guide_flow().activated();
        h.install(&flow).await;

        let first = h.started(&flow, "u1", "guide").await;
        let second = h.started(&flow, "u1", "guide").await;
        assert_ne!(first.id, second.id);
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 2);
    }

    #[tokio::test]
    async fn allow_multiple_runs_starts_a_run_per_event() {
        let h = Harness::new();
        let flow = with_settings(delayed_guide(30), |s| s.allow_multiple_runs = true);
        h.install(&flow).await;

        let first = h.started(&flow, "u1", "guide").await;
        let second = h.started(&flow, "u1", "guide").await;
        assert_ne!(first.id, second.id);
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 2);
    }

    #[tokio::test]
    async fn test_runs_skip_duplicate_suppression() {
        let h = Harness::new();
        let flow = delayed_guide(30);
        h.install(&flow).await;
        let origin = RunOrigin::Test {
            principal: "owner".into(),
        };

        for _ in 0..2 {
            let event = SocialEvent::new(Platform::Instagram, "test:owner", "guide");
            let outcome = h
                .executor
                .start(&flow, event, origin.clone())
                .await
                .unwrap();
            assert!(matches!(outcome, StartOutcome::Started(ref run) if run.is_test()));
        }
        let stats = h.runs.flow_stats(&flow.id, true).await.unwrap();
        assert_eq!(stats.test_runs, 2);
    }

    #[tokio::test]
    async fn advancing_a_finished_run_changes_nothing() {
        let h = Harness::new();
        let flow = guide_flow().activated();
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;
        let events_before = h.runs.events(&run.id).await.unwrap().len();

        let again = h.executor.advance(&run.id).await.unwrap();
        let once_more = h.executor.advance(&run.id).await.unwrap();

        assert_eq!(again, run);
        assert_eq!(once_more, run);
        assert_eq!(h.runs.events(&run.id).await.unwrap().len(), events_before);
        assert_eq!(h.adapter.calls().len(), 3);
        let stored = h.stored(&flow.id).await;
        assert_eq!((stored.total_triggers, stored.total_completions), (1, 1));
    }

    #[tokio::test]
    async fn concurrent_advances_run_each_node_once() {
        let h = Harness::new();
        let flow = delayed_guide(5);
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;
        h.after_minutes(5);

        let (a, b) = tokio::join!(h.executor.advance(&run.id), h.executor.advance(&run.id));

        assert_eq!(a.unwrap().status, RunStatus::Completed);
        assert_eq!(b.unwrap().status, RunStatus::Completed);
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
        let run = h.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.executed_nodes(), vec!["trigger", "thanks", "wait", "guide"]);
    }

    #[tokio::test]
    async fn run_past_its_deadline_times_out() {
        let h = Harness::new();
        let flow = with_settings(delayed_guide(60), |s| s.timeout_minutes = Some(30));
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;
        assert_eq!(run.deadline, Some(run.created_at + Duration::minutes(30)));

        h.after_minutes(30);
        let run = h.executor.advance(&run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.termination,
            Some(TerminationReason::Timeout {
                timeout_minutes: 30
            })
        );
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());
    }

    #[tokio::test]
    async fn stopped_run_never_resumes() {
        let h = Harness::new();
        let flow = delayed_guide(5);
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;

        let stopped = h.executor.stop(&run.id, "owner request").await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(
            stopped.termination,
            Some(TerminationReason::Stopped {
                reason: "owner request".into()
            })
        );

        h.after_minutes(10);
        let after = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(after.status, RunStatus::Stopped);
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());

        let again = h.executor.stop(&run.id, "twice").await.unwrap();
        assert_eq!(again, stopped);
    }

    #[tokio::test]
    async fn responses_feed_user_response_conditions() {
        let h = Harness::new();
        let flow = flow(
            "flow-reply",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                message("ask", "Want the guide? Reply yes."),
                delay("wait", 1),
                FlowNode::new(
                    "answer",
                    NodeData::Condition {
                        condition_type: ConditionType::UserResponse,
                        condition_value: "yes".into(),
                    },
                ),
                tag("tag", "opted-in"),
            ],
            vec![
                edge("trigger", "ask"),
                edge("ask", "wait"),
                edge("wait", "answer"),
                edge("answer", "tag").labeled("yes"),
            ],
        );
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;

        let run = h.executor.record_response(&run.id, "YES please").await.unwrap();
        assert_eq!(run.responses, vec!["YES please".to_string()]);

        h.after_minutes(1);
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.applied_tags(), vec!["opted-in"]);

        let err = h.executor.record_response(&run.id, "too late").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Terminal { .. }));
    }

    /// trigger -> check (keyword "price,cost") -yes-> pricing / -no-> faq
    fn branching_flow() -> AutomationFlow {
        flow(
            "flow-branch",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                keyword_condition("check", "price,cost"),
                message("pricing", "Prices start at $10."),
                message("faq", "See our FAQ."),
            ],
            vec![
                edge("trigger", "check"),
                edge("check", "pricing").labeled("yes"),
                edge("check", "faq").labeled("no"),
            ],
        )
    }

    #[tokio::test]
    async fn condition_takes_the_matching_branch() {
        let h = Harness::new();
        let flow = branching_flow();
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "what's the PRICE?").await;
        assert_eq!(run.executed_nodes(), vec!["trigger", "check", "pricing"]);
        assert_eq!(
            run.trail[1].outcome,
            StepOutcome::Branched {
                outcome: "matched".into(),
                matched: true
            }
        );

        let run = h.started(&flow, "u2", "hello").await;
        assert_eq!(run.executed_nodes(), vec!["trigger", "check", "faq"]);
    }

    #[tokio::test]
    async fn value_labelled_edge_wins_over_matched() {
        let h = Harness::new();
        let mut flow = branching_flow();
        flow.flow_definition.nodes.push(message("costs", "Costs vary."));
        flow.flow_definition
            .connections
            .push(edge("check", "costs").labeled("cost"));
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "how much does it cost").await;
        assert_eq!(run.executed_nodes(), vec!["trigger", "check", "costs"]);
    }

    /// trigger -> check (keyword "price") -matched-> pricing, no unmatched edge
    fn one_armed_flow() -> AutomationFlow {
        flow(
            "flow-one-armed",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                keyword_condition("check", "price"),
                message("pricing", "Prices start at $10."),
            ],
            vec![
                edge("trigger", "check"),
                edge("check", "pricing").labeled("matched"),
            ],
        )
    }

    #[tokio::test]
    async fn unmatched_branch_completes_by_default() {
        let h = Harness::new();
        let flow = one_armed_flow();
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "hello").await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "check"]);
        assert!(h.adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn unmatched_branch_fails_when_configured() {
        let h = Harness::with_config(EngineConfig {
            unmatched_branch: UnmatchedBranchPolicy::Fail,
            ..EngineConfig::default()
        });
        let flow = one_armed_flow();
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "hello").await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.termination,
            Some(TerminationReason::UnmatchedBranch {
                node_id: "check".into(),
                outcome: "unmatched".into(),
            })
        );
        let stored = h.stored(&flow.id).await;
        assert_eq!((stored.total_triggers, stored.total_completions), (1, 0));
    }

    #[tokio::test]
    async fn unmatched_branch_fails_with_stop_on_error() {
        let h = Harness::new();
        let flow = with_settings(one_armed_flow(), |s| s.stop_on_error = true);
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "hello").await;
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn fan_in_node_runs_once() {
        let h = Harness::new();
        let flow = flow(
            "flow-diamond",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                tag("a", "left"),
                tag("b", "right"),
                message("join", "Welcome aboard"),
            ],
            vec![
                edge("trigger", "a"),
                edge("trigger", "b"),
                edge("a", "join"),
                edge("b", "join"),
            ],
        );
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "guide").await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "a", "b", "join"]);
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 1);
    }

    #[tokio::test]
    async fn join_waits_for_every_live_branch() {
        let h = Harness::new();
        let flow = flow(
            "flow-uneven",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                tag("a", "first"),
                tag("b", "second"),
                message("join", "All set"),
            ],
            vec![
                edge("trigger", "a"),
                edge("a", "b"),
                edge("b", "join"),
                edge("trigger", "join"),
            ],
        );
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "guide").await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "a", "b", "join"]);
        assert_eq!(h.adapter.calls_of(NodeKind::Message).len(), 1);
    }

    #[tokio::test]
    async fn untaken_branch_does_not_hold_back_join() {
        let h = Harness::new();
        let flow = flow(
            "flow-optional",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                keyword_condition("check", "price"),
                message("pricing", "Prices start at $10."),
                message("join", "Anything else?"),
            ],
            vec![
                edge("trigger", "check"),
                edge("check", "pricing").labeled("matched"),
                edge("pricing", "join"),
                edge("trigger", "join"),
            ],
        );
        h.install(&flow).await;

        let run = h.started(&flow, "u1", "hello").await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "check", "join"]);

        let run = h.started(&flow, "u2", "price?").await;
        assert_eq!(run.executed_nodes(), vec!["trigger", "check", "pricing", "join"]);
    }

    #[tokio::test]
    async fn executors_sharing_a_ledger_perform_each_effect_once() {
        let h = Harness::new();
        let flow = flow(
            "flow-shared",
            vec![
                FlowNode::new("trigger", NodeData::Trigger),
                delay("wait", 5),
                resource("guide", "https://example.com/guide.pdf"),
                tag("tag", "guide-sent"),
            ],
            vec![
                edge("trigger", "wait"),
                edge("wait", "guide"),
                edge("guide", "tag"),
            ],
        );
        h.install(&flow).await;
        let other = Executor::new(
            EngineConfig::default(),
            h.runs.clone(),
            h.flows.clone(),
            h.adapter.adapters(),
            h.clock.clone(),
        );
        let run = h.started(&flow, "u1", "guide").await;
        assert_eq!(run.status, RunStatus::Waiting);
        h.after_minutes(5);

        let (a, b) = tokio::join!(h.executor.advance(&run.id), other.advance(&run.id));
        a.unwrap();
        b.unwrap();
        let run = h.executor.advance(&run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes(), vec!["trigger", "wait", "guide", "tag"]);
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
        assert_eq!(h.adapter.calls_of(NodeKind::Tag).len(), 1);
        assert_eq!(run.claim, None);
    }

    #[tokio::test]
    async fn foreign_claim_holds_the_run_until_stale() {
        let h = Harness::with_config(EngineConfig {
            stale_run_after_ms: 10 * 60 * 1000,
            ..EngineConfig::default()
        });
        let flow = delayed_guide(5);
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;

        let mut claim = LedgerEvent::step_claimed(&run.id, "guide", "vanished", h.clock.now());
        claim.set_seq(run.last_seq + 1);
        h.runs.append(&[claim]).await.unwrap();

        h.after_minutes(5);
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert!(h.adapter.calls_of(NodeKind::Resource).is_empty());

        h.after_minutes(5);
        let run = h.executor.advance(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(h.adapter.calls_of(NodeKind::Resource).len(), 1);
    }

    #[tokio::test]
    async fn in_flight_run_keeps_its_snapshot() {
        let h = Harness::new();
        let flow = delayed_guide(5);
        h.install(&flow).await;
        let run = h.started(&flow, "u1", "guide").await;

        let mut edited = flow.clone();
        edited.flow_definition.nodes[3] = resource("guide", "https://example.com/v2.pdf");
        h.install(&edited).await;

        h.after_minutes(5);
        h.executor.advance(&run.id).await.unwrap();
        match &h.adapter.calls_of(NodeKind::Resource)[0] {
            AdapterCall::Resource { resource, .. } => {
                assert_eq!(resource.locator, "https://example.com/guide.pdf")
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn flow_without_trigger_is_refused() {
        let h = Harness::new();
        let mut flow = guide_flow().activated();
        flow.flow_definition.nodes.retain(|n| n.kind() != NodeKind::Trigger);

        let event = SocialEvent::new(Platform::Instagram, "u1", "guide");
        let err = h
            .executor
            .start(&flow, event, RunOrigin::Event)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Invalid(_)));
        assert!(h.adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn triggers_never_fall_below_completions() {
        let h = Harness::new();
        let flow = with_settings(delayed_guide(5), |s| s.allow_multiple_runs = true);
        h.install(&flow).await;

        let mut ids = Vec::new();
        for user in ["u1", "u2", "u3"] {
            ids.push(h.started(&flow, user, "guide").await.id);
            let stored = h.stored(&flow.id).await;
            assert!(stored.total_triggers >= stored.total_completions);
        }
        h.executor.stop(&ids[2], "spam").await.unwrap();
        h.after_minutes(5);
        for id in &ids {
            h.executor.advance(id).await.unwrap();
            let stored = h.stored(&flow.id).await;
            assert!(stored.total_triggers >= stored.total_completions);
        }

        let stored = h.stored(&flow.id).await;
        assert_eq!((stored.total_triggers, stored.total_completions), (3, 2));
    }
}
