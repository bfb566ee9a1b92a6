//! Background resumption of due runs.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::executor::Executor;
use crate::traits::RunStore;

/// Periodically advances runs the ledger reports as due: waiting runs
/// whose delay elapsed, runs past their deadline, and runs left mid-step
/// by a crashed process.
///
/// Executors sharing one [`RunStore`] may tick concurrently: a node's
/// effect only happens after its step claim lands in the ledger, and the
/// loser of a claim race yields. This holds for stores that enforce seq
/// order across writers. [`FileRunStore`](crate::defaults::FileRunStore)
/// does so only inside one process, so a data directory belongs to a
/// single process.
pub struct ResumeScheduler {
    executor: Arc<Executor>,
    run_store: Arc<dyn RunStore>,
}

impl ResumeScheduler {
    pub fn new(executor: Arc<Executor>, run_store: Arc<dyn RunStore>) -> Self {
        Self {
            executor,
            run_store,
        }
    }

    /// Advance up to one batch of due runs. Returns how many were advanced
    /// without error.
    pub async fn tick(&self) -> usize {
        let config = self.executor.config();
        let now = self.executor.clock().now();
        let stale_before = now - config.stale_run_after();

        let due = match self.run_store.due_runs(now, Some(stale_before)).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list due runs");
                return 0;
            }
        };

        // Runs advance independently; each holds only its own lock.
        let executor = &self.executor;
        let mut in_flight: FuturesUnordered<_> = due
            .into_iter()
            .take(config.scheduler_batch_size)
            .map(move |run| async move {
                let result = executor.advance(&run.id).await;
                (run.id, result)
            })
            .collect();

        let mut advanced = 0;
        while let Some((run_id, result)) = in_flight.next().await {
            match result {
                Ok(after) => {
                    tracing::debug!(run_id = %run_id, status = ?after.status, "resumed run");
                    advanced += 1;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to resume run");
                }
            }
        }
        advanced
    }

    /// Tick every `scheduler_interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let interval = self.executor.config().scheduler_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let advanced = self.tick().await;
                        if advanced > 0 {
                            tracing::info!(advanced, "scheduler tick");
                        }
                    }
                    _ = shutdown.recv() => {
                        return;
                    }
                }
            }
        })
    }
}
