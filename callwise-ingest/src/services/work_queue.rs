//! Persisted enrichment work queue and background dispatcher
//!
//! Tasks live in `enrichment_tasks`, so nothing is lost across restarts.
//! Producers enqueue and wake the dispatcher through a `Notify`; the
//! dispatcher also polls on an interval to pick up deferred and held-back tasks.

use callwise_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::models::{EnrichmentTask, Stage, TaskKind};
use crate::services::enrichment_orchestrator::{EnrichmentOrchestrator, TaskOutcome};

#[derive(Clone)]
pub struct WorkQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedule the full pipeline; false if the call already had one
    pub async fn enqueue_pipeline(&self, call_id: Uuid, tenant_id: Uuid) -> Result<bool> {
        self.enqueue(call_id, tenant_id, TaskKind::Pipeline).await
    }

    /// Schedule a single-stage re-run; false if one is already open
    pub async fn enqueue_reprocess(&self, call_id: Uuid, tenant_id: Uuid, stage: Stage) -> Result<bool> {
        self.enqueue(call_id, tenant_id, TaskKind::Reprocess(stage)).await
    }

    async fn enqueue(&self, call_id: Uuid, tenant_id: Uuid, kind: TaskKind) -> Result<bool> {
        let created = db::tasks::enqueue(&self.pool, call_id, tenant_id, kind).await?;
        if created {
            debug!(call_id = %call_id, kind = %kind.to_db(), "Enrichment task enqueued");
            self.notify.notify_one();
        }
        Ok(created)
    }

    /// Wake the dispatcher without enqueuing (e.g. a tenant was reactivated)
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await
    }

    pub async fn claim(&self, limit: usize) -> Result<Vec<EnrichmentTask>> {
        db::tasks::claim_pending(&self.pool, limit as i64).await
    }

    pub async fn complete(&self, task_id: i64) -> Result<()> {
        db::tasks::mark_done(&self.pool, task_id).await
    }

    /// Return a task to pending; `retry_after` holds it back from claims
    pub async fn release(&self, task_id: i64, reason: Option<&str>, retry_after: Option<Duration>) -> Result<()> {
        db::tasks::return_to_pending(&self.pool, task_id, reason, retry_after).await
    }

    /// Startup recovery: running tasks and stages go back to pending
    pub async fn recover(&self) -> Result<(u64, u64)> {
        let tasks = db::tasks::recover_running(&self.pool).await?;
        let stages = db::stages::recover_running_stages(&self.pool).await?;
        if tasks > 0 || stages > 0 {
            info!(tasks, stages, "Recovered interrupted enrichment work");
        }
        Ok((tasks, stages))
    }

    pub async fn pending_count(&self) -> Result<i64> {
        db::tasks::count_pending(&self.pool).await
    }
}

/// Runs claimed tasks through the orchestrator with bounded concurrency
pub struct EnrichmentWorker {
    queue: WorkQueue,
    orchestrator: Arc<EnrichmentOrchestrator>,
    concurrency: usize,
    poll_interval: Duration,
}

impl EnrichmentWorker {
    pub fn new(
        queue: WorkQueue,
        orchestrator: Arc<EnrichmentOrchestrator>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Claim and run everything currently pending, then return
    ///
    /// Returns the number of tasks that ran to completion.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut completed = 0;
        loop {
            let tasks = self.queue.claim(self.concurrency).await?;
            if tasks.is_empty() {
                return Ok(completed);
            }

            let mut set = JoinSet::new();
            for task in tasks {
                let orchestrator = Arc::clone(&self.orchestrator);
                let queue = self.queue.clone();
                let retry = self.poll_interval;
                set.spawn(async move { run_one(&orchestrator, &queue, task, retry).await });
            }

            let mut progressed = false;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(true) => {
                        completed += 1;
                        progressed = true;
                    }
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "Enrichment task panicked"),
                }
            }

            // Everything claimed was deferred; leave it for a later poll
            if !progressed {
                return Ok(completed);
            }
        }
    }

    /// Dispatch loop until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Enrichment worker started"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();

        loop {
            let available = permits.available_permits();
            if available > 0 {
                match self.queue.claim(available).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                                break;
                            };
                            let orchestrator = Arc::clone(&self.orchestrator);
                            let queue = self.queue.clone();
                            let retry = self.poll_interval;
                            running.spawn(async move {
                                run_one(&orchestrator, &queue, task, retry).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to claim enrichment tasks"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Enrichment task panicked");
                    }
                }
            }
        }

        info!(in_flight = running.len(), "Enrichment worker stopping, waiting for in-flight tasks");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Enrichment task panicked");
            }
        }
        info!("Enrichment worker stopped");
    }
}

/// Hold-back before a busy or failed task is claimed again
///
/// Doubles with each attempt, capped at 64 poll intervals.
pub fn retry_delay(poll_interval: Duration, attempts: i64) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 6) as u32;
    poll_interval.saturating_mul(1 << exponent)
}

/// Returns true when the task finished (not deferred, not failed)
async fn run_one(
    orchestrator: &EnrichmentOrchestrator,
    queue: &WorkQueue,
    task: EnrichmentTask,
    poll_interval: Duration,
) -> bool {
    let task_id = task.id;
    let call_id = task.call_id;
    let backoff = retry_delay(poll_interval, task.attempts);

    match orchestrator.run_task(&task).await {
        Ok(TaskOutcome::Completed) => {
            if let Err(e) = queue.complete(task_id).await {
                error!(task_id, call_id = %call_id, error = %e, "Failed to mark task done");
                return false;
            }
            true
        }
        Ok(TaskOutcome::Deferred(reason)) => {
            // Claims already skip suspended tenants; activation makes it claimable
            info!(task_id, call_id = %call_id, reason = %reason, "Enrichment task deferred");
            if let Err(e) = queue.release(task_id, Some(&reason), None).await {
                error!(task_id, call_id = %call_id, error = %e, "Failed to defer task");
            }
            false
        }
        Ok(TaskOutcome::Busy(reason)) => {
            debug!(
                task_id,
                call_id = %call_id,
                reason = %reason,
                retry_ms = backoff.as_millis() as u64,
                "Enrichment task busy, retrying later"
            );
            if let Err(e) = queue.release(task_id, Some(&reason), Some(backoff)).await {
                error!(task_id, call_id = %call_id, error = %e, "Failed to defer task");
            }
            false
        }
        Err(e) => {
            warn!(
                task_id,
                call_id = %call_id,
                attempts = task.attempts,
                retry_ms = backoff.as_millis() as u64,
                error = %e,
                "Enrichment task failed, returned to queue"
            );
            if let Err(e) = queue.release(task_id, Some(&e.to_string()), Some(backoff)).await {
                error!(task_id, call_id = %call_id, error = %e, "Failed to return task to queue");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let poll = Duration::from_millis(100);
        assert_eq!(retry_delay(poll, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(poll, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(poll, 4), Duration::from_millis(800));
        assert_eq!(retry_delay(poll, 50), Duration::from_millis(6400));
        assert_eq!(retry_delay(poll, 0), poll);
    }
}
