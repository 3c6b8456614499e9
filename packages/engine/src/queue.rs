use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::backoff::retry_delay;
use crate::domain::Task;
use crate::ids::{JobId, TaskId};
use crate::storage::{ConditionalOutcome, EngineStore, ReapOutcome, StoreResult, TaskCompletion};

/// The durable lease queue (§4.2) — the heart of the engine. A thin
/// business-logic layer over [`EngineStore`]: it owns backoff computation
/// and the caller-facing vocabulary (`Enqueue`/`Lease`/`Complete`/`Fail`/
/// `Skip`/`ReapExpired`), while the storage trait owns the conditional SQL.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn EngineStore>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Upserts the `(domain_id, path)` page row, returning its id. A thin
    /// pass-through so callers that only know the Task Queue (the Seed
    /// Loader, link discovery in the Worker Pool) don't need their own
    /// handle on the store.
    pub async fn store_page(&self, domain_id: i64, path: &str, priority: f64) -> StoreResult<i64> {
        Ok(self.store.upsert_page(domain_id, path, priority).await?.id)
    }

    /// No-op if `(job_id, page_id)` already present (§4.2 invariant,
    /// §8 invariant 3).
    pub async fn enqueue(
        &self,
        job_id: JobId,
        page_id: i64,
        source_type: Option<&str>,
        source_url: Option<&str>,
        priority_score: f64,
    ) -> StoreResult<bool> {
        let outcome = self
            .store
            .enqueue_task(job_id, page_id, source_type, source_url, priority_score)
            .await?;
        Ok(outcome == ConditionalOutcome::Applied)
    }

    /// Selection order: priority_score DESC, created_at ASC (§4.2, §8
    /// invariant 6).
    pub async fn lease(
        &self,
        worker_id: &str,
        domain_filter: Option<i64>,
        batch_size: i64,
        lease_duration: chrono::Duration,
    ) -> StoreResult<Vec<Task>> {
        self.store.lease_tasks(worker_id, domain_filter, batch_size, lease_duration).await
    }

    pub async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        completion: TaskCompletion,
    ) -> StoreResult<bool> {
        let outcome = self.store.complete_task(task_id, worker_id, completion).await?;
        if outcome == ConditionalOutcome::NoMatch {
            warn!(task_id = %task_id, worker_id, "complete rejected: lease no longer held");
        }
        Ok(outcome == ConditionalOutcome::Applied)
    }

    /// Computes the exponential-backoff-with-jitter next-eligible time
    /// when retryable (base 1s, factor 2, jitter +/-20%, cap 60s — §4.2).
    pub async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
        retry_count_before: i32,
    ) -> StoreResult<bool> {
        let next_eligible_at = if retryable {
            let delay = retry_delay(retry_count_before);
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
        } else {
            None
        };

        let outcome = self
            .store
            .fail_task(task_id, worker_id, error, retryable, next_eligible_at)
            .await?;

        if outcome == ConditionalOutcome::Applied {
            info!(task_id = %task_id, retryable, "task failed");
        }
        Ok(outcome == ConditionalOutcome::Applied)
    }

    pub async fn skip(&self, task_id: TaskId, reason: &str) -> StoreResult<bool> {
        let outcome = self.store.skip_task(task_id, reason).await?;
        Ok(outcome == ConditionalOutcome::Applied)
    }

    /// Reverts every task whose lease has expired back to `pending`,
    /// bumping its retry count, or to `failed` once retries are exhausted
    /// (§4.9). The caller is responsible for reconciling the job counter
    /// of every job named in `newly_failed_job_ids` via `on_task_terminal`,
    /// the same way the Worker Pool does for a task it fails directly.
    pub async fn reap_expired(&self) -> StoreResult<ReapOutcome> {
        let outcome = self.store.reap_expired(Utc::now()).await?;
        if outcome.reclaimed > 0 {
            info!(reclaimed = outcome.reclaimed, "reaped expired task leases");
        }
        Ok(outcome)
    }

    pub async fn count_pending(&self, job_id: JobId) -> StoreResult<i64> {
        self.store.count_pending_tasks(job_id).await
    }
}

/// Retryability classification at the Task Queue boundary: whether a given
/// number of prior attempts has exhausted `MAX_RETRIES` (§4.2, §7).
pub fn retries_exhausted(retry_count: i32) -> bool {
    retry_count >= Task::MAX_RETRIES
}
