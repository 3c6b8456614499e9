pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Domain, Job, JobStatus, Page, PageViewFeedEntry, QuotaCounter, Scheduler, Task};
use crate::error::EngineError;
use crate::ids::{JobId, SchedulerId, ShareTokenId, TaskId};

pub type StoreResult<T> = Result<T, EngineError>;

/// Result of a lease/complete/fail attempt. Mirrors the Task Queue
/// invariants (§4.2, §8 invariant 4): row-level conditional updates return
/// "no rows affected" rather than raising, the caller decides what that
/// means (already leased elsewhere, already terminal, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    Applied,
    NoMatch,
}

#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub cache_status: Option<String>,
    pub second_response_time_ms: Option<i32>,
    pub second_cache_status: Option<String>,
    pub content_type: Option<String>,
}

/// The Persistence abstraction (§4 Persistence abstraction, §4.2 Task
/// Queue). Grounded on `kernel::jobs::job::Job::claim_jobs` for `lease`,
/// generalized with a `domain_filter` and the spec's own priority
/// ordering. A single trait covering Domain/Page/Job/Task/Scheduler/
/// quota/analytics storage keeps call sites simple, the way
/// `intelligent-crawler::traits::CrawlerStorage` bundles its related
/// operations behind one trait rather than five.
#[async_trait]
pub trait EngineStore: Send + Sync {
    // --- Domain / Page -----------------------------------------------
    async fn upsert_domain(&self, name: &str) -> StoreResult<Domain>;
    async fn get_domain(&self, domain_id: i64) -> StoreResult<Domain>;
    async fn set_adaptive_delay(&self, domain_id: i64, adaptive_delay_seconds: i32) -> StoreResult<()>;
    async fn upsert_page(&self, domain_id: i64, path: &str, priority: f64) -> StoreResult<Page>;
    async fn get_page(&self, page_id: i64) -> StoreResult<Page>;

    // --- Job -----------------------------------------------------------
    async fn insert_job(&self, job: Job) -> StoreResult<Job>;
    async fn get_job(&self, job_id: JobId) -> StoreResult<Job>;
    async fn list_jobs(
        &self,
        organisation_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>>;
    async fn set_job_running(&self, job_id: JobId, total_tasks: i64) -> StoreResult<()>;
    /// Bumps `total_tasks` when a task is enqueued after the job's initial
    /// seeding — in-crawl link discovery (§4.3 step 6) grows the job's
    /// denominator, it does not just add to the in-queue count implicitly.
    async fn increment_job_total_tasks(&self, job_id: JobId, delta: i64) -> StoreResult<()>;
    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> StoreResult<()>;
    /// Conditional status transition used on the quota-exhaustion path
    /// (§9 Open Question 2): applies only if the job's current status
    /// matches `expected`, so racing workers do not double-transition.
    async fn set_job_status_if(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
    ) -> StoreResult<ConditionalOutcome>;
    async fn bump_job_counter(&self, job_id: JobId, field: TerminalField) -> StoreResult<Job>;
    async fn cancel_job(&self, job_id: JobId) -> StoreResult<u64>;
    async fn record_job_stat(&self, job_id: JobId, key: &str, value: serde_json::Value) -> StoreResult<()>;
    async fn recompute_job_counters(&self, job_id: JobId) -> StoreResult<Job>;
    async fn jobs_in_status(&self, status: JobStatus) -> StoreResult<Vec<Job>>;

    // --- Task Queue ------------------------------------------------------
    async fn enqueue_task(
        &self,
        job_id: JobId,
        page_id: i64,
        source_type: Option<&str>,
        source_url: Option<&str>,
        priority_score: f64,
    ) -> StoreResult<ConditionalOutcome>;
    async fn lease_tasks(
        &self,
        worker_id: &str,
        domain_filter: Option<i64>,
        batch_size: i64,
        lease_duration: chrono::Duration,
    ) -> StoreResult<Vec<Task>>;
    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        completion: TaskCompletion,
    ) -> StoreResult<ConditionalOutcome>;
    async fn fail_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
        next_earliest_run: Option<DateTime<Utc>>,
    ) -> StoreResult<ConditionalOutcome>;
    async fn skip_task(&self, task_id: TaskId, reason: &str) -> StoreResult<ConditionalOutcome>;
    async fn skip_pending_tasks_for_job(&self, job_id: JobId) -> StoreResult<u64>;
    async fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<ReapOutcome>;
    async fn count_pending_tasks(&self, job_id: JobId) -> StoreResult<i64>;
    async fn list_tasks(
        &self,
        job_id: JobId,
        status: Option<&str>,
        cache: Option<&str>,
        path: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Task>>;
    async fn reprioritise_pending(
        &self,
        job_ids: &[JobId],
        page_id: i64,
        new_priority: f64,
    ) -> StoreResult<u64>;

    // --- Scheduler -------------------------------------------------------
    async fn upsert_scheduler(&self, scheduler: Scheduler) -> StoreResult<Scheduler>;
    async fn get_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<Scheduler>;
    /// Backs `GET /v1/schedulers` (§6) — every scheduler owned by an org,
    /// not just the due ones `due_schedulers` surfaces to the tick loop.
    async fn list_schedulers(&self, organisation_id: Uuid) -> StoreResult<Vec<Scheduler>>;
    async fn delete_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<()>;
    async fn due_schedulers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Scheduler>>;
    /// Conditional `next_run_at` advance: only applies if the in-DB value
    /// still matches `expected_next_run_at`, so two replicas ticking the
    /// same scheduler at once produce exactly one job (§4.6, §8 S5).
    async fn advance_scheduler_if(
        &self,
        scheduler_id: SchedulerId,
        expected_next_run_at: DateTime<Utc>,
        new_next_run_at: DateTime<Utc>,
    ) -> StoreResult<ConditionalOutcome>;
    async fn scheduler_has_running_job(&self, scheduler_id: SchedulerId) -> StoreResult<bool>;

    // --- Analytics -------------------------------------------------------
    async fn upsert_page_view_entry(&self, entry: PageViewFeedEntry) -> StoreResult<()>;
    async fn running_job_ids_for_domain(&self, domain_id: i64) -> StoreResult<Vec<JobId>>;

    // --- Quota -----------------------------------------------------------
    async fn quota_remaining(&self, organisation_id: Uuid, limit: i64) -> StoreResult<i64>;
    async fn increment_quota(&self, organisation_id: Uuid) -> StoreResult<QuotaCounter>;

    // --- Share links (§4.10, §6 `POST /v1/jobs/{id}/share-links`) --------
    async fn create_share_link(
        &self,
        token_id: ShareTokenId,
        job_id: JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    /// Resolves a share token to its job, failing `NotFound` if the token
    /// is unknown or has expired.
    async fn resolve_share_link(&self, token_id: ShareTokenId) -> StoreResult<JobId>;
}

/// Which Job counter a terminal task transition bumps (§4.1
/// `OnTaskTerminal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalField {
    Completed,
    Failed,
    Skipped,
}

/// Result of a [`EngineStore::reap_expired`] sweep: how many leases were
/// reclaimed, and the job of every task that used its last retry and
/// landed in `failed` rather than back in `pending` — the caller still
/// owes each of those jobs the same `on_task_terminal` bump the worker
/// gives a task it fails directly (§4.9, §8 invariant 2).
#[derive(Debug, Clone, Default)]
pub struct ReapOutcome {
    pub reclaimed: u64,
    pub newly_failed_job_ids: Vec<JobId>,
}
