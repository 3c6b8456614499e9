use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{normalise_domain, Job, JobStatus, SourceType};
use crate::error::EngineError;
use crate::ids::{JobId, SchedulerId};
use crate::quota::QuotaService;
use crate::queue::TaskQueue;
use crate::seed_loader::SeedLoader;
use crate::storage::{ConditionalOutcome, EngineStore, TerminalField};

/// Options accepted by [`JobManager::create_job`] (§4.1 `CreateJob`).
/// Defaults mirror the spec's stated defaults.
pub struct CreateJobOptions {
    pub domain: String,
    pub organisation_id: Uuid,
    pub user_id: Option<Uuid>,
    pub use_sitemap: bool,
    pub find_links: bool,
    pub concurrency: i32,
    pub max_pages: i32,
    pub source_type: SourceType,
    pub source_detail: Option<String>,
    pub source_info: serde_json::Value,
    pub scheduler_id: Option<SchedulerId>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl Default for CreateJobOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            organisation_id: Uuid::nil(),
            user_id: None,
            use_sitemap: true,
            find_links: true,
            concurrency: 20,
            max_pages: 0,
            source_type: SourceType::Dashboard,
            source_detail: None,
            source_info: serde_json::json!({}),
            scheduler_id: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

pub const MAX_CONCURRENCY: i32 = 100;

/// Job lifecycle orchestration (§4.1): create, cancel, finalise, keep
/// counters consistent. A thin façade over the Task Queue and Persistence
/// layer, the way `kernel::jobs::manager`-style code in this repository
/// does not embed raw SQL but delegates to the stores it coordinates.
pub struct JobManager {
    store: Arc<dyn EngineStore>,
    queue: TaskQueue,
    quota: QuotaService,
    seed_loader: SeedLoader,
}

/// Daily page-quota limit per organisation, by plan. In the distilled
/// spec this comes from billing (out of scope); a fixed default keeps the
/// engine self-contained and testable without a billing integration.
pub const DEFAULT_DAILY_QUOTA: i64 = 5_000;

impl JobManager {
    pub fn new(store: Arc<dyn EngineStore>, queue: TaskQueue, quota: QuotaService, seed_loader: SeedLoader) -> Self {
        Self { store, queue, quota, seed_loader }
    }

    /// §4.1 `CreateJob`: validate domain, upsert it, quota pre-check,
    /// insert job `pending`, hand off to the Seed Loader, transition to
    /// `running`.
    pub async fn create_job(&self, opts: CreateJobOptions) -> Result<Job, EngineError> {
        let normalised = normalise_domain(&opts.domain);
        if normalised.is_empty() || !normalised.contains('.') {
            return Err(EngineError::Validation(format!("invalid domain: {}", opts.domain)));
        }

        let remaining = self.quota.remaining(opts.organisation_id, DEFAULT_DAILY_QUOTA).await?;
        if remaining <= 0 {
            return Err(EngineError::QuotaExceeded {
                used: DEFAULT_DAILY_QUOTA,
                limit: DEFAULT_DAILY_QUOTA,
                resets_at: next_utc_midnight(),
                plan: "default".to_string(),
            });
        }

        let domain = self.store.upsert_domain(&normalised).await?;

        let concurrency = opts.concurrency.clamp(1, MAX_CONCURRENCY);

        let job = Job {
            id: JobId::new(),
            organisation_id: opts.organisation_id,
            domain_id: domain.id,
            status: JobStatus::Pending,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            concurrency,
            max_pages: opts.max_pages,
            find_links: opts.find_links,
            use_sitemap: opts.use_sitemap,
            source_type: opts.source_type,
            source_detail: opts.source_detail,
            source_info: opts.source_info,
            scheduler_id: opts.scheduler_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stats: serde_json::json!({}),
        };

        let job = self.store.insert_job(job).await?;
        info!(job_id = %job.id, domain = %domain.name, "job created");

        let enqueued = self
            .seed_loader
            .seed(&domain, &job, &opts.include_paths, &opts.exclude_paths)
            .await?;

        self.store.set_job_running(job.id, enqueued as i64).await?;
        info!(job_id = %job.id, total_tasks = enqueued, "job started");

        self.store.get_job(job.id).await
    }

    /// §4.1 `CancelJob`: atomically transition to `cancelled` and skip
    /// all pending tasks. Running tasks continue (§4.3 "non-preemptive").
    pub async fn cancel_job(&self, job_id: JobId) -> Result<u64, EngineError> {
        let skipped = self.store.cancel_job(job_id).await?;
        info!(job_id = %job_id, skipped, "job cancelled");
        Ok(skipped)
    }

    /// §4.1 `GetJobStatus`.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(
        &self,
        organisation_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, EngineError> {
        self.store.list_jobs(organisation_id, status, limit.clamp(1, 100), offset.max(0)).await
    }

    /// §4.1 `OnTaskTerminal`: bump the matching counter, and if the job is
    /// now fully settled, transition it to `completed` — individual task
    /// failures alone never make a job `failed`; only engine-level aborts
    /// (quota exhaustion) do, via [`Self::fail_job_on_quota_exhaustion`].
    pub async fn on_task_terminal(&self, job_id: JobId, field: TerminalField) -> Result<(), EngineError> {
        let job = self.store.bump_job_counter(job_id, field).await?;

        if job.is_settled() && !job.status.is_terminal() {
            self.store.set_job_status(job_id, JobStatus::Completed).await?;
            info!(job_id = %job_id, "job completed");
        }

        Ok(())
    }

    /// Quota-triggered `failed` transition (§4.8, §9 Open Question 2):
    /// conditional on the job still being `running` so only one racing
    /// worker wins the transition.
    pub async fn fail_job_on_quota_exhaustion(&self, job_id: JobId) -> Result<bool, EngineError> {
        let outcome = self
            .store
            .set_job_status_if(job_id, JobStatus::Running, JobStatus::Failed)
            .await?;

        if outcome == ConditionalOutcome::Applied {
            self.store
                .record_job_stat(job_id, "quota_exceeded", serde_json::Value::Bool(true))
                .await?;
            self.store
                .record_job_stat(job_id, "failure_reason", serde_json::Value::String("quota_exceeded".into()))
                .await?;
            let skipped = self.store.skip_pending_tasks_for_job(job_id).await?;
            warn!(job_id = %job_id, skipped, "job failed: quota exhausted mid-run");
        }

        Ok(outcome == ConditionalOutcome::Applied)
    }

    /// Recovery-path recomputation (§4.1 "Failure semantics", §4.9): if
    /// the process died mid-finalisation, recompute counters from task
    /// rows and retry the terminal transition.
    pub async fn recover_job(&self, job_id: JobId) -> Result<Job, EngineError> {
        let job = self.store.recompute_job_counters(job_id).await?;
        if job.is_settled() && !job.status.is_terminal() {
            self.store.set_job_status(job_id, JobStatus::Completed).await?;
            return self.store.get_job(job_id).await;
        }
        Ok(job)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Read-only escape hatch for the HTTP façade's list/export endpoints
    /// (§6 `GET /v1/jobs/{id}/tasks`, `/export`), which need direct store
    /// reads the Job Manager itself has no vocabulary for.
    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }
}

fn next_utc_midnight() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsService;
    use crate::fetcher::memory::InMemoryFetcher;
    use crate::quota::QuotaService;
    use crate::storage::memory::MemoryStore;

    async fn build_manager() -> (JobManager, Arc<dyn EngineStore>) {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let quota = QuotaService::new(store.clone());
        let fetcher = Arc::new(InMemoryFetcher::new());
        let seed_loader = SeedLoader::new(fetcher, queue.clone(), Default::default());
        let manager = JobManager::new(store.clone(), queue, quota, seed_loader);
        (manager, store)
    }

    #[tokio::test]
    async fn create_job_rejects_invalid_domain() {
        let (manager, _store) = build_manager().await;
        let opts = CreateJobOptions {
            domain: "not a domain".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            ..Default::default()
        };
        let result = manager.create_job(opts).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn create_job_without_sitemap_falls_back_to_root_seed() {
        let (manager, _store) = build_manager().await;
        let opts = CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            ..Default::default()
        };
        let job = manager.create_job(opts).await.unwrap();
        assert_eq!(job.total_tasks, 1);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn on_task_terminal_completes_job_when_settled() {
        let (manager, store) = build_manager().await;
        let opts = CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            ..Default::default()
        };
        let job = manager.create_job(opts).await.unwrap();
        assert_eq!(job.total_tasks, 1);

        manager.on_task_terminal(job.id, TerminalField::Completed).await.unwrap();

        let updated = store.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.completed_tasks, 1);
    }

    #[tokio::test]
    async fn cancel_job_skips_pending_tasks() {
        let (manager, store) = build_manager().await;
        let opts = CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            ..Default::default()
        };
        let job = manager.create_job(opts).await.unwrap();
        let skipped = manager.cancel_job(job.id).await.unwrap();
        assert_eq!(skipped, 1);
        let updated = store.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Cancelled);
    }

    #[allow(dead_code)]
    fn silence_unused(_a: &AnalyticsService) {}
}
