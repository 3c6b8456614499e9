use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{Scheduler, SourceType};
use crate::error::EngineError;
use crate::job_manager::{CreateJobOptions, JobManager};
use crate::storage::{ConditionalOutcome, EngineStore};

/// How often the loop wakes to check for due schedulers (§4.6: "wakes every
/// <= 60s").
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The recurring-schedule watchdog (§4.6). Wakes periodically, materialises
/// every enabled scheduler whose `next_run_at` has passed into a Job, and
/// advances `next_run_at` with a conditional update so two replicas ticking
/// the same scheduler at once still produce exactly one job (§8 S5).
pub struct SchedulerLoop {
    store: Arc<dyn EngineStore>,
    job_manager: Arc<JobManager>,
    tick_interval: Duration,
}

impl SchedulerLoop {
    pub fn new(store: Arc<dyn EngineStore>, job_manager: Arc<JobManager>) -> Self {
        Self { store, job_manager, tick_interval: DEFAULT_TICK_INTERVAL }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// One tick: selects every enabled, due scheduler and materialises it.
    /// A scheduler whose previous job is still running is skipped this tick
    /// (§4.6).
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let due = self.store.due_schedulers(now).await?;
        let mut materialised = 0;

        for scheduler in due {
            if self.store.scheduler_has_running_job(scheduler.id).await? {
                info!(scheduler_id = %scheduler.id, "skipping tick: previous job still running");
                continue;
            }

            if self.materialise(&scheduler, now).await? {
                materialised += 1;
            }
        }

        Ok(materialised)
    }

    /// Creates a Job for this scheduler and advances `next_run_at`,
    /// conditional on the in-DB `next_run_at` still matching what this tick
    /// observed — the race-safety the spec requires for multi-replica ticks.
    async fn materialise(&self, scheduler: &Scheduler, now: chrono::DateTime<Utc>) -> Result<bool, EngineError> {
        let domain = self.store.get_domain(scheduler.domain_id).await?;
        let next_run_at = now + chrono::Duration::hours(scheduler.schedule_interval_hours as i64);

        let outcome = self
            .store
            .advance_scheduler_if(scheduler.id, scheduler.next_run_at, next_run_at)
            .await?;
        if outcome != ConditionalOutcome::Applied {
            info!(scheduler_id = %scheduler.id, "lost race to advance next_run_at, skipping this tick");
            return Ok(false);
        }

        let job = self
            .job_manager
            .create_job(CreateJobOptions {
                domain: domain.name.clone(),
                organisation_id: scheduler.organisation_id,
                user_id: None,
                use_sitemap: true,
                find_links: scheduler.find_links,
                concurrency: scheduler.concurrency,
                max_pages: scheduler.max_pages,
                source_type: SourceType::ScheduleSetup,
                source_detail: Some(scheduler.id.to_string()),
                source_info: serde_json::json!({ "scheduler_id": scheduler.id.to_string() }),
                scheduler_id: Some(scheduler.id),
                include_paths: scheduler.include_paths.clone(),
                exclude_paths: scheduler.exclude_paths.clone(),
            })
            .await?;

        info!(scheduler_id = %scheduler.id, job_id = %job.id, domain = %domain.name, "scheduler materialised job");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::memory::InMemoryFetcher;
    use crate::ids::SchedulerId;
    use crate::quota::QuotaService;
    use crate::queue::TaskQueue;
    use crate::seed_loader::SeedLoader;
    use crate::storage::memory::MemoryStore;
    use uuid::Uuid;

    async fn build(store: Arc<dyn EngineStore>) -> (SchedulerLoop, Arc<JobManager>) {
        let queue = TaskQueue::new(store.clone());
        let quota = QuotaService::new(store.clone());
        let fetcher = Arc::new(InMemoryFetcher::new());
        let seed_loader = SeedLoader::new(fetcher, queue.clone(), Default::default());
        let job_manager = Arc::new(JobManager::new(store.clone(), queue, quota, seed_loader));
        (SchedulerLoop::new(store, job_manager.clone()), job_manager)
    }

    #[tokio::test]
    async fn tick_materialises_due_scheduler_and_advances_next_run() {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let domain = store.upsert_domain("example.com").await.unwrap();
        let scheduler = Scheduler {
            id: SchedulerId::new(),
            organisation_id: Uuid::now_v7(),
            domain_id: domain.id,
            schedule_interval_hours: 6,
            next_run_at: Utc::now() - chrono::Duration::minutes(1),
            is_enabled: true,
            concurrency: 20,
            find_links: false,
            max_pages: 0,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
        };
        store.upsert_scheduler(scheduler.clone()).await.unwrap();

        let (loop_, _job_manager) = build(store.clone()).await;
        let materialised = loop_.tick().await.unwrap();
        assert_eq!(materialised, 1);

        let updated = store.get_scheduler(scheduler.id).await.unwrap();
        assert!(updated.next_run_at > scheduler.next_run_at);

        // Second tick within the same hour finds nothing due.
        let materialised_again = loop_.tick().await.unwrap();
        assert_eq!(materialised_again, 0);
    }

    #[tokio::test]
    async fn tick_skips_scheduler_whose_job_is_still_running() {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let domain = store.upsert_domain("example.com").await.unwrap();
        let scheduler_id = SchedulerId::new();
        let scheduler = Scheduler {
            id: scheduler_id,
            organisation_id: Uuid::now_v7(),
            domain_id: domain.id,
            schedule_interval_hours: 6,
            next_run_at: Utc::now() - chrono::Duration::minutes(1),
            is_enabled: true,
            concurrency: 20,
            find_links: false,
            max_pages: 0,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
        };
        store.upsert_scheduler(scheduler.clone()).await.unwrap();

        let job = crate::domain::Job {
            id: crate::ids::JobId::new(),
            organisation_id: scheduler.organisation_id,
            domain_id: domain.id,
            status: crate::domain::JobStatus::Running,
            total_tasks: 1,
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            concurrency: 20,
            max_pages: 0,
            find_links: false,
            use_sitemap: false,
            source_type: SourceType::ScheduleSetup,
            source_detail: None,
            source_info: serde_json::json!({}),
            scheduler_id: Some(scheduler_id),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            stats: serde_json::json!({}),
        };
        store.insert_job(job).await.unwrap();

        let (loop_, _job_manager) = build(store.clone()).await;
        let materialised = loop_.tick().await.unwrap();
        assert_eq!(materialised, 0);
    }
}
