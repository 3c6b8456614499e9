use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::JobStatus;
use crate::job_manager::JobManager;
use crate::queue::TaskQueue;
use crate::storage::{EngineStore, TerminalField};
use std::sync::Arc;

/// Recovery / Reaper (§4.9). Two responsibilities: a one-shot startup sweep
/// that recomputes every running job's counters and reclaims dead leases
/// before the Worker Pool starts leasing, and a recurring ticker that keeps
/// reclaiming expired leases thereafter.
pub struct Reaper {
    store: Arc<dyn EngineStore>,
    queue: TaskQueue,
    job_manager: Arc<JobManager>,
    tick_interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn EngineStore>, queue: TaskQueue, job_manager: Arc<JobManager>) -> Self {
        Self { store, queue, job_manager, tick_interval: Duration::from_secs(30) }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// On process start (§4.9): for every Job in `running`, recompute its
    /// counters from task rows, then reap whatever leases died with the
    /// previous process. Must run before the Worker Pool begins leasing so
    /// abandoned tasks are visible as `pending` again.
    pub async fn recover_on_startup(&self) -> Result<(), crate::error::EngineError> {
        let running_jobs = self.store.jobs_in_status(JobStatus::Running).await?;
        for job in &running_jobs {
            self.job_manager.recover_job(job.id).await?;
        }
        info!(jobs = running_jobs.len(), "recomputed counters for in-flight jobs");

        let outcome = self.queue.reap_expired().await?;
        info!(reclaimed = outcome.reclaimed, "startup lease sweep complete");
        for job_id in outcome.newly_failed_job_ids {
            self.job_manager.on_task_terminal(job_id, TerminalField::Failed).await?;
        }
        Ok(())
    }

    /// Calls `ReapExpired` every `tick_interval` until `shutdown` fires
    /// (§4.9 "a background ticker calls ReapExpired every 30s thereafter").
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.tick().await; // first tick fires immediately; startup sweep already covered it

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.queue.reap_expired().await {
                        Ok(outcome) => {
                            for job_id in outcome.newly_failed_job_ids {
                                if let Err(err) = self.job_manager.on_task_terminal(job_id, TerminalField::Failed).await {
                                    error!(error = %err, "failed to reconcile job counter after reap");
                                }
                            }
                        }
                        Err(err) => error!(error = %err, "reaper tick failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsService;
    use crate::fetcher::memory::InMemoryFetcher;
    use crate::job_manager::CreateJobOptions;
    use crate::quota::QuotaService;
    use crate::seed_loader::SeedLoader;
    use crate::storage::memory::MemoryStore;
    use uuid::Uuid;

    #[allow(dead_code)]
    fn silence_unused(_a: &AnalyticsService) {}

    #[tokio::test]
    async fn recover_on_startup_reclaims_abandoned_leases() {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let quota = QuotaService::new(store.clone());
        let fetcher = Arc::new(InMemoryFetcher::new());
        let seed_loader = SeedLoader::new(fetcher, queue.clone(), Default::default());
        let job_manager = Arc::new(JobManager::new(store.clone(), queue.clone(), quota, seed_loader));

        let job = job_manager
            .create_job(CreateJobOptions {
                domain: "example.com".to_string(),
                organisation_id: Uuid::now_v7(),
                use_sitemap: false,
                ..Default::default()
            })
            .await
            .unwrap();

        // Simulate a worker that leased the task and then vanished: lease
        // with a negative duration so it is already expired.
        let leased = queue
            .lease("dead-worker", None, 1, chrono::Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let reaper = Reaper::new(store.clone(), queue, job_manager);
        reaper.recover_on_startup().await.unwrap();

        let tasks = store.list_tasks(job.id, None, None, None, 10, 0).await.unwrap();
        assert_eq!(tasks[0].status, crate::domain::TaskStatus::Pending);
        assert_eq!(tasks[0].retry_count, 1);
        assert!(tasks[0].lease_owner.is_none());
    }
}
