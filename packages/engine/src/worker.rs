use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crawler::{classify_status, Crawler};
use crate::domain::{normalise_path, Domain, Job, JobStatus, Task};
use crate::error::CrawlErrorKind;
use crate::ids::JobId;
use crate::job_manager::JobManager;
use crate::queue::{retries_exhausted, TaskQueue};
use crate::quota::{QuotaOutcome, QuotaService};
use crate::seed_loader::glob_match;
use crate::storage::{EngineStore, StoreResult, TaskCompletion, TerminalField};

/// Worker Pool tuning (§4.3, §5). `global_workers` is the hard cap on
/// concurrent tasks in flight across the whole process; `idle_backoff` is
/// the sleep a worker takes when no domain has a free slot or pending work.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub global_workers: usize,
    pub probe_timeout: Duration,
    pub default_domain_concurrency: usize,
    pub daily_quota: i64,
    pub idle_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            global_workers: 10,
            probe_timeout: Duration::from_secs(15),
            default_domain_concurrency: 20,
            daily_quota: crate::job_manager::DEFAULT_DAILY_QUOTA,
            idle_backoff: Duration::from_millis(200),
        }
    }
}

/// Per-domain admission gate (§4.3 step 1, §9 "Global mutable state"): a
/// counting semaphore keyed by `domain_id`. Cross-replica coherence is not
/// required — DB-level leasing (`FOR UPDATE SKIP LOCKED`) is the correctness
/// boundary, this only throttles in-process concurrency.
#[derive(Default)]
pub struct DomainGate {
    semaphores: DashMap<i64, Arc<Semaphore>>,
}

impl DomainGate {
    fn semaphore_for(&self, domain_id: i64, capacity: usize) -> Arc<Semaphore> {
        self.semaphores
            .entry(domain_id)
            .or_insert_with(|| Arc::new(Semaphore::new(capacity.max(1))))
            .clone()
    }
}

/// The concurrent executor (§4.3). Grounded on
/// `kernel::jobs::worker::JobWorker` — a long-running loop per worker with
/// `CancellationToken`-based graceful shutdown — generalized with the
/// per-domain [`DomainGate`] this spec's per-domain concurrency cap requires.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn EngineStore>,
    queue: TaskQueue,
    job_manager: Arc<JobManager>,
    quota: QuotaService,
    crawler: Arc<Crawler>,
    gate: Arc<DomainGate>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn EngineStore>,
        queue: TaskQueue,
        job_manager: Arc<JobManager>,
        quota: QuotaService,
        crawler: Arc<Crawler>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self { store, queue, job_manager, quota, crawler, gate: Arc::new(DomainGate::default()), config }
    }

    /// Runs `global_workers` loops until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(self.config.global_workers);
        for index in 0..self.config.global_workers {
            let pool = self.clone();
            let token = shutdown.clone();
            let worker_id = format!("worker-{index}");
            handles.push(tokio::spawn(async move { pool.worker_loop(worker_id, token).await }));
        }
        futures::future::join_all(handles).await;
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        info!(worker_id, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let processed = match self.try_process_one(&worker_id).await {
                Ok(processed) => processed,
                Err(err) => {
                    warn!(worker_id, error = %err, "worker iteration failed");
                    false
                }
            };

            if !processed {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    /// One iteration of the per-worker loop (§4.3 steps 1-7). Returns
    /// whether a task was actually leased and processed, so the caller knows
    /// whether to back off.
    async fn try_process_one(&self, worker_id: &str) -> StoreResult<bool> {
        let running_jobs = self.store.jobs_in_status(JobStatus::Running).await?;
        if running_jobs.is_empty() {
            return Ok(false);
        }

        let mut seen_domains = HashSet::new();
        for job in &running_jobs {
            if !seen_domains.insert(job.domain_id) {
                continue;
            }

            let capacity = job.concurrency.max(1) as usize;
            let gate = self.gate.semaphore_for(job.domain_id, capacity);
            let Ok(_permit) = gate.try_acquire_owned() else {
                continue;
            };

            let lease_duration = chrono::Duration::from_std(self.config.probe_timeout * 2).unwrap_or_default();
            let leased = self.queue.lease(worker_id, Some(job.domain_id), 1, lease_duration).await?;
            let Some(task) = leased.into_iter().next() else {
                continue;
            };

            self.process_task(worker_id, task).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn process_task(&self, worker_id: &str, task: Task) -> StoreResult<()> {
        let job = self.store.get_job(task.job_id).await?;
        let domain = self.store.get_domain(job.domain_id).await?;
        let page = self.store.get_page(task.page_id).await?;

        let politeness = domain.politeness_delay_seconds();
        if politeness > 0 {
            tokio::time::sleep(Duration::from_secs(politeness as u64)).await;
        }

        let url = format!("https://{}{}", domain.name, page.path);
        let outcome = self.crawler.probe(&url, job.find_links, self.config.probe_timeout).await;

        match outcome {
            Ok(probe) => self.handle_success(worker_id, &job, &domain, task, probe).await,
            Err(err) => self.handle_crawl_error(worker_id, &domain, task, err).await,
        }
    }

    async fn handle_success(
        &self,
        worker_id: &str,
        job: &Job,
        domain: &Domain,
        task: Task,
        probe: crate::crawler::ProbeOutcome,
    ) -> StoreResult<()> {
        if let Some(kind) = classify_status(probe.status_code as u16) {
            let retryable = kind.is_retryable(Some(probe.status_code as u16));
            return self.fail_task(worker_id, domain, task, &format!("{kind}"), retryable).await;
        }

        let completion = TaskCompletion {
            status_code: Some(probe.status_code),
            response_time_ms: Some(probe.response_time_ms),
            cache_status: probe.cache_status.clone(),
            second_response_time_ms: probe.second_response_time_ms,
            second_cache_status: probe.second_cache_status.clone(),
            content_type: probe.content_type.clone(),
        };

        self.queue.complete(task.id, worker_id, completion).await?;
        self.job_manager.on_task_terminal(task.job_id, TerminalField::Completed).await?;

        let quota_outcome = self.quota.increment_and_check(job.organisation_id, self.config.daily_quota).await?;
        if let QuotaOutcome::Exceeded { .. } = quota_outcome {
            self.job_manager.fail_job_on_quota_exhaustion(task.job_id).await?;
            return Ok(());
        }

        if job.find_links && job.status == JobStatus::Running && !probe.discovered_links.is_empty() {
            self.enqueue_discovered(job, domain, &probe.discovered_links).await?;
        }

        Ok(())
    }

    async fn handle_crawl_error(
        &self,
        worker_id: &str,
        domain: &Domain,
        task: Task,
        err: crate::error::CrawlError,
    ) -> StoreResult<()> {
        self.fail_task(worker_id, domain, task, &err.to_string(), err.is_retryable()).await
    }

    async fn fail_task(
        &self,
        worker_id: &str,
        domain: &Domain,
        task: Task,
        error: &str,
        retryable: bool,
    ) -> StoreResult<()> {
        let will_bump_adaptive_delay =
            error.contains("429") || error.contains(&CrawlErrorKind::Http5xx.to_string());
        if will_bump_adaptive_delay {
            let bumped = (domain.adaptive_delay_seconds + 1).min(Domain::MAX_ADAPTIVE_DELAY_SECONDS);
            self.store.set_adaptive_delay(domain.id, bumped).await?;
        }

        let retry_count_before = task.retry_count;
        self.queue.fail(task.id, worker_id, error, retryable, retry_count_before).await?;

        if !retryable || retries_exhausted(retry_count_before + 1) {
            self.job_manager.on_task_terminal(task.job_id, TerminalField::Failed).await?;
        }

        Ok(())
    }

    /// §4.3 step 6: enqueue freshly discovered same-domain links, subject to
    /// `max_pages` and the job's include/exclude filters.
    async fn enqueue_discovered(&self, job: &Job, domain: &Domain, links: &[String]) -> StoreResult<()> {
        if job.max_pages > 0 {
            let pending = self.queue.count_pending(job.id).await?;
            if pending + job.total_tasks >= job.max_pages as i64 {
                return Ok(());
            }
        }

        let (include_paths, exclude_paths) = scheduler_path_filters(self.store.as_ref(), job).await?;

        for link in links {
            let Ok(parsed) = url::Url::parse(link) else { continue };
            let path = normalise_path(parsed.path());

            if !include_paths.is_empty() && !include_paths.iter().any(|pat| glob_match(pat, &path)) {
                continue;
            }
            if exclude_paths.iter().any(|pat| glob_match(pat, &path)) {
                continue;
            }

            let page_id = self.queue.store_page(domain.id, &path, Task::SEED_PRIORITY).await?;
            let applied = self
                .queue
                .enqueue(job.id, page_id, Some("discovered"), Some(link), Task::SEED_PRIORITY)
                .await?;
            if applied {
                self.store.increment_job_total_tasks(job.id, 1).await?;
            }
        }

        Ok(())
    }
}

/// Best-effort recovery of the include/exclude filters a job was created
/// with. The Job entity itself (§3) carries no such fields — they live on
/// the Scheduler that spawned it, if any; ad-hoc jobs have none.
async fn scheduler_path_filters(store: &dyn EngineStore, job: &Job) -> StoreResult<(Vec<String>, Vec<String>)> {
    let Some(scheduler_id) = job.scheduler_id else {
        return Ok((Vec::new(), Vec::new()));
    };
    let scheduler = store.get_scheduler(scheduler_id).await?;
    Ok((scheduler.include_paths, scheduler.exclude_paths))
}
