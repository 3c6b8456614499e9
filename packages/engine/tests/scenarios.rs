//! End-to-end scenarios from the engine's own invariant list: a job created
//! through [`JobManager`] and driven entirely by in-memory fakes
//! ([`MemoryStore`], [`InMemoryFetcher`]) through to completion, exercising
//! the Worker Pool, Scheduler Loop, Reaper and Quota Service together
//! instead of in isolation. No live database or network is involved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use engine::crawler::Crawler;
use engine::domain::{JobStatus, Scheduler, TaskStatus};
use engine::error::EngineError;
use engine::fetcher::memory::InMemoryFetcher;
use engine::fetcher::FetchedPage;
use engine::ids::SchedulerId;
use engine::job_manager::{CreateJobOptions, JobManager};
use engine::quota::QuotaService;
use engine::queue::TaskQueue;
use engine::reaper::Reaper;
use engine::scheduler::SchedulerLoop;
use engine::seed_loader::{SeedLoader, SeedLoaderConfig};
use engine::storage::memory::MemoryStore;
use engine::storage::EngineStore;
use engine::worker::{WorkerPool, WorkerPoolConfig};

fn xml_page(body: &str) -> FetchedPage {
    FetchedPage {
        status_code: 200,
        final_url: String::new(),
        content_type: Some("application/xml".to_string()),
        cache_status: None,
        body: body.to_string(),
        response_time_ms: 5,
    }
}

fn html_page(url: &str, cache_status: &str) -> FetchedPage {
    FetchedPage {
        status_code: 200,
        final_url: url.to_string(),
        content_type: Some("text/html; charset=utf-8".to_string()),
        cache_status: Some(cache_status.to_string()),
        body: "<html><body>warmed</body></html>".to_string(),
        response_time_ms: 20,
    }
}

/// Builds a full, wired-up set of engine components sharing one
/// [`MemoryStore`] and one [`InMemoryFetcher`], the way `bin/server.rs`
/// wires the real Postgres/reqwest implementations.
struct Harness {
    store: Arc<dyn EngineStore>,
    fetcher: Arc<InMemoryFetcher>,
    job_manager: Arc<JobManager>,
    queue: TaskQueue,
    quota: QuotaService,
    crawler: Arc<Crawler>,
}

impl Harness {
    fn new() -> Self {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(InMemoryFetcher::new());
        let queue = TaskQueue::new(store.clone());
        let quota = QuotaService::new(store.clone());
        let seed_loader = SeedLoader::new(fetcher.clone(), queue.clone(), SeedLoaderConfig::default());
        let job_manager = Arc::new(JobManager::new(store.clone(), queue.clone(), quota.clone(), seed_loader));
        let crawler = Arc::new(Crawler::new(fetcher.clone()));
        Self { store, fetcher, job_manager, queue, quota, crawler }
    }

    fn worker_pool(&self, config: WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            self.queue.clone(),
            self.job_manager.clone(),
            self.quota.clone(),
            self.crawler.clone(),
            config,
        )
    }

    /// Polls `get_job_status` until `predicate` holds or `timeout` elapses.
    async fn wait_for(
        &self,
        job_id: engine::ids::JobId,
        timeout: Duration,
        predicate: impl Fn(&engine::domain::Job) -> bool,
    ) -> engine::domain::Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job_manager.get_job_status(job_id).await.unwrap();
            if predicate(&job) {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for job {job_id} to satisfy predicate, last state: {job:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn fast_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        global_workers: 4,
        probe_timeout: Duration::from_secs(5),
        default_domain_concurrency: 20,
        daily_quota: engine::job_manager::DEFAULT_DAILY_QUOTA,
        idle_backoff: Duration::from_millis(5),
    }
}

/// S1: a sitemap-seeded job runs every discovered page through the Worker
/// Pool and reaches `completed` with no pages left pending.
#[tokio::test]
async fn s1_sitemap_job_completes_fully() {
    let harness = Harness::new();
    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_page(
        "https://example.com/sitemap.xml",
        xml_page(
            r#"<?xml version="1.0"?>
            <urlset>
                <url><loc>https://example.com/</loc></url>
                <url><loc>https://example.com/about</loc></url>
                <url><loc>https://example.com/contact</loc></url>
            </urlset>"#,
        ),
    );
    for path in ["/", "/about", "/contact"] {
        let url = format!("https://example.com{path}");
        harness.fetcher.register_page(&url, html_page(&url, "HIT"));
    }

    let job = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            find_links: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job.total_tasks, 3);

    let pool = harness.worker_pool(fast_pool_config());
    let shutdown = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let settled = harness.wait_for(job.id, Duration::from_secs(5), |j| j.status.is_terminal()).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(settled.status, JobStatus::Completed);
    assert_eq!(settled.completed_tasks, 3);
    assert_eq!(settled.failed_tasks, 0);
    assert!((settled.progress() - 1.0).abs() < f64::EPSILON);
}

/// S2: a worker leases a task and then "crashes" (never completes it). The
/// Reaper reclaims the expired lease and the job still reaches `completed`
/// without the task being double-counted.
#[tokio::test]
async fn s2_crashed_worker_lease_is_reaped_and_job_completes_once() {
    let harness = Harness::new();
    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap.xml", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap_index.xml", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_page("https://example.com/", html_page("https://example.com/", "HIT"));

    let job = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            find_links: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job.total_tasks, 1);

    // A worker leases the task with a lease that is already expired (a dead
    // process never extends or completes it) — simulating a crash mid-work.
    let leased = harness.queue.lease("dead-worker", None, 1, chrono::Duration::seconds(-1)).await.unwrap();
    assert_eq!(leased.len(), 1);

    let reaper = Reaper::new(harness.store.clone(), harness.queue.clone(), harness.job_manager.clone());
    let outcome = harness.queue.reap_expired().await.unwrap();
    assert_eq!(outcome.reclaimed, 1);
    assert!(outcome.newly_failed_job_ids.is_empty());
    drop(reaper);

    let pool = harness.worker_pool(fast_pool_config());
    let shutdown = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let settled = harness.wait_for(job.id, Duration::from_secs(5), |j| j.status.is_terminal()).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(settled.status, JobStatus::Completed);
    assert_eq!(settled.completed_tasks, 1);

    let tasks = harness.store.list_tasks(job.id, None, None, None, 10, 0).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

/// S2b: a task orphaned by a dying worker over and over exhausts its
/// retries and becomes `failed` rather than looping as `pending` forever;
/// the job's `failed_tasks` counter is reconciled and the job settles.
#[tokio::test]
async fn s2b_repeated_lease_loss_exhausts_retries_and_fails_task() {
    let harness = Harness::new();
    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap.xml", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap_index.xml", engine::error::CrawlErrorKind::Http4xx);

    let job = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            find_links: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job.total_tasks, 1);

    for _ in 0..engine::domain::Task::MAX_RETRIES {
        let leased = harness.queue.lease("dead-worker", None, 1, chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(leased.len(), 1);

        let outcome = harness.queue.reap_expired().await.unwrap();
        assert_eq!(outcome.reclaimed, 1);
        for failed_job_id in outcome.newly_failed_job_ids {
            harness.job_manager.on_task_terminal(failed_job_id, engine::storage::TerminalField::Failed).await.unwrap();
        }
    }

    let tasks = harness.store.list_tasks(job.id, None, None, None, 10, 0).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].retry_count, engine::domain::Task::MAX_RETRIES);

    let settled = harness.store.get_job(job.id).await.unwrap();
    assert_eq!(settled.failed_tasks, 1);
    assert!(settled.status.is_terminal());
}

/// S3: the organisation's daily quota is exhausted mid-job. The job fails
/// and the remaining pending tasks are never executed.
#[tokio::test]
async fn s3_quota_exhaustion_fails_job_and_skips_remainder() {
    let harness = Harness::new();
    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_page(
        "https://example.com/sitemap.xml",
        xml_page(
            r#"<?xml version="1.0"?>
            <urlset>
                <url><loc>https://example.com/a</loc></url>
                <url><loc>https://example.com/b</loc></url>
                <url><loc>https://example.com/c</loc></url>
            </urlset>"#,
        ),
    );
    for path in ["/a", "/b", "/c"] {
        let url = format!("https://example.com{path}");
        harness.fetcher.register_page(&url, html_page(&url, "HIT"));
    }

    let org_id = Uuid::now_v7();
    let job = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: org_id,
            find_links: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job.total_tasks, 3);

    // A daily quota of 1 means the very first completed task in this job
    // already exceeds it (§4.8, §9 Open Question 2).
    let mut config = fast_pool_config();
    config.daily_quota = 1;
    let pool = harness.worker_pool(config);
    let shutdown = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let settled = harness.wait_for(job.id, Duration::from_secs(5), |j| j.status.is_terminal()).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(settled.status, JobStatus::Failed);
    assert_eq!(settled.stats["quota_exceeded"], serde_json::Value::Bool(true));
    // The job fails once some task's completion crosses the quota boundary;
    // whichever task is in flight when that happens, the remainder never run.
    assert!(settled.completed_tasks < settled.total_tasks);
}

/// S4: analytics reprioritisation promotes a page's priority_score, so the
/// next lease picks it ahead of an equally-old, lower-priority peer.
#[tokio::test]
async fn s4_analytics_reprioritisation_wins_next_lease() {
    use engine::analytics::{AnalyticsService, AnalyticsSource, PageViewSample};
    use async_trait::async_trait;

    struct FixedSource {
        samples: Vec<PageViewSample>,
    }

    #[async_trait]
    impl AnalyticsSource for FixedSource {
        async fn fetch_page_views(
            &self,
            _organisation_id: Uuid,
            _domain_id: i64,
            offset: i64,
            limit: i64,
        ) -> anyhow::Result<Vec<PageViewSample>> {
            let start = offset.max(0) as usize;
            Ok(self.samples.iter().skip(start).take(limit as usize).cloned().collect())
        }
    }

    let harness = Harness::new();
    let domain = harness.store.upsert_domain("example.com").await.unwrap();
    let low = harness.store.upsert_page(domain.id, "/low", 0.5).await.unwrap();
    let high = harness.store.upsert_page(domain.id, "/trending", 0.5).await.unwrap();

    let org_id = Uuid::now_v7();
    let job = engine::domain::Job {
        id: engine::ids::JobId::new(),
        organisation_id: org_id,
        domain_id: domain.id,
        status: JobStatus::Running,
        total_tasks: 2,
        completed_tasks: 0,
        failed_tasks: 0,
        skipped_tasks: 0,
        concurrency: 20,
        max_pages: 0,
        find_links: false,
        use_sitemap: false,
        source_type: engine::domain::SourceType::Dashboard,
        source_detail: None,
        source_info: serde_json::json!({}),
        scheduler_id: None,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        completed_at: None,
        stats: serde_json::json!({}),
    };
    let job = harness.store.insert_job(job).await.unwrap();
    // Both enqueued at the same priority, `/low` first so it would win a
    // plain created_at-ASC tiebreak absent reprioritisation.
    harness.store.enqueue_task(job.id, low.id, Some("root"), None, 0.5).await.unwrap();
    harness.store.enqueue_task(job.id, high.id, Some("root"), None, 0.5).await.unwrap();

    let source = Arc::new(FixedSource {
        samples: vec![PageViewSample { path: "/trending".to_string(), views_7d: 5000, views_28d: 9000, views_180d: 20000 }],
    });
    let analytics = AnalyticsService::new(harness.store.clone(), source);
    analytics.ingest_for_domain(org_id, domain.id).await.unwrap();

    let leased = harness.queue.lease("worker-0", Some(domain.id), 1, chrono::Duration::seconds(60)).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].page_id, high.id, "the reprioritised page must be leased first");
}

/// S5: two scheduler ticks race on the same due scheduler. Exactly one of
/// them wins the conditional advance and materialises a job.
#[tokio::test]
async fn s5_concurrent_scheduler_ticks_produce_exactly_one_job() {
    let harness = Harness::new();
    let domain = harness.store.upsert_domain("example.com").await.unwrap();
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
    harness.store.upsert_scheduler(scheduler.clone()).await.unwrap();

    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap.xml", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_error("https://example.com/sitemap_index.xml", engine::error::CrawlErrorKind::Http4xx);

    let loop_a = SchedulerLoop::new(harness.store.clone(), harness.job_manager.clone());
    let loop_b = SchedulerLoop::new(harness.store.clone(), harness.job_manager.clone());

    let (a, b) = tokio::join!(loop_a.tick(), loop_b.tick());
    let materialised = a.unwrap() + b.unwrap();
    assert_eq!(materialised, 1, "exactly one of the two racing ticks should materialise a job");

    let jobs = harness.store.jobs_in_status(JobStatus::Running).await.unwrap();
    assert_eq!(jobs.len(), 1);
}

/// S6: cancelling a job mid-run skips every still-pending task but leaves a
/// task that is already leased to run to completion.
#[tokio::test]
async fn s6_cancel_mid_run_skips_pending_but_lets_running_task_finish() {
    let harness = Harness::new();
    harness.fetcher.register_error("https://example.com/robots.txt", engine::error::CrawlErrorKind::Http4xx);
    harness.fetcher.register_page(
        "https://example.com/sitemap.xml",
        xml_page(
            r#"<?xml version="1.0"?>
            <urlset>
                <url><loc>https://example.com/a</loc></url>
                <url><loc>https://example.com/b</loc></url>
            </urlset>"#,
        ),
    );
    harness.fetcher.register_page("https://example.com/a", html_page("https://example.com/a", "HIT"));
    harness.fetcher.register_page("https://example.com/b", html_page("https://example.com/b", "HIT"));

    let job = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "example.com".to_string(),
            organisation_id: Uuid::now_v7(),
            find_links: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job.total_tasks, 2);

    // Lease one task directly (standing in for "already claimed by a
    // worker, in flight") without completing it yet.
    let leased = harness.queue.lease("worker-0", None, 1, chrono::Duration::seconds(60)).await.unwrap();
    assert_eq!(leased.len(), 1);
    let running_task = leased[0].clone();

    let skipped = harness.job_manager.cancel_job(job.id).await.unwrap();
    assert_eq!(skipped, 1, "only the still-pending task is skipped");

    // The in-flight task is unaffected by cancellation and can still be
    // completed normally (§4.1 "non-preemptive cancel").
    let completed = harness
        .queue
        .complete(
            running_task.id,
            "worker-0",
            engine::storage::TaskCompletion {
                status_code: Some(200),
                response_time_ms: Some(10),
                cache_status: Some("HIT".to_string()),
                second_response_time_ms: None,
                second_cache_status: None,
                content_type: Some("text/html".to_string()),
            },
        )
        .await
        .unwrap();
    assert!(completed);

    let tasks = harness.store.list_tasks(job.id, None, None, None, 10, 0).await.unwrap();
    let skipped_count = tasks.iter().filter(|t| t.status == TaskStatus::Skipped).count();
    let completed_count = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
    assert_eq!(skipped_count, 1);
    assert_eq!(completed_count, 1);

    let job = harness.job_manager.get_job_status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

/// Sanity check that the harness itself correctly surfaces an invalid
/// domain before anything touches the queue (guards the other scenarios
/// from silently degrading into no-ops on a typo).
#[tokio::test]
async fn invalid_domain_is_rejected_before_seeding() {
    let harness = Harness::new();
    let result = harness
        .job_manager
        .create_job(CreateJobOptions {
            domain: "".to_string(),
            organisation_id: Uuid::now_v7(),
            use_sitemap: false,
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}
