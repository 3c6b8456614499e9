use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Domain, Job, JobStatus, Page, PageViewFeedEntry, QuotaCounter, Scheduler, Task, TaskStatus};
use crate::error::EngineError;
use crate::ids::{JobId, SchedulerId, ShareTokenId, TaskId};

use super::{ConditionalOutcome, EngineStore, ReapOutcome, StoreResult, TaskCompletion, TerminalField};

/// In-memory fake of [`EngineStore`], grounded on `intelligent-crawler`'s
/// `MockStorage` test double (`std::sync::Mutex<HashMap<...>>` backing
/// store). Used by the engine's own `#[tokio::test]` suite so the
/// lease/complete/fail/reap invariants (§8) are exercised without a live
/// database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    domains: HashMap<i64, Domain>,
    domains_by_name: HashMap<String, i64>,
    next_domain_id: i64,
    pages: HashMap<i64, Page>,
    pages_by_key: HashMap<(i64, String), i64>,
    next_page_id: i64,
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    tasks_by_job_page: HashMap<(Uuid, i64), Uuid>,
    schedulers: HashMap<Uuid, Scheduler>,
    page_views: HashMap<(Uuid, i64, String), PageViewFeedEntry>,
    quota: HashMap<(Uuid, chrono::NaiveDate), i64>,
    share_links: HashMap<Uuid, (JobId, Option<DateTime<Utc>>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn upsert_domain(&self, name: &str) -> StoreResult<Domain> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.domains_by_name.get(name) {
            return Ok(inner.domains[&id].clone());
        }
        inner.next_domain_id += 1;
        let id = inner.next_domain_id;
        let domain = Domain {
            id,
            name: name.to_string(),
            crawl_delay_seconds: None,
            adaptive_delay_seconds: 0,
        };
        inner.domains_by_name.insert(name.to_string(), id);
        inner.domains.insert(id, domain.clone());
        Ok(domain)
    }

    async fn get_domain(&self, domain_id: i64) -> StoreResult<Domain> {
        let inner = self.inner.lock().unwrap();
        inner
            .domains
            .get(&domain_id)
            .cloned()
            .ok_or(EngineError::NotFound { entity: "domain", id: Uuid::nil() })
    }

    async fn set_adaptive_delay(&self, domain_id: i64, adaptive_delay_seconds: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(domain) = inner.domains.get_mut(&domain_id) {
            domain.adaptive_delay_seconds = adaptive_delay_seconds;
        }
        Ok(())
    }

    async fn upsert_page(&self, domain_id: i64, path: &str, priority: f64) -> StoreResult<Page> {
        let mut inner = self.inner.lock().unwrap();
        let key = (domain_id, path.to_string());
        if let Some(&id) = inner.pages_by_key.get(&key) {
            return Ok(inner.pages[&id].clone());
        }
        inner.next_page_id += 1;
        let id = inner.next_page_id;
        let page = Page { id, domain_id, path: path.to_string(), priority };
        inner.pages_by_key.insert(key, id);
        inner.pages.insert(id, page.clone());
        Ok(page)
    }

    async fn get_page(&self, page_id: i64) -> StoreResult<Page> {
        let inner = self.inner.lock().unwrap();
        inner.pages.get(&page_id).cloned().ok_or(EngineError::NotFound {
            entity: "page",
            id: Uuid::nil(),
        })
    }

    async fn insert_job(&self, job: Job) -> StoreResult<Job> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.id.0, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&job_id.0).cloned().ok_or(EngineError::NotFound { entity: "job", id: job_id.0 })
    }

    async fn list_jobs(
        &self,
        organisation_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.organisation_id == organisation_id)
            .filter(|j| status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn set_job_running(&self, job_id: JobId, total_tasks: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.total_tasks = total_tasks;
        }
        Ok(())
    }

    async fn increment_job_total_tasks(&self, job_id: JobId, delta: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.total_tasks += delta;
        }
        Ok(())
    }

    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.status = status;
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_job_status_if(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
    ) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            if job.status == expected {
                job.status = new_status;
                job.completed_at = Some(Utc::now());
                return Ok(ConditionalOutcome::Applied);
            }
        }
        Ok(ConditionalOutcome::NoMatch)
    }

    async fn bump_job_counter(&self, job_id: JobId, field: TerminalField) -> StoreResult<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.jobs.get_mut(&job_id.0).ok_or(EngineError::NotFound { entity: "job", id: job_id.0 })?;
        match field {
            TerminalField::Completed => job.completed_tasks += 1,
            TerminalField::Failed => job.failed_tasks += 1,
            TerminalField::Skipped => job.skipped_tasks += 1,
        }
        Ok(job.clone())
    }

    async fn cancel_job(&self, job_id: JobId) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        let mut skipped = 0u64;
        for task in inner.tasks.values_mut() {
            if task.job_id.0 == job_id.0 && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Skipped;
                skipped += 1;
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.skipped_tasks += skipped as i64;
        }
        Ok(skipped)
    }

    async fn record_job_stat(&self, job_id: JobId, key: &str, value: serde_json::Value) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            if let serde_json::Value::Object(map) = &mut job.stats {
                map.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    async fn recompute_job_counters(&self, job_id: JobId) -> StoreResult<Job> {
        let mut inner = self.inner.lock().unwrap();
        let (completed, failed, skipped) = {
            let mut c = 0;
            let mut f = 0;
            let mut s = 0;
            for task in inner.tasks.values() {
                if task.job_id.0 != job_id.0 {
                    continue;
                }
                match task.status {
                    TaskStatus::Completed => c += 1,
                    TaskStatus::Failed => f += 1,
                    TaskStatus::Skipped => s += 1,
                    _ => {}
                }
            }
            (c, f, s)
        };
        let job = inner.jobs.get_mut(&job_id.0).ok_or(EngineError::NotFound { entity: "job", id: job_id.0 })?;
        job.completed_tasks = completed;
        job.failed_tasks = failed;
        job.skipped_tasks = skipped;
        Ok(job.clone())
    }

    async fn jobs_in_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.values().filter(|j| j.status == status).cloned().collect())
    }

    async fn enqueue_task(
        &self,
        job_id: JobId,
        page_id: i64,
        source_type: Option<&str>,
        source_url: Option<&str>,
        priority_score: f64,
    ) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let key = (job_id.0, page_id);
        if inner.tasks_by_job_page.contains_key(&key) {
            return Ok(ConditionalOutcome::NoMatch);
        }
        let id = Uuid::now_v7();
        let task = Task {
            id: TaskId(id),
            job_id,
            page_id,
            status: TaskStatus::Pending,
            retry_count: 0,
            status_code: None,
            response_time_ms: None,
            cache_status: None,
            second_response_time_ms: None,
            second_cache_status: None,
            content_type: None,
            error: None,
            source_type: source_type.map(|s| s.to_string()),
            source_url: source_url.map(|s| s.to_string()),
            priority_score,
            lease_owner: None,
            lease_expires_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_eligible_at: None,
        };
        inner.tasks_by_job_page.insert(key, id);
        inner.tasks.insert(id, task);
        Ok(ConditionalOutcome::Applied)
    }

    async fn lease_tasks(
        &self,
        worker_id: &str,
        domain_filter: Option<i64>,
        batch_size: i64,
        lease_duration: chrono::Duration,
    ) -> StoreResult<Vec<Task>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut candidate_ids: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.next_eligible_at.map(|at| at <= now).unwrap_or(true))
            .filter(|t| match domain_filter {
                Some(domain_id) => inner
                    .pages
                    .get(&t.page_id)
                    .map(|p| p.domain_id == domain_id)
                    .unwrap_or(false),
                None => true,
            })
            .map(|t| t.id.0)
            .collect();

        candidate_ids.sort_by(|a, b| {
            let ta = &inner.tasks[a];
            let tb = &inner.tasks[b];
            tb.priority_score
                .partial_cmp(&ta.priority_score)
                .unwrap()
                .then(ta.created_at.cmp(&tb.created_at))
        });
        candidate_ids.truncate(batch_size.max(0) as usize);

        let mut leased = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let task = inner.tasks.get_mut(&id).unwrap();
            task.status = TaskStatus::Running;
            task.lease_owner = Some(worker_id.to_string());
            task.lease_expires_at = Some(now + lease_duration);
            task.started_at = Some(now);
            leased.push(task.clone());
        }
        Ok(leased)
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        completion: TaskCompletion,
    ) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&task_id.0) else {
            return Ok(ConditionalOutcome::NoMatch);
        };
        if task.status != TaskStatus::Running || task.lease_owner.as_deref() != Some(worker_id) {
            return Ok(ConditionalOutcome::NoMatch);
        }
        task.status = TaskStatus::Completed;
        task.status_code = completion.status_code;
        task.response_time_ms = completion.response_time_ms;
        task.cache_status = completion.cache_status;
        task.second_response_time_ms = completion.second_response_time_ms;
        task.second_cache_status = completion.second_cache_status;
        task.content_type = completion.content_type;
        task.completed_at = Some(Utc::now());
        task.lease_owner = None;
        task.lease_expires_at = None;
        Ok(ConditionalOutcome::Applied)
    }

    async fn fail_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
        next_earliest_run: Option<DateTime<Utc>>,
    ) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&task_id.0) else {
            return Ok(ConditionalOutcome::NoMatch);
        };
        if task.status != TaskStatus::Running || task.lease_owner.as_deref() != Some(worker_id) {
            return Ok(ConditionalOutcome::NoMatch);
        }
        task.error = Some(error.to_string());
        task.lease_owner = None;
        task.lease_expires_at = None;
        if retryable {
            task.retry_count += 1;
            if task.retry_count >= Task::MAX_RETRIES {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
            } else {
                task.status = TaskStatus::Pending;
                task.next_eligible_at = next_earliest_run;
            }
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
        }
        Ok(ConditionalOutcome::Applied)
    }

    async fn skip_task(&self, task_id: TaskId, reason: &str) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&task_id.0) else {
            return Ok(ConditionalOutcome::NoMatch);
        };
        if task.status == TaskStatus::Skipped {
            return Ok(ConditionalOutcome::NoMatch);
        }
        task.status = TaskStatus::Skipped;
        task.error = Some(reason.to_string());
        task.completed_at = Some(Utc::now());
        Ok(ConditionalOutcome::Applied)
    }

    async fn skip_pending_tasks_for_job(&self, job_id: JobId) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0u64;
        for task in inner.tasks.values_mut() {
            if task.job_id.0 == job_id.0 && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Skipped;
                count += 1;
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id.0) {
            job.skipped_tasks += count as i64;
        }
        Ok(count)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<ReapOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let mut reclaimed = 0u64;
        let mut newly_failed_job_ids = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                if let Some(expires) = task.lease_expires_at {
                    if expires < now {
                        task.lease_owner = None;
                        task.lease_expires_at = None;
                        task.retry_count += 1;
                        if task.retry_count >= Task::MAX_RETRIES {
                            task.status = TaskStatus::Failed;
                            task.completed_at = Some(Utc::now());
                            newly_failed_job_ids.push(task.job_id);
                        } else {
                            task.status = TaskStatus::Pending;
                        }
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(ReapOutcome { reclaimed, newly_failed_job_ids })
    }

    async fn count_pending_tasks(&self, job_id: JobId) -> StoreResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.job_id.0 == job_id.0 && t.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn list_tasks(
        &self,
        job_id: JobId,
        status: Option<&str>,
        cache: Option<&str>,
        path: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.job_id.0 == job_id.0)
            .filter(|t| status.map(|s| format!("{:?}", t.status).to_lowercase() == s).unwrap_or(true))
            .filter(|t| {
                cache
                    .map(|c| t.cache_status.as_deref().map(|cs| cs.to_lowercase().starts_with(&c.to_lowercase())).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter(|t| {
                path.map(|p| {
                    inner
                        .pages
                        .get(&t.page_id)
                        .map(|pg| pg.path.contains(p))
                        .unwrap_or(false)
                })
                .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn reprioritise_pending(
        &self,
        job_ids: &[JobId],
        page_id: i64,
        new_priority: f64,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<Uuid> = job_ids.iter().map(|j| j.0).collect();
        let mut count = 0u64;
        for task in inner.tasks.values_mut() {
            if ids.contains(&task.job_id.0) && task.page_id == page_id && task.status == TaskStatus::Pending {
                task.priority_score = new_priority;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn upsert_scheduler(&self, scheduler: Scheduler) -> StoreResult<Scheduler> {
        let mut inner = self.inner.lock().unwrap();
        inner.schedulers.insert(scheduler.id.0, scheduler.clone());
        Ok(scheduler)
    }

    async fn get_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<Scheduler> {
        let inner = self.inner.lock().unwrap();
        inner
            .schedulers
            .get(&scheduler_id.0)
            .cloned()
            .ok_or(EngineError::NotFound { entity: "scheduler", id: scheduler_id.0 })
    }

    async fn list_schedulers(&self, organisation_id: Uuid) -> StoreResult<Vec<Scheduler>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.schedulers.values().filter(|s| s.organisation_id == organisation_id).cloned().collect())
    }

    async fn delete_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.schedulers.remove(&scheduler_id.0);
        Ok(())
    }

    async fn due_schedulers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Scheduler>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schedulers
            .values()
            .filter(|s| s.is_enabled && s.next_run_at <= now)
            .cloned()
            .collect())
    }

    async fn advance_scheduler_if(
        &self,
        scheduler_id: SchedulerId,
        expected_next_run_at: DateTime<Utc>,
        new_next_run_at: DateTime<Utc>,
    ) -> StoreResult<ConditionalOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(scheduler) = inner.schedulers.get_mut(&scheduler_id.0) {
            if scheduler.next_run_at == expected_next_run_at {
                scheduler.next_run_at = new_next_run_at;
                return Ok(ConditionalOutcome::Applied);
            }
        }
        Ok(ConditionalOutcome::NoMatch)
    }

    async fn scheduler_has_running_job(&self, scheduler_id: SchedulerId) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .any(|j| j.scheduler_id.map(|s| s.0) == Some(scheduler_id.0) && j.status == JobStatus::Running))
    }

    async fn upsert_page_view_entry(&self, entry: PageViewFeedEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (entry.organisation_id, entry.domain_id, entry.path.clone());
        inner.page_views.insert(key, entry);
        Ok(())
    }

    async fn running_job_ids_for_domain(&self, domain_id: i64) -> StoreResult<Vec<JobId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.domain_id == domain_id && j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect())
    }

    async fn quota_remaining(&self, organisation_id: Uuid, limit: i64) -> StoreResult<i64> {
        let inner = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        let used = inner.quota.get(&(organisation_id, today)).copied().unwrap_or(0);
        Ok((limit - used).max(0))
    }

    async fn increment_quota(&self, organisation_id: Uuid) -> StoreResult<QuotaCounter> {
        let mut inner = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        let entry = inner.quota.entry((organisation_id, today)).or_insert(0);
        *entry += 1;
        Ok(QuotaCounter { organisation_id, date: today, pages_used: *entry })
    }

    async fn create_share_link(
        &self,
        token_id: ShareTokenId,
        job_id: JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.share_links.insert(token_id.0, (job_id, expires_at));
        Ok(())
    }

    async fn resolve_share_link(&self, token_id: ShareTokenId) -> StoreResult<JobId> {
        let inner = self.inner.lock().unwrap();
        let (job_id, expires_at) = inner
            .share_links
            .get(&token_id.0)
            .ok_or(EngineError::NotFound { entity: "share_link", id: token_id.0 })?;
        if let Some(expires_at) = expires_at {
            if *expires_at < Utc::now() {
                return Err(EngineError::NotFound { entity: "share_link", id: token_id.0 });
            }
        }
        Ok(*job_id)
    }
}
