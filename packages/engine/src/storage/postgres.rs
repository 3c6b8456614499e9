use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{Domain, Job, JobStatus, Page, PageViewFeedEntry, QuotaCounter, Scheduler, SourceType, Task, TaskStatus};
use crate::error::EngineError;
use crate::ids::{JobId, SchedulerId, ShareTokenId, TaskId};

use super::{ConditionalOutcome, EngineStore, ReapOutcome, StoreResult, TaskCompletion, TerminalField};

/// Postgres-backed implementation of [`EngineStore`]. Leasing follows
/// `kernel::jobs::job::Job::claim_jobs`'s `WITH ... FOR UPDATE SKIP LOCKED`
/// CTE shape almost verbatim, generalized with an optional domain filter
/// and the spec's `priority_score DESC, created_at ASC` ordering (§4.2).
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_task(row: sqlx::postgres::PgRow) -> Task {
    Task {
        id: TaskId(row.get("id")),
        job_id: JobId(row.get("job_id")),
        page_id: row.get("page_id"),
        status: row.get("status"),
        retry_count: row.get("retry_count"),
        status_code: row.get("status_code"),
        response_time_ms: row.get("response_time_ms"),
        cache_status: row.get("cache_status"),
        second_response_time_ms: row.get("second_response_time_ms"),
        second_cache_status: row.get("second_cache_status"),
        content_type: row.get("content_type"),
        error: row.get("error"),
        source_type: row.get("source_type"),
        source_url: row.get("source_url"),
        priority_score: row.get("priority_score"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        next_eligible_at: row.get("next_eligible_at"),
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Job {
    Job {
        id: JobId(row.get("id")),
        organisation_id: row.get("organisation_id"),
        domain_id: row.get("domain_id"),
        status: row.get("status"),
        total_tasks: row.get("total_tasks"),
        completed_tasks: row.get("completed_tasks"),
        failed_tasks: row.get("failed_tasks"),
        skipped_tasks: row.get("skipped_tasks"),
        concurrency: row.get("concurrency"),
        max_pages: row.get("max_pages"),
        find_links: row.get("find_links"),
        use_sitemap: row.get("use_sitemap"),
        source_type: row.get("source_type"),
        source_detail: row.get("source_detail"),
        source_info: row.get("source_info"),
        scheduler_id: row.get::<Option<Uuid>, _>("scheduler_id").map(SchedulerId),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        stats: row.get("stats"),
    }
}

#[async_trait]
impl EngineStore for PostgresStore {
    async fn upsert_domain(&self, name: &str) -> StoreResult<Domain> {
        let row = sqlx::query(
            r#"
            INSERT INTO domains (name, adaptive_delay_seconds)
            VALUES ($1, 0)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, crawl_delay_seconds, adaptive_delay_seconds
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Domain {
            id: row.get("id"),
            name: row.get("name"),
            crawl_delay_seconds: row.get("crawl_delay_seconds"),
            adaptive_delay_seconds: row.get("adaptive_delay_seconds"),
        })
    }

    async fn get_domain(&self, domain_id: i64) -> StoreResult<Domain> {
        let row = sqlx::query(
            "SELECT id, name, crawl_delay_seconds, adaptive_delay_seconds FROM domains WHERE id = $1",
        )
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound { entity: "domain", id: Uuid::nil() })?;

        Ok(Domain {
            id: row.get("id"),
            name: row.get("name"),
            crawl_delay_seconds: row.get("crawl_delay_seconds"),
            adaptive_delay_seconds: row.get("adaptive_delay_seconds"),
        })
    }

    async fn set_adaptive_delay(&self, domain_id: i64, adaptive_delay_seconds: i32) -> StoreResult<()> {
        sqlx::query("UPDATE domains SET adaptive_delay_seconds = $2 WHERE id = $1")
            .bind(domain_id)
            .bind(adaptive_delay_seconds)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_page(&self, domain_id: i64, path: &str, priority: f64) -> StoreResult<Page> {
        let row = sqlx::query(
            r#"
            INSERT INTO pages (domain_id, path, priority)
            VALUES ($1, $2, $3)
            ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING id, domain_id, path, priority
            "#,
        )
        .bind(domain_id)
        .bind(path)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page {
            id: row.get("id"),
            domain_id: row.get("domain_id"),
            path: row.get("path"),
            priority: row.get("priority"),
        })
    }

    async fn get_page(&self, page_id: i64) -> StoreResult<Page> {
        let row = sqlx::query("SELECT id, domain_id, path, priority FROM pages WHERE id = $1")
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound { entity: "page", id: Uuid::nil() })?;

        Ok(Page {
            id: row.get("id"),
            domain_id: row.get("domain_id"),
            path: row.get("path"),
            priority: row.get("priority"),
        })
    }

    async fn insert_job(&self, job: Job) -> StoreResult<Job> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, organisation_id, domain_id, status, total_tasks, completed_tasks,
                failed_tasks, skipped_tasks, concurrency, max_pages, find_links,
                use_sitemap, source_type, source_detail, source_info, scheduler_id,
                created_at, stats
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            RETURNING *
            "#,
        )
        .bind(job.id.0)
        .bind(job.organisation_id)
        .bind(job.domain_id)
        .bind(job.status)
        .bind(job.total_tasks)
        .bind(job.completed_tasks)
        .bind(job.failed_tasks)
        .bind(job.skipped_tasks)
        .bind(job.concurrency)
        .bind(job.max_pages)
        .bind(job.find_links)
        .bind(job.use_sitemap)
        .bind(job.source_type)
        .bind(job.source_detail)
        .bind(job.source_info)
        .bind(job.scheduler_id.map(|s| s.0))
        .bind(job.created_at)
        .bind(job.stats)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_job(row))
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound { entity: "job", id: job_id.0 })?;

        Ok(row_to_job(row))
    }

    async fn list_jobs(
        &self,
        organisation_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE organisation_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organisation_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_job).collect())
    }

    async fn set_job_running(&self, job_id: JobId, total_tasks: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = NOW(), total_tasks = $2 WHERE id = $1",
        )
        .bind(job_id.0)
        .bind(total_tasks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_job_total_tasks(&self, job_id: JobId, delta: i64) -> StoreResult<()> {
        sqlx::query("UPDATE jobs SET total_tasks = total_tasks + $2 WHERE id = $1")
            .bind(job_id.0)
            .bind(delta)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = $2, completed_at = CASE WHEN $2 IN ('completed','failed','cancelled') THEN NOW() ELSE completed_at END WHERE id = $1",
        )
        .bind(job_id.0)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_job_status_if(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
    ) -> StoreResult<ConditionalOutcome> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $3, completed_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(job_id.0)
        .bind(expected)
        .bind(new_status)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    async fn bump_job_counter(&self, job_id: JobId, field: TerminalField) -> StoreResult<Job> {
        let column = match field {
            TerminalField::Completed => "completed_tasks",
            TerminalField::Failed => "failed_tasks",
            TerminalField::Skipped => "skipped_tasks",
        };
        let sql = format!("UPDATE jobs SET {column} = {column} + 1 WHERE id = $1 RETURNING *");
        let row = sqlx::query(&sql).bind(job_id.0).fetch_one(&self.pool).await?;
        Ok(row_to_job(row))
    }

    async fn cancel_job(&self, job_id: JobId) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE jobs SET status = 'cancelled', completed_at = NOW() WHERE id = $1")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await?;

        let skipped = sqlx::query(
            "UPDATE tasks SET status = 'skipped' WHERE job_id = $1 AND status = 'pending'",
        )
        .bind(job_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE jobs SET skipped_tasks = skipped_tasks + $2 WHERE id = $1")
            .bind(job_id.0)
            .bind(skipped as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(skipped)
    }

    async fn record_job_stat(&self, job_id: JobId, key: &str, value: serde_json::Value) -> StoreResult<()> {
        sqlx::query("UPDATE jobs SET stats = jsonb_set(coalesce(stats, '{}'::jsonb), $2, $3, true) WHERE id = $1")
            .bind(job_id.0)
            .bind(vec![key.to_string()])
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recompute_job_counters(&self, job_id: JobId) -> StoreResult<Job> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                completed_tasks = (SELECT count(*) FROM tasks WHERE job_id = $1 AND status = 'completed'),
                failed_tasks = (SELECT count(*) FROM tasks WHERE job_id = $1 AND status = 'failed'),
                skipped_tasks = (SELECT count(*) FROM tasks WHERE job_id = $1 AND status = 'skipped')
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_job(row))
    }

    async fn jobs_in_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = $1")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_job).collect())
    }

    async fn enqueue_task(
        &self,
        job_id: JobId,
        page_id: i64,
        source_type: Option<&str>,
        source_url: Option<&str>,
        priority_score: f64,
    ) -> StoreResult<ConditionalOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, job_id, page_id, status, retry_count, source_type, source_url, priority_score, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, NOW())
            ON CONFLICT (job_id, page_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_id.0)
        .bind(page_id)
        .bind(source_type)
        .bind(source_url)
        .bind(priority_score)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    /// Grounded directly on `Job::claim_jobs`'s CTE: select candidate rows
    /// with `FOR UPDATE SKIP LOCKED`, then `UPDATE ... WHERE id IN (...)`
    /// in the same statement so no other transaction can observe the
    /// candidate set between select and claim.
    async fn lease_tasks(
        &self,
        worker_id: &str,
        domain_filter: Option<i64>,
        batch_size: i64,
        lease_duration: chrono::Duration,
    ) -> StoreResult<Vec<Task>> {
        let lease_ms = lease_duration.num_milliseconds();

        let rows = sqlx::query(
            r#"
            WITH next_tasks AS (
                SELECT t.id FROM tasks t
                JOIN pages p ON p.id = t.page_id
                WHERE t.status = 'pending'
                  AND (t.next_eligible_at IS NULL OR t.next_eligible_at <= NOW())
                  AND ($1::bigint IS NULL OR p.domain_id = $1)
                ORDER BY t.priority_score DESC, t.created_at ASC
                LIMIT $2
                FOR UPDATE OF t SKIP LOCKED
            )
            UPDATE tasks SET
                status = 'running',
                lease_owner = $3,
                lease_expires_at = NOW() + ($4 || ' milliseconds')::interval,
                started_at = NOW()
            WHERE id IN (SELECT id FROM next_tasks)
            RETURNING *
            "#,
        )
        .bind(domain_filter)
        .bind(batch_size)
        .bind(worker_id)
        .bind(lease_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_task).collect())
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        completion: TaskCompletion,
    ) -> StoreResult<ConditionalOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'completed',
                status_code = $3,
                response_time_ms = $4,
                cache_status = $5,
                second_response_time_ms = $6,
                second_cache_status = $7,
                content_type = $8,
                completed_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(task_id.0)
        .bind(worker_id)
        .bind(completion.status_code)
        .bind(completion.response_time_ms)
        .bind(completion.cache_status)
        .bind(completion.second_response_time_ms)
        .bind(completion.second_cache_status)
        .bind(completion.content_type)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    async fn fail_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
        next_earliest_run: Option<DateTime<Utc>>,
    ) -> StoreResult<ConditionalOutcome> {
        let result = if retryable {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    status = CASE WHEN retry_count + 1 >= $4 THEN 'failed' ELSE 'pending' END,
                    retry_count = retry_count + 1,
                    error = $3,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    next_eligible_at = CASE WHEN retry_count + 1 >= $4 THEN next_eligible_at ELSE $5 END
                WHERE id = $1 AND status = 'running' AND lease_owner = $2
                "#,
            )
            .bind(task_id.0)
            .bind(worker_id)
            .bind(error)
            .bind(Task::MAX_RETRIES)
            .bind(next_earliest_run)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    status = 'failed',
                    error = $3,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    completed_at = NOW()
                WHERE id = $1 AND status = 'running' AND lease_owner = $2
                "#,
            )
            .bind(task_id.0)
            .bind(worker_id)
            .bind(error)
            .execute(&self.pool)
            .await?
        };

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    async fn skip_task(&self, task_id: TaskId, reason: &str) -> StoreResult<ConditionalOutcome> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'skipped', error = $2, completed_at = NOW() WHERE id = $1 AND status != 'skipped'",
        )
        .bind(task_id.0)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    async fn skip_pending_tasks_for_job(&self, job_id: JobId) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        let skipped = sqlx::query("UPDATE tasks SET status = 'skipped' WHERE job_id = $1 AND status = 'pending'")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("UPDATE jobs SET skipped_tasks = skipped_tasks + $2 WHERE id = $1")
            .bind(job_id.0)
            .bind(skipped as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(skipped)
    }

    /// The second arm of `claim_jobs`, extracted standalone: any `running`
    /// task whose lease has expired reverts to `pending` (§4.9), mirroring
    /// `fail_task`'s retryable branch — once `retry_count + 1` reaches
    /// `MAX_RETRIES` the task is permanently `failed` instead of looping
    /// back to `pending` forever.
    async fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<ReapOutcome> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks SET
                status = CASE WHEN retry_count + 1 >= $2 THEN 'failed' ELSE 'pending' END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                retry_count = retry_count + 1,
                completed_at = CASE WHEN retry_count + 1 >= $2 THEN now() ELSE completed_at END
            WHERE status = 'running' AND lease_expires_at < $1
            RETURNING job_id, status
            "#,
        )
        .bind(now)
        .bind(Task::MAX_RETRIES)
        .fetch_all(&self.pool)
        .await?;

        let newly_failed_job_ids = rows
            .iter()
            .filter(|row| row.get::<String, _>("status") == "failed")
            .map(|row| JobId(row.get("job_id")))
            .collect();

        Ok(ReapOutcome { reclaimed: rows.len() as u64, newly_failed_job_ids })
    }

    async fn count_pending_tasks(&self, job_id: JobId) -> StoreResult<i64> {
        let row = sqlx::query("SELECT count(*) AS c FROM tasks WHERE job_id = $1 AND status = 'pending'")
            .bind(job_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("c"))
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
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM tasks t
            JOIN pages p ON p.id = t.page_id
            WHERE t.job_id = $1
              AND ($2::text IS NULL OR t.status = $2)
              AND ($3::text IS NULL OR t.cache_status ILIKE $3 || '%')
              AND ($4::text IS NULL OR p.path ILIKE '%' || $4 || '%')
            ORDER BY t.created_at ASC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(job_id.0)
        .bind(status)
        .bind(cache)
        .bind(path)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_task).collect())
    }

    async fn reprioritise_pending(
        &self,
        job_ids: &[JobId],
        page_id: i64,
        new_priority: f64,
    ) -> StoreResult<u64> {
        let ids: Vec<Uuid> = job_ids.iter().map(|j| j.0).collect();
        let result = sqlx::query(
            "UPDATE tasks SET priority_score = $3 WHERE job_id = ANY($1) AND status = 'pending' AND page_id = $2",
        )
        .bind(ids)
        .bind(page_id)
        .bind(new_priority)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_scheduler(&self, scheduler: Scheduler) -> StoreResult<Scheduler> {
        let row = sqlx::query(
            r#"
            INSERT INTO schedulers (
                id, organisation_id, domain_id, schedule_interval_hours, next_run_at,
                is_enabled, concurrency, find_links, max_pages, include_paths, exclude_paths
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (organisation_id, domain_id) DO UPDATE SET
                schedule_interval_hours = EXCLUDED.schedule_interval_hours,
                is_enabled = EXCLUDED.is_enabled,
                concurrency = EXCLUDED.concurrency,
                find_links = EXCLUDED.find_links,
                max_pages = EXCLUDED.max_pages,
                include_paths = EXCLUDED.include_paths,
                exclude_paths = EXCLUDED.exclude_paths
            RETURNING *
            "#,
        )
        .bind(scheduler.id.0)
        .bind(scheduler.organisation_id)
        .bind(scheduler.domain_id)
        .bind(scheduler.schedule_interval_hours)
        .bind(scheduler.next_run_at)
        .bind(scheduler.is_enabled)
        .bind(scheduler.concurrency)
        .bind(scheduler.find_links)
        .bind(scheduler.max_pages)
        .bind(&scheduler.include_paths)
        .bind(&scheduler.exclude_paths)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_scheduler(row))
    }

    async fn get_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<Scheduler> {
        let row = sqlx::query("SELECT * FROM schedulers WHERE id = $1")
            .bind(scheduler_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound { entity: "scheduler", id: scheduler_id.0 })?;
        Ok(row_to_scheduler(row))
    }

    async fn list_schedulers(&self, organisation_id: Uuid) -> StoreResult<Vec<Scheduler>> {
        let rows = sqlx::query("SELECT * FROM schedulers WHERE organisation_id = $1 ORDER BY next_run_at ASC")
            .bind(organisation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_scheduler).collect())
    }

    async fn delete_scheduler(&self, scheduler_id: SchedulerId) -> StoreResult<()> {
        sqlx::query("DELETE FROM schedulers WHERE id = $1")
            .bind(scheduler_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_schedulers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Scheduler>> {
        let rows = sqlx::query("SELECT * FROM schedulers WHERE is_enabled = true AND next_run_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_scheduler).collect())
    }

    async fn advance_scheduler_if(
        &self,
        scheduler_id: SchedulerId,
        expected_next_run_at: DateTime<Utc>,
        new_next_run_at: DateTime<Utc>,
    ) -> StoreResult<ConditionalOutcome> {
        let result = sqlx::query(
            "UPDATE schedulers SET next_run_at = $3 WHERE id = $1 AND next_run_at = $2",
        )
        .bind(scheduler_id.0)
        .bind(expected_next_run_at)
        .bind(new_next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ConditionalOutcome::Applied
        } else {
            ConditionalOutcome::NoMatch
        })
    }

    async fn scheduler_has_running_job(&self, scheduler_id: SchedulerId) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT count(*) AS c FROM jobs WHERE scheduler_id = $1 AND status = 'running'",
        )
        .bind(scheduler_id.0)
        .fetch_one(&self.pool)
        .await?;
        let c: i64 = row.get("c");
        Ok(c > 0)
    }

    async fn upsert_page_view_entry(&self, entry: PageViewFeedEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO page_analytics (organisation_id, domain_id, path, page_views_7d, page_views_28d, page_views_180d, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,NOW())
            ON CONFLICT (organisation_id, domain_id, path) DO UPDATE SET
                page_views_7d = EXCLUDED.page_views_7d,
                page_views_28d = EXCLUDED.page_views_28d,
                page_views_180d = EXCLUDED.page_views_180d,
                updated_at = NOW()
            "#,
        )
        .bind(entry.organisation_id)
        .bind(entry.domain_id)
        .bind(entry.path)
        .bind(entry.page_views_7d)
        .bind(entry.page_views_28d)
        .bind(entry.page_views_180d)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running_job_ids_for_domain(&self, domain_id: i64) -> StoreResult<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE domain_id = $1 AND status = 'running'")
            .bind(domain_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| JobId(r.get("id"))).collect())
    }

    async fn quota_remaining(&self, organisation_id: Uuid, limit: i64) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT pages_used FROM quota_counters WHERE organisation_id = $1 AND date = CURRENT_DATE",
        )
        .bind(organisation_id)
        .fetch_optional(&self.pool)
        .await?;
        let used: i64 = row.map(|r| r.get("pages_used")).unwrap_or(0);
        Ok((limit - used).max(0))
    }

    async fn increment_quota(&self, organisation_id: Uuid) -> StoreResult<QuotaCounter> {
        let row = sqlx::query(
            r#"
            INSERT INTO quota_counters (organisation_id, date, pages_used)
            VALUES ($1, CURRENT_DATE, 1)
            ON CONFLICT (organisation_id, date) DO UPDATE SET pages_used = quota_counters.pages_used + 1
            RETURNING organisation_id, date, pages_used
            "#,
        )
        .bind(organisation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(QuotaCounter {
            organisation_id: row.get("organisation_id"),
            date: row.get("date"),
            pages_used: row.get("pages_used"),
        })
    }

    async fn create_share_link(
        &self,
        token_id: ShareTokenId,
        job_id: JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO share_links (id, job_id, expires_at, created_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(token_id.0)
        .bind(job_id.0)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_share_link(&self, token_id: ShareTokenId) -> StoreResult<JobId> {
        let row = sqlx::query(
            "SELECT job_id FROM share_links WHERE id = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(token_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound { entity: "share_link", id: token_id.0 })?;
        Ok(JobId(row.get("job_id")))
    }
}

fn row_to_scheduler(row: sqlx::postgres::PgRow) -> Scheduler {
    Scheduler {
        id: SchedulerId(row.get("id")),
        organisation_id: row.get("organisation_id"),
        domain_id: row.get("domain_id"),
        schedule_interval_hours: row.get("schedule_interval_hours"),
        next_run_at: row.get("next_run_at"),
        is_enabled: row.get("is_enabled"),
        concurrency: row.get("concurrency"),
        find_links: row.get("find_links"),
        max_pages: row.get("max_pages"),
        include_paths: row.get("include_paths"),
        exclude_paths: row.get("exclude_paths"),
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}
impl sqlx::Encode<'_, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s, buf)
    }
}
impl sqlx::Decode<'_, sqlx::Postgres> for JobStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'_>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(match s.as_str() {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => return Err(format!("unknown job status {other}").into()),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}
impl sqlx::Encode<'_, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s, buf)
    }
}
impl sqlx::Decode<'_, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'_>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(match s.as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "skipped" => TaskStatus::Skipped,
            other => return Err(format!("unknown task status {other}").into()),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for SourceType {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}
impl sqlx::Encode<'_, sqlx::Postgres> for SourceType {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        let s = match self {
            SourceType::Dashboard => "dashboard",
            SourceType::WebflowWebhook => "webflow_webhook",
            SourceType::ScheduleSetup => "schedule_setup",
            SourceType::AutoPublishSetup => "auto_publish_setup",
            SourceType::Sitemap => "sitemap",
        };
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s, buf)
    }
}
impl sqlx::Decode<'_, sqlx::Postgres> for SourceType {
    fn decode(value: sqlx::postgres::PgValueRef<'_>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(match s.as_str() {
            "dashboard" => SourceType::Dashboard,
            "webflow_webhook" => SourceType::WebflowWebhook,
            "schedule_setup" => SourceType::ScheduleSetup,
            "auto_publish_setup" => SourceType::AutoPublishSetup,
            "sitemap" => SourceType::Sitemap,
            other => return Err(format!("unknown source type {other}").into()),
        })
    }
}
