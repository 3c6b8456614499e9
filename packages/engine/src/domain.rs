use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{JobId, SchedulerId, TaskId};

/// Normalises a domain name: lower-case, strips scheme and port, strips a
/// leading `www.`. Idempotent — `normalise(normalise(x)) == normalise(x)`
/// (§8 round-trip property).
pub fn normalise_domain(input: &str) -> String {
    let mut s = input.trim().to_ascii_lowercase();

    if let Some(rest) = s.strip_prefix("https://") {
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix("http://") {
        s = rest.to_string();
    }

    if let Some(idx) = s.find(['/', '?', '#']) {
        s.truncate(idx);
    }

    if let Some(idx) = s.rfind(':') {
        let port_candidate = &s[idx + 1..];
        if !port_candidate.is_empty() && port_candidate.chars().all(|c| c.is_ascii_digit()) {
            s.truncate(idx);
        }
    }

    if let Some(rest) = s.strip_prefix("www.") {
        s = rest.to_string();
    }

    s
}

/// Normalises a page path to a canonical `/`-rooted form without scheme,
/// host, fragment or trailing slash (root path `/` is preserved).
pub fn normalise_path(input: &str) -> String {
    let mut p = input.trim();
    if let Some(idx) = p.find('#') {
        p = &p[..idx];
    }
    let mut p = p.to_string();
    if !p.starts_with('/') {
        p = format!("/{p}");
    }
    if p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Domain {
    pub id: i64,
    pub name: String,
    pub crawl_delay_seconds: Option<i32>,
    pub adaptive_delay_seconds: i32,
}

impl Domain {
    pub const MAX_ADAPTIVE_DELAY_SECONDS: i32 = 30;

    /// Politeness delay observed before issuing a probe (§4.3 step 3).
    pub fn politeness_delay_seconds(&self) -> i32 {
        self.crawl_delay_seconds
            .unwrap_or(0)
            .max(self.adaptive_delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Page {
    pub id: i64,
    pub domain_id: i64,
    pub path: String,
    pub priority: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// The channel that created a job (glossary: "Source type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Dashboard,
    WebflowWebhook,
    ScheduleSetup,
    AutoPublishSetup,
    Sitemap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub organisation_id: Uuid,
    pub domain_id: i64,
    pub status: JobStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub concurrency: i32,
    pub max_pages: i32,
    pub find_links: bool,
    pub use_sitemap: bool,
    pub source_type: SourceType,
    pub source_detail: Option<String>,
    /// Schema-stable JSON blob mirroring `kernel::jobs::Job.args`; carries
    /// caller-supplied metadata the engine itself does not interpret.
    pub source_info: serde_json::Value,
    pub scheduler_id: Option<SchedulerId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form progress/failure metadata: `quota_exceeded`, `failure_reason`.
    pub stats: serde_json::Value,
}

impl Job {
    /// `(completed+failed) / (total - skipped)`, 0 when denominator is 0
    /// (§4.1 `GetJobStatus`).
    pub fn progress(&self) -> f64 {
        let denom = self.total_tasks - self.skipped_tasks;
        if denom <= 0 {
            return 0.0;
        }
        (self.completed_tasks + self.failed_tasks) as f64 / denom as f64
    }

    pub fn is_settled(&self) -> bool {
        self.completed_tasks + self.failed_tasks + self.skipped_tasks >= self.total_tasks
            && self.total_tasks > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub page_id: i64,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub cache_status: Option<String>,
    pub second_response_time_ms: Option<i32>,
    pub second_cache_status: Option<String>,
    pub content_type: Option<String>,
    pub error: Option<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub priority_score: f64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retried task becomes eligible for lease again.
    /// Supplemental column: the distilled spec (§4.2 `Fail`) requires
    /// computing a backoff-delayed next-run time but the Task entity as
    /// listed in §3 has no field to hold it; this is the natural place.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Task {
    pub const SEED_PRIORITY: f64 = 0.5;
    pub const SITEMAP_HIGH_PRIORITY: f64 = 0.9;
    pub const MAX_RETRIES: i32 = 3;

    /// Invariant 1 (§8): `status='running' <=> lease_owner != null &&
    /// lease_expires_at > started_at`.
    pub fn lease_invariant_holds(&self) -> bool {
        match self.status {
            TaskStatus::Running => {
                self.lease_owner.is_some()
                    && matches!((self.lease_expires_at, self.started_at), (Some(exp), Some(start)) if exp > start)
            }
            _ => self.lease_owner.is_none(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Scheduler {
    pub id: SchedulerId,
    pub organisation_id: Uuid,
    pub domain_id: i64,
    pub schedule_interval_hours: i32,
    pub next_run_at: DateTime<Utc>,
    pub is_enabled: bool,
    pub concurrency: i32,
    pub find_links: bool,
    pub max_pages: i32,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl Scheduler {
    pub const ALLOWED_INTERVALS_HOURS: [i32; 4] = [6, 12, 24, 48];

    pub fn interval_is_valid(hours: i32) -> bool {
        Self::ALLOWED_INTERVALS_HOURS.contains(&hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PageViewFeedEntry {
    pub organisation_id: Uuid,
    pub domain_id: i64,
    pub path: String,
    pub page_views_7d: i64,
    pub page_views_28d: i64,
    pub page_views_180d: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaCounter {
    pub organisation_id: Uuid,
    pub date: chrono::NaiveDate,
    pub pages_used: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_domain_strips_scheme_port_and_www() {
        assert_eq!(normalise_domain("https://WWW.Example.com:443/"), "example.com");
        assert_eq!(normalise_domain("http://example.com"), "example.com");
        assert_eq!(normalise_domain("example.com"), "example.com");
    }

    #[test]
    fn normalise_domain_is_idempotent() {
        let once = normalise_domain("HTTPS://www.Example.COM:8080/path");
        let twice = normalise_domain(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalise_path_roots_and_trims_trailing_slash() {
        assert_eq!(normalise_path("about/"), "/about");
        assert_eq!(normalise_path("/about/"), "/about");
        assert_eq!(normalise_path("/"), "/");
        assert_eq!(normalise_path("/a#frag"), "/a");
    }

    #[test]
    fn job_progress_is_zero_when_denominator_zero() {
        let job = sample_job();
        assert_eq!(job.progress(), 0.0);
    }

    #[test]
    fn job_progress_excludes_skipped_from_denominator() {
        let mut job = sample_job();
        job.total_tasks = 10;
        job.completed_tasks = 4;
        job.failed_tasks = 1;
        job.skipped_tasks = 5;
        assert!((job.progress() - 1.0).abs() < f64::EPSILON);
    }

    fn sample_job() -> Job {
        Job {
            id: JobId::new(),
            organisation_id: Uuid::now_v7(),
            domain_id: 1,
            status: JobStatus::Pending,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            concurrency: 20,
            max_pages: 0,
            find_links: true,
            use_sitemap: true,
            source_type: SourceType::Dashboard,
            source_detail: None,
            source_info: serde_json::json!({}),
            scheduler_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stats: serde_json::json!({}),
        }
    }
}
