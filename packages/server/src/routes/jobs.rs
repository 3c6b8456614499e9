use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engine::domain::{Job, JobStatus, SourceType};
use engine::job_manager::CreateJobOptions;
use engine::ids::JobId;

use crate::error::{ApiError, Envelope};
use crate::middleware::OrgContext;
use crate::state::AppState;

/// §6 `POST /v1/jobs`. Unset optional fields fall back to the Job Manager's
/// own defaults (§4.1 `CreateJob` opts) rather than this façade inventing
/// its own.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub domain: String,
    #[serde(default)]
    pub use_sitemap: Option<bool>,
    #[serde(default)]
    pub find_links: Option<bool>,
    #[serde(default)]
    pub concurrency: Option<i32>,
    #[serde(default)]
    pub max_pages: Option<i32>,
    #[serde(default)]
    pub source_detail: Option<String>,
    #[serde(default)]
    pub source_info: Option<serde_json::Value>,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub domain_id: i64,
    pub status: JobStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub progress: f64,
    pub concurrency: i32,
    pub max_pages: i32,
    pub find_links: bool,
    pub use_sitemap: bool,
    pub source_type: SourceType,
    pub source_detail: Option<String>,
    pub scheduler_id: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub stats: serde_json::Value,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.0,
            organisation_id: job.organisation_id,
            domain_id: job.domain_id,
            status: job.status,
            total_tasks: job.total_tasks,
            completed_tasks: job.completed_tasks,
            failed_tasks: job.failed_tasks,
            skipped_tasks: job.skipped_tasks,
            progress: job.progress(),
            concurrency: job.concurrency,
            max_pages: job.max_pages,
            find_links: job.find_links,
            use_sitemap: job.use_sitemap,
            source_type: job.source_type,
            source_detail: job.source_detail.clone(),
            scheduler_id: job.scheduler_id.map(|id| id.0),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            stats: job.stats.clone(),
        }
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    org: OrgContext,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<Envelope<JobResponse>>, ApiError> {
    let opts = CreateJobOptions {
        domain: body.domain,
        organisation_id: org.organisation_id,
        user_id: None,
        use_sitemap: body.use_sitemap.unwrap_or(true),
        find_links: body.find_links.unwrap_or(true),
        concurrency: body.concurrency.unwrap_or(20),
        max_pages: body.max_pages.unwrap_or(0),
        source_type: SourceType::Dashboard,
        source_detail: body.source_detail,
        source_info: body.source_info.unwrap_or_else(|| serde_json::json!({})),
        scheduler_id: None,
        include_paths: body.include_paths,
        exclude_paths: body.exclude_paths,
    };

    let job = state.job_manager.create_job(opts).await?;
    Ok(Json(Envelope::ok(JobResponse::from(job))))
}

/// §6 `GET /v1/jobs` query parameters. `range`/`tz_offset` are accepted for
/// client compatibility but not yet used to filter — the store's
/// `list_jobs` has no date-range vocabulary, only status/limit/offset; adding
/// one is future work, not implemented here as a shortcut.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default, rename = "tzOffset")]
    pub tz_offset: Option<i32>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    org: OrgContext,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Envelope<Vec<JobResponse>>>, ApiError> {
    let status = query.status.as_deref().map(parse_job_status).transpose()?;
    let jobs = state
        .job_manager
        .list_jobs(org.organisation_id, status, query.limit.unwrap_or(20), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(Envelope::ok(jobs.into_iter().map(JobResponse::from).collect())))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Envelope<JobResponse>>, ApiError> {
    let job = state.job_manager.get_job_status(JobId::from(job_id)).await?;
    Ok(Json(Envelope::ok(JobResponse::from(job))))
}

#[derive(Debug, Deserialize)]
pub struct JobActionRequest {
    pub action: String,
}

/// §6 `PUT /v1/jobs/{id}` — only `{"action":"cancel"}` is defined; any other
/// action value is a client error, not a silently-ignored no-op.
pub async fn update_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<JobActionRequest>,
) -> Result<Json<Envelope<JobResponse>>, ApiError> {
    match body.action.as_str() {
        "cancel" => {
            state.job_manager.cancel_job(JobId::from(job_id)).await?;
        }
        other => return Err(ApiError::BadRequest(format!("unsupported action: {other}"))),
    }
    let job = state.job_manager.get_job_status(JobId::from(job_id)).await?;
    Ok(Json(Envelope::ok(JobResponse::from(job))))
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub page_id: i64,
    pub status: String,
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
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<engine::domain::Task> for TaskResponse {
    fn from(t: engine::domain::Task) -> Self {
        Self {
            id: t.id.0,
            page_id: t.page_id,
            status: format!("{:?}", t.status).to_lowercase(),
            retry_count: t.retry_count,
            status_code: t.status_code,
            response_time_ms: t.response_time_ms,
            cache_status: t.cache_status,
            second_response_time_ms: t.second_response_time_ms,
            second_cache_status: t.second_cache_status,
            content_type: t.content_type,
            error: t.error,
            source_type: t.source_type,
            source_url: t.source_url,
            priority_score: t.priority_score,
            created_at: t.created_at,
            started_at: t.started_at,
            completed_at: t.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Accepted for API compatibility; the store always returns `created_at
    /// ASC` within a job (§4.2 fairness), so this is currently a no-op.
    #[serde(default)]
    pub sort: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Envelope<Vec<TaskResponse>>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let tasks = state
        .store
        .list_tasks(
            JobId::from(job_id),
            query.status.as_deref(),
            query.cache.as_deref(),
            query.path.as_deref(),
            limit,
            query.offset.unwrap_or(0).max(0),
        )
        .await?;
    Ok(Json(Envelope::ok(tasks.into_iter().map(TaskResponse::from).collect())))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(rename = "type", default = "default_export_type")]
    pub export_type: String,
}

fn default_export_type() -> String {
    "job".to_string()
}

/// §6 `GET /v1/jobs/{id}/export`, capped at 10 000 rows per the spec's
/// stated bulk-export limit.
const EXPORT_LIMIT: i64 = 10_000;

pub async fn export_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<Envelope<Vec<TaskResponse>>>, ApiError> {
    let job_id = JobId::from(job_id);
    let tasks = state.store.list_tasks(job_id, None, None, None, EXPORT_LIMIT, 0).await?;

    let filtered: Vec<engine::domain::Task> = match query.export_type.as_str() {
        "job" => tasks,
        "broken-links" => tasks
            .into_iter()
            .filter(|t| {
                t.status == engine::domain::TaskStatus::Failed
                    || t.status_code.map(|code| code >= 400).unwrap_or(false)
            })
            .collect(),
        "slow-pages" => {
            let mut rest = tasks;
            rest.sort_by(|a, b| b.response_time_ms.unwrap_or(0).cmp(&a.response_time_ms.unwrap_or(0)));
            rest
        }
        other => return Err(ApiError::BadRequest(format!("unknown export type: {other}"))),
    };

    Ok(Json(Envelope::ok(filtered.into_iter().map(TaskResponse::from).collect())))
}

#[derive(Debug, Deserialize)]
pub struct CreateShareLinkRequest {
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ShareLinkResponse {
    pub token: Uuid,
    pub url: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// §6 `POST /v1/jobs/{id}/share-links`: issues a public, read-only token
/// resolvable via `GET /v1/shared/jobs/{token}` without auth.
pub async fn create_share_link(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<CreateShareLinkRequest>,
) -> Result<Json<Envelope<ShareLinkResponse>>, ApiError> {
    let job_id = JobId::from(job_id);
    // Ensures the job exists before minting a token for it.
    state.job_manager.get_job_status(job_id).await?;

    let token = engine::ids::ShareTokenId::new();
    let expires_at = body.expires_in_hours.map(|hours| chrono::Utc::now() + chrono::Duration::hours(hours));
    state.store.create_share_link(token, job_id, expires_at).await?;

    let url = format!("{}/v1/shared/jobs/{}", state.config.app_url, token.0);
    Ok(Json(Envelope::ok(ShareLinkResponse { token: token.0, url, expires_at })))
}

fn parse_job_status(raw: &str) -> Result<JobStatus, ApiError> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "paused" => Ok(JobStatus::Paused),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(ApiError::BadRequest(format!("unknown status: {other}"))),
    }
}
