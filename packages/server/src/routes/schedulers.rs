use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engine::domain::Scheduler;
use engine::ids::SchedulerId;

use crate::error::{ApiError, Envelope};
use crate::middleware::OrgContext;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SchedulerResponse {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub domain_id: i64,
    pub schedule_interval_hours: i32,
    pub next_run_at: chrono::DateTime<chrono::Utc>,
    pub is_enabled: bool,
    pub concurrency: i32,
    pub find_links: bool,
    pub max_pages: i32,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl From<Scheduler> for SchedulerResponse {
    fn from(s: Scheduler) -> Self {
        Self {
            id: s.id.0,
            organisation_id: s.organisation_id,
            domain_id: s.domain_id,
            schedule_interval_hours: s.schedule_interval_hours,
            next_run_at: s.next_run_at,
            is_enabled: s.is_enabled,
            concurrency: s.concurrency,
            find_links: s.find_links,
            max_pages: s.max_pages,
            include_paths: s.include_paths,
            exclude_paths: s.exclude_paths,
        }
    }
}

/// §6 `POST /v1/schedulers` / `PUT /v1/schedulers/{id}` share a body shape;
/// `domain_id` is required on create, ignored on update (a scheduler's
/// domain is immutable — recreate it to point elsewhere).
#[derive(Debug, Deserialize)]
pub struct SchedulerRequest {
    #[serde(default)]
    pub domain_id: i64,
    pub schedule_interval_hours: i32,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,
    #[serde(default = "default_true")]
    pub find_links: bool,
    #[serde(default)]
    pub max_pages: i32,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> i32 {
    20
}

pub async fn create_scheduler(
    State(state): State<AppState>,
    org: OrgContext,
    Json(body): Json<SchedulerRequest>,
) -> Result<Json<Envelope<SchedulerResponse>>, ApiError> {
    if !Scheduler::interval_is_valid(body.schedule_interval_hours) {
        return Err(ApiError::BadRequest(format!(
            "schedule_interval_hours must be one of {:?}",
            Scheduler::ALLOWED_INTERVALS_HOURS
        )));
    }

    let scheduler = Scheduler {
        id: SchedulerId::new(),
        organisation_id: org.organisation_id,
        domain_id: body.domain_id,
        schedule_interval_hours: body.schedule_interval_hours,
        next_run_at: chrono::Utc::now() + chrono::Duration::hours(body.schedule_interval_hours as i64),
        is_enabled: body.is_enabled,
        concurrency: body.concurrency.clamp(1, engine::job_manager::MAX_CONCURRENCY),
        find_links: body.find_links,
        max_pages: body.max_pages,
        include_paths: body.include_paths,
        exclude_paths: body.exclude_paths,
    };

    let saved = state.store.upsert_scheduler(scheduler).await?;
    Ok(Json(Envelope::ok(SchedulerResponse::from(saved))))
}

pub async fn list_schedulers(
    State(state): State<AppState>,
    org: OrgContext,
) -> Result<Json<Envelope<Vec<SchedulerResponse>>>, ApiError> {
    let schedulers = state.store.list_schedulers(org.organisation_id).await?;
    Ok(Json(Envelope::ok(schedulers.into_iter().map(SchedulerResponse::from).collect())))
}

pub async fn get_scheduler(
    State(state): State<AppState>,
    Path(scheduler_id): Path<Uuid>,
) -> Result<Json<Envelope<SchedulerResponse>>, ApiError> {
    let scheduler = state.store.get_scheduler(SchedulerId::from(scheduler_id)).await?;
    Ok(Json(Envelope::ok(SchedulerResponse::from(scheduler))))
}

pub async fn update_scheduler(
    State(state): State<AppState>,
    Path(scheduler_id): Path<Uuid>,
    Json(body): Json<SchedulerRequest>,
) -> Result<Json<Envelope<SchedulerResponse>>, ApiError> {
    if !Scheduler::interval_is_valid(body.schedule_interval_hours) {
        return Err(ApiError::BadRequest(format!(
            "schedule_interval_hours must be one of {:?}",
            Scheduler::ALLOWED_INTERVALS_HOURS
        )));
    }

    let scheduler_id = SchedulerId::from(scheduler_id);
    let existing = state.store.get_scheduler(scheduler_id).await?;

    let updated = Scheduler {
        id: scheduler_id,
        organisation_id: existing.organisation_id,
        domain_id: existing.domain_id,
        schedule_interval_hours: body.schedule_interval_hours,
        next_run_at: existing.next_run_at,
        is_enabled: body.is_enabled,
        concurrency: body.concurrency.clamp(1, engine::job_manager::MAX_CONCURRENCY),
        find_links: body.find_links,
        max_pages: body.max_pages,
        include_paths: body.include_paths,
        exclude_paths: body.exclude_paths,
    };

    let saved = state.store.upsert_scheduler(updated).await?;
    Ok(Json(Envelope::ok(SchedulerResponse::from(saved))))
}

pub async fn delete_scheduler(
    State(state): State<AppState>,
    Path(scheduler_id): Path<Uuid>,
) -> Result<Json<Envelope<()>>, ApiError> {
    state.store.delete_scheduler(SchedulerId::from(scheduler_id)).await?;
    Ok(Json(Envelope::ok(())))
}
