use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use engine::domain::JobStatus;
use engine::ids::ShareTokenId;

use crate::error::{ApiError, Envelope};
use crate::state::AppState;

/// Public, read-only view of a job (§6 `GET /v1/shared/jobs/{token}`, §4.10).
/// Deliberately narrower than `JobResponse` — no `organisation_id`,
/// `source_info`, or `stats`, since this endpoint has no auth at all.
#[derive(Debug, Serialize)]
pub struct SharedJobResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub progress: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn get_shared_job(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
) -> Result<Json<Envelope<SharedJobResponse>>, ApiError> {
    let job_id = state.store.resolve_share_link(ShareTokenId::from(token)).await?;
    let job = state.store.get_job(job_id).await?;

    Ok(Json(Envelope::ok(SharedJobResponse {
        id: job.id.0,
        status: job.status,
        total_tasks: job.total_tasks,
        completed_tasks: job.completed_tasks,
        failed_tasks: job.failed_tasks,
        skipped_tasks: job.skipped_tasks,
        progress: job.progress(),
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
    })))
}
