use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use engine::domain::JobStatus;

use crate::state::AppState;

/// Health check (§6, unlisted in the endpoint table but implied by "safe for
/// prod" deployability). Grounded on the teacher's `health_handler`
/// (`server/routes/health.rs`): probe the store with a cheap read rather than
/// just returning 200 unconditionally, so a dead connection pool surfaces as
/// 503 instead of a false "healthy".
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    store: StoreHealth,
}

#[derive(Serialize)]
pub struct StoreHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_health = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.store.jobs_in_status(JobStatus::Running),
    )
    .await
    {
        Ok(Ok(_)) => StoreHealth { status: "ok", error: None },
        Ok(Err(err)) => StoreHealth { status: "error", error: Some(err.to_string()) },
        Err(_) => StoreHealth { status: "error", error: Some("store health check timed out".to_string()) },
    };

    let healthy = store_health.status == "ok";
    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status_code,
        Json(HealthResponse { status: if healthy { "healthy" } else { "unhealthy" }, store: store_health }),
    )
}
