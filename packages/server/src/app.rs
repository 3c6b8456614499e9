use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::request_id_middleware;
use crate::routes::{health, jobs, schedulers, shared, webhooks};
use crate::state::AppState;

/// Builds the router (§4.10). Grounded on the teacher's `build_app`
/// (`server/app.rs`): `TraceLayer`/`CorsLayer` wrapping the whole service,
/// with request-id stamping as the innermost layer so every log line and
/// response carries it. `tower` layers apply in reverse execution order —
/// the request-id middleware listed last here runs first on each request.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::health_handler))
        .route("/v1/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/v1/jobs/:id", get(jobs::get_job).put(jobs::update_job))
        .route("/v1/jobs/:id/tasks", get(jobs::list_tasks))
        .route("/v1/jobs/:id/export", get(jobs::export_job))
        .route("/v1/jobs/:id/share-links", post(jobs::create_share_link))
        .route("/v1/shared/jobs/:token", get(shared::get_shared_job))
        .route("/v1/schedulers", post(schedulers::create_scheduler).get(schedulers::list_schedulers))
        .route(
            "/v1/schedulers/:id",
            get(schedulers::get_scheduler)
                .put(schedulers::update_scheduler)
                .delete(schedulers::delete_scheduler),
        )
        .route("/v1/webhooks/webflow/*token", post(webhooks::webflow_publish))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
}
