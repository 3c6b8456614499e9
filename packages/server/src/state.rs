use std::sync::Arc;

use engine::storage::EngineStore;
use engine::JobManager;

use crate::config::Config;

/// Shared application state, grounded on the teacher's `AppState`
/// (`server/app.rs`) — a small `Clone`-able bundle of `Arc`s handed to every
/// handler via `axum::extract::State`. The engine's internal wiring (Task
/// Queue, Quota Service, Seed Loader, Worker Pool, Scheduler Loop, Reaper)
/// lives behind `JobManager`/`EngineStore`; the façade only needs those two
/// seams plus config.
#[derive(Clone)]
pub struct AppState {
    pub job_manager: Arc<JobManager>,
    pub store: Arc<dyn EngineStore>,
    pub config: Arc<Config>,
}
