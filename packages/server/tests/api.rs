//! HTTP façade tests built on `axum::body` request/response plumbing
//! instead of a live server (per the engine's own test-tooling approach):
//! the router is built once over in-memory engine fakes and driven with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use engine::config::{AppEnv, Config as EngineConfig};
use engine::fetcher::memory::InMemoryFetcher;
use engine::job_manager::JobManager;
use engine::quota::QuotaService;
use engine::queue::TaskQueue;
use engine::seed_loader::SeedLoader;
use engine::storage::memory::MemoryStore;
use engine::storage::EngineStore;

use server_core::{build_app, AppState, Config};

fn test_config() -> Config {
    Config {
        port: 8080,
        app_url: "http://localhost:8080".to_string(),
        engine: EngineConfig {
            database_url: "postgres://unused/test".to_string(),
            app_env: AppEnv::Development,
            global_workers: 10,
            default_domain_concurrency: 20,
            probe_timeout_secs: 15,
            google_analytics_api_key: None,
            webflow_webhook_token: None,
        },
    }
}

fn test_state() -> AppState {
    let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
    let queue = TaskQueue::new(store.clone());
    let quota = QuotaService::new(store.clone());
    let fetcher = Arc::new(InMemoryFetcher::new());
    let seed_loader = SeedLoader::new(fetcher, queue.clone(), Default::default());
    let job_manager = Arc::new(JobManager::new(store.clone(), queue, quota, seed_loader));
    AppState { job_manager, store, config: Arc::new(test_config()) }
}

fn json_request(method: &str, uri: &str, org_id: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(org_id) = org_id {
        builder = builder.header("x-organisation-id", org_id.to_string());
    }
    let body = match body {
        Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn create_job_without_org_header_is_unauthorised() {
    let app = build_app(test_state());
    let request = json_request("POST", "/v1/jobs", None, Some(json!({ "domain": "example.com" })));
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_job_then_get_then_cancel_round_trips_through_http() {
    let app = build_app(test_state());
    let org_id = Uuid::now_v7();

    let create_request = json_request(
        "POST",
        "/v1/jobs",
        Some(org_id),
        Some(json!({ "domain": "example.com", "use_sitemap": false, "find_links": false })),
    );
    let (status, body) = read_json(app.clone().oneshot(create_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"]["status"], "running");
    assert_eq!(body["data"]["total_tasks"], 1);
    let job_id = body["data"]["id"].as_str().unwrap().to_string();

    let get_request = json_request("GET", &format!("/v1/jobs/{job_id}"), Some(org_id), None);
    let (status, body) = read_json(app.clone().oneshot(get_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], job_id);

    let cancel_request = json_request(
        "PUT",
        &format!("/v1/jobs/{job_id}"),
        Some(org_id),
        Some(json!({ "action": "cancel" })),
    );
    let (status, body) = read_json(app.clone().oneshot(cancel_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let bad_action_request = json_request(
        "PUT",
        &format!("/v1/jobs/{job_id}"),
        Some(org_id),
        Some(json!({ "action": "bogus" })),
    );
    let (status, body) = read_json(app.oneshot(bad_action_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn invalid_domain_surfaces_as_validation_error() {
    let app = build_app(test_state());
    let org_id = Uuid::now_v7();

    let request = json_request("POST", "/v1/jobs", Some(org_id), Some(json!({ "domain": "not a domain" })));
    let (status, body) = read_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn healthz_reports_healthy_against_a_reachable_store() {
    let app = build_app(test_state());
    let request = json_request("GET", "/healthz", None, None);
    let (status, body) = read_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn share_link_is_resolvable_without_org_header() {
    let app = build_app(test_state());
    let org_id = Uuid::now_v7();

    let create_request = json_request(
        "POST",
        "/v1/jobs",
        Some(org_id),
        Some(json!({ "domain": "example.com", "use_sitemap": false, "find_links": false })),
    );
    let (_, body) = read_json(app.clone().oneshot(create_request).await.unwrap()).await;
    let job_id = body["data"]["id"].as_str().unwrap().to_string();

    let share_request = json_request("POST", &format!("/v1/jobs/{job_id}/share-links"), Some(org_id), Some(json!({})));
    let (status, body) = read_json(app.clone().oneshot(share_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["data"]["token"].as_str().unwrap().to_string();

    // The shared endpoint needs no org header at all — that is its point.
    let shared_request = json_request("GET", &format!("/v1/shared/jobs/{token}"), None, None);
    let (status, body) = read_json(app.oneshot(shared_request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], job_id);
}
