use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use engine::domain::SourceType;
use engine::job_manager::CreateJobOptions;

use crate::error::{ApiError, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebflowPublishPayload {
    #[serde(rename = "triggerType")]
    pub trigger_type: String,
    pub payload: WebflowPublishBody,
    /// Organisation the pre-shared token resolves to. The real Webflow
    /// integration would derive this from the OAuth install record keyed by
    /// `{token|workspaces/{wsid}}`; that mapping is out of scope here, so
    /// the caller is trusted to supply it directly.
    pub organisation_id: uuid::Uuid,
}

#[derive(Debug, Deserialize)]
pub struct WebflowPublishBody {
    pub domains: Vec<String>,
}

/// §6 `POST /v1/webhooks/webflow/{token|workspaces/{wsid}}`: a site-publish
/// event fans out into one job per domain in `payload.domains[]`. Only
/// `triggerType: "site_publish"` is recognised; anything else is ignored
/// rather than erroring, since Webflow may add new trigger types this
/// endpoint has no opinion about.
pub async fn webflow_publish(
    State(state): State<AppState>,
    Path(_token): Path<String>,
    Json(body): Json<WebflowPublishPayload>,
) -> Result<Json<Envelope<Vec<uuid::Uuid>>>, ApiError> {
    if body.trigger_type != "site_publish" {
        return Ok(Json(Envelope::ok(Vec::new())));
    }

    let mut created = Vec::with_capacity(body.payload.domains.len());
    for domain in body.payload.domains {
        let opts = CreateJobOptions {
            domain,
            organisation_id: body.organisation_id,
            source_type: SourceType::WebflowWebhook,
            ..Default::default()
        };
        let job = state.job_manager.create_job(opts).await?;
        created.push(job.id.0);
    }

    Ok(Json(Envelope::ok(created)))
}
