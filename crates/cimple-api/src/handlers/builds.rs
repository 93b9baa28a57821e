//! Build handlers.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
};
use cimple_scheduler::BuildJob;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::state::AppState;

/// Body of `POST /builds`.
#[derive(Debug, Deserialize)]
pub struct SubmitBuildRequest {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Commit")]
    pub commit: String,
}

#[derive(Debug, Serialize)]
pub struct BuildResponse {
    pub id: String,
    pub submission_date: String,
    pub build_url: String,
}

impl From<&BuildJob> for BuildResponse {
    fn from(job: &BuildJob) -> Self {
        Self {
            id: job.id.to_string(),
            submission_date: job.submitted_at.to_rfc3339(),
            build_url: job.build_url(),
        }
    }
}

/// Queue a build. The body is decoded by hand so that any malformed payload
/// gets the same 422 answer.
pub async fn submit_build(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let request: SubmitBuildRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "Rejecting malformed build request");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unprocessible entity".to_string(),
        )
    })?;

    state
        .build_queue
        .queue(BuildJob::git(request.url, request.commit))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to queue build");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(StatusCode::ACCEPTED)
}

/// Builds waiting for an agent.
pub async fn list_builds(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BuildResponse>>, (StatusCode, String)> {
    let queued = state
        .build_queue
        .queued()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(queued.iter().map(BuildResponse::from).collect()))
}
