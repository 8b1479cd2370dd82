//! services/api/src/web/jobs.rs
//!
//! The job entry point. The external runner (or the in-process worker) delivers
//! `{ name, data }` here and the matching core service does the work.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};
use tutor_core::analytics::{ActivityRecord, ANALYTICS_EVENT};
use tutor_core::recommendation::RECOMMENDATION_EVENT;
use tutor_core::users::{
    ProviderUserEvent, USER_CREATED_EVENT, USER_DELETED_EVENT, USER_UPDATED_EVENT,
};
use tutor_core::RecommendationJob;
use utoipa::ToSchema;

use crate::adapters::QueuedJob;
use crate::error::ApiError;
use crate::web::events::MessageResponse;
use crate::web::state::AppState;

/// Header carrying the shared secret of the job runner.
pub const JOBS_SECRET_HEADER: &str = "x-jobs-secret";

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobRequest {
    /// Event name, e.g. `course/recommendation.triggered`.
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
}

fn payload<T: DeserializeOwned>(name: &str, data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data)
        .map_err(|e| ApiError::BadRequest(format!("Invalid payload for {}: {}", name, e)))
}

/// Runs one job to completion and returns a short confirmation.
pub async fn run_job(state: &AppState, name: &str, data: Value) -> Result<String, ApiError> {
    match name {
        RECOMMENDATION_EVENT => {
            let job: RecommendationJob = payload(name, data)?;
            state.recommendations.process_recommendations(&job).await?;
            Ok("Recommendations processed".to_string())
        }
        ANALYTICS_EVENT => {
            let record: ActivityRecord = payload(name, data)?;
            let snapshot = state.analytics.refresh(record.user_id).await?;
            Ok(format!("Analytics refreshed at level {}", snapshot.current_level))
        }
        USER_CREATED_EVENT => {
            let event: ProviderUserEvent = payload(name, data)?;
            Ok(state.users.user_created(&event.data).await?.message().to_string())
        }
        USER_UPDATED_EVENT => {
            let event: ProviderUserEvent = payload(name, data)?;
            Ok(state.users.user_updated(&event.data).await?.message().to_string())
        }
        USER_DELETED_EVENT => {
            let event: ProviderUserEvent = payload(name, data)?;
            Ok(state.users.user_deleted(&event.data).await?.message().to_string())
        }
        other => Err(ApiError::BadRequest(format!("Unknown job '{}'", other))),
    }
}

/// Run a background job.
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = JobRequest,
    responses(
        (status = 200, description = "Job finished", body = MessageResponse),
        (status = 400, description = "Unknown job or malformed payload", body = crate::error::ErrorBody),
        (status = 401, description = "Missing or wrong runner secret", body = crate::error::ErrorBody),
        (status = 500, description = "The job failed; the runner may retry", body = crate::error::ErrorBody)
    ),
    params(
        ("x-jobs-secret" = Option<String>, Header, description = "Shared secret, when one is configured.")
    )
)]
pub async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    if let Some(secret) = state.jobs_secret.as_deref() {
        let presented = headers
            .get(JOBS_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret) {
            return Err(ApiError::Unauthorized);
        }
    }

    let Json(request) = request.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let message = run_job(&state, &request.name, request.data).await?;
    info!(job = %request.name, "Job finished: {}", message);
    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

/// Drains the in-process queue until every sender is gone.
pub async fn run_local_jobs(state: Arc<AppState>, mut jobs: UnboundedReceiver<QueuedJob>) {
    while let Some(job) = jobs.recv().await {
        match run_job(&state, &job.name, job.data).await {
            Ok(message) => info!(job_id = %job.id, job = %job.name, "Job finished: {}", message),
            Err(e) => error!(job_id = %job.id, job = %job.name, "Job failed: {}", e),
        }
    }
    info!("Local job worker stopped.");
}
