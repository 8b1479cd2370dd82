//! services/api/src/web/recommendations.rs

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tutor_core::domain::Recommendation;
use tutor_core::recommendation::RequestStatus;
use tutor_core::RecommendationTicket;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;

const MIN_QUERY_CHARS: usize = 3;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecommendationRequest {
    /// What the learner wants to study. At least three characters.
    pub query: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TicketData {
    /// `processing` or `failed`.
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl From<RecommendationTicket> for TicketData {
    fn from(ticket: RecommendationTicket) -> Self {
        let status = match ticket.status {
            RequestStatus::Processing => "processing",
            RequestStatus::Failed => "failed",
        };
        Self {
            status: status.to_string(),
            message: ticket.message,
            job_id: ticket.job_id,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecommendationResponse {
    pub success: bool,
    pub data: TicketData,
}

/// Ask for course recommendations. The work runs as a background job.
#[utoipa::path(
    post,
    path = "/api/recommendations",
    request_body = RecommendationRequest,
    responses(
        (status = 200, description = "Job dispatched, or a failed ticket if dispatch failed", body = RecommendationResponse),
        (status = 400, description = "Query too short", body = crate::error::ErrorBody),
        (status = 404, description = "Unknown user", body = crate::error::ErrorBody)
    ),
    params(
        ("x-user-id" = String, Header, description = "The auth provider's user id.")
    )
)]
pub async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<RecommendationRequest>, JsonRejection>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let query = request.query.trim();
    if query.chars().count() < MIN_QUERY_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }

    let ticket = state
        .recommendations
        .request_recommendations(query, user.id)
        .await;
    Ok(Json(RecommendationResponse {
        success: true,
        data: ticket.into(),
    }))
}

/// The stored outcome of the learner's last recommendation job.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationData {
    pub query: String,
    /// `in_progress`, `completed` or `failed`.
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Course ids, best match first.
    pub courses: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Recommendation> for RecommendationData {
    fn from(record: Recommendation) -> Self {
        Self {
            query: record.query,
            status: record.status.as_str().to_string(),
            message: record.message,
            reason: record.reason,
            courses: record.courses,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LatestRecommendationResponse {
    pub success: bool,
    /// `null` until a recommendation job has run for the learner.
    pub data: Option<RecommendationData>,
}

/// Fetch the learner's current recommendations.
#[utoipa::path(
    get,
    path = "/api/recommendations",
    responses(
        (status = 200, description = "The stored record, or null before the first job", body = LatestRecommendationResponse),
        (status = 404, description = "Unknown user", body = crate::error::ErrorBody)
    ),
    params(
        ("x-user-id" = String, Header, description = "The auth provider's user id.")
    )
)]
pub async fn latest_recommendation_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<LatestRecommendationResponse>, ApiError> {
    let record = state.recommendations.latest(user.id).await?;
    Ok(Json(LatestRecommendationResponse {
        success: true,
        data: record.map(RecommendationData::from),
    }))
}
