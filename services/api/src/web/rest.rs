//! services/api/src/web/rest.rs
//!
//! Contains the master definition for the OpenAPI specification and the
//! health endpoint.

use axum::Json;
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::error::{ErrorBody, ErrorDetail};
use crate::web::chat::{ChatRequest, HistoryData, HistoryResponse};
use crate::web::events::MessageResponse;
use crate::web::jobs::JobRequest;
use crate::web::recommendations::{
    LatestRecommendationResponse, RecommendationData, RecommendationRequest,
    RecommendationResponse, TicketData,
};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        crate::web::chat::chat_handler,
        crate::web::chat::history_handler,
        crate::web::recommendations::recommendations_handler,
        crate::web::recommendations::latest_recommendation_handler,
        crate::web::events::events_handler,
        crate::web::jobs::jobs_handler,
    ),
    components(
        schemas(
            HealthResponse,
            ChatRequest,
            HistoryData,
            HistoryResponse,
            RecommendationRequest,
            RecommendationResponse,
            TicketData,
            RecommendationData,
            LatestRecommendationResponse,
            MessageResponse,
            JobRequest,
            ErrorBody,
            ErrorDetail,
        )
    ),
    tags(
        (name = "Tutor API", description = "Lesson-grounded tutoring chat, course recommendations and learning analytics.")
    )
)]
pub struct ApiDoc;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
