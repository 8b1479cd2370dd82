//! services/api/src/web/events.rs

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use serde::Serialize;
use std::sync::Arc;
use tutor_core::events::ActivityEvent;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

/// Record a learning activity event.
#[utoipa::path(
    post,
    path = "/api/events",
    request_body(content = Object, description = "`{ eventType, contentId?, courseId?, timeSpent?, metadata? }`"),
    responses(
        (status = 200, description = "Event applied", body = MessageResponse),
        (status = 400, description = "Missing contentId or malformed event", body = crate::error::ErrorBody),
        (status = 404, description = "Unknown user", body = crate::error::ErrorBody)
    ),
    params(
        ("x-user-id" = String, Header, description = "The auth provider's user id.")
    )
)]
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<ActivityEvent>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(event) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let message = state.events.process(user.id, &event).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: message.to_string(),
    }))
}
