//! services/api/src/web/chat.rs
//!
//! Chat endpoints. `POST /api/chat` answers with a server-sent event stream of
//! UI-message chunks; `GET /api/chat/history` returns the stored conversation of
//! the learner's active session for a lesson.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header::HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use tutor_core::{ChatEvent, ChatTurn, UiMessage};
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::web::middleware::CurrentUser;
use crate::web::state::AppState;

/// Marks the body as a UI-message stream for the client SDK.
const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub lesson_id: String,
    /// The whole conversation as the client holds it, newest last.
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<UiMessage>,
}

impl ChatRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.lesson_id.trim().is_empty() {
            return Err(ApiError::BadRequest("lessonId is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(ApiError::BadRequest(
                "At least one message is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    pub lesson_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryData {
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<UiMessage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub success: bool,
    pub data: HistoryData,
}

fn to_sse(event: ChatEvent) -> Event {
    Event::default().json_data(&event).unwrap_or_else(|e| {
        warn!("Failed to encode chat event: {}", e);
        Event::default().data(r#"{"type":"error","errorText":"encoding failed"}"#)
    })
}

fn sse_body(events: tutor_core::ChatEventStream) -> impl Stream<Item = Result<Event, Infallible>> {
    events
        .map(to_sse)
        .chain(stream::once(async { Event::default().data("[DONE]") }))
        .map(Ok)
}

/// Send a chat message and stream the tutor's reply.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Server-sent UI-message chunks", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Invalid request", body = crate::error::ErrorBody),
        (status = 404, description = "Unknown user or lesson", body = crate::error::ErrorBody),
        (status = 500, description = "Retrieval or model failure", body = crate::error::ErrorBody)
    ),
    params(
        ("x-user-id" = String, Header, description = "The auth provider's user id.")
    )
)]
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    request.validate()?;

    info!(user_id = %user.id, lesson_id = %request.lesson_id, "Chat turn received.");
    let events = state
        .chat
        .send_message(ChatTurn {
            user,
            lesson_id: request.lesson_id,
            messages: request.messages,
        })
        .await?;

    let sse = Sse::new(sse_body(events)).keep_alive(KeepAlive::default());
    Ok((
        [(
            HeaderName::from_static(UI_STREAM_HEADER),
            HeaderValue::from_static("v1"),
        )],
        sse,
    )
        .into_response())
}

/// Fetch the stored conversation for a lesson.
#[utoipa::path(
    get,
    path = "/api/chat/history",
    params(
        HistoryQuery,
        ("x-user-id" = String, Header, description = "The auth provider's user id.")
    ),
    responses(
        (status = 200, description = "Messages of the active session, oldest first", body = HistoryResponse),
        (status = 404, description = "Unknown user", body = crate::error::ErrorBody)
    )
)]
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if query.lesson_id.trim().is_empty() {
        return Err(ApiError::BadRequest("lessonId is required".to_string()));
    }

    let messages = state.chat.history(user.id, &query.lesson_id).await?;
    Ok(Json(HistoryResponse {
        success: true,
        data: HistoryData { messages },
    }))
}
