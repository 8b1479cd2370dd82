//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;
use tutor_core::User;

use crate::error::ApiError;
use crate::web::state::AppState;

/// Header carrying the auth provider's user id, set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The learner resolved for the current request.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

/// Middleware that resolves the `x-user-id` header to a local user.
///
/// If found, inserts a `CurrentUser` into request extensions for handlers to use.
/// A missing header is `401`; an unknown user is `404`.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let external_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let user = state.users.resolve(&external_id).await?;
    debug!(user_id = %user.id, "Resolved request user.");

    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}
