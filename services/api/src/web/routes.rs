//! services/api/src/web/routes.rs
//!
//! Router setup. Learner-facing routes sit behind `require_user`; the job entry
//! point and the health probe do not.

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::ConfigError;
use crate::web::chat::{chat_handler, history_handler};
use crate::web::events::events_handler;
use crate::web::jobs::jobs_handler;
use crate::web::middleware::{require_user, USER_ID_HEADER};
use crate::web::recommendations::{latest_recommendation_handler, recommendations_handler};
use crate::web::rest::{health_handler, ApiDoc};
use crate::web::state::AppState;

/// Builds the application router with every route and the Swagger UI.
pub fn create_router(state: Arc<AppState>) -> Router {
    let learner_routes = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/history", get(history_handler))
        .route(
            "/api/recommendations",
            get(latest_recommendation_handler).post(recommendations_handler),
        )
        .route("/api/events", post(events_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_user,
        ));

    let open_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", post(jobs_handler));

    let api_router = Router::new()
        .merge(learner_routes)
        .merge(open_routes)
        .with_state(state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

/// CORS for the configured origin; `*` allows any.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, ConfigError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            HeaderName::from_static(USER_ID_HEADER),
        ]);

    if origin.trim() == "*" {
        return Ok(layer.allow_origin(Any));
    }
    let origin = origin.parse::<HeaderValue>().map_err(|e| {
        ConfigError::InvalidValue("CORS_ORIGIN".to_string(), e.to_string())
    })?;
    Ok(layer.allow_origin(origin))
}
