//! Router construction for the token controller.

use axum::extract::{Extension, Request};
use axum::http::StatusCode;
use axum::middleware::{self as axum_mw, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the `/_tokens` router with tracing and the controller switch.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_tokens", post(handlers::create_token))
        .route(
            "/_tokens/:token",
            get(handlers::view_token)
                .post(handlers::execute_token)
                .patch(handlers::update_token)
                .delete(handlers::remove_token),
        )
        .route(
            "/_tokens/:token/execute",
            get(handlers::execute_token).post(handlers::execute_token),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(state))
                .layer(axum_mw::from_fn(controller_switch)),
        )
}

/// Answers 404 for every route while the controller is disabled.
async fn controller_switch(
    Extension(state): Extension<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.controller_enabled {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response();
    }
    next.run(request).await
}
