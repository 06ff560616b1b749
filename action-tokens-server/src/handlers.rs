//! `/_tokens` route handlers. Each one delegates to the orchestrator.

use action_tokens_core::{
    CallScope, ExecutionOutcome, InboundContext, TokenDraft, TokenId, TokenPayload, TokenTarget,
    ViewOutcome,
};
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::AppState;

/// The triggering HTTP request, handed to event listeners as the inbound context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateTokenRequest {
    pub token: TokenDraft,
    pub payload: Option<TokenPayload>,
}

/// POST /_tokens
pub async fn create_token(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let token = state
        .orchestrator
        .create_token(request.token, request.payload, &CallScope::new())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "token": token.id() }))))
}

/// GET /_tokens/:token
pub async fn view_token(
    Extension(state): Extension<AppState>,
    Path(token): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<ViewOutcome>, AppError> {
    let scope = CallScope::new().with_context(InboundContext::new(RequestContext {
        method,
        uri,
        headers,
    }));
    let outcome = state
        .orchestrator
        .view_token(&TokenId::from(token.as_str()), &scope)
        .await?;
    if outcome.is_not_found() {
        return Err(AppError::NotFound(token));
    }
    Ok(Json(outcome))
}

/// POST /_tokens/:token, GET|POST /_tokens/:token/execute
pub async fn execute_token(
    Extension(state): Extension<AppState>,
    Path(token): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<ExecutionOutcome>, AppError> {
    let scope = CallScope::new().with_context(InboundContext::new(RequestContext {
        method,
        uri,
        headers,
    }));
    let outcome = state
        .orchestrator
        .execute_token(&TokenId::from(token.as_str()), &scope)
        .await?;
    if outcome.is_not_found() {
        return Err(AppError::NotFound(token));
    }
    Ok(Json(outcome))
}

/// PATCH /_tokens/:token
pub async fn update_token(
    Extension(state): Extension<AppState>,
    Path(token): Path<String>,
    Json(data): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let updated = state
        .orchestrator
        .update_token(
            TokenTarget::Id(TokenId::from(token.as_str())),
            &data,
            &CallScope::new(),
        )
        .await?
        .ok_or(AppError::NotFound(token))?;
    Ok(Json(json!({ "token": updated.id() })))
}

/// DELETE /_tokens/:token
pub async fn remove_token(
    Extension(state): Extension<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .orchestrator
        .remove_token(&TokenId::from(token.as_str()), &CallScope::new())
        .await?
        .ok_or(AppError::NotFound(token))?;
    Ok(StatusCode::NO_CONTENT)
}
