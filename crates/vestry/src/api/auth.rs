//! Bearer-token gate for the publish endpoint.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use super::error::ApiError;
use super::state::AppState;

/// Require the configured publish token on mutating routes.
///
/// The token's presence is validated at startup; a request with a missing
/// or mismatched token gets a structured 401.
pub async fn require_publish_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state
        .settings
        .auth
        .publish_token
        .as_deref()
        .ok_or_else(|| ApiError::internal("publish token not configured"))?;

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        Some(_) => Err(ApiError::unauthorized("invalid publish token")),
        None => Err(ApiError::unauthorized("missing publish token")),
    }
}
