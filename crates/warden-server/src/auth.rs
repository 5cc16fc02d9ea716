use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use crate::{error::ApiError, state::AppState};

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Gate for collaborator routes. Open when no collaborator token is configured.
pub async fn require_collaborator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.collaborator_token.as_deref()
        && bearer_token(request.headers()) != Some(expected)
    {
        return Err(ApiError::Unauthorized(
            "a valid collaborator bearer token is required".to_string(),
        ));
    }
    Ok(next.run(request).await)
}
