//! Bearer-token check and actor resolution for protected routes.
//!
//! The upstream auth provider terminates user sessions and forwards the
//! profile id in `X-Profile-Id`; the gateway trusts it only alongside the
//! shared bearer token.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::legal::Workflow;
use crate::web::types::ApiError;

pub const PROFILE_HEADER: &str = "x-profile-id";

#[derive(Clone)]
pub struct AuthState {
    pub token: String,
    pub workflow: Workflow,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn profile_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(PROFILE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("falta el encabezado X-Profile-Id".to_string()))?;
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::Unauthorized("X-Profile-Id inválido".to_string()))
}

/// Reject requests without the gateway token, then attach the caller's
/// [`Actor`](crate::legal::Actor) as a request extension.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = bearer_token(request.headers())
        .is_some_and(|provided| token_matches(provided, &auth.token));
    if !authorized {
        return Err(ApiError::Unauthorized(
            "token de acceso inválido".to_string(),
        ));
    }

    let profile_id = profile_id(request.headers())?;
    let actor = auth
        .workflow
        .actor(profile_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("perfil desconocido".to_string()))?;

    tracing::debug!(profile_id = %actor.profile_id, role = actor.role.as_str(), "request authenticated");
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}
