use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use core_lib::{Cache, CoreError, domain::user::UserRole};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::application::ApplicationError;

const SESSION_KEY_PREFIX: &str = "session:";

/// Caller identity resolved from a cached session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

fn session_key(token: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{token}")
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Caches `user` under the access token for `ttl_seconds`.
pub async fn store_session(
    cache: &dyn Cache,
    access_token: &str,
    user: &AuthenticatedUser,
    ttl_seconds: u64,
) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec(user)?;
    cache
        .set(&session_key(access_token), &bytes, Some(ttl_seconds))
        .await
}

/// `Ok(None)` when the request carries no token or the token is unknown.
pub async fn resolve_session(
    cache: &dyn Cache,
    headers: &HeaderMap,
) -> Result<Option<AuthenticatedUser>, CoreError> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    match cache.get(&session_key(token)).await? {
        Some(bytes) => match serde_json::from_slice::<AuthenticatedUser>(&bytes) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!("Discarding unreadable cached session: {}", e);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Requires a valid bearer session and inserts the [`AuthenticatedUser`] into
/// request extensions.
pub async fn session_auth(
    State(app_state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApplicationError> {
    if bearer_token(req.headers()).is_none() {
        warn!("Authentication failed: missing or malformed Authorization header");
        return Err(ApplicationError::unauthorized("Authentication required"));
    }

    let user = resolve_session(app_state.cache.as_ref(), req.headers())
        .await
        .map_err(|e| {
            warn!("Cache error during session lookup: {}", e);
            ApplicationError::unauthorized("Authentication required")
        })?
        .ok_or_else(|| {
            warn!("Bearer token not found in session cache");
            ApplicationError::unauthorized("Session has expired. Please log in again")
        })?;

    debug!(user_id = %user.user_id, role = %user.role, "Session authenticated");
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
