use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use sqlx::SqlitePool;
use tracing::debug;

use crate::db;
use crate::error::ApiError;
use crate::security;

/// Caller authenticated by a bearer access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub token: String,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves `token` to its user, rejecting malformed, unknown and expired
/// tokens alike.
pub async fn authenticate(pool: &SqlitePool, token: &str) -> Result<i64, ApiError> {
    if !security::is_valid_access_token(token) {
        return Err(ApiError::Unauthorized);
    }
    let record = db::get_access_token(pool, token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if record.is_expired() {
        debug!(user_id = record.user_id, "rejecting expired access token");
        return Err(ApiError::Unauthorized);
    }
    Ok(record.user_id)
}

pub fn parse_message_id(raw: Option<&str>) -> Result<i64, ApiError> {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| ApiError::bad_request("messageId is required"))?
        .parse::<i64>()
        .map_err(|_| ApiError::bad_request("messageId must be an integer"))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    SqlitePool: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or(ApiError::Unauthorized)?
            .to_string();
        let pool = SqlitePool::from_ref(state);
        let user_id = authenticate(&pool, &token).await?;
        Ok(AuthUser { user_id, token })
    }
}
