use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::warn;

use super::{claims::Claims, jwt::TokenService};
use crate::error::AppError;

/// Verified access-token claims taken from `Authorization: Bearer <token>`.
pub struct AuthUser(pub Claims);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenService: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) else {
            warn!("missing Authorization header");
            return Err(AppError::Unauthorized("Unauthorized".into()));
        };

        // Expect "Bearer <token>"
        let Some(token) = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
        else {
            warn!("invalid auth scheme");
            return Err(AppError::Unauthorized("Unauthorized".into()));
        };

        let tokens = TokenService::from_ref(state);
        let claims = tokens.verify_access_token(token.trim()).map_err(|_| {
            warn!("invalid or expired access token");
            AppError::Unauthorized("Unauthorized".into())
        })?;

        Ok(AuthUser(claims))
    }
}
