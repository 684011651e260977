//! Caller identity for handlers.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use pagecraft_core::error::CoreError;
use pagecraft_core::types::DbId;

use crate::auth::jwt::verify_token;
use crate::error::AppError;
use crate::state::AppState;

/// The account a request acts for, taken from its bearer token.
///
/// Every generation and credit route takes this extractor; ownership of
/// projects and sessions is checked against `account_id` downstream.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub account_id: DbId,
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::Core(CoreError::Unauthorized(message.into()))
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| unauthorized("Missing Authorization header"))?
            .to_str()
            .map_err(|_| unauthorized("Malformed Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| unauthorized("Expected a Bearer token"))?;

        let claims =
            verify_token(token, &state.config.jwt).map_err(|e| unauthorized(e.to_string()))?;

        Ok(AuthUser {
            account_id: claims.sub,
        })
    }
}
