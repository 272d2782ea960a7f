//! Axum extractors for authentication.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AuthError;
use crate::token::TokenPayload;

/// Caller verified by [`super::require_auth`].
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub payload: TokenPayload,
    /// Raw access token, needed to revoke it on logout.
    pub token: String,
}

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Authenticated>()
            .cloned()
            .ok_or(AuthError::Unauthorized("not authenticated"))
    }
}
