//! `Authorization: Bearer` header parsing.

use axum::http::{HeaderMap, header};

use crate::error::AuthError;

/// Extract the token from `Authorization: Bearer <token>`.
/// The scheme is matched case-insensitively and must be followed by exactly one token.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Unauthorized("missing authorization header"))?
        .to_str()
        .map_err(|_| AuthError::Unauthorized("malformed authorization header"))?;

    let mut fields = value.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(AuthError::Unauthorized("malformed authorization header")),
    }
}
