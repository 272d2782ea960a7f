//! Authentication error taxonomy and its HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Bad ciphertext, wrong key, wrong class, or revoked access token.
    #[error("invalid token")]
    InvalidToken,
    #[error("access token has expired")]
    ExpiredToken,
    #[error("refresh token has expired")]
    RefreshExpired,
    #[error("token is not yet valid")]
    TokenNotYetValid,
    /// A superseded refresh token was replayed and the account was locked.
    #[error("suspicious activity detected")]
    SuspiciousActivity,
    #[error("session blocked")]
    SessionBlocked,
    #[error("account suspended")]
    AccountSuspended,
    #[error("account deleted")]
    AccountDeleted,
    #[error("account not found")]
    AccountNotFound,
    /// Missing or malformed credentials, or an unverified account.
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("insufficient permissions")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidToken
            | AuthError::ExpiredToken
            | AuthError::RefreshExpired
            | AuthError::TokenNotYetValid
            | AuthError::SuspiciousActivity
            | AuthError::SessionBlocked
            | AuthError::AccountSuspended
            | AuthError::AccountDeleted
            | AuthError::AccountNotFound
            | AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Token(_)
            | AuthError::Store(_)
            | AuthError::Cache(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures of a collaborator rather than of the caller's credentials.
    pub fn is_infrastructure(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Message safe to show to the client. Infrastructure details never leave the server,
    /// and deleted accounts look the same as unknown ones.
    fn public_message(&self) -> String {
        match self {
            AuthError::AccountDeleted => AuthError::AccountNotFound.to_string(),
            e if e.is_infrastructure() => "Internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.is_infrastructure() {
            error!(error = %self, "Authentication backend failure");
        }
        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.public_message(),
            }),
        )
            .into_response()
    }
}
