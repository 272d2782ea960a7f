//! Token endpoints.
//!
//! - POST `/rotate_token` - Exchange a refresh token for a new pair (public)
//! - POST `/logout` - Revoke the access token, and the session if a refresh token is sent
//! - GET `/profile` - Claims of the current access token
//! - GET `/home` - Public landing endpoint

use axum::{Json, body::Bytes, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use super::error::ApiError;
use crate::auth::Authenticated;
use crate::service::AuthToken;
use crate::store::Role;

#[derive(Deserialize)]
pub struct RotateRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
struct LogoutRequest {
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct ProfileResponse {
    user_id: Uuid,
    role: Role,
    username: String,
    email: String,
    phone: String,
    email_verified: bool,
    mfa_passed: bool,
    expires_at: i64,
}

/// Rotate a refresh token. A replayed token locks the account.
pub async fn rotate_token(
    State(state): State<AppState>,
    Json(request): Json<RotateRequest>,
) -> Result<Json<AuthToken>, ApiError> {
    let token = state.guard.rotate(&request.refresh_token).await?;
    Ok(Json(token))
}

/// Log out. The body is optional: `{"refresh_token": "..."}` also closes the session.
pub async fn logout(
    State(state): State<AppState>,
    auth: Authenticated,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let refresh_token = if body.is_empty() {
        None
    } else {
        let request: LogoutRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid logout request: {e}")))?;
        request.refresh_token
    };

    state
        .service
        .logout(&auth.payload, &auth.token, refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn profile(auth: Authenticated) -> impl IntoResponse {
    let payload = auth.payload;
    Json(ProfileResponse {
        user_id: payload.data.subject,
        role: payload.data.role,
        username: payload.data.username,
        email: payload.data.email,
        phone: payload.data.phone,
        email_verified: payload.data.email_verified,
        mfa_passed: payload.data.mfa_passed,
        expires_at: payload.exp,
    })
}

pub async fn home() -> impl IntoResponse {
    Json(serde_json::json!({ "service": "tokenward", "status": "ok" }))
}
