//! Admin API endpoints.
//!
//! Gated to super and app admins by the route table.

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use super::AppState;
use super::error::ApiError;
use crate::auth::Authenticated;

/// Suspend a user and block all of their sessions.
pub async fn block_user(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if user_id == auth.payload.data.subject {
        return Err(ApiError::bad_request("Cannot block your own account"));
    }
    if state.service.users().get_status(user_id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }

    state.guard.lock_account(user_id).await?;
    info!(admin = %auth.payload.data.subject, user_id = %user_id, "User blocked by admin");
    Ok(Json(serde_json::json!({ "user_id": user_id, "blocked": true })))
}
