mod admin;
mod error;
mod tokens;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;

use crate::auth::{AuthGate, require_auth};
use crate::rate_limit::{IpRateLimitState, RateLimitState, ip_rate_limit, rate_limit};
use crate::rotation::RotationGuard;
use crate::service::TokenService;

/// State shared by the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TokenService>,
    pub guard: RotationGuard,
}

/// Everything the router needs, already built.
pub struct ApiParts {
    pub state: AppState,
    pub gate: AuthGate,
    pub rate_limit: RateLimitState,
    pub ip_rate_limit: IpRateLimitState,
}

/// Create the API router.
///
/// Requests pass the endpoint rate limiter first, then the auth gate on
/// protected routes, then the handler. Token rotation is also behind the
/// IP-only limiter.
pub fn create_api_router(parts: ApiParts) -> Router {
    let protected = Router::new()
        .route("/api/auth/logout", post(tokens::logout))
        .route("/api/auth/profile", get(tokens::profile))
        .route(
            "/api/auth/admin/users/{user_id}/block",
            post(admin::block_user),
        )
        .route_layer(from_fn_with_state(parts.gate, require_auth));

    let public = Router::new()
        .route(
            "/api/auth/rotate_token",
            post(tokens::rotate_token).layer(from_fn_with_state(parts.ip_rate_limit, ip_rate_limit)),
        )
        .route("/api/auth/home", get(tokens::home));

    public
        .merge(protected)
        .layer(from_fn_with_state(parts.rate_limit, rate_limit))
        .with_state(parts.state)
}
