//! Per-request auth gate for protected routes.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use super::bearer::bearer_token;
use super::extractors::Authenticated;
use super::routes::RouteAuthorization;
use crate::error::AuthError;
use crate::service::TokenService;

/// State for [`require_auth`].
#[derive(Clone)]
pub struct AuthGate {
    pub service: Arc<TokenService>,
    pub routes: Arc<RouteAuthorization>,
}

impl AuthGate {
    pub fn new(service: Arc<TokenService>, routes: RouteAuthorization) -> Self {
        Self {
            service,
            routes: Arc::new(routes),
        }
    }

    /// Run the gate checks for one request.
    pub async fn check(
        &self,
        method: &str,
        route: &str,
        headers: &axum::http::HeaderMap,
    ) -> Result<Authenticated, AuthError> {
        // Unknown routes fail before any token work
        if !self.routes.is_protected(method, route) {
            return Err(AuthError::Unauthorized("route not permitted"));
        }

        let token = bearer_token(headers)?;
        let payload = self.service.verify_access(token).await?;

        if !payload.data.email_verified {
            return Err(AuthError::Unauthorized("account not verified"));
        }
        if let Err(e) = self.routes.authorize(method, route, payload.data.role) {
            debug!(
                user_id = %payload.data.subject,
                role = %payload.data.role,
                route = %route,
                "Role not permitted"
            );
            return Err(e);
        }

        Ok(Authenticated {
            payload,
            token: token.to_string(),
        })
    }
}

/// Middleware: verify the bearer token and role, then hand the payload to
/// the handler through request extensions.
pub async fn require_auth(
    State(gate): State<AuthGate>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(route) = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
    else {
        return AuthError::Unauthorized("route not permitted").into_response();
    };

    let method = request.method().as_str().to_string();
    let checked = gate.check(&method, &route, request.headers()).await;
    match checked {
        Ok(authenticated) => {
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
