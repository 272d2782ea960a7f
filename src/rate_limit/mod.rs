//! Rate limiting middleware.
//!
//! Every route passes through a token bucket keyed by endpoint and client IP
//! ([`EndpointRateLimiter`]). The public token endpoints additionally sit
//! behind an IP-only bucket ([`LeakyBucketLimiter`]).

mod leaky_bucket;
mod token_bucket;

use axum::{
    Json,
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub use leaky_bucket::LeakyBucketLimiter;
pub use token_bucket::{EndpointRateLimiter, KeyedLimiter};

use crate::auth::{IpExtractor, extract_client_ip};
use crate::config::route_key;

/// Route label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "*";

fn unknown_client() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "Unable to determine client IP" })),
    )
        .into_response()
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<EndpointRateLimiter>,
    pub ip_extractor: Option<IpExtractor>,
}

/// Middleware for the per-endpoint token bucket.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, state.ip_extractor.as_ref()) {
        Ok(ip) => ip,
        Err(_) => return unknown_client(),
    };

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or(UNMATCHED_ROUTE);
    let endpoint = route_key(request.method().as_str(), route);

    match state.limiter.admit(&endpoint, &ip) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(endpoint = %endpoint, ip = %ip, "Rate limited");
            e.into_response()
        }
    }
}

#[derive(Clone)]
pub struct IpRateLimitState {
    pub limiter: Arc<LeakyBucketLimiter>,
    pub ip_extractor: Option<IpExtractor>,
}

/// Middleware for the IP-only bucket.
pub async fn ip_rate_limit(
    State(state): State<IpRateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, state.ip_extractor.as_ref()) {
        Ok(ip) => ip,
        Err(_) => return unknown_client(),
    };

    match state.limiter.admit(&ip) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(ip = %ip, "IP rate limited");
            e.into_response()
        }
    }
}
