//! Scheduled cleanup of expired sessions and idle rate limiter state.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::rate_limit::EndpointRateLimiter;
use crate::store::SessionStore;
use crate::token::unix_now;

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
pub async fn run_cleanup(sessions: &dyn SessionStore, limiter: &EndpointRateLimiter) {
    // Sessions whose refresh token can no longer be rotated
    match sessions.delete_expired(unix_now()).await {
        Ok(count) if count > 0 => info!("Cleaned up {} expired sessions", count),
        Ok(_) => {}
        Err(e) => error!("Failed to clean up expired sessions: {}", e),
    }

    // Token buckets that have fully refilled carry no state worth keeping
    limiter.retain_recent();
    debug!(buckets = limiter.len(), "Rate limiter buckets retained");
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(
    sessions: Arc<dyn SessionStore>,
    limiter: Arc<EndpointRateLimiter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(sessions.as_ref(), &limiter).await;
        }
    })
}
