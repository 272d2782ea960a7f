//! IP-keyed bucket limiter with idle sweeping.
//!
//! State is split over a fixed number of mutex-guarded shards so that
//! requests from different clients rarely contend on the same lock.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitRule;
use crate::error::AuthError;

const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

pub struct LeakyBucketLimiter {
    rule: RateLimitRule,
    shards: Box<[Mutex<HashMap<String, Bucket>>]>,
}

impl LeakyBucketLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        let shards = (0..SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { rule, shards }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn admit(&self, key: &str) -> Result<(), AuthError> {
        self.admit_at(key, Instant::now())
    }

    /// Refill the bucket for the time elapsed since its last update, then
    /// take one token.
    pub fn admit_at(&self, key: &str, now: Instant) -> Result<(), AuthError> {
        let capacity = f64::from(self.rule.burst);
        let mut shard = self
            .shard(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = shard.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rule.rate).min(capacity);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(AuthError::RateLimited)
        }
    }

    /// Remove buckets not touched for longer than `idle`. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant, idle: Duration) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = shard.len();
            shard.retain(|_, bucket| now.saturating_duration_since(bucket.last_update) <= idle);
            removed += before - shard.len();
        }
        removed
    }

    pub fn sweep(&self, idle: Duration) -> usize {
        self.sweep_at(Instant::now(), idle)
    }

    /// Sweep every `idle` interval, forever.
    pub fn spawn_sweeper(self: Arc<Self>, idle: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(idle).await;
                let removed = self.sweep(idle);
                if removed > 0 {
                    debug!(removed, "Swept idle IP rate limit buckets");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_reject_refill() {
        let limiter = LeakyBucketLimiter::new(RateLimitRule::new(1.0, 1));
        let t0 = Instant::now();

        assert!(limiter.admit_at("1.1.1.1", t0).is_ok());
        assert!(matches!(
            limiter.admit_at("1.1.1.1", t0 + Duration::from_millis(500)),
            Err(AuthError::RateLimited)
        ));
        // 500ms of credit from the rejected call is kept
        assert!(
            limiter
                .admit_at("1.1.1.1", t0 + Duration::from_millis(1000))
                .is_ok()
        );
    }

    #[test]
    fn test_burst_capacity() {
        let limiter = LeakyBucketLimiter::new(RateLimitRule::new(1.0, 3));
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(limiter.admit_at("k", t0).is_ok());
        }
        assert!(limiter.admit_at("k", t0).is_err());

        // A long pause refills only up to the burst size
        let later = t0 + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.admit_at("k", later).is_ok());
        }
        assert!(limiter.admit_at("k", later).is_err());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = LeakyBucketLimiter::new(RateLimitRule::new(1.0, 1));
        let t0 = Instant::now();
        assert!(limiter.admit_at("a", t0).is_ok());
        assert!(limiter.admit_at("a", t0).is_err());
        assert!(limiter.admit_at("b", t0).is_ok());
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_sweep_removes_idle_buckets() {
        let limiter = LeakyBucketLimiter::new(RateLimitRule::DEFAULT);
        let t0 = Instant::now();
        limiter.admit_at("old", t0).unwrap();
        limiter
            .admit_at("fresh", t0 + Duration::from_secs(50))
            .unwrap();

        let removed = limiter.sweep_at(t0 + Duration::from_secs(70), Duration::from_secs(30));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);

        // The swept client starts over with a full bucket
        for _ in 0..5 {
            assert!(
                limiter
                    .admit_at("old", t0 + Duration::from_secs(71))
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let limiter = Arc::new(LeakyBucketLimiter::new(RateLimitRule::DEFAULT));
        limiter.admit("1.1.1.1").unwrap();

        let handle = Arc::clone(&limiter).spawn_sweeper(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        assert!(limiter.is_empty());
    }
}
