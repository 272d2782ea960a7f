//! Per (endpoint, client) token buckets on top of governor's keyed GCRA limiters.

use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;

use crate::config::{RateLimitRule, RouteTable};
use crate::error::AuthError;

/// Keyed limiter with governor's default sharded state store.
pub type KeyedLimiter<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

fn quota(rule: &RateLimitRule) -> Quota {
    let burst = NonZeroU32::new(rule.burst).unwrap_or(NonZeroU32::MIN);
    rule.period()
        .and_then(Quota::with_period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst)
}

fn keyed<K: Clone + Hash + Eq>(rule: &RateLimitRule) -> KeyedLimiter<K> {
    RateLimiter::keyed(quota(rule))
}

/// One limiter per configured endpoint, keyed by client. Endpoints without
/// their own rule share a default limiter keyed by (endpoint, client).
pub struct EndpointRateLimiter {
    endpoints: HashMap<String, KeyedLimiter<String>>,
    fallback: KeyedLimiter<(String, String)>,
}

impl EndpointRateLimiter {
    pub fn new(default: RateLimitRule, table: &RouteTable) -> Self {
        let endpoints = table
            .routes
            .iter()
            .filter_map(|rule| {
                rule.rate_limit
                    .as_ref()
                    .map(|limit| (rule.key(), keyed(limit)))
            })
            .collect();
        Self {
            endpoints,
            fallback: keyed(&default),
        }
    }

    /// Take one token from the bucket of `client` on `endpoint`.
    pub fn admit(&self, endpoint: &str, client: &str) -> Result<(), AuthError> {
        let admitted = match self.endpoints.get(endpoint) {
            Some(limiter) => limiter.check_key(&client.to_string()).is_ok(),
            None => self
                .fallback
                .check_key(&(endpoint.to_string(), client.to_string()))
                .is_ok(),
        };
        if admitted {
            Ok(())
        } else {
            Err(AuthError::RateLimited)
        }
    }

    /// Drop buckets that have refilled completely. They carry no state.
    pub fn retain_recent(&self) {
        for limiter in self.endpoints.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
        self.fallback.retain_recent();
        self.fallback.shrink_to_fit();
    }

    /// Number of tracked (endpoint, client) buckets.
    pub fn len(&self) -> usize {
        self.endpoints.values().map(|l| l.len()).sum::<usize>() + self.fallback.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteRule;
    use std::time::Duration;

    fn limiter(rate: f64, burst: u32) -> EndpointRateLimiter {
        let table = RouteTable {
            routes: vec![RouteRule::new("POST", "/login", &[]).with_rate_limit(rate, burst)],
        };
        EndpointRateLimiter::new(RateLimitRule::DEFAULT, &table)
    }

    #[tokio::test]
    async fn test_one_per_second_refills() {
        let limiter = limiter(1.0, 1);
        assert!(limiter.admit("POST /login", "1.1.1.1").is_ok());
        assert!(matches!(
            limiter.admit("POST /login", "1.1.1.1"),
            Err(AuthError::RateLimited)
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.admit("POST /login", "1.1.1.1").is_ok());
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = limiter(0.01, 3);
        for _ in 0..3 {
            assert!(limiter.admit("POST /login", "1.1.1.1").is_ok());
        }
        assert!(limiter.admit("POST /login", "1.1.1.1").is_err());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(0.01, 1);
        assert!(limiter.admit("POST /login", "1.1.1.1").is_ok());
        assert!(limiter.admit("POST /login", "1.1.1.1").is_err());
        assert!(limiter.admit("POST /login", "2.2.2.2").is_ok());
    }

    #[test]
    fn test_default_applies_per_endpoint() {
        let limiter = limiter(0.01, 1);
        // Default is burst 5 for any unconfigured endpoint
        for _ in 0..5 {
            assert!(limiter.admit("GET /other", "1.1.1.1").is_ok());
        }
        assert!(limiter.admit("GET /other", "1.1.1.1").is_err());
        // A different unconfigured endpoint has its own bucket
        assert!(limiter.admit("GET /another", "1.1.1.1").is_ok());
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_fractional_rate() {
        // One per minute
        let limiter = limiter(1.0 / 60.0, 1);
        assert!(limiter.admit("POST /login", "1.1.1.1").is_ok());
        assert!(limiter.admit("POST /login", "1.1.1.1").is_err());
    }

    #[tokio::test]
    async fn test_retain_recent_evicts_refilled_buckets() {
        let limiter = limiter(20.0, 1);
        limiter.admit("POST /login", "1.1.1.1").unwrap();
        assert_eq!(limiter.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        limiter.retain_recent();
        assert!(limiter.is_empty());
    }
}
