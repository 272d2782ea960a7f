//! Engine configuration and the route table file format.
//!
//! The route table is a JSON list. Each entry names a method and an axum
//! route template, the roles allowed through the auth gate, and an optional
//! token bucket override:
//!
//! ```json
//! [
//!   { "method": "POST", "route": "/api/auth/logout",
//!     "allowed_roles": ["super_admin", "app_admin", "user"],
//!     "rate_limit": { "rate": 0.2, "burst": 3 } }
//! ]
//! ```
//!
//! An entry with no roles is public: it is rate limited but never gated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::store::Role;

/// Access token lifetime: 15 minutes
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

/// Refresh token lifetime: 7 days
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// A refresh token becomes usable when the access token minted with it expires.
pub const DEFAULT_REFRESH_ACTIVATION_DELAY_SECS: i64 = DEFAULT_ACCESS_TTL_SECS;

/// Upper bound for any configured token lifetime or delay: 1 year
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// Leaky bucket entries idle longer than this are swept.
pub const DEFAULT_IP_BUCKET_IDLE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid rate limit for {route}: {reason}")]
    InvalidRateLimit { route: String, reason: &'static str },
    #[error("invalid route entry: {0}")]
    InvalidRoute(String),
    #[error("invalid {field}: {reason}")]
    InvalidLifetime {
        field: &'static str,
        reason: &'static str,
    },
}

/// Token bucket parameters: `rate` tokens per second, at most `burst` stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub rate: f64,
    pub burst: u32,
}

impl RateLimitRule {
    pub const DEFAULT: RateLimitRule = RateLimitRule {
        rate: 1.0,
        burst: 5,
    };

    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Time to regain one token. `None` when the rate is not a usable number.
    pub fn period(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(1.0 / self.rate)
            .ok()
            .filter(|period| !period.is_zero())
    }

    fn validate(&self, route: &str) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::InvalidRateLimit {
            route: route.to_string(),
            reason,
        };
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(invalid("rate must be a positive number"));
        }
        // Periods shorter than a nanosecond cannot be represented
        if self.rate > 1e9 {
            return Err(invalid("rate must be at most 1e9 per second"));
        }
        if self.burst == 0 {
            return Err(invalid("burst must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One row of the route table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    pub method: String,
    /// Axum route template, e.g. `/api/auth/admin/users/{user_id}/block`
    pub route: String,
    #[serde(default)]
    pub allowed_roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
}

impl RouteRule {
    pub fn new(method: &str, route: &str, allowed_roles: &[Role]) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            route: route.to_string(),
            allowed_roles: allowed_roles.to_vec(),
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, rate: f64, burst: u32) -> Self {
        self.rate_limit = Some(RateLimitRule::new(rate, burst));
        self
    }

    pub fn key(&self) -> String {
        route_key(&self.method, &self.route)
    }

    pub fn is_public(&self) -> bool {
        self.allowed_roles.is_empty()
    }
}

/// Key used by the auth gate and the rate limiter: `"METHOD /template"`.
pub fn route_key(method: &str, route: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), route)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    pub routes: Vec<RouteRule>,
}

impl RouteTable {
    /// Table for the routes served by [`crate::api`].
    pub fn builtin() -> Self {
        let everyone = &Role::ALL;
        let admins = &[Role::SuperAdmin, Role::AppAdmin];
        Self {
            routes: vec![
                RouteRule::new("POST", "/api/auth/rotate_token", &[])
                    .with_rate_limit(1.0 / 60.0, 1),
                RouteRule::new("POST", "/api/auth/logout", everyone).with_rate_limit(0.2, 3),
                RouteRule::new("GET", "/api/auth/profile", everyone),
                RouteRule::new("POST", "/api/auth/admin/users/{user_id}/block", admins),
                RouteRule::new("GET", "/api/auth/home", &[]),
            ],
        }
    }

    /// Read a JSON route table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Entries of `other` replace entries of `self` with the same method and route.
    pub fn merge(mut self, other: RouteTable) -> Self {
        for rule in other.routes {
            let key = rule.key();
            match self.routes.iter_mut().find(|r| r.key() == key) {
                Some(existing) => *existing = rule,
                None => self.routes.push(rule),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.routes {
            if rule.method.is_empty() || !rule.method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ConfigError::InvalidRoute(format!(
                    "bad method {:?} for {}",
                    rule.method, rule.route
                )));
            }
            if !rule.route.starts_with('/') {
                return Err(ConfigError::InvalidRoute(format!(
                    "route must start with '/': {}",
                    rule.route
                )));
            }
            if let Some(limit) = &rule.rate_limit {
                limit.validate(&rule.key())?;
            }
        }
        Ok(())
    }
}

/// Everything the engine needs at startup.
#[derive(Clone)]
pub struct AuthConfig {
    pub access_secret: Vec<u8>,
    pub refresh_secret: Vec<u8>,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub refresh_activation_delay_secs: i64,
    /// Token bucket for routes without their own `rate_limit`.
    pub default_rate_limit: RateLimitRule,
    /// Leaky bucket guarding the public token endpoints, keyed by client IP.
    pub ip_rate_limit: RateLimitRule,
    pub ip_bucket_idle: Duration,
    pub issuer: String,
    pub audience: String,
    pub routes: RouteTable,
}

impl AuthConfig {
    pub fn new(access_secret: impl Into<Vec<u8>>, refresh_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            refresh_activation_delay_secs: DEFAULT_REFRESH_ACTIVATION_DELAY_SECS,
            default_rate_limit: RateLimitRule::DEFAULT,
            ip_rate_limit: RateLimitRule::DEFAULT,
            ip_bucket_idle: DEFAULT_IP_BUCKET_IDLE,
            issuer: "tokenward".to_string(),
            audience: "tokenward".to_string(),
            routes: RouteTable::builtin(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_lifetime("access_ttl_secs", self.access_ttl_secs, 1)?;
        check_lifetime("refresh_ttl_secs", self.refresh_ttl_secs, 1)?;
        check_lifetime(
            "refresh_activation_delay_secs",
            self.refresh_activation_delay_secs,
            0,
        )?;
        if self.ip_bucket_idle.is_zero() {
            return Err(ConfigError::InvalidLifetime {
                field: "ip_bucket_idle",
                reason: "must be positive",
            });
        }
        self.default_rate_limit.validate("default")?;
        self.ip_rate_limit.validate("ip")?;
        self.routes.validate()
    }
}

fn check_lifetime(field: &'static str, secs: i64, min: i64) -> Result<(), ConfigError> {
    if secs < min {
        let reason = if min > 0 {
            "must be positive"
        } else {
            "must not be negative"
        };
        return Err(ConfigError::InvalidLifetime { field, reason });
    }
    if secs > MAX_TOKEN_LIFETIME_SECS {
        return Err(ConfigError::InvalidLifetime {
            field,
            reason: "exceeds one year",
        });
    }
    Ok(())
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field(
                "refresh_activation_delay_secs",
                &self.refresh_activation_delay_secs,
            )
            .field("default_rate_limit", &self.default_rate_limit)
            .field("ip_rate_limit", &self.ip_rate_limit)
            .field("ip_bucket_idle", &self.ip_bucket_idle)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("routes", &self.routes.routes.len())
            .finish()
    }
}
