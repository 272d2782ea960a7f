//! Active access token cache.
//!
//! An access token is only honoured while its raw string maps to
//! [`ACTIVE_MARKER`] here. Entries expire with the token, and deleting one
//! revokes the token immediately.

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use std::time::{Duration, Instant};

/// Value stored for every live access token.
pub const ACTIVE_MARKER: &str = "active";

const MAX_ENTRIES: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("token cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn put(&self, token: &str, marker: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, token: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, token: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct Entry {
    marker: String,
    ttl: Duration,
}

/// Each entry lives exactly as long as the ttl it was stored with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backed by moka.
#[derive(Clone)]
pub struct MemoryTokenCache {
    cache: Cache<String, Entry>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MemoryTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn put(&self, token: &str, marker: &str, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.cache
            .insert(
                token.to_string(),
                Entry {
                    marker: marker.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<String>, CacheError> {
        Ok(self.cache.get(token).await.map(|entry| entry.marker))
    }

    async fn delete(&self, token: &str) -> Result<(), CacheError> {
        self.cache.invalidate(token).await;
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisTokenCache;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;
    use tracing::info;

    const KEY_PREFIX: &str = "tokenward:active:";

    /// Shared cache for multi-instance deployments.
    #[derive(Clone)]
    pub struct RedisTokenCache {
        conn: ConnectionManager,
    }

    impl RedisTokenCache {
        pub async fn connect(url: &str) -> Result<Self, CacheError> {
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            info!("Connected to redis token cache");
            Ok(Self { conn })
        }

        fn key(token: &str) -> String {
            format!("{KEY_PREFIX}{token}")
        }
    }

    #[async_trait]
    impl TokenCache for RedisTokenCache {
        async fn put(&self, token: &str, marker: &str, ttl: Duration) -> Result<(), CacheError> {
            let secs = ttl.as_secs();
            if secs == 0 {
                return Ok(());
            }
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(Self::key(token), marker, secs).await?;
            Ok(())
        }

        async fn get(&self, token: &str) -> Result<Option<String>, CacheError> {
            let mut conn = self.conn.clone();
            Ok(conn.get(Self::key(token)).await?)
        }

        async fn delete(&self, token: &str) -> Result<(), CacheError> {
            let mut conn = self.conn.clone();
            let _: i64 = conn.del(Self::key(token)).await?;
            Ok(())
        }
    }
}
