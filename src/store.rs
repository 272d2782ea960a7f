//! Persistence contracts consumed by the token engine.
//!
//! The engine never talks to a database directly. It needs a place to keep
//! login sessions (one current refresh token per session) and a way to read
//! and flag account status. `crate::db` provides SQLite implementations of
//! both traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User role for route authorization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Role {
    SuperAdmin = 1,
    AppAdmin = 2,
    #[default]
    User = 3,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::AppAdmin => "app_admin",
            Role::User => "user",
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Every role, highest privilege first.
    pub const ALL: [Role; 3] = [Role::SuperAdmin, Role::AppAdmin, Role::User];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Role::SuperAdmin),
            "app_admin" => Ok(Role::AppAdmin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One login session. Exactly one refresh token is current per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token: String,
    /// Unix seconds
    pub refresh_expires_at: i64,
    pub user_agent: String,
    pub ip_address: String,
    pub blocked_at: Option<i64>,
    pub invalidated_at: Option<i64>,
    pub created_at: i64,
}

impl Session {
    /// A blocked or invalidated session can never rotate again.
    pub fn is_blocked(&self) -> bool {
        self.blocked_at.is_some() || self.invalidated_at.is_some()
    }
}

/// Data needed to open a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
    pub user_agent: String,
    pub ip_address: String,
}

/// Account flags that gate token issuance and rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStatus {
    pub suspended: bool,
    pub deleted: bool,
}

/// Identity claims as currently stored for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserClaims {
    pub role: Role,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub email_verified: bool,
}

/// Errors reported by persistence collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &NewSession) -> Result<(), StoreError>;

    /// Find the session whose *current* refresh token is `token`.
    async fn get_by_refresh_token(&self, token: &str) -> Result<Option<Session>, StoreError>;

    /// Replace the session's refresh token, but only if `current_token` is
    /// still the stored one and the session is neither blocked nor
    /// invalidated. Returns false when the swap lost.
    async fn overwrite_tokens(
        &self,
        session_id: Uuid,
        current_token: &str,
        new_token: &str,
        new_expires_at: i64,
    ) -> Result<bool, StoreError>;

    /// Set `blocked_at` on every session owned by the user.
    async fn block_all_sessions(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Mark a single session invalidated (logout).
    async fn revoke_by_id(&self, session_id: Uuid) -> Result<bool, StoreError>;

    /// Remove sessions whose refresh token expired before `now`.
    async fn delete_expired(&self, now: i64) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns `None` for unknown users.
    async fn get_status(&self, user_id: Uuid) -> Result<Option<UserStatus>, StoreError>;

    /// Current role and contact claims. Returns `None` for unknown users.
    async fn get_claims(&self, user_id: Uuid) -> Result<Option<UserClaims>, StoreError>;

    /// Suspend the account.
    async fn block_user(&self, user_id: Uuid) -> Result<(), StoreError>;
}
