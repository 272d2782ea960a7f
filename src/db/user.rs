use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use super::parse_uuid;
use crate::store::{Role, StoreError, UserClaims, UserDirectory, UserStatus};
use crate::token::PayloadData;

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub email_verified: bool,
    pub suspended: bool,
    pub deleted: bool,
    pub created_at: i64,
}

/// Fields supplied when provisioning an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub email_verified: bool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    phone: String,
    role: String,
    email_verified: i32,
    suspended: i32,
    deleted_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row.role.parse().map_err(|reason| StoreError::Corrupt {
            table: "users",
            reason,
        })?;
        Ok(Self {
            id: parse_uuid("users", &row.id)?,
            username: row.username,
            email: row.email,
            phone: row.phone,
            role,
            email_verified: row.email_verified != 0,
            suspended: row.suspended != 0,
            deleted: row.deleted_at.is_some(),
            created_at: row.created_at,
        })
    }
}

impl From<&User> for PayloadData {
    fn from(user: &User) -> Self {
        Self {
            subject: user.id,
            role: user.role,
            username: user.username.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            email_verified: user.email_verified,
            ..Default::default()
        }
    }
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. Returns the generated user ID.
    pub async fn create(&self, user: &NewUser) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, username, email, phone, role, email_verified) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.email_verified as i32)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Get a user by ID, including suspended and deleted accounts.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, email, phone, role, email_verified, suspended, deleted_at, created_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    /// Get a user by username (case-insensitive).
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, email, phone, role, email_verified, suspended, deleted_at, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    pub async fn set_email_verified(&self, id: Uuid, verified: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET email_verified = ? WHERE id = ?")
            .bind(verified as i32)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_role(&self, id: Uuid, role: Role) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Suspend an account. Returns false if the user does not exist.
    pub async fn suspend(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET suspended = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lift a suspension.
    pub async fn unsuspend(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET suspended = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft delete: the row stays so that old tokens resolve to a deleted account.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = unixepoch() WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UserDirectory for UserStore {
    async fn get_status(&self, user_id: Uuid) -> Result<Option<UserStatus>, StoreError> {
        let row: Option<(i32, Option<i64>)> =
            sqlx::query_as("SELECT suspended, deleted_at FROM users WHERE id = ?")
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(suspended, deleted_at)| UserStatus {
            suspended: suspended != 0,
            deleted: deleted_at.is_some(),
        }))
    }

    async fn get_claims(&self, user_id: Uuid) -> Result<Option<UserClaims>, StoreError> {
        Ok(self.get_by_id(user_id).await?.map(|user| UserClaims {
            role: user.role,
            username: user.username,
            email: user.email,
            phone: user.phone,
            email_verified: user.email_verified,
        }))
    }

    async fn block_user(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.suspend(user_id).await?;
        Ok(())
    }
}
