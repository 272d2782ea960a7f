//! Login sessions. Each row holds the one refresh token that is currently
//! allowed to rotate.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use super::parse_uuid;
use crate::store::{NewSession, Session, SessionStore, StoreError};

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    refresh_token: String,
    refresh_expires_at: i64,
    user_agent: String,
    ip_address: String,
    blocked_at: Option<i64>,
    invalidated_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid("sessions", &row.id)?,
            user_id: parse_uuid("sessions", &row.user_id)?,
            refresh_token: row.refresh_token,
            refresh_expires_at: row.refresh_expires_at,
            user_agent: row.user_agent,
            ip_address: row.ip_address,
            blocked_at: row.blocked_at,
            invalidated_at: row.invalidated_at,
            created_at: row.created_at,
        })
    }
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All sessions of a user, newest first.
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, user_id, refresh_token, refresh_expires_at, user_agent, ip_address, blocked_at, invalidated_at, created_at FROM sessions WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, user_id, refresh_token, refresh_expires_at, user_agent, ip_address, blocked_at, invalidated_at, created_at FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &NewSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, refresh_token, refresh_expires_at, user_agent, ip_address) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.refresh_token)
        .bind(session.refresh_expires_at)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_refresh_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, user_id, refresh_token, refresh_expires_at, user_agent, ip_address, blocked_at, invalidated_at, created_at FROM sessions WHERE refresh_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    async fn overwrite_tokens(
        &self,
        session_id: Uuid,
        current_token: &str,
        new_token: &str,
        new_expires_at: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET refresh_token = ?, refresh_expires_at = ? WHERE id = ? AND refresh_token = ? AND blocked_at IS NULL AND invalidated_at IS NULL",
        )
        .bind(new_token)
        .bind(new_expires_at)
        .bind(session_id.to_string())
        .bind(current_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn block_all_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET blocked_at = unixepoch() WHERE user_id = ? AND blocked_at IS NULL",
        )
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_by_id(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET invalidated_at = unixepoch() WHERE id = ? AND invalidated_at IS NULL",
        )
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE refresh_expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewUser};
    use crate::store::Role;

    async fn setup() -> (Database, Uuid) {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db
            .users()
            .create(&NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                phone: String::new(),
                role: Role::User,
                email_verified: true,
            })
            .await
            .unwrap();
        (db, user_id)
    }

    fn new_session(user_id: Uuid, token: &str, expires_at: i64) -> NewSession {
        NewSession {
            id: Uuid::new_v4(),
            user_id,
            refresh_token: token.into(),
            refresh_expires_at: expires_at,
            user_agent: "test-agent".into(),
            ip_address: "127.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let new = new_session(user_id, "r1", 1_000);
        sessions.create(&new).await.unwrap();

        let session = sessions.get_by_refresh_token("r1").await.unwrap().unwrap();
        assert_eq!(session.id, new.id);
        assert_eq!(session.user_id, user_id);
        assert_eq!(session.refresh_expires_at, 1_000);
        assert_eq!(session.user_agent, "test-agent");
        assert_eq!(session.ip_address, "127.0.0.1");
        assert!(!session.is_blocked());
        assert!(session.created_at > 0);

        assert!(sessions.get_by_refresh_token("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_is_compare_and_swap() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let new = new_session(user_id, "r1", 1_000);
        sessions.create(&new).await.unwrap();

        assert!(sessions.overwrite_tokens(new.id, "r1", "r2", 2_000).await.unwrap());
        // The old token no longer matches, so a second swap from it loses.
        assert!(!sessions.overwrite_tokens(new.id, "r1", "r3", 3_000).await.unwrap());

        assert!(sessions.get_by_refresh_token("r1").await.unwrap().is_none());
        let session = sessions.get_by_refresh_token("r2").await.unwrap().unwrap();
        assert_eq!(session.refresh_expires_at, 2_000);
    }

    #[tokio::test]
    async fn test_blocked_session_cannot_be_overwritten() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let a = new_session(user_id, "a1", 1_000);
        let b = new_session(user_id, "b1", 1_000);
        sessions.create(&a).await.unwrap();
        sessions.create(&b).await.unwrap();

        assert_eq!(sessions.block_all_sessions(user_id).await.unwrap(), 2);
        // Already blocked rows keep their original timestamp
        assert_eq!(sessions.block_all_sessions(user_id).await.unwrap(), 0);

        assert!(!sessions.overwrite_tokens(a.id, "a1", "a2", 2_000).await.unwrap());
        for session in sessions.list_by_user(user_id).await.unwrap() {
            assert!(session.blocked_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_revoke_by_id() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let new = new_session(user_id, "r1", 1_000);
        sessions.create(&new).await.unwrap();

        assert!(sessions.revoke_by_id(new.id).await.unwrap());
        assert!(!sessions.revoke_by_id(new.id).await.unwrap());
        assert!(!sessions.revoke_by_id(Uuid::new_v4()).await.unwrap());

        let session = sessions.get_by_id(new.id).await.unwrap().unwrap();
        assert!(session.invalidated_at.is_some());
        assert!(session.is_blocked());
        assert!(!sessions.overwrite_tokens(new.id, "r1", "r2", 2_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        sessions.create(&new_session(user_id, "old", 100)).await.unwrap();
        sessions.create(&new_session(user_id, "new", 10_000)).await.unwrap();

        assert_eq!(sessions.delete_expired(5_000).await.unwrap(), 1);
        assert!(sessions.get_by_refresh_token("old").await.unwrap().is_none());
        assert!(sessions.get_by_refresh_token("new").await.unwrap().is_some());
    }
}
