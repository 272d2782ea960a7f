//! Refresh token reuse detection.
//!
//! A refresh token is single use. Presenting one that is no longer the
//! current token of any session means it was copied, so the whole account
//! is locked: the user is suspended and every session is blocked.

use futures::future::join;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::AuthError;
use crate::service::{AuthToken, Rotation, TokenService};
use crate::store::Session;
use crate::token::TokenClass;

/// How a presented refresh token relates to the stored sessions.
#[derive(Debug)]
pub enum Presented {
    /// The session's current token, session still usable.
    Current(Session),
    /// The session's current token, but the session was blocked or closed.
    Blocked(Session),
    /// No session holds this token any more.
    Stale,
}

#[derive(Clone)]
pub struct RotationGuard {
    service: Arc<TokenService>,
}

impl RotationGuard {
    pub fn new(service: Arc<TokenService>) -> Self {
        Self { service }
    }

    /// Exchange a refresh token for a new pair, or lock the account on reuse.
    pub async fn rotate(&self, refresh_token: &str) -> Result<AuthToken, AuthError> {
        let service = &self.service;
        let payload = service
            .codec()
            .verify(service.cache(), refresh_token, TokenClass::Refresh)
            .await?;
        let user_id = payload.data.subject;
        service.check_account(user_id).await?;

        match self.classify(refresh_token).await? {
            Presented::Current(session) => {
                if session.user_id != user_id {
                    error!(
                        session_id = %session.id,
                        user_id = %user_id,
                        "Refresh token subject does not own its session"
                    );
                    return Err(AuthError::InvalidToken);
                }
                match service
                    .rotate_verified(session.id, refresh_token, &payload)
                    .await?
                {
                    Rotation::Rotated(token) => Ok(token),
                    Rotation::Superseded => Err(self.lock_out(user_id).await),
                }
            }
            Presented::Blocked(_) => Err(AuthError::SessionBlocked),
            Presented::Stale => Err(self.lock_out(user_id).await),
        }
    }

    pub async fn classify(&self, refresh_token: &str) -> Result<Presented, AuthError> {
        let session = self
            .service
            .sessions()
            .get_by_refresh_token(refresh_token)
            .await?;
        Ok(match session {
            Some(session) if session.is_blocked() => Presented::Blocked(session),
            Some(session) => Presented::Current(session),
            None => Presented::Stale,
        })
    }

    /// Suspend the user and block all their sessions, concurrently.
    pub async fn lock_account(&self, user_id: Uuid) -> Result<(), AuthError> {
        let (user, sessions) = join(
            self.service.users().block_user(user_id),
            self.service.sessions().block_all_sessions(user_id),
        )
        .await;
        user?;
        let blocked = sessions?;
        warn!(user_id = %user_id, sessions = blocked, "Account locked");
        Ok(())
    }

    async fn lock_out(&self, user_id: Uuid) -> AuthError {
        warn!(user_id = %user_id, "Refresh token reuse detected");
        match self.lock_account(user_id).await {
            Ok(()) => AuthError::SuspiciousActivity,
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTokenCache;
    use crate::config::AuthConfig;
    use crate::db::{Database, NewUser};
    use crate::service::ClientContext;
    use crate::store::{Role, SessionStore, UserDirectory};
    use crate::token::{PayloadData, TokenCodec};

    const SECRET: &[u8] = b"rotation-secret-for-tests-0123456789abcdef";

    async fn setup() -> (Database, RotationGuard, Uuid) {
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
        let config = AuthConfig::new(SECRET, SECRET);
        let service = TokenService::new(
            Arc::new(TokenCodec::new(SECRET, SECRET, 0).unwrap()),
            Arc::new(MemoryTokenCache::new()),
            Arc::new(db.sessions()),
            Arc::new(db.users()),
            &config,
        );
        (db, RotationGuard::new(Arc::new(service)), user_id)
    }

    async fn login(guard: &RotationGuard, user_id: Uuid) -> AuthToken {
        let identity = PayloadData {
            subject: user_id,
            role: Role::User,
            username: "alice".into(),
            email_verified: true,
            ..Default::default()
        };
        guard
            .service
            .start_session(identity, &ClientContext::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rotation_chain() {
        let (_db, guard, user_id) = setup().await;
        let t0 = login(&guard, user_id).await;
        let t1 = guard.rotate(&t0.refresh_token).await.unwrap();
        let t2 = guard.rotate(&t1.refresh_token).await.unwrap();
        assert_ne!(t1.refresh_token, t2.refresh_token);
    }

    #[tokio::test]
    async fn test_reuse_locks_account() {
        let (db, guard, user_id) = setup().await;
        let t0 = login(&guard, user_id).await;
        let other_session = login(&guard, user_id).await;

        let t1 = guard.rotate(&t0.refresh_token).await.unwrap();

        // Replaying the superseded token triggers the lockout
        assert!(matches!(
            guard.rotate(&t0.refresh_token).await,
            Err(AuthError::SuspiciousActivity)
        ));

        let status = db.users().get_status(user_id).await.unwrap().unwrap();
        assert!(status.suspended);
        for session in db.sessions().list_by_user(user_id).await.unwrap() {
            assert!(session.blocked_at.is_some());
        }

        // Even the legitimate holders are now out
        assert!(matches!(
            guard.rotate(&t1.refresh_token).await,
            Err(AuthError::AccountSuspended)
        ));
        assert!(matches!(
            guard.rotate(&other_session.refresh_token).await,
            Err(AuthError::AccountSuspended)
        ));
        // And so is a fresh login
        let identity = PayloadData {
            subject: user_id,
            ..Default::default()
        };
        assert!(matches!(
            guard
                .service
                .start_session(identity, &ClientContext::default())
                .await,
            Err(AuthError::AccountSuspended)
        ));
    }

    #[tokio::test]
    async fn test_blocked_session() {
        let (db, guard, user_id) = setup().await;
        let t0 = login(&guard, user_id).await;
        let session = db
            .sessions()
            .get_by_refresh_token(&t0.refresh_token)
            .await
            .unwrap()
            .unwrap();
        db.sessions().revoke_by_id(session.id).await.unwrap();

        assert!(matches!(
            guard.classify(&t0.refresh_token).await.unwrap(),
            Presented::Blocked(_)
        ));
        assert!(matches!(
            guard.rotate(&t0.refresh_token).await,
            Err(AuthError::SessionBlocked)
        ));
        // A closed session is not evidence of theft
        let status = db.users().get_status(user_id).await.unwrap().unwrap();
        assert!(!status.suspended);
    }

    #[tokio::test]
    async fn test_invalid_token_does_not_lock() {
        let (db, guard, user_id) = setup().await;
        login(&guard, user_id).await;
        assert!(matches!(
            guard.rotate("tw1.local.garbage").await,
            Err(AuthError::InvalidToken)
        ));
        let status = db.users().get_status(user_id).await.unwrap().unwrap();
        assert!(!status.suspended);
    }

    #[tokio::test]
    async fn test_access_token_cannot_rotate() {
        let (_db, guard, user_id) = setup().await;
        let t0 = login(&guard, user_id).await;
        assert!(matches!(
            guard.rotate(&t0.access_token).await,
            Err(AuthError::InvalidToken)
        ));
    }
}
