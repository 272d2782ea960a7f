//! Paired token issuance, rotation, login sessions and logout.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ACTIVE_MARKER, TokenCache};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::{NewSession, SessionStore, UserDirectory};
use crate::token::{IssuedToken, PayloadData, TokenClass, TokenCodec, TokenPayload};

/// Token pair handed to the client.
#[derive(Debug, Clone, Serialize)]
pub struct AuthToken {
    pub access_token: String,
    /// Unix seconds
    pub access_expires_at: i64,
    pub refresh_token: String,
    /// Unix seconds
    pub refresh_expires_at: i64,
}

/// Where a request came from. Recorded on new sessions and in token claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: String,
    pub user_agent: String,
}

/// Outcome of overwriting a session's refresh token.
#[derive(Debug)]
pub enum Rotation {
    Rotated(AuthToken),
    /// Another rotation (or a block) changed the session first.
    Superseded,
}

pub struct TokenService {
    codec: Arc<TokenCodec>,
    cache: Arc<dyn TokenCache>,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserDirectory>,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    issuer: String,
    audience: String,
}

impl TokenService {
    pub fn new(
        codec: Arc<TokenCodec>,
        cache: Arc<dyn TokenCache>,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserDirectory>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            codec,
            cache,
            sessions,
            users,
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn cache(&self) -> &dyn TokenCache {
        self.cache.as_ref()
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub fn users(&self) -> &dyn UserDirectory {
        self.users.as_ref()
    }

    /// Verify an access token, including its live cache entry.
    pub async fn verify_access(&self, token: &str) -> Result<TokenPayload, AuthError> {
        self.codec
            .verify(self.cache.as_ref(), token, TokenClass::Access)
            .await
    }

    /// Mint an access and a refresh token concurrently, then mark the access
    /// token live in the cache.
    pub async fn issue_pair(&self, data: &PayloadData) -> Result<AuthToken, AuthError> {
        let mut tasks = JoinSet::new();
        for (class, ttl) in [
            (TokenClass::Access, self.access_ttl_secs),
            (TokenClass::Refresh, self.refresh_ttl_secs),
        ] {
            let codec = Arc::clone(&self.codec);
            let data = data.clone();
            tasks.spawn(async move { (class, codec.issue(&data, ttl, class)) });
        }

        let mut access: Option<IssuedToken> = None;
        let mut refresh: Option<IssuedToken> = None;
        while let Some(joined) = tasks.join_next().await {
            let (class, result) = match joined {
                Ok(output) => output,
                Err(e) => {
                    tasks.abort_all();
                    return Err(AuthError::Internal(format!("token task failed: {e}")));
                }
            };
            let issued = match result {
                Ok(issued) => issued,
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
            };
            match class {
                TokenClass::Access => access = Some(issued),
                TokenClass::Refresh => refresh = Some(issued),
            }
        }

        let (Some(access), Some(refresh)) = (access, refresh) else {
            return Err(AuthError::Internal("token pair incomplete".into()));
        };

        let ttl = Duration::from_secs(self.access_ttl_secs.max(0) as u64);
        self.cache.put(&access.token, ACTIVE_MARKER, ttl).await?;

        Ok(AuthToken {
            access_expires_at: access.payload.exp,
            access_token: access.token,
            refresh_expires_at: refresh.payload.exp,
            refresh_token: refresh.token,
        })
    }

    /// Open a new login session for an already authenticated user.
    pub async fn start_session(
        &self,
        mut identity: PayloadData,
        client: &ClientContext,
    ) -> Result<AuthToken, AuthError> {
        self.check_account(identity.subject).await?;

        let session_id = Uuid::new_v4();
        identity.session_id = Some(session_id);
        identity.client_ip = client.ip.clone();
        identity.user_agent = client.user_agent.clone();
        identity.issuer = self.issuer.clone();
        identity.audience = self.audience.clone();

        let token = self.issue_pair(&identity).await?;
        let created = self
            .sessions
            .create(&NewSession {
                id: session_id,
                user_id: identity.subject,
                refresh_token: token.refresh_token.clone(),
                refresh_expires_at: token.refresh_expires_at,
                user_agent: client.user_agent.clone(),
                ip_address: client.ip.clone(),
            })
            .await;
        if let Err(e) = created {
            // Do not leave a live access token without a session behind it
            self.revoke_orphan(&token.access_token, session_id).await;
            return Err(e.into());
        }

        info!(user_id = %identity.subject, session_id = %session_id, "Session started");
        Ok(token)
    }

    /// Verify a refresh token and rotate the session it names.
    /// Reuse policy is [`crate::rotation::RotationGuard`]'s job.
    pub async fn rotate(&self, refresh_token: &str) -> Result<Rotation, AuthError> {
        let payload = self
            .codec
            .verify(self.cache.as_ref(), refresh_token, TokenClass::Refresh)
            .await?;
        let session_id = payload.data.session_id.ok_or(AuthError::InvalidToken)?;
        self.rotate_verified(session_id, refresh_token, &payload)
            .await
    }

    /// Issue the next pair and swap it into the session, but only if
    /// `current_token` is still the session's refresh token.
    ///
    /// Role and contact claims are reloaded from the user directory. The
    /// subject, session and client details carry over from `payload`.
    pub async fn rotate_verified(
        &self,
        session_id: Uuid,
        current_token: &str,
        payload: &TokenPayload,
    ) -> Result<Rotation, AuthError> {
        let claims = self
            .users
            .get_claims(payload.data.subject)
            .await?
            .ok_or(AuthError::AccountNotFound)?;
        let mut data = payload.data.clone();
        data.session_id = Some(session_id);
        data.role = claims.role;
        data.username = claims.username;
        data.email = claims.email;
        data.phone = claims.phone;
        data.email_verified = claims.email_verified;

        let token = self.issue_pair(&data).await?;
        let swapped = self
            .sessions
            .overwrite_tokens(
                session_id,
                current_token,
                &token.refresh_token,
                token.refresh_expires_at,
            )
            .await;

        match swapped {
            Ok(true) => {
                debug!(session_id = %session_id, "Refresh token rotated");
                Ok(Rotation::Rotated(token))
            }
            Ok(false) => {
                self.codec
                    .revoke(self.cache.as_ref(), &token.access_token)
                    .await?;
                warn!(session_id = %session_id, "Rotation lost to a concurrent change");
                Ok(Rotation::Superseded)
            }
            Err(e) => {
                self.revoke_orphan(&token.access_token, session_id).await;
                Err(e.into())
            }
        }
    }

    /// Revoke the caller's access token and, when the refresh token is
    /// presented too, invalidate its session.
    pub async fn logout(
        &self,
        access: &TokenPayload,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        self.codec
            .revoke(self.cache.as_ref(), access_token)
            .await?;

        let Some(refresh_token) = refresh_token else {
            return Ok(());
        };
        // Expired refresh tokens still identify the session to close
        let refresh = self.codec.decode(refresh_token, TokenClass::Refresh)?;
        if refresh.data.subject != access.data.subject {
            return Err(AuthError::Unauthorized(
                "refresh token belongs to another account",
            ));
        }
        let session_id = refresh.data.session_id.ok_or(AuthError::InvalidToken)?;
        self.sessions.revoke_by_id(session_id).await?;
        info!(user_id = %access.data.subject, session_id = %session_id, "Session closed");
        Ok(())
    }

    /// Revoke an access token whose session write failed. The store error
    /// is what the caller reports, so a revoke failure is only logged.
    async fn revoke_orphan(&self, access_token: &str, session_id: Uuid) {
        if let Err(e) = self.codec.revoke(self.cache.as_ref(), access_token).await {
            warn!(
                error = %e,
                session_id = %session_id,
                "Failed to revoke access token after session write failed"
            );
        }
    }

    /// Fail unless the account exists and is neither suspended nor deleted.
    pub async fn check_account(&self, user_id: Uuid) -> Result<(), AuthError> {
        match self.users.get_status(user_id).await? {
            None => Err(AuthError::AccountNotFound),
            Some(status) if status.deleted => Err(AuthError::AccountDeleted),
            Some(status) if status.suspended => Err(AuthError::AccountSuspended),
            Some(_) => Ok(()),
        }
    }
}
