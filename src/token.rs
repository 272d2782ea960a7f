//! Authenticated-encrypted access and refresh tokens.
//!
//! A token is `tw1.local.` followed by base64url(nonce ‖ ciphertext ‖ tag),
//! where the ciphertext is the JSON payload sealed with AES-256-GCM under the
//! key of its class. Each class key is stretched from its own secret with
//! PBKDF2-HMAC-SHA256, so an access token can never be opened as a refresh
//! token even when both secrets are equal.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::symm::{Cipher, decrypt_aead, encrypt_aead};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::cache::{ACTIVE_MARKER, CacheError, TokenCache};
use crate::error::AuthError;
use crate::store::Role;

/// Version and purpose prefix, also bound into every token as AAD.
pub const TOKEN_HEADER: &str = "tw1.local.";

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const KDF_ITERATIONS: usize = 10_000;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Token class. Each class has its own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenClass {
    /// Short-lived, authorizes requests, tracked in the active token cache
    Access,
    /// Long-lived, single use, tracked by its session
    Refresh,
}

impl TokenClass {
    fn salt(&self) -> &'static [u8] {
        match self {
            TokenClass::Access => b"tokenward-access-key",
            TokenClass::Refresh => b"tokenward-refresh-key",
        }
    }
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenClass::Access => f.write_str("access"),
            TokenClass::Refresh => f.write_str("refresh"),
        }
    }
}

/// Identity claims carried by a token. The codec adds class and time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadData {
    /// Subject (user UUID)
    #[serde(rename = "sub")]
    pub subject: Uuid,
    pub role: Role,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub email_verified: bool,
    /// Owning session. Always empty on access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(rename = "iss")]
    pub issuer: String,
    #[serde(rename = "aud")]
    pub audience: String,
    pub client_ip: String,
    pub user_agent: String,
    pub mfa_passed: bool,
}

/// Full decrypted token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(flatten)]
    pub data: PayloadData,
    #[serde(rename = "typ")]
    pub class: TokenClass,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Not before (Unix seconds)
    pub nbf: i64,
    /// Expires at (Unix seconds)
    pub exp: i64,
}

impl TokenPayload {
    /// Check the validity window at `now`. Expiry is reported before activation.
    pub fn validate_window(&self, now: i64) -> Result<(), AuthError> {
        if now > self.exp {
            return Err(match self.class {
                TokenClass::Access => AuthError::ExpiredToken,
                TokenClass::Refresh => AuthError::RefreshExpired,
            });
        }
        if now < self.nbf {
            return Err(AuthError::TokenNotYetValid);
        }
        Ok(())
    }
}

/// A freshly minted token and the payload sealed inside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub payload: TokenPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("{class} token secret must be at least {min} bytes")]
    SecretTooShort { class: TokenClass, min: usize },
    #[error("token crypto failure: {0}")]
    Crypto(#[from] ErrorStack),
    #[error("failed to serialize token payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{class} token lifetime overflows the timestamp range")]
    LifetimeOverflow { class: TokenClass },
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Seals and opens tokens for both classes.
#[derive(Clone)]
pub struct TokenCodec {
    access_key: [u8; KEY_LEN],
    refresh_key: [u8; KEY_LEN],
    /// Seconds between issuing a refresh token and its first valid use.
    activation_delay: i64,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("activation_delay", &self.activation_delay)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Derive both class keys. Fails if either secret is shorter than [`MIN_SECRET_LEN`].
    pub fn new(
        access_secret: &[u8],
        refresh_secret: &[u8],
        activation_delay_secs: i64,
    ) -> Result<Self, TokenError> {
        Ok(Self {
            access_key: derive_key(access_secret, TokenClass::Access)?,
            refresh_key: derive_key(refresh_secret, TokenClass::Refresh)?,
            activation_delay: activation_delay_secs,
        })
    }

    pub fn activation_delay(&self) -> i64 {
        self.activation_delay
    }

    fn key(&self, class: TokenClass) -> &[u8; KEY_LEN] {
        match class {
            TokenClass::Access => &self.access_key,
            TokenClass::Refresh => &self.refresh_key,
        }
    }

    /// Stamp the time window onto `data` and seal it.
    /// A negative `duration_secs` yields a token that is already expired.
    pub fn issue(
        &self,
        data: &PayloadData,
        duration_secs: i64,
        class: TokenClass,
    ) -> Result<IssuedToken, TokenError> {
        let now = unix_now();
        let mut data = data.clone();
        if class == TokenClass::Access {
            data.session_id = None;
        }
        let nbf = match class {
            TokenClass::Access => Some(now),
            TokenClass::Refresh => now.checked_add(self.activation_delay),
        };
        let (Some(nbf), Some(exp)) = (nbf, now.checked_add(duration_secs)) else {
            return Err(TokenError::LifetimeOverflow { class });
        };
        let payload = TokenPayload {
            data,
            class,
            iat: now,
            nbf,
            exp,
        };

        let plaintext = serde_json::to_vec(&payload)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            self.key(class),
            Some(&nonce),
            TOKEN_HEADER.as_bytes(),
            &plaintext,
            &mut tag,
        )?;

        let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&ciphertext);
        body.extend_from_slice(&tag);

        Ok(IssuedToken {
            token: format!("{TOKEN_HEADER}{}", URL_SAFE_NO_PAD.encode(body)),
            payload,
        })
    }

    /// Open a token with the key of `class` without checking its time window.
    pub fn decode(&self, token: &str, class: TokenClass) -> Result<TokenPayload, AuthError> {
        let encoded = token
            .strip_prefix(TOKEN_HEADER)
            .ok_or(AuthError::InvalidToken)?;
        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| AuthError::InvalidToken)?;
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(AuthError::InvalidToken);
        }

        let (nonce, rest) = body.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let plaintext = decrypt_aead(
            Cipher::aes_256_gcm(),
            self.key(class),
            Some(nonce),
            TOKEN_HEADER.as_bytes(),
            ciphertext,
            tag,
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let payload: TokenPayload =
            serde_json::from_slice(&plaintext).map_err(|_| AuthError::InvalidToken)?;
        if payload.class != class {
            return Err(AuthError::InvalidToken);
        }
        Ok(payload)
    }

    /// Decrypt, check class and time window, and for access tokens require a
    /// live entry in the active token cache.
    pub async fn verify(
        &self,
        cache: &dyn TokenCache,
        token: &str,
        class: TokenClass,
    ) -> Result<TokenPayload, AuthError> {
        let payload = self.decode(token, class)?;
        payload.validate_window(unix_now())?;

        if class == TokenClass::Access {
            match cache.get(token).await? {
                Some(marker) if marker == ACTIVE_MARKER => {}
                _ => return Err(AuthError::InvalidToken),
            }
        }
        Ok(payload)
    }

    /// Drop the access token from the active cache. Idempotent.
    pub async fn revoke(&self, cache: &dyn TokenCache, token: &str) -> Result<(), CacheError> {
        cache.delete(token).await
    }
}

fn derive_key(secret: &[u8], class: TokenClass) -> Result<[u8; KEY_LEN], TokenError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(TokenError::SecretTooShort {
            class,
            min: MIN_SECRET_LEN,
        });
    }
    let mut key = [0u8; KEY_LEN];
    openssl::pkcs5::pbkdf2_hmac(
        secret,
        class.salt(),
        KDF_ITERATIONS,
        MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}
