#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, request::Builder},
};
use std::sync::Arc;
use tokenward::auth::{ClientIpHeader, IpExtractor};
use tokenward::cache::MemoryTokenCache;
use tokenward::config::{AuthConfig, RateLimitRule};
use tokenward::db::{Database, NewUser, User};
use tokenward::service::{AuthToken, ClientContext};
use tokenward::store::Role;
use tokenward::token::PayloadData;
use tokenward::{AuthEngine, ServerConfig};
use tower::ServiceExt;

pub const ACCESS_SECRET: &[u8] = b"integration-access-secret-0123456789";
pub const REFRESH_SECRET: &[u8] = b"integration-refresh-secret-0123456789";

/// Address sent in the `X-Real-IP` header unless a test picks its own.
pub const CLIENT_IP: &str = "198.51.100.7";

pub struct TestApp {
    pub app: Router,
    pub db: Database,
    pub engine: AuthEngine,
}

/// App with every limiter wide open and refresh tokens usable immediately.
pub async fn create_test_app() -> TestApp {
    create_test_app_with(|_| {}).await
}

/// Like [`create_test_app`], with a hook to tighten the config afterwards.
pub async fn create_test_app_with(configure: impl FnOnce(&mut AuthConfig)) -> TestApp {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");

    let mut auth = AuthConfig::new(ACCESS_SECRET, REFRESH_SECRET);
    auth.refresh_activation_delay_secs = 0;
    auth.default_rate_limit = RateLimitRule::new(1000.0, 1000);
    auth.ip_rate_limit = RateLimitRule::new(1000.0, 1000);
    for rule in &mut auth.routes.routes {
        rule.rate_limit = None;
    }
    configure(&mut auth);

    let config = ServerConfig {
        db: db.clone(),
        auth,
        cache: Arc::new(MemoryTokenCache::new()),
        ip_extractor: Some(IpExtractor::new(ClientIpHeader::XRealIp)),
    };
    let engine = AuthEngine::new(&config).expect("Invalid test config");
    TestApp {
        app: engine.router(),
        db,
        engine,
    }
}

impl TestApp {
    pub async fn create_user(&self, username: &str, role: Role) -> User {
        self.create_user_with(username, role, true).await
    }

    pub async fn create_user_with(&self, username: &str, role: Role, verified: bool) -> User {
        let id = self
            .db
            .users()
            .create(&NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                phone: String::new(),
                role,
                email_verified: verified,
            })
            .await
            .unwrap();
        self.db.users().get_by_id(id).await.unwrap().unwrap()
    }

    /// Open a session the way a login flow would.
    pub async fn login(&self, user: &User) -> AuthToken {
        self.engine
            .service
            .start_session(
                PayloadData::from(user),
                &ClientContext {
                    ip: CLIENT_IP.to_string(),
                    user_agent: "integration-test".to_string(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        // Extractor rejections from axum are plain text
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
            })
        };
        (status, json)
    }

    pub async fn rotate(&self, refresh_token: &str) -> (StatusCode, serde_json::Value) {
        self.send(
            request("POST", "/api/auth/rotate_token")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "refresh_token": refresh_token }).to_string(),
                ))
                .unwrap(),
        )
        .await
    }
}

/// Request builder with the client IP header already set.
pub fn request(method: &str, uri: &str) -> Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-real-ip", CLIENT_IP)
}

pub fn authed(method: &str, uri: &str, access_token: &str) -> Builder {
    request(method, uri).header("authorization", format!("Bearer {access_token}"))
}
