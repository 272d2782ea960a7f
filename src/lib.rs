pub mod api;
pub mod auth;
pub mod cache;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod rate_limit;
pub mod rotation;
pub mod service;
pub mod store;
pub mod token;

use api::{ApiParts, AppState, create_api_router};
use auth::{AuthGate, IpExtractor, RouteAuthorization};
use axum::Router;
use cache::TokenCache;
use config::{AuthConfig, ConfigError};
use db::Database;
use rate_limit::{EndpointRateLimiter, IpRateLimitState, LeakyBucketLimiter, RateLimitState};
use rotation::RotationGuard;
use service::TokenService;
use store::SessionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use token::{TokenCodec, TokenError};
use tokio::net::TcpListener;
use tracing::info;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Secrets, lifetimes, rate limits and the route table
    pub auth: AuthConfig,
    /// Where active access tokens are recorded
    pub cache: Arc<dyn TokenCache>,
    /// IP extraction strategy (requires running behind a proxy)
    pub ip_extractor: Option<IpExtractor>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// The assembled engine: token service, rotation guard, auth gate and limiters.
#[derive(Clone)]
pub struct AuthEngine {
    pub service: Arc<TokenService>,
    pub guard: RotationGuard,
    pub gate: AuthGate,
    pub endpoint_limiter: Arc<EndpointRateLimiter>,
    pub ip_limiter: Arc<LeakyBucketLimiter>,
    sessions: Arc<dyn SessionStore>,
    ip_extractor: Option<IpExtractor>,
    ip_bucket_idle: Duration,
}

impl AuthEngine {
    /// Validate the configuration and build every component.
    pub fn new(config: &ServerConfig) -> Result<Self, StartupError> {
        let auth = &config.auth;
        auth.validate()?;

        let codec = Arc::new(TokenCodec::new(
            &auth.access_secret,
            &auth.refresh_secret,
            auth.refresh_activation_delay_secs,
        )?);
        let sessions: Arc<dyn SessionStore> = Arc::new(config.db.sessions());
        let service = Arc::new(TokenService::new(
            codec,
            config.cache.clone(),
            sessions.clone(),
            Arc::new(config.db.users()),
            auth,
        ));

        let routes = RouteAuthorization::from_table(&auth.routes);
        info!(protected_routes = routes.len(), "Route table loaded");

        Ok(Self {
            guard: RotationGuard::new(service.clone()),
            gate: AuthGate::new(service.clone(), routes),
            endpoint_limiter: Arc::new(EndpointRateLimiter::new(
                auth.default_rate_limit,
                &auth.routes,
            )),
            ip_limiter: Arc::new(LeakyBucketLimiter::new(auth.ip_rate_limit)),
            service,
            sessions,
            ip_extractor: config.ip_extractor,
            ip_bucket_idle: auth.ip_bucket_idle,
        })
    }

    /// Build the HTTP router.
    pub fn router(&self) -> Router {
        create_api_router(ApiParts {
            state: AppState {
                service: self.service.clone(),
                guard: self.guard.clone(),
            },
            gate: self.gate.clone(),
            rate_limit: RateLimitState {
                limiter: self.endpoint_limiter.clone(),
                ip_extractor: self.ip_extractor,
            },
            ip_rate_limit: IpRateLimitState {
                limiter: self.ip_limiter.clone(),
                ip_extractor: self.ip_extractor,
            },
        })
    }
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Result<Router, StartupError> {
    Ok(AuthEngine::new(config)?.router())
}

/// Run cleanup tasks and spawn background schedulers.
/// Call this before starting the server.
pub async fn init_cleanup(engine: &AuthEngine) {
    cleanup::run_cleanup(engine.sessions.as_ref(), &engine.endpoint_limiter).await;
    cleanup::spawn_cleanup_scheduler(engine.sessions.clone(), engine.endpoint_limiter.clone());
    engine.ip_limiter.clone().spawn_sweeper(engine.ip_bucket_idle);
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Call `init_cleanup` before this to run cleanup on startup.
pub async fn run_server(engine: &AuthEngine, listener: TcpListener) -> Result<(), std::io::Error> {
    let make_service = engine
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), Box<dyn std::error::Error + Send + Sync>> {
    let engine = AuthEngine::new(&config)?;
    init_cleanup(&engine).await;

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        run_server(&engine, listener).await.ok();
    });

    Ok((handle, local_addr))
}
