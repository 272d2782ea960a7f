//! CLI argument parsing, validation, and startup helpers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ServerConfig;
use crate::auth::{ClientIpHeader, IpExtractor};
use crate::cache::{MemoryTokenCache, TokenCache};
use crate::config::{
    AuthConfig, DEFAULT_ACCESS_TTL_SECS, DEFAULT_IP_BUCKET_IDLE,
    DEFAULT_REFRESH_ACTIVATION_DELAY_SECS, DEFAULT_REFRESH_TTL_SECS, RateLimitRule, RouteTable,
};
use std::time::Duration;
use crate::db::{Database, NewUser};
use crate::service::{ClientContext, TokenService};
use crate::store::Role;
use crate::token::{MIN_SECRET_LEN, PayloadData};
use clap::Parser;
use tracing::{error, info};

const ACCESS_SECRET_ENV: &str = "ACCESS_TOKEN_SECRET";
const REFRESH_SECRET_ENV: &str = "REFRESH_TOKEN_SECRET";

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "Tokenward",
    about = "Encrypted access and refresh tokens with rotation and replay lockout"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TOKENWARD_PORT", default_value = "7292")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "TOKENWARD_DATABASE", default_value = "tokenward.db")]
    pub database: String,

    /// Path to file containing the access token secret. Prefer the ACCESS_TOKEN_SECRET env var
    #[arg(long, env = "TOKENWARD_ACCESS_SECRET_FILE")]
    pub access_secret_file: Option<String>,

    /// Path to file containing the refresh token secret. Prefer the REFRESH_TOKEN_SECRET env var
    #[arg(long, env = "TOKENWARD_REFRESH_SECRET_FILE")]
    pub refresh_secret_file: Option<String>,

    /// JSON route table merged over the built-in routes
    #[arg(long, env = "TOKENWARD_ROUTES")]
    pub routes: Option<PathBuf>,

    /// Read the client IP from this proxy header instead of the socket address
    #[arg(long, value_enum, env = "TOKENWARD_IP_HEADER")]
    pub ip_header: Option<ClientIpHeader>,

    /// Redis URL for the active token cache (defaults to an in-process cache)
    #[cfg(feature = "redis")]
    #[arg(long, env = "TOKENWARD_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long, env = "TOKENWARD_ACCESS_TTL", default_value_t = DEFAULT_ACCESS_TTL_SECS)]
    pub access_ttl: i64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "TOKENWARD_REFRESH_TTL", default_value_t = DEFAULT_REFRESH_TTL_SECS)]
    pub refresh_ttl: i64,

    /// Seconds before a freshly issued refresh token can be used
    #[arg(
        long,
        env = "TOKENWARD_ACTIVATION_DELAY",
        default_value_t = DEFAULT_REFRESH_ACTIVATION_DELAY_SECS
    )]
    pub activation_delay: i64,

    /// Requests per second for endpoints without their own rate limit
    #[arg(long, env = "TOKENWARD_RATE", default_value_t = RateLimitRule::DEFAULT.rate)]
    pub rate: f64,

    /// Burst size for endpoints without their own rate limit
    #[arg(long, env = "TOKENWARD_BURST", default_value_t = RateLimitRule::DEFAULT.burst)]
    pub burst: u32,

    /// Requests per second per client IP on the public token endpoints
    #[arg(long, env = "TOKENWARD_IP_RATE", default_value_t = RateLimitRule::DEFAULT.rate)]
    pub ip_rate: f64,

    /// Burst size per client IP on the public token endpoints
    #[arg(long, env = "TOKENWARD_IP_BURST", default_value_t = RateLimitRule::DEFAULT.burst)]
    pub ip_burst: u32,

    /// Seconds an IP bucket may sit idle before it is swept
    #[arg(
        long,
        env = "TOKENWARD_IP_BUCKET_IDLE",
        default_value_t = DEFAULT_IP_BUCKET_IDLE.as_secs()
    )]
    pub ip_bucket_idle: u64,

    /// Create a verified user with this username and print a token pair for it
    #[arg(long)]
    pub create_user: Option<String>,

    /// Role for --create-user (super_admin, app_admin, user)
    #[arg(long, default_value = "user")]
    pub role: Role,

    /// Email for --create-user
    #[arg(long, default_value = "")]
    pub email: String,

    /// Log output format
    #[arg(short, long, env = "TOKENWARD_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load a token secret from `env_var` or a file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_secret(env_var: &str, secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var(env_var) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(env_var) };
        secret
    } else if let Some(path) = secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read secret file");
                return None;
            }
        }
    } else {
        error!(
            env = %env_var,
            "Token secret is required. Set the environment variable (recommended) or pass a secret file"
        );
        return None;
    };

    if secret.len() < MIN_SECRET_LEN {
        error!(
            env = %env_var,
            "Token secret is shorter than {} bytes. Use a longer secret", MIN_SECRET_LEN
        );
        return None;
    }

    Some(secret)
}

/// Load both token secrets. They must differ.
pub fn load_secrets(args: &Args) -> Option<(String, String)> {
    let access = load_secret(ACCESS_SECRET_ENV, args.access_secret_file.as_deref())?;
    let refresh = load_secret(REFRESH_SECRET_ENV, args.refresh_secret_file.as_deref())?;
    if access == refresh {
        error!("Access and refresh token secrets must differ");
        return None;
    }
    Some((access, refresh))
}

/// Built-in routes, with the file from --routes merged over them.
pub fn load_routes(path: Option<&PathBuf>) -> Option<RouteTable> {
    let builtin = RouteTable::builtin();
    let Some(path) = path else {
        return Some(builtin);
    };
    match RouteTable::load(path) {
        Ok(table) => {
            info!(path = %path.display(), entries = table.routes.len(), "Route table loaded");
            Some(builtin.merge(table))
        }
        Err(e) => {
            error!(error = %e, "Failed to load route table");
            None
        }
    }
}

/// Connect the active token cache.
#[cfg(feature = "redis")]
pub async fn open_cache(args: &Args) -> Option<Arc<dyn TokenCache>> {
    let Some(url) = &args.redis_url else {
        return Some(Arc::new(MemoryTokenCache::new()));
    };
    match crate::cache::RedisTokenCache::connect(url).await {
        Ok(cache) => {
            info!("Using Redis token cache");
            Some(Arc::new(cache))
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to Redis");
            None
        }
    }
}

/// Connect the active token cache.
#[cfg(not(feature = "redis"))]
pub async fn open_cache(_args: &Args) -> Option<Arc<dyn TokenCache>> {
    Some(Arc::new(MemoryTokenCache::new()))
}

/// Handle --create-user: create a verified user and print a fresh token pair.
pub async fn handle_create_user(
    db: &Database,
    service: &TokenService,
    username: &str,
    role: Role,
    email: &str,
) {
    let new_user = NewUser {
        username: username.to_string(),
        email: email.to_string(),
        phone: String::new(),
        role,
        email_verified: true,
    };
    let user = match db.users().create(&new_user).await {
        Ok(id) => match db.users().get_by_id(id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                error!(user_id = %id, "Created user not found");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to load created user");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %e, "Failed to create user");
            std::process::exit(1);
        }
    };

    let client = ClientContext {
        ip: "127.0.0.1".to_string(),
        user_agent: "tokenward-cli".to_string(),
    };
    match service.start_session(PayloadData::from(&user), &client).await {
        Ok(token) => {
            println!();
            println!("User created: {} ({}, {})", user.username, user.id, user.role);
            println!("Access token: {}", token.access_token);
            println!("Refresh token: {}", token.refresh_token);
            println!();
        }
        Err(e) => {
            error!(error = %e, "Failed to start session for created user");
            std::process::exit(1);
        }
    }
}

/// Build ServerConfig from validated arguments.
pub fn build_config(
    args: &Args,
    db: Database,
    secrets: (String, String),
    routes: RouteTable,
    cache: Arc<dyn TokenCache>,
) -> ServerConfig {
    let (access_secret, refresh_secret) = secrets;
    let mut auth = AuthConfig::new(access_secret, refresh_secret);
    auth.access_ttl_secs = args.access_ttl;
    auth.refresh_ttl_secs = args.refresh_ttl;
    auth.refresh_activation_delay_secs = args.activation_delay;
    auth.default_rate_limit = RateLimitRule::new(args.rate, args.burst);
    auth.ip_rate_limit = RateLimitRule::new(args.ip_rate, args.ip_burst);
    auth.ip_bucket_idle = Duration::from_secs(args.ip_bucket_idle);
    auth.routes = routes;

    ServerConfig {
        db,
        auth,
        cache,
        ip_extractor: args.ip_header.map(IpExtractor::new),
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["tokenward"]).unwrap();
        assert_eq!(args.access_ttl, DEFAULT_ACCESS_TTL_SECS);
        assert_eq!(args.refresh_ttl, DEFAULT_REFRESH_TTL_SECS);
        assert_eq!(args.role, Role::User);
        assert!(args.ip_header.is_none());
    }

    #[test]
    fn test_args_parse_role_and_ip_header() {
        let args = Args::try_parse_from([
            "tokenward",
            "--create-user",
            "root",
            "--role",
            "super_admin",
            "--ip-header",
            "x-real-ip",
        ])
        .unwrap();
        assert_eq!(args.create_user.as_deref(), Some("root"));
        assert_eq!(args.role, Role::SuperAdmin);
        assert_eq!(args.ip_header, Some(ClientIpHeader::XRealIp));
    }

    #[test]
    fn test_args_reject_unknown_role() {
        assert!(Args::try_parse_from(["tokenward", "--role", "root"]).is_err());
    }

    #[test]
    fn test_args_rate_limit_defaults() {
        let args = Args::try_parse_from(["tokenward"]).unwrap();
        assert_eq!(
            RateLimitRule::new(args.rate, args.burst),
            RateLimitRule::DEFAULT
        );
        assert_eq!(
            RateLimitRule::new(args.ip_rate, args.ip_burst),
            RateLimitRule::DEFAULT
        );
        assert_eq!(args.ip_bucket_idle, DEFAULT_IP_BUCKET_IDLE.as_secs());
    }

    #[tokio::test]
    async fn test_build_config_applies_rate_limit_flags() {
        let args = Args::try_parse_from([
            "tokenward",
            "--rate",
            "2.5",
            "--burst",
            "10",
            "--ip-rate",
            "0.5",
            "--ip-burst",
            "3",
            "--ip-bucket-idle",
            "120",
            "--access-ttl",
            "60",
        ])
        .unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let config = build_config(
            &args,
            db,
            ("a".repeat(MIN_SECRET_LEN), "b".repeat(MIN_SECRET_LEN)),
            RouteTable::builtin(),
            Arc::new(MemoryTokenCache::new()),
        );

        assert_eq!(config.auth.default_rate_limit, RateLimitRule::new(2.5, 10));
        assert_eq!(config.auth.ip_rate_limit, RateLimitRule::new(0.5, 3));
        assert_eq!(config.auth.ip_bucket_idle, Duration::from_secs(120));
        assert_eq!(config.auth.access_ttl_secs, 60);
        config.auth.validate().unwrap();
    }

    #[test]
    fn test_load_routes_without_file_is_builtin() {
        assert_eq!(load_routes(None), Some(RouteTable::builtin()));
    }

    #[test]
    fn test_load_routes_missing_file() {
        assert!(load_routes(Some(&PathBuf::from("/nonexistent/routes.json"))).is_none());
    }
}
