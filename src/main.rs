use clap::Parser;
use tokenward::cli::{
    Args, build_config, handle_create_user, init_logging, load_routes, load_secrets, open_cache,
    open_database,
};
use tokenward::{AuthEngine, init_cleanup, run_server};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(secrets) = load_secrets(&args) else {
        std::process::exit(1);
    };

    let Some(routes) = load_routes(args.routes.as_ref()) else {
        std::process::exit(1);
    };

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    let Some(cache) = open_cache(&args).await else {
        std::process::exit(1);
    };

    let config = build_config(&args, db.clone(), secrets, routes, cache);
    let engine = AuthEngine::new(&config).unwrap_or_else(|e| {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    if let Some(username) = &args.create_user {
        handle_create_user(&db, &engine.service, username, args.role, &args.email).await;
    }

    init_cleanup(&engine).await;

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    match listener.local_addr() {
        Ok(local_addr) => info!(address = %local_addr, "Listening"),
        Err(e) => info!(address = %addr, error = %e, "Listening"),
    }

    if let Err(e) = run_server(&engine, listener).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
