//! Tests for main.rs startup validation (token secrets, route table, lifetimes)

use std::fs;
use std::process::{Command, Output, Stdio};

const ACCESS: &str = "startup-access-secret-0123456789abcdef";
const REFRESH: &str = "startup-refresh-secret-0123456789abcdef";

fn cargo_bin() -> std::path::PathBuf {
    // Get the path to the compiled binary
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // Remove test binary name
    path.pop(); // Remove deps
    path.push("tokenward");
    path
}

fn run(configure: impl FnOnce(&mut Command)) -> (Output, String) {
    let mut command = Command::new(cargo_bin());
    command
        .env_remove("ACCESS_TOKEN_SECRET")
        .env_remove("REFRESH_TOKEN_SECRET")
        .env_remove("TOKENWARD_ROUTES")
        .env_remove("TOKENWARD_ACCESS_TTL")
        .env_remove("TOKENWARD_REFRESH_TTL")
        .env_remove("TOKENWARD_ACTIVATION_DELAY")
        .env_remove("TOKENWARD_RATE")
        .env_remove("TOKENWARD_BURST")
        .env_remove("TOKENWARD_IP_RATE")
        .env_remove("TOKENWARD_IP_BURST")
        .env_remove("TOKENWARD_IP_BUCKET_IDLE")
        .args(["--database", ":memory:", "--log-format", "compact"])
        .stderr(Stdio::piped())
        .stdout(Stdio::piped());
    configure(&mut command);
    let output = command.output().expect("Failed to run binary");

    // tracing logs to stdout by default
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    (output, combined)
}

#[test]
fn test_missing_access_secret_exits_with_error() {
    let (output, logs) = run(|command| {
        command.env("REFRESH_TOKEN_SECRET", REFRESH);
    });

    assert!(!output.status.success());
    assert!(
        logs.contains("ACCESS_TOKEN_SECRET") && logs.contains("required"),
        "Should mention ACCESS_TOKEN_SECRET is required, got: {}",
        logs
    );
}

#[test]
fn test_short_secret_exits_with_error() {
    let (output, logs) = run(|command| {
        command
            .env("ACCESS_TOKEN_SECRET", "short")
            .env("REFRESH_TOKEN_SECRET", REFRESH);
    });

    assert!(!output.status.success());
    assert!(logs.contains("shorter than"), "got: {}", logs);
}

#[test]
fn test_identical_secrets_exit_with_error() {
    let (output, logs) = run(|command| {
        command
            .env("ACCESS_TOKEN_SECRET", ACCESS)
            .env("REFRESH_TOKEN_SECRET", ACCESS);
    });

    assert!(!output.status.success());
    assert!(logs.contains("must differ"), "got: {}", logs);
}

#[test]
fn test_secret_file_is_read() {
    let dir = std::env::temp_dir().join(format!("tokenward-startup-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let secret_path = dir.join("access.secret");
    fs::write(&secret_path, "short\n").unwrap();

    let (output, logs) = run(|command| {
        command
            .env("REFRESH_TOKEN_SECRET", REFRESH)
            .arg("--access-secret-file")
            .arg(&secret_path);
    });
    let _ = fs::remove_dir_all(&dir);

    // The file was found and its (too short) content was checked
    assert!(!output.status.success());
    assert!(logs.contains("shorter than"), "got: {}", logs);
}

#[test]
fn test_invalid_route_table_exits_with_error() {
    let dir = std::env::temp_dir().join(format!("tokenward-routes-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let routes_path = dir.join("routes.json");
    fs::write(
        &routes_path,
        r#"[{"method": "GET", "route": "/x", "rate_limit": {"rate": 0.0, "burst": 1}}]"#,
    )
    .unwrap();

    let (output, logs) = run(|command| {
        command
            .env("ACCESS_TOKEN_SECRET", ACCESS)
            .env("REFRESH_TOKEN_SECRET", REFRESH)
            .arg("--routes")
            .arg(&routes_path);
    });
    let _ = fs::remove_dir_all(&dir);

    assert!(!output.status.success());
    assert!(logs.contains("Failed to load route table"), "got: {}", logs);
}

fn run_with_secrets(args: &[&str]) -> (Output, String) {
    run(|command| {
        command
            .env("ACCESS_TOKEN_SECRET", ACCESS)
            .env("REFRESH_TOKEN_SECRET", REFRESH)
            .args(args);
    })
}

#[test]
fn test_zero_access_ttl_exits_with_error() {
    let (output, logs) = run_with_secrets(&["--access-ttl", "0"]);

    assert!(!output.status.success());
    assert!(logs.contains("Invalid configuration"), "got: {}", logs);
    assert!(logs.contains("access_ttl_secs"), "got: {}", logs);
}

#[test]
fn test_huge_refresh_ttl_exits_with_error() {
    let (output, logs) = run_with_secrets(&["--refresh-ttl", "9223372036854775807"]);

    assert!(!output.status.success());
    assert!(logs.contains("Invalid configuration"), "got: {}", logs);
    assert!(logs.contains("refresh_ttl_secs"), "got: {}", logs);
}

#[test]
fn test_negative_activation_delay_exits_with_error() {
    let (output, logs) = run_with_secrets(&["--activation-delay=-1"]);

    assert!(!output.status.success());
    assert!(logs.contains("Invalid configuration"), "got: {}", logs);
}

#[test]
fn test_rate_limit_flags_are_validated() {
    let (output, logs) = run_with_secrets(&["--ip-burst", "0"]);

    assert!(!output.status.success());
    assert!(logs.contains("Invalid configuration"), "got: {}", logs);
    assert!(logs.contains("burst must be at least 1"), "got: {}", logs);

    let (output, logs) = run_with_secrets(&["--ip-bucket-idle", "0"]);
    assert!(!output.status.success());
    assert!(logs.contains("ip_bucket_idle"), "got: {}", logs);
}
