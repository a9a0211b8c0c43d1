//! Piper Server - Main entry point.
//!
//! This binary starts the Piper chat API with:
//! - Structured JSON logging
//! - Redis-backed sessions when `PIPER_REDIS_ADDR` is set, in-memory otherwise
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`piper_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development, everything in memory
//! PIPER_SESSION_KEY="a-long-development-key" cargo run --bin piper-server
//!
//! # Production
//! PIPER_SESSION_KEY="$(cat /run/secrets/piper-key)" \
//! PIPER_REDIS_ADDR="redis://cache:6379/0" \
//! PORT=8080 \
//! cargo run --release --bin piper-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use piper_server::config::Config;
use piper_server::routes::{create_router, AppState};
use piper_server::session::store::{Keyspace, MemoryStore, RedisStore, StateStore};

/// Interval between sweeps of expired in-memory sessions and reset codes.
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PIPER_SESSION_KEY           - Token signing key, at least 16 bytes");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  HOST                        - Bind address (default: 0.0.0.0)");
            eprintln!("  PORT                        - HTTP server port (default: 8080)");
            eprintln!("  PIPER_REDIS_ADDR            - redis:// URL (default: in-memory stores)");
            eprintln!("  PIPER_SESSION_TTL_SECS      - Session lifetime (default: 3600)");
            eprintln!("  PIPER_RESET_TTL_SECS        - Reset code lifetime (default: 300)");
            eprintln!("  PIPER_EVENT_QUEUE_CAPACITY  - Buffered events (default: 10)");
            eprintln!("  PIPER_PUSH_TIMEOUT_SECS     - Per-client push bound (default: 10)");
            eprintln!("  PIPER_BCRYPT_COST           - Password hash cost, 4-31 (default: 13)");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        bind_addr = %config.bind_addr(),
        store = if config.redis_addr.is_some() { "redis" } else { "memory" },
        session_ttl_secs = config.session_ttl.as_secs(),
        event_queue_capacity = config.event_queue_capacity,
        "Piper server starting"
    );

    let (state, cleanup_tasks) = match build_state(config.clone()) {
        Ok(built) => built,
        Err(err) => {
            error!(error = format!("{err:#}"), "Failed to initialise stores");
            return ExitCode::from(1);
        }
    };

    let app = create_router(state);

    let bind_addr = config.bind_addr();
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(
                error = %err,
                address = %bind_addr,
                "Failed to bind to address"
            );
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    for task in cleanup_tasks {
        task.abort();
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Builds application state with the configured session backend.
///
/// In-memory stores get a background sweep of expired entries; Redis
/// expires keys itself.
fn build_state(config: Config) -> anyhow::Result<(AppState, Vec<JoinHandle<()>>)> {
    let sessions_keyspace = Keyspace::sessions(config.session_ttl);
    let resets_keyspace = Keyspace::resets(config.reset_ttl);

    let (sessions, resets, tasks): (Arc<dyn StateStore>, Arc<dyn StateStore>, _) =
        match &config.redis_addr {
            Some(addr) => {
                let client = redis::Client::open(addr.as_str())
                    .context("PIPER_REDIS_ADDR is not a valid redis URL")?;
                let client = Arc::new(client);
                info!("Using Redis session store");
                (
                    Arc::new(RedisStore::with_client(Arc::clone(&client), sessions_keyspace)),
                    Arc::new(RedisStore::with_client(client, resets_keyspace)),
                    Vec::new(),
                )
            }
            None => {
                let sessions = MemoryStore::new(sessions_keyspace);
                let resets = MemoryStore::new(resets_keyspace);
                let tasks = vec![
                    sessions.spawn_cleanup_task(STORE_CLEANUP_INTERVAL),
                    resets.spawn_cleanup_task(STORE_CLEANUP_INTERVAL),
                ];
                info!(
                    interval_secs = STORE_CLEANUP_INTERVAL.as_secs(),
                    "Using in-memory session store"
                );
                (Arc::new(sessions), Arc::new(resets), tasks)
            }
        };

    Ok((AppState::with_stores(config, sessions, resets), tasks))
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT (Ctrl+C) is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
