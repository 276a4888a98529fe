#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termcast
//!
//! A terminal-sharing server: spawns PTY-backed shell sessions on a host,
//! multiplexes their I/O to many concurrent remote viewers over
//! HTTP+WebSocket+SSE, and persists per-session transcripts in a replayable
//! cast format.
//!
//! ## Subcommands
//!
//! - `termcast serve` (default) — run the HTTP/WS/SSE server
//! - `termcast supervise` — run as supervisor: starts server and restarts on crash

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use termcast::config::Config;
use termcast::registry::Registry;
use termcast::routes;
use termcast::state::AppState;
use termcast::{supervisor, transport};

/// Terminal-sharing server.
#[derive(Parser)]
#[command(name = "termcast", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS/SSE server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts server and restarts on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path).expect("failed to load configuration");

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("termcast supervisor starting");
    supervisor::run_supervisor(config_path, &config.supervisor).await
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path).expect("failed to load configuration");

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    tokio::fs::create_dir_all(&config.session_storage_dir)
        .await
        .expect("failed to create session storage directory");

    recover_orphans(&config).await;

    let registry = Registry::new(
        config.max_sessions.unwrap_or(usize::MAX),
        config.session_storage_dir.clone(),
        Duration::from_secs(config.post_exit_retention_seconds),
        config.subscriber_queue_capacity,
    );

    let config = Arc::new(config);
    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        registry: registry.clone(),
    };

    let session_routes = Router::new()
        .route("/sessions", post(routes::sessions::create).get(routes::sessions::list))
        .route(
            "/sessions/{id}",
            get(routes::sessions::get).delete(routes::sessions::kill),
        )
        .route("/sessions/{id}/input", post(routes::sessions::input))
        .route("/sessions/{id}/resize", post(routes::sessions::resize))
        .route("/sessions/{id}/snapshot", get(routes::sessions::snapshot))
        .route("/sessions/{id}/stream", get(transport::sse::stream))
        .route("/sessions/{id}/ws", get(transport::ws::upgrade));

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .merge(session_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.listen_address));

    info!(address = %config.listen_address, "termcast server ready");

    let sweep_registry = registry.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_seconds);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_registry.sweep().await;
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");

    info!("shutting down");
    sweep_task.abort();
    registry
        .close_all(Duration::from_secs(config.shutdown_grace_seconds))
        .await;
    info!("goodbye");
}

/// Walks `session_storage_dir` on boot looking for transcripts left behind
/// by a previous process (no live PTY survives a restart). A directory is
/// treated as orphaned if its `meta.json` mirror still says `"running"` —
/// the pid it names is signaled if it's still alive and still plausibly the
/// same command, since its PTY master fd can't be recovered either way.
/// The transcript itself is left on disk for replay within the retention
/// window.
async fn recover_orphans(config: &Config) {
    let mut entries = match tokio::fs::read_dir(&config.session_storage_dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let meta_path = entry.path().join("meta.json");
        let Ok(bytes) = tokio::fs::read(&meta_path).await else {
            continue;
        };
        let Ok(meta) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            continue;
        };
        if meta.get("state").and_then(|v| v.as_str()) != Some("running") {
            continue;
        }
        let Some(pid) = meta.get("pid").and_then(serde_json::Value::as_u64) else {
            continue;
        };
        let pid = pid as i32;

        if !process_alive(pid) {
            continue;
        }
        if !cmdline_matches(pid, meta.get("command")) {
            continue;
        }

        warn!(pid, path = %entry.path().display(), "signaling orphaned session from previous run");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn cmdline_matches(pid: i32, command: Option<&serde_json::Value>) -> bool {
    let Some(first) = command.and_then(|c| c.as_array()).and_then(|a| a.first()) else {
        return false;
    };
    let Some(first) = first.as_str() else {
        return false;
    };
    let cmdline = match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let argv0 = cmdline
        .split(|&b| b == 0)
        .next()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .unwrap_or_default();
    argv0.ends_with(first) || first.ends_with(&argv0)
}
