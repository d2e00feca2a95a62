// crates/server/src/main.rs
//! agentdeck server binary.
//!
//! Starts the Axum server, the session tailer, and the event forwarders,
//! then opens the dashboard in a browser. Only an unrecoverable bind failure
//! terminates the process; everything else degrades with a warning.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentdeck_core::{paths, SessionTailer, TailerConfig};
use agentdeck_server::{
    create_app, spawn_event_forwarders, AccessGuard, AppState, BridgeConfig, BridgeManager,
    RateLimitConfig, SnapshotStore,
};

/// Attempts to bind before giving up on an address already in use.
const BIND_RETRIES: u32 = 5;

/// Supervise coding-agent sessions from a browser.
#[derive(Debug, Parser)]
#[command(name = "agentdeck", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "AGENTDECK_PORT", default_value_t = 7433)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Session log root (defaults to ~/.claude/projects).
    #[arg(long, env = "AGENTDECK_ROOT")]
    root: Option<PathBuf>,

    /// Agent CLI binary used for live sessions.
    #[arg(long, env = "AGENTDECK_CLI", default_value = "claude")]
    cli: String,

    /// Shared access token; when unset, no token check is performed.
    #[arg(long, env = "AGENTDECK_TOKEN")]
    token: Option<String>,

    /// Max requests per client per rate-limit window.
    #[arg(long, default_value_t = 120)]
    rate_limit_max: u32,

    /// Rate-limit window length in seconds.
    #[arg(long, default_value_t = 60)]
    rate_limit_window_secs: u64,

    /// Log tailer poll interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Snapshot file for live-session recovery (defaults to the app cache dir).
    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    /// Do not open the dashboard in a browser.
    #[arg(long)]
    no_open: bool,
}

/// Snapshot file location: `<cache_dir>/agentdeck/live-sessions.json`.
fn default_snapshot_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agentdeck")
        .join("live-sessions.json")
}

/// Bind with a bounded retry on address-in-use.
async fn bind_with_retry(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let mut attempt = 0u32;
    loop {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(300 * attempt as u64);
                tracing::warn!(%addr, attempt, "address in use, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to bind {addr}"));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentdeck=info,warn")),
        )
        .compact()
        .init();

    eprintln!("\n\u{1f6e9}  agentdeck v{}\n", env!("CARGO_PKG_VERSION"));

    // Session log root.
    let root = match cli.root {
        Some(root) => root,
        None => paths::default_root().context("could not resolve session log root")?,
    };
    if !root.exists() {
        eprintln!("  ! session log root {} does not exist yet", root.display());
    }

    // Snapshot recovery.
    let snapshot_path = cli.snapshot_path.unwrap_or_else(default_snapshot_path);
    let resumable = SnapshotStore::load(&snapshot_path);
    if !resumable.is_empty() {
        eprintln!(
            "  \u{21bb} {} live session(s) from last run are resumable",
            resumable.len()
        );
    }
    let snapshots = SnapshotStore::new(&snapshot_path);

    // Components.
    let mut tailer_config = TailerConfig::new(&root);
    tailer_config.poll_interval = Duration::from_millis(cli.poll_interval_ms.max(100));
    let tailer = SessionTailer::new(tailer_config);
    tailer.start().await;

    let bridges = BridgeManager::new(BridgeConfig::for_command(&cli.cli), snapshots.clone());

    let guard = AccessGuard::new(
        cli.token.clone(),
        RateLimitConfig {
            max_requests: cli.rate_limit_max,
            window: Duration::from_secs(cli.rate_limit_window_secs),
        },
    );

    let state = AppState::new(tailer.clone(), bridges.clone(), guard, snapshots.clone(), resumable);
    spawn_event_forwarders(state.clone());
    AccessGuard::spawn_purge_task(state.clone());

    let app = create_app(state.clone());

    // Bind (with bounded address-in-use retries) and serve.
    let addr = SocketAddr::new(cli.host, cli.port);
    let listener = bind_with_retry(addr).await?;

    let url = format!("http://{addr}");
    eprintln!("  \u{2713} Watching {}", root.display());
    eprintln!("  \u{2192} {url}\n");

    if !cli.no_open {
        if let Err(e) = open::that(&url) {
            tracing::warn!(error = %e, "could not open browser");
        }
    }

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    serve.await.context("server error")?;

    // Orderly shutdown: stop polling, stop subprocesses, persist snapshot.
    tailer.stop().await;
    bridges.shutdown().await;
    snapshots.flush().await;

    Ok(())
}
