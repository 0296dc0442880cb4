// hindsightd - local command suggestion daemon
//
// Observes an interactive shell user's command stream (delivered by shell
// hooks over a Unix socket) and serves ranked completion candidates from
// three sources: exact prefix matches, semantic nearest neighbors over a
// locally trained embedding model, and contextual command sequences.
//
// Architecture:
// - Store (SQLite): append-mostly event log with FTS and statistics
// - Embedding: subword skipgram over a rolling corpus of past commands
// - ANN index: random-projection forest over command vectors
// - Engine: three-tier cascade + multi-factor re-ranker
// - Server: framed JSON over a per-user Unix socket
// - Scheduler: retention pruning, index builds, incremental retraining

mod ann;
mod cache;
mod cli;
mod config;
mod daemon;
mod embedding;
mod engine;
mod events;
mod fingerprint;
mod logging;
mod privacy;
mod safety;
mod server;
mod store;
mod tokenizer;
mod util;

use anyhow::{Context, Result};
use config::Config;
use daemon::scheduler::Scheduler;
use daemon::{DaemonState, InitError};
use std::sync::Arc;
use tokio::net::UnixListener;

#[tokio::main]
async fn main() -> Result<()> {
    // Informational subcommands exit early
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::load();
    let _log_guard = logging::init(&config).context("initializing logging")?;
    tracing::info!("hindsight {} starting", config::VERSION);

    // Init is blocking (may train a bootstrap model); keep it off the runtime
    let init_config = config.clone();
    let state: Arc<DaemonState> =
        match tokio::task::spawn_blocking(move || DaemonState::init(init_config)).await? {
            Ok(state) => state,
            Err(InitError::AlreadyRunning) => {
                let error = server::error::WireError::new(
                    server::error::ErrorKind::AlreadyRunning,
                    "another hindsightd instance holds the daemon lock",
                );
                tracing::error!("{}", error);
                eprintln!("hindsightd: {}", error.message);
                std::process::exit(2);
            }
            Err(InitError::Other(e)) => return Err(e),
        };

    // Bind the socket; a stale file from an unclean exit is safe to remove
    // because the exclusive lock is already ours
    let socket_path = state.paths.socket();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    util::restrict_file_permissions(&socket_path).context("restricting socket permissions")?;

    let scheduler_handle = tokio::spawn(Scheduler::new(state.clone()).run());

    // SIGTERM/SIGINT both trigger the graceful path
    let signal_state = state.clone();
    tokio::spawn(async move {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable ({}); SIGINT only", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        tracing::info!("Shutdown signal received");
        signal_state.request_shutdown();
    });

    server::serve(state.clone(), listener).await?;
    tracing::info!("Server stopped, flushing state");

    // Scheduler observes the same shutdown flag and runs its final flush
    if let Err(e) = scheduler_handle.await {
        tracing::warn!("Scheduler task failed: {}", e);
    }
    if let Err(e) = state.store.shutdown() {
        tracing::warn!("Store shutdown failed: {}", e);
    }
    let _ = std::fs::remove_file(&socket_path);

    tracing::info!("Shutdown complete");
    Ok(())
}
