//! Logging setup
//!
//! Initializes tracing with an env-filter level and, when enabled, a
//! daily-rotated `daemon.log` in the data directory. Old rotations beyond
//! the configured count are deleted at startup so the operational log
//! stays size-capped.
//!
//! Precedence for the level: RUST_LOG env var > HINDSIGHT_LOG / config
//! file > default "info".

use crate::config::Config;
use crate::util::restrict_file_permissions;
use anyhow::Result;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name prefix; the appender adds the date suffix.
const LOG_PREFIX: &str = "daemon.log";

/// Initialize tracing. Returns the appender guard which must be kept
/// alive for the lifetime of the process, or the file writer goes quiet.
pub fn init(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = format!("hindsight={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if !config.logging.file_enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(None);
    }

    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)?;
    prune_rotated_logs(data_dir, config.logging.max_files);

    let appender = tracing_appender::rolling::daily(data_dir, LOG_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();

    // the appender creates today's file lazily; restrict any that exist
    if let Ok(entries) = std::fs::read_dir(data_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(LOG_PREFIX) {
                let _ = restrict_file_permissions(&entry.path());
            }
        }
    }

    Ok(Some(guard))
}

/// Delete rotated log files beyond `keep`, oldest first. The date suffix
/// sorts lexicographically, so name order is age order.
fn prune_rotated_logs(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut logs: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_PREFIX))
        .map(|e| e.path())
        .collect();
    if logs.len() <= keep {
        return;
    }
    logs.sort();
    let excess = logs.len() - keep;
    for path in logs.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            eprintln!("Failed to prune old log {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_rotated_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        for day in 1..=5 {
            let path = dir.path().join(format!("{}.2026-07-0{}", LOG_PREFIX, day));
            std::fs::write(&path, "x").expect("write");
        }
        std::fs::write(dir.path().join("events.db"), "x").expect("write");

        prune_rotated_logs(dir.path(), 2);

        let mut remaining: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                format!("{}.2026-07-04", LOG_PREFIX),
                format!("{}.2026-07-05", LOG_PREFIX),
                "events.db".to_string(),
            ]
        );
    }

    #[test]
    fn test_prune_noop_under_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(format!("{}.2026-07-01", LOG_PREFIX));
        std::fs::write(&path, "x").expect("write");
        prune_rotated_logs(dir.path(), 7);
        assert!(path.exists());
    }
}
