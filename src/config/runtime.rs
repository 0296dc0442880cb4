//! Runtime configuration: daemon process, wire protocol, logging.

use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Daemon runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Daemon runtime settings
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Data directory holding the store, model, index, lock and socket
    pub data_dir: PathBuf,
    /// Worker pool size; 0 means max(2, CPU cores)
    pub workers: usize,
}

impl DaemonConfig {
    /// Default data directory: ~/.local/share/hindsight (or the platform
    /// equivalent)
    fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("hindsight"))
            .unwrap_or_else(|| PathBuf::from("./hindsight-data"))
    }

    /// Effective worker pool size.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cores.max(2)
    }

    /// Path to the Unix socket inside the data directory.
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            workers: 0,
        }
    }
}

/// Daemon settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileDaemonConfig {
    pub data_dir: Option<String>,
    pub workers: Option<usize>,
}

impl DaemonConfig {
    /// Create from file config with defaults; `HINDSIGHT_DATA_DIR` wins.
    pub fn from_file(file: Option<FileDaemonConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let data_dir = std::env::var("HINDSIGHT_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let workers = file.workers.unwrap_or(defaults.workers);

        Self { data_dir, workers }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Message framing on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// 4-byte big-endian length prefix (default)
    #[default]
    LengthPrefixed,
    /// Newline-delimited JSON bodies
    NewlineDelimited,
}

impl Framing {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "length" => Some(Self::LengthPrefixed),
            "newline" => Some(Self::NewlineDelimited),
            _ => None,
        }
    }
}

/// Wire protocol settings
#[derive(Debug, Clone, Default)]
pub struct ProtocolConfig {
    pub framing: Framing,
}

/// Protocol settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileProtocolConfig {
    pub framing: Option<String>,
}

impl ProtocolConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileProtocolConfig>) -> Self {
        let file = file.unwrap_or_default();

        let framing = match file.framing.as_deref() {
            None => Framing::default(),
            Some(s) => match Framing::parse(s) {
                Some(framing) => framing,
                None => {
                    tracing::warn!("protocol.framing = {:?} unknown, using \"length\"", s);
                    Framing::default()
                }
            },
        };

        Self { framing }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Write daemon.log (daily-rotated) into the data directory
    pub file_enabled: bool,
    /// Rotated log files kept on disk
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: true,
            max_files: 7,
        }
    }
}

/// Logging settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileLoggingConfig {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub max_files: Option<usize>,
}

impl LoggingConfig {
    /// Create from file config with defaults; `HINDSIGHT_LOG` wins.
    pub fn from_file(file: Option<FileLoggingConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let level = std::env::var("HINDSIGHT_LOG")
            .ok()
            .or(file.level)
            .unwrap_or(defaults.level);

        Self {
            level,
            file_enabled: file.file_enabled.unwrap_or(defaults.file_enabled),
            max_files: file.max_files.unwrap_or(defaults.max_files).max(1),
        }
    }
}
