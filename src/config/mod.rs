//! Configuration for the suggestion daemon
//!
//! Configuration is loaded once at startup, in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/hindsight/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Changes require a restart. Invalid values fall back to their defaults
//! with a warning rather than failing startup.

use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod engine;
mod privacy;
mod runtime;

#[cfg(test)]
mod tests;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (maintain public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use engine::{
    AnnConfig, EmbeddingConfig, FileAnnConfig, FileEmbeddingConfig, FileRetrainConfig,
    FileRollingCorpusConfig, FileSuggestConfig, RetrainConfig, RollingCorpusConfig, SuggestConfig,
};
pub use privacy::{
    FilePrivacyConfig, FileSafetyConfig, PrivacyConfig, PrivacyPatternEntry, SafetyConfig,
    SafetyLevel,
};
pub use runtime::{
    DaemonConfig, FileDaemonConfig, FileLoggingConfig, FileProtocolConfig, Framing, LoggingConfig,
    ProtocolConfig,
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Events older than this are pruned (days).
const DEFAULT_RETENTION_DAYS: u32 = 90;

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Daemon runtime settings (data directory, worker pool)
    pub daemon: DaemonConfig,

    /// Wire protocol settings
    pub protocol: ProtocolConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Suggestion engine limits
    pub suggest: SuggestConfig,

    /// Embedding model settings
    pub embedding: EmbeddingConfig,

    /// ANN index settings
    pub ann: AnnConfig,

    /// Rolling training corpus bounds
    pub rolling_corpus: RollingCorpusConfig,

    /// Incremental retraining triggers
    pub retrain: RetrainConfig,

    /// Privacy filter rules
    pub privacy: PrivacyConfig,

    /// Safety analyzer mode
    pub safety: SafetyConfig,

    /// Prune events older than this many days
    pub retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            protocol: ProtocolConfig::default(),
            logging: LoggingConfig::default(),
            suggest: SuggestConfig::default(),
            embedding: EmbeddingConfig::default(),
            ann: AnnConfig::default(),
            rolling_corpus: RollingCorpusConfig::default(),
            retrain: RetrainConfig::default(),
            privacy: PrivacyConfig::default(),
            safety: SafetyConfig::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (everything optional; absent sections use defaults)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    /// Top-level scalar options, matching the documented option names
    pub embedding_dim: Option<usize>,
    pub retention_days: Option<u32>,

    /// Optional [daemon] section
    pub daemon: Option<FileDaemonConfig>,

    /// Optional [protocol] section
    pub protocol: Option<FileProtocolConfig>,

    /// Optional [logging] section
    pub logging: Option<FileLoggingConfig>,

    /// Optional [suggest] section
    pub suggest: Option<FileSuggestConfig>,

    /// Optional [embedding] section
    pub embedding: Option<FileEmbeddingConfig>,

    /// Optional [ann] section
    pub ann: Option<FileAnnConfig>,

    /// Optional [rolling_corpus] section
    pub rolling_corpus: Option<FileRollingCorpusConfig>,

    /// Optional [retrain] section
    pub retrain: Option<FileRetrainConfig>,

    /// Optional [privacy] section
    pub privacy: Option<FilePrivacyConfig>,

    /// Optional [safety] section
    pub safety: Option<FileSafetyConfig>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/hindsight/config.toml
    /// (`HINDSIGHT_CONFIG` overrides)
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HINDSIGHT_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".config").join("hindsight").join("config.toml"))
    }

    /// Load file config if it exists
    ///
    /// A missing file is fine (defaults apply). A file that exists but does
    /// not parse is a fatal, clearly reported error: silently falling back
    /// would have the user debugging the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    eprintln!("Fix or delete the file and restart hindsightd.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn load() -> Self {
        let file = Self::load_file_config();
        Self::from_file_config(file)
    }

    pub(crate) fn from_file_config(file: FileConfig) -> Self {
        let daemon = DaemonConfig::from_file(file.daemon);
        let protocol = ProtocolConfig::from_file(file.protocol);
        let logging = LoggingConfig::from_file(file.logging);
        let suggest = SuggestConfig::from_file(file.suggest);
        let embedding = EmbeddingConfig::from_file(file.embedding, file.embedding_dim);
        let ann = AnnConfig::from_file(file.ann);
        let rolling_corpus = RollingCorpusConfig::from_file(file.rolling_corpus);
        let retrain = RetrainConfig::from_file(file.retrain);
        let privacy = PrivacyConfig::from_file(file.privacy);
        let safety = SafetyConfig::from_file(file.safety);

        let retention_days = match file.retention_days {
            Some(0) => {
                tracing::warn!("retention_days = 0 is invalid, using default {}", DEFAULT_RETENTION_DAYS);
                DEFAULT_RETENTION_DAYS
            }
            Some(days) => days,
            None => DEFAULT_RETENTION_DAYS,
        };

        Self {
            daemon,
            protocol,
            logging,
            suggest,
            embedding,
            ann,
            rolling_corpus,
            retrain,
            privacy,
            safety,
            retention_days,
        }
    }
}
