//! Engine configuration: suggestion limits, embedding model, ANN index,
//! rolling corpus and retraining triggers.

use serde::Deserialize;

// ─────────────────────────────────────────────────────────────────────────────
// Suggestion limits
// ─────────────────────────────────────────────────────────────────────────────

/// Suggestion engine limits
#[derive(Debug, Clone)]
pub struct SuggestConfig {
    /// Cap on returned candidates
    pub max: usize,
    /// Candidates whose final confidence falls below this are dropped
    pub min_confidence: f64,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            max: 5,
            min_confidence: 0.3,
        }
    }
}

/// Suggest settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileSuggestConfig {
    pub max: Option<usize>,
    pub min_confidence: Option<f64>,
}

impl SuggestConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileSuggestConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let max = match file.max {
            Some(0) => {
                tracing::warn!("suggest.max = 0 is invalid, using default {}", defaults.max);
                defaults.max
            }
            Some(max) => max,
            None => defaults.max,
        };

        let min_confidence = match file.min_confidence {
            Some(v) if (0.0..=1.0).contains(&v) => v,
            Some(v) => {
                tracing::warn!(
                    "suggest.min_confidence = {} out of [0, 1], using default {}",
                    v,
                    defaults.min_confidence
                );
                defaults.min_confidence
            }
            None => defaults.min_confidence,
        };

        Self { max, min_confidence }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding model
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding model settings
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Vector dimensionality D
    pub dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dim: 128 }
    }
}

/// Embedding settings as loaded from config file ([embedding] section;
/// the top-level `embedding_dim` key takes precedence when both appear)
#[derive(Debug, Deserialize, Default)]
pub struct FileEmbeddingConfig {
    pub dim: Option<usize>,
}

impl EmbeddingConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileEmbeddingConfig>, top_level_dim: Option<usize>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let dim = match top_level_dim.or(file.dim) {
            Some(dim) if (8..=4096).contains(&dim) => dim,
            Some(dim) => {
                tracing::warn!(
                    "embedding_dim = {} out of [8, 4096], using default {}",
                    dim,
                    defaults.dim
                );
                defaults.dim
            }
            None => defaults.dim,
        };

        Self { dim }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ANN index
// ─────────────────────────────────────────────────────────────────────────────

/// ANN index settings
#[derive(Debug, Clone)]
pub struct AnnConfig {
    /// Number of random-projection trees
    pub trees: usize,
    /// Distance metric; only "angular" is implemented, the key is reserved
    /// for future metrics
    pub metric: String,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            trees: 10,
            metric: "angular".to_string(),
        }
    }
}

/// ANN settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileAnnConfig {
    pub trees: Option<usize>,
    pub metric: Option<String>,
}

impl AnnConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileAnnConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let trees = match file.trees {
            Some(t) if (1..=128).contains(&t) => t,
            Some(t) => {
                tracing::warn!("ann.trees = {} out of [1, 128], using default {}", t, defaults.trees);
                defaults.trees
            }
            None => defaults.trees,
        };

        let metric = match file.metric {
            Some(m) if m == "angular" => m,
            Some(m) => {
                tracing::warn!("ann.metric = {:?} is not supported, using \"angular\"", m);
                defaults.metric
            }
            None => defaults.metric,
        };

        Self { trees, metric }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rolling corpus
// ─────────────────────────────────────────────────────────────────────────────

/// Rolling training corpus bounds
#[derive(Debug, Clone)]
pub struct RollingCorpusConfig {
    /// Keep at most this many most-recent lines at rest
    pub max_lines: usize,
}

impl Default for RollingCorpusConfig {
    fn default() -> Self {
        Self { max_lines: 10_000 }
    }
}

/// Rolling corpus settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileRollingCorpusConfig {
    pub max_lines: Option<usize>,
}

impl RollingCorpusConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileRollingCorpusConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let max_lines = match file.max_lines {
            Some(n) if n >= 100 => n,
            Some(n) => {
                tracing::warn!(
                    "rolling_corpus.max_lines = {} too small, using default {}",
                    n,
                    defaults.max_lines
                );
                defaults.max_lines
            }
            None => defaults.max_lines,
        };

        Self { max_lines }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retraining triggers
// ─────────────────────────────────────────────────────────────────────────────

/// Incremental retraining triggers
#[derive(Debug, Clone)]
pub struct RetrainConfig {
    /// Retrain after this many new successful events
    pub min_new_events: u64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self { min_new_events: 500 }
    }
}

/// Retrain settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileRetrainConfig {
    pub min_new_events: Option<u64>,
}

impl RetrainConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileRetrainConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let min_new_events = match file.min_new_events {
            Some(0) => {
                tracing::warn!(
                    "retrain.min_new_events = 0 is invalid, using default {}",
                    defaults.min_new_events
                );
                defaults.min_new_events
            }
            Some(n) => n,
            None => defaults.min_new_events,
        };

        Self { min_new_events }
    }
}
