//! Privacy and safety configuration sections.

use crate::privacy::{validate_pattern, PrivacyAction};
use serde::Deserialize;

// ─────────────────────────────────────────────────────────────────────────────
// Privacy filter rules
// ─────────────────────────────────────────────────────────────────────────────

/// One user-configured excluded pattern with its action.
#[derive(Debug, Clone)]
pub struct PrivacyPatternEntry {
    pub pattern: String,
    pub action: PrivacyAction,
}

/// Privacy filter rules
#[derive(Debug, Clone, Default)]
pub struct PrivacyConfig {
    /// Path prefixes whose events are dropped (in addition to built-ins)
    pub excluded_paths: Vec<String>,
    /// Regex patterns, each marked redact or drop
    pub excluded_patterns: Vec<PrivacyPatternEntry>,
}

/// Privacy settings as loaded from config file.
///
/// Patterns accept either a bare string (action defaults to redact) or a
/// `{ pattern = "...", action = "drop" }` table.
#[derive(Debug, Deserialize, Default)]
pub struct FilePrivacyConfig {
    pub excluded_paths: Option<Vec<String>>,
    pub excluded_patterns: Option<Vec<FilePatternEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FilePatternEntry {
    Bare(String),
    Tagged { pattern: String, action: Option<String> },
}

impl PrivacyConfig {
    /// Create from file config with defaults. Invalid patterns are dropped
    /// here with a warning so the filter only ever sees validated input.
    pub fn from_file(file: Option<FilePrivacyConfig>) -> Self {
        let file = file.unwrap_or_default();

        let excluded_paths = file.excluded_paths.unwrap_or_default();

        let mut excluded_patterns = Vec::new();
        for entry in file.excluded_patterns.unwrap_or_default() {
            let (pattern, action_str) = match entry {
                FilePatternEntry::Bare(pattern) => (pattern, None),
                FilePatternEntry::Tagged { pattern, action } => (pattern, action),
            };

            let action = match action_str.as_deref() {
                None => PrivacyAction::Redact,
                Some(s) => match PrivacyAction::parse(s) {
                    Some(action) => action,
                    None => {
                        tracing::warn!(
                            "privacy pattern {:?}: unknown action {:?}, using redact",
                            pattern,
                            s
                        );
                        PrivacyAction::Redact
                    }
                },
            };

            if let Err(reason) = validate_pattern(&pattern) {
                tracing::warn!("Ignoring privacy pattern {:?}: {}", pattern, reason);
                continue;
            }

            excluded_patterns.push(PrivacyPatternEntry { pattern, action });
        }

        Self {
            excluded_paths,
            excluded_patterns,
        }
    }

    /// Flatten into the `(pattern, action)` pairs the filter consumes.
    pub fn pattern_pairs(&self) -> Vec<(String, PrivacyAction)> {
        self.excluded_patterns
            .iter()
            .map(|e| (e.pattern.clone(), e.action))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Safety analyzer mode
// ─────────────────────────────────────────────────────────────────────────────

/// How the safety analyzer participates in responses. `Block` is a client
/// policy; the daemon itself only ever annotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyLevel {
    Off,
    #[default]
    Annotate,
}

impl SafetyLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "annotate" => Some(Self::Annotate),
            _ => None,
        }
    }
}

/// Safety analyzer mode
#[derive(Debug, Clone, Default)]
pub struct SafetyConfig {
    pub level: SafetyLevel,
}

/// Safety settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileSafetyConfig {
    pub level: Option<String>,
}

impl SafetyConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileSafetyConfig>) -> Self {
        let file = file.unwrap_or_default();

        let level = match file.level.as_deref() {
            None => SafetyLevel::default(),
            Some("block") => {
                tracing::warn!(
                    "safety.level = \"block\" is enforced by clients; the daemon annotates"
                );
                SafetyLevel::Annotate
            }
            Some(s) => match SafetyLevel::parse(s) {
                Some(level) => level,
                None => {
                    tracing::warn!("safety.level = {:?} unknown, using \"annotate\"", s);
                    SafetyLevel::default()
                }
            },
        };

        Self { level }
    }
}
