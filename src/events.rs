//! Core domain types shared across the daemon
//!
//! A `CommandEvent` is one observed command execution; it is the unit the
//! store persists, the embedding pipeline encodes, and the suggestion engine
//! ranks. Events are immutable after commit.

use serde::{Deserialize, Serialize};

/// Shell flavor a session was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Zsh,
    Bash,
    Fish,
    #[default]
    Other,
}

impl ShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zsh => "zsh",
            Self::Bash => "bash",
            Self::Fish => "fish",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "zsh" => Self::Zsh,
            "bash" => Self::Bash,
            "fish" => Self::Fish,
            _ => Self::Other,
        }
    }
}

/// A command observation proposed for logging, before the privacy filter
/// and the store have seen it.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub session_id: String,
    pub ts_ns: i64,
    pub command: String,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub duration_ns: Option<u64>,
    pub shell_kind: ShellKind,
}

/// A committed event row. `command` is `None` when the privacy filter
/// redacted the text; the fingerprint is always present.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    pub id: i64,
    pub session_id: String,
    pub ts_ns: i64,
    pub command: Option<String>,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub duration_ns: Option<u64>,
    pub redacted: bool,
    pub fingerprint: String,
}

/// Aggregated statistics for one command shape, optionally scoped to a cwd.
///
/// Counters are monotone: they are only ever incremented, never rewritten.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternStats {
    pub fingerprint: String,
    pub exec_count: u64,
    pub success_count: u64,
    pub last_ts_ns: i64,
    pub accept_count: u64,
    pub reject_count: u64,
    pub emit_count: u64,
}

impl PatternStats {
    /// Fraction of runs that exited successfully, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.exec_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.exec_count as f64
    }

    /// Fraction of suggestion feedbacks that were accepts, if any feedback exists.
    pub fn accept_rate(&self) -> Option<f64> {
        let total = self.accept_count + self.reject_count;
        if total == 0 {
            return None;
        }
        Some(self.accept_count as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_kind_roundtrip() {
        for kind in [ShellKind::Zsh, ShellKind::Bash, ShellKind::Fish, ShellKind::Other] {
            assert_eq!(ShellKind::parse(kind.as_str()), kind);
        }
        assert_eq!(ShellKind::parse("tcsh"), ShellKind::Other);
    }

    #[test]
    fn test_pattern_stats_rates() {
        let stats = PatternStats {
            fingerprint: "f".into(),
            exec_count: 10,
            success_count: 7,
            last_ts_ns: 0,
            accept_count: 3,
            reject_count: 1,
            emit_count: 6,
        };
        assert!((stats.success_rate() - 0.7).abs() < 1e-9);
        assert!((stats.accept_rate().unwrap() - 0.75).abs() < 1e-9);

        let empty = PatternStats::default();
        assert_eq!(empty.success_rate(), 0.0);
        assert!(empty.accept_rate().is_none());
    }
}
