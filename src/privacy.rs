//! Privacy filter
//!
//! Every command proposed for logging passes through here first. The
//! filter classifies it as stored verbatim, stored fingerprint-only
//! (redacted), or not stored at all (dropped). Rules run in order:
//!
//! 1. cwd beneath an excluded path prefix → drop
//! 2. command matches an excluded pattern → redact or drop, per pattern
//! 3. otherwise → accept
//!
//! Dropped events never reach the store, the FTS index, the ANN index or
//! the rolling corpus. Patterns are bounded at load time so a hostile
//! config cannot create pathological matching costs.

use crate::util::is_path_ancestor;
use regex::Regex;

/// What to do with a command that matches an excluded pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivacyAction {
    /// Keep the fingerprint, strip the command text.
    #[default]
    Redact,
    /// Do not store the event at all.
    Drop,
}

impl PrivacyAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redact" => Some(Self::Redact),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }
}

/// Classification of one proposed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyDecision {
    Accept,
    Redact,
    Drop,
}

struct CompiledPattern {
    regex: Regex,
    action: PrivacyAction,
}

/// The filter itself. Construction compiles and validates patterns;
/// invalid ones are skipped with a warning rather than failing startup.
pub struct PrivacyFilter {
    excluded_paths: Vec<String>,
    patterns: Vec<CompiledPattern>,
}

/// Maximum accepted pattern length.
const MAX_PATTERN_LEN: usize = 1_000;
/// Maximum unbounded repetition operators per pattern.
const MAX_UNBOUNDED_REPS: usize = 10;

/// Directories that hold key material; events from beneath them are
/// never recorded.
const DEFAULT_EXCLUDED_DIRS: &[&str] = &[".ssh", ".gnupg", ".password-store"];

/// Built-in redaction patterns for secret-bearing command lines.
const DEFAULT_REDACT_PATTERNS: &[&str] = &[
    r"(?i)\bpassword\s*=",
    r"(?i)\btoken\s*=",
    r"(?i)\bsecret\s*=",
    r"(?i)\bapi[_-]?key\s*=",
    r"(?i)authorization:\s*bearer\b",
    r"\bsshpass\s+-p\b",
];

impl PrivacyFilter {
    /// Build a filter from user-supplied path prefixes and `(pattern, action)`
    /// pairs. The built-in exclusions are always present.
    pub fn new(extra_paths: &[String], extra_patterns: &[(String, PrivacyAction)]) -> Self {
        let mut excluded_paths: Vec<String> = Vec::new();
        if let Some(home) = dirs::home_dir() {
            for dir in DEFAULT_EXCLUDED_DIRS {
                excluded_paths.push(home.join(dir).to_string_lossy().into_owned());
            }
        }
        for path in extra_paths {
            let expanded = expand_home(path);
            if !excluded_paths.contains(&expanded) {
                excluded_paths.push(expanded);
            }
        }

        let mut patterns = Vec::new();
        for raw in DEFAULT_REDACT_PATTERNS {
            // built-ins are known-good; still go through the same compile path
            if let Some(compiled) = compile_pattern(raw, PrivacyAction::Redact) {
                patterns.push(compiled);
            }
        }
        for (raw, action) in extra_patterns {
            match validate_pattern(raw) {
                Ok(()) => {
                    if let Some(compiled) = compile_pattern(raw, *action) {
                        patterns.push(compiled);
                    }
                }
                Err(reason) => {
                    tracing::warn!("Rejected privacy pattern {:?}: {}", raw, reason);
                }
            }
        }

        Self {
            excluded_paths,
            patterns,
        }
    }

    /// Classify one proposed event.
    pub fn classify(&self, command: &str, cwd: &str) -> PrivacyDecision {
        for prefix in &self.excluded_paths {
            if is_path_ancestor(prefix, cwd) {
                return PrivacyDecision::Drop;
            }
        }
        for pattern in &self.patterns {
            if pattern.regex.is_match(command) {
                return match pattern.action {
                    PrivacyAction::Redact => PrivacyDecision::Redact,
                    PrivacyAction::Drop => PrivacyDecision::Drop,
                };
            }
        }
        PrivacyDecision::Accept
    }
}

fn compile_pattern(raw: &str, action: PrivacyAction) -> Option<CompiledPattern> {
    match Regex::new(raw) {
        Ok(regex) => Some(CompiledPattern { regex, action }),
        Err(e) => {
            tracing::warn!("Failed to compile privacy pattern {:?}: {}", raw, e);
            None
        }
    }
}

/// Bound pattern complexity before compiling: length and the number of
/// unbounded repetition operators (`*`, `+`, `{n,}`).
pub fn validate_pattern(raw: &str) -> Result<(), String> {
    if raw.len() > MAX_PATTERN_LEN {
        return Err(format!("pattern longer than {} characters", MAX_PATTERN_LEN));
    }
    let reps = count_unbounded_reps(raw);
    if reps > MAX_UNBOUNDED_REPS {
        return Err(format!(
            "{} unbounded repetition operators (max {})",
            reps, MAX_UNBOUNDED_REPS
        ));
    }
    Ok(())
}

/// Count `*`, `+` and open-ended `{n,}` operators. Escapes are honored;
/// this is a syntactic bound, not a full parse.
fn count_unbounded_reps(raw: &str) -> usize {
    let mut count = 0;
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '*' | '+' => count += 1,
            '{' => {
                // scan to the closing brace; `{n,}` with no upper bound counts
                let mut body = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    body.push(inner);
                }
                if body.ends_with(',') {
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
