//! Candidate re-ranking
//!
//! Every candidate's final score is its tier base confidence multiplied by
//! the product of five factors, each computed from pattern statistics:
//!
//! | factor     | formula                                          |
//! |------------|--------------------------------------------------|
//! | recency    | exp(-0.1 · days since last use)                  |
//! | directory  | 2.0 same cwd, 1.5 ancestor either way, else 1.0  |
//! | success    | success_rate²                                    |
//! | frequency  | log(exec+1) / log(1+max_exec_seen)               |
//! | acceptance | 1.5 accepted often, 0.5 rejected often, else 1.0 |
//!
//! User preferences can weight each factor, penalize long commands and
//! boost whitelisted fingerprints; blacklisted fingerprints never reach
//! scoring at all.

use crate::events::PatternStats;
use crate::util::is_path_ancestor;
use serde::{Deserialize, Serialize};

/// Recency decay rate per day.
const RECENCY_LAMBDA: f64 = 0.1;

const NANOS_PER_DAY: f64 = 86_400.0 * 1e9;

/// Per-factor preference weights; 1.0 leaves a factor untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub recency: f64,
    pub directory: f64,
    pub success: f64,
    pub frequency: f64,
    pub acceptance: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            recency: 1.0,
            directory: 1.0,
            success: 1.0,
            frequency: 1.0,
            acceptance: 1.0,
        }
    }
}

/// Optional per-request user preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub factor_weights: FactorWeights,
    /// Penalize long commands: score × 1/(1 + len/20)
    pub prefer_short: bool,
    /// Fingerprints never suggested
    pub blacklist: Vec<String>,
    /// Fingerprints boosted ×1.5
    pub whitelist: Vec<String>,
}

impl Preferences {
    pub fn is_blacklisted(&self, fingerprint: &str) -> bool {
        self.blacklist.iter().any(|f| f == fingerprint)
    }

    fn is_whitelisted(&self, fingerprint: &str) -> bool {
        self.whitelist.iter().any(|f| f == fingerprint)
    }
}

/// The computed factors for one candidate, kept for the explain endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Factors {
    pub recency: f64,
    pub directory: f64,
    pub success: f64,
    pub frequency: f64,
    pub acceptance: f64,
    /// Product of preference-only multipliers (length penalty, whitelist)
    pub preference: f64,
}

/// Compute the factor table for one candidate.
pub fn compute_factors(
    stats: &PatternStats,
    event_cwd: &str,
    request_cwd: &str,
    max_exec_seen: u64,
    now_ns: i64,
) -> Factors {
    let days_since = (now_ns - stats.last_ts_ns).max(0) as f64 / NANOS_PER_DAY;
    let recency = (-RECENCY_LAMBDA * days_since).exp().clamp(0.0, 1.0);

    let directory = if event_cwd == request_cwd {
        2.0
    } else if is_path_ancestor(event_cwd, request_cwd) || is_path_ancestor(request_cwd, event_cwd) {
        1.5
    } else {
        1.0
    };

    // neutral when a fingerprint has feedback rows but no recorded runs
    let success = if stats.exec_count == 0 {
        1.0
    } else {
        let rate = stats.success_rate();
        (rate * rate).clamp(0.0, 1.0)
    };

    let frequency = if max_exec_seen == 0 {
        1.0
    } else {
        let num = ((stats.exec_count + 1) as f64).ln();
        let den = ((1 + max_exec_seen) as f64).ln();
        if den <= 0.0 {
            1.0
        } else {
            (num / den).clamp(0.0, 1.0)
        }
    };

    let acceptance = match stats.accept_rate() {
        Some(rate) if rate > 0.7 => 1.5,
        Some(rate) if rate < 0.5 && stats.accept_count + stats.reject_count >= 5 => 0.5,
        _ => 1.0,
    };

    Factors {
        recency,
        directory,
        success,
        frequency,
        acceptance,
        preference: 1.0,
    }
}

/// Final score for a candidate: base confidence times the weighted factor
/// product times preference multipliers. Also fills `factors.preference`.
pub fn final_score(
    base_confidence: f64,
    factors: &mut Factors,
    command: &str,
    fingerprint: &str,
    preferences: Option<&Preferences>,
) -> f64 {
    let weights = preferences
        .map(|p| p.factor_weights.clone())
        .unwrap_or_default();

    let mut preference_mult = 1.0;
    if let Some(prefs) = preferences {
        if prefs.prefer_short {
            preference_mult *= 1.0 / (1.0 + command.len() as f64 / 20.0);
        }
        if prefs.is_whitelisted(fingerprint) {
            preference_mult *= 1.5;
        }
    }
    factors.preference = preference_mult;

    base_confidence
        * (factors.recency * weights.recency)
        * (factors.directory * weights.directory)
        * (factors.success * weights.success)
        * (factors.frequency * weights.frequency)
        * (factors.acceptance * weights.acceptance)
        * preference_mult
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(exec: u64, success: u64, accept: u64, reject: u64, last_ts_ns: i64) -> PatternStats {
        PatternStats {
            fingerprint: "f".to_string(),
            exec_count: exec,
            success_count: success,
            last_ts_ns,
            accept_count: accept,
            reject_count: reject,
            emit_count: accept + reject,
        }
    }

    #[test]
    fn test_recency_decays() {
        let now = 100 * 86_400 * 1_000_000_000i64;
        let fresh = compute_factors(&stats(1, 1, 0, 0, now), "/p", "/p", 1, now);
        let day_old = compute_factors(
            &stats(1, 1, 0, 0, now - 86_400 * 1_000_000_000),
            "/p",
            "/p",
            1,
            now,
        );
        assert!((fresh.recency - 1.0).abs() < 1e-9);
        assert!((day_old.recency - (-0.1f64).exp()).abs() < 1e-9);
        assert!(day_old.recency < fresh.recency);
    }

    #[test]
    fn test_directory_tiers() {
        let s = stats(1, 1, 0, 0, 0);
        assert_eq!(compute_factors(&s, "/p", "/p", 1, 0).directory, 2.0);
        assert_eq!(compute_factors(&s, "/p", "/p/sub", 1, 0).directory, 1.5);
        assert_eq!(compute_factors(&s, "/p/sub", "/p", 1, 0).directory, 1.5);
        assert_eq!(compute_factors(&s, "/a", "/b", 1, 0).directory, 1.0);
    }

    #[test]
    fn test_success_squared() {
        let f = compute_factors(&stats(10, 5, 0, 0, 0), "/p", "/p", 10, 0);
        assert!((f.success - 0.25).abs() < 1e-9);
        // always-failing commands score zero
        let f = compute_factors(&stats(10, 0, 0, 0, 0), "/p", "/p", 10, 0);
        assert_eq!(f.success, 0.0);
    }

    #[test]
    fn test_frequency_normalized() {
        let f = compute_factors(&stats(50, 50, 0, 0, 0), "/p", "/p", 50, 0);
        assert!((f.frequency - 1.0).abs() < 1e-9);
        let f = compute_factors(&stats(10, 10, 0, 0, 0), "/p", "/p", 50, 0);
        assert!(f.frequency < 1.0 && f.frequency > 0.0);
    }

    #[test]
    fn test_acceptance_brackets() {
        // high accept rate boosts
        let f = compute_factors(&stats(10, 10, 8, 2, 0), "/p", "/p", 10, 0);
        assert_eq!(f.acceptance, 1.5);
        // low accept rate with enough feedback demotes
        let f = compute_factors(&stats(10, 10, 1, 9, 0), "/p", "/p", 10, 0);
        assert_eq!(f.acceptance, 0.5);
        // low rate but too little feedback stays neutral
        let f = compute_factors(&stats(10, 10, 0, 2, 0), "/p", "/p", 10, 0);
        assert_eq!(f.acceptance, 1.0);
        // no feedback at all stays neutral
        let f = compute_factors(&stats(10, 10, 0, 0, 0), "/p", "/p", 10, 0);
        assert_eq!(f.acceptance, 1.0);
    }

    #[test]
    fn test_feedback_outweighs_frequency() {
        // the often-rejected frequent command loses to the accepted rare one
        let now = 0i64;
        let frequent = stats(50, 50, 0, 10, now);
        let rare = stats(10, 10, 10, 0, now);

        let mut f_frequent = compute_factors(&frequent, "/p", "/p", 50, now);
        let mut f_rare = compute_factors(&rare, "/p", "/p", 50, now);

        let s_frequent = final_score(1.0, &mut f_frequent, "ls", "f1", None);
        let s_rare = final_score(1.0, &mut f_rare, "ll", "f2", None);
        assert!(s_rare > s_frequent, "{} vs {}", s_rare, s_frequent);
    }

    #[test]
    fn test_prefer_short_penalty() {
        let prefs = Preferences {
            prefer_short: true,
            ..Preferences::default()
        };
        let mut f_short = compute_factors(&stats(1, 1, 0, 0, 0), "/p", "/p", 1, 0);
        let mut f_long = f_short;
        let s_short = final_score(1.0, &mut f_short, "ls", "f", Some(&prefs));
        let s_long = final_score(
            1.0,
            &mut f_long,
            "ls --color=auto --group-directories-first",
            "f",
            Some(&prefs),
        );
        assert!(s_short > s_long);
    }

    #[test]
    fn test_whitelist_boosts() {
        let prefs = Preferences {
            whitelist: vec!["f".to_string()],
            ..Preferences::default()
        };
        let mut factors = compute_factors(&stats(1, 1, 0, 0, 0), "/p", "/p", 1, 0);
        let boosted = final_score(1.0, &mut factors, "ls", "f", Some(&prefs));
        let mut factors_plain = compute_factors(&stats(1, 1, 0, 0, 0), "/p", "/p", 1, 0);
        let plain = final_score(1.0, &mut factors_plain, "ls", "f", None);
        assert!((boosted / plain - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_factor_weights_scale() {
        let prefs = Preferences {
            factor_weights: FactorWeights {
                directory: 0.5,
                ..FactorWeights::default()
            },
            ..Preferences::default()
        };
        let mut factors = compute_factors(&stats(1, 1, 0, 0, 0), "/p", "/p", 1, 0);
        let weighted = final_score(1.0, &mut factors, "ls", "f", Some(&prefs));
        let mut factors_plain = compute_factors(&stats(1, 1, 0, 0, 0), "/p", "/p", 1, 0);
        let plain = final_score(1.0, &mut factors_plain, "ls", "f", None);
        assert!((weighted / plain - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let s = stats(7, 6, 2, 1, 123_456);
        let a = compute_factors(&s, "/p", "/p/x", 9, 999_999);
        let b = compute_factors(&s, "/p", "/p/x", 9, 999_999);
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }
}
