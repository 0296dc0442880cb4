//! Scoring breakdowns for the explain endpoint
//!
//! Every emitted candidate gets an explain id whose scoring breakdown is
//! retained in a bounded TTL cache. Feedback resolves through the same id,
//! so the breakdown also carries what feedback needs: the fingerprint and
//! the candidate's directory.

use super::rerank::Factors;
use rand::Rng;
use serde::Serialize;

/// Retained scoring detail for one emitted candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringBreakdown {
    pub explain_id: String,
    pub fingerprint: String,
    pub command: String,
    /// The masked shape the fingerprint aggregates over, for readability
    pub shape: String,
    /// cwd of the candidate's canonical event; feedback counters attach here
    pub cwd: String,
    pub event_id: i64,
    /// Source tiers that produced this candidate before dedup
    pub tiers: Vec<String>,
    pub base_confidence: f64,
    pub factors: Factors,
    pub final_score: f64,
    /// Set once feedback for this suggestion has been recorded
    pub feedback_recorded: bool,
}

/// Fresh opaque explain id.
pub fn new_explain_id() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("sg-{:016x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_ids_unique_enough() {
        let a = new_explain_id();
        let b = new_explain_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sg-"));
        assert_eq!(a.len(), 3 + 16);
    }
}
