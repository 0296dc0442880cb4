//! Suggestion engine
//!
//! The three-tier cascade plus the re-ranker. Candidates are drawn from:
//!
//! 1. **Exact**: prefix lookup against the event log (base confidence 1.0)
//! 2. **Semantic**: embedding encode + ANN nearest neighbors
//!    (base confidence `max(0, 1 − distance)`)
//! 3. **Contextual**: k-gram successor statistics from session sequences
//!    (base confidence = relative bucket frequency, capped at 0.9)
//!
//! Sources are not exclusive; the merged set is deduplicated by
//! fingerprint with stable tier ordering (exact, semantic, contextual)
//! before re-ranking. A missing model or index degrades the semantic tier
//! instead of failing; a store failure on the exact tier fails the whole
//! request.

pub mod explain;
pub mod rerank;

use crate::ann::AnnIndex;
use crate::cache::TtlCache;
use crate::config::{SafetyLevel, SuggestConfig};
use crate::embedding::{EncodeContext, SkipgramModel};
use crate::events::CommandEvent;
use crate::fingerprint::fingerprint;
use crate::safety::SafetyAnalyzer;
use crate::store::query::StoreQuery;
use crate::store::{sequence_key, EventStore, StoreError};
use explain::{new_explain_id, ScoringBreakdown};
use rerank::{compute_factors, final_score, Preferences};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Exact-tier candidate limit.
const TIER1_LIMIT: usize = 32;
/// Semantic-tier neighbor count.
const TIER2_LIMIT: usize = 20;
/// Successors considered per sequence bucket.
const TIER3_LIMIT: usize = 10;
/// Contextual base confidence ceiling.
const TIER3_CAP: f64 = 0.9;
/// Largest accepted partial command.
const MAX_PARTIAL_BYTES: usize = 64 * 1024;
/// Retained scoring breakdowns.
const EXPLAIN_CAPACITY: usize = 1_024;
const EXPLAIN_TTL: Duration = Duration::from_secs(15 * 60);

/// Which tier produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TierSource {
    #[serde(rename = "tier1")]
    Exact,
    #[serde(rename = "tier2")]
    Semantic,
    #[serde(rename = "tier3")]
    Contextual,
}

impl TierSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "tier1",
            Self::Semantic => "tier2",
            Self::Contextual => "tier3",
        }
    }
}

/// One suggestion emitted to the client.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub command: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    pub source: TierSource,
    pub fingerprint: String,
    pub explain_id: String,
}

/// The full suggest result: candidates plus any degraded tiers.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestOutcome {
    pub candidates: Vec<Candidate>,
    pub degraded: Vec<String>,
}

/// Inputs to one suggest call.
#[derive(Debug, Clone, Default)]
pub struct SuggestParams {
    pub partial: String,
    pub cwd: String,
    /// Previous commands, oldest first.
    pub history: Vec<String>,
    pub limit: Option<usize>,
    pub preferences: Option<Preferences>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unknown id")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A candidate before re-ranking.
struct RawCandidate {
    event: CommandEvent,
    source: TierSource,
    base: f64,
    tiers: Vec<String>,
}

/// The engine. Cheap to share: every field is a handle.
pub struct SuggestEngine {
    query: Arc<StoreQuery>,
    store: Arc<EventStore>,
    model: Arc<RwLock<Option<SkipgramModel>>>,
    ann: Arc<RwLock<AnnIndex>>,
    safety: SafetyAnalyzer,
    safety_level: SafetyLevel,
    config: SuggestConfig,
    explain_cache: TtlCache<String, ScoringBreakdown>,
    suggestions_served: AtomicU64,
}

impl SuggestEngine {
    pub fn new(
        query: Arc<StoreQuery>,
        store: Arc<EventStore>,
        model: Arc<RwLock<Option<SkipgramModel>>>,
        ann: Arc<RwLock<AnnIndex>>,
        config: SuggestConfig,
        safety_level: SafetyLevel,
    ) -> Self {
        Self {
            query,
            store,
            model,
            ann,
            safety: SafetyAnalyzer::new(),
            safety_level,
            config,
            explain_cache: TtlCache::new(EXPLAIN_CAPACITY, EXPLAIN_TTL),
            suggestions_served: AtomicU64::new(0),
        }
    }

    /// Candidates served since startup.
    pub fn suggestions_served(&self) -> u64 {
        self.suggestions_served.load(Ordering::Relaxed)
    }

    /// Tiers currently unavailable, for `status`.
    pub fn degraded_tiers(&self) -> Vec<String> {
        let mut degraded = Vec::new();
        let model_missing = self
            .model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none();
        let ann_unusable = {
            let ann = self.ann.read().unwrap_or_else(|e| e.into_inner());
            !ann.is_built() || ann.size() == 0
        };
        if model_missing || ann_unusable {
            degraded.push("semantic".to_string());
        }
        degraded
    }

    /// Run the cascade and re-ranker.
    pub fn suggest(&self, params: &SuggestParams) -> Result<SuggestOutcome, EngineError> {
        if params.partial.len() > MAX_PARTIAL_BYTES {
            return Err(EngineError::BadRequest(format!(
                "partial exceeds {} bytes",
                MAX_PARTIAL_BYTES
            )));
        }

        let limit = params
            .limit
            .unwrap_or(self.config.max)
            .min(self.config.max)
            .max(1);
        let mut degraded: Vec<String> = Vec::new();

        // Tier 1, exact/prefix. A store failure here fails the request.
        let tier1 = self
            .query
            .prefix_candidates(&params.partial, &params.cwd, TIER1_LIMIT)
            .map_err(EngineError::Backend)?;

        let mut merged: Vec<RawCandidate> = Vec::new();
        let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
        for event in tier1 {
            push_candidate(&mut merged, &mut by_fingerprint, event, TierSource::Exact, 1.0);
        }

        // Tier 1 alone satisfying the limit short-circuits the rest; its
        // base confidence (1.0) always clears min_confidence.
        let short_circuit = merged.len() >= limit;

        if !short_circuit {
            self.run_semantic_tier(params, &mut merged, &mut by_fingerprint, &mut degraded);
            self.run_contextual_tier(params, &mut merged, &mut by_fingerprint, &mut degraded);
        }

        self.rank_and_emit(params, merged, limit, degraded)
    }

    /// Tier 2, semantic nearest neighbors. Missing model or index only
    /// degrades; per-candidate lookup failures drop that candidate.
    fn run_semantic_tier(
        &self,
        params: &SuggestParams,
        merged: &mut Vec<RawCandidate>,
        by_fingerprint: &mut HashMap<String, usize>,
        degraded: &mut Vec<String>,
    ) {
        let encoded = {
            let guard = self.model.read().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(model) => {
                    let context = EncodeContext {
                        cwd_leaf: cwd_leaf(&params.cwd),
                        recent_commands: params.history.clone(),
                    };
                    model.encode_with_context(&params.partial, &context)
                }
                None => {
                    degraded.push("semantic".to_string());
                    return;
                }
            }
        };

        let neighbors = {
            let ann = self.ann.read().unwrap_or_else(|e| e.into_inner());
            if !ann.is_built() || ann.size() == 0 {
                degraded.push("semantic".to_string());
                return;
            }
            ann.query(&encoded, TIER2_LIMIT)
        };

        for (meta, distance) in neighbors {
            let base = (1.0 - distance as f64).max(0.0);
            if base <= 0.0 {
                continue;
            }
            let event = match self.lookup_semantic_event(&meta.fingerprint, meta.command_ref) {
                Some(event) => event,
                None => continue,
            };
            push_candidate(merged, by_fingerprint, event, TierSource::Semantic, base);
        }
    }

    /// The canonical event behind an ANN record; falls back to the current
    /// canonical occurrence when the referenced event has been pruned.
    fn lookup_semantic_event(&self, fp: &str, command_ref: i64) -> Option<CommandEvent> {
        if let Ok(Some(event)) = self.query.by_id(command_ref) {
            if !event.redacted && event.command.is_some() {
                return Some(event);
            }
        }
        match self.query.canonical_event(fp) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("canonical lookup failed for {}: {}", fp, e);
                None
            }
        }
    }

    /// Tier 3, contextual successors of the recent history k-grams. The
    /// 3-gram key is tried before the 2-gram so more specific context wins
    /// the dedup.
    fn run_contextual_tier(
        &self,
        params: &SuggestParams,
        merged: &mut Vec<RawCandidate>,
        by_fingerprint: &mut HashMap<String, usize>,
        degraded: &mut Vec<String>,
    ) {
        if params.history.is_empty() {
            return;
        }
        let recent: Vec<String> = params
            .history
            .iter()
            .rev()
            .take(3)
            .map(|c| fingerprint(c))
            .collect();
        // recent[0] is the most recent command's fingerprint

        let mut keys: Vec<String> = Vec::new();
        if recent.len() >= 2 {
            keys.push(sequence_key([&recent[1], &recent[0]].into_iter()));
        }
        keys.push(sequence_key([&recent[0]].into_iter()));

        for key in keys {
            let successors = match self.query.successors(&key, TIER3_LIMIT) {
                Ok(successors) => successors,
                Err(e) => {
                    tracing::warn!("sequence lookup failed: {}", e);
                    if !degraded.iter().any(|d| d == "contextual") {
                        degraded.push("contextual".to_string());
                    }
                    return;
                }
            };
            if successors.is_empty() {
                continue;
            }
            let total: u64 = match self.query.sequence_bucket_total(&key) {
                Ok(total) if total > 0 => total,
                _ => continue,
            };

            for (successor_fp, count) in successors {
                let base = ((count as f64) / (total as f64)).min(TIER3_CAP);
                let event = match self.query.canonical_event(&successor_fp) {
                    Ok(Some(event)) => event,
                    _ => continue,
                };
                push_candidate(merged, by_fingerprint, event, TierSource::Contextual, base);
            }
        }
    }

    /// Re-rank, apply preferences and limits, annotate risk, allocate
    /// explain ids and record emissions.
    fn rank_and_emit(
        &self,
        params: &SuggestParams,
        merged: Vec<RawCandidate>,
        limit: usize,
        degraded: Vec<String>,
    ) -> Result<SuggestOutcome, EngineError> {
        let now_ns = crate::util::now_ns();
        let max_exec = self.query.max_exec_count().map_err(EngineError::Backend)?;
        let prefs = params.preferences.as_ref();

        struct Scored {
            raw: RawCandidate,
            command: String,
            factors: rerank::Factors,
            score: f64,
        }

        let mut scored: Vec<Scored> = Vec::new();
        for raw in merged {
            let Some(command) = raw.event.command.clone() else {
                continue;
            };
            if prefs.map(|p| p.is_blacklisted(&raw.event.fingerprint)) == Some(true) {
                continue;
            }

            let stats = self
                .query
                .stats(&raw.event.fingerprint, None)
                .map_err(EngineError::Backend)?;
            let mut factors =
                compute_factors(&stats, &raw.event.cwd, &params.cwd, max_exec, now_ns);
            let score = final_score(
                raw.base,
                &mut factors,
                &command,
                &raw.event.fingerprint,
                prefs,
            );
            if score < self.config.min_confidence {
                continue;
            }
            scored.push(Scored {
                raw,
                command,
                factors,
                score,
            });
        }

        // deterministic: score descending, then event id descending
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.raw.event.id.cmp(&a.raw.event.id))
        });
        scored.truncate(limit);

        let mut candidates = Vec::with_capacity(scored.len());
        let mut emissions = Vec::with_capacity(scored.len());
        for item in scored {
            let risk = match self.safety_level {
                SafetyLevel::Annotate => Some(self.safety.assess(&item.command).risk),
                SafetyLevel::Off => None,
            };
            let explain_id = new_explain_id();

            self.explain_cache.insert(
                explain_id.clone(),
                ScoringBreakdown {
                    explain_id: explain_id.clone(),
                    fingerprint: item.raw.event.fingerprint.clone(),
                    command: item.command.clone(),
                    shape: crate::fingerprint::masked_shape(&item.command),
                    cwd: item.raw.event.cwd.clone(),
                    event_id: item.raw.event.id,
                    tiers: item.raw.tiers.clone(),
                    base_confidence: item.raw.base,
                    factors: item.factors,
                    final_score: item.score,
                    feedback_recorded: false,
                },
            );
            emissions.push((item.raw.event.fingerprint.clone(), item.raw.event.cwd.clone()));

            candidates.push(Candidate {
                command: item.command,
                confidence: item.score,
                risk,
                source: item.raw.source,
                fingerprint: item.raw.event.fingerprint,
                explain_id,
            });
        }

        self.store.record_emissions(emissions);
        self.suggestions_served
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);

        Ok(SuggestOutcome {
            candidates,
            degraded,
        })
    }

    /// Record accept/reject feedback for an emitted candidate. Visible to
    /// subsequent suggest calls once this returns.
    pub fn record_feedback(&self, explain_id: &str, accepted: bool) -> Result<(), EngineError> {
        let breakdown = self
            .explain_cache
            .get(&explain_id.to_string())
            .ok_or(EngineError::NotFound)?;

        self.store.record_feedback(
            &breakdown.fingerprint,
            &breakdown.cwd,
            accepted,
            explain_id,
            crate::util::now_ns(),
        )?;

        self.explain_cache
            .update(&explain_id.to_string(), |b| b.feedback_recorded = true);
        Ok(())
    }

    /// Scoring breakdown for an emitted candidate.
    pub fn explain(&self, explain_id: &str) -> Result<ScoringBreakdown, EngineError> {
        self.explain_cache
            .get(&explain_id.to_string())
            .ok_or(EngineError::NotFound)
    }
}

/// Append a candidate, deduplicating by fingerprint. The first tier to
/// produce a fingerprint keeps the candidate; later tiers only note
/// themselves on its breakdown.
fn push_candidate(
    merged: &mut Vec<RawCandidate>,
    by_fingerprint: &mut HashMap<String, usize>,
    event: CommandEvent,
    source: TierSource,
    base: f64,
) {
    match by_fingerprint.get(&event.fingerprint) {
        Some(&idx) => {
            let tier = source.as_str().to_string();
            if !merged[idx].tiers.contains(&tier) {
                merged[idx].tiers.push(tier);
            }
        }
        None => {
            by_fingerprint.insert(event.fingerprint.clone(), merged.len());
            merged.push(RawCandidate {
                tiers: vec![source.as_str().to_string()],
                event,
                source,
                base,
            });
        }
    }
}

fn cwd_leaf(cwd: &str) -> String {
    cwd.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}
