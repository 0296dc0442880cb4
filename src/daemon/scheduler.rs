//! Maintenance scheduler
//!
//! One dedicated task owns all background jobs, run serially so they
//! never contend for the model/index write locks:
//!
//! 1. retention prune: hourly, plus aggressive pruning over the disk budget
//! 2. index maintenance: build when >=512 staged additions, or >=30 s idle
//!    with at least one
//! 3. incremental retrain: after enough new successful events, append
//!    new lines to the rolling corpus, cap it, retrain over the union,
//!    then rebuild the ANN index under snapshot isolation
//! 4. shutdown flush: drain the encoder queue, final build/retrain,
//!    persist everything
//!
//! The live request path never waits on any of these; heavy work runs in
//! `spawn_blocking` and swaps results behind the shared locks.

use super::{rebuild_ann_from_store, DaemonState};
use crate::embedding::corpus::RollingCorpus;
use crate::embedding::trainer::{train, TrainParams};
use crate::embedding::EmbedError;
use crate::tokenizer::tokenize;
use crate::util::{dir_size_bytes, now_ns};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduler wake-up cadence.
const TICK: Duration = Duration::from_secs(5);
/// Retention prune cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3_600);
/// Staged additions forcing an index build.
const BUILD_PENDING_THRESHOLD: usize = 512;
/// Idle time after which any staged addition triggers a build.
const BUILD_IDLE: Duration = Duration::from_secs(30);
/// Minimum gap between retrain attempts, so a too-small corpus does not
/// retry every tick.
const RETRAIN_BACKOFF: Duration = Duration::from_secs(60);
/// New successful events forcing a retrain at shutdown.
const SHUTDOWN_RETRAIN_THRESHOLD: u64 = 50;
/// Sessions idle longer than this are closed.
const SESSION_IDLE: Duration = Duration::from_secs(24 * 3_600);
/// Data directory budget.
const DISK_BUDGET_BYTES: u64 = 500 * 1024 * 1024;
/// Encoder queue drain bound at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Scheduler {
    state: Arc<DaemonState>,
    corpus: RollingCorpus,
    last_retrain_event_id: i64,
    last_prune: Option<Instant>,
    last_retrain_attempt: Option<Instant>,
}

impl Scheduler {
    pub fn new(state: Arc<DaemonState>) -> Self {
        let corpus = RollingCorpus::new(
            state.paths.corpus(),
            state.config.rolling_corpus.max_lines,
        );
        // everything stored so far went into the bootstrap corpus
        let last_retrain_event_id = state.query.latest_event_id().unwrap_or(0);
        Self {
            state,
            corpus,
            last_retrain_event_id,
            last_prune: None,
            last_retrain_attempt: None,
        }
    }

    /// Run until shutdown is signaled, then flush.
    pub async fn run(mut self) {
        let mut shutdown = self.state.subscribe_shutdown();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.maybe_build(false).await;
                    self.maybe_retrain(false).await;
                    self.maybe_prune().await;
                }
            }
        }

        self.shutdown_flush().await;
    }

    /// Event-driven index maintenance.
    async fn maybe_build(&mut self, force: bool) {
        let pending = {
            let ann = self.state.ann.read().unwrap_or_else(|e| e.into_inner());
            ann.pending_len()
        };
        if pending == 0 {
            return;
        }

        let idle_long_enough = self
            .state
            .embed_queue
            .ns_since_last_add()
            .map(|ns| ns >= BUILD_IDLE.as_nanos() as i64)
            .unwrap_or(false);
        if !force && pending < BUILD_PENDING_THRESHOLD && !idle_long_enough {
            return;
        }

        let state = self.state.clone();
        let result = tokio::task::spawn_blocking(move || {
            let generation = state.query.latest_event_id().unwrap_or(0) as u64;
            let mut ann = state.ann.write().unwrap_or_else(|e| e.into_inner());
            ann.build();
            ann.set_generation(generation);
            ann.save(&state.paths.ann_index(), &state.paths.ann_meta())
                .map(|_| ann.size())
        })
        .await;

        match result {
            Ok(Ok(size)) => {
                tracing::info!("Index maintenance: built and checkpointed {} vectors", size);
            }
            Ok(Err(e)) => tracing::warn!("Index checkpoint failed: {}", e),
            Err(e) => tracing::error!("Index build task panicked: {}", e),
        }
    }

    /// Event-driven incremental retrain.
    async fn maybe_retrain(&mut self, at_shutdown: bool) {
        let new_events = self.state.new_success_since_retrain.load(Ordering::Relaxed);
        let threshold = if at_shutdown {
            SHUTDOWN_RETRAIN_THRESHOLD
        } else {
            self.state.config.retrain.min_new_events
        };
        if new_events < threshold {
            return;
        }
        if !at_shutdown {
            if let Some(last) = self.last_retrain_attempt {
                if last.elapsed() < RETRAIN_BACKOFF {
                    return;
                }
            }
        }
        self.last_retrain_attempt = Some(Instant::now());

        let state = self.state.clone();
        let corpus = RollingCorpus::new(
            state.paths.corpus(),
            state.config.rolling_corpus.max_lines,
        );
        let since_id = self.last_retrain_event_id;

        let result = tokio::task::spawn_blocking(move || retrain_cycle(&state, &corpus, since_id))
            .await;

        match result {
            Ok(Ok(snapshot)) => {
                self.last_retrain_event_id = snapshot;
                self.state
                    .new_success_since_retrain
                    .store(0, Ordering::Relaxed);
                tracing::info!("Incremental retrain complete (snapshot {})", snapshot);
            }
            Ok(Err(RetrainError::CorpusTooSmall(lines))) => {
                tracing::info!(
                    "Retrain skipped: corpus has {} lines, keeping previous model",
                    lines
                );
            }
            Ok(Err(RetrainError::Failed(e))) => {
                tracing::warn!("Retrain failed, previous model retained: {}", e);
            }
            Err(e) => tracing::error!("Retrain task panicked: {}", e),
        }
    }

    /// Hourly retention prune, session expiry and disk budget enforcement.
    async fn maybe_prune(&mut self) {
        if let Some(last) = self.last_prune {
            if last.elapsed() < PRUNE_INTERVAL {
                return;
            }
        }
        self.last_prune = Some(Instant::now());

        let state = self.state.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut retention_days = state.config.retention_days as i64;
            let mut deleted = state.store.prune(retention_cutoff_ns(retention_days))?;

            // over the disk budget, halve retention until under (bounded)
            for _ in 0..3 {
                if dir_size_bytes(state.paths.root()) <= DISK_BUDGET_BYTES {
                    break;
                }
                retention_days = (retention_days / 2).max(1);
                tracing::warn!(
                    "Data directory over budget; pruning to {} days",
                    retention_days
                );
                deleted += state.store.prune(retention_cutoff_ns(retention_days))?;
            }

            state
                .store
                .close_idle_sessions(now_ns() - SESSION_IDLE.as_nanos() as i64);
            Ok::<u64, crate::store::StoreError>(deleted)
        })
        .await;

        match result {
            Ok(Ok(deleted)) => {
                if deleted > 0 {
                    tracing::info!("Retention prune deleted {} events", deleted);
                }
            }
            Ok(Err(e)) => tracing::warn!("Retention prune failed: {}", e),
            Err(e) => tracing::error!("Prune task panicked: {}", e),
        }
    }

    /// Final flush: drain the encoder, retrain if warranted, build and
    /// persist the index.
    async fn shutdown_flush(&mut self) {
        tracing::info!("Scheduler shutdown flush starting");

        if let Err(e) = self.state.embed_queue.shutdown(DRAIN_TIMEOUT) {
            tracing::warn!("Encoder drain failed: {}", e);
        }

        self.maybe_retrain(true).await;
        self.maybe_build(true).await;

        tracing::info!("Scheduler shutdown flush complete");
    }
}

/// Retention cutoff as nanoseconds since the epoch.
fn retention_cutoff_ns(retention_days: i64) -> i64 {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
    cutoff
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now_ns() - retention_days.saturating_mul(86_400 * 1_000_000_000))
}

#[derive(Debug)]
enum RetrainError {
    CorpusTooSmall(usize),
    Failed(anyhow::Error),
}

/// One retrain cycle: corpus update, training, atomic model swap, ANN
/// rebuild from a store snapshot. Returns the snapshot id on success; on
/// any failure the previous model and index stay live.
fn retrain_cycle(
    state: &Arc<DaemonState>,
    corpus: &RollingCorpus,
    since_id: i64,
) -> Result<i64, RetrainError> {
    let new_commands = state
        .query
        .successful_commands_after(since_id, state.config.rolling_corpus.max_lines)
        .map_err(RetrainError::Failed)?;
    let new_lines: Vec<String> = new_commands
        .iter()
        .map(|c| tokenize(c).embedding_text())
        .filter(|l| !l.is_empty())
        .collect();

    corpus
        .append(&new_lines)
        .map_err(|e| RetrainError::Failed(e.into()))?;
    let lines = corpus
        .cap()
        .map_err(|e| RetrainError::Failed(e.into()))?;

    let params = TrainParams {
        dim: state.config.embedding.dim,
        ..TrainParams::default()
    };
    let model = match train(&lines, &params) {
        Ok(model) => model,
        Err(EmbedError::CorpusTooSmall { lines, .. }) => {
            return Err(RetrainError::CorpusTooSmall(lines));
        }
        Err(e) => return Err(RetrainError::Failed(e.into())),
    };

    // persist first; only a fully saved model supersedes the old one
    model
        .save(&state.paths.model())
        .map_err(|e| RetrainError::Failed(e.into()))?;
    *state.model.write().unwrap_or_else(|e| e.into_inner()) = Some(model);

    let snapshot = {
        let guard = state.model.read().unwrap_or_else(|e| e.into_inner());
        let index = rebuild_ann_from_store(
            &state.query,
            guard.as_ref(),
            state.config.embedding.dim,
            state.config.ann.trees,
        )
        .map_err(RetrainError::Failed)?;
        index
            .save(&state.paths.ann_index(), &state.paths.ann_meta())
            .map_err(|e| RetrainError::Failed(e.into()))?;
        let snapshot = index.generation() as i64;
        *state.ann.write().unwrap_or_else(|e| e.into_inner()) = index;
        snapshot
    };

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::protocol::LogRequest;

    fn test_state(dir: &std::path::Path) -> Arc<DaemonState> {
        let mut config = Config::default();
        config.daemon.data_dir = dir.to_path_buf();
        config.embedding.dim = 16;
        config.retrain.min_new_events = 5;
        DaemonState::init(config).expect("init")
    }

    fn log(state: &Arc<DaemonState>, command: &str) {
        state
            .handle_log(&LogRequest {
                command: command.to_string(),
                cwd: "/p".to_string(),
                exit_code: Some(0),
                duration_ns: None,
                session_id: "s1".to_string(),
                shell_kind: None,
            })
            .expect("log");
    }

    #[test]
    fn test_retrain_cycle_updates_model_and_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path());
        for i in 0..20 {
            log(&state, &format!("git commit -m change{}", i));
            log(&state, "git push");
        }

        let corpus = RollingCorpus::new(
            state.paths.corpus(),
            state.config.rolling_corpus.max_lines,
        );
        let snapshot = retrain_cycle(&state, &corpus, 0).expect("retrain");
        assert_eq!(snapshot, state.query.latest_event_id().expect("latest"));

        let ann = state.ann.read().expect("lock");
        assert!(ann.is_built());
        assert!(ann.size() >= 2);
        assert_eq!(ann.generation(), snapshot as u64);
        assert!(state.model.read().expect("lock").is_some());
    }

    #[test]
    fn test_retrain_failure_keeps_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path());

        // empty the corpus so training cannot proceed
        std::fs::write(state.paths.corpus(), "").expect("truncate corpus");
        let corpus = RollingCorpus::new(state.paths.corpus(), 100);
        let result = retrain_cycle(&state, &corpus, i64::MAX - 1);
        assert!(matches!(result, Err(RetrainError::CorpusTooSmall(_))));
        // bootstrap model still live
        assert!(state.model.read().expect("lock").is_some());
    }

    #[test]
    fn test_corpus_capped_after_retrain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path());
        let max = state.config.rolling_corpus.max_lines;
        for i in 0..60 {
            log(&state, &format!("echo line{}", i));
        }

        let corpus = RollingCorpus::new(state.paths.corpus(), max);
        retrain_cycle(&state, &corpus, 0).expect("retrain");
        assert!(corpus.line_count().expect("count") <= max);
    }
}
