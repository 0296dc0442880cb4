//! Daemon state: initialization, ownership and teardown
//!
//! One `DaemonState` owns everything the process holds open: the event
//! store, the embedding model, the ANN index, the encoder queue, the
//! privacy filter, the engine and the exclusive data-directory lock. It
//! is built once at startup and passed to request handlers as an `Arc`;
//! no ambient globals, so the locking story stays auditable.
//!
//! Startup order: data directory (0700) → lock (`AlreadyRunning` if
//! held) → store → model (load, or bootstrap-train from stored commands /
//! a seed corpus) → ANN index (load; rebuild when absent or its
//! generation lags the store) → queue, engine, caches.

pub mod scheduler;

use crate::ann::{AnnIndex, ItemMeta};
use crate::cache::TtlCache;
use crate::config::Config;
use crate::embedding::corpus::RollingCorpus;
use crate::embedding::queue::{EmbedQueue, EncodeJob};
use crate::embedding::trainer::{train, TrainParams};
use crate::embedding::SkipgramModel;
use crate::engine::SuggestEngine;
use crate::events::ShellKind;
use crate::fingerprint::fingerprint;
use crate::privacy::{PrivacyDecision, PrivacyFilter};
use crate::server::protocol::LogRequest;
use crate::store::query::StoreQuery;
use crate::store::{EventRecord, EventStore, StoreConfig, StoreError};
use crate::tokenizer::tokenize;
use crate::util::{now_ns, restrict_dir_permissions, restrict_file_permissions};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Envelope-id dedup window for `log` requests.
const LOG_DEDUP_CAPACITY: usize = 4_096;
const LOG_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Commands seeding the first model when the store is empty.
const SEED_COMMANDS: &[&str] = &[
    "ls", "ls -la", "ls -lh", "cd ..", "cd ~", "pwd", "cat README.md", "less README.md",
    "mkdir build", "rm build/tmp.txt", "cp a.txt b.txt", "mv old.txt new.txt", "touch notes.txt",
    "grep -r TODO src", "find . -name *.rs", "which cargo", "echo hello", "env", "history",
    "git status", "git log", "git diff", "git add .", "git commit -m update", "git push",
    "git pull", "git checkout main", "git branch", "git stash", "git stash pop",
    "cargo build", "cargo test", "cargo run", "cargo check", "cargo fmt", "cargo clippy",
    "make", "make install", "make clean", "python3 main.py", "pip install requests",
    "docker ps", "docker ps -a", "docker images", "docker compose up", "docker compose down",
    "ssh server", "scp file.txt server:", "curl -s localhost:8080", "ping -c 3 localhost",
    "tar xf archive.tar.gz", "du -sh .", "df -h", "ps aux", "top", "kill 1234",
    "systemctl status nginx", "journalctl -u nginx", "man tar", "head -n 20 log.txt",
    "tail -f log.txt",
];

#[derive(Debug, Error)]
pub enum InitError {
    #[error("another instance already holds the daemon lock")]
    AlreadyRunning,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Exclusive per-user instance lock. Held for the daemon's lifetime; the
/// backing `RwLock` is leaked deliberately so the guard can live in the
/// state without a self-reference.
pub struct DaemonLock {
    _guard: fd_lock::RwLockWriteGuard<'static, std::fs::File>,
}

impl DaemonLock {
    pub fn acquire(path: &Path) -> Result<Self, InitError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        restrict_file_permissions(path)
            .with_context(|| "restricting lock file permissions")?;

        let lock: &'static mut fd_lock::RwLock<std::fs::File> =
            Box::leak(Box::new(fd_lock::RwLock::new(file)));
        match lock.try_write() {
            Ok(guard) => Ok(Self { _guard: guard }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(InitError::AlreadyRunning),
            Err(e) => Err(InitError::Other(
                anyhow::Error::new(e).context("acquiring daemon lock"),
            )),
        }
    }
}

/// File locations inside the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn events_db(&self) -> PathBuf {
        self.root.join("events.db")
    }

    pub fn model(&self) -> PathBuf {
        self.root.join("embeddings.model")
    }

    pub fn corpus(&self) -> PathBuf {
        self.root.join("embeddings.corpus")
    }

    pub fn ann_index(&self) -> PathBuf {
        self.root.join("ann.index")
    }

    pub fn ann_meta(&self) -> PathBuf {
        self.root.join("ann.meta")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }
}

/// Outcome of one `log` request after the privacy filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Stored(i64),
    Rejected,
}

/// The process-wide owned state.
pub struct DaemonState {
    pub config: Config,
    pub paths: DataPaths,
    pub store: Arc<EventStore>,
    pub query: Arc<StoreQuery>,
    pub model: Arc<RwLock<Option<SkipgramModel>>>,
    pub ann: Arc<RwLock<AnnIndex>>,
    pub engine: SuggestEngine,
    pub privacy: PrivacyFilter,
    pub embed_queue: EmbedQueue,
    /// Duplicate `log` envelopes coalesce to their original event id.
    pub log_dedup: TtlCache<String, i64>,
    /// Successful events logged since the last retrain cycle.
    pub new_success_since_retrain: AtomicU64,
    started: Instant,
    shutdown_tx: watch::Sender<bool>,
    _lock: DaemonLock,
}

impl DaemonState {
    /// Build the full daemon state. Fails fast with `AlreadyRunning` when
    /// a second instance races for the same data directory.
    pub fn init(config: Config) -> Result<Arc<Self>, InitError> {
        let paths = DataPaths::new(config.daemon.data_dir.clone());
        std::fs::create_dir_all(paths.root())
            .with_context(|| format!("creating data directory {}", paths.root().display()))?;
        restrict_dir_permissions(paths.root()).with_context(|| "restricting data directory")?;

        let lock = DaemonLock::acquire(&paths.lock())?;

        let store = Arc::new(
            EventStore::open(StoreConfig {
                db_path: paths.events_db(),
                ..StoreConfig::default()
            })
            .context("opening event store")?,
        );
        restrict_file_permissions(&paths.events_db()).with_context(|| "restricting events.db")?;
        let query = Arc::new(StoreQuery::new(paths.events_db()).context("opening read pool")?);

        let train_params = TrainParams {
            dim: config.embedding.dim,
            ..TrainParams::default()
        };
        let corpus = RollingCorpus::new(paths.corpus(), config.rolling_corpus.max_lines);
        let model = bootstrap_model(&paths, &corpus, &query, &train_params);
        let model = Arc::new(RwLock::new(model));

        let ann = load_or_rebuild_ann(&paths, &config, &model, &query);
        let ann = Arc::new(RwLock::new(ann));

        let embed_queue =
            EmbedQueue::start(model.clone(), ann.clone()).context("starting encoder thread")?;

        let engine = SuggestEngine::new(
            query.clone(),
            store.clone(),
            model.clone(),
            ann.clone(),
            config.suggest.clone(),
            config.safety.level,
        );

        let privacy = PrivacyFilter::new(
            &config.privacy.excluded_paths,
            &config.privacy.pattern_pairs(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            paths,
            store,
            query,
            model,
            ann,
            engine,
            privacy,
            embed_queue,
            log_dedup: TtlCache::new(LOG_DEDUP_CAPACITY, LOG_DEDUP_TTL),
            new_success_since_retrain: AtomicU64::new(0),
            started: Instant::now(),
            shutdown_tx,
            _lock: lock,
        }))
    }

    pub fn uptime_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        // send_replace stores the flag even with no receivers subscribed
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Process one `log` request: classify, fingerprint, append, and feed
    /// the embedding pipeline. The caller has already validated sizes.
    pub fn handle_log(&self, request: &LogRequest) -> Result<LogOutcome, StoreError> {
        let decision = self.privacy.classify(&request.command, &request.cwd);
        if decision == PrivacyDecision::Drop {
            tracing::debug!("log rejected by privacy filter");
            return Ok(LogOutcome::Rejected);
        }

        let stream = tokenize(&request.command);
        let fp = fingerprint(&request.command);
        // zero-token commands are stored as redacted noise
        let redacted = decision == PrivacyDecision::Redact || stream.is_empty();

        let tokens_text = if redacted {
            None
        } else {
            let text = stream.embedding_text();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        };

        let ts_ns = now_ns();
        let shell_kind = request
            .shell_kind
            .as_deref()
            .map(ShellKind::parse)
            .unwrap_or_default();

        let record = EventRecord {
            session_id: request.session_id.clone(),
            ts_ns,
            command: if redacted {
                None
            } else {
                Some(request.command.clone())
            },
            tokens_text,
            cwd: request.cwd.clone(),
            exit_code: request.exit_code,
            duration_ns: request.duration_ns,
            redacted,
            fingerprint: fp.clone(),
            shell_kind,
        };
        let success = matches!(request.exit_code, Some(0) | None);
        let id = self.store.append(record)?;

        if success && !redacted {
            self.embed_queue.submit(EncodeJob {
                event_id: id,
                fingerprint: fp,
                command: request.command.clone(),
                insert_ts_ns: ts_ns,
            });
            self.new_success_since_retrain.fetch_add(1, Ordering::Relaxed);
        }

        Ok(LogOutcome::Stored(id))
    }
}

/// Load the saved model, or train a first one from stored commands (or
/// the seed corpus when the store is empty). Returns `None` when there is
/// not enough material yet; the semantic tier stays degraded until the
/// scheduler's first successful retrain.
fn bootstrap_model(
    paths: &DataPaths,
    corpus: &RollingCorpus,
    query: &StoreQuery,
    params: &TrainParams,
) -> Option<SkipgramModel> {
    match SkipgramModel::load(&paths.model()) {
        Ok(model) if model.dim() == params.dim => {
            tracing::info!("Loaded embedding model ({} words)", model.vocab_size());
            return Some(model);
        }
        Ok(model) => {
            tracing::warn!(
                "Saved model dimension {} does not match configured {}; retraining",
                model.dim(),
                params.dim
            );
        }
        Err(crate::embedding::EmbedError::Io(e))
            if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!("Failed to load embedding model: {}; retraining", e);
        }
    }

    // build a bootstrap corpus: stored history first, seed list when empty
    let mut lines = match corpus.load() {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!("Failed to read corpus: {}", e);
            Vec::new()
        }
    };
    if lines.is_empty() {
        let commands = query.recent_commands(10_000).unwrap_or_default();
        lines = commands
            .iter()
            .map(|c| tokenize(c).embedding_text())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            lines = SEED_COMMANDS
                .iter()
                .map(|c| tokenize(c).embedding_text())
                .collect();
        }
        if let Err(e) = corpus.append(&lines) {
            tracing::warn!("Failed to seed corpus: {}", e);
        }
    }

    match train(&lines, params) {
        Ok(model) => {
            if let Err(e) = model.save(&paths.model()) {
                tracing::warn!("Failed to persist bootstrap model: {}", e);
            }
            tracing::info!(
                "Trained bootstrap model over {} corpus lines ({} words)",
                lines.len(),
                model.vocab_size()
            );
            Some(model)
        }
        Err(e) => {
            tracing::info!("No embedding model yet: {}", e);
            None
        }
    }
}

/// Load the saved ANN index; rebuild from the store when it is missing,
/// unreadable, or its generation no longer matches the event log.
fn load_or_rebuild_ann(
    paths: &DataPaths,
    config: &Config,
    model: &Arc<RwLock<Option<SkipgramModel>>>,
    query: &StoreQuery,
) -> AnnIndex {
    let store_generation = query.latest_event_id().unwrap_or(0) as u64;

    match AnnIndex::load(&paths.ann_index(), config.embedding.dim, config.ann.trees) {
        Ok(index) if index.generation() == store_generation => {
            tracing::info!("Loaded ANN index ({} vectors)", index.size());
            return index;
        }
        Ok(index) => {
            tracing::info!(
                "ANN index generation {} behind store {}; rebuilding",
                index.generation(),
                store_generation
            );
        }
        Err(crate::ann::AnnError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No ANN index on disk; building from store");
        }
        Err(e) => {
            tracing::warn!("Failed to load ANN index: {}; rebuilding", e);
        }
    }

    let guard = model.read().unwrap_or_else(|e| e.into_inner());
    match rebuild_ann_from_store(query, guard.as_ref(), config.embedding.dim, config.ann.trees) {
        Ok(index) => {
            if index.size() > 0 {
                if let Err(e) = index.save(&paths.ann_index(), &paths.ann_meta()) {
                    tracing::warn!("Failed to persist rebuilt ANN index: {}", e);
                }
            }
            index
        }
        Err(e) => {
            tracing::warn!("ANN rebuild failed: {}; semantic tier degraded", e);
            AnnIndex::new(config.embedding.dim, config.ann.trees)
        }
    }
}

/// Rebuild a fresh index from the store under snapshot isolation: one
/// representative (most recent successful) event per fingerprint.
pub fn rebuild_ann_from_store(
    query: &StoreQuery,
    model: Option<&SkipgramModel>,
    dim: usize,
    trees: usize,
) -> anyhow::Result<AnnIndex> {
    let mut index = AnnIndex::new(dim, trees);
    let Some(model) = model else {
        return Ok(index);
    };

    let snapshot = query.latest_event_id()?;
    let representatives = query.rebuild_representatives(snapshot)?;
    for event in &representatives {
        let Some(command) = &event.command else {
            continue;
        };
        let vector = model.encode(command);
        if vector.iter().all(|x| *x == 0.0) {
            continue;
        }
        index.add(
            vector,
            ItemMeta {
                fingerprint: event.fingerprint.clone(),
                command_ref: event.id,
                insert_ts_ns: event.ts_ns,
            },
        )?;
    }
    index.build();
    index.set_generation(snapshot as u64);
    tracing::info!(
        "Rebuilt ANN index: {} fingerprints at generation {}",
        index.size(),
        snapshot
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = dir.to_path_buf();
        config.embedding.dim = 16;
        config
    }

    fn log_request(command: &str, cwd: &str, exit: Option<i32>) -> LogRequest {
        LogRequest {
            command: command.to_string(),
            cwd: cwd.to_string(),
            exit_code: exit,
            duration_ns: None,
            session_id: "s1".to_string(),
            shell_kind: Some("zsh".to_string()),
        }
    }

    #[test]
    fn test_init_creates_layout_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = DaemonState::init(test_config(dir.path())).expect("init");

        assert!(dir.path().join("events.db").exists());
        assert!(dir.path().join("daemon.lock").exists());
        // seed corpus trained a bootstrap model
        assert!(dir.path().join("embeddings.model").exists());
        assert!(dir.path().join("embeddings.corpus").exists());

        let outcome = state
            .handle_log(&log_request("git status", "/p", Some(0)))
            .expect("log");
        assert!(matches!(outcome, LogOutcome::Stored(id) if id > 0));
        assert_eq!(state.store.events_stored(), 1);
    }

    #[test]
    fn test_second_instance_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _first = DaemonState::init(test_config(dir.path())).expect("init");
        let second = DaemonState::init(test_config(dir.path()));
        assert!(matches!(second, Err(InitError::AlreadyRunning)));
    }

    #[test]
    fn test_privacy_drop_never_stored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.privacy.excluded_paths = vec!["/home/u/.vault".to_string()];
        let state = DaemonState::init(config).expect("init");

        let outcome = state
            .handle_log(&log_request("ls", "/home/u/.vault/keys", Some(0)))
            .expect("log");
        assert_eq!(outcome, LogOutcome::Rejected);
        assert_eq!(state.store.events_stored(), 0);
        assert!(state.query.search("ls", 10).expect("search").is_empty());
    }

    #[test]
    fn test_secretlike_command_redacted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = DaemonState::init(test_config(dir.path())).expect("init");

        let outcome = state
            .handle_log(&log_request("mysql --password=hunter2", "/p", Some(0)))
            .expect("log");
        assert!(matches!(outcome, LogOutcome::Stored(_)));

        let recent = state.query.recent(1).expect("recent");
        assert!(recent[0].redacted);
        assert!(recent[0].command.is_none());
        assert!(!recent[0].fingerprint.is_empty());
    }

    #[test]
    fn test_zero_token_command_stored_as_noise() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = DaemonState::init(test_config(dir.path())).expect("init");

        let outcome = state
            .handle_log(&log_request("   ", "/p", Some(0)))
            .expect("log");
        assert!(matches!(outcome, LogOutcome::Stored(_)));

        let recent = state.query.recent(1).expect("recent");
        assert!(recent[0].redacted, "noise events are stored redacted");
        // and never reach the FTS index or the training corpus source
        assert!(state
            .query
            .recent_commands(100)
            .expect("commands")
            .is_empty());
    }

    #[test]
    fn test_ann_rebuilt_after_index_loss() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let state = DaemonState::init(test_config(dir.path())).expect("init");
            for i in 0..5 {
                state
                    .handle_log(&log_request(&format!("git status{}", " ".repeat(i % 2)), "/p", Some(0)))
                    .expect("log");
            }
            // persist the staged vectors so the restart has something to lose
            let mut ann = state.ann.write().expect("lock");
            ann.build();
            ann.save(&state.paths.ann_index(), &state.paths.ann_meta())
                .expect("save");
        }

        std::fs::remove_file(dir.path().join("ann.index")).expect("delete index");

        let state = DaemonState::init(test_config(dir.path())).expect("reinit");
        let ann = state.ann.read().expect("lock");
        assert!(ann.is_built());
        assert!(ann.size() > 0, "index should be rebuilt from the store");
    }
}
