//! Event log storage
//!
//! Stores observed commands in SQLite as the daemon's source of truth.
//! A dedicated writer thread serializes all mutations; readers go through
//! the read-only connection pool in [`query`].
//!
//! # Architecture
//!
//! ```text
//! request handlers (spawn_blocking)
//!     │
//!     └──→ EventStore.append() / record_feedback() / prune()
//!             │
//!             └──→ std::sync::mpsc::SyncSender (bounded)
//!                     │
//!                     └──→ Dedicated Writer Thread
//!                             │
//!                             ├──→ events + events_fts + sessions
//!                             ├──→ pattern_stats (monotone counters)
//!                             └──→ sequences (k-gram successor counts)
//! ```
//!
//! Writes commit per append so a logged event is readable before the
//! response goes out; WAL mode with `synchronous=NORMAL` batches fsyncs
//! (best-effort durability within about a second).

pub mod query;

use crate::events::ShellKind;
use rusqlite::{params, Connection};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How many fingerprints of preceding commands feed the sequence table.
/// k-grams of k = 2 and 3 need the last two.
const SEQUENCE_HISTORY: usize = 3;

/// Separator joining fingerprints into a k-gram key.
pub const SEQUENCE_KEY_SEP: char = '\u{1f}';

/// Writer reply wait bound; a writer stuck longer than this is treated
/// as gone.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by store mutations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data directory cannot accept writes")]
    StorageFull,
    #[error("event store corrupt: {0}")]
    Corrupt(String),
    #[error("event store is shut down")]
    Closed,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.code {
            rusqlite::ErrorCode::DiskFull => return StoreError::StorageFull,
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                return StoreError::Corrupt(e.to_string())
            }
            _ => {}
        }
    }
    StoreError::Backend(e.into())
}

/// Configuration for the event store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,
    /// Channel buffer size (backpressure threshold)
    pub channel_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./events.db"),
            channel_buffer: 1_024,
        }
    }
}

/// A fully prepared event row: the privacy filter and fingerprinting have
/// already run by the time the writer sees it.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub session_id: String,
    pub ts_ns: i64,
    /// None when redacted
    pub command: Option<String>,
    /// Normalized token text for the FTS index; None when redacted or when
    /// tokenization produced nothing
    pub tokens_text: Option<String>,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub duration_ns: Option<u64>,
    pub redacted: bool,
    pub fingerprint: String,
    pub shell_kind: ShellKind,
}

impl EventRecord {
    fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0) | None)
    }
}

/// Commands sent to the writer thread
enum WriterCommand {
    Append {
        record: Box<EventRecord>,
        reply: mpsc::SyncSender<Result<i64, StoreError>>,
    },
    Feedback {
        fingerprint: String,
        cwd: String,
        accepted: bool,
        suggestion_id: String,
        ts_ns: i64,
        reply: mpsc::SyncSender<Result<(), StoreError>>,
    },
    /// (fingerprint, cwd) pairs emitted as candidates
    RecordEmissions(Vec<(String, String)>),
    Prune {
        older_than_ns: i64,
        reply: mpsc::SyncSender<Result<u64, StoreError>>,
    },
    CloseIdleSessions {
        cutoff_ns: i64,
    },
    Shutdown,
}

/// Handle to the event log. Shared behind an `Arc`; all users feed the
/// same writer thread.
pub struct EventStore {
    tx: SyncSender<WriterCommand>,
    writer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    events_stored: Arc<AtomicU64>,
}

impl EventStore {
    /// Open (creating if needed) the store and spawn the writer thread.
    pub fn open(config: StoreConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.channel_buffer);

        // schema must exist before the writer loop and before any reader pool
        let conn = Connection::open(&config.db_path)?;
        apply_pragmas(&conn)?;
        init_schema(&conn)?;

        let events_stored = Arc::new(AtomicU64::new(count_events(&conn)?));
        let writer_counter = events_stored.clone();

        let writer_handle = thread::Builder::new()
            .name("event-writer".into())
            .spawn(move || {
                if let Err(e) = writer_thread(conn, rx, writer_counter) {
                    tracing::error!("Event writer thread error: {}", e);
                }
            })?;

        Ok(Self {
            tx,
            writer_handle: std::sync::Mutex::new(Some(writer_handle)),
            events_stored,
        })
    }

    /// Append one event. Blocks until the row is committed and readable,
    /// then returns the assigned id.
    pub fn append(&self, record: EventRecord) -> Result<i64, StoreError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WriterCommand::Append {
                record: Box::new(record),
                reply: reply_tx,
            })
            .map_err(|_| StoreError::Closed)?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| StoreError::Closed)?
    }

    /// Record a feedback decision against a fingerprint. Blocks until the
    /// counters are visible so later `suggest` calls observe it.
    pub fn record_feedback(
        &self,
        fingerprint: &str,
        cwd: &str,
        accepted: bool,
        suggestion_id: &str,
        ts_ns: i64,
    ) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WriterCommand::Feedback {
                fingerprint: fingerprint.to_string(),
                cwd: cwd.to_string(),
                accepted,
                suggestion_id: suggestion_id.to_string(),
                ts_ns,
                reply: reply_tx,
            })
            .map_err(|_| StoreError::Closed)?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| StoreError::Closed)?
    }

    /// Count candidate emissions. Fire-and-forget: emission accounting is
    /// eventually consistent with the event log.
    pub fn record_emissions(&self, pairs: Vec<(String, String)>) {
        if pairs.is_empty() {
            return;
        }
        let _ = self.tx.try_send(WriterCommand::RecordEmissions(pairs));
    }

    /// Delete events older than the cutoff. Idempotent. Returns the
    /// number of events removed.
    pub fn prune(&self, older_than_ns: i64) -> Result<u64, StoreError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WriterCommand::Prune {
                older_than_ns,
                reply: reply_tx,
            })
            .map_err(|_| StoreError::Closed)?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| StoreError::Closed)?
    }

    /// Close sessions with no activity since the cutoff.
    pub fn close_idle_sessions(&self, cutoff_ns: i64) {
        let _ = self.tx.send(WriterCommand::CloseIdleSessions { cutoff_ns });
    }

    /// Total events currently stored.
    pub fn events_stored(&self) -> u64 {
        self.events_stored.load(Ordering::Relaxed)
    }

    /// Stop the writer thread, flushing queued commands first.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(WriterCommand::Shutdown);
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                anyhow::bail!("event writer thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer thread
// ─────────────────────────────────────────────────────────────────────────────

fn writer_thread(
    conn: Connection,
    rx: mpsc::Receiver<WriterCommand>,
    events_stored: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    // recent fingerprints per session, feeding the sequence table
    let mut session_history: HashMap<String, VecDeque<String>> = HashMap::new();

    let mut last_checkpoint = Instant::now();
    const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(WriterCommand::Append { record, reply }) => {
                let result = store_event(&conn, &record, &mut session_history);
                if result.is_ok() {
                    events_stored.fetch_add(1, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            Ok(WriterCommand::Feedback {
                fingerprint,
                cwd,
                accepted,
                suggestion_id,
                ts_ns,
                reply,
            }) => {
                let result =
                    store_feedback(&conn, &fingerprint, &cwd, accepted, &suggestion_id, ts_ns);
                let _ = reply.send(result);
            }
            Ok(WriterCommand::RecordEmissions(pairs)) => {
                if let Err(e) = store_emissions(&conn, &pairs) {
                    tracing::warn!("Failed to record emissions: {}", e);
                }
            }
            Ok(WriterCommand::Prune {
                older_than_ns,
                reply,
            }) => {
                let result = run_prune(&conn, older_than_ns);
                if let Ok(deleted) = &result {
                    let stored = events_stored.load(Ordering::Relaxed);
                    events_stored.store(stored.saturating_sub(*deleted), Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            Ok(WriterCommand::CloseIdleSessions { cutoff_ns }) => {
                if let Err(e) = close_idle_sessions(&conn, cutoff_ns) {
                    tracing::warn!("Failed to close idle sessions: {}", e);
                }
                session_history.retain(|_, history| !history.is_empty());
            }
            Ok(WriterCommand::Shutdown) => {
                tracing::debug!("Event writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                    if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                        tracing::debug!("WAL checkpoint failed: {}", e);
                    }
                    last_checkpoint = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
    Ok(())
}

fn store_event(
    conn: &Connection,
    record: &EventRecord,
    session_history: &mut HashMap<String, VecDeque<String>>,
) -> Result<i64, StoreError> {
    upsert_session(conn, record).map_err(map_sqlite_err)?;

    conn.execute(
        r#"
        INSERT INTO events (session_id, ts_ns, command, cwd, exit_code, duration_ns, redacted, fingerprint)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.session_id,
            record.ts_ns,
            record.command,
            record.cwd,
            record.exit_code,
            record.duration_ns.map(|d| d as i64),
            record.redacted as i64,
            record.fingerprint,
        ],
    )
    .map_err(map_sqlite_err)?;
    let id = conn.last_insert_rowid();

    if let Some(tokens) = &record.tokens_text {
        conn.execute(
            "INSERT INTO events_fts (rowid, tokens) VALUES (?1, ?2)",
            params![id, tokens],
        )
        .map_err(map_sqlite_err)?;
    }

    bump_pattern_stats(conn, record).map_err(map_sqlite_err)?;
    update_sequences(conn, record, session_history).map_err(map_sqlite_err)?;

    Ok(id)
}

fn upsert_session(conn: &Connection, record: &EventRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"
        INSERT INTO sessions (session_id, start_ts_ns, end_ts_ns, shell_kind, last_seen_ns)
        VALUES (?1, ?2, NULL, ?3, ?2)
        ON CONFLICT(session_id) DO UPDATE SET
            last_seen_ns = excluded.last_seen_ns,
            end_ts_ns = NULL
        "#,
        params![record.session_id, record.ts_ns, record.shell_kind.as_str()],
    )?;
    Ok(())
}

fn bump_pattern_stats(conn: &Connection, record: &EventRecord) -> Result<(), rusqlite::Error> {
    let success = record.is_success() as i64;
    conn.execute(
        r#"
        INSERT INTO pattern_stats (fingerprint, cwd, exec_count, success_count, last_ts_ns,
                                   accept_count, reject_count, emit_count)
        VALUES (?1, ?2, 1, ?3, ?4, 0, 0, 0)
        ON CONFLICT(fingerprint, cwd) DO UPDATE SET
            exec_count = exec_count + 1,
            success_count = success_count + ?3,
            last_ts_ns = MAX(last_ts_ns, ?4)
        "#,
        params![record.fingerprint, record.cwd, success, record.ts_ns],
    )?;
    Ok(())
}

/// Record k-gram (k = 2, 3) successor counts within the session, then push
/// the new fingerprint onto the session's history window.
fn update_sequences(
    conn: &Connection,
    record: &EventRecord,
    session_history: &mut HashMap<String, VecDeque<String>>,
) -> Result<(), rusqlite::Error> {
    if !session_history.contains_key(&record.session_id) {
        let loaded = load_session_history(conn, &record.session_id)?;
        session_history.insert(record.session_id.clone(), loaded);
    }
    let history = session_history
        .entry(record.session_id.clone())
        .or_default();

    for preceding in 1..SEQUENCE_HISTORY {
        if history.len() < preceding {
            break;
        }
        let key = sequence_key(history.iter().skip(history.len() - preceding));
        conn.execute(
            r#"
            INSERT INTO sequences (prefix, next_fingerprint, count)
            VALUES (?1, ?2, 1)
            ON CONFLICT(prefix, next_fingerprint) DO UPDATE SET count = count + 1
            "#,
            params![key, record.fingerprint],
        )?;
    }

    history.push_back(record.fingerprint.clone());
    while history.len() > SEQUENCE_HISTORY {
        history.pop_front();
    }
    Ok(())
}

/// Join fingerprints into a sequence key, oldest first.
pub fn sequence_key<'a>(fingerprints: impl Iterator<Item = &'a String>) -> String {
    let mut key = String::new();
    for fp in fingerprints {
        if !key.is_empty() {
            key.push(SEQUENCE_KEY_SEP);
        }
        key.push_str(fp);
    }
    key
}

/// Most recent fingerprints of a session, oldest first.
fn load_session_history(
    conn: &Connection,
    session_id: &str,
) -> Result<VecDeque<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint FROM events WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![session_id, SEQUENCE_HISTORY as i64], |row| {
        row.get::<_, String>(0)
    })?;
    let mut newest_first: Vec<String> = Vec::new();
    for row in rows {
        newest_first.push(row?);
    }
    Ok(newest_first.into_iter().rev().collect())
}

fn store_feedback(
    conn: &Connection,
    fingerprint: &str,
    cwd: &str,
    accepted: bool,
    suggestion_id: &str,
    ts_ns: i64,
) -> Result<(), StoreError> {
    let (accept, reject) = if accepted { (1i64, 0i64) } else { (0, 1) };
    conn.execute(
        r#"
        INSERT INTO pattern_stats (fingerprint, cwd, exec_count, success_count, last_ts_ns,
                                   accept_count, reject_count, emit_count)
        VALUES (?1, ?2, 0, 0, 0, ?3, ?4, 0)
        ON CONFLICT(fingerprint, cwd) DO UPDATE SET
            accept_count = accept_count + ?3,
            reject_count = reject_count + ?4
        "#,
        params![fingerprint, cwd, accept, reject],
    )
    .map_err(map_sqlite_err)?;

    conn.execute(
        "INSERT INTO feedback (suggestion_id, fingerprint, accepted, ts_ns) VALUES (?1, ?2, ?3, ?4)",
        params![suggestion_id, fingerprint, accepted as i64, ts_ns],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

fn store_emissions(conn: &Connection, pairs: &[(String, String)]) -> Result<(), StoreError> {
    for (fingerprint, cwd) in pairs {
        conn.execute(
            r#"
            INSERT INTO pattern_stats (fingerprint, cwd, exec_count, success_count, last_ts_ns,
                                       accept_count, reject_count, emit_count)
            VALUES (?1, ?2, 0, 0, 0, 0, 0, 1)
            ON CONFLICT(fingerprint, cwd) DO UPDATE SET emit_count = emit_count + 1
            "#,
            params![fingerprint, cwd],
        )
        .map_err(map_sqlite_err)?;
    }
    Ok(())
}

/// Retention prune. FTS rows go first so a crash mid-delete never leaves
/// ghost rowids behind; orphaned statistics rows follow the events.
fn run_prune(conn: &Connection, older_than_ns: i64) -> Result<u64, StoreError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(map_sqlite_err)?;

    let result = (|| -> Result<u64, rusqlite::Error> {
        conn.execute(
            "DELETE FROM events_fts WHERE rowid IN (SELECT id FROM events WHERE ts_ns < ?1)",
            params![older_than_ns],
        )?;

        let deleted = conn.execute("DELETE FROM events WHERE ts_ns < ?1", params![older_than_ns])?;

        conn.execute(
            "DELETE FROM pattern_stats WHERE fingerprint NOT IN (SELECT DISTINCT fingerprint FROM events)",
            [],
        )?;
        conn.execute(
            "DELETE FROM sequences WHERE next_fingerprint NOT IN (SELECT DISTINCT fingerprint FROM events)",
            [],
        )?;
        conn.execute(
            "DELETE FROM sessions WHERE last_seen_ns < ?1",
            params![older_than_ns],
        )?;

        Ok(deleted as u64)
    })();

    match result {
        Ok(deleted) => {
            conn.execute("COMMIT", []).map_err(map_sqlite_err)?;
            Ok(deleted)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(map_sqlite_err(e))
        }
    }
}

fn close_idle_sessions(conn: &Connection, cutoff_ns: i64) -> Result<(), StoreError> {
    let closed = conn
        .execute(
            "UPDATE sessions SET end_ts_ns = last_seen_ns WHERE end_ts_ns IS NULL AND last_seen_ns < ?1",
            params![cutoff_ns],
        )
        .map_err(map_sqlite_err)?;
    if closed > 0 {
        tracing::debug!("Closed {} idle sessions", closed);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA cache_size=-16000;  -- 16MB cache
        "#,
    )
}

fn count_events(conn: &Connection) -> anyhow::Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Initialize database schema and run migrations.
fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn apply_schema_v1(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        -- Metadata table (created first for version tracking)
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        -- Observed command executions. AUTOINCREMENT keeps ids strictly
        -- monotonic even across retention pruning.
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            ts_ns INTEGER NOT NULL,
            command TEXT,            -- NULL when redacted
            cwd TEXT NOT NULL,
            exit_code INTEGER,
            duration_ns INTEGER,
            redacted INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ns);
        CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
        CREATE INDEX IF NOT EXISTS idx_events_cwd ON events(cwd);
        CREATE INDEX IF NOT EXISTS idx_events_exit ON events(exit_code);
        CREATE INDEX IF NOT EXISTS idx_events_fingerprint ON events(fingerprint);

        -- Full-text search over normalized token streams. Standalone
        -- (not external-content) so redacted events are simply absent;
        -- rowid is the event id.
        CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
            tokens,
            tokenize='unicode61'
        );

        -- Shell sessions
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            start_ts_ns INTEGER NOT NULL,
            end_ts_ns INTEGER,
            shell_kind TEXT NOT NULL DEFAULT 'other',
            last_seen_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_seen ON sessions(last_seen_ns);

        -- Aggregated statistics per command shape per directory.
        -- Counters are monotone; rows die only when their fingerprint
        -- leaves the event log entirely.
        CREATE TABLE IF NOT EXISTS pattern_stats (
            fingerprint TEXT NOT NULL,
            cwd TEXT NOT NULL,
            exec_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            last_ts_ns INTEGER NOT NULL DEFAULT 0,
            accept_count INTEGER NOT NULL DEFAULT 0,
            reject_count INTEGER NOT NULL DEFAULT 0,
            emit_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (fingerprint, cwd)
        );

        -- k-gram successor counts for the contextual tier
        CREATE TABLE IF NOT EXISTS sequences (
            prefix TEXT NOT NULL,
            next_fingerprint TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (prefix, next_fingerprint)
        );

        -- Feedback decisions, append-only
        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            suggestion_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            accepted INTEGER NOT NULL,
            ts_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_feedback_fingerprint ON feedback(fingerprint);

        -- Set initial version
        INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1');
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::tokenizer::tokenize;

    fn record(session: &str, ts_ns: i64, command: &str, cwd: &str, exit: Option<i32>) -> EventRecord {
        let stream = tokenize(command);
        EventRecord {
            session_id: session.to_string(),
            ts_ns,
            command: Some(command.to_string()),
            tokens_text: Some(stream.embedding_text()),
            cwd: cwd.to_string(),
            exit_code: exit,
            duration_ns: Some(1_000),
            redacted: false,
            fingerprint: fingerprint(command),
            shell_kind: ShellKind::Zsh,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> EventStore {
        EventStore::open(StoreConfig {
            db_path: dir.path().join("events.db"),
            channel_buffer: 64,
        })
        .expect("open store")
    }

    #[test]
    fn test_append_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        let mut last = 0;
        for i in 0..5 {
            let id = store
                .append(record("s1", i, "git status", "/p", Some(0)))
                .expect("append");
            assert!(id > last);
            last = id;
        }
        assert_eq!(store.events_stored(), 5);
    }

    #[test]
    fn test_stats_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        for i in 0..3 {
            store
                .append(record("s1", i, "cargo test", "/p", Some(0)))
                .expect("append");
        }
        store
            .append(record("s1", 10, "cargo test", "/p", Some(1)))
            .expect("append");

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let stats = query
            .stats(&fingerprint("cargo test"), None)
            .expect("stats");
        assert_eq!(stats.exec_count, 4);
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.last_ts_ns, 10);
    }

    #[test]
    fn test_sequences_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        for round in 0..3 {
            let base = round * 10;
            store
                .append(record("s1", base, "git add .", "/p", Some(0)))
                .expect("append");
            store
                .append(record("s1", base + 1, "git commit -m x", "/p", Some(0)))
                .expect("append");
            store
                .append(record("s1", base + 2, "git push", "/p", Some(0)))
                .expect("append");
        }

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let key = sequence_key(
            [fingerprint("git add ."), fingerprint("git commit -m x")]
                .iter(),
        );
        let successors = query.successors(&key, 5).expect("successors");
        assert!(!successors.is_empty());
        assert_eq!(successors[0].0, fingerprint("git push"));
        assert_eq!(successors[0].1, 3);
    }

    #[test]
    fn test_feedback_updates_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store
            .append(record("s1", 1, "ls", "/p", Some(0)))
            .expect("append");

        let fp = fingerprint("ls");
        store
            .record_feedback(&fp, "/p", true, "sugg-1", 2)
            .expect("feedback");
        store
            .record_feedback(&fp, "/p", false, "sugg-2", 3)
            .expect("feedback");

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let stats = query.stats(&fp, Some("/p")).expect("stats");
        assert_eq!(stats.accept_count, 1);
        assert_eq!(stats.reject_count, 1);
    }

    #[test]
    fn test_emissions_bound_feedback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store
            .append(record("s1", 1, "ls", "/p", Some(0)))
            .expect("append");

        let fp = fingerprint("ls");
        store.record_emissions(vec![(fp.clone(), "/p".to_string()), (fp.clone(), "/p".to_string())]);
        // the feedback round-trip flushes the writer queue behind the emissions
        store
            .record_feedback(&fp, "/p", true, "sugg-1", 2)
            .expect("feedback");

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let stats = query.stats(&fp, Some("/p")).expect("stats");
        assert_eq!(stats.emit_count, 2);
        assert!(stats.accept_count + stats.reject_count <= stats.emit_count);
    }

    #[test]
    fn test_prune_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        store
            .append(record("s1", 100, "old command", "/p", Some(0)))
            .expect("append");
        store
            .append(record("s1", 2_000, "new command", "/p", Some(0)))
            .expect("append");

        let first = store.prune(1_000).expect("prune");
        assert_eq!(first, 1);
        let second = store.prune(1_000).expect("prune again");
        assert_eq!(second, 0);
        assert_eq!(store.events_stored(), 1);

        // FTS rows for pruned events are gone too
        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let hits = query.search("old", 10).expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn test_redacted_event_absent_from_fts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        let mut rec = record("s1", 1, "mysql --password=hunter2", "/p", Some(0));
        rec.command = None;
        rec.tokens_text = None;
        rec.redacted = true;
        store.append(rec).expect("append");

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let hits = query.search("mysql", 10).expect("search");
        assert!(hits.is_empty());
        // but the event itself exists, fingerprint intact
        let recent = query.recent(10).expect("recent");
        assert_eq!(recent.len(), 1);
        assert!(recent[0].redacted);
        assert!(recent[0].command.is_none());
        assert_eq!(recent[0].fingerprint, fingerprint("mysql --password=hunter2"));
    }

    #[test]
    fn test_idle_sessions_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store
            .append(record("s-old", 100, "ls", "/p", Some(0)))
            .expect("append");
        store
            .append(record("s-new", 5_000, "ls", "/p", Some(0)))
            .expect("append");

        store.close_idle_sessions(1_000);
        // writer processes in order; feedback round-trip flushes the queue
        store
            .record_feedback(&fingerprint("ls"), "/p", true, "s", 1)
            .expect("flush");

        let query = query::StoreQuery::new(dir.path().join("events.db")).expect("query");
        let open_sessions = query.open_session_count().expect("sessions");
        assert_eq!(open_sessions, 1);
    }
}
