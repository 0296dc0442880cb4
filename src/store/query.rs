//! Read-only query interface for the event log
//!
//! Uses a small r2d2 connection pool so request handlers can read
//! concurrently while the writer thread commits. WAL mode makes this safe.
//!
//! All queries that feed index rebuilds take a snapshot id (the max event
//! id at snapshot time) and scope themselves to `id <= snapshot`, giving a
//! stable view without holding a read transaction open.

use crate::events::{CommandEvent, PatternStats};
use crate::tokenizer::tokenize;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

/// Query interface over the event database.
pub struct StoreQuery {
    pool: Pool<SqliteConnectionManager>,
}

impl StoreQuery {
    /// Create a new query interface with a read connection pool.
    pub fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4) // read-only pool for concurrent queries
            .build(manager)?;

        // Verify connection works
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;

        Ok(Self { pool })
    }

    fn conn(&self) -> anyhow::Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Fetch one event by id.
    pub fn by_id(&self, id: i64) -> anyhow::Result<Option<CommandEvent>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<CommandEvent>> {
        self.recent_filtered(limit, None, None)
    }

    /// Most recent events, newest first, optionally scoped to a session
    /// and/or a working directory.
    pub fn recent_filtered(
        &self,
        limit: usize,
        session_id: Option<&str>,
        cwd: Option<&str>,
    ) -> anyhow::Result<Vec<CommandEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE (?1 IS NULL OR session_id = ?1)
              AND (?2 IS NULL OR cwd = ?2)
            ORDER BY id DESC LIMIT ?3
            "#,
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id, cwd, limit as i64], row_to_event)?;
        collect_events(rows)
    }

    /// Full-text search over stored commands. The query text runs through
    /// the same tokenizer as indexing, so matching is normalization-stable.
    pub fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<CommandEvent>> {
        let stream = tokenize(query);
        let mut match_expr = String::new();
        for token in stream.texts() {
            if token.is_empty() {
                continue;
            }
            if !match_expr.is_empty() {
                match_expr.push(' ');
            }
            // quote each term; FTS5 doubles embedded quotes
            match_expr.push('"');
            match_expr.push_str(&token.replace('"', "\"\""));
            match_expr.push('"');
        }
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM events_fts f
            JOIN events e ON e.id = f.rowid
            WHERE events_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
            EVENT_COLUMNS_E
        ))?;
        let rows = stmt.query_map(params![match_expr, limit as i64], row_to_event)?;
        collect_events(rows)
    }

    /// Prefix lookup for the exact tier: case-sensitive byte-wise prefix
    /// match, one candidate per fingerprint (the newest), ranked by cwd
    /// affinity then recency. An empty prefix matches everything.
    pub fn prefix_candidates(
        &self,
        prefix: &str,
        cwd: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CommandEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM events e
            JOIN (
                SELECT fingerprint, MAX(id) AS mid
                FROM events
                WHERE redacted = 0 AND substr(command, 1, length(?1)) = ?1
                GROUP BY fingerprint
            ) m ON e.id = m.mid
            ORDER BY
                CASE
                    WHEN e.cwd = ?2 THEN 0
                    WHEN substr(?2, 1, length(e.cwd) + 1) = e.cwd || '/' THEN 1
                    WHEN substr(e.cwd, 1, length(?2) + 1) = ?2 || '/' THEN 1
                    ELSE 2
                END,
                e.ts_ns DESC,
                e.id DESC
            LIMIT ?3
            "#,
            EVENT_COLUMNS_E
        ))?;
        let rows = stmt.query_map(params![prefix, cwd, limit as i64], row_to_event)?;
        collect_events(rows)
    }

    /// Aggregated statistics for a fingerprint; scoped to one cwd when
    /// given, summed across directories otherwise.
    pub fn stats(&self, fingerprint: &str, cwd: Option<&str>) -> anyhow::Result<PatternStats> {
        let conn = self.conn()?;
        let row = match cwd {
            Some(cwd) => conn
                .query_row(
                    r#"
                    SELECT exec_count, success_count, last_ts_ns, accept_count, reject_count, emit_count
                    FROM pattern_stats WHERE fingerprint = ?1 AND cwd = ?2
                    "#,
                    params![fingerprint, cwd],
                    stats_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    r#"
                    SELECT COALESCE(SUM(exec_count), 0), COALESCE(SUM(success_count), 0),
                           COALESCE(MAX(last_ts_ns), 0), COALESCE(SUM(accept_count), 0),
                           COALESCE(SUM(reject_count), 0), COALESCE(SUM(emit_count), 0)
                    FROM pattern_stats WHERE fingerprint = ?1
                    "#,
                    params![fingerprint],
                    stats_row,
                )
                .optional()?,
        };

        let (exec_count, success_count, last_ts_ns, accept_count, reject_count, emit_count) =
            row.unwrap_or((0, 0, 0, 0, 0, 0));
        Ok(PatternStats {
            fingerprint: fingerprint.to_string(),
            exec_count: exec_count as u64,
            success_count: success_count as u64,
            last_ts_ns,
            accept_count: accept_count as u64,
            reject_count: reject_count as u64,
            emit_count: emit_count as u64,
        })
    }

    /// Largest per-fingerprint execution count seen anywhere, normalizing
    /// the frequency ranking factor.
    pub fn max_exec_count(&self) -> anyhow::Result<u64> {
        let conn = self.conn()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(total), 0) FROM (SELECT SUM(exec_count) AS total FROM pattern_stats GROUP BY fingerprint)",
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    /// Successor fingerprints for a sequence key, most frequent first,
    /// with their counts.
    pub fn successors(&self, prefix_key: &str, limit: usize) -> anyhow::Result<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT next_fingerprint, count FROM sequences WHERE prefix = ?1 ORDER BY count DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![prefix_key, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Total observations in a sequence bucket.
    pub fn sequence_bucket_total(&self, prefix_key: &str) -> anyhow::Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM sequences WHERE prefix = ?1",
            params![prefix_key],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// The canonical example of a fingerprint: its most recent successful,
    /// non-redacted occurrence.
    pub fn canonical_event(&self, fingerprint: &str) -> anyhow::Result<Option<CommandEvent>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {}
                    FROM events e
                    WHERE e.fingerprint = ?1 AND e.redacted = 0
                      AND (e.exit_code = 0 OR e.exit_code IS NULL)
                    ORDER BY e.id DESC LIMIT 1
                    "#,
                    EVENT_COLUMNS_E
                ),
                params![fingerprint],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Snapshot token: the latest committed event id. Queries scoped to
    /// `id <= snapshot` see a stable set.
    pub fn latest_event_id(&self) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
            row.get(0)
        })?;
        Ok(id)
    }

    /// One representative event per fingerprint for index rebuilds: the
    /// most recent successful occurrence at or below the snapshot id.
    pub fn rebuild_representatives(&self, snapshot: i64) -> anyhow::Result<Vec<CommandEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM events e
            JOIN (
                SELECT fingerprint, MAX(id) AS mid
                FROM events
                WHERE redacted = 0 AND id <= ?1
                  AND (exit_code = 0 OR exit_code IS NULL)
                GROUP BY fingerprint
            ) m ON e.id = m.mid
            "#,
            EVENT_COLUMNS_E
        ))?;
        let rows = stmt.query_map(params![snapshot], row_to_event)?;
        collect_events(rows)
    }

    /// Recent non-redacted commands for corpus bootstrap, oldest first.
    pub fn recent_commands(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT command FROM events WHERE redacted = 0 AND command IS NOT NULL ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut newest_first = Vec::new();
        for row in rows {
            newest_first.push(row?);
        }
        newest_first.reverse();
        Ok(newest_first)
    }

    /// Successful, non-redacted commands logged after the given event id,
    /// oldest first. Feeds incremental retraining.
    pub fn successful_commands_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT command FROM events
            WHERE id > ?1 AND redacted = 0 AND command IS NOT NULL
              AND (exit_code = 0 OR exit_code IS NULL)
            ORDER BY id LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Sessions that have not been closed yet.
    pub fn open_session_count(&self) -> anyhow::Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE end_ts_ns IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

const EVENT_COLUMNS: &str =
    "id, session_id, ts_ns, command, cwd, exit_code, duration_ns, redacted, fingerprint";
const EVENT_COLUMNS_E: &str =
    "e.id, e.session_id, e.ts_ns, e.command, e.cwd, e.exit_code, e.duration_ns, e.redacted, e.fingerprint";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<CommandEvent> {
    Ok(CommandEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        ts_ns: row.get(2)?,
        command: row.get(3)?,
        cwd: row.get(4)?,
        exit_code: row.get(5)?,
        duration_ns: row.get::<_, Option<i64>>(6)?.map(|d| d as u64),
        redacted: row.get::<_, i64>(7)? != 0,
        fingerprint: row.get(8)?,
    })
}

fn stats_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, i64, i64, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn collect_events<I: Iterator<Item = rusqlite::Result<CommandEvent>>>(
    rows: I,
) -> anyhow::Result<Vec<CommandEvent>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ShellKind;
    use crate::fingerprint::fingerprint;
    use crate::store::{EventRecord, EventStore, StoreConfig};

    fn seed(dir: &tempfile::TempDir, commands: &[(&str, &str, i64)]) -> StoreQuery {
        let store = EventStore::open(StoreConfig {
            db_path: dir.path().join("events.db"),
            channel_buffer: 64,
        })
        .expect("open store");
        for (command, cwd, ts) in commands {
            let stream = tokenize(command);
            store
                .append(EventRecord {
                    session_id: "s1".to_string(),
                    ts_ns: *ts,
                    command: Some(command.to_string()),
                    tokens_text: Some(stream.embedding_text()),
                    cwd: cwd.to_string(),
                    exit_code: Some(0),
                    duration_ns: None,
                    redacted: false,
                    fingerprint: fingerprint(command),
                    shell_kind: ShellKind::Bash,
                })
                .expect("append");
        }
        drop(store);
        StoreQuery::new(dir.path().join("events.db")).expect("query")
    }

    #[test]
    fn test_prefix_match_is_case_sensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("Git status", "/p", 1), ("git status", "/p", 2)]);

        let hits = query.prefix_candidates("git s", "/p", 32).expect("prefix");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].command.as_deref(), Some("git status"));
    }

    #[test]
    fn test_prefix_ranks_cwd_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(
            &dir,
            &[
                ("make build", "/elsewhere", 100),
                ("make test", "/p", 1),
            ],
        );

        let hits = query.prefix_candidates("make", "/p", 32).expect("prefix");
        assert_eq!(hits.len(), 2);
        // cwd match outranks recency
        assert_eq!(hits[0].command.as_deref(), Some("make test"));
    }

    #[test]
    fn test_prefix_ancestor_ranks_between() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(
            &dir,
            &[
                ("cargo build", "/p/sub", 1),
                ("cargo check", "/unrelated", 2),
            ],
        );

        let hits = query.prefix_candidates("cargo", "/p", 32).expect("prefix");
        assert_eq!(hits[0].command.as_deref(), Some("cargo build"));
    }

    #[test]
    fn test_prefix_dedups_by_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(
            &dir,
            &[("git status", "/p", 1), ("git status", "/p", 2), ("git stash", "/p", 3)],
        );

        let hits = query.prefix_candidates("git st", "/p", 32).expect("prefix");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("ls", "/p", 1), ("pwd", "/p", 2)]);
        let hits = query.prefix_candidates("", "/p", 32).expect("prefix");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_search_normalizes_through_tokenizer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("cd src/engine", "/p", 1)]);

        // path separator splits into words for both index and query
        let hits = query.search("engine", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].command.as_deref(), Some("cd src/engine"));
    }

    #[test]
    fn test_canonical_event_prefers_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EventStore::open(StoreConfig {
            db_path: dir.path().join("events.db"),
            channel_buffer: 64,
        })
        .expect("open store");
        let stream = tokenize("cargo test");
        let mut rec = EventRecord {
            session_id: "s1".to_string(),
            ts_ns: 1,
            command: Some("cargo test".to_string()),
            tokens_text: Some(stream.embedding_text()),
            cwd: "/p".to_string(),
            exit_code: Some(0),
            duration_ns: None,
            redacted: false,
            fingerprint: fingerprint("cargo test"),
            shell_kind: ShellKind::Bash,
        };
        let success_id = store.append(rec.clone()).expect("append");
        rec.ts_ns = 2;
        rec.exit_code = Some(101);
        store.append(rec).expect("append");
        drop(store);

        let query = StoreQuery::new(dir.path().join("events.db")).expect("query");
        let canonical = query
            .canonical_event(&fingerprint("cargo test"))
            .expect("canonical")
            .expect("present");
        assert_eq!(canonical.id, success_id);
    }

    #[test]
    fn test_snapshot_scopes_rebuild(){
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("ls", "/p", 1), ("pwd", "/p", 2)]);
        let snapshot = query.latest_event_id().expect("snapshot");
        assert_eq!(snapshot, 2);

        let reps = query.rebuild_representatives(1).expect("reps");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].command.as_deref(), Some("ls"));
    }

    #[test]
    fn test_recent_filtered_by_cwd() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("ls", "/a", 1), ("pwd", "/b", 2), ("cat x", "/a", 3)]);
        let hits = query
            .recent_filtered(10, None, Some("/a"))
            .expect("filtered");
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.cwd == "/a"));
        // newest first
        assert_eq!(hits[0].command.as_deref(), Some("cat x"));
    }

    #[test]
    fn test_recent_commands_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = seed(&dir, &[("first", "/p", 1), ("second", "/p", 2)]);
        let lines = query.recent_commands(10).expect("lines");
        assert_eq!(lines, vec!["first", "second"]);
    }
}
