//! SQLite-backed persistent store.
//!
//! One database file, three tables: `issues`, `blacklist`, `duplicates`.
//! The connection runs in WAL mode and is shared behind a mutex; every
//! compound mutation (create-or-reopen, merge, state transition) takes
//! the lock once and runs inside a single transaction, which gives the
//! total per-issue mutation ordering the lifecycle engine relies on.
//!
//! Embeddings are stored as little-endian `f32` BLOBs. Similarity
//! queries load the candidate rows for one application and rank them by
//! cosine distance in Rust.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use logsink_core::blacklist::{BlacklistPattern, PatternType};
use logsink_core::issue::{DuplicateEdge, Issue, IssueState};
use logsink_core::similarity::{cosine_similarity, decode_vector, encode_vector};
use logsink_core::{Result, SinkError};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schema, executed on every open. `application_id = ''` in `blacklist`
/// encodes the global scope; NULL would defeat the unique key.
const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        application_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT NOT NULL DEFAULT '{}',
        screenshots TEXT NOT NULL DEFAULT '[]',
        state TEXT NOT NULL,
        reopen_count INTEGER NOT NULL DEFAULT 0,
        plan TEXT,
        issue_type TEXT,
        effort TEXT,
        llm_output TEXT,
        llm_message TEXT,
        git_commit TEXT,
        statistics TEXT,
        revert_reason TEXT,
        started_at TEXT,
        completed_at TEXT,
        reopened_at TEXT,
        reverted_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        embedding BLOB,
        embedding_model TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_issues_app_state ON issues(application_id, state);
    CREATE INDEX IF NOT EXISTS idx_issues_app_message ON issues(application_id, message);
    CREATE INDEX IF NOT EXISTS idx_issues_state_created ON issues(state, created_at);

    CREATE TABLE IF NOT EXISTS blacklist (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pattern TEXT NOT NULL,
        pattern_type TEXT NOT NULL,
        application_id TEXT NOT NULL DEFAULT '',
        reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(pattern, application_id)
    );

    CREATE TABLE IF NOT EXISTS duplicates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        original_log_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        duplicate_log_id TEXT NOT NULL,
        similarity_score REAL NOT NULL,
        detected_at TEXT NOT NULL,
        UNIQUE(original_log_id, duplicate_log_id)
    );

    CREATE INDEX IF NOT EXISTS idx_duplicates_original ON duplicates(original_log_id);
";

const ISSUE_COLUMNS: &str = "id, application_id, timestamp, message, context, screenshots, \
     state, reopen_count, plan, issue_type, effort, llm_output, llm_message, git_commit, \
     statistics, revert_reason, started_at, completed_at, reopened_at, reverted_at, \
     created_at, updated_at, embedding, embedding_model";

/// How a merge resolves context collisions and whether it counts as a
/// reopen of the surviving issue.
#[derive(Debug, Clone, Copy)]
pub struct MergeStyle {
    /// Whether the absorbed issue's context wins on key collisions.
    pub source_wins: bool,
    /// Whether the surviving issue's reopen counter is bumped.
    pub bump_reopen: bool,
}

impl MergeStyle {
    /// Embedding-worker merge: a new sighting of an existing issue.
    pub const EMBEDDING: Self = Self {
        source_wins: true,
        bump_reopen: true,
    };
    /// Cleanup reconciliation: two historical records collapse, the
    /// newer one is authoritative.
    pub const CLEANUP: Self = Self {
        source_wins: false,
        bump_reopen: false,
    };
}

/// A neighbor returned by the vector similarity query.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighboring issue.
    pub issue: Issue,
    /// `1 - cosine_distance`, in `[0, 1]`.
    pub similarity: f32,
}

/// Per-state counts for an application.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StateCounts {
    /// Total issues for the application.
    pub total: u32,
    /// Issues awaiting embedding-based deduplication.
    pub pending: u32,
    /// Actionable issues.
    pub open: u32,
    /// Claimed issues.
    pub in_progress: u32,
    /// Resolved issues.
    pub done: u32,
    /// Rejected fixes awaiting rework.
    pub revert: u32,
    /// Closed issues awaiting expiry.
    pub closed: u32,
}

/// The persistent store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> SinkError {
    SinkError::Storage(e.to_string())
}

fn lock_err() -> SinkError {
    SinkError::Storage("store mutex poisoned".to_string())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_timestamp)
}

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let id: String = row.get(0)?;
    let timestamp: String = row.get(2)?;
    let context_raw: String = row.get(4)?;
    let screenshots_raw: String = row.get(5)?;
    let state_raw: String = row.get(6)?;
    let statistics_raw: Option<String> = row.get(14)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;
    let embedding_blob: Option<Vec<u8>> = row.get(22)?;

    let context: Map<String, Value> = serde_json::from_str(&context_raw).unwrap_or_default();
    let screenshots: Vec<String> = serde_json::from_str(&screenshots_raw).unwrap_or_default();
    let issue_type = row
        .get::<_, Option<String>>(9)?
        .and_then(|s| s.parse().ok());
    let effort = row
        .get::<_, Option<String>>(10)?
        .and_then(|s| s.parse().ok());

    Ok(Issue {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        application_id: row.get(1)?,
        timestamp: parse_timestamp(&timestamp),
        message: row.get(3)?,
        context,
        screenshots,
        state: state_raw.parse().unwrap_or(IssueState::Open),
        reopen_count: row.get(7)?,
        plan: row.get(8)?,
        issue_type,
        effort,
        llm_output: row.get(11)?,
        llm_message: row.get(12)?,
        git_commit: row.get(13)?,
        statistics: statistics_raw.and_then(|s| serde_json::from_str(&s).ok()),
        revert_reason: row.get(15)?,
        started_at: opt_timestamp(row.get(16)?),
        completed_at: opt_timestamp(row.get(17)?),
        reopened_at: opt_timestamp(row.get(18)?),
        reverted_at: opt_timestamp(row.get(19)?),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        embedding: embedding_blob.map(|b| decode_vector(&b)),
        embedding_model: row.get(23)?,
    })
}

fn issue_params(issue: &Issue) -> [SqlValue; 24] {
    let opt_text = |value: &Option<String>| match value {
        Some(s) => SqlValue::Text(s.clone()),
        None => SqlValue::Null,
    };
    let opt_ts = |value: &Option<DateTime<Utc>>| match value {
        Some(ts) => SqlValue::Text(ts.to_rfc3339()),
        None => SqlValue::Null,
    };

    [
        SqlValue::Text(issue.id.to_string()),
        SqlValue::Text(issue.application_id.clone()),
        SqlValue::Text(issue.timestamp.to_rfc3339()),
        SqlValue::Text(issue.message.clone()),
        SqlValue::Text(Value::Object(issue.context.clone()).to_string()),
        SqlValue::Text(serde_json::to_string(&issue.screenshots).unwrap_or_else(|_| "[]".into())),
        SqlValue::Text(issue.state.as_str().to_string()),
        SqlValue::Integer(i64::from(issue.reopen_count)),
        opt_text(&issue.plan),
        match issue.issue_type {
            Some(t) => SqlValue::Text(t.as_str().to_string()),
            None => SqlValue::Null,
        },
        match issue.effort {
            Some(e) => SqlValue::Text(e.as_str().to_string()),
            None => SqlValue::Null,
        },
        opt_text(&issue.llm_output),
        opt_text(&issue.llm_message),
        opt_text(&issue.git_commit),
        match &issue.statistics {
            Some(v) => SqlValue::Text(v.to_string()),
            None => SqlValue::Null,
        },
        opt_text(&issue.revert_reason),
        opt_ts(&issue.started_at),
        opt_ts(&issue.completed_at),
        opt_ts(&issue.reopened_at),
        opt_ts(&issue.reverted_at),
        SqlValue::Text(issue.created_at.to_rfc3339()),
        SqlValue::Text(issue.updated_at.to_rfc3339()),
        match &issue.embedding {
            Some(v) => SqlValue::Blob(encode_vector(v)),
            None => SqlValue::Null,
        },
        opt_text(&issue.embedding_model),
    ]
}

fn write_issue(tx: &Transaction<'_>, issue: &Issue) -> Result<()> {
    tx.execute(
        "INSERT INTO issues (id, application_id, timestamp, message, context, screenshots, \
         state, reopen_count, plan, issue_type, effort, llm_output, llm_message, git_commit, \
         statistics, revert_reason, started_at, completed_at, reopened_at, reverted_at, \
         created_at, updated_at, embedding, embedding_model) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24) \
         ON CONFLICT(id) DO UPDATE SET \
         application_id = excluded.application_id, timestamp = excluded.timestamp, \
         message = excluded.message, context = excluded.context, \
         screenshots = excluded.screenshots, state = excluded.state, \
         reopen_count = excluded.reopen_count, plan = excluded.plan, \
         issue_type = excluded.issue_type, effort = excluded.effort, \
         llm_output = excluded.llm_output, llm_message = excluded.llm_message, \
         git_commit = excluded.git_commit, statistics = excluded.statistics, \
         revert_reason = excluded.revert_reason, started_at = excluded.started_at, \
         completed_at = excluded.completed_at, reopened_at = excluded.reopened_at, \
         reverted_at = excluded.reverted_at, updated_at = excluded.updated_at, \
         embedding = excluded.embedding, embedding_model = excluded.embedding_model",
        rusqlite::params_from_iter(issue_params(issue)),
    )
    .map_err(db_err)?;
    Ok(())
}

fn read_issue(tx: &Transaction<'_>, id: Uuid) -> Result<Option<Issue>> {
    tx.query_row(
        &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
        params![id.to_string()],
        row_to_issue,
    )
    .optional()
    .map_err(db_err)
}

fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<BlacklistPattern> {
    let app: String = row.get(3)?;
    let pattern_type: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(BlacklistPattern {
        id: row.get(0)?,
        pattern: row.get(1)?,
        pattern_type: pattern_type.parse().unwrap_or(PatternType::Substring),
        application_id: (!app.is_empty()).then_some(app),
        reason: row.get(4)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

impl Store {
    /// Opens (and migrates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the file cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: &Path, busy_timeout: std::time::Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn, busy_timeout)
    }

    /// Opens an in-memory database. Test-only convenience, but kept in
    /// the normal API so integration tests can build a full daemon
    /// without touching disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, std::time::Duration::from_secs(1))
    }

    fn init(conn: Connection, busy_timeout: std::time::Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| lock_err())?;
        let tx = conn.transaction().map_err(db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------

    /// Inserts a freshly admitted issue.
    pub fn insert_issue(&self, issue: &Issue) -> Result<()> {
        self.with_tx(|tx| write_issue(tx, issue))
    }

    /// Fetches one issue by application and id.
    pub fn get_issue(&self, application_id: &str, id: Uuid) -> Result<Issue> {
        self.with_tx(|tx| {
            read_issue(tx, id)?
                .filter(|issue| issue.application_id == application_id)
                .ok_or_else(|| SinkError::not_found("log"))
        })
    }

    /// Fetches one issue by id alone.
    pub fn get_issue_by_id(&self, id: Uuid) -> Result<Issue> {
        self.with_tx(|tx| read_issue(tx, id)?.ok_or_else(|| SinkError::not_found("log")))
    }

    /// All issues for an application, newest first.
    pub fn list_issues(&self, application_id: &str) -> Result<Vec<Issue>> {
        self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE application_id = ?1 \
                 ORDER BY timestamp DESC, updated_at DESC, id ASC"
            ),
            params![application_id],
        )
    }

    /// Issues in a single state, newest first.
    pub fn list_issues_in_state(
        &self,
        application_id: &str,
        state: IssueState,
    ) -> Result<Vec<Issue>> {
        self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues \
                 WHERE application_id = ?1 AND state = ?2 \
                 ORDER BY timestamp DESC, updated_at DESC, id ASC"
            ),
            params![application_id, state.as_str()],
        )
    }

    /// The worker-consumption view: `revert` issues first, then `open`,
    /// each newest first.
    pub fn list_actionable(&self, application_id: &str) -> Result<Vec<Issue>> {
        self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues \
                 WHERE application_id = ?1 AND state IN ('open', 'revert') \
                 ORDER BY CASE state WHEN 'revert' THEN 0 ELSE 1 END, \
                 timestamp DESC, updated_at DESC, id ASC"
            ),
            params![application_id],
        )
    }

    fn query_issues<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, row_to_issue)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Runs a read-modify-write cycle on one issue inside a single
    /// transaction. The closure sees the current row and may mutate it;
    /// `updated_at` is bumped on write.
    pub fn with_issue<T>(
        &self,
        application_id: &str,
        id: Uuid,
        f: impl FnOnce(&mut Issue) -> Result<T>,
    ) -> Result<(Issue, T)> {
        self.with_tx(|tx| {
            let mut issue = read_issue(tx, id)?
                .filter(|issue| issue.application_id == application_id)
                .ok_or_else(|| SinkError::not_found("log"))?;
            let out = f(&mut issue)?;
            issue.updated_at = Utc::now();
            write_issue(tx, &issue)?;
            Ok((issue, out))
        })
    }

    /// Finds a `done` issue with the same exact-duplicate key. The
    /// store-level key is `(application_id, message)`; the caller-built
    /// `dedup_text` (message plus `context.message`) refines equality.
    pub fn find_done_duplicate(
        &self,
        application_id: &str,
        message: &str,
        dedup_text: &str,
    ) -> Result<Option<Issue>> {
        let candidates = self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues \
                 WHERE application_id = ?1 AND message = ?2 AND state = 'done' \
                 ORDER BY updated_at DESC"
            ),
            params![application_id, message],
        )?;
        Ok(candidates
            .into_iter()
            .find(|issue| issue.dedup_key_text() == dedup_text))
    }

    /// Deletes one issue, returning the deleted row so the caller can
    /// garbage-collect its screenshots. Duplicate edges cascade.
    pub fn remove_issue(&self, application_id: &str, id: Uuid) -> Result<Issue> {
        self.with_tx(|tx| {
            let issue = read_issue(tx, id)?
                .filter(|issue| issue.application_id == application_id)
                .ok_or_else(|| SinkError::not_found("log"))?;
            tx.execute("DELETE FROM issues WHERE id = ?1", params![id.to_string()])
                .map_err(db_err)?;
            Ok(issue)
        })
    }

    /// Deletes every issue for an application, returning the orphaned
    /// screenshot filenames.
    pub fn remove_all_issues(&self, application_id: &str) -> Result<(usize, Vec<String>)> {
        self.remove_matching(application_id, None)
    }

    /// Deletes only `closed` issues for an application.
    pub fn remove_closed_issues(&self, application_id: &str) -> Result<(usize, Vec<String>)> {
        self.remove_matching(application_id, Some(IssueState::Closed))
    }

    fn remove_matching(
        &self,
        application_id: &str,
        state: Option<IssueState>,
    ) -> Result<(usize, Vec<String>)> {
        self.with_tx(|tx| {
            let (sql, filter): (String, Vec<SqlValue>) = match state {
                Some(state) => (
                    "SELECT screenshots FROM issues WHERE application_id = ?1 AND state = ?2"
                        .to_string(),
                    vec![
                        SqlValue::Text(application_id.to_string()),
                        SqlValue::Text(state.as_str().to_string()),
                    ],
                ),
                None => (
                    "SELECT screenshots FROM issues WHERE application_id = ?1".to_string(),
                    vec![SqlValue::Text(application_id.to_string())],
                ),
            };

            let mut stmt = tx.prepare(&sql).map_err(db_err)?;
            let screenshots: Vec<String> = stmt
                .query_map(rusqlite::params_from_iter(filter.clone()), |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?
                .iter()
                .flat_map(|raw| serde_json::from_str::<Vec<String>>(raw).unwrap_or_default())
                .collect();
            drop(stmt);

            let delete_sql = sql.replacen("SELECT screenshots FROM", "DELETE FROM", 1);
            let removed = tx
                .execute(&delete_sql, rusqlite::params_from_iter(filter))
                .map_err(db_err)?;
            Ok((removed, screenshots))
        })
    }

    /// Deletes `closed` issues whose last update is older than `cutoff`,
    /// returning the count and orphaned screenshot filenames.
    pub fn remove_expired_closed(&self, cutoff: DateTime<Utc>) -> Result<(usize, Vec<String>)> {
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT id, screenshots FROM issues \
                     WHERE state = 'closed' AND updated_at < ?1",
                )
                .map_err(db_err)?;
            let expired: Vec<(String, String)> = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            drop(stmt);

            let mut screenshots = Vec::new();
            for (id, shots_raw) in &expired {
                screenshots
                    .extend(serde_json::from_str::<Vec<String>>(shots_raw).unwrap_or_default());
                tx.execute("DELETE FROM issues WHERE id = ?1", params![id])
                    .map_err(db_err)?;
            }
            Ok((expired.len(), screenshots))
        })
    }

    /// Applications present in the store.
    pub fn list_applications(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT application_id FROM issues ORDER BY application_id")
            .map_err(db_err)?;
        let apps = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(apps)
    }

    /// Per-state issue counts for an application.
    pub fn count_by_state(&self, application_id: &str) -> Result<StateCounts> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn
            .prepare(
                "SELECT state, COUNT(*) FROM issues \
                 WHERE application_id = ?1 GROUP BY state",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![application_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            counts.total += count;
            match state.as_str() {
                "pending" => counts.pending = count,
                "open" => counts.open = count,
                "in_progress" => counts.in_progress = count,
                "done" => counts.done = count,
                "revert" => counts.revert = count,
                "closed" => counts.closed = count,
                _ => {},
            }
        }
        Ok(counts)
    }

    /// Every screenshot filename referenced by any live issue. Feeds
    /// the orphan-image sweep; the store is scanned before the
    /// filesystem so a mid-admission file is never treated as orphaned.
    pub fn referenced_screenshots(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn
            .prepare("SELECT screenshots FROM issues")
            .map_err(db_err)?;
        let all = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(all
            .iter()
            .flat_map(|raw| serde_json::from_str::<Vec<String>>(raw).unwrap_or_default())
            .collect())
    }

    // ------------------------------------------------------------------
    // Embedding queue
    // ------------------------------------------------------------------

    /// Claims up to `batch` pending issues without embeddings, oldest
    /// first, skipping ids in `exclude` (the worker's in-flight set).
    pub fn claim_pending(&self, batch: usize, exclude: &HashSet<Uuid>) -> Result<Vec<Issue>> {
        let issues = self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues \
                 WHERE state = 'pending' AND embedding IS NULL \
                 ORDER BY created_at ASC LIMIT ?1"
            ),
            params![(batch + exclude.len()) as i64],
        )?;
        Ok(issues
            .into_iter()
            .filter(|issue| !exclude.contains(&issue.id))
            .take(batch)
            .collect())
    }

    /// Number of issues waiting in the embedding queue.
    pub fn pending_count(&self) -> Result<u32> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Oldest pending issues, for the embedding status surface.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<Issue>> {
        self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE state = 'pending' \
                 ORDER BY created_at ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Top-`k` non-pending issues of the same application with stored
    /// embeddings, ranked by ascending cosine distance to `query`.
    pub fn nearest_neighbors(
        &self,
        application_id: &str,
        query: &[f32],
        k: usize,
        exclude_id: Option<Uuid>,
    ) -> Result<Vec<Neighbor>> {
        let candidates = self.query_issues(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM issues \
                 WHERE application_id = ?1 AND embedding IS NOT NULL AND state != 'pending'"
            ),
            params![application_id],
        )?;

        let mut neighbors: Vec<Neighbor> = candidates
            .into_iter()
            .filter(|issue| Some(issue.id) != exclude_id)
            .filter_map(|issue| {
                let similarity = issue
                    .embedding
                    .as_ref()
                    .map(|embedding| cosine_similarity(query, embedding))?;
                Some(Neighbor { issue, similarity })
            })
            .collect();
        neighbors.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Atomically merges a `source` issue into `target`: the target
    /// absorbs context and screenshots, a duplicate edge is recorded,
    /// and the source row is deleted. Returns the updated target.
    ///
    /// The embedding worker merges with `style::EMBEDDING` (source
    /// context wins on collisions, reopen counter bumped); cleanup
    /// reconciliation merges with `style::CLEANUP` (the surviving,
    /// newer issue keeps its values, no reopen bump).
    pub fn merge_into(
        &self,
        target_id: Uuid,
        source: &Issue,
        similarity_score: f64,
        merge_reason: &str,
        style: MergeStyle,
    ) -> Result<Issue> {
        self.with_tx(|tx| {
            let mut target =
                read_issue(tx, target_id)?.ok_or_else(|| SinkError::not_found("log"))?;

            let mut incoming = source.context.clone();
            incoming.insert(
                "merged_from".to_string(),
                Value::String(source.id.to_string()),
            );
            incoming.insert(
                "merge_reason".to_string(),
                Value::String(merge_reason.to_string()),
            );
            incoming.insert(
                "merge_timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            if style.source_wins {
                logsink_core::context::deep_merge(&mut target.context, incoming);
            } else {
                let mut base = incoming;
                logsink_core::context::deep_merge(&mut base, target.context.clone());
                target.context = base;
            }
            logsink_core::context::append_screenshots(
                &mut target.screenshots,
                source.screenshots.iter().cloned(),
            );
            if style.bump_reopen {
                target.reopen_count += 1;
            }
            target.updated_at = Utc::now();
            write_issue(tx, &target)?;

            tx.execute(
                "INSERT OR IGNORE INTO duplicates \
                 (original_log_id, duplicate_log_id, similarity_score, detected_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    target.id.to_string(),
                    source.id.to_string(),
                    similarity_score,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;

            tx.execute(
                "DELETE FROM issues WHERE id = ?1",
                params![source.id.to_string()],
            )
            .map_err(db_err)?;

            Ok(target)
        })
    }

    /// Duplicate edges owned by one surviving issue, newest first.
    pub fn list_duplicates(&self, original_id: Uuid) -> Result<Vec<DuplicateEdge>> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, original_log_id, duplicate_log_id, similarity_score, detected_at \
                 FROM duplicates WHERE original_log_id = ?1 ORDER BY detected_at DESC",
            )
            .map_err(db_err)?;
        let edges = stmt
            .query_map(params![original_id.to_string()], |row| {
                let original: String = row.get(1)?;
                let duplicate: String = row.get(2)?;
                let detected: String = row.get(4)?;
                Ok(DuplicateEdge {
                    id: row.get(0)?,
                    original_log_id: Uuid::parse_str(&original).unwrap_or_default(),
                    duplicate_log_id: Uuid::parse_str(&duplicate).unwrap_or_default(),
                    similarity_score: row.get(3)?,
                    detected_at: parse_timestamp(&detected),
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(edges)
    }

    // ------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------

    /// All patterns, optionally filtered to one application scope.
    pub fn list_patterns(&self, application_id: Option<&str>) -> Result<Vec<BlacklistPattern>> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let (sql, filter): (&str, Vec<SqlValue>) = match application_id {
            Some(app) => (
                "SELECT id, pattern, pattern_type, application_id, reason, created_at, updated_at \
                 FROM blacklist WHERE application_id = ?1 OR application_id = '' ORDER BY id",
                vec![SqlValue::Text(app.to_string())],
            ),
            None => (
                "SELECT id, pattern, pattern_type, application_id, reason, created_at, updated_at \
                 FROM blacklist ORDER BY id",
                Vec::new(),
            ),
        };
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let patterns = stmt
            .query_map(rusqlite::params_from_iter(filter), row_to_pattern)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(patterns)
    }

    /// Fetches one pattern by id.
    pub fn get_pattern(&self, id: i64) -> Result<BlacklistPattern> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.query_row(
            "SELECT id, pattern, pattern_type, application_id, reason, created_at, updated_at \
             FROM blacklist WHERE id = ?1",
            params![id],
            row_to_pattern,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| SinkError::not_found("pattern"))
    }

    /// Inserts a pattern. A `(pattern, application_id)` collision is a
    /// conflict.
    pub fn insert_pattern(
        &self,
        pattern: &str,
        pattern_type: PatternType,
        application_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<BlacklistPattern> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let now = Utc::now().to_rfc3339();
        let result = conn.execute(
            "INSERT INTO blacklist (pattern, pattern_type, application_id, reason, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                pattern,
                pattern_type.as_str(),
                application_id.unwrap_or(""),
                reason,
                now
            ],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                drop(conn);
                self.get_pattern(id)
            },
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SinkError::Conflict(format!(
                    "pattern already exists: {pattern}"
                )))
            },
            Err(e) => Err(db_err(e)),
        }
    }

    /// Updates a pattern in place.
    pub fn update_pattern(
        &self,
        id: i64,
        pattern: &str,
        pattern_type: PatternType,
        application_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<BlacklistPattern> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let result = conn.execute(
            "UPDATE blacklist SET pattern = ?1, pattern_type = ?2, application_id = ?3, \
             reason = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                pattern,
                pattern_type.as_str(),
                application_id.unwrap_or(""),
                reason,
                Utc::now().to_rfc3339(),
                id
            ],
        );
        match result {
            Ok(0) => Err(SinkError::not_found("pattern")),
            Ok(_) => {
                drop(conn);
                self.get_pattern(id)
            },
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SinkError::Conflict(format!(
                    "pattern already exists: {pattern}"
                )))
            },
            Err(e) => Err(db_err(e)),
        }
    }

    /// Deletes one pattern.
    pub fn delete_pattern(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let removed = conn
            .execute("DELETE FROM blacklist WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if removed == 0 {
            return Err(SinkError::not_found("pattern"));
        }
        Ok(())
    }

    /// Deletes every pattern, returning the count.
    pub fn clear_patterns(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.execute("DELETE FROM blacklist", []).map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::make_issue;

    use super::*;

    #[test]
    fn test_issue_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut issue = make_issue("app", "boom", IssueState::Open);
        issue
            .context
            .insert("env".into(), serde_json::json!({"os": "linux"}));
        issue.screenshots.push("app-img-x-1.png".into());
        store.insert_issue(&issue).unwrap();

        let loaded = store.get_issue("app", issue.id).unwrap();
        assert_eq!(loaded.message, "boom");
        assert_eq!(loaded.state, IssueState::Open);
        assert_eq!(loaded.context["env"]["os"], serde_json::json!("linux"));
        assert_eq!(loaded.screenshots, vec!["app-img-x-1.png".to_string()]);
    }

    #[test]
    fn test_get_issue_scopes_by_application() {
        let store = Store::open_in_memory().unwrap();
        let issue = make_issue("app-a", "boom", IssueState::Open);
        store.insert_issue(&issue).unwrap();
        assert!(store.get_issue("app-b", issue.id).is_err());
    }

    #[test]
    fn test_actionable_orders_revert_first() {
        let store = Store::open_in_memory().unwrap();
        let open = make_issue("app", "open issue", IssueState::Open);
        let revert = make_issue("app", "reverted issue", IssueState::Revert);
        store.insert_issue(&open).unwrap();
        store.insert_issue(&revert).unwrap();

        let listed = store.list_actionable("app").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].state, IssueState::Revert);
        assert_eq!(listed[1].state, IssueState::Open);
    }

    #[test]
    fn test_find_done_duplicate_matches_key() {
        let store = Store::open_in_memory().unwrap();
        let done = make_issue("app", "boom", IssueState::Done);
        store.insert_issue(&done).unwrap();

        let found = store.find_done_duplicate("app", "boom", "boom").unwrap();
        assert_eq!(found.map(|i| i.id), Some(done.id));

        assert!(store
            .find_done_duplicate("app", "other", "other")
            .unwrap()
            .is_none());
        assert!(store
            .find_done_duplicate("other-app", "boom", "boom")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_merge_into_moves_context_and_deletes_source() {
        let store = Store::open_in_memory().unwrap();
        let target = make_issue("app", "timeout connecting to db", IssueState::Open);
        let mut source = make_issue("app", "db timeout", IssueState::Pending);
        source
            .context
            .insert("host".into(), Value::String("db-1".into()));
        source.screenshots.push("app-img-s-1.png".into());
        store.insert_issue(&target).unwrap();
        store.insert_issue(&source).unwrap();

        let merged = store
            .merge_into(
                target.id,
                &source,
                0.95,
                "embedding similarity",
                MergeStyle::EMBEDDING,
            )
            .unwrap();
        assert_eq!(merged.reopen_count, 1);
        assert_eq!(merged.context["host"], Value::String("db-1".into()));
        assert_eq!(
            merged.context["merged_from"],
            Value::String(source.id.to_string())
        );
        assert_eq!(merged.screenshots, vec!["app-img-s-1.png".to_string()]);

        assert!(store.get_issue("app", source.id).is_err());
        let edges = store.list_duplicates(target.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].duplicate_log_id, source.id);
    }

    #[test]
    fn test_nearest_neighbors_ranks_by_similarity() {
        let store = Store::open_in_memory().unwrap();
        let mut near = make_issue("app", "near", IssueState::Open);
        near.embedding = Some(vec![1.0, 0.0, 0.0]);
        near.embedding_model = Some("test".into());
        let mut far = make_issue("app", "far", IssueState::Open);
        far.embedding = Some(vec![0.0, 1.0, 0.0]);
        far.embedding_model = Some("test".into());
        let mut pending = make_issue("app", "pending", IssueState::Pending);
        pending.embedding = Some(vec![1.0, 0.0, 0.0]);
        store.insert_issue(&near).unwrap();
        store.insert_issue(&far).unwrap();
        store.insert_issue(&pending).unwrap();

        let neighbors = store
            .nearest_neighbors("app", &[1.0, 0.0, 0.0], 5, None)
            .unwrap();
        // Pending rows are excluded even with embeddings present.
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].issue.id, near.id);
        assert!(neighbors[0].similarity > 0.99);
        assert!(neighbors[1].similarity < 0.01);
    }

    #[test]
    fn test_claim_pending_skips_in_flight() {
        let store = Store::open_in_memory().unwrap();
        let a = make_issue("app", "a", IssueState::Pending);
        let b = make_issue("app", "b", IssueState::Pending);
        store.insert_issue(&a).unwrap();
        store.insert_issue(&b).unwrap();

        let mut in_flight = HashSet::new();
        in_flight.insert(a.id);
        let claimed = store.claim_pending(10, &in_flight).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, b.id);
    }

    #[test]
    fn test_duplicate_pattern_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_pattern("spam", PatternType::Substring, None, None)
            .unwrap();
        let err = store
            .insert_pattern("spam", PatternType::Substring, None, None)
            .unwrap_err();
        assert!(matches!(err, SinkError::Conflict(_)));

        // Same pattern under a different scope is fine.
        assert!(store
            .insert_pattern("spam", PatternType::Substring, Some("app"), None)
            .is_ok());
    }

    #[test]
    fn test_remove_expired_closed_returns_screenshots() {
        let store = Store::open_in_memory().unwrap();
        let mut closed = make_issue("app", "old", IssueState::Closed);
        closed.screenshots.push("app-img-old-1.png".into());
        closed.updated_at = Utc::now() - chrono::Duration::days(60);
        store.insert_issue(&closed).unwrap();
        let fresh = make_issue("app", "fresh", IssueState::Closed);
        store.insert_issue(&fresh).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let (removed, screenshots) = store.remove_expired_closed(cutoff).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(screenshots, vec!["app-img-old-1.png".to_string()]);
        assert!(store.get_issue("app", fresh.id).is_ok());
    }

    #[test]
    fn test_state_counts() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_issue(&make_issue("app", "1", IssueState::Open))
            .unwrap();
        store
            .insert_issue(&make_issue("app", "2", IssueState::Open))
            .unwrap();
        store
            .insert_issue(&make_issue("app", "3", IssueState::Done))
            .unwrap();

        let counts = store.count_by_state("app").unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.open, 2);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.pending, 0);
    }
}
