//! Session store
//!
//! Durable persistence for sessions, events, and chat messages. Events and
//! messages are append-only. Reads are concurrent; writes serialize on the
//! connection mutex.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session already exists: {0}")]
    SessionExists(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe store handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;

        // Additive columns for rows written by older builds - ignore error
        // if the column already exists
        let _ = conn.execute("ALTER TABLE sessions ADD COLUMN agent TEXT NOT NULL DEFAULT ''", []);
        let _ = conn.execute("ALTER TABLE sessions ADD COLUMN result TEXT", []);

        Ok(())
    }

    // ==================== Session Operations ====================

    /// Insert a new session. Fails if the id already exists.
    pub fn create_session(&self, session: &Session) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let result_json = serde_json::to_string(&session.result).unwrap_or_default();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions
             (id, repo, prompt, agent, mode, status, branch, container_id,
              result, pr_url, pr_number, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                session.id,
                session.repo,
                session.prompt,
                session.agent,
                session.mode.to_string(),
                session.status.to_string(),
                session.branch,
                session.container_id,
                result_json,
                session.pr_url,
                session.pr_number as i64,
                session.error,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            return Err(DbError::SessionExists(session.id.clone()));
        }
        Ok(())
    }

    /// Get a session by id
    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
        ))?;

        stmt.query_row(params![id], parse_session_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// List all sessions, newest first
    pub fn list_sessions(&self) -> DbResult<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt.query_map([], parse_session_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Full replace of mutable fields; refreshes `updated_at`.
    pub fn update_session(&self, session: &Session) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let result_json = serde_json::to_string(&session.result).unwrap_or_default();

        let updated = conn.execute(
            "UPDATE sessions
             SET status = ?1, branch = ?2, container_id = ?3, result = ?4,
                 pr_url = ?5, pr_number = ?6, error = ?7, agent = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                session.status.to_string(),
                session.branch,
                session.container_id,
                result_json,
                session.pr_url,
                session.pr_number as i64,
                session.error,
                session.agent,
                now.to_rfc3339(),
                session.id,
            ],
        )?;

        if updated == 0 {
            return Err(DbError::SessionNotFound(session.id.clone()));
        }
        Ok(())
    }

    /// Look up the session that owns a PR (webhook-triggered revisions)
    pub fn get_session_by_pr(&self, repo: &str, pr_number: u64) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE repo = ?1 AND pr_number = ?2
             ORDER BY created_at DESC LIMIT 1"
        ))?;

        stmt.query_row(params![repo, pr_number as i64], parse_session_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::SessionNotFound(format!("{repo}#{pr_number}"))
                }
                other => DbError::Sqlite(other),
            })
    }

    // ==================== Event Operations ====================

    /// Append an event; the store assigns the id.
    pub fn add_event(
        &self,
        session_id: &str,
        event_type: EventType,
        data: &serde_json::Value,
    ) -> DbResult<SessionEvent> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO events (session_id, event_type, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                event_type.to_string(),
                data.to_string(),
                now.to_rfc3339()
            ],
        )?;

        Ok(SessionEvent {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            event_type,
            data: data.clone(),
            created_at: now,
        })
    }

    /// Events for a session with id greater than `after_id`, ascending.
    pub fn get_events(&self, session_id: &str, after_id: i64) -> DbResult<Vec<SessionEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, event_type, data, created_at
             FROM events WHERE session_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![session_id, after_id], |row| {
            let data_str: String = row.get(3)?;
            Ok(SessionEvent {
                id: row.get(0)?,
                session_id: row.get(1)?,
                event_type: EventType::parse(&row.get::<_, String>(2)?),
                data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
                created_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Message Operations ====================

    pub fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> DbResult<ChatMessage> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.to_string(), content, now.to_rfc3339()],
        )?;

        Ok(ChatMessage {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    pub fn get_messages(&self, session_id: &str) -> DbResult<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ChatMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: MessageRole::parse(&row.get::<_, String>(2)?),
                content: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Number of user messages in a chat session (cap enforcement)
    pub fn count_user_messages(&self, session_id: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'user'",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    /// Shift a session's `updated_at` into the past (reaper tests).
    #[cfg(test)]
    pub fn backdate_session(&self, id: &str, secs: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(secs)).to_rfc3339();
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![past, id],
        )?;
        Ok(())
    }

    // ==================== Startup Hygiene ====================

    /// Mark sessions left in flight by a previous process as failed.
    /// Their containers are orphaned and need manual cleanup.
    pub fn fail_interrupted_sessions(&self) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let n = conn.execute(
            "UPDATE sessions SET status = 'error',
                 error = 'interrupted by server restart', updated_at = ?1
             WHERE status IN ('pending', 'running')",
            params![now.to_rfc3339()],
        )?;
        Ok(n)
    }
}

const SESSION_COLUMNS: &str = "id, repo, prompt, agent, mode, status, branch, container_id, \
                               result, pr_url, pr_number, error, created_at, updated_at";

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let result_json: Option<String> = row.get(8)?;
    let mut result: SessionResult = result_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    let pr_url: String = row.get(9)?;
    let pr_number: u64 = row.get::<_, i64>(10)?.max(0) as u64;

    // Backfill: rows written before the result column existed carry only
    // the legacy PR fields.
    if result.is_none() && !pr_url.is_empty() {
        result = SessionResult::Pr {
            pr_url: pr_url.clone(),
            pr_number,
        };
    }

    Ok(Session {
        id: row.get(0)?,
        repo: row.get(1)?,
        prompt: row.get(2)?,
        agent: row.get(3)?,
        mode: SessionMode::parse(&row.get::<_, String>(4)?),
        status: SessionStatus::parse(&row.get::<_, String>(5)?),
        branch: row.get(6)?,
        container_id: row.get(7)?,
        result,
        pr_url,
        pr_number,
        error: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
        updated_at: parse_datetime(&row.get::<_, String>(13)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
