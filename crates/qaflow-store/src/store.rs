use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use qaflow_core::error::{QaflowError, Result};
use qaflow_core::traits::SessionStore;
use qaflow_core::types::{Session, SessionId, SessionSummary};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        status TEXT NOT NULL,
        revision INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        snapshot TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);";

fn db_err(e: impl std::fmt::Display) -> QaflowError {
    QaflowError::Persistence(e.to_string())
}

/// SQLite-backed session store. One row per session id holding the full
/// JSON snapshot.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                QaflowError::Persistence(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL keeps readers off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Session store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored revision for a session, if any.
    pub fn revision(&self, id: &SessionId) -> Result<Option<u64>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let rev: Option<i64> = conn
            .query_row(
                "SELECT revision FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(rev.map(|r| r as u64))
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, session: &Session) -> BoxFuture<'_, Result<()>> {
        // Serialize up front so the future does not borrow the session
        let row = serde_json::to_string(session).map(|snapshot| {
            (
                session.id.0.clone(),
                session.label.clone(),
                session.status.to_string(),
                session.revision as i64,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                snapshot,
            )
        });

        Box::pin(async move {
            let (id, label, status, revision, created_at, updated_at, snapshot) = row?;
            let conn = self.conn.lock().map_err(db_err)?;

            let changed = conn
                .execute(
                    "INSERT INTO sessions
                        (id, label, status, revision, created_at, updated_at, snapshot)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        label = excluded.label,
                        status = excluded.status,
                        revision = excluded.revision,
                        updated_at = excluded.updated_at,
                        snapshot = excluded.snapshot
                     WHERE excluded.revision >= sessions.revision",
                    params![id, label, status, revision, created_at, updated_at, snapshot],
                )
                .map_err(db_err)?;

            if changed == 0 {
                debug!(session_id = %id, revision, "Ignored stale snapshot");
            }
            Ok(())
        })
    }

    fn load(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<Session>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let snapshot: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match snapshot {
                Some(json) => {
                    let session: Session = serde_json::from_str(&json).map_err(|e| {
                        QaflowError::Persistence(format!("corrupt snapshot for {}: {}", id, e))
                    })?;
                    Ok(Some(session))
                }
                None => Ok(None),
            }
        })
    }

    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionSummary>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, snapshot FROM sessions
                     ORDER BY updated_at DESC
                     LIMIT ?1",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let id: String = row.get(0)?;
                    let snapshot: String = row.get(1)?;
                    Ok((id, snapshot))
                })
                .map_err(db_err)?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, snapshot) = row.map_err(db_err)?;
                match serde_json::from_str::<Session>(&snapshot) {
                    Ok(session) => summaries.push(session.summary(false)),
                    Err(e) => debug!(session_id = %id, error = %e, "Skipping unreadable snapshot"),
                }
            }
            Ok(summaries)
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok(n as usize)
        })
    }
}
