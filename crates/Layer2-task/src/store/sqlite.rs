//! SQLite Store
//!
//! 레코드는 JSON 본문으로 저장하고, 조회에 필요한 키만 컬럼으로 둡니다.
//! - sessions / tasks / approvals / logs
//!
//! ## Migration System
//!
//! - Version 1: Initial schema

use super::Store;
use crate::approval::Approval;
use crate::log::LogEntry;
use crate::task::Task;
use chrono::{DateTime, SecondsFormat, Utc};
use pilot_foundation::{ApprovalId, Error, Result, Session, SessionId, TaskId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Database file name inside the data directory
pub const DB_FILE: &str = "pilot.db";

/// Store backed by a single SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) `<data_dir>/pilot.db`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        info!("Opened store at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Get current schema version from database
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_session
                ON tasks(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_approvals_session
                ON approvals(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_logs_session
                ON logs(session_id, created_at);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))?;

        if version < CURRENT_SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )?;
            debug!("Applied schema version {}", CURRENT_SCHEMA_VERSION);
        }
        Ok(())
    }

    // ========================================================================
    // Generic row helpers
    // ========================================================================

    fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table);
        Ok(conn
            .query_row(&sql, params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn load<T: DeserializeOwned>(
        &self,
        table: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<T> {
        let conn = self.lock()?;
        let sql = format!("SELECT body FROM {} WHERE id = ?1", table);
        let body: Option<String> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(Error::not_found(kind, id)),
        }
    }

    fn load_all<T: DeserializeOwned>(
        &self,
        table: &str,
        session_id: Option<SessionId>,
    ) -> Result<Vec<T>> {
        let conn = self.lock()?;
        let bodies: Vec<String> = match session_id {
            Some(session_id) => {
                let sql = format!(
                    "SELECT body FROM {} WHERE session_id = ?1 ORDER BY created_at, rowid",
                    table
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![session_id.to_string()], |row| row.get(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            }
            None => {
                let sql = format!("SELECT body FROM {} ORDER BY created_at, rowid", table);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            }
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn remove(&self, table: &str, kind: &'static str, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", table);
        match conn.execute(&sql, params![id])? {
            0 => Err(Error::not_found(kind, id)),
            _ => Ok(()),
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn body<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

impl Store for SqliteStore {
    fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        let id = session.id.to_string();
        if Self::exists(&conn, "sessions", &id)? {
            return Err(Error::Conflict(format!("session {} already exists", id)));
        }
        conn.execute(
            "INSERT INTO sessions (id, body, created_at) VALUES (?1, ?2, ?3)",
            params![id, body(session)?, timestamp(&session.created_at)],
        )?;
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> Result<Session> {
        self.load("sessions", "session", &id.to_string())
    }

    fn update_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sessions SET body = ?2 WHERE id = ?1",
            params![session.id.to_string(), body(session)?],
        )?;
        if changed == 0 {
            return Err(Error::not_found("session", session.id));
        }
        Ok(())
    }

    fn delete_session(&self, id: SessionId) -> Result<()> {
        self.remove("sessions", "session", &id.to_string())
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        self.load_all("sessions", None)
    }

    fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock()?;
        let id = task.id.to_string();
        if Self::exists(&conn, "tasks", &id)? {
            return Err(Error::Conflict(format!("task {} already exists", id)));
        }
        conn.execute(
            "INSERT INTO tasks (id, session_id, status, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                task.session_id.to_string(),
                task.status.as_str(),
                body(task)?,
                timestamp(&task.created_at)
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Task> {
        self.load("tasks", "task", &id.to_string())
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, body = ?3 WHERE id = ?1",
            params![task.id.to_string(), task.status.as_str(), body(task)?],
        )?;
        if changed == 0 {
            return Err(Error::not_found("task", task.id));
        }
        Ok(())
    }

    fn delete_task(&self, id: TaskId) -> Result<()> {
        self.remove("tasks", "task", &id.to_string())
    }

    fn list_tasks(&self, session_id: SessionId) -> Result<Vec<Task>> {
        self.load_all("tasks", Some(session_id))
    }

    fn create_approval(&self, approval: &Approval) -> Result<()> {
        let conn = self.lock()?;
        let id = approval.id.to_string();
        if Self::exists(&conn, "approvals", &id)? {
            return Err(Error::Conflict(format!("approval {} already exists", id)));
        }
        conn.execute(
            "INSERT INTO approvals (id, session_id, status, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                approval.session_id.to_string(),
                approval.status.as_str(),
                body(approval)?,
                timestamp(&approval.created_at)
            ],
        )?;
        Ok(())
    }

    fn get_approval(&self, id: ApprovalId) -> Result<Approval> {
        self.load("approvals", "approval", &id.to_string())
    }

    fn update_approval(&self, approval: &Approval) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE approvals SET status = ?2, body = ?3 WHERE id = ?1",
            params![
                approval.id.to_string(),
                approval.status.as_str(),
                body(approval)?
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("approval", approval.id));
        }
        Ok(())
    }

    fn delete_approval(&self, id: ApprovalId) -> Result<()> {
        self.remove("approvals", "approval", &id.to_string())
    }

    fn list_approvals(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        self.load_all("approvals", Some(session_id))
    }

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO logs (id, session_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id.to_string(),
                entry.session_id.to_string(),
                body(entry)?,
                timestamp(&entry.timestamp)
            ],
        )?;
        Ok(())
    }

    fn list_logs(&self, session_id: SessionId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let mut entries: Vec<LogEntry> = self.load_all("logs", Some(session_id))?;
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    fn delete_logs(&self, session_id: SessionId) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM logs WHERE session_id = ?1",
            params![session_id.to_string()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionStep;
    use crate::store::conformance;
    use tempfile::tempdir;

    #[test]
    fn test_sessions() {
        conformance::sessions(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_tasks() {
        conformance::tasks(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_approvals() {
        conformance::approvals(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_logs() {
        conformance::logs(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let session = Session::new("persisted", dir.path());
        let task = Task::new(session.id, "t", vec![ActionStep::check_tool("git")]).unwrap();

        {
            let store = SqliteStore::new(dir.path()).unwrap();
            store.create_session(&session).unwrap();
            store.create_task(&task).unwrap();
        }

        let store = SqliteStore::new(dir.path()).unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(store.get_session(session.id).unwrap().name, "persisted");
        assert_eq!(store.get_task(task.id).unwrap(), task);
    }
}
