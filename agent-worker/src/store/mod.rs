//! Embedded relational store for sessions and tasks, with forward-only
//! schema migrations tracked in a `_meta` table.

mod migrations;

pub use migrations::CURRENT_SCHEMA_VERSION;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "cancelled" => SessionStatus::Cancelled,
            _ => SessionStatus::Active,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_root: String,
    pub model: String,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub metadata: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Single-process, transactional relational store. Writers are serialized by
/// the `Mutex`; WAL mode lets concurrent readers proceed regardless.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        migrations::run(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn create_session(
        &self,
        project_root: String,
        model: String,
        metadata: Option<String>,
    ) -> Result<Session, StoreError> {
        let conn = self.conn.clone();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_ms();
            conn.execute(
                "INSERT INTO sessions (id, project_root, model, status, created_at, updated_at, completed_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL, ?6)",
                rusqlite::params![id, project_root, model, SessionStatus::Active.as_str(), now, metadata],
            )?;
            Ok(Session {
                id,
                project_root,
                model,
                status: SessionStatus::Active,
                created_at_ms: now,
                updated_at_ms: now,
                completed_at_ms: None,
                metadata,
            })
        })
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, project_root, model, status, created_at, updated_at, completed_at, metadata
                 FROM sessions WHERE id = ?1",
                rusqlite::params![id],
                row_to_session,
            )
            .map_err(|e| map_not_found(e, &id))
        })
    }

    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            let now = now_ms();
            let completed_at = matches!(status, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled)
                .then_some(now);
            conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2, completed_at = COALESCE(?3, completed_at) WHERE id = ?4",
                rusqlite::params![status.as_str(), now, completed_at, id],
            )?;
            Ok(())
        })
    }

    /// Deletes a session and, via `ON DELETE CASCADE`, all its tasks.
    pub async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
    }

    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            let base = "SELECT id, project_root, model, status, created_at, updated_at, completed_at, metadata FROM sessions";
            let (sql, status_str) = match status {
                Some(s) => (format!("{base} WHERE status = ?1 ORDER BY created_at DESC"), Some(s.as_str())),
                None => (format!("{base} ORDER BY created_at DESC"), None),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = match status_str {
                Some(s) => stmt.query_map(rusqlite::params![s], row_to_session)?.collect::<Result<Vec<_>, _>>()?,
                None => stmt.query_map([], row_to_session)?.collect::<Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
    }

    pub async fn create_task(&self, session_id: String, task_type: String, description: String) -> Result<Task, StoreError> {
        let conn = self.conn.clone();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tasks (id, session_id, task_type, description, status, result, error, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL)",
                rusqlite::params![id, session_id, task_type, description, TaskStatus::Pending.as_str()],
            )?;
            Ok(Task {
                id,
                session_id,
                task_type,
                description,
                status: TaskStatus::Pending,
                result: None,
                error: None,
                started_at_ms: None,
                completed_at_ms: None,
            })
        })
    }

    pub async fn mark_task_running(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                rusqlite::params![TaskStatus::Running.as_str(), now_ms(), id],
            )?;
            Ok(())
        })
    }

    pub async fn complete_task(&self, id: &str, result: Option<String>, error: Option<String>, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, error = ?3, completed_at = ?4 WHERE id = ?5",
                rusqlite::params![status.as_str(), result, error, now_ms(), id],
            )?;
            Ok(())
        })
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, session_id, task_type, description, status, result, error, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                rusqlite::params![id],
                row_to_task,
            )
            .map_err(|e| map_not_found(e, &id))
        })
    }

    pub async fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, session_id, task_type, description, status, result, error, started_at, completed_at
                 FROM tasks WHERE session_id = ?1 ORDER BY started_at ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id], row_to_task)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn map_not_found(e: rusqlite::Error, id: &str) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.to_string()),
        other => StoreError::Sqlite(other.to_string()),
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        project_root: row.get(1)?,
        model: row.get(2)?,
        status: SessionStatus::parse(&status),
        created_at_ms: row.get(4)?,
        updated_at_ms: row.get(5)?,
        completed_at_ms: row.get(6)?,
        metadata: row.get(7)?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        task_type: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::parse(&status),
        result: row.get(5)?,
        error: row.get(6)?,
        started_at_ms: row.get(7)?,
        completed_at_ms: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn create_and_fetch_session_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("/proj".into(), "gpt".into(), None).await.unwrap();
        let fetched = store.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.status, SessionStatus::Active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_session_cascades_to_tasks() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("/proj".into(), "gpt".into(), None).await.unwrap();
        store.create_task(session.id.clone(), "execute".into(), "do thing".into()).await.unwrap();
        store.delete_session(&session.id).await.unwrap();
        let remaining = store.list_tasks_for_session(&session.id).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_lifecycle_transitions_persist() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("/proj".into(), "gpt".into(), None).await.unwrap();
        let task = store.create_task(session.id.clone(), "execute".into(), "do thing".into()).await.unwrap();
        store.mark_task_running(&task.id).await.unwrap();
        let running = store.get_task(&task.id).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at_ms.is_some());

        store.complete_task(&task.id, Some("done".into()), None, TaskStatus::Completed).await.unwrap();
        let completed = store.get_task(&task.id).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result.as_deref(), Some("done"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_missing_session_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_session("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
