use super::store::{FsmError, TaskStore};
use super::types::{TaskState, TaskStatus};
use crate::queue::sqlite::{fmt_ts, parse_rfc3339, sql_conversion_error};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::{FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

impl rusqlite::types::FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

/// Task table living next to the queue tables in the same database file.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create task store directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open task DB: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory task DB")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS tasks (
                task_id         TEXT PRIMARY KEY,
                status          TEXT NOT NULL,
                assigned_agent  TEXT NOT NULL,
                linked_queue_id TEXT NOT NULL,
                history         TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(linked_queue_id);",
        )
        .context("Failed to initialize task schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn get(&self, task_id: &str) -> Result<Option<TaskState>, FsmError> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT task_id, status, assigned_agent, linked_queue_id, history, created_at, updated_at
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                map_task_row,
            )
            .optional()
            .context("Failed to load task")?;
        Ok(state)
    }

    fn insert(&self, state: &TaskState) -> Result<(), FsmError> {
        let history = serde_json::to_string(&state.history).context("Failed to encode task history")?;
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO tasks
                    (task_id, status, assigned_agent, linked_queue_id, history, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    state.task_id,
                    state.status.as_str(),
                    state.assigned_agent,
                    state.linked_queue_id,
                    history,
                    fmt_ts(state.created_at),
                    fmt_ts(state.updated_at),
                ],
            )
            .context("Failed to insert task")?;
        if inserted == 0 {
            return Err(FsmError::TaskExists {
                task_id: state.task_id.clone(),
            });
        }
        Ok(())
    }

    fn update(&self, state: &TaskState, expected: TaskStatus) -> Result<(), FsmError> {
        let history = serde_json::to_string(&state.history).context("Failed to encode task history")?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1, history = ?2, updated_at = ?3
                 WHERE task_id = ?4 AND status = ?5",
                params![
                    state.status.as_str(),
                    history,
                    fmt_ts(state.updated_at),
                    state.task_id,
                    expected.as_str(),
                ],
            )
            .context("Failed to update task")?;
        if changed == 1 {
            return Ok(());
        }

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = ?1)",
                params![state.task_id],
                |row| row.get(0),
            )
            .context("Failed to check task existence")?;
        if exists {
            Err(FsmError::Conflict {
                task_id: state.task_id.clone(),
                expected,
            })
        } else {
            Err(FsmError::TaskNotFound {
                task_id: state.task_id.clone(),
            })
        }
    }

    fn list(&self) -> Result<Vec<TaskState>, FsmError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, status, assigned_agent, linked_queue_id, history, created_at, updated_at
                 FROM tasks ORDER BY created_at ASC, task_id ASC",
            )
            .context("Failed to prepare task listing")?;
        let rows = stmt
            .query_map([], map_task_row)
            .context("Failed to list tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to decode task row")?);
        }
        Ok(tasks)
    }
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskState> {
    let history_raw: String = row.get(4)?;
    Ok(TaskState {
        task_id: row.get(0)?,
        status: row.get(1)?,
        assigned_agent: row.get(2)?,
        linked_queue_id: row.get(3)?,
        history: serde_json::from_str(&history_raw)
            .context("Failed to parse task history")
            .map_err(sql_conversion_error)?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?).map_err(sql_conversion_error)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(6)?).map_err(sql_conversion_error)?,
    })
}
