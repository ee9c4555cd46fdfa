use super::types::{TaskState, TaskStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },
    #[error("task `{task_id}` already exists")]
    TaskExists { task_id: String },
    #[error("task `{task_id}` changed concurrently (expected {expected})")]
    Conflict {
        task_id: String,
        expected: TaskStatus,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Persistence for task state. The FSM bridge is the only writer.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<TaskState>, FsmError>;

    /// Insert a new task; fails with `TaskExists` on a duplicate id.
    fn insert(&self, state: &TaskState) -> Result<(), FsmError>;

    /// Overwrite `state`, but only if the stored status is still `expected`.
    fn update(&self, state: &TaskState, expected: TaskStatus) -> Result<(), FsmError>;

    /// All tasks, oldest first.
    fn list(&self) -> Result<Vec<TaskState>, FsmError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<String, TaskState>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, task_id: &str) -> Result<Option<TaskState>, FsmError> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    fn insert(&self, state: &TaskState) -> Result<(), FsmError> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&state.task_id) {
            return Err(FsmError::TaskExists {
                task_id: state.task_id.clone(),
            });
        }
        tasks.insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    fn update(&self, state: &TaskState, expected: TaskStatus) -> Result<(), FsmError> {
        let mut tasks = self.tasks.lock();
        let stored = tasks
            .get_mut(&state.task_id)
            .ok_or_else(|| FsmError::TaskNotFound {
                task_id: state.task_id.clone(),
            })?;
        if stored.status != expected {
            return Err(FsmError::Conflict {
                task_id: state.task_id.clone(),
                expected,
            });
        }
        *stored = state.clone();
        Ok(())
    }

    fn list(&self) -> Result<Vec<TaskState>, FsmError> {
        let mut tasks: Vec<TaskState> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }
}
