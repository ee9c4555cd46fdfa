//! FSM Bridge: translates recipient activity into task state transitions.
//!
//! Tasks move `Queued → Dispatched → Acknowledged → Completed | Failed`.
//! Only the bridge writes task state. Delivery outcomes arrive through
//! [`FsmBridge::on_delivered`] and [`FsmBridge::on_delivery_abandoned`];
//! recipient activity arrives as classified [`TaskEvent`]s.

pub mod sqlite;
pub mod store;
pub mod types;

pub use sqlite::SqliteTaskStore;
pub use store::{FsmError, InMemoryTaskStore, TaskStore};
pub use types::{
    EventOutcome, TaskEvent, TaskEventKind, TaskState, TaskStatus, TaskTransition,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;

const MAX_UPDATE_RETRIES: usize = 3;
const MAX_NOTE_CHARS: usize = 512;

pub struct FsmBridge {
    store: Arc<dyn TaskStore>,
}

impl FsmBridge {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTaskStore::new()))
    }

    /// Register a task for an assignment that was just enqueued.
    pub fn create_task(
        &self,
        task_id: &str,
        assigned_agent: &str,
        queue_id: &str,
    ) -> Result<TaskState, FsmError> {
        let state = TaskState::new(task_id, assigned_agent, queue_id, Utc::now());
        self.store.insert(&state)?;
        tracing::debug!(task_id, assigned_agent, queue_id, "Task created");
        Ok(state)
    }

    pub fn exists(&self, task_id: &str) -> Result<bool, FsmError> {
        Ok(self.store.get(task_id)?.is_some())
    }

    pub fn get(&self, task_id: &str) -> Result<TaskState, FsmError> {
        self.store
            .get(task_id)?
            .ok_or_else(|| FsmError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    pub fn list(&self) -> Result<Vec<TaskState>, FsmError> {
        self.store.list()
    }

    /// The linked entry reached `Delivered`: `Queued → Dispatched`.
    ///
    /// A delivery for a queue entry other than the one the task is linked to
    /// leaves the task alone.
    pub fn on_delivered(&self, task_id: &str, queue_id: &str) -> Result<EventOutcome, FsmError> {
        self.transition(task_id, Utc::now(), |state| {
            if state.linked_queue_id != queue_id {
                return Step::Ignore;
            }
            match state.status {
                TaskStatus::Queued => Step::Advance(vec![(
                    TaskStatus::Dispatched,
                    Some(format!("delivered as {queue_id}")),
                )]),
                _ => Step::Ignore,
            }
        })
    }

    /// The linked entry was dead-lettered or cancelled: the task fails.
    pub fn on_delivery_abandoned(
        &self,
        task_id: &str,
        reason: &str,
    ) -> Result<EventOutcome, FsmError> {
        let note = bounded_note(reason);
        self.transition(task_id, Utc::now(), |_| {
            Step::Advance(vec![(TaskStatus::Failed, Some(note.clone()))])
        })
    }

    /// Feed one recipient activity event.
    pub fn apply_event(&self, event: &TaskEvent) -> Result<EventOutcome, FsmError> {
        let note = event.payload.as_deref().map(bounded_note);
        let outcome = self.transition(&event.task_id, event.at, |state| {
            next_steps(state.status, event.kind, note.clone())
        })?;

        match &outcome {
            EventOutcome::Advanced { from, to } => tracing::info!(
                task_id = %event.task_id,
                event = %event.kind,
                from = %from,
                to = %to,
                "Task advanced"
            ),
            EventOutcome::Ignored { status } => tracing::debug!(
                task_id = %event.task_id,
                event = %event.kind,
                status = %status,
                "Task event ignored"
            ),
            EventOutcome::Discarded { .. } => {}
        }
        Ok(outcome)
    }

    /// Read-check-write with a status guard, retried when another writer
    /// moved the task in between.
    fn transition<F>(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
        decide: F,
    ) -> Result<EventOutcome, FsmError>
    where
        F: Fn(&TaskState) -> Step,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut state = self.get(task_id)?;
            let from = state.status;

            if from.is_terminal() {
                tracing::warn!(task_id, status = %from, "Event for terminal task discarded");
                return Ok(EventOutcome::Discarded { status: from });
            }

            let steps = match decide(&state) {
                Step::Ignore => return Ok(EventOutcome::Ignored { status: from }),
                Step::Advance(steps) => steps,
            };
            for (status, note) in steps {
                state.advance(status, at.max(state.updated_at), note);
            }
            let to = state.status;

            match self.store.update(&state, from) {
                Ok(()) => return Ok(EventOutcome::Advanced { from, to }),
                Err(FsmError::Conflict { .. }) if attempt < MAX_UPDATE_RETRIES => {
                    tracing::debug!(task_id, attempt, "Task changed concurrently, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

enum Step {
    Ignore,
    Advance(Vec<(TaskStatus, Option<String>)>),
}

fn next_steps(status: TaskStatus, kind: TaskEventKind, note: Option<String>) -> Step {
    use TaskEventKind as Kind;
    use TaskStatus as Status;

    let outcome = match kind {
        Kind::Completed => Status::Completed,
        Kind::Failed => Status::Failed,
        Kind::Acknowledged => {
            return match status {
                Status::Dispatched => Step::Advance(vec![(Status::Acknowledged, note)]),
                _ => Step::Ignore,
            };
        }
        Kind::Activity => return Step::Ignore,
    };

    match status {
        Status::Acknowledged => Step::Advance(vec![(outcome, note)]),
        Status::Dispatched => Step::Advance(vec![
            (Status::Acknowledged, Some("implied by outcome".to_string())),
            (outcome, note),
        ]),
        _ => Step::Ignore,
    }
}

fn bounded_note(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(MAX_NOTE_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
