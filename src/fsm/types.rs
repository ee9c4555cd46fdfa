use crate::queue::ParseEnumError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle: `Queued → Dispatched → Acknowledged → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Acknowledged,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Dispatched,
        Self::Acknowledged,
        Self::Completed,
        Self::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseEnumError {
                kind: "task status",
                value: raw.to_string(),
            })
    }
}

/// Recipient activity, classified upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Acknowledged,
    Completed,
    Failed,
    /// Anything else the recipient produced. Never moves a task.
    Activity,
}

impl TaskEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventKind {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "acknowledged" | "ack" => Ok(Self::Acknowledged),
            "completed" | "done" => Ok(Self::Completed),
            "failed" | "error" => Ok(Self::Failed),
            "activity" => Ok(Self::Activity),
            _ => Err(ParseEnumError {
                kind: "task event kind",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, kind: TaskEventKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            payload: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Per-task state machine record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub assigned_agent: String,
    pub linked_queue_id: String,
    /// Every status the task has held, oldest first, starting with `Queued`.
    pub history: Vec<TaskTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(
        task_id: impl Into<String>,
        assigned_agent: impl Into<String>,
        linked_queue_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Queued,
            assigned_agent: assigned_agent.into(),
            linked_queue_id: linked_queue_id.into(),
            history: vec![TaskTransition {
                status: TaskStatus::Queued,
                at: now,
                note: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn advance(&mut self, status: TaskStatus, at: DateTime<Utc>, note: Option<String>) {
        self.status = status;
        self.updated_at = at;
        self.history.push(TaskTransition { status, at, note });
    }
}

/// Result of feeding one event to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Advanced { from: TaskStatus, to: TaskStatus },
    /// Event did not apply to the current state.
    Ignored { status: TaskStatus },
    /// Task is terminal; the event was logged and dropped.
    Discarded { status: TaskStatus },
}
