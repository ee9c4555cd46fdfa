use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ── Category ────────────────────────────────────────────────────

/// Who a message comes from, relative to the receiving agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    AgentToAgent,
    CaptainToAgent,
    SystemToAgent,
    ExternalToAgent,
}

impl MessageCategory {
    pub const ALL: [Self; 4] = [
        Self::AgentToAgent,
        Self::CaptainToAgent,
        Self::SystemToAgent,
        Self::ExternalToAgent,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentToAgent => "agent_to_agent",
            Self::CaptainToAgent => "captain_to_agent",
            Self::SystemToAgent => "system_to_agent",
            Self::ExternalToAgent => "external_to_agent",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageCategory {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "agent_to_agent" | "a2a" => Ok(Self::AgentToAgent),
            "captain_to_agent" | "c2a" => Ok(Self::CaptainToAgent),
            "system_to_agent" | "s2a" => Ok(Self::SystemToAgent),
            "external_to_agent" | "e2a" => Ok(Self::ExternalToAgent),
            _ => Err(ParseEnumError {
                kind: "message category",
                value: raw.to_string(),
            }),
        }
    }
}

// ── Priority ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    /// Corrective instructions. Bypasses deduplication.
    Urgent,
}

impl MessagePriority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(ParseEnumError {
                kind: "message priority",
                value: raw.to_string(),
            }),
        }
    }
}

// ── Status ──────────────────────────────────────────────────────

/// Lifecycle state of a queue entry.
///
/// Allowed moves:
/// - `Pending → Processing | Cancelled`
/// - `Processing → Delivered | Failed | Pending` (the last one only for
///   crash recovery and operator requeue)
/// - `Failed → Pending | DeadLetter`
///
/// `Delivered`, `DeadLetter` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    DeadLetter,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Delivered,
        Self::Failed,
        Self::DeadLetter,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLetter | Self::Cancelled)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Delivered | Self::Failed | Self::Pending)
                | (Self::Failed, Self::Pending | Self::DeadLetter)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseEnumError {
                kind: "queue status",
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ── Message ─────────────────────────────────────────────────────

/// Immutable payload handed from a sender to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub category: MessageCategory,
    pub content: String,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Set when the message assigns a unit of work that should be tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        category: MessageCategory,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            category,
            content: content.into(),
            priority: MessagePriority::Normal,
            task_id: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        require_non_empty(&self.id, "id")?;
        require_non_empty(&self.sender, "sender")?;
        require_non_empty(&self.recipient, "recipient")?;
        require_non_empty(&self.content, "content")?;
        if let Some(task_id) = &self.task_id {
            require_non_empty(task_id, "task_id")?;
        }
        Ok(())
    }
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), MessageError> {
    if value.trim().is_empty() {
        return Err(MessageError::EmptyField { field });
    }
    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
}

// ── Queue entry ─────────────────────────────────────────────────

/// Mutable delivery record wrapping one enqueued message.
///
/// Retries mutate the same entry; `delivery_attempts` counts completed
/// attempts (delivered or failed), so an attempt interrupted by a crash is
/// not counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: String,
    pub message: Message,
    pub status: QueueStatus,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_history: Vec<String>,
    /// Earliest time the entry may be claimed again.
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(message: Message, now: DateTime<Utc>) -> Self {
        Self {
            queue_id: Uuid::new_v4().to_string(),
            message,
            status: QueueStatus::Pending,
            delivery_attempts: 0,
            last_error: None,
            error_history: Vec::new(),
            next_attempt_at: now,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn recipient(&self) -> &str {
        &self.message.recipient
    }
}

/// Terminal record for an entry that exhausted its delivery policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub queue_id: String,
    pub entry: QueueEntry,
    pub failure_reason: String,
    pub total_attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn recipient(&self) -> &str {
        self.entry.recipient()
    }
}

// ── Filters ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub recipient: Option<String>,
    /// Only entries last touched at or after this time.
    pub updated_since: Option<DateTime<Utc>>,
    /// `0` or `None` lists everything.
    pub limit: Option<usize>,
}

impl QueueFilter {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.status.is_none_or(|status| entry.status == status)
            && self
                .recipient
                .as_deref()
                .is_none_or(|recipient| entry.recipient() == recipient)
            && self
                .updated_since
                .is_none_or(|since| entry.updated_at >= since)
    }

    pub(crate) fn effective_limit(&self) -> Option<usize> {
        self.limit.filter(|limit| *limit > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub recipient: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.recipient
            .as_deref()
            .is_none_or(|recipient| record.recipient() == recipient)
            && self.since.is_none_or(|since| record.dead_lettered_at >= since)
            && self.until.is_none_or(|until| record.dead_lettered_at < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use QueueStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(DeadLetter));

        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Processing.can_transition_to(Cancelled));
        for terminal in [Delivered, DeadLetter, Cancelled] {
            assert!(terminal.is_terminal());
            for next in QueueStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn category_parses_aliases() {
        assert_eq!(
            "captain-to-agent".parse::<MessageCategory>().unwrap(),
            MessageCategory::CaptainToAgent
        );
        assert_eq!(
            "A2A".parse::<MessageCategory>().unwrap(),
            MessageCategory::AgentToAgent
        );
        assert!("broadcast".parse::<MessageCategory>().is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in QueueStatus::ALL {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert_eq!(
            "dead-letter".parse::<QueueStatus>().unwrap(),
            QueueStatus::DeadLetter
        );
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let message = Message::new("Coordinator", "  ", MessageCategory::CaptainToAgent, "hi");
        assert_eq!(
            message.validate(),
            Err(MessageError::EmptyField { field: "recipient" })
        );

        let message = Message::new("Coordinator", "Worker-1", MessageCategory::CaptainToAgent, "")
            .with_task("task-1");
        assert_eq!(
            message.validate(),
            Err(MessageError::EmptyField { field: "content" })
        );
    }

    #[test]
    fn filter_matches_status_and_recipient() {
        let now = Utc::now();
        let entry = QueueEntry::new(
            Message::new("a", "Worker-1", MessageCategory::AgentToAgent, "x"),
            now,
        );
        assert!(QueueFilter::default().matches(&entry));
        assert!(QueueFilter::status(QueueStatus::Pending).matches(&entry));
        assert!(!QueueFilter::status(QueueStatus::Delivered).matches(&entry));
        let by_recipient = QueueFilter {
            recipient: Some("Worker-2".into()),
            ..QueueFilter::default()
        };
        assert!(!by_recipient.matches(&entry));

        let recent = QueueFilter {
            updated_since: Some(now),
            ..QueueFilter::default()
        };
        assert!(recent.matches(&entry));
        let future = QueueFilter {
            updated_since: Some(now + chrono::TimeDelta::seconds(1)),
            ..QueueFilter::default()
        };
        assert!(!future.matches(&entry));
    }
}
