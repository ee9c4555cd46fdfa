use super::types::{
    DeadLetterFilter, DeadLetterRecord, Message, QueueEntry, QueueFilter, QueueStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

const MAX_ERROR_BYTES: usize = 2 * 1024;
const MAX_ERROR_HISTORY: usize = 32;
const TRUNCATED_ERROR_MARKER: &str = "...[truncated]";

/// Errors emitted by queue store implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue entry `{queue_id}` not found")]
    NotFound { queue_id: String },
    #[error("queue entry `{queue_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        queue_id: String,
        from: QueueStatus,
        to: QueueStatus,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl QueueError {
    pub(crate) fn not_found(queue_id: &str) -> Self {
        Self::NotFound {
            queue_id: queue_id.to_string(),
        }
    }
}

/// Durable, ordered record of queue entries and their lifecycle.
///
/// Implementations must serialize `claim_next` so that an entry moves from
/// `Pending` to `Processing` at most once per claim; every other mutation is
/// a checked transition on a single entry.
pub trait QueueStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Persist a new `Pending` entry for `message`.
    fn enqueue(&self, message: Message) -> Result<QueueEntry, QueueError>;

    /// Claim the oldest `Pending` entry that is due at `now`, optionally only
    /// for one recipient, and move it to `Processing`.
    fn claim_next(
        &self,
        recipient: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, QueueError>;

    fn mark_delivered(&self, queue_id: &str) -> Result<QueueEntry, QueueError>;

    fn mark_failed(&self, queue_id: &str, error: &str) -> Result<QueueEntry, QueueError>;

    /// Return a `Failed` (retry) or `Processing` (operator release) entry to
    /// `Pending`, claimable no earlier than `not_before`.
    fn requeue(&self, queue_id: &str, not_before: DateTime<Utc>)
        -> Result<QueueEntry, QueueError>;

    /// Move a `Failed` entry to `DeadLetter` and record it.
    fn dead_letter(&self, queue_id: &str, reason: &str) -> Result<DeadLetterRecord, QueueError>;

    /// Cancel an entry that has not been claimed yet.
    fn cancel(&self, queue_id: &str) -> Result<QueueEntry, QueueError>;

    fn get(&self, queue_id: &str) -> Result<QueueEntry, QueueError>;

    /// Entries matching `filter`, oldest first.
    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, QueueError>;

    /// Dead-letter records matching `filter`, oldest first.
    fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRecord>, QueueError>;

    /// Remove dead-letter records older than `before`. Entries stay.
    fn purge_dead_letters(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Reset every `Processing` entry to `Pending`, keeping attempt counts.
    /// Called once on startup, before any worker claims.
    fn recover_in_flight(&self) -> Result<Vec<String>, QueueError>;

    fn status_counts(&self) -> Result<HashMap<QueueStatus, usize>, QueueError> {
        let mut counts: HashMap<QueueStatus, usize> =
            QueueStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for entry in self.list(&QueueFilter::default())? {
            *counts.entry(entry.status).or_default() += 1;
        }
        Ok(counts)
    }
}

// ── Entry lifecycle (shared by every backend) ───────────────────

impl QueueEntry {
    fn transition(&mut self, next: QueueStatus, now: DateTime<Utc>) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                queue_id: self.queue_id.clone(),
                from: self.status,
                to: next,
            });
        }
        if self.status == QueueStatus::Processing {
            self.claimed_at = None;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn apply_claim(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(QueueStatus::Processing, now)?;
        self.claimed_at = Some(now);
        Ok(())
    }

    pub(crate) fn apply_delivered(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(QueueStatus::Delivered, now)?;
        self.delivery_attempts = self.delivery_attempts.saturating_add(1);
        Ok(())
    }

    pub(crate) fn apply_failed(&mut self, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(QueueStatus::Failed, now)?;
        self.delivery_attempts = self.delivery_attempts.saturating_add(1);
        let bounded = truncate_error(error);
        if self.error_history.len() >= MAX_ERROR_HISTORY {
            self.error_history.remove(0);
        }
        self.error_history
            .push(format!("attempt {}: {bounded}", self.delivery_attempts));
        self.last_error = Some(bounded);
        Ok(())
    }

    pub(crate) fn apply_requeue(
        &mut self,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.transition(QueueStatus::Pending, now)?;
        self.next_attempt_at = not_before.max(now);
        Ok(())
    }

    pub(crate) fn apply_cancel(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(QueueStatus::Cancelled, now)
    }

    pub(crate) fn apply_dead_letter(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, QueueError> {
        self.transition(QueueStatus::DeadLetter, now)?;
        Ok(DeadLetterRecord {
            queue_id: self.queue_id.clone(),
            entry: self.clone(),
            failure_reason: truncate_error(reason),
            total_attempts: self.delivery_attempts,
            dead_lettered_at: now,
        })
    }

    /// Crash recovery: the interrupted attempt is not counted.
    pub(crate) fn apply_recover(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(QueueStatus::Pending, now)?;
        self.next_attempt_at = now;
        Ok(())
    }
}

fn truncate_error(error: &str) -> String {
    let error = error.trim();
    if error.len() <= MAX_ERROR_BYTES {
        return error.to_string();
    }

    let mut cutoff = MAX_ERROR_BYTES - TRUNCATED_ERROR_MARKER.len();
    while cutoff > 0 && !error.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = error[..cutoff].to_string();
    truncated.push_str(TRUNCATED_ERROR_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::MessageCategory;

    fn entry() -> QueueEntry {
        QueueEntry::new(
            Message::new("Coordinator", "Worker-1", MessageCategory::CaptainToAgent, "go"),
            Utc::now(),
        )
    }

    #[test]
    fn failed_attempts_accumulate_history() {
        let mut entry = entry();
        let now = Utc::now();
        for attempt in 1..=2 {
            entry.apply_claim(now).unwrap();
            entry.apply_failed(&format!("boom {attempt}"), now).unwrap();
            entry.apply_requeue(now, now).unwrap();
        }
        assert_eq!(entry.delivery_attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("boom 2"));
        assert_eq!(
            entry.error_history,
            vec!["attempt 1: boom 1".to_string(), "attempt 2: boom 2".to_string()]
        );
        assert!(entry.claimed_at.is_none());
    }

    #[test]
    fn delivered_entry_rejects_further_moves() {
        let mut entry = entry();
        let now = Utc::now();
        entry.apply_claim(now).unwrap();
        entry.apply_delivered(now).unwrap();

        let err = entry.apply_requeue(now, now).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: QueueStatus::Delivered,
                to: QueueStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn dead_letter_snapshots_attempts() {
        let mut entry = entry();
        let now = Utc::now();
        entry.apply_claim(now).unwrap();
        entry.apply_failed("unreachable", now).unwrap();
        let record = entry.apply_dead_letter("retries exhausted", now).unwrap();
        assert_eq!(record.total_attempts, 1);
        assert_eq!(record.entry.status, QueueStatus::DeadLetter);
        assert_eq!(record.entry.error_history.len(), 1);
    }

    #[test]
    fn recover_keeps_attempt_count() {
        let mut entry = entry();
        let now = Utc::now();
        entry.apply_claim(now).unwrap();
        entry.apply_failed("x", now).unwrap();
        entry.apply_requeue(now, now).unwrap();
        entry.apply_claim(now).unwrap();
        entry.apply_recover(now).unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.delivery_attempts, 1);
    }

    #[test]
    fn oversized_errors_are_truncated() {
        let mut entry = entry();
        let now = Utc::now();
        entry.apply_claim(now).unwrap();
        entry.apply_failed(&"e".repeat(MAX_ERROR_BYTES * 2), now).unwrap();
        let stored = entry.last_error.unwrap();
        assert!(stored.len() <= MAX_ERROR_BYTES);
        assert!(stored.ends_with(TRUNCATED_ERROR_MARKER));
    }
}
