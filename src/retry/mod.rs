//! Retry and dead-letter handling for failed delivery attempts.
//!
//! A failed entry either goes back to `Pending` with a back-off delay or,
//! once `max_attempts` completed attempts are used up (or the failure is
//! permanent), moves to `DeadLetter` with its accumulated error history.

use crate::config::{BackoffStrategy, RetryConfig};
use crate::delivery::DeliveryError;
use crate::queue::{DeadLetterRecord, QueueEntry, QueueError, QueueStore};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let base_delay = Duration::from_millis(config.base_delay_ms);
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            base_delay,
            max_delay: Duration::from_millis(config.max_delay_ms).max(base_delay),
        }
    }

    /// Delay before the next attempt after `attempts` completed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = attempts.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// What happened to an entry after a failed attempt.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Requeued {
        entry: QueueEntry,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered(Box<DeadLetterRecord>),
}

impl RetryOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered(_))
    }
}

pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record the failure of a `Processing` entry and reschedule or
    /// dead-letter it.
    pub fn handle_failure(
        &self,
        store: &dyn QueueStore,
        queue_id: &str,
        error: &DeliveryError,
    ) -> Result<RetryOutcome, QueueError> {
        self.handle_failure_at(store, queue_id, error, Utc::now())
    }

    pub fn handle_failure_at(
        &self,
        store: &dyn QueueStore,
        queue_id: &str,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, QueueError> {
        let failed = store.mark_failed(queue_id, &error.to_string())?;
        let attempts = failed.delivery_attempts;

        if error.is_permanent() || self.policy.exhausted(attempts) {
            let reason = if error.is_permanent() {
                error.to_string()
            } else {
                format!("retries exhausted after {attempts} attempts; last error: {error}")
            };
            let record = store.dead_letter(queue_id, &reason)?;
            tracing::warn!(
                queue_id,
                recipient = record.recipient(),
                attempts,
                reason = %record.failure_reason,
                "Queue entry dead-lettered"
            );
            return Ok(RetryOutcome::DeadLettered(Box::new(record)));
        }

        let delay = self.policy.delay_for(attempts);
        let next_attempt_at = now
            .checked_add_signed(TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = store.requeue(queue_id, next_attempt_at)?;
        tracing::info!(
            queue_id,
            recipient = entry.recipient(),
            attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Delivery failed, entry requeued"
        );
        Ok(RetryOutcome::Requeued {
            next_attempt_at: entry.next_attempt_at,
            entry,
        })
    }
}
