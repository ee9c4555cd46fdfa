use super::store::{QueueError, QueueStore};
use super::types::{
    DeadLetterFilter, DeadLetterRecord, Message, QueueEntry, QueueFilter, QueueStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, QueueEntry>,
    /// Enqueue order; claim scans oldest first.
    order: Vec<String>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl StoreState {
    fn entry_mut(&mut self, queue_id: &str) -> Result<&mut QueueEntry, QueueError> {
        self.entries
            .get_mut(queue_id)
            .ok_or_else(|| QueueError::not_found(queue_id))
    }
}

/// Process-local queue store. Every operation runs under one lock, which
/// makes `claim_next` trivially exclusive.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock()
    }

    /// Test hook: force an entry into `Processing` as if a worker died
    /// mid-delivery.
    #[cfg(test)]
    pub(crate) fn force_processing(&self, queue_id: &str) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get_mut(queue_id) {
            entry.status = QueueStatus::Processing;
            entry.claimed_at = Some(Utc::now());
        }
    }
}

impl QueueStore for InMemoryQueueStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn enqueue(&self, message: Message) -> Result<QueueEntry, QueueError> {
        let entry = QueueEntry::new(message, Utc::now());
        let mut state = self.lock_state();
        state.order.push(entry.queue_id.clone());
        state.entries.insert(entry.queue_id.clone(), entry.clone());
        Ok(entry)
    }

    fn claim_next(
        &self,
        recipient: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let candidate = state.order.iter().find(|queue_id| {
            state.entries.get(*queue_id).is_some_and(|entry| {
                entry.status == QueueStatus::Pending
                    && entry.next_attempt_at <= now
                    && recipient.is_none_or(|recipient| entry.recipient() == recipient)
            })
        });
        let Some(queue_id) = candidate.cloned() else {
            return Ok(None);
        };

        let entry = state.entry_mut(&queue_id)?;
        entry.apply_claim(now)?;
        Ok(Some(entry.clone()))
    }

    fn mark_delivered(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock_state();
        let entry = state.entry_mut(queue_id)?;
        entry.apply_delivered(Utc::now())?;
        Ok(entry.clone())
    }

    fn mark_failed(&self, queue_id: &str, error: &str) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock_state();
        let entry = state.entry_mut(queue_id)?;
        entry.apply_failed(error, Utc::now())?;
        Ok(entry.clone())
    }

    fn requeue(
        &self,
        queue_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock_state();
        let entry = state.entry_mut(queue_id)?;
        entry.apply_requeue(not_before, Utc::now())?;
        Ok(entry.clone())
    }

    fn dead_letter(&self, queue_id: &str, reason: &str) -> Result<DeadLetterRecord, QueueError> {
        let mut state = self.lock_state();
        let record = state
            .entry_mut(queue_id)?
            .apply_dead_letter(reason, Utc::now())?;
        state.dead_letters.push(record.clone());
        Ok(record)
    }

    fn cancel(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock_state();
        let entry = state.entry_mut(queue_id)?;
        entry.apply_cancel(Utc::now())?;
        Ok(entry.clone())
    }

    fn get(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        self.lock_state()
            .entries
            .get(queue_id)
            .cloned()
            .ok_or_else(|| QueueError::not_found(queue_id))
    }

    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.lock_state();
        let matching = state
            .order
            .iter()
            .filter_map(|queue_id| state.entries.get(queue_id))
            .filter(|entry| filter.matches(entry))
            .cloned();
        Ok(match filter.effective_limit() {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRecord>, QueueError> {
        Ok(self
            .lock_state()
            .dead_letters
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    fn purge_dead_letters(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.lock_state();
        let len_before = state.dead_letters.len();
        state
            .dead_letters
            .retain(|record| record.dead_lettered_at >= before);
        Ok(len_before - state.dead_letters.len())
    }

    fn recover_in_flight(&self) -> Result<Vec<String>, QueueError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let now = Utc::now();
        let mut recovered = Vec::new();
        for queue_id in &state.order {
            if let Some(entry) = state.entries.get_mut(queue_id) {
                if entry.status == QueueStatus::Processing {
                    entry.apply_recover(now)?;
                    recovered.push(queue_id.clone());
                }
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::MessageCategory;
    use chrono::Duration as ChronoDuration;

    fn message(recipient: &str, content: &str) -> Message {
        Message::new("Coordinator", recipient, MessageCategory::CaptainToAgent, content)
    }

    #[test]
    fn claim_returns_oldest_pending_first() {
        let store = InMemoryQueueStore::new();
        let first = store.enqueue(message("Worker-1", "one")).unwrap();
        let second = store.enqueue(message("Worker-1", "two")).unwrap();

        let claimed = store.claim_next(None, Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.queue_id, first.queue_id);
        assert_eq!(claimed.status, QueueStatus::Processing);

        let claimed = store.claim_next(None, Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.queue_id, second.queue_id);
        assert!(store.claim_next(None, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn claim_filters_by_recipient() {
        let store = InMemoryQueueStore::new();
        store.enqueue(message("Worker-1", "one")).unwrap();
        let for_two = store.enqueue(message("Worker-2", "two")).unwrap();

        let claimed = store
            .claim_next(Some("Worker-2"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(claimed.queue_id, for_two.queue_id);
        assert!(store.claim_next(Some("Worker-2"), Utc::now()).unwrap().is_none());
    }

    #[test]
    fn claim_skips_entries_in_backoff() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(message("Worker-1", "later")).unwrap();
        store.claim_next(None, Utc::now()).unwrap().unwrap();
        store.mark_failed(&entry.queue_id, "offline").unwrap();
        store
            .requeue(&entry.queue_id, Utc::now() + ChronoDuration::seconds(30))
            .unwrap();

        assert!(store.claim_next(None, Utc::now()).unwrap().is_none());
        let later = Utc::now() + ChronoDuration::seconds(31);
        assert!(store.claim_next(None, later).unwrap().is_some());
    }

    #[test]
    fn cancel_only_while_pending() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(message("Worker-1", "x")).unwrap();
        store.claim_next(None, Utc::now()).unwrap();
        assert!(matches!(
            store.cancel(&entry.queue_id),
            Err(QueueError::InvalidTransition { .. })
        ));

        let other = store.enqueue(message("Worker-1", "y")).unwrap();
        let cancelled = store.cancel(&other.queue_id).unwrap();
        assert_eq!(cancelled.status, QueueStatus::Cancelled);
    }

    #[test]
    fn recover_resets_processing_entries() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(message("Worker-1", "x")).unwrap();
        store.force_processing(&entry.queue_id);

        let recovered = store.recover_in_flight().unwrap();
        assert_eq!(recovered, vec![entry.queue_id.clone()]);
        assert_eq!(
            store.get(&entry.queue_id).unwrap().status,
            QueueStatus::Pending
        );
    }

    #[test]
    fn dead_letters_filter_and_purge() {
        let store = InMemoryQueueStore::new();
        for recipient in ["Worker-1", "Worker-2"] {
            let entry = store.enqueue(message(recipient, "x")).unwrap();
            store.claim_next(None, Utc::now()).unwrap();
            store.mark_failed(&entry.queue_id, "down").unwrap();
            store.dead_letter(&entry.queue_id, "exhausted").unwrap();
        }

        let filter = DeadLetterFilter {
            recipient: Some("Worker-2".into()),
            ..DeadLetterFilter::default()
        };
        assert_eq!(store.list_dead_letters(&filter).unwrap().len(), 1);

        let purged = store
            .purge_dead_letters(Utc::now() + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(purged, 2);
        assert!(store
            .list_dead_letters(&DeadLetterFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_queue_id_is_not_found() {
        let store = InMemoryQueueStore::new();
        assert!(matches!(
            store.get("missing"),
            Err(QueueError::NotFound { .. })
        ));
    }
}
