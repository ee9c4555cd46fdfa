//! Submission and query interface over the queue, plus one delivery step.
//!
//! A submission is validated, routed, rate-limited and deduplicated before
//! it is persisted; it never waits for delivery. Delivery happens in
//! [`Dispatcher::process_next`], called by the daemon's workers.

use crate::config::{Config, DedupConfig, ThrottleConfig};
use crate::dedup::{AdmitReason, DedupService, Fingerprint};
use crate::delivery::{DeliveryEngine, DeliveryError, DeliveryReceipt};
use crate::fsm::{
    EventOutcome, FsmBridge, FsmError, SqliteTaskStore, TaskEvent, TaskState, TaskStatus,
};
use crate::observability::{JournalKind, QueueJournal};
use crate::queue::{
    DeadLetterFilter, DeadLetterRecord, Message, MessageError, QueueEntry, QueueError, QueueFilter,
    QueueStatus, QueueStore, SqliteQueueStore,
};
use crate::retry::{RetryHandler, RetryOutcome, RetryPolicy};
use crate::router::{MessageRouter, RouteError};
use crate::throttle::Throttler;
use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a submission was refused. Nothing was enqueued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("duplicate message ({reason}), fingerprint {fingerprint}")]
    Duplicate {
        reason: AdmitReason,
        fingerprint: Fingerprint,
    },
    #[error("too many messages to `{recipient}`; back off and retry")]
    Throttled { recipient: String },
    #[error("recipient `{recipient}` is not a registered agent")]
    RecipientNotFound { recipient: String },
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
    #[error("task `{task_id}` already exists")]
    TaskExists { task_id: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<RouteError> for SubmitError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::RecipientNotFound { recipient } => Self::RecipientNotFound { recipient },
        }
    }
}

impl From<QueueError> for SubmitError {
    fn from(err: QueueError) -> Self {
        Self::Storage(err.into())
    }
}

/// Result of one [`Dispatcher::process_next`] step.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Delivered {
        entry: QueueEntry,
        receipt: DeliveryReceipt,
    },
    Requeued {
        entry: QueueEntry,
        error: DeliveryError,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered(Box<DeadLetterRecord>),
}

impl ProcessOutcome {
    pub fn queue_id(&self) -> &str {
        match self {
            Self::Delivered { entry, .. } | Self::Requeued { entry, .. } => &entry.queue_id,
            Self::DeadLettered(record) => &record.queue_id,
        }
    }

    pub fn status(&self) -> QueueStatus {
        match self {
            Self::Delivered { .. } => QueueStatus::Delivered,
            Self::Requeued { .. } => QueueStatus::Pending,
            Self::DeadLettered(_) => QueueStatus::DeadLetter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries moved from `processing` back to `pending`.
    pub recovered: Vec<String>,
    /// Tasks moved to match an entry that had already finished.
    pub reconciled: usize,
    /// Dedup reservations and keys rebuilt from the queue.
    pub reseeded: usize,
}

/// Start of a window of `span` ending at `now`.
fn since(now: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    router: MessageRouter,
    engine: DeliveryEngine,
    dedup: DedupService,
    throttle: Throttler,
    retry: RetryHandler,
    tasks: FsmBridge,
    journal: QueueJournal,
}

impl Dispatcher {
    /// Dispatcher with default dedup, throttle and retry settings, in-memory
    /// task tracking and no journal.
    pub fn new(store: Arc<dyn QueueStore>, router: MessageRouter, engine: DeliveryEngine) -> Self {
        Self {
            store,
            router,
            engine,
            dedup: DedupService::from_config(&DedupConfig::default()),
            throttle: Throttler::from_config(&ThrottleConfig::default()),
            retry: RetryHandler::new(RetryPolicy::default()),
            tasks: FsmBridge::in_memory(),
            journal: QueueJournal::disabled(),
        }
    }

    /// Durable stores in the workspace and every component from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db_path = config.queue_db_path();
        let store = SqliteQueueStore::open(&db_path)?;
        let tasks = SqliteTaskStore::open(&db_path)?;
        let router = MessageRouter::from_config(config).context("Invalid router configuration")?;
        let engine = DeliveryEngine::from_config(config)?;

        if router.registry().is_empty() {
            tracing::warn!("No agents configured; every submission will be rejected");
        }

        Ok(Self::new(Arc::new(store), router, engine)
            .with_dedup(DedupService::from_config(&config.dedup))
            .with_throttle(Throttler::from_config(&config.throttle))
            .with_retry(RetryHandler::new(RetryPolicy::from_config(&config.retry)))
            .with_tasks(FsmBridge::new(Arc::new(tasks)))
            .with_journal(QueueJournal::from_config(config)))
    }

    #[must_use]
    pub fn with_dedup(mut self, dedup: DedupService) -> Self {
        self.dedup = dedup;
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: Throttler) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryHandler) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_tasks(mut self, tasks: FsmBridge) -> Self {
        self.tasks = tasks;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: QueueJournal) -> Self {
        self.journal = journal;
        self
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn dedup(&self) -> &DedupService {
        &self.dedup
    }

    pub fn throttle(&self) -> &Throttler {
        &self.throttle
    }

    // ── Submission ──────────────────────────────────────────────

    /// Validate, route, rate-limit, deduplicate and persist `message`.
    ///
    /// Returns the new `pending` entry. A message carrying a `task_id` also
    /// registers the task with the FSM bridge.
    pub fn submit(&self, mut message: Message) -> Result<QueueEntry, SubmitError> {
        message.recipient = message.recipient.trim().to_string();
        message.validate()?;
        self.router.route(&message)?;

        if let Some(task_id) = &message.task_id {
            if self.tasks.exists(task_id).map_err(fsm_storage)? {
                return Err(SubmitError::TaskExists {
                    task_id: task_id.clone(),
                });
            }
        }

        let recipient = message.recipient.clone();
        let slot = Instant::now();
        if !self.throttle.allow_at(&recipient, slot) {
            tracing::info!(
                recipient = %recipient,
                sender = %message.sender,
                "Submission throttled"
            );
            return Err(SubmitError::Throttled { recipient });
        }

        let admission = self.dedup.admit(&message);
        if !admission.admitted {
            self.throttle.refund(&recipient, slot);
            tracing::info!(
                recipient = %recipient,
                sender = %message.sender,
                reason = %admission.reason,
                "Submission rejected as duplicate"
            );
            return Err(SubmitError::Duplicate {
                reason: admission.reason,
                fingerprint: admission.fingerprint,
            });
        }

        let entry = match self.store.enqueue(message.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                self.dedup.release(&message);
                self.throttle.refund(&recipient, slot);
                return Err(err.into());
            }
        };
        self.journal.record(JournalKind::Enqueued, &entry, None);

        if let Some(task_id) = &entry.message.task_id {
            match self
                .tasks
                .create_task(task_id, &recipient, &entry.queue_id)
            {
                // A worker may have finished the entry before the task existed.
                Ok(task) => {
                    self.reconcile_task(&task);
                }
                Err(err) => {
                    self.abandon_submission(&entry, &recipient, slot);
                    return Err(match err {
                        FsmError::TaskExists { task_id } => SubmitError::TaskExists { task_id },
                        other => fsm_storage(other),
                    });
                }
            }
        }

        tracing::info!(
            queue_id = %entry.queue_id,
            recipient = %recipient,
            sender = %entry.message.sender,
            category = %entry.message.category,
            priority = %entry.message.priority,
            dedup = %admission.reason,
            "Message enqueued"
        );
        Ok(entry)
    }

    /// Undo an enqueue whose task registration lost a race.
    fn abandon_submission(&self, entry: &QueueEntry, recipient: &str, slot: Instant) {
        match self.store.cancel(&entry.queue_id) {
            Ok(cancelled) => self
                .journal
                .record(JournalKind::Cancelled, &cancelled, Some("task registration failed")),
            Err(err) => tracing::warn!(
                queue_id = %entry.queue_id,
                "Failed to cancel entry after task registration failure: {err}"
            ),
        }
        self.dedup.release(&entry.message);
        self.throttle.refund(recipient, slot);
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn status(&self, queue_id: &str) -> Result<QueueStatus, QueueError> {
        Ok(self.store.get(queue_id)?.status)
    }

    pub fn get(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        self.store.get(queue_id)
    }

    pub fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, QueueError> {
        self.store.list(filter)
    }

    pub fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRecord>, QueueError> {
        self.store.list_dead_letters(filter)
    }

    pub fn task(&self, task_id: &str) -> Result<TaskState, FsmError> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> Result<Vec<TaskState>, FsmError> {
        self.tasks.list()
    }

    /// Feed one recipient activity event to the FSM bridge.
    pub fn task_event(&self, event: &TaskEvent) -> Result<EventOutcome, FsmError> {
        self.tasks.apply_event(event)
    }

    // ── Operator actions ────────────────────────────────────────

    /// Cancel an entry that no worker has claimed yet.
    pub fn cancel(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let entry = self.store.cancel(queue_id)?;
        self.journal
            .record(JournalKind::Cancelled, &entry, Some("operator"));
        self.dedup.release(&entry.message);
        if let Some(task_id) = &entry.message.task_id {
            self.abandon_task(task_id, "queue entry cancelled");
        }
        tracing::info!(queue_id, recipient = entry.recipient(), "Queue entry cancelled");
        Ok(entry)
    }

    /// Force a `processing` (stuck) or `failed` entry back to `pending`,
    /// due immediately. Attempt counts are kept.
    pub fn requeue(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let entry = self.store.requeue(queue_id, Utc::now())?;
        self.journal
            .record(JournalKind::Requeued, &entry, Some("operator"));
        tracing::info!(
            queue_id,
            recipient = entry.recipient(),
            attempts = entry.delivery_attempts,
            "Queue entry requeued by operator"
        );
        Ok(entry)
    }

    pub fn purge_dead_letters(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let removed = self.store.purge_dead_letters(before)?;
        tracing::info!(removed, before = %before, "Dead-letter records purged");
        Ok(removed)
    }

    /// Startup recovery: release interrupted claims, bring tasks in line
    /// with their entries, then rebuild dedup and throttle state. Run before
    /// any worker claims.
    pub fn recover(&self) -> Result<RecoveryReport, QueueError> {
        let recovered = self.store.recover_in_flight()?;
        for queue_id in &recovered {
            if let Ok(entry) = self.store.get(queue_id) {
                self.journal
                    .record(JournalKind::Recovered, &entry, Some("interrupted claim"));
            }
        }
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                "Recovered entries left in processing by a previous run"
            );
        }

        let reconciled = self.reconcile_tasks()?;
        let reseeded = self.restore_state()?;
        Ok(RecoveryReport {
            recovered,
            reconciled,
            reseeded,
        })
    }

    /// Advance every unfinished task whose linked entry already reached
    /// `delivered`, `dead_letter` or `cancelled`. Repairs task updates lost
    /// to a crash between the queue write and the task write.
    ///
    /// Returns the number of tasks moved.
    pub fn reconcile_tasks(&self) -> Result<usize, QueueError> {
        let tasks = self
            .tasks
            .list()
            .map_err(|err| QueueError::Storage(err.into()))?;
        let moved = tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .filter(|task| self.reconcile_task(task))
            .count();
        if moved > 0 {
            tracing::warn!(moved, "Reconciled tasks with their queue entries");
        }
        Ok(moved)
    }

    /// Apply the outcome of `task`'s linked entry if the task missed it.
    /// Returns whether the task moved.
    fn reconcile_task(&self, task: &TaskState) -> bool {
        let entry = match self.store.get(&task.linked_queue_id) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    task_id = %task.task_id,
                    queue_id = %task.linked_queue_id,
                    "Cannot reconcile task with its queue entry: {err}"
                );
                return false;
            }
        };

        let result = match entry.status {
            QueueStatus::Delivered if task.status == TaskStatus::Queued => {
                self.tasks.on_delivered(&task.task_id, &entry.queue_id)
            }
            QueueStatus::DeadLetter | QueueStatus::Cancelled => {
                let reason = entry
                    .last_error
                    .as_deref()
                    .map_or_else(|| format!("queue entry {}", entry.status), str::to_string);
                self.tasks.on_delivery_abandoned(&task.task_id, &reason)
            }
            _ => return false,
        };

        match result {
            Ok(EventOutcome::Advanced { from, to }) => {
                tracing::info!(
                    task_id = %task.task_id,
                    queue_id = %entry.queue_id,
                    from = %from,
                    to = %to,
                    "Task caught up with its queue entry"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!(task_id = %task.task_id, "Failed to reconcile task: {err}");
                false
            }
        }
    }

    /// Rebuild in-memory dedup and throttle state from the durable queue:
    /// reservations for waiting entries, keys for recent deliveries and
    /// throttle slots for recent submissions. Leaves entries untouched, so a
    /// short-lived process may call it while a daemon is running.
    ///
    /// Only waiting entries and entries touched within the dedup or throttle
    /// window are read. Returns the number of dedup reservations and keys
    /// restored.
    pub fn restore_state(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut restored = 0;

        for status in [QueueStatus::Pending, QueueStatus::Processing] {
            let waiting = self.store.list(&QueueFilter::status(status))?;
            restored += self.dedup.seed_in_flight(&waiting);
        }

        let dedup_window = self.dedup.is_enabled().then(|| self.dedup.window());
        let throttle_window = self
            .throttle
            .is_enabled()
            .then(|| TimeDelta::from_std(self.throttle.window()).unwrap_or(TimeDelta::MAX));
        let Some(horizon) = dedup_window.max(throttle_window) else {
            return Ok(restored);
        };

        let recent = self.store.list(&QueueFilter {
            updated_since: Some(since(now, horizon)),
            ..QueueFilter::default()
        })?;

        if let Some(window) = dedup_window {
            let cutoff = since(now, window);
            for entry in recent
                .iter()
                .filter(|entry| entry.status == QueueStatus::Delivered && entry.updated_at >= cutoff)
            {
                self.dedup.confirm_delivered_at(&entry.message, entry.updated_at);
                restored += 1;
            }
        }

        if self.throttle.is_enabled() {
            let instant_now = Instant::now();
            let window = self.throttle.window();
            for entry in &recent {
                let Ok(age) = (now - entry.created_at).to_std() else {
                    continue;
                };
                if age >= window {
                    continue;
                }
                if let Some(at) = instant_now.checked_sub(age) {
                    self.throttle.allow_at(entry.recipient(), at);
                }
            }
        }

        tracing::info!(
            recent = recent.len(),
            restored,
            backend = self.store.name(),
            "Dispatcher state restored from queue"
        );
        Ok(restored)
    }

    /// Drop expired dedup keys and idle throttle windows.
    pub fn sweep(&self) -> usize {
        let expired = self.dedup.sweep();
        let idle = self.throttle.compact();
        if expired > 0 || idle > 0 {
            tracing::debug!(expired, idle, "Dedup and throttle state swept");
        }
        expired
    }

    // ── Delivery ────────────────────────────────────────────────

    /// Claim the oldest due entry (optionally for one recipient), deliver
    /// it and record the outcome. `None` when nothing is due.
    pub async fn process_next(
        &self,
        recipient: Option<&str>,
    ) -> Result<Option<ProcessOutcome>, QueueError> {
        let Some(entry) = self.store.claim_next(recipient, Utc::now())? else {
            return Ok(None);
        };
        self.journal.record(JournalKind::Claimed, &entry, None);

        let result = match self.router.route(&entry.message) {
            Ok(plan) => self.engine.deliver(&entry, &plan).await,
            Err(err) => Err(DeliveryError::permanent(err.to_string())),
        };

        match result {
            Ok(receipt) => self.on_delivered(&entry, receipt).map(Some),
            Err(error) => self.on_failed(&entry, error).map(Some),
        }
    }

    /// Process due entries until none is left. Requeued entries whose
    /// back-off has not elapsed are left for a later call.
    pub async fn drain(&self, recipient: Option<&str>) -> Result<Vec<ProcessOutcome>, QueueError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next(recipient).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn on_delivered(
        &self,
        claimed: &QueueEntry,
        receipt: DeliveryReceipt,
    ) -> Result<ProcessOutcome, QueueError> {
        let entry = self.store.mark_delivered(&claimed.queue_id)?;
        self.journal.record(
            JournalKind::Delivered,
            &entry,
            Some(receipt.transport.as_str()),
        );
        self.dedup.confirm_delivered(&entry.message);

        if let Some(task_id) = &entry.message.task_id {
            match self.tasks.on_delivered(task_id, &entry.queue_id) {
                Ok(_) => {}
                // Submission registers the task after enqueue and catches up.
                Err(FsmError::TaskNotFound { .. }) => tracing::debug!(
                    task_id = %task_id,
                    queue_id = %entry.queue_id,
                    "Task not registered yet at delivery"
                ),
                Err(err) => tracing::warn!(
                    task_id = %task_id,
                    queue_id = %entry.queue_id,
                    "Failed to advance task after delivery: {err}"
                ),
            }
        }

        tracing::info!(
            queue_id = %entry.queue_id,
            recipient = entry.recipient(),
            transport = %receipt.transport,
            attempts = entry.delivery_attempts,
            "Message delivered"
        );
        Ok(ProcessOutcome::Delivered { entry, receipt })
    }

    fn on_failed(
        &self,
        claimed: &QueueEntry,
        error: DeliveryError,
    ) -> Result<ProcessOutcome, QueueError> {
        let outcome = self.retry.handle_failure(&*self.store, &claimed.queue_id, &error)?;
        match outcome {
            RetryOutcome::Requeued {
                entry,
                next_attempt_at,
            } => {
                self.journal
                    .record(JournalKind::Failed, &entry, Some(error.detail()));
                self.journal.record(JournalKind::Requeued, &entry, None);
                Ok(ProcessOutcome::Requeued {
                    entry,
                    error,
                    next_attempt_at,
                })
            }
            RetryOutcome::DeadLettered(record) => {
                self.journal
                    .record(JournalKind::Failed, &record.entry, Some(error.detail()));
                self.journal.record(
                    JournalKind::DeadLettered,
                    &record.entry,
                    Some(&record.failure_reason),
                );
                self.dedup.release(&record.entry.message);
                if let Some(task_id) = &record.entry.message.task_id {
                    self.abandon_task(task_id, &record.failure_reason);
                }
                Ok(ProcessOutcome::DeadLettered(record))
            }
        }
    }

    fn abandon_task(&self, task_id: &str, reason: &str) {
        if let Err(err) = self.tasks.on_delivery_abandoned(task_id, reason) {
            tracing::warn!(task_id, "Failed to fail task after abandoned delivery: {err}");
        }
    }
}

fn fsm_storage(err: FsmError) -> SubmitError {
    SubmitError::Storage(err.into())
}
