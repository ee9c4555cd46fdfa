//! End-to-end queue lifecycle through the public API.

use async_trait::async_trait;
use courier::config::{AgentConfig, BackoffStrategy, Config, TransportKind};
use courier::dedup::{AdmitReason, DedupService};
use courier::delivery::{
    DeliveryEngine, InboxTransport, Transport, TransportError, TransportReceipt,
};
use courier::fsm::{EventOutcome, TaskEvent, TaskEventKind, TaskStatus};
use courier::observability::{load_events, JournalKind};
use courier::queue::{
    DeadLetterFilter, InMemoryQueueStore, Message, MessageCategory, MessagePriority, QueueEntry,
    QueueStatus, QueueStore, SqliteQueueStore,
};
use courier::retry::{RetryHandler, RetryPolicy};
use courier::router::{CategoryPolicies, DeliveryPlan, MessageRouter, Recipient, RecipientRegistry};
use courier::throttle::Throttler;
use courier::{Dispatcher, ProcessOutcome, SubmitError};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Inbox transport that fails a fixed number of times before writing.
struct FlakyInbox {
    failures_left: AtomicU32,
    calls: AtomicU32,
    inner: InboxTransport,
}

impl FlakyInbox {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            inner: InboxTransport::new(),
        })
    }
}

#[async_trait]
impl Transport for FlakyInbox {
    fn kind(&self) -> TransportKind {
        TransportKind::Inbox
    }

    async fn send(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
    ) -> Result<TransportReceipt, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::unavailable(
                TransportKind::Inbox,
                "simulated outage",
            ));
        }
        self.inner.send(entry, plan).await
    }
}

fn router(inbox_root: &Path) -> MessageRouter {
    let mut registry = RecipientRegistry::new();
    for name in ["Worker-1", "Worker-2"] {
        registry.insert(Recipient {
            name: name.into(),
            inbox_dir: inbox_root.join(name).join("inbox"),
            coordinates: None,
        });
    }
    MessageRouter::new(registry, CategoryPolicies::builtin(), false)
}

fn immediate_retries(max_attempts: u32) -> RetryHandler {
    RetryHandler::new(RetryPolicy {
        max_attempts,
        backoff: BackoffStrategy::Fixed,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    })
}

fn dispatcher(
    store: Arc<dyn QueueStore>,
    inbox_root: &Path,
    transport: Arc<FlakyInbox>,
    max_attempts: u32,
) -> Dispatcher {
    Dispatcher::new(
        store,
        router(inbox_root),
        DeliveryEngine::new().with_transport(transport, Duration::from_secs(5)),
    )
    .with_retry(immediate_retries(max_attempts))
}

fn run_checks() -> Message {
    Message::new(
        "Coordinator",
        "Worker-1",
        MessageCategory::CaptainToAgent,
        "run checks",
    )
}

#[tokio::test]
async fn two_failures_then_success_counts_three_attempts() {
    let tmp = TempDir::new().unwrap();
    let transport = FlakyInbox::new(2);
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        transport.clone(),
        3,
    );

    let entry = dispatcher.submit(run_checks()).unwrap();
    assert_eq!(dispatcher.status(&entry.queue_id).unwrap(), QueueStatus::Pending);

    let outcomes = dispatcher.drain(None).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[2], ProcessOutcome::Delivered { .. }));

    let delivered = dispatcher.get(&entry.queue_id).unwrap();
    assert_eq!(delivered.status, QueueStatus::Delivered);
    assert_eq!(delivered.delivery_attempts, 3);
    assert_eq!(delivered.error_history.len(), 2);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    // One file per entry, however many attempts it took.
    let inbox = tmp.path().join("Worker-1").join("inbox");
    let files: Vec<_> = std::fs::read_dir(&inbox).unwrap().collect();
    assert_eq!(files.len(), 1);
    let body = std::fs::read_to_string(inbox.join(format!("{}.md", entry.queue_id))).unwrap();
    assert!(body.contains("run checks"));
}

#[tokio::test]
async fn always_failing_transport_dead_letters_after_max_attempts() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        FlakyInbox::new(u32::MAX),
        4,
    );

    let entry = dispatcher.submit(run_checks()).unwrap();
    let outcomes = dispatcher.drain(None).await.unwrap();
    assert_eq!(outcomes.len(), 4);

    let ProcessOutcome::DeadLettered(record) = &outcomes[3] else {
        panic!("expected dead letter, got {:?}", outcomes[3]);
    };
    assert_eq!(record.total_attempts, 4);
    assert_eq!(record.entry.error_history.len(), 4);
    assert!(record.failure_reason.contains("simulated outage"));
    assert_eq!(
        dispatcher.status(&entry.queue_id).unwrap(),
        QueueStatus::DeadLetter
    );

    let by_recipient = dispatcher
        .list_dead_letters(&DeadLetterFilter {
            recipient: Some("Worker-1".into()),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(by_recipient.len(), 1);
    let other = dispatcher
        .list_dead_letters(&DeadLetterFilter {
            recipient: Some("Worker-2".into()),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn duplicate_is_rejected_until_window_expires() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        FlakyInbox::new(0),
        3,
    )
    .with_dedup(DedupService::new(true, Duration::from_millis(300), 100));

    let first = dispatcher.submit(run_checks()).unwrap();
    assert!(matches!(
        dispatcher.submit(run_checks()),
        Err(SubmitError::Duplicate {
            reason: AdmitReason::DuplicateInFlight,
            ..
        })
    ));

    dispatcher.drain(None).await.unwrap();
    assert_eq!(dispatcher.status(&first.queue_id).unwrap(), QueueStatus::Delivered);
    assert!(matches!(
        dispatcher.submit(run_checks()),
        Err(SubmitError::Duplicate {
            reason: AdmitReason::DuplicateWithinWindow,
            ..
        })
    ));

    // Exactly one delivered entry for the duplicated content.
    let delivered = dispatcher
        .list(&courier::queue::QueueFilter::status(QueueStatus::Delivered))
        .unwrap();
    assert_eq!(delivered.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    dispatcher.submit(run_checks()).unwrap();
}

#[tokio::test]
async fn urgent_messages_skip_deduplication() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        FlakyInbox::new(0),
        3,
    );
    dispatcher.submit(run_checks()).unwrap();
    dispatcher
        .submit(run_checks().with_priority(MessagePriority::Urgent))
        .unwrap();
    assert_eq!(dispatcher.drain(None).await.unwrap().len(), 2);
}

#[test]
fn sixth_message_in_window_is_throttled() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        FlakyInbox::new(0),
        3,
    )
    .with_throttle(Throttler::new(true, 5, Duration::from_secs(60)));

    for n in 1..=5 {
        dispatcher
            .submit(Message::new(
                "Worker-2",
                "Worker-1",
                MessageCategory::AgentToAgent,
                format!("reply {n}"),
            ))
            .unwrap();
    }
    let sixth = dispatcher.submit(Message::new(
        "Worker-2",
        "Worker-1",
        MessageCategory::AgentToAgent,
        "reply 6",
    ));
    assert!(matches!(sixth, Err(SubmitError::Throttled { ref recipient }) if recipient == "Worker-1"));

    // Other recipients keep their own window.
    dispatcher
        .submit(Message::new(
            "Worker-1",
            "Worker-2",
            MessageCategory::AgentToAgent,
            "reply 1",
        ))
        .unwrap();
}

#[tokio::test]
async fn interrupted_claim_is_recovered_after_restart() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("queue.db");

    let queue_id = {
        let store = SqliteQueueStore::open(&db).unwrap();
        let entry = store.enqueue(run_checks()).unwrap();
        let claimed = store.claim_next(None, chrono::Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Processing);
        entry.queue_id
    };

    let store: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::open(&db).unwrap());
    let dispatcher = dispatcher(store, tmp.path(), FlakyInbox::new(0), 3);
    let report = dispatcher.recover().unwrap();
    assert_eq!(report.recovered, vec![queue_id.clone()]);
    assert_eq!(dispatcher.status(&queue_id).unwrap(), QueueStatus::Pending);

    dispatcher.drain(None).await.unwrap();
    let entry = dispatcher.get(&queue_id).unwrap();
    assert_eq!(entry.status, QueueStatus::Delivered);
    assert_eq!(entry.delivery_attempts, 1);
}

#[tokio::test]
async fn task_tracks_delivery_and_ignores_noise() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = dispatcher(
        Arc::new(InMemoryQueueStore::new()),
        tmp.path(),
        FlakyInbox::new(0),
        3,
    );

    dispatcher
        .submit(run_checks().with_task("task-42"))
        .unwrap();
    assert_eq!(dispatcher.task("task-42").unwrap().status, TaskStatus::Queued);

    dispatcher.drain(None).await.unwrap();
    assert_eq!(
        dispatcher.task("task-42").unwrap().status,
        TaskStatus::Dispatched
    );

    dispatcher
        .task_event(&TaskEvent::new("task-42", TaskEventKind::Acknowledged))
        .unwrap();
    let noise = dispatcher
        .task_event(&TaskEvent::new("task-42", TaskEventKind::Activity).with_payload("thinking..."))
        .unwrap();
    assert_eq!(
        noise,
        EventOutcome::Ignored {
            status: TaskStatus::Acknowledged
        }
    );

    let done = TaskEvent::new("task-42", TaskEventKind::Completed);
    assert!(matches!(
        dispatcher.task_event(&done).unwrap(),
        EventOutcome::Advanced {
            to: TaskStatus::Completed,
            ..
        }
    ));
    assert!(matches!(
        dispatcher.task_event(&done).unwrap(),
        EventOutcome::Discarded { .. }
    ));

    let task = dispatcher.task("task-42").unwrap();
    let completions = task
        .history
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn configured_dispatcher_delivers_to_inbox_and_journals() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::for_dir(tmp.path());
    config.agents = vec![AgentConfig::new("Worker-1")];

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.recover().unwrap();
    let entry = dispatcher.submit(run_checks()).unwrap();
    dispatcher.drain(None).await.unwrap();

    let inbox = config.agent_inbox_dir(&config.agents[0]);
    assert!(inbox.join(format!("{}.md", entry.queue_id)).exists());

    let kinds: Vec<JournalKind> = load_events(&config.journal_path(), Some(&entry.queue_id), 0)
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            JournalKind::Enqueued,
            JournalKind::Claimed,
            JournalKind::Delivered
        ]
    );

    // A second process sees the delivery and keeps rejecting the duplicate.
    let restarted = Dispatcher::from_config(&config).unwrap();
    restarted.restore_state().unwrap();
    assert!(matches!(
        restarted.submit(run_checks()),
        Err(SubmitError::Duplicate {
            reason: AdmitReason::DuplicateWithinWindow,
            ..
        })
    ));
}

#[tokio::test]
async fn task_catches_up_with_delivery_that_outran_it() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::for_dir(tmp.path());
    config.agents = vec![AgentConfig::new("Worker-1")];

    let first = Dispatcher::from_config(&config).unwrap();
    let entry = first.submit(run_checks().with_task("task-1")).unwrap();

    // The entry reached `delivered` but the process stopped before the task moved.
    let store = first.store();
    let claimed = store.claim_next(None, chrono::Utc::now()).unwrap().unwrap();
    assert_eq!(claimed.queue_id, entry.queue_id);
    store.mark_delivered(&entry.queue_id).unwrap();
    assert_eq!(first.task("task-1").unwrap().status, TaskStatus::Queued);
    drop(first);

    let restarted = Dispatcher::from_config(&config).unwrap();
    let report = restarted.recover().unwrap();
    assert_eq!(report.reconciled, 1);
    assert!(restarted.drain(None).await.unwrap().is_empty());
    assert_eq!(restarted.task("task-1").unwrap().status, TaskStatus::Dispatched);

    restarted
        .task_event(&TaskEvent::new("task-1", TaskEventKind::Acknowledged))
        .unwrap();
    let done = restarted
        .task_event(&TaskEvent::new("task-1", TaskEventKind::Completed))
        .unwrap();
    assert!(matches!(done, EventOutcome::Advanced { .. }));
    assert_eq!(restarted.task("task-1").unwrap().status, TaskStatus::Completed);
}

#[test]
fn task_fails_after_restart_when_its_entry_was_dead_lettered() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::for_dir(tmp.path());
    config.agents = vec![AgentConfig::new("Worker-1")];

    let first = Dispatcher::from_config(&config).unwrap();
    let entry = first.submit(run_checks().with_task("task-7")).unwrap();
    let store = first.store();
    store.claim_next(None, chrono::Utc::now()).unwrap();
    store.mark_failed(&entry.queue_id, "inbox unreachable").unwrap();
    store.dead_letter(&entry.queue_id, "inbox unreachable").unwrap();
    drop(first);

    let restarted = Dispatcher::from_config(&config).unwrap();
    assert_eq!(restarted.recover().unwrap().reconciled, 1);
    let task = restarted.task("task-7").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.linked_queue_id, entry.queue_id);
}
