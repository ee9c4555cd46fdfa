//! Concurrent claimers must never receive the same entry twice.

use async_trait::async_trait;
use chrono::Utc;
use courier::config::TransportKind;
use courier::delivery::{DeliveryEngine, Transport, TransportError, TransportReceipt};
use courier::queue::{
    InMemoryQueueStore, Message, MessageCategory, QueueEntry, QueueFilter, QueueStatus,
    QueueStore, SqliteQueueStore,
};
use courier::router::{CategoryPolicies, DeliveryPlan, MessageRouter, Recipient, RecipientRegistry};
use courier::Dispatcher;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ENTRIES: usize = 200;
const CLAIMERS: usize = 8;

fn fill(store: &dyn QueueStore) {
    for n in 0..ENTRIES {
        store
            .enqueue(Message::new(
                "Coordinator",
                format!("Worker-{}", n % 4),
                MessageCategory::CaptainToAgent,
                format!("job {n}"),
            ))
            .unwrap();
    }
}

fn claim_all_from_threads(store: &Arc<dyn QueueStore>) -> Vec<String> {
    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let store = Arc::clone(store);
            std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(entry) = store.claim_next(None, Utc::now()).unwrap() {
                    claimed.push(entry.queue_id);
                }
                claimed
            })
        })
        .collect();

    handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect()
}

fn assert_claimed_once(store: &dyn QueueStore, claimed: &[String]) {
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), ENTRIES, "every entry claimed");
    assert_eq!(unique.len(), ENTRIES, "no entry claimed twice");

    let processing = store
        .list(&QueueFilter::status(QueueStatus::Processing))
        .unwrap();
    assert_eq!(processing.len(), ENTRIES);
    assert!(store
        .list(&QueueFilter::status(QueueStatus::Pending))
        .unwrap()
        .is_empty());
}

#[test]
fn memory_store_claims_each_entry_once() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    fill(&*store);
    let claimed = claim_all_from_threads(&store);
    assert_claimed_once(&*store, &claimed);
}

#[test]
fn shared_sqlite_store_claims_each_entry_once() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn QueueStore> =
        Arc::new(SqliteQueueStore::open(&tmp.path().join("queue.db")).unwrap());
    fill(&*store);
    let claimed = claim_all_from_threads(&store);
    assert_claimed_once(&*store, &claimed);
}

#[test]
fn separate_sqlite_connections_claim_each_entry_once() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("queue.db");
    fill(&SqliteQueueStore::open(&db).unwrap());

    // One connection per claimer, as separate processes would have.
    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let db = db.clone();
            std::thread::spawn(move || {
                let store = SqliteQueueStore::open(&db).unwrap();
                let mut claimed = Vec::new();
                while let Some(entry) = store.claim_next(None, Utc::now()).unwrap() {
                    claimed.push(entry.queue_id);
                }
                claimed
            })
        })
        .collect();
    let claimed: Vec<String> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    assert_claimed_once(&SqliteQueueStore::open(&db).unwrap(), &claimed);
}

/// Records every queue id it is asked to send.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Inbox
    }

    async fn send(
        &self,
        entry: &QueueEntry,
        _plan: &DeliveryPlan,
    ) -> Result<TransportReceipt, TransportError> {
        tokio::task::yield_now().await;
        self.sent.lock().push(entry.queue_id.clone());
        Ok(TransportReceipt {
            transport: TransportKind::Inbox,
            location: None,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_deliver_each_entry_once() {
    let tmp = TempDir::new().unwrap();
    let mut registry = RecipientRegistry::new();
    for n in 0..4 {
        registry.insert(Recipient {
            name: format!("Worker-{n}"),
            inbox_dir: tmp.path().join(format!("Worker-{n}")),
            coordinates: None,
        });
    }
    let transport = Arc::new(RecordingTransport::default());
    let store: Arc<dyn QueueStore> =
        Arc::new(SqliteQueueStore::open(&tmp.path().join("queue.db")).unwrap());
    fill(&*store);

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        MessageRouter::new(registry, CategoryPolicies::builtin(), false),
        DeliveryEngine::new().with_transport(transport.clone(), Duration::from_secs(5)),
    ));

    let workers: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.drain(None).await.unwrap().len() })
        })
        .collect();
    let mut processed = 0;
    for worker in workers {
        processed += worker.await.unwrap();
    }

    assert_eq!(processed, ENTRIES);
    let sent = transport.sent.lock();
    let unique: HashSet<&String> = sent.iter().collect();
    assert_eq!(sent.len(), ENTRIES);
    assert_eq!(unique.len(), ENTRIES);
    assert_eq!(
        dispatcher
            .list(&QueueFilter::status(QueueStatus::Delivered))
            .unwrap()
            .len(),
        ENTRIES
    );
}
