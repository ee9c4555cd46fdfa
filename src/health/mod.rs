//! Health Monitor and daemon component registry.
//!
//! [`HealthMonitor::scan`] inspects the queue store without mutating it and
//! reports counts by status, stuck `processing` entries and aged `pending`
//! entries. Remediation stays an explicit operator action.

use crate::config::{Config, HealthConfig};
use crate::queue::{QueueError, QueueFilter, QueueStatus, QueueStore};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

// ── Component registry ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

fn registry() -> &'static HealthRegistry {
    static REGISTRY: OnceLock<HealthRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| HealthRegistry {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn upsert_component<F>(component: &str, update: F)
where
    F: FnOnce(&mut ComponentHealth),
{
    let mut components = registry().components.lock();
    let now = now_rfc3339();
    let entry = components
        .entry(component.to_string())
        .or_insert_with(|| ComponentHealth {
            status: "starting".into(),
            updated_at: now.clone(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        });
    update(entry);
    entry.updated_at = now;
}

pub fn mark_component_ok(component: &str) {
    upsert_component(component, |entry| {
        entry.status = "ok".into();
        entry.last_ok = Some(now_rfc3339());
        entry.last_error = None;
    });
}

pub fn mark_component_error(component: &str, error: impl ToString) {
    let err = error.to_string();
    upsert_component(component, move |entry| {
        entry.status = "error".into();
        entry.last_error = Some(err);
    });
}

pub fn bump_component_restart(component: &str) {
    upsert_component(component, |entry| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

pub fn snapshot() -> HealthSnapshot {
    let registry = registry();
    HealthSnapshot {
        pid: std::process::id(),
        updated_at: now_rfc3339(),
        uptime_seconds: registry.started_at.elapsed().as_secs(),
        components: registry.components.lock().clone(),
    }
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|_| {
        serde_json::json!({
            "status": "error",
            "message": "failed to serialize health snapshot"
        })
    })
}

// ── Queue scan ──────────────────────────────────────────────────

/// One entry the monitor flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedEntry {
    pub queue_id: String,
    pub recipient: String,
    pub status: QueueStatus,
    /// When the entry entered its current state.
    pub since: DateTime<Utc>,
    pub age_secs: i64,
    pub delivery_attempts: u32,
}

impl FlaggedEntry {
    fn new(entry: &crate::queue::QueueEntry, since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            queue_id: entry.queue_id.clone(),
            recipient: entry.recipient().to_string(),
            status: entry.status,
            since,
            age_secs: (now - since).num_seconds().max(0),
            delivery_attempts: entry.delivery_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub scanned_at: DateTime<Utc>,
    pub counts: BTreeMap<String, usize>,
    pub dead_letter_records: usize,
    /// `processing` longer than the stuck threshold.
    pub stuck: Vec<FlaggedEntry>,
    /// `pending` older than the age threshold.
    pub aged_pending: Vec<FlaggedEntry>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.stuck.is_empty() && self.aged_pending.is_empty()
    }

    pub fn count(&self, status: QueueStatus) -> usize {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn stuck_ids(&self) -> Vec<&str> {
        self.stuck.iter().map(|e| e.queue_id.as_str()).collect()
    }
}

pub struct HealthMonitor {
    store: Arc<dyn QueueStore>,
    stuck_after: TimeDelta,
    pending_max_age: TimeDelta,
    snapshot_path: Option<PathBuf>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn QueueStore>, stuck_after: Duration, pending_max_age: Duration) -> Self {
        Self {
            store,
            stuck_after: TimeDelta::from_std(stuck_after).unwrap_or(TimeDelta::MAX),
            pending_max_age: TimeDelta::from_std(pending_max_age).unwrap_or(TimeDelta::MAX),
            snapshot_path: None,
        }
    }

    pub fn from_config(store: Arc<dyn QueueStore>, config: &Config) -> Self {
        let health: &HealthConfig = &config.health;
        Self::new(
            store,
            Duration::from_secs(health.stuck_after_secs),
            Duration::from_secs(health.pending_max_age_secs),
        )
        .with_snapshot_path(config.health_snapshot_path())
    }

    #[must_use]
    pub fn with_snapshot_path(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    pub fn scan(&self) -> Result<HealthReport, QueueError> {
        self.scan_at(Utc::now())
    }

    pub fn scan_at(&self, now: DateTime<Utc>) -> Result<HealthReport, QueueError> {
        let counts = self
            .store
            .status_counts()?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        let stuck: Vec<FlaggedEntry> = self
            .store
            .list(&QueueFilter::status(QueueStatus::Processing))?
            .iter()
            .filter_map(|entry| {
                let since = entry.claimed_at.unwrap_or(entry.updated_at);
                (now - since > self.stuck_after).then(|| FlaggedEntry::new(entry, since, now))
            })
            .collect();

        let aged_pending: Vec<FlaggedEntry> = self
            .store
            .list(&QueueFilter::status(QueueStatus::Pending))?
            .iter()
            .filter(|entry| now - entry.created_at > self.pending_max_age)
            .map(|entry| FlaggedEntry::new(entry, entry.created_at, now))
            .collect();

        let dead_letter_records = self
            .store
            .list_dead_letters(&crate::queue::DeadLetterFilter::default())?
            .len();

        for entry in &stuck {
            tracing::warn!(
                queue_id = %entry.queue_id,
                recipient = %entry.recipient,
                age_secs = entry.age_secs,
                "Queue entry stuck in processing"
            );
        }
        if !aged_pending.is_empty() {
            tracing::warn!(
                count = aged_pending.len(),
                "Pending entries older than the age threshold"
            );
        }

        Ok(HealthReport {
            scanned_at: now,
            counts,
            dead_letter_records,
            stuck,
            aged_pending,
        })
    }

    /// Scan, then write the report next to the daemon component registry.
    pub async fn scan_and_publish(&self) -> Result<HealthReport> {
        let report = self.scan().context("Health scan failed")?;
        if let Some(path) = &self.snapshot_path {
            write_snapshot(path, &report).await?;
        }
        Ok(report)
    }
}

async fn write_snapshot(path: &Path, report: &HealthReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = serde_json::json!({
        "queue": report,
        "daemon": snapshot_json(),
    });
    let data = serde_json::to_vec_pretty(&body).context("Failed to encode health snapshot")?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueueStore, Message, MessageCategory};
    use tempfile::TempDir;

    fn seeded() -> (Arc<InMemoryQueueStore>, String) {
        let store = Arc::new(InMemoryQueueStore::new());
        for recipient in ["Worker-1", "Worker-2"] {
            store
                .enqueue(Message::new(
                    "Coordinator",
                    recipient,
                    MessageCategory::CaptainToAgent,
                    "run checks",
                ))
                .unwrap();
        }
        let claimed = store
            .claim_next(Some("Worker-1"), Utc::now())
            .unwrap()
            .unwrap();
        (store, claimed.queue_id)
    }

    #[test]
    fn component_registry_tracks_restarts() {
        mark_component_ok("health-test-worker");
        mark_component_error("health-test-worker", "boom");
        bump_component_restart("health-test-worker");

        let snap = snapshot();
        let component = snap.components.get("health-test-worker").unwrap();
        assert_eq!(component.status, "error");
        assert_eq!(component.last_error.as_deref(), Some("boom"));
        assert_eq!(component.restart_count, 1);
        assert!(snapshot_json()["components"]["health-test-worker"].is_object());
    }

    #[test]
    fn fresh_queue_is_healthy() {
        let (store, _) = seeded();
        let monitor = HealthMonitor::new(store, Duration::from_secs(300), Duration::from_secs(900));
        let report = monitor.scan().unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.count(QueueStatus::Pending), 1);
        assert_eq!(report.count(QueueStatus::Processing), 1);
        assert_eq!(report.count(QueueStatus::Delivered), 0);
    }

    #[test]
    fn old_entries_are_flagged_without_mutation() {
        let (store, claimed) = seeded();
        let monitor = HealthMonitor::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(900),
        );
        let later = Utc::now() + TimeDelta::hours(1);
        let report = monitor.scan_at(later).unwrap();

        assert_eq!(report.stuck_ids(), vec![claimed.as_str()]);
        assert_eq!(report.aged_pending.len(), 1);
        assert_eq!(report.aged_pending[0].recipient, "Worker-2");
        assert!(!report.is_healthy());
        assert_eq!(store.get(&claimed).unwrap().status, QueueStatus::Processing);
    }

    #[tokio::test]
    async fn publish_writes_snapshot_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue").join("health.json");
        let (store, _) = seeded();
        let monitor = HealthMonitor::new(store, Duration::from_secs(300), Duration::from_secs(900))
            .with_snapshot_path(path.clone());

        monitor.scan_and_publish().await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["queue"]["counts"]["pending"], 1);
        assert!(json["daemon"]["components"].is_object());
    }
}
