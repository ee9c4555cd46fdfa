use crate::config::Config;
use crate::queue::{QueueEntry, QueueStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Queue transition recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Enqueued,
    Claimed,
    Delivered,
    Failed,
    Requeued,
    DeadLettered,
    Cancelled,
    Recovered,
}

/// One line of `journal.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub id: String,
    pub timestamp: String,
    pub kind: JournalKind,
    pub queue_id: String,
    pub message_id: String,
    pub recipient: String,
    pub status: QueueStatus,
    pub delivery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JournalEvent {
    pub fn for_entry(kind: JournalKind, entry: &QueueEntry, detail: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            queue_id: entry.queue_id.clone(),
            message_id: entry.message.id.clone(),
            recipient: entry.recipient().to_string(),
            status: entry.status,
            delivery_attempts: entry.delivery_attempts,
            task_id: entry.message.task_id.clone(),
            detail: detail.map(str::to_string),
        }
    }
}

/// Append-only JSONL record of queue transitions for external audit tooling.
///
/// A disabled journal accepts records and drops them. Write failures are
/// logged and never fail the transition that produced them.
///
/// Rolling trim (`max_entries > 0`) rewrites the file and is only safe with
/// a single writing process. The daemon owns the trim; short-lived CLI
/// commands open the journal with [`QueueJournal::append_only`].
pub struct QueueJournal {
    path: Option<PathBuf>,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl QueueJournal {
    pub fn new(path: PathBuf, max_entries: usize) -> Self {
        Self {
            path: Some(path),
            max_entries,
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            max_entries: 0,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        if config.journal.enabled {
            Self::new(config.journal_path(), config.journal.max_entries)
        } else {
            Self::disabled()
        }
    }

    /// Append without ever rewriting the file, whatever `max_entries` says.
    #[must_use]
    pub fn append_only(mut self) -> Self {
        self.max_entries = 0;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, kind: JournalKind, entry: &QueueEntry, detail: Option<&str>) {
        if self.path.is_none() {
            return;
        }
        let event = JournalEvent::for_entry(kind, entry, detail);
        if let Err(err) = self.append(&event) {
            tracing::warn!(queue_id = %entry.queue_id, "Failed to write journal event: {err:#}");
        }
    }

    fn append(&self, event: &JournalEvent) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let line = serde_json::to_string(event).context("Failed to encode journal event")?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        if self.max_entries > 0 {
            trim_to_last_entries(path, self.max_entries)?;
        }
        Ok(())
    }
}

fn trim_to_last_entries(path: &Path, max_entries: usize) -> Result<()> {
    let raw = fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() <= max_entries {
        return Ok(());
    }

    let kept = &lines[lines.len() - max_entries..];
    let mut rewritten = kept.join("\n");
    rewritten.push('\n');

    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, rewritten)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }

    fs::rename(tmp, path)?;
    Ok(())
}

/// Read journal events, oldest first, optionally for one queue entry.
/// `limit` keeps the newest N; `0` keeps all.
pub fn load_events(path: &Path, queue_id: Option<&str>, limit: usize) -> Result<Vec<JournalEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut events = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEvent>(trimmed) {
            Ok(event) => {
                if queue_id.is_none_or(|id| event.queue_id == id) {
                    events.push(event);
                }
            }
            Err(err) => tracing::warn!("Skipping malformed journal line: {err}"),
        }
    }

    if limit > 0 && events.len() > limit {
        events = events.split_off(events.len() - limit);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, MessageCategory};
    use tempfile::TempDir;

    fn entry(recipient: &str) -> QueueEntry {
        QueueEntry::new(
            Message::new("Coordinator", recipient, MessageCategory::CaptainToAgent, "go")
                .with_task("task-1"),
            Utc::now(),
        )
    }

    #[test]
    fn records_are_appended_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue").join("journal.jsonl");
        let journal = QueueJournal::new(path.clone(), 0);

        let first = entry("Worker-1");
        let second = entry("Worker-2");
        journal.record(JournalKind::Enqueued, &first, None);
        journal.record(JournalKind::Enqueued, &second, None);
        journal.record(JournalKind::Failed, &first, Some("offline"));

        let all = load_events(&path, None, 0).unwrap();
        assert_eq!(all.len(), 3);

        let for_first = load_events(&path, Some(&first.queue_id), 0).unwrap();
        assert_eq!(for_first.len(), 2);
        assert_eq!(for_first[1].kind, JournalKind::Failed);
        assert_eq!(for_first[1].detail.as_deref(), Some("offline"));
        assert_eq!(for_first[0].task_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn rolling_journal_keeps_newest_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let journal = QueueJournal::new(path.clone(), 2);
        let entry = entry("Worker-1");

        for kind in [JournalKind::Enqueued, JournalKind::Claimed, JournalKind::Delivered] {
            journal.record(kind, &entry, None);
        }

        let events = load_events(&path, None, 0).unwrap();
        let kinds: Vec<JournalKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JournalKind::Claimed, JournalKind::Delivered]);
    }

    #[test]
    fn append_only_journal_never_trims() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let journal = QueueJournal::new(path.clone(), 2).append_only();
        let entry = entry("Worker-1");

        for kind in [JournalKind::Enqueued, JournalKind::Claimed, JournalKind::Delivered] {
            journal.record(kind, &entry, None);
        }

        assert_eq!(load_events(&path, None, 0).unwrap().len(), 3);
    }

    #[test]
    fn disabled_journal_writes_nothing() {
        let journal = QueueJournal::disabled();
        journal.record(JournalKind::Enqueued, &entry("Worker-1"), None);
        assert!(journal.path().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn journal_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        QueueJournal::new(path.clone(), 0).record(JournalKind::Enqueued, &entry("Worker-1"), None);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
