use super::store::{QueueError, QueueStore};
use super::types::{
    DeadLetterFilter, DeadLetterRecord, Message, MessageCategory, MessagePriority, QueueEntry,
    QueueFilter, QueueStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS queue_entries (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id           TEXT NOT NULL UNIQUE,
    message_id         TEXT NOT NULL,
    sender             TEXT NOT NULL,
    recipient          TEXT NOT NULL,
    category           TEXT NOT NULL,
    priority           TEXT NOT NULL,
    content            TEXT NOT NULL,
    task_id            TEXT,
    message_created_at TEXT NOT NULL,
    status             TEXT NOT NULL,
    delivery_attempts  INTEGER NOT NULL DEFAULT 0,
    last_error         TEXT,
    error_history      TEXT NOT NULL DEFAULT '[]',
    next_attempt_at    TEXT NOT NULL,
    claimed_at         TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_status_due ON queue_entries(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_queue_recipient ON queue_entries(recipient, status);
CREATE INDEX IF NOT EXISTS idx_queue_updated ON queue_entries(updated_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    queue_id         TEXT PRIMARY KEY,
    recipient        TEXT NOT NULL,
    entry            TEXT NOT NULL,
    failure_reason   TEXT NOT NULL,
    total_attempts   INTEGER NOT NULL,
    dead_lettered_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_recipient ON dead_letters(recipient, dead_lettered_at);";

const ENTRY_COLUMNS: &str = "queue_id, message_id, sender, recipient, category, priority, content,
    task_id, message_created_at, status, delivery_attempts, last_error, error_history,
    next_attempt_at, claimed_at, created_at, updated_at";

impl rusqlite::types::FromSql for QueueStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

impl rusqlite::types::FromSql for MessageCategory {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

impl rusqlite::types::FromSql for MessagePriority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

/// Durable queue store backed by a single SQLite file.
///
/// Mutations run inside `BEGIN IMMEDIATE` transactions, so claims stay
/// exclusive even when several processes open the same database file.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteQueueStore {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create queue directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open queue DB: {}", path.display()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory queue DB")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set queue DB pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize queue schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin queue transaction")?;
        let out = f(&tx)?;
        tx.commit().context("Failed to commit queue transaction")?;
        Ok(out)
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Load, mutate and write back one entry in a single transaction.
    fn mutate<T>(
        &self,
        queue_id: &str,
        f: impl FnOnce(&mut QueueEntry) -> Result<T, QueueError>,
    ) -> Result<(QueueEntry, T), QueueError> {
        self.with_transaction(|tx| {
            let mut entry = load_entry(tx, queue_id)?;
            let previous = entry.status;
            let out = f(&mut entry)?;
            write_entry(tx, &entry, previous)?;
            Ok((entry, out))
        })
    }
}

impl QueueStore for SqliteQueueStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn enqueue(&self, message: Message) -> Result<QueueEntry, QueueError> {
        let entry = QueueEntry::new(message, Utc::now());
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO queue_entries (
                    queue_id, message_id, sender, recipient, category, priority, content,
                    task_id, message_created_at, status, delivery_attempts, last_error,
                    error_history, next_attempt_at, claimed_at, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, '[]', ?11, NULL, ?12, ?13)",
                params![
                    entry.queue_id,
                    entry.message.id,
                    entry.message.sender,
                    entry.message.recipient,
                    entry.message.category.as_str(),
                    entry.message.priority.as_str(),
                    entry.message.content,
                    entry.message.task_id,
                    fmt_ts(entry.message.created_at),
                    entry.status.as_str(),
                    fmt_ts(entry.next_attempt_at),
                    fmt_ts(entry.created_at),
                    fmt_ts(entry.updated_at),
                ],
            )
            .context("Failed to insert queue entry")?;
            Ok(())
        })?;
        Ok(entry)
    }

    fn claim_next(
        &self,
        recipient: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, QueueError> {
        self.with_transaction(|tx| {
            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM queue_entries
                         WHERE status = 'pending'
                           AND next_attempt_at <= ?1
                           AND (?2 IS NULL OR recipient = ?2)
                         ORDER BY seq ASC
                         LIMIT 1"
                    ),
                    params![fmt_ts(now), recipient],
                    map_entry_row,
                )
                .optional()
                .context("Failed to select next queue entry")?;

            let Some(mut entry) = candidate else {
                return Ok(None);
            };
            entry.apply_claim(now)?;
            write_entry(tx, &entry, QueueStatus::Pending)?;
            Ok(Some(entry))
        })
    }

    fn mark_delivered(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let (entry, ()) = self.mutate(queue_id, |entry| entry.apply_delivered(Utc::now()))?;
        Ok(entry)
    }

    fn mark_failed(&self, queue_id: &str, error: &str) -> Result<QueueEntry, QueueError> {
        let (entry, ()) = self.mutate(queue_id, |entry| entry.apply_failed(error, Utc::now()))?;
        Ok(entry)
    }

    fn requeue(
        &self,
        queue_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        let (entry, ()) = self.mutate(queue_id, |entry| {
            entry.apply_requeue(not_before, Utc::now())
        })?;
        Ok(entry)
    }

    fn dead_letter(&self, queue_id: &str, reason: &str) -> Result<DeadLetterRecord, QueueError> {
        self.with_transaction(|tx| {
            let mut entry = load_entry(tx, queue_id)?;
            let previous = entry.status;
            let record = entry.apply_dead_letter(reason, Utc::now())?;
            write_entry(tx, &entry, previous)?;
            tx.execute(
                "INSERT INTO dead_letters (
                    queue_id, recipient, entry, failure_reason, total_attempts, dead_lettered_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.queue_id,
                    record.recipient(),
                    serde_json::to_string(&record.entry)
                        .context("Failed to serialize dead-letter snapshot")?,
                    record.failure_reason,
                    record.total_attempts,
                    fmt_ts(record.dead_lettered_at),
                ],
            )
            .context("Failed to insert dead-letter record")?;
            Ok(record)
        })
    }

    fn cancel(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        let (entry, ()) = self.mutate(queue_id, |entry| entry.apply_cancel(Utc::now()))?;
        Ok(entry)
    }

    fn get(&self, queue_id: &str) -> Result<QueueEntry, QueueError> {
        self.with_connection(|conn| load_entry(conn, queue_id))
    }

    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, QueueError> {
        let limit = filter
            .effective_limit()
            .map_or(Ok(-1), i64::try_from)
            .context("Queue list limit overflows i64")?;
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR recipient = ?2)
                       AND (?3 IS NULL OR updated_at >= ?3)
                     ORDER BY seq ASC
                     LIMIT ?4"
                ))
                .context("Failed to prepare queue listing")?;
            let rows = stmt
                .query_map(
                    params![
                        filter.status.map(QueueStatus::as_str),
                        filter.recipient.as_deref(),
                        filter.updated_since.map(fmt_ts),
                        limit
                    ],
                    map_entry_row,
                )
                .context("Failed to list queue entries")?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.context("Failed to decode queue entry")?);
            }
            Ok(entries)
        })
    }

    fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRecord>, QueueError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT queue_id, entry, failure_reason, total_attempts, dead_lettered_at
                     FROM dead_letters
                     WHERE (?1 IS NULL OR recipient = ?1)
                       AND (?2 IS NULL OR dead_lettered_at >= ?2)
                       AND (?3 IS NULL OR dead_lettered_at < ?3)
                     ORDER BY dead_lettered_at ASC, queue_id ASC",
                )
                .context("Failed to prepare dead-letter listing")?;
            let rows = stmt
                .query_map(
                    params![
                        filter.recipient.as_deref(),
                        filter.since.map(fmt_ts),
                        filter.until.map(fmt_ts),
                    ],
                    |row| {
                        let entry_raw: String = row.get(1)?;
                        let entry: QueueEntry = serde_json::from_str(&entry_raw)
                            .context("Failed to parse dead-letter snapshot")
                            .map_err(sql_conversion_error)?;
                        Ok(DeadLetterRecord {
                            queue_id: row.get(0)?,
                            entry,
                            failure_reason: row.get(2)?,
                            total_attempts: row.get(3)?,
                            dead_lettered_at: parse_rfc3339(&row.get::<_, String>(4)?)
                                .map_err(sql_conversion_error)?,
                        })
                    },
                )
                .context("Failed to list dead letters")?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.context("Failed to decode dead-letter record")?);
            }
            Ok(records)
        })
    }

    fn purge_dead_letters(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        self.with_transaction(|tx| {
            let removed = tx
                .execute(
                    "DELETE FROM dead_letters WHERE dead_lettered_at < ?1",
                    params![fmt_ts(before)],
                )
                .context("Failed to purge dead letters")?;
            Ok(removed)
        })
    }

    fn recover_in_flight(&self) -> Result<Vec<String>, QueueError> {
        self.with_transaction(|tx| {
            let in_flight = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {ENTRY_COLUMNS} FROM queue_entries
                         WHERE status = 'processing'
                         ORDER BY seq ASC"
                    ))
                    .context("Failed to prepare in-flight scan")?;
                let rows = stmt
                    .query_map([], map_entry_row)
                    .context("Failed to scan in-flight entries")?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row.context("Failed to decode queue entry")?);
                }
                entries
            };

            let now = Utc::now();
            let mut recovered = Vec::with_capacity(in_flight.len());
            for mut entry in in_flight {
                entry.apply_recover(now)?;
                write_entry(tx, &entry, QueueStatus::Processing)?;
                recovered.push(entry.queue_id);
            }
            Ok(recovered)
        })
    }

    fn status_counts(&self) -> Result<HashMap<QueueStatus, usize>, QueueError> {
        self.with_connection(|conn| {
            let mut counts: HashMap<QueueStatus, usize> =
                QueueStatus::ALL.into_iter().map(|status| (status, 0)).collect();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")
                .context("Failed to prepare status counts")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, QueueStatus>(0)?, row.get::<_, i64>(1)?))
                })
                .context("Failed to count queue entries")?;
            for row in rows {
                let (status, count) = row.context("Failed to decode status count")?;
                counts.insert(status, usize::try_from(count).unwrap_or_default());
            }
            Ok(counts)
        })
    }
}

fn load_entry(conn: &Connection, queue_id: &str) -> Result<QueueEntry, QueueError> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ?1"),
        params![queue_id],
        map_entry_row,
    )
    .optional()
    .context("Failed to load queue entry")?
    .ok_or_else(|| QueueError::not_found(queue_id))
}

/// Write the mutable columns back, guarded by the status the entry was
/// loaded with so a concurrent writer cannot be silently overwritten.
fn write_entry(
    conn: &Connection,
    entry: &QueueEntry,
    expected: QueueStatus,
) -> Result<(), QueueError> {
    let error_history =
        serde_json::to_string(&entry.error_history).context("Failed to encode error history")?;
    let changed = conn
        .execute(
            "UPDATE queue_entries
             SET status = ?1, delivery_attempts = ?2, last_error = ?3, error_history = ?4,
                 next_attempt_at = ?5, claimed_at = ?6, updated_at = ?7
             WHERE queue_id = ?8 AND status = ?9",
            params![
                entry.status.as_str(),
                entry.delivery_attempts,
                entry.last_error,
                error_history,
                fmt_ts(entry.next_attempt_at),
                entry.claimed_at.map(fmt_ts),
                fmt_ts(entry.updated_at),
                entry.queue_id,
                expected.as_str(),
            ],
        )
        .context("Failed to update queue entry")?;

    if changed == 0 {
        return Err(QueueError::InvalidTransition {
            queue_id: entry.queue_id.clone(),
            from: expected,
            to: entry.status,
        });
    }
    Ok(())
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let error_history_raw: String = row.get(12)?;
    let error_history: Vec<String> = serde_json::from_str(&error_history_raw)
        .context("Failed to parse error history")
        .map_err(sql_conversion_error)?;
    let claimed_at_raw: Option<String> = row.get(14)?;

    Ok(QueueEntry {
        queue_id: row.get(0)?,
        message: Message {
            id: row.get(1)?,
            sender: row.get(2)?,
            recipient: row.get(3)?,
            category: row.get(4)?,
            priority: row.get(5)?,
            content: row.get(6)?,
            task_id: row.get(7)?,
            created_at: parse_rfc3339(&row.get::<_, String>(8)?).map_err(sql_conversion_error)?,
        },
        status: row.get(9)?,
        delivery_attempts: row.get(10)?,
        last_error: row.get(11)?,
        error_history,
        next_attempt_at: parse_rfc3339(&row.get::<_, String>(13)?)
            .map_err(sql_conversion_error)?,
        claimed_at: match claimed_at_raw {
            Some(raw) => Some(parse_rfc3339(&raw).map_err(sql_conversion_error)?),
            None => None,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(15)?).map_err(sql_conversion_error)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(16)?).map_err(sql_conversion_error)?,
    })
}

/// Fixed-width timestamps so lexical comparison in SQL matches time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in queue DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}
