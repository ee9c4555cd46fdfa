//! Deduplication service.
//!
//! Fingerprints `(recipient, normalized content)` and suppresses resubmission
//! while a matching message is in flight or was delivered within the
//! retention window. Thread-safe, in-memory, TTL-based with lazy expiry and
//! soonest-to-expire eviction at capacity.

use crate::config::DedupConfig;
use crate::queue::{Message, MessagePriority, QueueEntry, QueueStatus};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Hex SHA-256 over recipient and normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(recipient: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(recipient.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_content(content).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn for_message(message: &Message) -> Self {
        Self::of(&message.recipient, &message.content)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whitespace-insensitive, case-preserving.
fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Record of a delivered fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupKey {
    pub fingerprint: Fingerprint,
    pub recipient: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmitReason {
    Fresh,
    UrgentBypass,
    Disabled,
    DuplicateWithinWindow,
    DuplicateInFlight,
}

impl AdmitReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::UrgentBypass => "urgent-bypass",
            Self::Disabled => "disabled",
            Self::DuplicateWithinWindow => "duplicate-within-window",
            Self::DuplicateInFlight => "duplicate-in-flight",
        }
    }
}

impl fmt::Display for AdmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`DedupService::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    pub reason: AdmitReason,
    pub fingerprint: Fingerprint,
}

impl Admission {
    fn new(admitted: bool, reason: AdmitReason, fingerprint: Fingerprint) -> Self {
        Self {
            admitted,
            reason,
            fingerprint,
        }
    }
}

#[derive(Debug, Default)]
struct DedupState {
    keys: HashMap<Fingerprint, DedupKey>,
    /// Fingerprint -> id of the message holding the reservation.
    reservations: HashMap<Fingerprint, String>,
}

pub struct DedupService {
    state: Mutex<DedupState>,
    enabled: bool,
    window: TimeDelta,
    max_keys: usize,
}

impl DedupService {
    pub fn new(enabled: bool, window: Duration, max_keys: usize) -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            enabled,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            max_keys: max_keys.max(1),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(
            config.enabled,
            Duration::from_secs(config.window_secs),
            config.max_keys,
        )
    }

    pub fn admit(&self, message: &Message) -> Admission {
        self.admit_at(message, Utc::now())
    }

    /// Gate a submission. A fresh fingerprint is reserved for `message.id`
    /// until [`confirm_delivered`](Self::confirm_delivered) or
    /// [`release`](Self::release).
    pub fn admit_at(&self, message: &Message, now: DateTime<Utc>) -> Admission {
        let fingerprint = Fingerprint::for_message(message);
        if !self.enabled {
            return Admission::new(true, AdmitReason::Disabled, fingerprint);
        }
        if message.priority == MessagePriority::Urgent {
            return Admission::new(true, AdmitReason::UrgentBypass, fingerprint);
        }

        let mut state = self.state.lock();
        if let Some(key) = state.keys.get(&fingerprint) {
            if now > key.expires_at {
                state.keys.remove(&fingerprint);
            } else {
                return Admission::new(false, AdmitReason::DuplicateWithinWindow, fingerprint);
            }
        }
        if state.reservations.contains_key(&fingerprint) {
            return Admission::new(false, AdmitReason::DuplicateInFlight, fingerprint);
        }

        state
            .reservations
            .insert(fingerprint.clone(), message.id.clone());
        Admission::new(true, AdmitReason::Fresh, fingerprint)
    }

    pub fn confirm_delivered(&self, message: &Message) {
        self.confirm_delivered_at(message, Utc::now());
    }

    /// Record a `DedupKey` for a delivered message and drop its reservation.
    pub fn confirm_delivered_at(&self, message: &Message, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let fingerprint = Fingerprint::for_message(message);
        let mut state = self.state.lock();
        remove_owned_reservation(&mut state, &fingerprint, &message.id);

        if state.keys.len() >= self.max_keys && !state.keys.contains_key(&fingerprint) {
            state.keys.retain(|_, key| key.expires_at >= now);
        }
        if state.keys.len() >= self.max_keys && !state.keys.contains_key(&fingerprint) {
            if let Some(soonest) = state
                .keys
                .values()
                .min_by_key(|key| key.expires_at)
                .map(|key| key.fingerprint.clone())
            {
                state.keys.remove(&soonest);
            }
        }

        let expires_at = now
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.keys.insert(
            fingerprint.clone(),
            DedupKey {
                fingerprint,
                recipient: message.recipient.clone(),
                first_seen_at: now,
                expires_at,
            },
        );
    }

    /// Drop the reservation held by `message` (dead-lettered, cancelled or
    /// never enqueued). Reservations held by other messages are untouched.
    pub fn release(&self, message: &Message) {
        let fingerprint = Fingerprint::for_message(message);
        remove_owned_reservation(&mut self.state.lock(), &fingerprint, &message.id);
    }

    /// Re-reserve fingerprints for entries still waiting for delivery.
    /// Returns how many reservations were added.
    pub fn seed_in_flight<'a>(&self, entries: impl IntoIterator<Item = &'a QueueEntry>) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut state = self.state.lock();
        let mut seeded = 0;
        for entry in entries {
            if !matches!(entry.status, QueueStatus::Pending | QueueStatus::Processing)
                || entry.message.priority == MessagePriority::Urgent
            {
                continue;
            }
            let fingerprint = Fingerprint::for_message(&entry.message);
            if let std::collections::hash_map::Entry::Vacant(slot) =
                state.reservations.entry(fingerprint)
            {
                slot.insert(entry.message.id.clone());
                seeded += 1;
            }
        }
        seeded
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Evict expired keys. Returns the number removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.keys.len();
        state.keys.retain(|_, key| key.expires_at >= now);
        before - state.keys.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<DedupKey> {
        self.state.lock().keys.get(fingerprint).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }
}

fn remove_owned_reservation(state: &mut DedupState, fingerprint: &Fingerprint, owner: &str) {
    if state
        .reservations
        .get(fingerprint)
        .is_some_and(|holder| holder == owner)
    {
        state.reservations.remove(fingerprint);
    }
}
