//! Coordination throttler: sliding-window rate limit per recipient.

use crate::config::ThrottleConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct Throttler {
    /// Timestamps of admitted sends, per recipient, oldest first.
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    enabled: bool,
    max_messages: usize,
    window: Duration,
}

impl Throttler {
    pub fn new(enabled: bool, max_messages: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            enabled,
            max_messages: max_messages.max(1),
            window,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(
            config.enabled,
            config.max_messages,
            Duration::from_secs(config.window_secs),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a send to `recipient` if it fits in the window.
    pub fn allow(&self, recipient: &str) -> bool {
        self.allow_at(recipient, Instant::now())
    }

    pub fn allow_at(&self, recipient: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        let mut windows = self.windows.lock();
        let sends = windows.entry(recipient.to_string()).or_default();
        prune(sends, now, self.window);
        if sends.len() >= self.max_messages {
            return false;
        }
        // Restored slots can arrive out of order; keep the window sorted.
        let index = sends.partition_point(|sent| *sent <= now);
        sends.insert(index, now);
        true
    }

    /// Give back the slot recorded at `slot` for `recipient`, used when a
    /// submission is rejected after it was counted. Other callers' slots
    /// are left alone.
    pub fn refund(&self, recipient: &str, slot: Instant) {
        let mut windows = self.windows.lock();
        let Some(sends) = windows.get_mut(recipient) else {
            return;
        };
        if let Some(index) = sends.iter().rposition(|sent| *sent == slot) {
            sends.remove(index);
        }
    }

    /// Sends counted in the current window, without recording.
    pub fn count(&self, recipient: &str) -> usize {
        let mut windows = self.windows.lock();
        match windows.get_mut(recipient) {
            Some(sends) => {
                prune(sends, Instant::now(), self.window);
                sends.len()
            }
            None => 0,
        }
    }

    /// Forget recipients with no sends left in the window.
    pub fn compact(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, sends| {
            prune(sends, now, self.window);
            !sends.is_empty()
        });
        before - windows.len()
    }
}

fn prune(sends: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while sends
        .front()
        .is_some_and(|sent| now.saturating_duration_since(*sent) >= window)
    {
        sends.pop_front();
    }
}
