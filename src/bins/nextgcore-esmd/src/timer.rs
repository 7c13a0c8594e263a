//! ESM Timer Manager
//!
//! In-process one-shot timer facility used by the daemon event loop. Bearer
//! timers are armed through `TimerFacility` and collected with
//! `process_expired()` on every loop iteration.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::ebr_timer::{EbrTimerKey, TimerFacility, TimerHandle};

// ============================================================================
// Timer Entry
// ============================================================================

/// A timer entry stored in the timer manager
#[derive(Debug, Clone)]
pub struct EsmTimerEntry {
    /// Unique timer handle
    pub handle: TimerHandle,
    /// Bearer the timer belongs to
    pub key: EbrTimerKey,
    /// Absolute expiration time
    pub expires_at: Instant,
}

impl EsmTimerEntry {
    fn new(handle: TimerHandle, key: EbrTimerKey, duration: Duration) -> Self {
        Self {
            handle,
            key,
            expires_at: Instant::now() + duration,
        }
    }

    /// Check if the timer has expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Get remaining time until expiration
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// A fired timer, ready for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredTimer {
    pub handle: TimerHandle,
    pub key: EbrTimerKey,
}

// ============================================================================
// Timer Manager
// ============================================================================

pub struct EsmTimerMgr {
    /// Armed timers indexed by handle
    timers: RwLock<HashMap<TimerHandle, EsmTimerEntry>>,
    /// Monotonically increasing handle counter
    next_id: AtomicU64,
}

impl EsmTimerMgr {
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Remove all expired timers and return them, earliest first
    pub fn process_expired(&self) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();

        if let Ok(mut timers) = self.timers.write() {
            let mut fired: Vec<(Instant, TimerHandle)> = timers
                .values()
                .filter(|entry| entry.is_expired())
                .map(|entry| (entry.expires_at, entry.handle))
                .collect();
            fired.sort();

            for (_, handle) in fired {
                if let Some(entry) = timers.remove(&handle) {
                    expired.push(ExpiredTimer {
                        handle: entry.handle,
                        key: entry.key,
                    });
                }
            }
        }

        expired
    }

    /// Get the duration until the next timer expires.
    /// Returns `None` if there are no armed timers.
    pub fn next_expiration(&self) -> Option<Duration> {
        self.timers
            .read()
            .ok()
            .and_then(|timers| timers.values().map(EsmTimerEntry::remaining).min())
    }

    /// Compute the sleep duration for the next event loop iteration, bounded
    /// by `max_interval`
    pub fn compute_poll_interval(&self, max_interval: Duration) -> Duration {
        match self.next_expiration() {
            Some(next) if next < max_interval => {
                if next.is_zero() {
                    Duration::from_millis(1)
                } else {
                    next
                }
            }
            _ => max_interval,
        }
    }

    /// Get the number of armed timers
    pub fn count(&self) -> usize {
        self.timers.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Check if a timer is armed
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.timers
            .read()
            .map(|t| t.contains_key(&handle))
            .unwrap_or(false)
    }

    /// Disarm every timer
    pub fn clear(&self) {
        if let Ok(mut timers) = self.timers.write() {
            timers.clear();
        }
        log::debug!("ESM timer: all timers cleared");
    }
}

impl TimerFacility for EsmTimerMgr {
    fn arm(&self, key: EbrTimerKey, duration: Duration) -> TimerHandle {
        let handle = self.next_id.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut timers) = self.timers.write() {
            timers.insert(handle, EsmTimerEntry::new(handle, key, duration));
        }

        log::debug!("ESM timer armed: handle={handle} key={key:?} duration={duration:?}");
        handle
    }

    fn disarm(&self, handle: TimerHandle) {
        if let Ok(mut timers) = self.timers.write() {
            if timers.remove(&handle).is_some() {
                log::debug!("ESM timer disarmed: handle={handle}");
            }
        }
    }
}

impl Default for EsmTimerMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EsmTimerMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsmTimerMgr")
            .field("armed", &self.count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
