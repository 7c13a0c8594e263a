//! Test doubles for the timer facility and the EMM-AS layer

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::ebr_timer::{EbrTimerKey, TimerFacility, TimerHandle};
use crate::emm_sap::{EmmAsError, EmmAsSap, EmmSap};

/// Records every primitive; fails on demand
#[derive(Debug, Default)]
pub struct RecordingSap {
    sent: Mutex<Vec<EmmSap>>,
    fail: AtomicBool,
}

impl RecordingSap {
    pub fn sent(&self) -> Vec<EmmSap> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl EmmAsSap for RecordingSap {
    fn send(&self, sap: &EmmSap) -> Result<(), EmmAsError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmmAsError::S1ContextRemoved(sap.ue_id));
        }
        self.sent.lock().unwrap().push(sap.clone());
        Ok(())
    }
}

/// Timer facility that never fires by itself
#[derive(Debug, Default)]
pub struct ManualTimers {
    armed: Mutex<HashMap<TimerHandle, (EbrTimerKey, Duration)>>,
    next_id: AtomicU64,
}

impl ManualTimers {
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.lock().unwrap().contains_key(&handle)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap().len()
    }

    pub fn duration(&self, handle: TimerHandle) -> Option<Duration> {
        self.armed.lock().unwrap().get(&handle).map(|(_, d)| *d)
    }

    /// Consume an armed timer as if it had expired
    pub fn fire(&self, handle: TimerHandle) -> Option<EbrTimerKey> {
        self.armed.lock().unwrap().remove(&handle).map(|(key, _)| key)
    }
}

impl TimerFacility for ManualTimers {
    fn arm(&self, key: EbrTimerKey, duration: Duration) -> TimerHandle {
        let handle = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.armed.lock().unwrap().insert(handle, (key, duration));
        handle
    }

    fn disarm(&self, handle: TimerHandle) {
        self.armed.lock().unwrap().remove(&handle);
    }
}
