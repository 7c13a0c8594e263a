//! EPS Bearer Retransmission Timers
//!
//! T3485 (activate default/dedicated), T3486 (modify) and T3495 (deactivate)
//! guard every network-initiated bearer procedure. The last encoded request
//! is kept so that each expiry resends exactly the same bytes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::EsmTimerConfig;
use crate::context::{Ebi, MmeUeS1apId};
use crate::ebr::{Bearer, EsmEbrState};
use crate::emm_sap::{EmmAsSap, EmmSap, SapSender};
use crate::error::{EsmError, EsmResult};

// ============================================================================
// Timer IDs
// ============================================================================

/// ESM retransmission timer identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EsmTimerId {
    /// T3485 - Activate default/dedicated EPS bearer context request sent
    T3485,
    /// T3486 - Modify EPS bearer context request sent
    T3486,
    /// T3495 - Deactivate EPS bearer context request sent
    T3495,
}

impl EsmTimerId {
    /// Get timer name
    pub fn name(&self) -> &'static str {
        match self {
            Self::T3485 => "ESM_TIMER_T3485",
            Self::T3486 => "ESM_TIMER_T3486",
            Self::T3495 => "ESM_TIMER_T3495",
        }
    }

    /// Timer guarding a pending state
    pub fn for_state(state: EsmEbrState) -> Option<Self> {
        match state {
            EsmEbrState::ActivePending => Some(Self::T3485),
            EsmEbrState::ModifyPending => Some(Self::T3486),
            EsmEbrState::InactivePending => Some(Self::T3495),
            EsmEbrState::Inactive | EsmEbrState::Active => None,
        }
    }
}

// ============================================================================
// Timer Facility
// ============================================================================

/// Identifies the bearer a timer expiry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EbrTimerKey {
    pub ue_id: MmeUeS1apId,
    pub ebi: Ebi,
    pub timer_id: EsmTimerId,
}

/// Handle of an armed one-shot timer
pub type TimerHandle = u64;

/// One-shot timer service. Expiries are delivered back to the ESM dispatcher
/// as `EsmEvent::Timer` carrying the handle and key given to `arm`.
pub trait TimerFacility: Send + Sync {
    fn arm(&self, key: EbrTimerKey, duration: Duration) -> TimerHandle;
    fn disarm(&self, handle: TimerHandle);
}

// ============================================================================
// Retransmission Record
// ============================================================================

/// Retransmission state of a pending bearer procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmissionRecord {
    pub ue_id: MmeUeS1apId,
    pub ebi: Ebi,
    pub timer_id: EsmTimerId,
    /// Number of retransmissions so far
    pub count: u32,
    /// Encoded NAS message, resent verbatim
    pub msg: Bytes,
    /// Currently armed timer
    pub handle: TimerHandle,
}

impl RetransmissionRecord {
    pub fn key(&self) -> EbrTimerKey {
        EbrTimerKey {
            ue_id: self.ue_id,
            ebi: self.ebi,
            timer_id: self.timer_id,
        }
    }
}

/// Result of a timer expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbrTimerOutcome {
    /// Message resent, `count` retransmissions so far
    Retransmitted { count: u32 },
    /// Maximum reached; record destroyed, procedure must be abandoned
    RetriesExhausted,
    /// No record on the bearer
    NotRunning,
}

// ============================================================================
// Retransmission Timer Subsystem
// ============================================================================

/// Starts, stops and services the retransmission timer of each bearer
pub struct EbrTimers<F: TimerFacility> {
    facility: Arc<F>,
    config: EsmTimerConfig,
}

impl<F: TimerFacility> EbrTimers<F> {
    pub fn new(facility: Arc<F>, config: EsmTimerConfig) -> Self {
        Self { facility, config }
    }

    pub fn config(&self) -> &EsmTimerConfig {
        &self.config
    }

    pub fn facility(&self) -> &Arc<F> {
        &self.facility
    }

    /// Arm the timer of a bearer that just entered a pending state and keep
    /// `msg` for retransmission. A running timer is stopped first.
    pub fn start(&self, ue_id: MmeUeS1apId, bearer: &mut Bearer, msg: Bytes) -> EsmResult<()> {
        let timer_id = EsmTimerId::for_state(bearer.state).ok_or(EsmError::NoTimerForState {
            ebi: bearer.ebi,
            state: bearer.state,
        })?;

        self.stop(bearer);

        let key = EbrTimerKey {
            ue_id,
            ebi: bearer.ebi,
            timer_id,
        };
        let duration = self.config.duration(timer_id);
        let handle = self.facility.arm(key, duration);

        log::debug!(
            "ESM-PROC  - Timer {} ({:?}) started for EBI {} (ue_id={})",
            timer_id.name(),
            duration,
            bearer.ebi,
            ue_id
        );

        bearer.timer = Some(RetransmissionRecord {
            ue_id,
            ebi: bearer.ebi,
            timer_id,
            count: 0,
            msg,
            handle,
        });
        Ok(())
    }

    /// Handle expiry of the bearer's timer: resend and re-arm while below the
    /// retry limit, otherwise destroy the record.
    pub fn on_expiry<S: EmmAsSap>(&self, bearer: &mut Bearer, sap: &SapSender<S>) -> EbrTimerOutcome {
        let Some(record) = bearer.timer.as_mut() else {
            return EbrTimerOutcome::NotRunning;
        };

        if record.count >= self.config.max_retries {
            log::warn!(
                "ESM-PROC  - {} expired {} times for EBI {} (ue_id={}), procedure abandoned",
                record.timer_id.name(),
                record.count + 1,
                record.ebi,
                record.ue_id
            );
            bearer.timer = None;
            return EbrTimerOutcome::RetriesExhausted;
        }

        record.count += 1;
        log::warn!(
            "ESM-PROC  - {} expired for EBI {} (ue_id={}), retransmission counter = {}",
            record.timer_id.name(),
            record.ebi,
            record.ue_id,
            record.count
        );

        if let Err(e) = sap.send(Some(EmmSap::unitdata_req(record.ue_id, record.msg.clone()))) {
            log::error!(
                "ESM-PROC  - Retransmission failed for EBI {} (ue_id={}): {}",
                record.ebi,
                record.ue_id,
                e
            );
        }

        record.handle = self
            .facility
            .arm(record.key(), self.config.duration(record.timer_id));

        EbrTimerOutcome::Retransmitted { count: record.count }
    }

    /// Disarm and destroy the bearer's record. Returns false if none existed.
    pub fn stop(&self, bearer: &mut Bearer) -> bool {
        match bearer.timer.take() {
            Some(record) => {
                self.facility.disarm(record.handle);
                log::debug!(
                    "ESM-PROC  - Timer {} stopped for EBI {} (ue_id={})",
                    record.timer_id.name(),
                    record.ebi,
                    record.ue_id
                );
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Qos;
    use crate::emm_sap::EmmSapPrimitive;
    use crate::test_util::{ManualTimers, RecordingSap};

    fn pending_bearer(state: EsmEbrState) -> Bearer {
        let mut bearer = Bearer::new(0, 5, 0, Qos::with_qci(9, 15), None);
        bearer.state = state;
        bearer
    }

    fn setup(max_retries: u32) -> (EbrTimers<ManualTimers>, Arc<ManualTimers>, SapSender<RecordingSap>, Arc<RecordingSap>) {
        let facility = Arc::new(ManualTimers::default());
        let config = EsmTimerConfig {
            max_retries,
            ..Default::default()
        };
        let timers = EbrTimers::new(facility.clone(), config);
        let sap = Arc::new(RecordingSap::default());
        (timers, facility, SapSender::new(sap.clone()), sap)
    }

    #[test]
    fn test_timer_id_for_state() {
        assert_eq!(EsmTimerId::for_state(EsmEbrState::ActivePending), Some(EsmTimerId::T3485));
        assert_eq!(EsmTimerId::for_state(EsmEbrState::ModifyPending), Some(EsmTimerId::T3486));
        assert_eq!(EsmTimerId::for_state(EsmEbrState::InactivePending), Some(EsmTimerId::T3495));
        assert_eq!(EsmTimerId::for_state(EsmEbrState::Active), None);
        assert_eq!(EsmTimerId::T3485.name(), "ESM_TIMER_T3485");
    }

    #[test]
    fn test_start_creates_record() {
        let (timers, facility, _, _) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::ModifyPending);

        timers.start(7, &mut bearer, Bytes::from_static(b"\x27\x01")).unwrap();

        let record = bearer.timer().unwrap();
        assert_eq!(record.ue_id, 7);
        assert_eq!(record.ebi, 5);
        assert_eq!(record.timer_id, EsmTimerId::T3486);
        assert_eq!(record.count, 0);
        assert_eq!(record.msg, Bytes::from_static(b"\x27\x01"));
        assert!(facility.is_armed(record.handle));
        assert_eq!(facility.armed_count(), 1);
    }

    #[test]
    fn test_start_replaces_running_timer() {
        let (timers, facility, _, _) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::ActivePending);

        timers.start(1, &mut bearer, Bytes::from_static(b"first")).unwrap();
        let first = bearer.timer().unwrap().handle;
        timers.start(1, &mut bearer, Bytes::from_static(b"second")).unwrap();

        assert!(!facility.is_armed(first));
        assert_eq!(facility.armed_count(), 1);
        assert_eq!(bearer.timer().unwrap().msg, Bytes::from_static(b"second"));
    }

    #[test]
    fn test_stop_idempotent() {
        let (timers, facility, _, _) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::InactivePending);

        assert!(!timers.stop(&mut bearer));
        timers.start(1, &mut bearer, Bytes::from_static(b"x")).unwrap();
        assert!(timers.stop(&mut bearer));
        assert!(!timers.stop(&mut bearer));
        assert!(!timers.stop(&mut bearer));
        assert!(bearer.timer().is_none());
        assert_eq!(facility.armed_count(), 0);
        assert_eq!(bearer.state(), EsmEbrState::InactivePending);
    }

    #[test]
    fn test_on_expiry_retransmits_identical_bytes() {
        let (timers, facility, sap_sender, sap) = setup(3);
        let mut bearer = pending_bearer(EsmEbrState::ActivePending);
        let msg = Bytes::from_static(b"\x52\x05\xc1\x01");

        timers.start(9, &mut bearer, msg.clone()).unwrap();
        for n in 1..=3 {
            assert_eq!(
                timers.on_expiry(&mut bearer, &sap_sender),
                EbrTimerOutcome::Retransmitted { count: n }
            );
            assert!(facility.is_armed(bearer.timer().unwrap().handle));
        }
        assert_eq!(timers.on_expiry(&mut bearer, &sap_sender), EbrTimerOutcome::RetriesExhausted);
        assert!(bearer.timer().is_none());

        let sent = sap.sent();
        assert_eq!(sent.len(), 3);
        for primitive in sent {
            assert_eq!(primitive.primitive, EmmSapPrimitive::EmmesmUnitdataReq);
            assert_eq!(primitive.ue_id, 9);
            assert_eq!(primitive.nas_msg, Some(msg.clone()));
        }
    }

    #[test]
    fn test_on_expiry_zero_retries() {
        let (timers, _, sap_sender, sap) = setup(0);
        let mut bearer = pending_bearer(EsmEbrState::ActivePending);

        timers.start(1, &mut bearer, Bytes::from_static(b"x")).unwrap();
        assert_eq!(timers.on_expiry(&mut bearer, &sap_sender), EbrTimerOutcome::RetriesExhausted);
        assert!(sap.sent().is_empty());
    }

    #[test]
    fn test_on_expiry_without_record() {
        let (timers, _, sap_sender, _) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::Active);
        assert_eq!(timers.on_expiry(&mut bearer, &sap_sender), EbrTimerOutcome::NotRunning);
    }

    #[test]
    fn test_on_expiry_send_failure_keeps_record() {
        let (timers, _, sap_sender, sap) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::ActivePending);

        timers.start(1, &mut bearer, Bytes::from_static(b"x")).unwrap();
        sap.set_fail(true);
        assert_eq!(
            timers.on_expiry(&mut bearer, &sap_sender),
            EbrTimerOutcome::Retransmitted { count: 1 }
        );
        assert_eq!(bearer.timer().unwrap().count, 1);
    }

    #[test]
    fn test_start_outside_pending_state() {
        let (timers, facility, _, _) = setup(4);
        let mut bearer = pending_bearer(EsmEbrState::Active);

        assert_eq!(
            timers.start(1, &mut bearer, Bytes::from_static(b"x")),
            Err(EsmError::NoTimerForState {
                ebi: 5,
                state: EsmEbrState::Active
            })
        );
        assert!(bearer.timer().is_none());
        assert_eq!(facility.armed_count(), 0);
    }
}
