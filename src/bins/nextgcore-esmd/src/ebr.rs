//! EPS Bearer Context State Machine
//!
//! Network side bearer lifecycle (TS 24.301 6.1.3.3). A bearer enters one of
//! the `*_PENDING` states when the MME sends a network-initiated request and
//! leaves it on UE acknowledgement, UE reject or retransmission exhaustion.

use std::fmt;

use crate::context::{Ebi, EsmContext, PdnCid, Qos, TrafficFlowTemplate};
use crate::ebr_timer::RetransmissionRecord;
use crate::error::{EsmError, EsmResult};

// ============================================================================
// States and Events
// ============================================================================

/// EPS bearer context state (network side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EsmEbrState {
    #[default]
    Inactive,
    Active,
    InactivePending,
    ModifyPending,
    ActivePending,
}

impl EsmEbrState {
    /// Every state, in declaration order
    pub const ALL: [EsmEbrState; 5] = [
        EsmEbrState::Inactive,
        EsmEbrState::Active,
        EsmEbrState::InactivePending,
        EsmEbrState::ModifyPending,
        EsmEbrState::ActivePending,
    ];

    /// A network-initiated procedure is waiting for the UE
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EsmEbrState::InactivePending | EsmEbrState::ModifyPending | EsmEbrState::ActivePending
        )
    }
}

impl fmt::Display for EsmEbrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EsmEbrState::Inactive => write!(f, "INACTIVE"),
            EsmEbrState::Active => write!(f, "ACTIVE"),
            EsmEbrState::InactivePending => write!(f, "INACTIVE_PENDING"),
            EsmEbrState::ModifyPending => write!(f, "MODIFY_PENDING"),
            EsmEbrState::ActivePending => write!(f, "ACTIVE_PENDING"),
        }
    }
}

/// Bearer state machine input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EbrEvent {
    /// ACTIVATE DEFAULT/DEDICATED EPS BEARER CONTEXT REQUEST sent
    ActivateRequestSent,
    /// DEACTIVATE EPS BEARER CONTEXT REQUEST sent
    DeactivateRequestSent,
    /// MODIFY EPS BEARER CONTEXT REQUEST sent
    ModifyRequestSent,
    /// ACCEPT received from the UE
    AckReceived,
    /// REJECT received from the UE
    RejectReceived,
    /// Retransmission timer expired the maximum number of times
    RetriesExhausted,
    /// Context released locally, no signalling
    LocalRelease,
}

impl fmt::Display for EbrEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EbrEvent::ActivateRequestSent => write!(f, "ACTIVATE_REQUEST_SENT"),
            EbrEvent::DeactivateRequestSent => write!(f, "DEACTIVATE_REQUEST_SENT"),
            EbrEvent::ModifyRequestSent => write!(f, "MODIFY_REQUEST_SENT"),
            EbrEvent::AckReceived => write!(f, "ACK_RECEIVED"),
            EbrEvent::RejectReceived => write!(f, "REJECT_RECEIVED"),
            EbrEvent::RetriesExhausted => write!(f, "RETRIES_EXHAUSTED"),
            EbrEvent::LocalRelease => write!(f, "LOCAL_RELEASE"),
        }
    }
}

/// Transition table. `None` means the event is not allowed in `state`.
pub fn esm_ebr_next_state(state: EsmEbrState, event: EbrEvent) -> Option<EsmEbrState> {
    use EbrEvent::*;
    use EsmEbrState::*;

    match (state, event) {
        (_, LocalRelease) => Some(Inactive),

        (Inactive, ActivateRequestSent) => Some(ActivePending),
        (ActivePending, AckReceived) => Some(Active),
        (ActivePending, RejectReceived | RetriesExhausted) => Some(Inactive),

        (Active, DeactivateRequestSent) => Some(InactivePending),
        (InactivePending, AckReceived | RetriesExhausted) => Some(Inactive),

        (Active, ModifyRequestSent) => Some(ModifyPending),
        (ModifyPending, AckReceived) => Some(Active),
        (ModifyPending, RejectReceived | RetriesExhausted) => Some(Active),

        _ => None,
    }
}

// ============================================================================
// Bearer
// ============================================================================

/// Bearer parameters requested by a pending modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerModification {
    pub qos: Qos,
    pub tft: Option<TrafficFlowTemplate>,
}

/// EPS bearer context
#[derive(Debug)]
pub struct Bearer {
    /// Slot index, stable for the lifetime of the bearer
    pub(crate) bid: usize,
    pub(crate) ebi: Ebi,
    /// Owning PDN connection
    pub(crate) pdn_cid: PdnCid,
    pub(crate) qos: Qos,
    pub(crate) tft: Option<TrafficFlowTemplate>,
    pub(crate) state: EsmEbrState,
    /// Present iff `state` is a pending state
    pub(crate) timer: Option<RetransmissionRecord>,
    /// Present while a MODIFY EPS BEARER CONTEXT REQUEST is outstanding
    pub(crate) modify: Option<BearerModification>,
}

impl Bearer {
    pub(crate) fn new(
        bid: usize,
        ebi: Ebi,
        pdn_cid: PdnCid,
        qos: Qos,
        tft: Option<TrafficFlowTemplate>,
    ) -> Self {
        Self {
            bid,
            ebi,
            pdn_cid,
            qos,
            tft,
            state: EsmEbrState::Inactive,
            timer: None,
            modify: None,
        }
    }

    pub fn bid(&self) -> usize {
        self.bid
    }

    pub fn ebi(&self) -> Ebi {
        self.ebi
    }

    pub fn pdn_cid(&self) -> PdnCid {
        self.pdn_cid
    }

    pub fn qos(&self) -> &Qos {
        &self.qos
    }

    pub fn tft(&self) -> Option<&TrafficFlowTemplate> {
        self.tft.as_ref()
    }

    pub fn state(&self) -> EsmEbrState {
        self.state
    }

    /// Retransmission record of the pending procedure
    pub fn timer(&self) -> Option<&RetransmissionRecord> {
        self.timer.as_ref()
    }

    pub fn pending_modification(&self) -> Option<&BearerModification> {
        self.modify.as_ref()
    }
}

// ============================================================================
// Transitions
// ============================================================================

impl EsmContext {
    /// Apply `event` to the bearer and keep the context counters consistent.
    ///
    /// Only the ESM procedures drive this: they stop the retransmission timer
    /// before leaving a pending state and start it right after entering one.
    /// Leaving a pending state while a record is still held is refused and
    /// leaves the bearer unchanged.
    pub(crate) fn ebr_transition(&mut self, ebi: Ebi, event: EbrEvent) -> EsmResult<EsmEbrState> {
        let is_default = self.is_default_bearer(ebi);
        let ue_id = self.ue_id;

        let bearer = self.bearer_mut(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        let from = bearer.state;
        let to = esm_ebr_next_state(from, event).ok_or(EsmError::InvalidTransition { from, event })?;

        if !to.is_pending() && bearer.timer.is_some() {
            log::error!(
                "ESM FSM [ue_id={} ebi={}]: {} -> {} refused, retransmission timer running",
                ue_id,
                ebi,
                from,
                to
            );
            return Err(EsmError::TimerRunning(ebi));
        }

        if from == EsmEbrState::ModifyPending {
            if let Some(modify) = bearer.modify.take() {
                if event == EbrEvent::AckReceived {
                    bearer.qos = modify.qos;
                    bearer.tft = modify.tft;
                }
            }
        }

        log::debug!("ESM FSM [ue_id={} ebi={}]: {} -> {}", ue_id, ebi, from, to);
        bearer.state = to;

        let was_active = from == EsmEbrState::Active;
        let is_active = to == EsmEbrState::Active;
        if was_active != is_active {
            if is_active {
                self.n_active_ebrs += 1;
                if is_default {
                    self.n_active_pdns += 1;
                }
            } else {
                self.n_active_ebrs -= 1;
                if is_default {
                    self.n_active_pdns -= 1;
                }
            }
        }

        Ok(to)
    }
}

// ============================================================================
// Tests
// ============================================================================
