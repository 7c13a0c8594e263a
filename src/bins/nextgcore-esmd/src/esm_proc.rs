//! ESM Procedures (network side)
//!
//! Network-initiated EPS bearer context procedures (TS 24.301 6.4). Each
//! request is sent through EMM-AS, moves the bearer into a pending state and
//! starts its retransmission timer. UE answers and timer expiries conclude
//! the procedure.

use bytes::Bytes;

use crate::cause::EsmCause;
use crate::context::{Ebi, EsmContext, MmeUeS1apId, PdnCid, Qos, TrafficFlowTemplate};
use crate::ebr::{esm_ebr_next_state, BearerModification, EbrEvent, EsmEbrState};
use crate::ebr_timer::{EbrTimerOutcome, EbrTimers, TimerFacility};
use crate::emm_sap::{EmmAsSap, EmmSap, SapSender};
use crate::error::{EsmError, EsmResult};

/// Which bearers a procedure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BearerKind {
    Default,
    Dedicated,
    Any,
}

pub struct EsmProc<F: TimerFacility, S: EmmAsSap> {
    timers: EbrTimers<F>,
    sap: SapSender<S>,
}

impl<F: TimerFacility, S: EmmAsSap> EsmProc<F, S> {
    pub fn new(timers: EbrTimers<F>, sap: SapSender<S>) -> Self {
        Self { timers, sap }
    }

    pub fn timers(&self) -> &EbrTimers<F> {
        &self.timers
    }

    pub fn sap(&self) -> &SapSender<S> {
        &self.sap
    }

    // ========================================================================
    // Default EPS bearer context activation (6.4.1)
    // ========================================================================

    /// Send ACTIVATE DEFAULT EPS BEARER CONTEXT REQUEST
    pub fn default_eps_bearer_context_request(&self, ctx: &mut EsmContext, ebi: Ebi, msg: Bytes) -> EsmResult<()> {
        self.check(ctx, ebi, BearerKind::Default, EbrEvent::ActivateRequestSent)?;
        self.send(ctx.ue_id(), &msg)?;
        self.enter_pending(ctx, ebi, EbrEvent::ActivateRequestSent, msg)
    }

    /// ACTIVATE DEFAULT EPS BEARER CONTEXT ACCEPT received
    pub fn default_eps_bearer_context_accept(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        self.conclude(ctx, ebi, BearerKind::Default, EsmEbrState::ActivePending, EbrEvent::AckReceived)?;
        Ok(())
    }

    /// ACTIVATE DEFAULT EPS BEARER CONTEXT REJECT received; the PDN
    /// connection is released.
    pub fn default_eps_bearer_context_reject(&self, ctx: &mut EsmContext, ebi: Ebi, cause: EsmCause) -> EsmResult<()> {
        log_reject("ACTIVATE DEFAULT EPS BEARER CONTEXT REJECT", ctx.ue_id(), ebi, cause);
        self.conclude(ctx, ebi, BearerKind::Default, EsmEbrState::ActivePending, EbrEvent::RejectReceived)?;
        self.release_inactive(ctx, ebi)
    }

    // ========================================================================
    // Dedicated EPS bearer context activation (6.4.2)
    // ========================================================================

    /// Send ACTIVATE DEDICATED EPS BEARER CONTEXT REQUEST
    pub fn dedicated_eps_bearer_context_request(&self, ctx: &mut EsmContext, ebi: Ebi, msg: Bytes) -> EsmResult<()> {
        self.check(ctx, ebi, BearerKind::Dedicated, EbrEvent::ActivateRequestSent)?;
        self.send(ctx.ue_id(), &msg)?;
        self.enter_pending(ctx, ebi, EbrEvent::ActivateRequestSent, msg)
    }

    pub fn dedicated_eps_bearer_context_accept(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        self.conclude(ctx, ebi, BearerKind::Dedicated, EsmEbrState::ActivePending, EbrEvent::AckReceived)?;
        Ok(())
    }

    /// ACTIVATE DEDICATED EPS BEARER CONTEXT REJECT received; the bearer is
    /// released.
    pub fn dedicated_eps_bearer_context_reject(&self, ctx: &mut EsmContext, ebi: Ebi, cause: EsmCause) -> EsmResult<()> {
        log_reject("ACTIVATE DEDICATED EPS BEARER CONTEXT REJECT", ctx.ue_id(), ebi, cause);
        self.conclude(ctx, ebi, BearerKind::Dedicated, EsmEbrState::ActivePending, EbrEvent::RejectReceived)?;
        self.release_inactive(ctx, ebi)
    }

    // ========================================================================
    // EPS bearer context modification (6.4.3)
    // ========================================================================

    /// Send MODIFY EPS BEARER CONTEXT REQUEST. The new parameters take effect
    /// when the UE accepts.
    pub fn modify_eps_bearer_context_request(
        &self,
        ctx: &mut EsmContext,
        ebi: Ebi,
        qos: Qos,
        tft: Option<TrafficFlowTemplate>,
        msg: Bytes,
    ) -> EsmResult<()> {
        self.check(ctx, ebi, BearerKind::Any, EbrEvent::ModifyRequestSent)?;
        self.send(ctx.ue_id(), &msg)?;
        if let Some(bearer) = ctx.bearer_mut(ebi) {
            bearer.modify = Some(BearerModification { qos, tft });
        }
        self.enter_pending(ctx, ebi, EbrEvent::ModifyRequestSent, msg)
    }

    pub fn modify_eps_bearer_context_accept(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        self.conclude(ctx, ebi, BearerKind::Any, EsmEbrState::ModifyPending, EbrEvent::AckReceived)?;
        Ok(())
    }

    /// MODIFY EPS BEARER CONTEXT REJECT received; the bearer keeps its
    /// previous parameters.
    pub fn modify_eps_bearer_context_reject(&self, ctx: &mut EsmContext, ebi: Ebi, cause: EsmCause) -> EsmResult<()> {
        log_reject("MODIFY EPS BEARER CONTEXT REJECT", ctx.ue_id(), ebi, cause);
        self.conclude(ctx, ebi, BearerKind::Any, EsmEbrState::ModifyPending, EbrEvent::RejectReceived)?;
        Ok(())
    }

    // ========================================================================
    // EPS bearer context deactivation (6.4.4)
    // ========================================================================

    /// Send DEACTIVATE EPS BEARER CONTEXT REQUEST. Deactivating a default
    /// bearer releases its whole PDN connection once concluded.
    pub fn deactivate_eps_bearer_context_request(&self, ctx: &mut EsmContext, ebi: Ebi, msg: Bytes) -> EsmResult<()> {
        self.check(ctx, ebi, BearerKind::Any, EbrEvent::DeactivateRequestSent)?;
        self.send(ctx.ue_id(), &msg)?;
        self.enter_pending(ctx, ebi, EbrEvent::DeactivateRequestSent, msg)
    }

    pub fn deactivate_eps_bearer_context_accept(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        self.conclude(ctx, ebi, BearerKind::Any, EsmEbrState::InactivePending, EbrEvent::AckReceived)?;
        self.release_inactive(ctx, ebi)
    }

    // ========================================================================
    // Timer expiry
    // ========================================================================

    /// Retransmission timer of `ebi` expired: resend, or abandon the
    /// procedure once the retry limit is reached.
    pub fn eps_bearer_context_timeout(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<EbrTimerOutcome> {
        let bearer = ctx.bearer_mut(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        let from = bearer.state();
        let outcome = self.timers.on_expiry(bearer, &self.sap);

        if outcome == EbrTimerOutcome::RetriesExhausted {
            ctx.ebr_transition(ebi, EbrEvent::RetriesExhausted)?;
            match from {
                EsmEbrState::ActivePending | EsmEbrState::InactivePending => {
                    self.release_inactive(ctx, ebi)?;
                }
                _ => {}
            }
        }

        Ok(outcome)
    }

    // ========================================================================
    // Local release
    // ========================================================================

    /// Release a PDN connection without signalling: stop every timer, force
    /// its bearers to INACTIVE and free them.
    pub fn pdn_connection_release_local(&self, ctx: &mut EsmContext, cid: PdnCid) -> EsmResult<()> {
        let ebis = ctx
            .pdn(cid)
            .map(|pdn| pdn.bearers().to_vec())
            .ok_or(EsmError::PdnNotFound(cid))?;

        for ebi in ebis {
            self.release_bearer_local(ctx, ebi)?;
        }
        ctx.release_connection(cid)
    }

    /// Release every PDN connection of the UE (implicit detach)
    pub fn esm_context_release(&self, ctx: &mut EsmContext) -> EsmResult<()> {
        let cids: Vec<PdnCid> = ctx.pdns().map(|pdn| pdn.cid()).collect();
        for cid in cids {
            self.pdn_connection_release_local(ctx, cid)?;
        }
        ctx.take_esm_proc_data();

        log::debug!("ESM-PROC  - ESM context released (ue_id={})", ctx.ue_id());
        Ok(())
    }

    fn release_bearer_local(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        let bearer = ctx.bearer_mut(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        self.timers.stop(bearer);
        ctx.ebr_transition(ebi, EbrEvent::LocalRelease)?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Validate a procedure before anything is sent or changed
    fn check(&self, ctx: &EsmContext, ebi: Ebi, kind: BearerKind, event: EbrEvent) -> EsmResult<EsmEbrState> {
        let bearer = ctx.bearer(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        let is_default = ctx.is_default_bearer(ebi);
        match kind {
            BearerKind::Default if !is_default => return Err(EsmError::WrongBearerKind(ebi)),
            BearerKind::Dedicated if is_default => return Err(EsmError::WrongBearerKind(ebi)),
            _ => {}
        }

        let from = bearer.state();
        esm_ebr_next_state(from, event).ok_or(EsmError::InvalidTransition { from, event })?;
        Ok(from)
    }

    fn send(&self, ue_id: MmeUeS1apId, msg: &Bytes) -> EsmResult<()> {
        self.sap.send(Some(EmmSap::unitdata_req(ue_id, msg.clone())))
    }

    fn enter_pending(&self, ctx: &mut EsmContext, ebi: Ebi, event: EbrEvent, msg: Bytes) -> EsmResult<()> {
        ctx.ebr_transition(ebi, event)?;

        let ue_id = ctx.ue_id();
        let bearer = ctx.bearer_mut(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        self.timers.start(ue_id, bearer, msg)
    }

    /// Conclude the pending procedure of a bearer on a UE answer
    fn conclude(
        &self,
        ctx: &mut EsmContext,
        ebi: Ebi,
        kind: BearerKind,
        expected: EsmEbrState,
        event: EbrEvent,
    ) -> EsmResult<EsmEbrState> {
        let from = self.check(ctx, ebi, kind, event)?;
        if from != expected {
            log::warn!(
                "ESM-PROC  - {} for EBI {} in state {} ignored (ue_id={})",
                event,
                ebi,
                from,
                ctx.ue_id()
            );
            return Err(EsmError::InvalidTransition { from, event });
        }

        if let Some(bearer) = ctx.bearer_mut(ebi) {
            self.timers.stop(bearer);
        }
        ctx.ebr_transition(ebi, event)
    }

    /// Free a bearer that reached INACTIVE; a default bearer takes its PDN
    /// connection with it.
    fn release_inactive(&self, ctx: &mut EsmContext, ebi: Ebi) -> EsmResult<()> {
        if ctx.is_default_bearer(ebi) {
            let cid = ctx
                .bearer(ebi)
                .map(|bearer| bearer.pdn_cid())
                .ok_or(EsmError::BearerNotFound(ebi))?;
            self.pdn_connection_release_local(ctx, cid)
        } else {
            ctx.remove_bearer(ebi)
        }
    }
}

fn log_reject(message: &str, ue_id: MmeUeS1apId, ebi: Ebi, cause: EsmCause) {
    log::warn!(
        "ESM-PROC  - {} received for EBI {} (ue_id={}, cause={})",
        message,
        ebi,
        ue_id,
        cause
    );
}

// ============================================================================
// Tests
// ============================================================================
