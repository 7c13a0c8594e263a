//! ESM Event Dispatcher
//!
//! Entry point of the ESM sublayer. Every event is processed to completion
//! while holding the lock of the UE it belongs to, so timer expiries never
//! race with procedures on the same UE.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::cause::EmmCause;
use crate::context::{
    is_valid_ue_id, Bitrate, Ebi, EsmContext, EsmProcData, MmeUeS1apId, PdnCid, RequestType,
    TrafficFlowTemplate,
};
use crate::ebr_timer::{EbrTimerKey, EbrTimerOutcome, EbrTimers, TimerFacility, TimerHandle};
use crate::emm_proc::EmmProc;
use crate::emm_sap::{EmmAsSap, SapSender};
use crate::error::{EsmError, EsmResult};
use crate::esm_proc::EsmProc;
use crate::store::{lock_session, SessionHandle, SessionStore};

/// ESM event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsmEvent {
    /// Retransmission timer expired
    Timer { handle: TimerHandle, key: EbrTimerKey },
    /// Service request not accepted by the network
    ServiceReject { ue_id: MmeUeS1apId, cause: EmmCause },
    /// UE detached, implicitly or explicitly
    Detach { ue_id: MmeUeS1apId },
}

impl fmt::Display for EsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EsmEvent::Timer { key, .. } => write!(f, "ESM_TIMER({})", key.timer_id.name()),
            EsmEvent::ServiceReject { .. } => write!(f, "SERVICE_REJECT"),
            EsmEvent::Detach { .. } => write!(f, "DETACH"),
        }
    }
}

pub struct EsmDispatcher<F: TimerFacility, S: EmmAsSap> {
    store: Arc<SessionStore>,
    esm: EsmProc<F, S>,
    emm: EmmProc<S>,
    max_pdn_connections: usize,
}

impl<F: TimerFacility, S: EmmAsSap> EsmDispatcher<F, S> {
    pub fn new(
        store: Arc<SessionStore>,
        timers: EbrTimers<F>,
        sap: SapSender<S>,
        max_pdn_connections: usize,
    ) -> Self {
        Self {
            store,
            esm: EsmProc::new(timers, sap.clone()),
            emm: EmmProc::new(sap),
            max_pdn_connections,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn esm_proc(&self) -> &EsmProc<F, S> {
        &self.esm
    }

    /// Create the ESM context of a UE
    pub fn session_create(&self, ue_id: MmeUeS1apId) -> EsmResult<SessionHandle> {
        if !is_valid_ue_id(ue_id) {
            return Err(EsmError::InvalidSubscriber(ue_id));
        }
        Ok(self.store.insert(EsmContext::new(ue_id, self.max_pdn_connections))?)
    }

    /// Run `f` on a UE's context under its lock
    pub fn with_session<R>(
        &self,
        ue_id: MmeUeS1apId,
        f: impl FnOnce(&mut EsmContext, &EsmProc<F, S>) -> EsmResult<R>,
    ) -> EsmResult<R> {
        let handle = self.store.get(ue_id).ok_or(EsmError::InvalidSubscriber(ue_id))?;
        let mut ctx = lock_session(&handle);
        f(&mut *ctx, &self.esm)
    }

    /// Establish a PDN connection and send the default bearer activation. The
    /// UE's context is created if needed and dropped again when this first
    /// request fails.
    pub fn pdn_connectivity(
        &self,
        ue_id: MmeUeS1apId,
        data: EsmProcData,
        ambr: Bitrate,
        tft: Option<TrafficFlowTemplate>,
        msg: Bytes,
    ) -> EsmResult<(PdnCid, Ebi)> {
        if !is_valid_ue_id(ue_id) {
            return Err(EsmError::InvalidSubscriber(ue_id));
        }
        let (handle, created) = match self.store.get(ue_id) {
            Some(handle) => (handle, false),
            None => match self.store.insert(EsmContext::new(ue_id, self.max_pdn_connections)) {
                Ok(handle) => (handle, true),
                Err(dup) => (dup.existing, false),
            },
        };
        let mut ctx = lock_session(&handle);

        let result = self.establish_pdn(&mut ctx, data, ambr, tft, msg);
        if result.is_err() && created && ctx.n_pdns() == 0 {
            self.store.remove(ue_id);
        }
        result
    }

    fn establish_pdn(
        &self,
        ctx: &mut EsmContext,
        data: EsmProcData,
        ambr: Bitrate,
        tft: Option<TrafficFlowTemplate>,
        msg: Bytes,
    ) -> EsmResult<(PdnCid, Ebi)> {
        let is_emergency = data.request_type == RequestType::Emergency;
        let (cid, ebi) = ctx.pdn_connectivity(data.pti, is_emergency, ambr, data.qos.clone(), tft)?;
        ctx.set_pdn_info(cid, data.apn.clone(), data.pdn_type, data.pdn_addr.clone())?;

        if let Err(e) = self.esm.default_eps_bearer_context_request(ctx, ebi, msg) {
            ctx.release_connection(cid)?;
            return Err(e);
        }

        ctx.set_esm_proc_data(data);
        Ok((cid, ebi))
    }

    /// Process one event
    pub fn dispatch(&self, event: EsmEvent) -> EsmResult<()> {
        log::debug!("ESM event: {}", event);
        match event {
            EsmEvent::Timer { handle, key } => self.handle_timer(handle, key).map(|_| ()),
            EsmEvent::ServiceReject { ue_id, cause } => self.service_reject(ue_id, cause),
            EsmEvent::Detach { ue_id } => self.detach(ue_id),
        }
    }

    /// Retransmission timer expiry. Expiries of timers that were stopped or
    /// re-armed in the meantime are ignored.
    pub fn handle_timer(&self, handle: TimerHandle, key: EbrTimerKey) -> EsmResult<EbrTimerOutcome> {
        let Some(session) = self.store.get(key.ue_id) else {
            log::debug!("{} expired for unknown UE (ue_id={})", key.timer_id.name(), key.ue_id);
            return Ok(EbrTimerOutcome::NotRunning);
        };
        let mut ctx = lock_session(&session);

        let current = ctx
            .bearer(key.ebi)
            .and_then(|bearer| bearer.timer())
            .map(|record| record.handle);
        if current != Some(handle) {
            log::debug!(
                "Stale {} ignored (ue_id={}, ebi={})",
                key.timer_id.name(),
                key.ue_id,
                key.ebi
            );
            return Ok(EbrTimerOutcome::NotRunning);
        }

        self.esm.eps_bearer_context_timeout(&mut ctx, key.ebi)
    }

    /// Reject a service request. Works whether or not the UE has an ESM
    /// context.
    pub fn service_reject(&self, ue_id: MmeUeS1apId, cause: EmmCause) -> EsmResult<()> {
        self.emm.service_reject(ue_id, cause)
    }

    /// Remove the UE's context and release it locally
    pub fn detach(&self, ue_id: MmeUeS1apId) -> EsmResult<()> {
        let handle = self.store.remove(ue_id).ok_or(EsmError::InvalidSubscriber(ue_id))?;
        let mut ctx = lock_session(&handle);
        self.esm.esm_context_release(&mut ctx)
    }

    /// Release every UE (shutdown)
    pub fn detach_all(&self) {
        for ue_id in self.store.ue_ids() {
            if let Err(e) = self.detach(ue_id) {
                log::error!("ESM context release failed (ue_id={}): {}", ue_id, e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EsmTimerConfig;
    use crate::context::{PdnType, Qos};
    use crate::ebr::EsmEbrState;
    use crate::emm_sap::EmmSapPrimitive;
    use crate::test_util::{ManualTimers, RecordingSap};

    struct Fixture {
        dispatcher: EsmDispatcher<ManualTimers, RecordingSap>,
        facility: Arc<ManualTimers>,
        sap: Arc<RecordingSap>,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let facility = Arc::new(ManualTimers::default());
        let sap = Arc::new(RecordingSap::default());
        let config = EsmTimerConfig {
            max_retries,
            ..Default::default()
        };
        let dispatcher = EsmDispatcher::new(
            Arc::new(SessionStore::new()),
            EbrTimers::new(facility.clone(), config),
            SapSender::new(sap.clone()),
            2,
        );
        Fixture {
            dispatcher,
            facility,
            sap,
        }
    }

    fn proc_data(pti: u8) -> EsmProcData {
        EsmProcData {
            pti,
            request_type: RequestType::InitialRequest,
            apn: Some("internet".to_string()),
            pdn_type: PdnType::Ipv4v6,
            qos: Qos::with_qci(9, 15),
            pco: None,
            pdn_addr: Some(Bytes::from_static(&[10, 45, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1])),
        }
    }

    fn current_timer(f: &Fixture, ue_id: MmeUeS1apId, ebi: Ebi) -> Option<(TimerHandle, EbrTimerKey)> {
        f.dispatcher
            .with_session(ue_id, |ctx, _| {
                Ok(ctx.bearer(ebi).and_then(|b| b.timer()).map(|r| (r.handle, r.key())))
            })
            .unwrap()
    }

    #[test]
    fn test_session_create() {
        let f = fixture(4);
        f.dispatcher.session_create(7).unwrap();
        assert_eq!(
            f.dispatcher.session_create(7).unwrap_err(),
            EsmError::DuplicateSubscriber(7)
        );
        assert_eq!(
            f.dispatcher.session_create(0).unwrap_err(),
            EsmError::InvalidSubscriber(0)
        );
        assert_eq!(f.dispatcher.store().len(), 1);
    }

    #[test]
    fn test_with_session_unknown_ue() {
        let f = fixture(4);
        let result = f.dispatcher.with_session(9, |ctx, _| Ok(ctx.ue_id()));
        assert_eq!(result, Err(EsmError::InvalidSubscriber(9)));
    }

    #[test]
    fn test_pdn_connectivity() {
        let f = fixture(4);
        let (cid, ebi) = f
            .dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::new(10, 10), None, Bytes::from_static(b"act"))
            .unwrap();

        f.dispatcher
            .with_session(5, |ctx, _| {
                let pdn = ctx.pdn(cid).unwrap();
                assert_eq!(pdn.apn(), Some("internet"));
                assert_eq!(pdn.pdn_type(), PdnType::Ipv4v6);
                assert_eq!(pdn.pdn_addr_string().as_deref(), Some("10.45.0.2 / 0:0:0:1"));
                assert_eq!(pdn.default_ebi(), Some(ebi));
                assert_eq!(ctx.bearer(ebi).unwrap().state(), EsmEbrState::ActivePending);
                assert_eq!(ctx.esm_proc_data().map(|d| d.pti), Some(1));
                Ok(())
            })
            .unwrap();
        assert_eq!(f.sap.sent().len(), 1);
        assert_eq!(f.facility.armed_count(), 1);
    }

    #[test]
    fn test_pdn_connectivity_send_failure_rolls_back() {
        let f = fixture(4);
        f.sap.set_fail(true);
        let err = f
            .dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap_err();
        assert!(matches!(err, EsmError::DownstreamSendFailed(_)));
        assert!(f.dispatcher.store().get(5).is_none());
        assert!(f.dispatcher.store().is_empty());
        assert_eq!(f.facility.armed_count(), 0);
    }

    #[test]
    fn test_pdn_connectivity_failure_keeps_existing_session() {
        let f = fixture(4);
        let (cid, _) = f
            .dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap();

        f.sap.set_fail(true);
        assert!(f
            .dispatcher
            .pdn_connectivity(5, proc_data(2), Bitrate::default(), None, Bytes::from_static(b"act"))
            .is_err());

        f.dispatcher
            .with_session(5, |ctx, _| {
                assert_eq!(ctx.n_pdns(), 1);
                assert!(ctx.pdn(cid).is_some());
                assert_eq!(ctx.find_pdn_by_pti(2), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(f.facility.armed_count(), 1);
    }

    #[test]
    fn test_pdn_connectivity_too_many() {
        let f = fixture(4);
        for pti in 1..=2 {
            f.dispatcher
                .pdn_connectivity(5, proc_data(pti), Bitrate::default(), None, Bytes::from_static(b"act"))
                .unwrap();
        }
        let err = f
            .dispatcher
            .pdn_connectivity(5, proc_data(3), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap_err();
        assert_eq!(err, EsmError::TooManyConnections(2));
    }

    #[test]
    fn test_timer_event_retransmits_and_abandons() {
        let f = fixture(2);
        let (cid, ebi) = f
            .dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap();

        for _ in 0..2 {
            let (handle, key) = current_timer(&f, 5, ebi).unwrap();
            assert_eq!(f.facility.fire(handle), Some(key));
            f.dispatcher.dispatch(EsmEvent::Timer { handle, key }).unwrap();
        }
        let (handle, key) = current_timer(&f, 5, ebi).unwrap();
        f.facility.fire(handle);
        assert_eq!(
            f.dispatcher.handle_timer(handle, key),
            Ok(EbrTimerOutcome::RetriesExhausted)
        );

        f.dispatcher
            .with_session(5, |ctx, _| {
                assert!(ctx.pdn(cid).is_none());
                assert!(ctx.bearer(ebi).is_none());
                Ok(())
            })
            .unwrap();
        assert_eq!(f.sap.sent().len(), 3);
        assert_eq!(f.facility.armed_count(), 0);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let f = fixture(4);
        let (_, ebi) = f
            .dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap();
        let (handle, key) = current_timer(&f, 5, ebi).unwrap();

        f.dispatcher
            .with_session(5, |ctx, esm| esm.default_eps_bearer_context_accept(ctx, ebi))
            .unwrap();

        assert_eq!(f.dispatcher.handle_timer(handle, key), Ok(EbrTimerOutcome::NotRunning));
        assert_eq!(f.sap.sent().len(), 1);

        let unknown = EbrTimerKey { ue_id: 99, ..key };
        assert_eq!(f.dispatcher.handle_timer(handle, unknown), Ok(EbrTimerOutcome::NotRunning));
    }

    #[test]
    fn test_service_reject_event() {
        let f = fixture(4);
        f.dispatcher
            .dispatch(EsmEvent::ServiceReject {
                ue_id: 42,
                cause: EmmCause::ProtocolErrorUnspecified,
            })
            .unwrap();
        f.dispatcher
            .dispatch(EsmEvent::ServiceReject {
                ue_id: 0,
                cause: EmmCause::ProtocolErrorUnspecified,
            })
            .unwrap();

        let sent = f.sap.sent();
        assert_eq!(sent[0].primitive, EmmSapPrimitive::EmmasEstablishRej);
        assert_eq!(sent[0].emm_cause, EmmCause::ProtocolErrorUnspecified);
        assert_eq!(sent[1].emm_cause, EmmCause::ImplicitlyDetached);
        assert!(f.dispatcher.store().is_empty());
    }

    #[test]
    fn test_detach_releases_everything() {
        let f = fixture(4);
        f.dispatcher
            .pdn_connectivity(5, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap();
        f.dispatcher
            .pdn_connectivity(6, proc_data(1), Bitrate::default(), None, Bytes::from_static(b"act"))
            .unwrap();
        assert_eq!(f.facility.armed_count(), 2);

        f.dispatcher.dispatch(EsmEvent::Detach { ue_id: 5 }).unwrap();
        assert!(f.dispatcher.store().get(5).is_none());
        assert_eq!(f.facility.armed_count(), 1);
        assert_eq!(
            f.dispatcher.detach(5),
            Err(EsmError::InvalidSubscriber(5))
        );

        f.dispatcher.detach_all();
        assert!(f.dispatcher.store().is_empty());
        assert_eq!(f.facility.armed_count(), 0);
    }
}
