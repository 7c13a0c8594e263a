//! EMM Procedures toward the ESM sublayer
//!
//! Service request rejection (TS 24.301 5.6.1.5): the network refuses a
//! service request and tells the access stratum to reject the connection.

use crate::cause::EmmCause;
use crate::context::{is_valid_ue_id, MmeUeS1apId};
use crate::emm_sap::{emm_as_set_security_data, EmmAsNasInfo, EmmAsSap, EmmSap, EmmSecurityContext, SapSender};
use crate::error::EsmResult;

/// Scratch EMM context used to build a reject for a UE the MME holds no
/// context for. Never stored.
#[derive(Debug, Clone, Default)]
pub struct EmmContext {
    pub ue_id: MmeUeS1apId,
    pub emm_cause: EmmCause,
    pub security: Option<EmmSecurityContext>,
}

/// EMM procedures that notify EMM-AS
pub struct EmmProc<S: EmmAsSap> {
    sap: SapSender<S>,
}

impl<S: EmmAsSap> EmmProc<S> {
    pub fn new(sap: SapSender<S>) -> Self {
        Self { sap }
    }

    /// Reject a service request.
    ///
    /// A UE without lower layer identifier is always reported as implicitly
    /// detached. The send result is returned as is and never retried.
    pub fn service_reject(&self, ue_id: MmeUeS1apId, emm_cause: EmmCause) -> EsmResult<()> {
        let ctx = EmmContext {
            ue_id,
            emm_cause: if is_valid_ue_id(ue_id) {
                emm_cause
            } else {
                EmmCause::ImplicitlyDetached
            },
            security: None,
        };

        self.emm_service_reject(ctx)
    }

    fn emm_service_reject(&self, mut ctx: EmmContext) -> EsmResult<()> {
        log::warn!(
            "EMM-PROC  - EMM service procedure not accepted by the network (ue_id={}, cause={})",
            ctx.ue_id,
            ctx.emm_cause
        );

        // A reject never reports success
        if ctx.emm_cause == EmmCause::Success {
            ctx.emm_cause = EmmCause::ImplicitlyDetached;
        }

        let mut sap = EmmSap::establish_rej(ctx.ue_id, ctx.emm_cause, EmmAsNasInfo::Sr);
        emm_as_set_security_data(&mut sap.sctx, ctx.security.as_ref(), false, false);

        self.sap.send(Some(sap))
    }
}
