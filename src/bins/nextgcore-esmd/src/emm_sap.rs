//! EMM Service Access Point
//!
//! Primitives handed from the EMM/ESM sublayers to the EMM-AS layer, which
//! encodes and transmits them toward the eNB. This module only builds and
//! forwards them.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::cause::EmmCause;
use crate::context::{EpsGuti, MmeUeS1apId, OGS_NAS_KSI_NO_KEY_IS_AVAILABLE};
use crate::error::{EsmError, EsmResult};

// ============================================================================
// Primitive Types
// ============================================================================

/// EMM-AS SAP primitive kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmSapPrimitive {
    /// NAS signalling connection establishment reject
    EmmasEstablishRej,
    /// ESM message transfer on behalf of the ESM sublayer
    EmmesmUnitdataReq,
}

impl fmt::Display for EmmSapPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmSapPrimitive::EmmasEstablishRej => write!(f, "EMMAS_ESTABLISH_REJ"),
            EmmSapPrimitive::EmmesmUnitdataReq => write!(f, "EMMESM_UNITDATA_REQ"),
        }
    }
}

/// Procedure context of the NAS message to be built by EMM-AS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmmAsNasInfo {
    #[default]
    None,
    /// Service request
    Sr,
}

// ============================================================================
// Security Data
// ============================================================================

/// Type of EPS NAS security context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityContextType {
    #[default]
    NotAvailable,
    Native,
    FullNative,
    Mapped,
}

/// NAS COUNT (TS 24.301 4.4.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NasCount {
    /// Overflow counter (16 bits)
    pub overflow: u16,
    /// Sequence number (8 bits)
    pub seq_num: u8,
}

impl NasCount {
    /// Get 32-bit count value
    pub fn to_u32(&self) -> u32 {
        ((self.overflow as u32) << 8) | (self.seq_num as u32)
    }
}

/// EPS NAS security context of a UE
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmmSecurityContext {
    pub sc_type: SecurityContextType,
    /// NAS key set identifier
    pub eksi: u8,
    pub dl_count: NasCount,
    pub ul_count: NasCount,
    /// NAS encryption key
    pub knas_enc: [u8; 16],
    /// NAS integrity key
    pub knas_int: [u8; 16],
    pub selected_enc_algorithm: u8,
    pub selected_int_algorithm: u8,
}

/// Security parameters forwarded with a primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmmAsSecurityData {
    /// The security context was just taken into use
    pub is_new: bool,
    /// NAS key set identifier
    pub ksi: u8,
    /// Downlink sequence number
    pub sqn: u8,
    /// Downlink NAS COUNT
    pub count: u32,
    pub k_enc: Option<[u8; 16]>,
    pub k_int: Option<[u8; 16]>,
    pub selected_enc_algorithm: u8,
    pub selected_int_algorithm: u8,
}

impl Default for EmmAsSecurityData {
    fn default() -> Self {
        Self {
            is_new: false,
            ksi: OGS_NAS_KSI_NO_KEY_IS_AVAILABLE,
            sqn: 0,
            count: 0,
            k_enc: None,
            k_int: None,
            selected_enc_algorithm: 0,
            selected_int_algorithm: 0,
        }
    }
}

/// Copy the security parameters of `context` into `data`. No key material
/// is derived; without a full native context the KSI is "no key available".
pub fn emm_as_set_security_data(
    data: &mut EmmAsSecurityData,
    context: Option<&EmmSecurityContext>,
    is_new: bool,
    is_ciphered: bool,
) {
    *data = EmmAsSecurityData::default();

    match context {
        Some(ctx) if ctx.sc_type == SecurityContextType::FullNative => {
            data.is_new = is_new;
            data.ksi = ctx.eksi;
            data.sqn = ctx.dl_count.seq_num;
            data.count = ctx.dl_count.to_u32();
            data.k_int = Some(ctx.knas_int);
            data.selected_int_algorithm = ctx.selected_int_algorithm;
            if is_ciphered {
                data.k_enc = Some(ctx.knas_enc);
                data.selected_enc_algorithm = ctx.selected_enc_algorithm;
            }
        }
        _ => {
            data.ksi = OGS_NAS_KSI_NO_KEY_IS_AVAILABLE;
        }
    }
}

// ============================================================================
// Primitive
// ============================================================================

/// EMM-AS SAP primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmmSap {
    pub primitive: EmmSapPrimitive,
    pub ue_id: MmeUeS1apId,
    pub emm_cause: EmmCause,
    /// GUTI to return to the UE, if any
    pub guti: Option<EpsGuti>,
    pub nas_info: EmmAsNasInfo,
    /// Encoded NAS message
    pub nas_msg: Option<Bytes>,
    pub sctx: EmmAsSecurityData,
}

impl EmmSap {
    /// Connection establishment reject
    pub fn establish_rej(ue_id: MmeUeS1apId, emm_cause: EmmCause, nas_info: EmmAsNasInfo) -> Self {
        Self {
            primitive: EmmSapPrimitive::EmmasEstablishRej,
            ue_id,
            emm_cause,
            guti: None,
            nas_info,
            nas_msg: None,
            sctx: EmmAsSecurityData::default(),
        }
    }

    /// Transfer of an encoded ESM message
    pub fn unitdata_req(ue_id: MmeUeS1apId, msg: Bytes) -> Self {
        Self {
            primitive: EmmSapPrimitive::EmmesmUnitdataReq,
            ue_id,
            emm_cause: EmmCause::Success,
            guti: None,
            nas_info: EmmAsNasInfo::None,
            nas_msg: Some(msg),
            sctx: EmmAsSecurityData::default(),
        }
    }
}

// ============================================================================
// EMM-AS Collaborator
// ============================================================================

/// EMM-AS error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmmAsError {
    /// S1 signalling connection no longer exists
    #[error("S1 context removed (ue_id={0})")]
    S1ContextRemoved(MmeUeS1apId),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Lower layer taking EMM-AS primitives
pub trait EmmAsSap: Send + Sync {
    fn send(&self, sap: &EmmSap) -> Result<(), EmmAsError>;
}

/// Forwards primitives to the EMM-AS layer
pub struct SapSender<S: EmmAsSap> {
    sap: Arc<S>,
}

impl<S: EmmAsSap> Clone for SapSender<S> {
    fn clone(&self) -> Self {
        Self { sap: self.sap.clone() }
    }
}

impl<S: EmmAsSap> SapSender<S> {
    pub fn new(sap: Arc<S>) -> Self {
        Self { sap }
    }

    /// Send a primitive; `None` is refused
    pub fn send(&self, sap: Option<EmmSap>) -> EsmResult<()> {
        let sap = sap.ok_or(EsmError::NullPrimitive)?;

        log::debug!(
            "EMMAS-SAP - Send {} (ue_id={}, cause={})",
            sap.primitive,
            sap.ue_id,
            sap.emm_cause
        );

        self.sap.send(&sap).map_err(|e| {
            log::error!("EMMAS-SAP - {} failed (ue_id={}): {}", sap.primitive, sap.ue_id, e);
            EsmError::DownstreamSendFailed(e.to_string())
        })
    }
}

/// EMM-AS endpoint of the standalone daemon: logs every primitive
#[derive(Debug, Default)]
pub struct EmmAsLogSink;

impl EmmAsSap for EmmAsLogSink {
    fn send(&self, sap: &EmmSap) -> Result<(), EmmAsError> {
        log::info!(
            "[ue_id={}] {} cause={} nas_info={:?} nas_msg_len={}",
            sap.ue_id,
            sap.primitive,
            sap.emm_cause,
            sap.nas_info,
            sap.nas_msg.as_ref().map(Bytes::len).unwrap_or(0)
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingSap;

    fn full_native() -> EmmSecurityContext {
        EmmSecurityContext {
            sc_type: SecurityContextType::FullNative,
            eksi: 3,
            dl_count: NasCount {
                overflow: 1,
                seq_num: 0x20,
            },
            knas_enc: [0xaa; 16],
            knas_int: [0xbb; 16],
            selected_enc_algorithm: 2,
            selected_int_algorithm: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_primitive_display() {
        assert_eq!(EmmSapPrimitive::EmmasEstablishRej.to_string(), "EMMAS_ESTABLISH_REJ");
        assert_eq!(EmmSapPrimitive::EmmesmUnitdataReq.to_string(), "EMMESM_UNITDATA_REQ");
    }

    #[test]
    fn test_set_security_data_full_native() {
        let mut data = EmmAsSecurityData::default();
        emm_as_set_security_data(&mut data, Some(&full_native()), true, true);
        assert!(data.is_new);
        assert_eq!(data.ksi, 3);
        assert_eq!(data.sqn, 0x20);
        assert_eq!(data.count, 0x120);
        assert_eq!(data.k_int, Some([0xbb; 16]));
        assert_eq!(data.k_enc, Some([0xaa; 16]));
        assert_eq!(data.selected_enc_algorithm, 2);
    }

    #[test]
    fn test_set_security_data_not_ciphered() {
        let mut data = EmmAsSecurityData::default();
        emm_as_set_security_data(&mut data, Some(&full_native()), false, false);
        assert!(!data.is_new);
        assert_eq!(data.ksi, 3);
        assert_eq!(data.k_int, Some([0xbb; 16]));
        assert!(data.k_enc.is_none());
    }

    #[test]
    fn test_set_security_data_no_context() {
        let mut data = EmmAsSecurityData {
            sqn: 9,
            ..Default::default()
        };
        emm_as_set_security_data(&mut data, None, true, true);
        assert_eq!(data, EmmAsSecurityData::default());
        assert_eq!(data.ksi, OGS_NAS_KSI_NO_KEY_IS_AVAILABLE);

        let partial = EmmSecurityContext {
            sc_type: SecurityContextType::Native,
            eksi: 1,
            ..Default::default()
        };
        emm_as_set_security_data(&mut data, Some(&partial), false, false);
        assert_eq!(data.ksi, OGS_NAS_KSI_NO_KEY_IS_AVAILABLE);
        assert!(data.k_int.is_none());
    }

    #[test]
    fn test_sap_sender_null_primitive() {
        let sap = Arc::new(RecordingSap::default());
        let sender = SapSender::new(sap.clone());
        assert_eq!(sender.send(None), Err(EsmError::NullPrimitive));
        assert!(sap.sent().is_empty());
    }

    #[test]
    fn test_sap_sender_forwards() {
        let sap = Arc::new(RecordingSap::default());
        let sender = SapSender::new(sap.clone());
        let primitive = EmmSap::establish_rej(42, EmmCause::Congestion, EmmAsNasInfo::Sr);

        sender.send(Some(primitive.clone())).unwrap();
        assert_eq!(sap.sent(), vec![primitive]);
    }

    #[test]
    fn test_sap_sender_failure() {
        let sap = Arc::new(RecordingSap::default());
        sap.set_fail(true);
        let sender = SapSender::new(sap.clone());

        let err = sender
            .send(Some(EmmSap::unitdata_req(1, Bytes::from_static(b"x"))))
            .unwrap_err();
        assert!(matches!(err, EsmError::DownstreamSendFailed(_)));
    }
}
