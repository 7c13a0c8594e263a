//! ESM Context
//!
//! Per-UE EPS Session Management data: PDN connections, EPS bearer slots and
//! the counters that summarise them.

use bytes::Bytes;

use crate::ebr::Bearer;
use crate::pdn::PdnConnection;

// ============================================================================
// Constants
// ============================================================================

/// MME UE S1AP ID (lower layers UE identifier)
pub type MmeUeS1apId = u32;

/// Reserved value: no lower layer identifier has been assigned yet
pub const INVALID_MME_UE_S1AP_ID: MmeUeS1apId = 0;

/// EPS Bearer Identity
pub type Ebi = u8;

/// Procedure Transaction Identity
pub type Pti = u8;

/// PDN connection identifier (slot index within the ESM context)
pub type PdnCid = usize;

/// EBI value used when no bearer is assigned
pub const ESM_EBI_UNASSIGNED: Ebi = 0;
/// Minimum EPS bearer ID
pub const ESM_EBI_MIN: Ebi = 5;
/// Maximum EPS bearer ID
pub const ESM_EBI_MAX: Ebi = 15;

/// Total number of EPS bearer contexts per UE
pub const ESM_DATA_EPS_BEARER_TOTAL: usize = (ESM_EBI_MAX - ESM_EBI_MIN + 1) as usize;

/// Default maximum number of simultaneous PDN connections per UE
pub const ESM_DEFAULT_MAX_PDN_CONNECTIONS: usize = 4;

/// NAS KSI no key available
pub const OGS_NAS_KSI_NO_KEY_IS_AVAILABLE: u8 = 7;

/// Check whether a lower layer UE identifier has been assigned
pub fn is_valid_ue_id(ue_id: MmeUeS1apId) -> bool {
    ue_id != INVALID_MME_UE_S1AP_ID
}

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    /// 0xf if 2-digit MNC
    pub mnc3: u8,
}

/// EPS GUTI
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
    pub m_tmsi: u32,
}

/// Bitrate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitrate {
    /// Downlink bitrate (bps)
    pub downlink: u64,
    /// Uplink bitrate (bps)
    pub uplink: u64,
}

impl Bitrate {
    pub fn new(downlink: u64, uplink: u64) -> Self {
        Self { downlink, uplink }
    }
}

/// ARP (Allocation and Retention Priority)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arp {
    /// Priority level (1-15)
    pub priority_level: u8,
    pub pre_emption_capability: u8,
    pub pre_emption_vulnerability: u8,
}

/// EPS bearer level QoS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Qos {
    /// QCI (QoS Class Identifier)
    pub qci: u8,
    pub arp: Arp,
    /// MBR (Maximum Bit Rate)
    pub mbr: Bitrate,
    /// GBR (Guaranteed Bit Rate)
    pub gbr: Bitrate,
}

impl Qos {
    /// Non-GBR QoS with the given QCI and ARP priority level
    pub fn with_qci(qci: u8, priority_level: u8) -> Self {
        Self {
            qci,
            arp: Arp {
                priority_level,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// QCI 1-4 are GBR classes
    pub fn is_gbr(&self) -> bool {
        (1..=4).contains(&self.qci)
    }
}

/// Packet filter direction (TS 24.008 10.5.6.12)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketFilterDirection {
    PreRel7 = 0,
    Downlink = 1,
    Uplink = 2,
    #[default]
    Bidirectional = 3,
}

/// Single packet filter of a traffic flow template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketFilter {
    pub identifier: u8,
    pub direction: PacketFilterDirection,
    pub precedence: u8,
    /// Encoded packet filter components
    pub content: Bytes,
}

/// Traffic Flow Template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficFlowTemplate {
    pub packet_filters: Vec<PacketFilter>,
}

/// PDN type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdnType {
    #[default]
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv4v6 = 3,
    NonIp = 5,
}

/// PDN connectivity request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RequestType {
    #[default]
    InitialRequest = 1,
    Handover = 2,
    Emergency = 4,
}

/// Procedure-local data of the ESM transaction in progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmProcData {
    pub pti: Pti,
    pub request_type: RequestType,
    pub apn: Option<String>,
    pub pdn_type: PdnType,
    pub qos: Qos,
    /// Protocol configuration options received from the UE
    pub pco: Option<Bytes>,
    /// PDN address allocated by the gateway, encoded as in the PDN address IE
    pub pdn_addr: Option<Bytes>,
}

// ============================================================================
// ESM Context
// ============================================================================

/// ESM context of one UE
#[derive(Debug)]
pub struct EsmContext {
    pub(crate) ue_id: MmeUeS1apId,
    /// Total number of active EPS bearer contexts
    pub(crate) n_active_ebrs: usize,
    /// Number of PDN connections whose default bearer is active
    pub(crate) n_active_pdns: usize,
    /// Number of PDN connections
    pub(crate) n_pdns: usize,
    /// A PDN connection for emergency bearer services is established
    pub(crate) is_emergency: bool,
    pub(crate) esm_proc_data: Option<EsmProcData>,
    /// Next bearer slot to try when allocating an EBI
    pub(crate) ebr_index: usize,
    /// Bearer slots; slot `i` carries EBI `ESM_EBI_MIN + i`
    pub(crate) bearers: [Option<Bearer>; ESM_DATA_EPS_BEARER_TOTAL],
    pub(crate) pdns: Vec<Option<PdnConnection>>,
}

impl EsmContext {
    /// Create an empty ESM context
    pub fn new(ue_id: MmeUeS1apId, max_pdn_connections: usize) -> Self {
        Self {
            ue_id,
            n_active_ebrs: 0,
            n_active_pdns: 0,
            n_pdns: 0,
            is_emergency: false,
            esm_proc_data: None,
            ebr_index: 0,
            bearers: std::array::from_fn(|_| None),
            pdns: (0..max_pdn_connections).map(|_| None).collect(),
        }
    }

    pub fn ue_id(&self) -> MmeUeS1apId {
        self.ue_id
    }

    pub fn n_active_ebrs(&self) -> usize {
        self.n_active_ebrs
    }

    pub fn n_active_pdns(&self) -> usize {
        self.n_active_pdns
    }

    pub fn n_pdns(&self) -> usize {
        self.n_pdns
    }

    pub fn is_emergency(&self) -> bool {
        self.is_emergency
    }

    /// Maximum number of simultaneous PDN connections
    pub fn max_pdn_connections(&self) -> usize {
        self.pdns.len()
    }

    pub fn esm_proc_data(&self) -> Option<&EsmProcData> {
        self.esm_proc_data.as_ref()
    }

    pub fn set_esm_proc_data(&mut self, data: EsmProcData) {
        self.esm_proc_data = Some(data);
    }

    pub fn take_esm_proc_data(&mut self) -> Option<EsmProcData> {
        self.esm_proc_data.take()
    }

    /// Find bearer by EBI
    pub fn bearer(&self, ebi: Ebi) -> Option<&Bearer> {
        ebi_to_slot(ebi).and_then(|slot| self.bearers[slot].as_ref())
    }

    pub(crate) fn bearer_mut(&mut self, ebi: Ebi) -> Option<&mut Bearer> {
        ebi_to_slot(ebi).and_then(move |slot| self.bearers[slot].as_mut())
    }

    /// Iterate over allocated bearers in EBI order
    pub fn bearers(&self) -> impl Iterator<Item = &Bearer> {
        self.bearers.iter().flatten()
    }

    /// Number of allocated bearers
    pub fn n_bearers(&self) -> usize {
        self.bearers().count()
    }

    /// Find PDN connection by identifier
    pub fn pdn(&self, cid: PdnCid) -> Option<&PdnConnection> {
        self.pdns.get(cid).and_then(Option::as_ref)
    }

    pub(crate) fn pdn_mut(&mut self, cid: PdnCid) -> Option<&mut PdnConnection> {
        self.pdns.get_mut(cid).and_then(Option::as_mut)
    }

    /// Iterate over existing PDN connections
    pub fn pdns(&self) -> impl Iterator<Item = &PdnConnection> {
        self.pdns.iter().flatten()
    }

    /// Check if the bearer is the default bearer of its PDN connection
    pub fn is_default_bearer(&self, ebi: Ebi) -> bool {
        self.bearer(ebi)
            .and_then(|bearer| self.pdn(bearer.pdn_cid()))
            .and_then(PdnConnection::default_ebi)
            == Some(ebi)
    }

    /// Check if any bearer is waiting for a UE answer
    pub fn has_pending_bearers(&self) -> bool {
        self.bearers().any(|bearer| bearer.state().is_pending())
    }
}

/// Map an EBI to its bearer slot
pub(crate) fn ebi_to_slot(ebi: Ebi) -> Option<usize> {
    if (ESM_EBI_MIN..=ESM_EBI_MAX).contains(&ebi) {
        Some((ebi - ESM_EBI_MIN) as usize)
    } else {
        None
    }
}

/// Map a bearer slot to its EBI
pub(crate) fn slot_to_ebi(slot: usize) -> Ebi {
    ESM_EBI_MIN + slot as u8
}

// ============================================================================
// Tests
// ============================================================================
