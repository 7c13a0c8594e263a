//! PDN Connection Management
//!
//! Groups EPS bearers under PDN connections. The first bearer of a connection
//! is its default bearer and lives exactly as long as the connection.

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::context::{
    ebi_to_slot, slot_to_ebi, Bitrate, Ebi, EsmContext, PdnCid, PdnType, Pti, Qos,
    TrafficFlowTemplate, ESM_DATA_EPS_BEARER_TOTAL,
};
use crate::ebr::{Bearer, EsmEbrState};
use crate::error::{EsmError, EsmResult};

/// PDN connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnConnection {
    pub(crate) cid: PdnCid,
    /// Procedure transaction that created the connection
    pub(crate) pti: Pti,
    /// Established for emergency bearer services
    pub(crate) is_emergency: bool,
    /// APN aggregate maximum bit rate
    pub(crate) ambr: Bitrate,
    /// A second connection to the same APN with another address family may be
    /// requested
    pub(crate) addr_realloc: bool,
    pub(crate) apn: Option<String>,
    pub(crate) pdn_type: PdnType,
    pub(crate) pdn_addr: Option<Bytes>,
    /// Owned bearers; index 0 is the default bearer
    pub(crate) bearers: Vec<Ebi>,
}

impl PdnConnection {
    fn new(cid: PdnCid, pti: Pti, is_emergency: bool, ambr: Bitrate) -> Self {
        Self {
            cid,
            pti,
            is_emergency,
            ambr,
            addr_realloc: false,
            apn: None,
            pdn_type: PdnType::default(),
            pdn_addr: None,
            bearers: Vec::new(),
        }
    }

    pub fn cid(&self) -> PdnCid {
        self.cid
    }

    pub fn pti(&self) -> Pti {
        self.pti
    }

    pub fn is_emergency(&self) -> bool {
        self.is_emergency
    }

    pub fn ambr(&self) -> Bitrate {
        self.ambr
    }

    pub fn addr_realloc(&self) -> bool {
        self.addr_realloc
    }

    pub fn apn(&self) -> Option<&str> {
        self.apn.as_deref()
    }

    pub fn pdn_type(&self) -> PdnType {
        self.pdn_type
    }

    pub fn pdn_addr(&self) -> Option<&Bytes> {
        self.pdn_addr.as_ref()
    }

    /// Printable PDN address according to the PDN type
    pub fn pdn_addr_string(&self) -> Option<String> {
        let addr = self.pdn_addr.as_deref()?;
        match self.pdn_type {
            PdnType::Ipv4 => ipv4_addr_string(addr),
            PdnType::Ipv6 => ipv6_addr_string(addr),
            PdnType::Ipv4v6 => ipv4v6_addr_string(addr),
            PdnType::NonIp => None,
        }
    }

    /// EBI of the default bearer
    pub fn default_ebi(&self) -> Option<Ebi> {
        self.bearers.first().copied()
    }

    /// EBIs of all bearers, default bearer first
    pub fn bearers(&self) -> &[Ebi] {
        &self.bearers
    }

    pub fn bearer_count(&self) -> usize {
        self.bearers.len()
    }
}

impl EsmContext {
    /// Allocate a PDN connection slot
    pub fn create_connection(&mut self, pti: Pti, is_emergency: bool, ambr: Bitrate) -> EsmResult<PdnCid> {
        let Some(cid) = self.pdns.iter().position(Option::is_none) else {
            log::warn!(
                "ESM-PROC  - Too many PDN connections (ue_id={}, max={})",
                self.ue_id,
                self.pdns.len()
            );
            return Err(EsmError::TooManyConnections(self.pdns.len()));
        };

        self.pdns[cid] = Some(PdnConnection::new(cid, pti, is_emergency, ambr));
        self.n_pdns += 1;
        if is_emergency {
            self.is_emergency = true;
        }

        log::debug!(
            "ESM-PROC  - PDN connection {} created (ue_id={}, pti={}, emergency={})",
            cid,
            self.ue_id,
            pti,
            is_emergency
        );
        Ok(cid)
    }

    /// Allocate the next free EPS bearer identity for a PDN connection. The
    /// new bearer is INACTIVE.
    pub fn add_bearer(&mut self, cid: PdnCid, qos: Qos, tft: Option<TrafficFlowTemplate>) -> EsmResult<Ebi> {
        if self.pdn(cid).is_none() {
            return Err(EsmError::PdnNotFound(cid));
        }

        let slot = (0..ESM_DATA_EPS_BEARER_TOTAL)
            .map(|i| (self.ebr_index + i) % ESM_DATA_EPS_BEARER_TOTAL)
            .find(|slot| self.bearers[*slot].is_none())
            .ok_or_else(|| {
                log::warn!("ESM-PROC  - No free EPS bearer identity (ue_id={})", self.ue_id);
                EsmError::NoFreeBearerIdentity
            })?;

        let ebi = slot_to_ebi(slot);
        self.bearers[slot] = Some(Bearer::new(slot, ebi, cid, qos, tft));
        self.ebr_index = (slot + 1) % ESM_DATA_EPS_BEARER_TOTAL;
        if let Some(pdn) = self.pdn_mut(cid) {
            pdn.bearers.push(ebi);
        }

        log::debug!(
            "ESM-PROC  - EPS bearer {} allocated on PDN connection {} (ue_id={})",
            ebi,
            cid,
            self.ue_id
        );
        Ok(ebi)
    }

    /// Free an INACTIVE dedicated bearer. Default bearers go away with
    /// `release_connection`.
    pub fn remove_bearer(&mut self, ebi: Ebi) -> EsmResult<()> {
        let bearer = self.bearer(ebi).ok_or(EsmError::BearerNotFound(ebi))?;
        if bearer.state() != EsmEbrState::Inactive {
            return Err(EsmError::InvalidTeardownOrder(format!(
                "bearer {} is {}",
                ebi,
                bearer.state()
            )));
        }
        if self.is_default_bearer(ebi) {
            return Err(EsmError::InvalidTeardownOrder(format!(
                "bearer {} is the default bearer of PDN connection {}",
                ebi,
                bearer.pdn_cid()
            )));
        }

        let cid = bearer.pdn_cid();
        if let Some(slot) = ebi_to_slot(ebi) {
            self.bearers[slot] = None;
        }
        if let Some(pdn) = self.pdn_mut(cid) {
            pdn.bearers.retain(|b| *b != ebi);
        }

        log::debug!("ESM-PROC  - EPS bearer {} released (ue_id={})", ebi, self.ue_id);
        Ok(())
    }

    /// Free a PDN connection together with all its bearers. Every bearer must
    /// already be INACTIVE.
    pub fn release_connection(&mut self, cid: PdnCid) -> EsmResult<()> {
        let pdn = self.pdn(cid).ok_or(EsmError::PdnNotFound(cid))?;

        if let Some(busy) = pdn
            .bearers
            .iter()
            .filter_map(|ebi| self.bearer(*ebi))
            .find(|bearer| bearer.state() != EsmEbrState::Inactive)
        {
            return Err(EsmError::InvalidTeardownOrder(format!(
                "PDN connection {} has bearer {} in {}",
                cid,
                busy.ebi(),
                busy.state()
            )));
        }

        self.free_connection(cid);
        log::debug!("ESM-PROC  - PDN connection {} released (ue_id={})", cid, self.ue_id);
        Ok(())
    }

    fn free_connection(&mut self, cid: PdnCid) {
        let Some(pdn) = self.pdns.get_mut(cid).and_then(Option::take) else {
            return;
        };
        for slot in pdn.bearers.iter().filter_map(|ebi| ebi_to_slot(*ebi)) {
            self.bearers[slot] = None;
        }
        self.n_pdns -= 1;
        let any_emergency = self.pdns().any(PdnConnection::is_emergency);
        self.is_emergency = any_emergency;
    }

    /// Create a PDN connection with its default bearer. Nothing is kept if
    /// the bearer cannot be allocated.
    pub fn pdn_connectivity(
        &mut self,
        pti: Pti,
        is_emergency: bool,
        ambr: Bitrate,
        qos: Qos,
        tft: Option<TrafficFlowTemplate>,
    ) -> EsmResult<(PdnCid, Ebi)> {
        let cid = self.create_connection(pti, is_emergency, ambr)?;
        match self.add_bearer(cid, qos, tft) {
            Ok(ebi) => Ok((cid, ebi)),
            Err(e) => {
                self.free_connection(cid);
                Err(e)
            }
        }
    }

    /// Find the PDN connection created by a procedure transaction
    pub fn find_pdn_by_pti(&self, pti: Pti) -> Option<PdnCid> {
        self.pdns().find(|pdn| pdn.pti == pti).map(PdnConnection::cid)
    }

    pub fn set_addr_realloc(&mut self, cid: PdnCid, addr_realloc: bool) -> EsmResult<()> {
        let pdn = self.pdn_mut(cid).ok_or(EsmError::PdnNotFound(cid))?;
        pdn.addr_realloc = addr_realloc;
        Ok(())
    }

    pub fn set_pdn_info(
        &mut self,
        cid: PdnCid,
        apn: Option<String>,
        pdn_type: PdnType,
        pdn_addr: Option<Bytes>,
    ) -> EsmResult<()> {
        let pdn = self.pdn_mut(cid).ok_or(EsmError::PdnNotFound(cid))?;
        pdn.apn = apn;
        pdn.pdn_type = pdn_type;
        pdn.pdn_addr = pdn_addr;
        if let Some(addr) = pdn.pdn_addr_string() {
            log::debug!("ESM-PROC  - PDN connection {} address {} (ue_id={})", cid, addr, self.ue_id);
        }
        Ok(())
    }
}

// ============================================================================
// PDN Address Formatting
// ============================================================================

/// IPv4 address (4 octets)
pub fn ipv4_addr_string(addr: &[u8]) -> Option<String> {
    let octets: [u8; 4] = addr.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets).to_string())
}

/// IPv6 interface identifier (8 octets)
pub fn ipv6_addr_string(addr: &[u8]) -> Option<String> {
    let iid = addr.get(..8)?;
    let groups: Vec<String> = iid
        .chunks_exact(2)
        .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
        .collect();
    Some(groups.join(":"))
}

/// IPv4 address followed by the IPv6 interface identifier (12 octets)
pub fn ipv4v6_addr_string(addr: &[u8]) -> Option<String> {
    let ipv4 = ipv4_addr_string(addr)?;
    let ipv6 = ipv6_addr_string(addr.get(4..)?)?;
    Some(format!("{} / {}", ipv4, ipv6))
}
