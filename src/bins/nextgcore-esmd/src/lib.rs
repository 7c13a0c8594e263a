//! NextGCore MME EPS Session Management
//!
//! Network side ESM sublayer: per-UE EPS bearer contexts and PDN
//! connections, bounded retransmission of network-initiated bearer
//! procedures, and the primitives handed to the EMM-AS layer.

pub mod cause;
pub mod config;
pub mod context;
pub mod ebr;
pub mod ebr_timer;
pub mod emm_proc;
pub mod emm_sap;
pub mod error;
pub mod esm_proc;
pub mod esm_sm;
pub mod pdn;
pub mod store;
pub mod timer;

#[cfg(test)]
mod test_util;


pub use cause::{EmmCause, EsmCause};
pub use config::{ConfigError, EsmConfig, EsmTimerConfig};
pub use context::{
    Bitrate, Ebi, EsmContext, EsmProcData, MmeUeS1apId, PdnCid, Pti, Qos, TrafficFlowTemplate,
};
pub use ebr::{Bearer, EbrEvent, EsmEbrState};
pub use ebr_timer::{EbrTimerKey, EbrTimerOutcome, EbrTimers, EsmTimerId, TimerFacility, TimerHandle};
pub use emm_proc::EmmProc;
pub use emm_sap::{EmmAsLogSink, EmmAsSap, EmmSap, EmmSapPrimitive, SapSender};
pub use error::{EsmError, EsmResult};
pub use esm_proc::EsmProc;
pub use esm_sm::{EsmDispatcher, EsmEvent};
pub use pdn::PdnConnection;
pub use store::{SessionHandle, SessionStore};
pub use timer::EsmTimerMgr;
