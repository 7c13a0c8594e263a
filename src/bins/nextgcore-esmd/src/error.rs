//! ESM error types

use thiserror::Error;

use crate::context::{Ebi, MmeUeS1apId, PdnCid};
use crate::ebr::{EbrEvent, EsmEbrState};

/// ESM error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EsmError {
    /// No session exists for the subscriber
    #[error("Invalid subscriber: ue_id={0}")]
    InvalidSubscriber(MmeUeS1apId),

    /// A session already exists for the subscriber
    #[error("Duplicate subscriber: ue_id={0}")]
    DuplicateSubscriber(MmeUeS1apId),

    /// Every PDN connection slot is in use
    #[error("Too many PDN connections (max={0})")]
    TooManyConnections(usize),

    /// Every EPS bearer identity is in use
    #[error("No free EPS bearer identity")]
    NoFreeBearerIdentity,

    /// Bearer or connection released before reaching INACTIVE
    #[error("Invalid teardown order: {0}")]
    InvalidTeardownOrder(String),

    #[error("Invalid transition: {event} in state {from}")]
    InvalidTransition { from: EsmEbrState, event: EbrEvent },

    /// Bearer would leave a pending state with its retransmission timer armed
    #[error("Retransmission timer running: ebi={0}")]
    TimerRunning(Ebi),

    /// No retransmission timer guards the bearer's state
    #[error("No retransmission timer for ebi={ebi} in state {state}")]
    NoTimerForState { ebi: Ebi, state: EsmEbrState },

    #[error("Bearer not found: ebi={0}")]
    BearerNotFound(Ebi),

    #[error("PDN connection not found: cid={0}")]
    PdnNotFound(PdnCid),

    /// Procedure applies to default bearers only, or to dedicated bearers only
    #[error("Wrong bearer kind: ebi={0}")]
    WrongBearerKind(Ebi),

    /// Null SAP primitive
    #[error("Null SAP primitive")]
    NullPrimitive,

    /// The access stratum collaborator failed to take the primitive
    #[error("Downstream send failed: {0}")]
    DownstreamSendFailed(String),
}

/// Result type for ESM operations
pub type EsmResult<T> = Result<T, EsmError>;
