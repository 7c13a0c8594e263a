//! EMM and ESM cause codes (TS 24.301 9.9.3.9 / 9.9.4.4)

use std::fmt;

/// EMM Cause codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EmmCause {
    /// Request accepted (no error)
    #[default]
    Success = 0,
    /// IMSI unknown in HSS
    ImsiUnknownInHss = 2,
    /// Illegal UE
    IllegalUe = 3,
    /// Illegal ME
    IllegalMe = 6,
    /// EPS services not allowed
    EpsServicesNotAllowed = 7,
    /// UE identity cannot be derived by the network
    UeIdentityCannotBeDerived = 9,
    /// Implicitly detached
    ImplicitlyDetached = 10,
    /// PLMN not allowed
    PlmnNotAllowed = 11,
    /// Tracking area not allowed
    TrackingAreaNotAllowed = 12,
    /// Network failure
    NetworkFailure = 17,
    /// Congestion
    Congestion = 22,
    /// No EPS bearer context activated
    NoEpsBearerContextActivated = 40,
    /// Severe network failure
    SevereNetworkFailure = 42,
    /// Semantically incorrect message
    SemanticallyIncorrectMessage = 95,
    /// Invalid mandatory information
    InvalidMandatoryInformation = 96,
    /// Message type non-existent or not implemented
    MessageTypeNonExistent = 97,
    /// Protocol error, unspecified
    ProtocolErrorUnspecified = 111,
}

impl EmmCause {
    /// Every cause value known to the MME
    pub const ALL: [EmmCause; 17] = [
        EmmCause::Success,
        EmmCause::ImsiUnknownInHss,
        EmmCause::IllegalUe,
        EmmCause::IllegalMe,
        EmmCause::EpsServicesNotAllowed,
        EmmCause::UeIdentityCannotBeDerived,
        EmmCause::ImplicitlyDetached,
        EmmCause::PlmnNotAllowed,
        EmmCause::TrackingAreaNotAllowed,
        EmmCause::NetworkFailure,
        EmmCause::Congestion,
        EmmCause::NoEpsBearerContextActivated,
        EmmCause::SevereNetworkFailure,
        EmmCause::SemanticallyIncorrectMessage,
        EmmCause::InvalidMandatoryInformation,
        EmmCause::MessageTypeNonExistent,
        EmmCause::ProtocolErrorUnspecified,
    ];
}

impl fmt::Display for EmmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EmmCause::Success => "SUCCESS",
            EmmCause::ImsiUnknownInHss => "IMSI_UNKNOWN_IN_HSS",
            EmmCause::IllegalUe => "ILLEGAL_UE",
            EmmCause::IllegalMe => "ILLEGAL_ME",
            EmmCause::EpsServicesNotAllowed => "EPS_SERVICES_NOT_ALLOWED",
            EmmCause::UeIdentityCannotBeDerived => "UE_IDENTITY_CANNOT_BE_DERIVED",
            EmmCause::ImplicitlyDetached => "IMPLICITLY_DETACHED",
            EmmCause::PlmnNotAllowed => "PLMN_NOT_ALLOWED",
            EmmCause::TrackingAreaNotAllowed => "TRACKING_AREA_NOT_ALLOWED",
            EmmCause::NetworkFailure => "NETWORK_FAILURE",
            EmmCause::Congestion => "CONGESTION",
            EmmCause::NoEpsBearerContextActivated => "NO_EPS_BEARER_CONTEXT_ACTIVATED",
            EmmCause::SevereNetworkFailure => "SEVERE_NETWORK_FAILURE",
            EmmCause::SemanticallyIncorrectMessage => "SEMANTICALLY_INCORRECT",
            EmmCause::InvalidMandatoryInformation => "INVALID_MANDATORY_INFO",
            EmmCause::MessageTypeNonExistent => "MESSAGE_TYPE_NOT_IMPLEMENTED",
            EmmCause::ProtocolErrorUnspecified => "PROTOCOL_ERROR",
        };
        write!(f, "{}({})", name, *self as u8)
    }
}

/// ESM Cause codes carried in UE reject messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EsmCause {
    /// Insufficient resources
    InsufficientResources = 26,
    /// Request rejected, unspecified
    RequestRejectedUnspecified = 31,
    /// Regular deactivation
    RegularDeactivation = 36,
    /// EPS QoS not accepted
    EpsQosNotAccepted = 37,
    /// Network failure
    NetworkFailure = 38,
    /// Semantic error in the TFT operation
    SemanticErrorInTftOperation = 41,
    /// Invalid EPS bearer identity
    InvalidEpsBearerIdentity = 43,
    /// PDN connection does not exist
    PdnConnectionDoesNotExist = 54,
    /// Collision with network initiated request
    CollisionWithNetworkInitiatedRequest = 56,
    /// Protocol error, unspecified
    ProtocolErrorUnspecified = 111,
}

impl fmt::Display for EsmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}
