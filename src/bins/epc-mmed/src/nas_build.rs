//! NAS Message Building
//!
//! Downlink EMM/ESM messages as value objects. Values are copied out of the
//! UE context at build time; integrity protection and ciphering happen in
//! the codec layer.

use bytes::Bytes;

use crate::bearer::{self, BearerContext, PdnContext};
use crate::context::{Bitrate, Ebi, EpsGuti, EpsTai, Paa, Qos, UeContext, UeNetworkCapability};
use crate::error::{MmeError, MmeResult, SessionError};
use crate::s11_build::GtpCause;

// ============================================================================
// EMM Cause Codes (3GPP TS 24.301)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmmCause {
    ImsiUnknownInHss = 2,
    IllegalUe = 3,
    ImeiNotAccepted = 5,
    IllegalMe = 6,
    EpsServicesNotAllowed = 7,
    UeIdentityCannotBeDerived = 9,
    ImplicitlyDetached = 10,
    NetworkFailure = 17,
    EsmFailure = 19,
    MacFailure = 20,
    SynchFailure = 21,
    Congestion = 22,
    UeSecurityCapabilitiesMismatch = 23,
    SecurityModeRejectedUnspecified = 24,
    SemanticallyIncorrectMessage = 95,
    InvalidMandatoryInformation = 96,
    ProtocolErrorUnspecified = 111,
}

impl EmmCause {
    pub fn label(&self) -> &'static str {
        match self {
            EmmCause::ImsiUnknownInHss => "imsi_unknown_in_hss",
            EmmCause::IllegalUe => "illegal_ue",
            EmmCause::ImeiNotAccepted => "imei_not_accepted",
            EmmCause::IllegalMe => "illegal_me",
            EmmCause::EpsServicesNotAllowed => "eps_services_not_allowed",
            EmmCause::UeIdentityCannotBeDerived => "ue_identity_cannot_be_derived",
            EmmCause::ImplicitlyDetached => "implicitly_detached",
            EmmCause::NetworkFailure => "network_failure",
            EmmCause::EsmFailure => "esm_failure",
            EmmCause::MacFailure => "mac_failure",
            EmmCause::SynchFailure => "synch_failure",
            EmmCause::Congestion => "congestion",
            EmmCause::UeSecurityCapabilitiesMismatch => "ue_security_capabilities_mismatch",
            EmmCause::SecurityModeRejectedUnspecified => "security_mode_rejected",
            EmmCause::SemanticallyIncorrectMessage => "semantically_incorrect_message",
            EmmCause::InvalidMandatoryInformation => "invalid_mandatory_information",
            EmmCause::ProtocolErrorUnspecified => "protocol_error",
        }
    }
}

// ============================================================================
// ESM Cause Codes (3GPP TS 24.301)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EsmCause {
    InsufficientResources = 26,
    MissingOrUnknownApn = 27,
    UnknownPdnType = 28,
    RequestRejectedByGw = 30,
    RequestRejectedUnspecified = 31,
    ServiceOptionNotSupported = 32,
    RegularDeactivation = 36,
    NetworkFailure = 38,
    SemanticErrorInTftOperation = 41,
    SyntacticalErrorInTftOperation = 42,
    InvalidEpsBearerIdentity = 43,
    SemanticErrorsInPacketFilters = 44,
    SyntacticalErrorsInPacketFilters = 45,
    ProtocolErrorUnspecified = 111,
}

/// Map a GTP cause from the SGW onto the ESM cause sent to the UE
pub fn esm_cause_from_gtp(cause: GtpCause) -> EsmCause {
    match cause {
        GtpCause::ContextNotFound => EsmCause::InvalidEpsBearerIdentity,
        GtpCause::ServiceNotSupported => EsmCause::ServiceOptionNotSupported,
        GtpCause::NoResourcesAvailable => EsmCause::InsufficientResources,
        GtpCause::MissingOrUnknownApn => EsmCause::MissingOrUnknownApn,
        GtpCause::SemanticErrorInTftOperation => EsmCause::SemanticErrorInTftOperation,
        GtpCause::SyntacticErrorInTftOperation => EsmCause::SyntacticalErrorInTftOperation,
        GtpCause::SemanticErrorsInPacketFilter => EsmCause::SemanticErrorsInPacketFilters,
        GtpCause::SyntacticErrorsInPacketFilter => EsmCause::SyntacticalErrorsInPacketFilters,
        GtpCause::RequestRejected => EsmCause::RequestRejectedByGw,
        _ => EsmCause::NetworkFailure,
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Identity type 2 requested from the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityType {
    Imsi,
    Imeisv,
}

/// EPS attach result in Attach Accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpsAttachResult {
    EpsOnly,
    CombinedEpsImsi,
}

/// Network-initiated detach type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachType {
    ReattachRequired,
    ReattachNotRequired,
    ImsiDetach,
}

/// ESM messages (carried in an EMM container or E-RAB request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsmMessage {
    ActivateDefaultBearerRequest {
        ebi: Ebi,
        pti: u8,
        apn: String,
        paa: Option<Paa>,
        qos: Qos,
        apn_ambr: Bitrate,
        pco: Bytes,
    },
    ActivateDedicatedBearerRequest {
        ebi: Ebi,
        linked_ebi: Ebi,
        pti: u8,
        qos: Qos,
        tft: Bytes,
    },
    DeactivateBearerRequest {
        ebi: Ebi,
        pti: u8,
        cause: EsmCause,
    },
    PdnConnectivityReject {
        pti: u8,
        cause: EsmCause,
    },
}

/// Downlink NAS messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasMessage {
    AttachAccept {
        guti: EpsGuti,
        tai_list: Vec<EpsTai>,
        result: EpsAttachResult,
        esm: EsmMessage,
    },
    AttachReject {
        cause: EmmCause,
        esm: Option<EsmMessage>,
    },
    IdentityRequest {
        identity_type: IdentityType,
    },
    AuthenticationRequest {
        ksi: u8,
        rand: Bytes,
        autn: Bytes,
    },
    AuthenticationReject,
    SecurityModeCommand {
        ksi: u8,
        eea: u8,
        eia: u8,
        replayed_capability: UeNetworkCapability,
        imeisv_request: bool,
    },
    DetachRequest {
        detach_type: DetachType,
        cause: Option<EmmCause>,
    },
    DetachAccept,
    ServiceReject {
        cause: EmmCause,
    },
    Esm(EsmMessage),
}

impl NasMessage {
    pub fn name(&self) -> &'static str {
        match self {
            NasMessage::AttachAccept { .. } => "Attach accept",
            NasMessage::AttachReject { .. } => "Attach reject",
            NasMessage::IdentityRequest { .. } => "Identity request",
            NasMessage::AuthenticationRequest { .. } => "Authentication request",
            NasMessage::AuthenticationReject => "Authentication reject",
            NasMessage::SecurityModeCommand { .. } => "Security mode command",
            NasMessage::DetachRequest { .. } => "Detach request",
            NasMessage::DetachAccept => "Detach accept",
            NasMessage::ServiceReject { .. } => "Service reject",
            NasMessage::Esm(_) => "ESM message",
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Activate Default EPS Bearer Context Request for the PDN's default bearer
pub fn build_activate_default_bearer_request(
    pdn: &PdnContext,
    bearer: &BearerContext,
) -> EsmMessage {
    EsmMessage::ActivateDefaultBearerRequest {
        ebi: bearer.ebi,
        pti: bearer.pti,
        apn: pdn.apn.clone(),
        paa: pdn.paa,
        qos: bearer.qos,
        apn_ambr: pdn.apn_ambr,
        pco: pdn.pco.clone(),
    }
}

/// Attach Accept carrying the default bearer activation of `cid`
pub fn build_attach_accept(
    ue: &UeContext,
    cid: usize,
    tai_list: Vec<EpsTai>,
    combined: bool,
) -> MmeResult<NasMessage> {
    let guti = ue.guti.ok_or_else(|| {
        MmeError::InvalidState(ue.mme_ue_s1ap_id, "no GUTI for attach accept".to_string())
    })?;
    let pdn = bearer::pdn_context(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    let ebi = pdn.default_ebi.ok_or(SessionError::NoPdn(cid))?;
    let default = bearer::get_bearer_context(ue, ebi).ok_or(SessionError::NoBearer(ebi))?;

    Ok(NasMessage::AttachAccept {
        guti,
        tai_list,
        result: if combined {
            EpsAttachResult::CombinedEpsImsi
        } else {
            EpsAttachResult::EpsOnly
        },
        esm: build_activate_default_bearer_request(pdn, default),
    })
}

/// Attach Reject. The ESM container is only carried for ESM_FAILURE.
pub fn build_attach_reject(cause: EmmCause, esm_cause: Option<EsmCause>, pti: u8) -> NasMessage {
    let esm = match cause {
        EmmCause::EsmFailure => Some(EsmMessage::PdnConnectivityReject {
            pti,
            cause: esm_cause.unwrap_or(EsmCause::NetworkFailure),
        }),
        _ => None,
    };
    NasMessage::AttachReject { cause, esm }
}

pub fn build_identity_request(identity_type: IdentityType) -> NasMessage {
    NasMessage::IdentityRequest { identity_type }
}

pub fn build_authentication_request(ue: &UeContext) -> MmeResult<NasMessage> {
    let vector = ue.auth_vector.as_ref().ok_or_else(|| {
        MmeError::InvalidState(ue.mme_ue_s1ap_id, "no authentication vector".to_string())
    })?;
    Ok(NasMessage::AuthenticationRequest {
        ksi: ue.security.ksi,
        rand: vector.rand.clone(),
        autn: vector.autn.clone(),
    })
}

pub fn build_security_mode_command(ue: &UeContext, imeisv_request: bool) -> NasMessage {
    NasMessage::SecurityModeCommand {
        ksi: ue.security.ksi,
        eea: ue.security.eea,
        eia: ue.security.eia,
        replayed_capability: ue.ue_network_capability,
        imeisv_request,
    }
}

pub fn build_activate_dedicated_bearer_request(bearer: &BearerContext, linked_ebi: Ebi) -> NasMessage {
    NasMessage::Esm(EsmMessage::ActivateDedicatedBearerRequest {
        ebi: bearer.ebi,
        linked_ebi,
        pti: bearer.pti,
        qos: bearer.qos,
        tft: bearer.tft.clone(),
    })
}

pub fn build_deactivate_bearer_request(bearer: &BearerContext, cause: EsmCause) -> NasMessage {
    NasMessage::Esm(EsmMessage::DeactivateBearerRequest {
        ebi: bearer.ebi,
        pti: bearer.pti,
        cause,
    })
}
