//! S11 GTPv2-C Message Building
//!
//! SGW-facing messages as value objects.

use crate::bearer;
use crate::context::{Bitrate, Ebi, Fteid, FteidInterface, IpAddr, PdnCid, PdnType, Qos, UeContext};
use crate::error::SessionError;

// ============================================================================
// GTP Cause
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GtpCause {
    #[default]
    Reserved = 0,
    RequestAccepted = 16,
    RequestAcceptedPartially = 17,
    ContextNotFound = 64,
    InvalidMessageFormat = 65,
    ServiceNotSupported = 68,
    MandatoryIeIncorrect = 69,
    MandatoryIeMissing = 70,
    SystemFailure = 72,
    NoResourcesAvailable = 73,
    SemanticErrorInTftOperation = 74,
    SyntacticErrorInTftOperation = 75,
    SemanticErrorsInPacketFilter = 76,
    SyntacticErrorsInPacketFilter = 77,
    MissingOrUnknownApn = 78,
    RequestRejected = 94,
    UnableToPageUe = 90,
}

impl From<u8> for GtpCause {
    fn from(value: u8) -> Self {
        match value {
            16 => GtpCause::RequestAccepted,
            17 => GtpCause::RequestAcceptedPartially,
            64 => GtpCause::ContextNotFound,
            65 => GtpCause::InvalidMessageFormat,
            68 => GtpCause::ServiceNotSupported,
            69 => GtpCause::MandatoryIeIncorrect,
            70 => GtpCause::MandatoryIeMissing,
            72 => GtpCause::SystemFailure,
            73 => GtpCause::NoResourcesAvailable,
            74 => GtpCause::SemanticErrorInTftOperation,
            75 => GtpCause::SyntacticErrorInTftOperation,
            76 => GtpCause::SemanticErrorsInPacketFilter,
            77 => GtpCause::SyntacticErrorsInPacketFilter,
            78 => GtpCause::MissingOrUnknownApn,
            90 => GtpCause::UnableToPageUe,
            94 => GtpCause::RequestRejected,
            _ => GtpCause::Reserved,
        }
    }
}

impl GtpCause {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GtpCause::RequestAccepted | GtpCause::RequestAcceptedPartially)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Bearer context in a Modify Bearer Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerToBeModified {
    pub ebi: Ebi,
    pub enb_s1u: Fteid,
}

/// Per-bearer result in Create/Delete Bearer Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerResult {
    pub ebi: Option<Ebi>,
    pub sgw_s1u_teid: u32,
    pub enb_s1u: Option<Fteid>,
    pub cause: GtpCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub imsi: String,
    pub msisdn: Option<String>,
    pub imeisv: Option<String>,
    pub mme_s11: Fteid,
    pub apn: String,
    pub pdn_type: PdnType,
    pub default_ebi: Ebi,
    pub bearer_qos: Qos,
    pub apn_ambr: Bitrate,
    pub ue_ambr: Bitrate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyBearerRequest {
    pub sgw_s11_teid: u32,
    pub to_be_modified: Vec<BearerToBeModified>,
    pub to_be_removed: Vec<Ebi>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S11Message {
    CreateSessionRequest(CreateSessionRequest),
    ModifyBearerRequest(ModifyBearerRequest),
    DeleteSessionRequest {
        sgw_s11_teid: u32,
        linked_ebi: Ebi,
    },
    ReleaseAccessBearersRequest {
        sgw_s11_teid: u32,
    },
    CreateBearerResponse {
        sgw_s11_teid: u32,
        cause: GtpCause,
        bearers: Vec<BearerResult>,
    },
    DeleteBearerResponse {
        sgw_s11_teid: u32,
        cause: GtpCause,
        bearers: Vec<BearerResult>,
    },
    DownlinkDataNotificationAck {
        sgw_s11_teid: u32,
        cause: GtpCause,
    },
}

impl S11Message {
    pub fn name(&self) -> &'static str {
        match self {
            S11Message::CreateSessionRequest(_) => "Create Session Request",
            S11Message::ModifyBearerRequest(_) => "Modify Bearer Request",
            S11Message::DeleteSessionRequest { .. } => "Delete Session Request",
            S11Message::ReleaseAccessBearersRequest { .. } => "Release Access Bearers Request",
            S11Message::CreateBearerResponse { .. } => "Create Bearer Response",
            S11Message::DeleteBearerResponse { .. } => "Delete Bearer Response",
            S11Message::DownlinkDataNotificationAck { .. } => "Downlink Data Notification Ack",
        }
    }
}

/// Transaction wrapper: sequence number plus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtpXact {
    pub seq: u32,
    pub message: S11Message,
}

// ============================================================================
// Builders
// ============================================================================

/// Create Session Request for the default bearer of `cid`
pub fn build_create_session_request(
    ue: &UeContext,
    cid: PdnCid,
    mme_addr: IpAddr,
) -> Result<S11Message, SessionError> {
    let pdn = bearer::pdn_context(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    let ebi = pdn.default_ebi.ok_or(SessionError::NoPdn(cid))?;
    let default = bearer::get_bearer_context(ue, ebi).ok_or(SessionError::NoBearer(ebi))?;
    let subscription = ue.subscription.as_ref();

    Ok(S11Message::CreateSessionRequest(CreateSessionRequest {
        imsi: ue.imsi.clone().unwrap_or_default(),
        msisdn: subscription.and_then(|s| s.msisdn.clone()),
        imeisv: ue.imeisv.clone(),
        mme_s11: Fteid {
            interface: FteidInterface::S11MmeGtpC,
            teid: ue.mme_s11_teid,
            addr: mme_addr,
        },
        apn: pdn.apn.clone(),
        pdn_type: pdn.pdn_type,
        default_ebi: ebi,
        bearer_qos: default.qos,
        apn_ambr: pdn.apn_ambr,
        ue_ambr: ue.ue_ambr,
    }))
}

pub fn build_delete_session_request(ue: &UeContext, cid: PdnCid) -> Result<S11Message, SessionError> {
    let pdn = bearer::pdn_context(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    let sgw_s11_teid = pdn.sgw_s11_teid().ok_or(SessionError::NoSgwTunnel(cid))?;
    Ok(S11Message::DeleteSessionRequest {
        sgw_s11_teid,
        linked_ebi: pdn.default_ebi.unwrap_or_default(),
    })
}

pub fn build_release_access_bearers_request(
    ue: &UeContext,
    cid: PdnCid,
) -> Result<S11Message, SessionError> {
    let pdn = bearer::pdn_context(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    let sgw_s11_teid = pdn.sgw_s11_teid().ok_or(SessionError::NoSgwTunnel(cid))?;
    Ok(S11Message::ReleaseAccessBearersRequest { sgw_s11_teid })
}

/// Aggregate Create Bearer Response: accepted if any bearer was accepted
pub fn build_create_bearer_response(sgw_s11_teid: u32, bearers: Vec<BearerResult>) -> S11Message {
    let cause = if bearers.iter().any(|b| b.cause.is_accepted()) {
        GtpCause::RequestAccepted
    } else {
        GtpCause::RequestRejected
    };
    S11Message::CreateBearerResponse {
        sgw_s11_teid,
        cause,
        bearers,
    }
}

pub fn build_delete_bearer_response(sgw_s11_teid: u32, bearers: Vec<BearerResult>) -> S11Message {
    let cause = if bearers.is_empty() || bearers.iter().any(|b| b.cause.is_accepted()) {
        GtpCause::RequestAccepted
    } else {
        GtpCause::ContextNotFound
    };
    S11Message::DeleteBearerResponse {
        sgw_s11_teid,
        cause,
        bearers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::{create_bearer_context, create_pdn_context, pdn_context_mut};

    fn result(ebi: Ebi, cause: GtpCause) -> BearerResult {
        BearerResult {
            ebi: Some(ebi),
            sgw_s1u_teid: 0,
            enb_s1u: None,
            cause,
        }
    }

    #[test]
    fn test_gtp_cause_from_u8() {
        assert_eq!(GtpCause::from(16), GtpCause::RequestAccepted);
        assert_eq!(GtpCause::from(73), GtpCause::NoResourcesAvailable);
        assert_eq!(GtpCause::from(200), GtpCause::Reserved);
        assert!(GtpCause::RequestAcceptedPartially.is_accepted());
        assert!(!GtpCause::ContextNotFound.is_accepted());
    }

    #[test]
    fn test_create_bearer_response_cause() {
        let msg = build_create_bearer_response(
            1,
            vec![result(6, GtpCause::RequestAccepted), result(7, GtpCause::NoResourcesAvailable)],
        );
        assert!(matches!(
            msg,
            S11Message::CreateBearerResponse { cause: GtpCause::RequestAccepted, .. }
        ));

        let msg = build_create_bearer_response(1, vec![result(6, GtpCause::RequestRejected)]);
        assert!(matches!(
            msg,
            S11Message::CreateBearerResponse { cause: GtpCause::RequestRejected, .. }
        ));
    }

    #[test]
    fn test_delete_session_requires_sgw_tunnel() {
        let mut ue = UeContext::default();
        let cid = create_pdn_context(&mut ue, "internet").unwrap();
        create_bearer_context(&mut ue, cid, None, true).unwrap();
        assert_eq!(
            build_delete_session_request(&ue, cid),
            Err(SessionError::NoSgwTunnel(cid))
        );

        pdn_context_mut(&mut ue, cid).unwrap().sgw_s11 = Some(Fteid {
            interface: FteidInterface::S11S4SgwGtpC,
            teid: 0x55,
            addr: IpAddr::default(),
        });
        assert_eq!(
            build_delete_session_request(&ue, cid),
            Ok(S11Message::DeleteSessionRequest { sgw_s11_teid: 0x55, linked_ebi: 5 })
        );
    }
}
