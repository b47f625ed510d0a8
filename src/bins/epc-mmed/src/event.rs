//! Inbound MME events
//!
//! Decoded messages from the five peers plus operator triggers. The wire
//! codecs live outside the core; containers the MME only forwards stay opaque
//! `Bytes`.

use bytes::Bytes;

use crate::context::{
    AuthVector, Bitrate, ECgi, Ebi, EnbUeKey, EpsGuti, EpsTai, Fteid, MmeUeS1apId, Paa, PdnType,
    Qos, SubscriptionData, UeNetworkCapability,
};
use crate::nas_build::EmmCause;
use crate::s11_build::GtpCause;
use crate::s1ap_build::S1apCause;

// ============================================================================
// NAS (uplink)
// ============================================================================

/// EPS attach type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpsAttachType {
    #[default]
    EpsAttach,
    CombinedEpsImsiAttach,
    EmergencyAttach,
}

/// Mobile identity carried by Attach Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MobileIdentity {
    #[default]
    None,
    Imsi(String),
    Guti(EpsGuti),
    Imei(String),
}

/// PDN Connectivity Request piggybacked on Attach Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdnConnectivityRequest {
    pub pti: u8,
    pub pdn_type: PdnType,
    pub apn: Option<String>,
    pub pco: Bytes,
}

/// Attach Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachRequest {
    pub attach_type: EpsAttachType,
    pub ksi: u8,
    pub identity: MobileIdentity,
    pub ue_network_capability: UeNetworkCapability,
    pub last_visited_tai: Option<EpsTai>,
    pub pdn: PdnConnectivityRequest,
}

impl AttachRequest {
    pub fn imsi(&self) -> Option<&str> {
        match &self.identity {
            MobileIdentity::Imsi(imsi) => Some(imsi),
            _ => None,
        }
    }

    pub fn guti(&self) -> Option<&EpsGuti> {
        match &self.identity {
            MobileIdentity::Guti(guti) => Some(guti),
            _ => None,
        }
    }
}

/// Identity Response contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResponse {
    Imsi(String),
    Imeisv(String),
}

/// Uplink NAS messages handled by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasUplink {
    AttachRequest(AttachRequest),
    AttachComplete,
    IdentityResponse(IdentityResponse),
    AuthenticationResponse { res: Bytes },
    AuthenticationFailure { cause: EmmCause },
    SecurityModeComplete { imeisv: Option<String> },
    SecurityModeReject { cause: EmmCause },
    DetachRequest { switch_off: bool },
    DetachAccept,
    ServiceRequest { ksi: u8 },
    ActivateDedicatedBearerAccept { ebi: Ebi },
    ActivateDedicatedBearerReject { ebi: Ebi },
    DeactivateBearerAccept { ebi: Ebi },
}

impl NasUplink {
    pub fn name(&self) -> &'static str {
        match self {
            NasUplink::AttachRequest(_) => "Attach request",
            NasUplink::AttachComplete => "Attach complete",
            NasUplink::IdentityResponse(_) => "Identity response",
            NasUplink::AuthenticationResponse { .. } => "Authentication response",
            NasUplink::AuthenticationFailure { .. } => "Authentication failure",
            NasUplink::SecurityModeComplete { .. } => "Security mode complete",
            NasUplink::SecurityModeReject { .. } => "Security mode reject",
            NasUplink::DetachRequest { .. } => "Detach request",
            NasUplink::DetachAccept => "Detach accept",
            NasUplink::ServiceRequest { .. } => "Service request",
            NasUplink::ActivateDedicatedBearerAccept { .. } => "Activate dedicated EPS bearer context accept",
            NasUplink::ActivateDedicatedBearerReject { .. } => "Activate dedicated EPS bearer context reject",
            NasUplink::DeactivateBearerAccept { .. } => "Deactivate EPS bearer context accept",
        }
    }
}

/// Uplink NAS PDU after security processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasPdu {
    pub message: NasUplink,
    /// The PDU passed integrity checking with the current security context
    pub integrity_ok: bool,
}

impl NasPdu {
    pub fn plain(message: NasUplink) -> Self {
        Self { message, integrity_ok: false }
    }

    pub fn protected(message: NasUplink) -> Self {
        Self { message, integrity_ok: true }
    }
}

// ============================================================================
// S1AP
// ============================================================================

/// E-RAB admitted by an eNB, with its raw S1-U transport address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErabAdmitted {
    pub ebi: Ebi,
    pub transport_addr: Bytes,
    pub teid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialUeMessage {
    pub enb_ue_key: EnbUeKey,
    pub sctp_assoc_id: u32,
    pub tai: EpsTai,
    pub ecgi: ECgi,
    /// S-TMSI / GUTI known from the RRC connection
    pub guti: Option<EpsGuti>,
    pub nas: NasPdu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkNasTransport {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_key: EnbUeKey,
    pub nas: NasPdu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialContextSetupResponse {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub setup: Vec<ErabAdmitted>,
    pub failed: Vec<Ebi>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverRequired {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub target_enb_id: u32,
    pub target_tai: EpsTai,
    pub cause: S1apCause,
    pub container: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverRequestAcknowledge {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    /// eNB UE key allocated by the target
    pub target: EnbUeKey,
    pub admitted: Vec<ErabAdmitted>,
    pub not_admitted: Vec<Ebi>,
    pub container: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverNotify {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_key: EnbUeKey,
    pub tai: EpsTai,
    pub ecgi: ECgi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSwitchRequest {
    /// MME UE S1AP ID as known by the source eNB
    pub source_mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_key: EnbUeKey,
    pub tai: EpsTai,
    pub ecgi: ECgi,
    pub to_be_switched: Vec<ErabAdmitted>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apEvent {
    InitialUeMessage(InitialUeMessage),
    UplinkNasTransport(UplinkNasTransport),
    InitialContextSetupResponse(InitialContextSetupResponse),
    InitialContextSetupFailure { mme_ue_s1ap_id: MmeUeS1apId, cause: S1apCause },
    UeContextReleaseRequest { mme_ue_s1ap_id: MmeUeS1apId, cause: S1apCause },
    UeContextReleaseComplete { mme_ue_s1ap_id: MmeUeS1apId },
    HandoverRequired(HandoverRequired),
    HandoverRequestAcknowledge(HandoverRequestAcknowledge),
    HandoverFailure { mme_ue_s1ap_id: MmeUeS1apId, cause: S1apCause },
    HandoverNotify(HandoverNotify),
    HandoverCancel { mme_ue_s1ap_id: MmeUeS1apId, cause: S1apCause },
    PathSwitchRequest(PathSwitchRequest),
    ERabModificationIndication { mme_ue_s1ap_id: MmeUeS1apId, modified: Vec<ErabAdmitted> },
}

// ============================================================================
// S11
// ============================================================================

/// Bearer context in a Create Session Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerContextCreated {
    pub ebi: Ebi,
    pub cause: GtpCause,
    pub sgw_s1u: Fteid,
    pub pgw_s5u: Option<Fteid>,
    pub qos: Option<Qos>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionResponse {
    pub teid: u32,
    pub seq: u32,
    pub cause: GtpCause,
    pub sgw_s11: Option<Fteid>,
    pub pgw_s5c: Option<Fteid>,
    pub paa: Option<Paa>,
    pub apn_ambr: Option<Bitrate>,
    pub pco: Bytes,
    pub bearers: Vec<BearerContextCreated>,
}

/// Bearer context in a Modify Bearer Response removal section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerContextRemoved {
    pub ebi: Ebi,
    pub cause: GtpCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyBearerResponse {
    pub teid: u32,
    pub seq: u32,
    pub cause: GtpCause,
    pub removed: Vec<BearerContextRemoved>,
}

/// Bearer to be created in a Create Bearer Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToBeCreated {
    pub sgw_s1u: Fteid,
    pub pgw_s5u: Option<Fteid>,
    pub qos: Qos,
    pub tft: Bytes,
}

/// Create Bearer Request from the SGW. Also the pending-queue entry while the
/// UE is paged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBearerRequest {
    pub teid: u32,
    pub seq: u32,
    pub linked_ebi: Ebi,
    pub pti: u8,
    pub bearers: Vec<BearerToBeCreated>,
    pub pco: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBearerRequest {
    pub teid: u32,
    pub seq: u32,
    /// Present when the whole PDN connection is deleted
    pub linked_ebi: Option<Ebi>,
    pub ebis: Vec<Ebi>,
    pub cause: Option<GtpCause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S11Event {
    CreateSessionResponse(CreateSessionResponse),
    ModifyBearerResponse(ModifyBearerResponse),
    DeleteSessionResponse { teid: u32, seq: u32, cause: GtpCause },
    CreateBearerRequest(CreateBearerRequest),
    DeleteBearerRequest(DeleteBearerRequest),
    ReleaseAccessBearersResponse { teid: u32, cause: GtpCause },
    DownlinkDataNotification { teid: u32, seq: u32, ebi: Ebi },
}

// ============================================================================
// S6a / SGs
// ============================================================================

/// Diameter experimental result for an unknown subscriber
pub const DIAMETER_ERROR_USER_UNKNOWN: u32 = 5001;
/// Diameter unable to comply
pub const DIAMETER_UNABLE_TO_COMPLY: u32 = 5012;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S6aEvent {
    AuthenticationInformationAnswer {
        imsi: String,
        result: Result<AuthVector, u32>,
    },
    UpdateLocationAnswer {
        imsi: String,
        result: Result<SubscriptionData, u32>,
    },
    CancelLocationRequest { imsi: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgsapEvent {
    LocationUpdateAccept { imsi: String },
    LocationUpdateReject { imsi: String, cause: u8 },
}

// ============================================================================
// MME Event
// ============================================================================

/// Inbound event handed to `MmeApp::dispatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmeEvent {
    S1ap(S1apEvent),
    S11(S11Event),
    S6a(S6aEvent),
    Sgsap(SgsapEvent),
    /// Operator-triggered network detach
    OperatorDetach { imsi: String },
}

impl MmeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MmeEvent::S1ap(_) => "S1AP_MESSAGE",
            MmeEvent::S11(_) => "S11_MESSAGE",
            MmeEvent::S6a(_) => "S6A_MESSAGE",
            MmeEvent::Sgsap(_) => "SGSAP_MESSAGE",
            MmeEvent::OperatorDetach { .. } => "OPERATOR_DETACH",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_request_identity() {
        let req = AttachRequest {
            identity: MobileIdentity::Imsi("001010000000001".to_string()),
            ..Default::default()
        };
        assert_eq!(req.imsi(), Some("001010000000001"));
        assert!(req.guti().is_none());
    }

    #[test]
    fn test_event_names() {
        let ev = MmeEvent::OperatorDetach { imsi: "001010000000001".to_string() };
        assert_eq!(ev.name(), "OPERATOR_DETACH");
        assert_eq!(NasUplink::AttachComplete.name(), "Attach complete");
    }
}
