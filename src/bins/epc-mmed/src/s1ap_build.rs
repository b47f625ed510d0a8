//! S1AP Message Building
//!
//! eNB-facing messages as value objects. NAS PDUs ride inside them.

use bytes::Bytes;

use crate::bearer;
use crate::context::{Bitrate, Ebi, EnbUeKey, EpsTai, Fteid, MmeUeS1apId, Qos, STmsi, UeContext};
use crate::error::{MmeError, MmeResult};
use crate::nas_build::NasMessage;

// ============================================================================
// S1AP Cause
// ============================================================================

/// S1AP Cause group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S1apCauseGroup {
    RadioNetwork,
    Transport,
    Nas,
    Protocol,
    Misc,
}

/// S1AP Cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S1apCause {
    pub group: S1apCauseGroup,
    pub cause: u8,
}

impl S1apCause {
    pub const fn new(group: S1apCauseGroup, cause: u8) -> Self {
        Self { group, cause }
    }
}

/// Radio network cause values
pub mod radio_network_cause {
    pub const UNSPECIFIED: u8 = 0;
    pub const SUCCESSFUL_HANDOVER: u8 = 2;
    pub const RELEASE_DUE_TO_EUTRAN_GENERATED_REASON: u8 = 3;
    pub const HANDOVER_CANCELLED: u8 = 4;
    pub const UNKNOWN_MME_UE_S1AP_ID: u8 = 13;
    pub const USER_INACTIVITY: u8 = 20;
    pub const RADIO_CONNECTION_WITH_UE_LOST: u8 = 21;
    pub const HO_FAILURE_IN_TARGET_EPC_ENB_OR_TARGET_SYSTEM: u8 = 8;
}

/// NAS cause values
pub mod nas_cause {
    pub const NORMAL_RELEASE: u8 = 0;
    pub const AUTHENTICATION_FAILURE: u8 = 1;
    pub const DETACH: u8 = 2;
    pub const UNSPECIFIED: u8 = 3;
}

// ============================================================================
// Messages
// ============================================================================

/// UE association on the S1 interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UeS1apIds {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_key: EnbUeKey,
}

/// E-RAB to be set up (ICS / E-RAB setup / handover request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErabToBeSetup {
    pub ebi: Ebi,
    pub qos: Qos,
    pub sgw_s1u: Option<Fteid>,
    pub nas: Option<NasMessage>,
}

/// CN domain for paging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnDomain {
    Ps,
    Cs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apMessage {
    DownlinkNasTransport {
        ids: UeS1apIds,
        nas: NasMessage,
    },
    InitialContextSetupRequest {
        ids: UeS1apIds,
        ue_ambr: Bitrate,
        erabs: Vec<ErabToBeSetup>,
        kasme: Bytes,
        /// Attach Accept when sent as part of attach
        nas: Option<NasMessage>,
    },
    ERabSetupRequest {
        ids: UeS1apIds,
        erabs: Vec<ErabToBeSetup>,
    },
    ERabReleaseCommand {
        ids: UeS1apIds,
        ebis: Vec<Ebi>,
        nas: NasMessage,
    },
    UeContextReleaseCommand {
        ids: UeS1apIds,
        cause: S1apCause,
    },
    Paging {
        s_tmsi: STmsi,
        tai_list: Vec<EpsTai>,
        domain: CnDomain,
    },
    HandoverRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        target_enb_id: u32,
        cause: S1apCause,
        ue_ambr: Bitrate,
        erabs: Vec<ErabToBeSetup>,
        container: Bytes,
    },
    HandoverCommand {
        ids: UeS1apIds,
        not_admitted: Vec<Ebi>,
        container: Bytes,
    },
    HandoverPreparationFailure {
        ids: UeS1apIds,
        cause: S1apCause,
    },
    HandoverCancelAcknowledge {
        ids: UeS1apIds,
    },
    PathSwitchRequestAcknowledge {
        ids: UeS1apIds,
        released: Vec<Ebi>,
    },
    PathSwitchRequestFailure {
        ids: UeS1apIds,
        cause: S1apCause,
    },
    ERabModificationConfirm {
        ids: UeS1apIds,
        modified: Vec<Ebi>,
    },
}

impl S1apMessage {
    pub fn name(&self) -> &'static str {
        match self {
            S1apMessage::DownlinkNasTransport { .. } => "DownlinkNASTransport",
            S1apMessage::InitialContextSetupRequest { .. } => "InitialContextSetupRequest",
            S1apMessage::ERabSetupRequest { .. } => "E-RABSetupRequest",
            S1apMessage::ERabReleaseCommand { .. } => "E-RABReleaseCommand",
            S1apMessage::UeContextReleaseCommand { .. } => "UEContextReleaseCommand",
            S1apMessage::Paging { .. } => "Paging",
            S1apMessage::HandoverRequest { .. } => "HandoverRequest",
            S1apMessage::HandoverCommand { .. } => "HandoverCommand",
            S1apMessage::HandoverPreparationFailure { .. } => "HandoverPreparationFailure",
            S1apMessage::HandoverCancelAcknowledge { .. } => "HandoverCancelAcknowledge",
            S1apMessage::PathSwitchRequestAcknowledge { .. } => "PathSwitchRequestAcknowledge",
            S1apMessage::PathSwitchRequestFailure { .. } => "PathSwitchRequestFailure",
            S1apMessage::ERabModificationConfirm { .. } => "E-RABModificationConfirm",
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// S1 identities of a connected UE
pub fn ue_ids(ue: &UeContext) -> MmeResult<UeS1apIds> {
    let enb_ue_key = ue.enb_ue_key.ok_or_else(|| {
        MmeError::InvalidState(ue.mme_ue_s1ap_id, "no S1 connection".to_string())
    })?;
    Ok(UeS1apIds {
        mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
        enb_ue_key,
    })
}

/// E-RAB list for every bearer of the UE
pub fn build_erab_list(ue: &UeContext) -> Vec<ErabToBeSetup> {
    ue.bearers
        .iter()
        .flatten()
        .map(|b| ErabToBeSetup {
            ebi: b.ebi,
            qos: b.qos,
            sgw_s1u: b.sgw_s1u,
            nas: None,
        })
        .collect()
}

pub fn build_downlink_nas_transport(ue: &UeContext, nas: NasMessage) -> MmeResult<S1apMessage> {
    Ok(S1apMessage::DownlinkNasTransport {
        ids: ue_ids(ue)?,
        nas,
    })
}

/// Initial Context Setup Request. With `nas` set (Attach Accept) only the
/// E-RABs of the default PDN are listed, otherwise every bearer.
pub fn build_initial_context_setup_request(
    ue: &UeContext,
    nas: Option<NasMessage>,
    only_pdn: Option<usize>,
) -> MmeResult<S1apMessage> {
    let erabs = match only_pdn {
        Some(cid) => bearer::bearers_of_pdn(ue, cid)
            .into_iter()
            .filter_map(|ebi| bearer::get_bearer_context(ue, ebi))
            .map(|b| ErabToBeSetup {
                ebi: b.ebi,
                qos: b.qos,
                sgw_s1u: b.sgw_s1u,
                nas: None,
            })
            .collect(),
        None => build_erab_list(ue),
    };
    Ok(S1apMessage::InitialContextSetupRequest {
        ids: ue_ids(ue)?,
        ue_ambr: ue.ue_ambr,
        erabs,
        kasme: ue.security.kasme.clone(),
        nas,
    })
}

pub fn build_e_rab_setup_request(
    ue: &UeContext,
    ebi: Ebi,
    nas: NasMessage,
) -> MmeResult<S1apMessage> {
    let bearer = bearer::get_bearer_context(ue, ebi).ok_or_else(|| {
        MmeError::InvalidState(ue.mme_ue_s1ap_id, format!("no bearer EBI[{}]", ebi))
    })?;
    Ok(S1apMessage::ERabSetupRequest {
        ids: ue_ids(ue)?,
        erabs: vec![ErabToBeSetup {
            ebi,
            qos: bearer.qos,
            sgw_s1u: bearer.sgw_s1u,
            nas: Some(nas),
        }],
    })
}

pub fn build_e_rab_release_command(
    ue: &UeContext,
    ebi: Ebi,
    nas: NasMessage,
) -> MmeResult<S1apMessage> {
    Ok(S1apMessage::ERabReleaseCommand {
        ids: ue_ids(ue)?,
        ebis: vec![ebi],
        nas,
    })
}

pub fn build_ue_context_release_command(ids: UeS1apIds, cause: S1apCause) -> S1apMessage {
    S1apMessage::UeContextReleaseCommand { ids, cause }
}

pub fn build_paging(ue: &UeContext, tai_list: Vec<EpsTai>) -> MmeResult<S1apMessage> {
    let s_tmsi = ue.s_tmsi().ok_or_else(|| {
        MmeError::Paging(ue.mme_ue_s1ap_id, "no S-TMSI".to_string())
    })?;
    Ok(S1apMessage::Paging {
        s_tmsi,
        tai_list,
        domain: CnDomain::Ps,
    })
}

pub fn build_handover_request(
    ue: &UeContext,
    target_enb_id: u32,
    cause: S1apCause,
    container: Bytes,
) -> S1apMessage {
    S1apMessage::HandoverRequest {
        mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
        target_enb_id,
        cause,
        ue_ambr: ue.ue_ambr,
        erabs: build_erab_list(ue),
        container,
    }
}
