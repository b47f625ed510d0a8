//! S6a Diameter Message Building

use crate::context::{PlmnId, UeContext};
use crate::error::{MmeError, MmeResult};

/// ULR flags (TS 29.272 7.3.7)
pub mod ulr_flags {
    pub const SINGLE_REGISTRATION_INDICATION: u32 = 1 << 0;
    pub const S6A_S6D_INDICATOR: u32 = 1 << 1;
    pub const SKIP_SUBSCRIBER_DATA: u32 = 1 << 2;
    pub const INITIAL_ATTACH_INDICATOR: u32 = 1 << 5;
}

/// Diameter success
pub const DIAMETER_SUCCESS: u32 = 2001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S6aMessage {
    AuthenticationInformationRequest {
        imsi: String,
        visited_plmn: PlmnId,
        num_vectors: u8,
    },
    UpdateLocationRequest {
        imsi: String,
        visited_plmn: PlmnId,
        flags: u32,
    },
    CancelLocationAnswer {
        imsi: String,
        result_code: u32,
    },
}

impl S6aMessage {
    pub fn name(&self) -> &'static str {
        match self {
            S6aMessage::AuthenticationInformationRequest { .. } => "Authentication-Information-Request",
            S6aMessage::UpdateLocationRequest { .. } => "Update-Location-Request",
            S6aMessage::CancelLocationAnswer { .. } => "Cancel-Location-Answer",
        }
    }
}

fn imsi_of(ue: &UeContext) -> MmeResult<String> {
    ue.imsi
        .clone()
        .ok_or_else(|| MmeError::InvalidState(ue.mme_ue_s1ap_id, "no IMSI".to_string()))
}

pub fn build_authentication_information_request(ue: &UeContext) -> MmeResult<S6aMessage> {
    Ok(S6aMessage::AuthenticationInformationRequest {
        imsi: imsi_of(ue)?,
        visited_plmn: ue.tai.plmn_id,
        num_vectors: 1,
    })
}

pub fn build_update_location_request(ue: &UeContext) -> MmeResult<S6aMessage> {
    Ok(S6aMessage::UpdateLocationRequest {
        imsi: imsi_of(ue)?,
        visited_plmn: ue.tai.plmn_id,
        flags: ulr_flags::S6A_S6D_INDICATOR | ulr_flags::INITIAL_ATTACH_INDICATOR,
    })
}
