//! SGsAP Message Building

use crate::context::{ECgi, EpsGuti, EpsTai, UeContext};
use crate::error::{MmeError, MmeResult};

/// EPS location update type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpsUpdateType {
    ImsiAttach,
    NormalLocationUpdate,
}

/// EPS detach indication type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpsDetachType {
    NetworkInitiated,
    UeInitiated,
    EpsServicesNotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgsapMessage {
    LocationUpdateRequest {
        imsi: String,
        update_type: EpsUpdateType,
        new_guti: Option<EpsGuti>,
        tai: EpsTai,
        ecgi: ECgi,
    },
    EpsDetachIndication {
        imsi: String,
        detach_type: EpsDetachType,
    },
}

impl SgsapMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SgsapMessage::LocationUpdateRequest { .. } => "SGsAP-LOCATION-UPDATE-REQUEST",
            SgsapMessage::EpsDetachIndication { .. } => "SGsAP-EPS-DETACH-INDICATION",
        }
    }
}

fn imsi_of(ue: &UeContext) -> MmeResult<String> {
    ue.imsi
        .clone()
        .ok_or_else(|| MmeError::InvalidState(ue.mme_ue_s1ap_id, "no IMSI".to_string()))
}

pub fn build_location_update_request(ue: &UeContext) -> MmeResult<SgsapMessage> {
    Ok(SgsapMessage::LocationUpdateRequest {
        imsi: imsi_of(ue)?,
        update_type: EpsUpdateType::ImsiAttach,
        new_guti: ue.guti,
        tai: ue.tai,
        ecgi: ue.ecgi,
    })
}

pub fn build_eps_detach_indication(
    ue: &UeContext,
    detach_type: EpsDetachType,
) -> MmeResult<SgsapMessage> {
    Ok(SgsapMessage::EpsDetachIndication {
        imsi: imsi_of(ue)?,
        detach_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_update_carries_guti() {
        let ue = UeContext {
            imsi: Some("001010000000001".to_string()),
            guti: Some(EpsGuti {
                m_tmsi: 0x1234,
                ..Default::default()
            }),
            ..Default::default()
        };
        match build_location_update_request(&ue).unwrap() {
            SgsapMessage::LocationUpdateRequest { imsi, update_type, new_guti, .. } => {
                assert_eq!(imsi, "001010000000001");
                assert_eq!(update_type, EpsUpdateType::ImsiAttach);
                assert_eq!(new_guti.map(|g| g.m_tmsi), Some(0x1234));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_detach_indication_needs_imsi() {
        let ue = UeContext::default();
        assert!(build_eps_detach_indication(&ue, EpsDetachType::UeInitiated).is_err());
    }
}
