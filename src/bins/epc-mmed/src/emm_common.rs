//! EMM Common Procedures
//!
//! Identification, authentication and security mode control. Each one runs
//! nested in the attach procedure and hands its result back to the attach
//! engine.

use bytes::Bytes;

use crate::app::MmeCtx;
use crate::context::{AuthVector, UeContext, NAS_KSI_NO_KEY_IS_AVAILABLE, NAS_RETRANSMISSION_MAX};
use crate::emm_attach;
use crate::error::{MmeError, MmeResult, StoreError};
use crate::event::{IdentityResponse, DIAMETER_ERROR_USER_UNKNOWN};
use crate::nas_build::{self, EmmCause, IdentityType, NasMessage};
use crate::path;
use crate::procedure::{AttachState, CommonProc, CommonProcKind};
use crate::timer::MmeTimerId;
use crate::ue_store::UeKeys;

/// What the caller must do after an identity response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    Continue,
    /// The IMSI is already owned by another context. The caller detaches
    /// that context and then calls `resume_imsi_identification`.
    ImsiConflict(String),
}

fn no_attach(ue: &UeContext) -> MmeError {
    MmeError::InvalidState(ue.mme_ue_s1ap_id, "no attach procedure".to_string())
}

/// Attach cause for a failed S6a answer
pub(crate) fn emm_cause_from_diameter(result_code: u32) -> EmmCause {
    match result_code {
        DIAMETER_ERROR_USER_UNKNOWN => EmmCause::ImsiUnknownInHss,
        _ => EmmCause::NetworkFailure,
    }
}

fn common_timer(kind: CommonProcKind) -> MmeTimerId {
    match kind {
        CommonProcKind::Identification => MmeTimerId::T3470,
        CommonProcKind::Authentication | CommonProcKind::SecurityModeControl => MmeTimerId::T3460,
    }
}

/// Send the first message of a common procedure and start its timer
fn start_common(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    kind: CommonProcKind,
    state: AttachState,
    message: NasMessage,
) -> MmeResult<()> {
    if ue.attach_proc().is_none() {
        return Err(no_attach(ue));
    }
    path::send_downlink_nas(ctx.sink, ue, message.clone())?;

    let ue_id = ue.mme_ue_s1ap_id;
    let timer = ctx.start_timer(common_timer(kind), ue_id);
    let attach = ue.attach_proc_mut().ok_or(MmeError::InvalidState(
        ue_id,
        "no attach procedure".to_string(),
    ))?;
    attach.set_state(ue_id, state);
    attach.common = Some(CommonProc {
        kind,
        timer,
        retx_count: 0,
        message,
    });
    Ok(())
}

/// Detach the running common procedure of `kind`, stopping its timer.
/// `None` if a different step (or none) is running.
fn take_common(ue: &mut UeContext, kind: CommonProcKind) -> Option<CommonProc> {
    let ue_id = ue.mme_ue_s1ap_id;
    let attach = ue.attach_proc_mut()?;
    let running = attach.common.as_ref().map(|c| c.kind);
    if running == Some(kind) {
        return attach.common.take();
    }
    log::warn!(
        "[{}] {} response while {} running, dropped",
        ue_id,
        kind,
        running.map(|k| k.to_string()).unwrap_or_else(|| "nothing".to_string())
    );
    None
}

// ============================================================================
// Identification
// ============================================================================

/// Ask the UE for its IMSI
pub fn start_identification(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    log::debug!("[{}] Identity request (IMSI)", ue.mme_ue_s1ap_id);
    start_common(
        ctx,
        ue,
        CommonProcKind::Identification,
        AttachState::Identification,
        nas_build::build_identity_request(IdentityType::Imsi),
    )
}

/// Ask the UE for its IMEISV once security is established
pub fn start_imeisv_identification(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    start_common(
        ctx,
        ue,
        CommonProcKind::Identification,
        AttachState::ImeisvIdentification,
        nas_build::build_identity_request(IdentityType::Imeisv),
    )
}

/// Handle Identity Response
pub fn handle_identity_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    rsp: IdentityResponse,
) -> MmeResult<IdentityOutcome> {
    if take_common(ue, CommonProcKind::Identification).is_none() {
        return Ok(IdentityOutcome::Continue);
    }

    match rsp {
        IdentityResponse::Imsi(imsi) => {
            log::info!("[{}] Identity response IMSI[{}]", ue.mme_ue_s1ap_id, imsi);
            let mut keys = UeKeys::of(ue);
            keys.imsi = Some(imsi.clone());
            match ctx.store.update_keys(ue, keys) {
                Ok(()) => {
                    emm_attach::authenticate_or_skip(ctx, ue)?;
                    Ok(IdentityOutcome::Continue)
                }
                Err(StoreError::DuplicateKey(_)) => Ok(IdentityOutcome::ImsiConflict(imsi)),
            }
        }
        IdentityResponse::Imeisv(imeisv) => {
            log::debug!("[{}] Identity response IMEISV", ue.mme_ue_s1ap_id);
            ue.imeisv = Some(imeisv);
            emm_attach::send_update_location(ctx, ue)?;
            Ok(IdentityOutcome::Continue)
        }
    }
}

/// Bind the identified IMSI once its previous owner is gone and continue the
/// attach
pub fn resume_imsi_identification(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    imsi: String,
) -> MmeResult<()> {
    if ue.attach_proc().is_none() {
        log::warn!("[{}] Attach gone before IMSI[{}] was bound", ue.mme_ue_s1ap_id, imsi);
        return Ok(());
    }
    let mut keys = UeKeys::of(ue);
    keys.imsi = Some(imsi);
    ctx.store.update_keys(ue, keys)?;
    emm_attach::authenticate_or_skip(ctx, ue)
}

// ============================================================================
// Authentication
// ============================================================================

/// Handle Authentication-Information-Answer
pub fn handle_authentication_info_answer(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    result: Result<AuthVector, u32>,
) -> MmeResult<()> {
    match ue.attach_proc() {
        Some(attach) if attach.state == AttachState::Authentication && attach.common.is_none() => {}
        _ => {
            log::warn!("[{}] Unexpected Authentication-Information-Answer", ue.mme_ue_s1ap_id);
            return Ok(());
        }
    }

    match result {
        Ok(vector) => {
            ue.auth_vector = Some(vector);
            let request = nas_build::build_authentication_request(ue)?;
            start_common(
                ctx,
                ue,
                CommonProcKind::Authentication,
                AttachState::Authentication,
                request,
            )
        }
        Err(result_code) => {
            log::warn!(
                "[{}] Authentication-Information-Answer error [{}]",
                ue.mme_ue_s1ap_id,
                result_code
            );
            emm_attach::attach_failed(ctx, ue, emm_cause_from_diameter(result_code))
        }
    }
}

/// Handle Authentication Response
pub fn handle_authentication_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    res: &Bytes,
) -> MmeResult<()> {
    if take_common(ue, CommonProcKind::Authentication).is_none() {
        return Ok(());
    }
    let vector = ue.auth_vector.take().ok_or_else(|| {
        MmeError::InvalidState(ue.mme_ue_s1ap_id, "no authentication vector".to_string())
    })?;

    if vector.xres != *res {
        log::warn!("[{}] Authentication failed: RES mismatch", ue.mme_ue_s1ap_id);
        ue.security.invalidate();
        return emm_attach::attach_failed(ctx, ue, EmmCause::MacFailure);
    }

    ue.security.kasme = vector.kasme;
    ue.security.ksi = match ue.security.ksi {
        NAS_KSI_NO_KEY_IS_AVAILABLE => 0,
        ksi => (ksi + 1) % NAS_KSI_NO_KEY_IS_AVAILABLE,
    };
    if let Some(attach) = ue.attach_proc_mut() {
        attach.authenticated = true;
    }
    log::info!("[{}] Authentication succeeded", ue.mme_ue_s1ap_id);
    start_security_mode(ctx, ue)
}

/// Handle Authentication Failure
pub fn handle_authentication_failure(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: EmmCause,
) -> MmeResult<()> {
    if take_common(ue, CommonProcKind::Authentication).is_none() {
        return Ok(());
    }
    log::warn!("[{}] Authentication failure [{}]", ue.mme_ue_s1ap_id, cause.label());
    ue.auth_vector = None;
    ue.security.invalidate();
    emm_attach::attach_failed(ctx, ue, cause)
}

// ============================================================================
// Security Mode Control
// ============================================================================

/// First algorithm of `order` present in the UE's `supported` bitmap
fn select_algorithm(order: &[u8], supported: u8) -> Option<u8> {
    order
        .iter()
        .copied()
        .find(|alg| *alg < 8 && supported & (1 << alg) != 0)
}

/// Select EEA/EIA and send Security Mode Command
pub fn start_security_mode(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let capability = ue.ue_network_capability;
    let eia = match select_algorithm(&ctx.cfg.security.integrity_order, capability.eia) {
        Some(eia) => eia,
        None => {
            log::warn!(
                "[{}] No common integrity algorithm (UE EIA {:#04x})",
                ue.mme_ue_s1ap_id,
                capability.eia
            );
            return emm_attach::attach_failed(ctx, ue, EmmCause::UeSecurityCapabilitiesMismatch);
        }
    };
    let eea = select_algorithm(&ctx.cfg.security.ciphering_order, capability.eea).unwrap_or(0);

    ue.security.eia = eia;
    ue.security.eea = eea;
    log::debug!("[{}] Selected EEA{} EIA{}", ue.mme_ue_s1ap_id, eea, eia);

    let command = nas_build::build_security_mode_command(ue, ctx.cfg.nas.request_imeisv);
    start_common(
        ctx,
        ue,
        CommonProcKind::SecurityModeControl,
        AttachState::SecurityModeControl,
        command,
    )
}

/// Handle Security Mode Complete
pub fn handle_security_mode_complete(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    imeisv: Option<String>,
) -> MmeResult<()> {
    if take_common(ue, CommonProcKind::SecurityModeControl).is_none() {
        return Ok(());
    }
    ue.security.valid = true;
    if imeisv.is_some() {
        ue.imeisv = imeisv;
    }
    log::info!("[{}] Security mode complete", ue.mme_ue_s1ap_id);
    emm_attach::after_security(ctx, ue)
}

/// Handle Security Mode Reject
pub fn handle_security_mode_reject(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: EmmCause,
) -> MmeResult<()> {
    if take_common(ue, CommonProcKind::SecurityModeControl).is_none() {
        return Ok(());
    }
    log::warn!("[{}] Security mode reject [{}]", ue.mme_ue_s1ap_id, cause.label());
    ue.security.invalidate();
    emm_attach::attach_failed(ctx, ue, cause)
}

// ============================================================================
// Retransmission
// ============================================================================

/// Handle T3460/T3470 expiry
pub fn handle_common_timer_expiry(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    timer_id: MmeTimerId,
    handle_id: u64,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let retransmit = {
        let common = match ue.attach_proc_mut().and_then(|a| a.common.as_mut()) {
            Some(common) if common.timer.matches(handle_id) => common,
            _ => {
                log::debug!("[{}] Stale {} ignored", ue_id, timer_id);
                return Ok(());
            }
        };
        common.timer.stop();
        if common.retx_count >= NAS_RETRANSMISSION_MAX {
            None
        } else {
            common.retx_count += 1;
            Some((common.message.clone(), common.kind, common.retx_count))
        }
    };

    match retransmit {
        Some((message, kind, count)) => {
            log::info!("[{}] {} expired, {} retransmission {}", ue_id, timer_id, kind, count);
            path::send_downlink_nas(ctx.sink, ue, message)?;
            let timer = ctx.start_timer(timer_id, ue_id);
            if let Some(common) = ue.attach_proc_mut().and_then(|a| a.common.as_mut()) {
                common.timer = timer;
            }
            Ok(())
        }
        None => {
            log::warn!("[{}] {} retransmissions exhausted, attach aborted", ue_id, timer_id);
            emm_attach::abort_attach(ctx, ue);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MmeEvent, NasPdu, NasUplink, S1apEvent, UplinkNasTransport, S6aEvent};
    use crate::nas_build::NasMessage;
    use crate::path::OutboundMessage;
    use crate::s1ap_build::S1apMessage;
    use crate::s6a_build::S6aMessage;
    use crate::testing::{self, nas_of, TestApp};
    use crate::timer::MmeTimer;
    use crate::ue_store::lock_ue;

    fn uplink(t: &TestApp, ue_id: u32, message: NasUplink) {
        let enb_ue_key = {
            let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
            let ue = lock_ue(&ue_ref);
            ue.enb_ue_key.unwrap()
        };
        t.app
            .dispatch(MmeEvent::S1ap(S1apEvent::UplinkNasTransport(UplinkNasTransport {
                mme_ue_s1ap_id: ue_id,
                enb_ue_key,
                nas: NasPdu::plain(message),
            })))
            .unwrap();
    }

    #[test]
    fn test_select_algorithm() {
        assert_eq!(select_algorithm(&[2, 1, 0], 0b0110), Some(2));
        assert_eq!(select_algorithm(&[2, 1, 0], 0b0011), Some(1));
        assert_eq!(select_algorithm(&[2, 1], 0b0001), None);
        assert_eq!(select_algorithm(&[], 0xff), None);
    }

    #[test]
    fn test_diameter_cause_mapping() {
        assert_eq!(emm_cause_from_diameter(DIAMETER_ERROR_USER_UNKNOWN), EmmCause::ImsiUnknownInHss);
        assert_eq!(emm_cause_from_diameter(5012), EmmCause::NetworkFailure);
    }

    #[test]
    fn test_identification_when_imsi_absent() {
        let t = testing::test_app();
        let mut req = testing::attach_request("001010000000001");
        req.identity = crate::event::MobileIdentity::None;
        let ue_id = testing::initial_attach(&t, testing::enb_key(1), req);
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            nas_of(m),
            Some(NasMessage::IdentityRequest { identity_type: IdentityType::Imsi })
        )));

        uplink(&t, ue_id, NasUplink::IdentityResponse(IdentityResponse::Imsi(
            "001010000000001".to_string(),
        )));
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S6a(S6aMessage::AuthenticationInformationRequest { .. })
        )));
        assert!(t.app.store().lookup_by_subscriber_id("001010000000001").is_some());
    }

    #[test]
    fn test_res_mismatch_rejects_attach() {
        let t = testing::test_app();
        let ue_id = testing::initial_attach(&t, testing::enb_key(1), testing::attach_request("001010000000002"));
        t.app
            .dispatch(MmeEvent::S6a(S6aEvent::AuthenticationInformationAnswer {
                imsi: "001010000000002".to_string(),
                result: Ok(testing::auth_vector()),
            }))
            .unwrap();
        t.sink.take();

        uplink(&t, ue_id, NasUplink::AuthenticationResponse { res: Bytes::from_static(b"wrong") });
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            nas_of(m),
            Some(NasMessage::AttachReject { cause: EmmCause::MacFailure, .. })
        )));
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::UeContextReleaseCommand { .. })
        )));
        assert!(t.app.store().lookup_by_local_ref(ue_id).is_none());
        assert_eq!(t.metrics.get("nas_attach_reject", &[("cause", "mac_failure")]), 1);
    }

    #[test]
    fn test_t3460_retransmission_then_abort() {
        let t = testing::test_app();
        let ue_id = testing::initial_attach(&t, testing::enb_key(1), testing::attach_request("001010000000003"));
        t.app
            .dispatch(MmeEvent::S6a(S6aEvent::AuthenticationInformationAnswer {
                imsi: "001010000000003".to_string(),
                result: Ok(testing::auth_vector()),
            }))
            .unwrap();
        t.sink.take();

        let timer = MmeTimer { id: MmeTimerId::T3460, ue_id };
        for _ in 0..NAS_RETRANSMISSION_MAX {
            let handle_id = testing::common_timer_id(&t, ue_id);
            t.app.on_timer(timer, handle_id).unwrap();
            let sent = t.sink.take();
            assert_eq!(sent.len(), 1);
            assert!(matches!(nas_of(&sent[0].1), Some(NasMessage::AuthenticationRequest { .. })));
        }

        let handle_id = testing::common_timer_id(&t, ue_id);
        t.app.on_timer(timer, handle_id).unwrap();
        assert!(t.app.store().lookup_by_local_ref(ue_id).is_none());
    }

    #[test]
    fn test_security_mode_reject() {
        let t = testing::test_app();
        let ue_id = testing::initial_attach(&t, testing::enb_key(1), testing::attach_request("001010000000004"));
        testing::authenticate(&t, ue_id, "001010000000004");
        t.sink.take();

        uplink(&t, ue_id, NasUplink::SecurityModeReject {
            cause: EmmCause::SecurityModeRejectedUnspecified,
        });
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            nas_of(m),
            Some(NasMessage::AttachReject { cause: EmmCause::SecurityModeRejectedUnspecified, esm: None })
        )));
        assert!(t.app.store().lookup_by_local_ref(ue_id).is_none());
    }

    #[test]
    fn test_stale_response_dropped() {
        let t = testing::test_app();
        let ue_id = testing::initial_attach(&t, testing::enb_key(1), testing::attach_request("001010000000005"));
        t.sink.take();
        uplink(&t, ue_id, NasUplink::SecurityModeComplete { imeisv: None });
        assert!(t.sink.take().is_empty());
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        assert!(!lock_ue(&ue_ref).security.valid);
    }
}
