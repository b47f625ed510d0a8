//! Session Management
//!
//! Create Session / Modify Bearer / Release Access Bearers rounds with the
//! SGW, Initial Context Setup and UE Context Release with the eNB, Service
//! Request, Downlink Data Notification and paging.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;

use crate::app::MmeCtx;
use crate::bearer;
use crate::context::{
    EcmState, EpsGuti, Fteid, FteidInterface, IpAddr, ModifyAction, PdnCid, ReleaseAction,
    UeContext, BEARERS_PER_UE, MAX_PAGING_RETRY_COUNT,
};
use crate::dedicated_bearer;
use crate::emm_attach::{self, S1Origin};
use crate::emm_detach;
use crate::error::{MmeError, MmeResult, SessionError};
use crate::event::{
    CreateSessionResponse, ErabAdmitted, InitialContextSetupResponse, ModifyBearerResponse,
};
use crate::metrics::names;
use crate::nas_build::{self, EmmCause, EsmCause, NasMessage};
use crate::path;
use crate::s11_build::{self, BearerToBeModified, GtpCause, ModifyBearerRequest, S11Message};
use crate::s1ap_build::{
    self, nas_cause, radio_network_cause, S1apCause, S1apCauseGroup, S1apMessage,
};
use crate::timer::MmeTimerId;
use crate::ue_store::{lock_ue, UeKeys};

// ============================================================================
// Create Session
// ============================================================================

/// Handle Create Session Response
pub fn handle_create_session_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    rsp: &CreateSessionResponse,
) -> MmeResult<()> {
    let cid = match bearer::pdn_by_xact(ue, rsp.seq) {
        Some(cid) => cid,
        None => {
            log::warn!("[{}] Create Session Response #{} unmatched", ue.mme_ue_s1ap_id, rsp.seq);
            return Ok(());
        }
    };
    if let Some(pdn) = bearer::pdn_context_mut(ue, cid) {
        pdn.xact = None;
    }

    let result = install_session(ue, cid, rsp);
    emm_attach::handle_create_session_result(ctx, ue, cid, result)
}

/// Install the bearers of a Create Session Response on PDN `cid`.
/// `Err` carries the ESM cause for the UE.
fn install_session(
    ue: &mut UeContext,
    cid: PdnCid,
    rsp: &CreateSessionResponse,
) -> Result<(), EsmCause> {
    let ue_id = ue.mme_ue_s1ap_id;
    if !rsp.cause.is_accepted() {
        log::warn!("[{}] Create Session Response PDN[{}] [{:?}]", ue_id, cid, rsp.cause);
        return Err(nas_build::esm_cause_from_gtp(rsp.cause));
    }
    let sgw_s11 = match rsp.sgw_s11 {
        Some(fteid) => fteid,
        None => {
            log::error!("[{}] Create Session Response without SGW S11 F-TEID", ue_id);
            return Err(EsmCause::NetworkFailure);
        }
    };

    let accepted: Vec<_> = rsp
        .bearers
        .iter()
        .filter(|b| {
            let ok = b.cause == GtpCause::RequestAccepted
                && b.sgw_s1u.interface == FteidInterface::S1uSgwGtpU;
            if !ok {
                log::warn!("[{}] EBI[{}] skipped [{:?}]", ue_id, b.ebi, b.cause);
            }
            ok
        })
        .collect();

    let new_bearers = accepted
        .iter()
        .filter(|b| bearer::get_bearer_context(ue, b.ebi).is_none())
        .count();
    let total = bearer::active_bearer_count(ue) + new_bearers;
    if total > BEARERS_PER_UE {
        log::error!("[{}] {}", ue_id, SessionError::TooManyBearers(total));
        return Err(EsmCause::InsufficientResources);
    }

    let mut installed = 0;
    for created in accepted {
        let exists = bearer::get_bearer_context(ue, created.ebi).map(|b| b.pdn_cid);
        match exists {
            Some(owner) if owner != cid => {
                log::warn!("[{}] EBI[{}] belongs to PDN[{}]", ue_id, created.ebi, owner);
                continue;
            }
            Some(_) => {}
            None => {
                if let Err(e) = bearer::create_bearer_context(ue, cid, Some(created.ebi), false) {
                    log::warn!("[{}] EBI[{}] not installed: {}", ue_id, created.ebi, e);
                    continue;
                }
            }
        }
        if let Some(b) = bearer::get_bearer_context_mut(ue, created.ebi) {
            b.sgw_s1u = Some(created.sgw_s1u);
            b.pgw_s5u = created.pgw_s5u;
            if let Some(qos) = created.qos {
                b.qos = qos;
            }
            installed += 1;
        }
    }

    if installed == 0 {
        let cause = rsp
            .bearers
            .first()
            .map(|b| b.cause)
            .unwrap_or(GtpCause::RequestRejected);
        log::warn!("[{}] No bearer installed on PDN[{}]", ue_id, cid);
        return Err(nas_build::esm_cause_from_gtp(cause));
    }

    if let Some(pdn) = bearer::pdn_context_mut(ue, cid) {
        pdn.sgw_s11 = Some(sgw_s11);
        pdn.pgw_s5c = rsp.pgw_s5c;
        pdn.paa = rsp.paa;
        if let Some(ambr) = rsp.apn_ambr {
            pdn.apn_ambr = ambr;
        }
        if !rsp.pco.is_empty() {
            pdn.pco = rsp.pco.clone();
        }
    }
    log::info!("[{}] PDN[{}] session created, {} bearer(s)", ue_id, cid, installed);
    Ok(())
}

// ============================================================================
// Modify Bearer
// ============================================================================

/// Convert an S1AP transport layer address
pub fn transport_addr_to_ip(addr: &Bytes) -> Result<IpAddr, SessionError> {
    match addr.len() {
        4 => {
            let octets: [u8; 4] = addr[..].try_into().map_err(|_| SessionError::InvalidIpLength(4))?;
            Ok(IpAddr::v4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] =
                addr[..].try_into().map_err(|_| SessionError::InvalidIpLength(16))?;
            Ok(IpAddr::v6(Ipv6Addr::from(octets)))
        }
        len => Err(SessionError::InvalidIpLength(len)),
    }
}

fn enb_fteid(admitted: &ErabAdmitted) -> Result<Fteid, SessionError> {
    Ok(Fteid {
        interface: FteidInterface::S1uEnodebGtpU,
        teid: admitted.teid,
        addr: transport_addr_to_ip(&admitted.transport_addr)?,
    })
}

/// Modify Bearer Request for PDN `cid`. Admitted bearers of the PDN are
/// modified with their new eNB F-TEID; the PDN's other bearers are removed.
pub fn build_modify_bearer_request(
    ue: &UeContext,
    cid: PdnCid,
    admitted: &[ErabAdmitted],
) -> Result<ModifyBearerRequest, SessionError> {
    let pdn = bearer::pdn_context(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    let sgw_s11_teid = pdn.sgw_s11_teid().ok_or(SessionError::NoSgwTunnel(cid))?;

    let mut to_be_modified = Vec::new();
    let mut to_be_removed = Vec::new();
    for ebi in bearer::bearers_of_pdn(ue, cid) {
        match admitted.iter().find(|a| a.ebi == ebi) {
            Some(a) => to_be_modified.push(BearerToBeModified {
                ebi,
                enb_s1u: enb_fteid(a)?,
            }),
            None => to_be_removed.push(ebi),
        }
    }

    Ok(ModifyBearerRequest {
        sgw_s11_teid,
        to_be_modified,
        to_be_removed,
    })
}

/// One Modify Bearer Request per PDN with an SGW tunnel. Nothing is returned
/// unless every request could be built.
pub(crate) fn build_modify_bearer_requests(
    ue: &UeContext,
    admitted: &[ErabAdmitted],
) -> Result<Vec<(PdnCid, ModifyBearerRequest)>, SessionError> {
    bearer::pdn_cids(ue)
        .into_iter()
        .filter(|cid| bearer::pdn_context(ue, *cid).and_then(|p| p.sgw_s11).is_some())
        .map(|cid| build_modify_bearer_request(ue, cid, admitted).map(|req| (cid, req)))
        .collect()
}

/// Record the new eNB F-TEIDs and send the prebuilt Modify Bearer Requests.
/// With nothing to send the round completes at once.
pub(crate) fn send_modify_bearer_requests(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    requests: Vec<(PdnCid, ModifyBearerRequest)>,
    action: ModifyAction,
) -> MmeResult<()> {
    ue.modify_action = action;
    for (_, req) in &requests {
        for m in &req.to_be_modified {
            if let Some(b) = bearer::get_bearer_context_mut(ue, m.ebi) {
                b.enb_s1u = Some(m.enb_s1u);
            }
        }
    }

    for (cid, req) in requests {
        let seq = ctx.next_seq();
        let pdn = bearer::pdn_context_mut(ue, cid).ok_or(SessionError::NoPdn(cid))?;
        pdn.xact = Some(seq);
        path::send_to_sgw(ctx.sink, pdn, seq, S11Message::ModifyBearerRequest(req))?;
        ue.pending_modify += 1;
    }

    if ue.pending_modify == 0 {
        finish_modify(ctx, ue)?;
    }
    Ok(())
}

/// Handle Modify Bearer Response
pub fn handle_modify_bearer_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    rsp: &ModifyBearerResponse,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let cid = match bearer::pdn_by_xact(ue, rsp.seq) {
        Some(cid) => cid,
        None => {
            log::warn!("[{}] Modify Bearer Response #{} unmatched", ue_id, rsp.seq);
            return Ok(());
        }
    };
    if let Some(pdn) = bearer::pdn_context_mut(ue, cid) {
        pdn.xact = None;
    }
    ue.pending_modify = ue.pending_modify.saturating_sub(1);

    if !rsp.cause.is_accepted() {
        log::warn!("[{}] Modify Bearer Response PDN[{}] [{:?}]", ue_id, cid, rsp.cause);
        if ue.modify_action == ModifyAction::InPathSwitchRequest {
            let ids = s1ap_build::ue_ids(ue)?;
            reset_modify(ue);
            ctx.count(names::PATH_SWITCH, &[("result", "failure")]);
            return path::send_to_enb(
                ctx.sink,
                S1apMessage::PathSwitchRequestFailure {
                    ids,
                    cause: S1apCause::new(
                        S1apCauseGroup::RadioNetwork,
                        radio_network_cause::UNSPECIFIED,
                    ),
                },
            );
        }
    }

    for removed in rsp.removed.iter().filter(|r| r.cause == GtpCause::ContextNotFound) {
        deactivate_unknown_bearer(ctx, ue, removed.ebi)?;
    }

    if ue.pending_modify == 0 {
        finish_modify(ctx, ue)?;
    }
    Ok(())
}

/// The SGW lost a bearer: deactivate it towards the UE
fn deactivate_unknown_bearer(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: u8) -> MmeResult<()> {
    let nas = match bearer::get_bearer_context_mut(ue, ebi) {
        Some(b) => {
            b.mark_inactive_pending();
            nas_build::build_deactivate_bearer_request(b, EsmCause::RegularDeactivation)
        }
        None => return Ok(()),
    };
    log::info!("[{}] EBI[{}] unknown to the SGW, deactivating", ue.mme_ue_s1ap_id, ebi);
    let msg = s1ap_build::build_e_rab_release_command(ue, ebi, nas)?;
    path::send_to_enb(ctx.sink, msg)
}

fn reset_modify(ue: &mut UeContext) {
    ue.modify_action = ModifyAction::NoAction;
    ue.pending_modify = 0;
    ue.handover = None;
}

/// Every PDN answered: replay queued activations and answer the eNB
fn finish_modify(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let action = ue.modify_action;
    let ue_id = ue.mme_ue_s1ap_id;
    dedicated_bearer::replay_pending_requests(ctx, ue)?;

    let result = match action {
        ModifyAction::NoAction => Ok(()),
        ModifyAction::InPathSwitchRequest => {
            let released = ue
                .handover
                .as_ref()
                .map(|h| h.not_admitted.clone())
                .unwrap_or_default();
            for ebi in &released {
                if let Err(e) = bearer::free_bearer_context(ue, *ebi) {
                    log::warn!("[{}] EBI[{}] release failed: {}", ue_id, ebi, e);
                }
            }
            let ids = s1ap_build::ue_ids(ue)?;
            ctx.count(names::PATH_SWITCH, &[("result", "success")]);
            log::info!("[{}] Path switch complete", ue_id);
            path::send_to_enb(ctx.sink, S1apMessage::PathSwitchRequestAcknowledge { ids, released })
        }
        ModifyAction::InErabModification => {
            let modified = ue
                .handover
                .as_ref()
                .map(|h| h.admitted.iter().map(|a| a.ebi).collect())
                .unwrap_or_default();
            let ids = s1ap_build::ue_ids(ue)?;
            path::send_to_enb(ctx.sink, S1apMessage::ERabModificationConfirm { ids, modified })
        }
        ModifyAction::InHandoverNotify => {
            log::info!("[{}] User plane switched to target eNB", ue_id);
            Ok(())
        }
    };
    if action != ModifyAction::NoAction {
        reset_modify(ue);
    }
    result
}

// ============================================================================
// Initial Context Setup
// ============================================================================

/// Handle Initial Context Setup Response
pub fn handle_ics_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    rsp: &InitialContextSetupResponse,
) -> MmeResult<()> {
    if !ue.timers.ics_response.is_active() {
        log::warn!("[{}] Initial Context Setup Response without ICS timer", ue.mme_ue_s1ap_id);
        return Ok(());
    }
    ue.timers.ics_response.stop();
    if !rsp.failed.is_empty() {
        log::warn!("[{}] E-RABs failed to set up: {:?}", ue.mme_ue_s1ap_id, rsp.failed);
    }

    let requests = build_modify_bearer_requests(ue, &rsp.setup)?;
    ue.set_ecm_state(EcmState::Connected);
    send_modify_bearer_requests(ctx, ue, requests, ModifyAction::NoAction)
}

/// Handle Initial Context Setup Failure
pub fn handle_ics_failure(ctx: &MmeCtx<'_>, ue: &mut UeContext, cause: S1apCause) -> MmeResult<()> {
    log::warn!("[{}] Initial Context Setup Failure {:?}", ue.mme_ue_s1ap_id, cause);
    ue.timers.ics_response.stop();
    ics_failed(ctx, ue, cause)
}

/// Handle ICS response timer expiry
pub fn handle_ics_expiry(ctx: &MmeCtx<'_>, ue: &mut UeContext, handle_id: u64) -> MmeResult<()> {
    if !ue.timers.claim(MmeTimerId::IcsResponse, handle_id) {
        return Ok(());
    }
    log::warn!("[{}] No Initial Context Setup Response", ue.mme_ue_s1ap_id);
    ics_failed(
        ctx,
        ue,
        S1apCause::new(S1apCauseGroup::RadioNetwork, radio_network_cause::UNSPECIFIED),
    )
}

fn ics_failed(ctx: &MmeCtx<'_>, ue: &mut UeContext, cause: S1apCause) -> MmeResult<()> {
    if ue.is_registered() {
        return release_access_bearers(ctx, ue, cause);
    }
    if ue.attach_proc().is_some() {
        emm_attach::abort_attach(ctx, ue);
    } else {
        emm_detach::implicit_detach(ctx, ue);
    }
    Ok(())
}

// ============================================================================
// UE Context Release
// ============================================================================

/// Handle UE Context Release Request from the eNB
pub fn handle_ue_context_release_request(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: S1apCause,
) -> MmeResult<()> {
    log::info!("[{}] UE Context Release Request {:?}", ue.mme_ue_s1ap_id, cause);
    if !ue.is_registered() {
        emm_detach::implicit_detach(ctx, ue);
        return Ok(());
    }
    release_access_bearers(ctx, ue, cause)
}

/// Release the user plane towards IDLE: Release Access Bearers per PDN,
/// then UE Context Release Command once every PDN answered
fn release_access_bearers(ctx: &MmeCtx<'_>, ue: &mut UeContext, cause: S1apCause) -> MmeResult<()> {
    ue.release_action = ReleaseAction::S1ContextRemove;
    ue.release_cause = Some(cause);
    for b in ue.bearers.iter_mut().flatten() {
        b.enb_s1u = None;
    }

    let mut sent = 0;
    for cid in bearer::pdn_cids(ue) {
        let rabr = match s11_build::build_release_access_bearers_request(ue, cid) {
            Ok(rabr) => rabr,
            Err(SessionError::NoSgwTunnel(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let seq = ctx.next_seq();
        let pdn = bearer::pdn_context_mut(ue, cid).ok_or(SessionError::NoPdn(cid))?;
        path::send_to_sgw(ctx.sink, pdn, seq, rabr)?;
        sent += 1;
    }
    ue.pending_release = sent;

    if sent == 0 {
        send_release_command(ctx, ue)?;
    }
    Ok(())
}

fn send_release_command(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let cause = ue
        .release_cause
        .take()
        .unwrap_or_else(|| S1apCause::new(S1apCauseGroup::Nas, nas_cause::NORMAL_RELEASE));
    let ids = s1ap_build::ue_ids(ue)?;
    path::send_to_enb(ctx.sink, s1ap_build::build_ue_context_release_command(ids, cause))
}

/// Handle Release Access Bearers Response
pub fn handle_release_access_bearers_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: GtpCause,
) -> MmeResult<()> {
    if ue.pending_release == 0 {
        log::warn!("[{}] Unexpected Release Access Bearers Response", ue.mme_ue_s1ap_id);
        return Ok(());
    }
    if !cause.is_accepted() {
        log::warn!("[{}] Release Access Bearers Response [{:?}]", ue.mme_ue_s1ap_id, cause);
    }
    ue.pending_release -= 1;
    if ue.pending_release == 0 && ue.release_action == ReleaseAction::S1ContextRemove {
        send_release_command(ctx, ue)?;
    }
    Ok(())
}

/// Handle UE Context Release Complete
pub fn handle_ue_context_release_complete(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    if ue.release_action == ReleaseAction::HandoverSourceRemove {
        log::debug!("[{}] Handover source released", ue_id);
        ue.release_action = ReleaseAction::None;
        return Ok(());
    }

    ue.release_action = ReleaseAction::None;
    ue.set_ecm_state(EcmState::Idle);
    let mut keys = UeKeys::of(ue);
    keys.enb_ue_key = None;
    ctx.store.update_keys(ue, keys)?;
    ue.timers.ics_response.stop();
    ue.handover = None;

    if ue.is_registered() {
        ue.timers.mobile_reachable = ctx.start_timer(MmeTimerId::MobileReachable, ue_id);
    }
    log::info!("[{}] UE is IDLE", ue_id);
    Ok(())
}

/// Handle mobile reachable timer expiry
pub fn handle_mobile_reachable_expiry(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    handle_id: u64,
) -> MmeResult<()> {
    if !ue.timers.claim(MmeTimerId::MobileReachable, handle_id) {
        return Ok(());
    }
    log::info!("[{}] Mobile reachable timer expired", ue.mme_ue_s1ap_id);
    ue.timers.implicit_detach = ctx.start_timer(MmeTimerId::ImplicitDetach, ue.mme_ue_s1ap_id);
    Ok(())
}

/// Handle implicit detach timer expiry
pub fn handle_implicit_detach_expiry(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    handle_id: u64,
) -> MmeResult<()> {
    if !ue.timers.claim(MmeTimerId::ImplicitDetach, handle_id) {
        return Ok(());
    }
    emm_detach::implicit_detach(ctx, ue);
    Ok(())
}

// ============================================================================
// Service Request
// ============================================================================

/// Bind a known UE to the S1 connection a message arrived on
pub fn attach_s1_connection(ctx: &MmeCtx<'_>, ue: &mut UeContext, origin: &S1Origin) -> MmeResult<()> {
    if ue.enb_ue_key != Some(origin.enb_ue_key) {
        let mut keys = UeKeys::of(ue);
        keys.enb_ue_key = Some(origin.enb_ue_key);
        ctx.store.update_keys(ue, keys)?;
    }
    ue.sctp_assoc_id = origin.sctp_assoc_id;
    ue.tai = origin.tai;
    ue.ecgi = origin.ecgi;
    Ok(())
}

fn service_reject(ctx: &MmeCtx<'_>, origin: &S1Origin) -> MmeResult<()> {
    let mut transient = ctx.store.create_context();
    transient.mme_ue_s1ap_id = ctx.store.allocate_mme_ue_s1ap_id();
    transient.enb_ue_key = Some(origin.enb_ue_key);
    path::send_downlink_nas(
        ctx.sink,
        &transient,
        NasMessage::ServiceReject {
            cause: EmmCause::ImplicitlyDetached,
        },
    )
}

/// Handle Service Request
pub fn handle_service_request(
    ctx: &MmeCtx<'_>,
    origin: S1Origin,
    guti: Option<EpsGuti>,
) -> MmeResult<()> {
    let ue_ref = match guti.and_then(|g| ctx.store.lookup_by_temporary_id(&g)) {
        Some(ue_ref) => ue_ref,
        None => {
            log::warn!("Service request from unknown UE on {}", origin.enb_ue_key);
            return service_reject(ctx, &origin);
        }
    };
    let mut ue = lock_ue(&ue_ref);
    if !ue.is_registered() {
        log::warn!("[{}] Service request while not registered", ue.mme_ue_s1ap_id);
        return service_reject(ctx, &origin);
    }

    log::info!("[{}] Service request", ue.mme_ue_s1ap_id);
    ue.timers.paging_response.stop();
    ue.timers.mobile_reachable.stop();
    ue.timers.implicit_detach.stop();
    ue.paging_retx_count = 0;

    attach_s1_connection(ctx, &mut ue, &origin)?;
    ue.set_ecm_state(EcmState::Connected);
    let ics = s1ap_build::build_initial_context_setup_request(&ue, None, None)?;
    path::send_to_enb(ctx.sink, ics)?;
    ue.timers.ics_response = ctx.start_timer(MmeTimerId::IcsResponse, ue.mme_ue_s1ap_id);
    Ok(())
}

// ============================================================================
// Downlink Data Notification / Paging
// ============================================================================

/// Handle Downlink Data Notification
pub fn handle_downlink_data_notification(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    seq: u32,
    ebi: u8,
) -> MmeResult<()> {
    let cid = bearer::get_bearer_context(ue, ebi)
        .map(|b| b.pdn_cid)
        .or_else(|| bearer::pdn_cids(ue).first().copied());
    let pdn = match cid.and_then(|cid| bearer::pdn_context(ue, cid)) {
        Some(pdn) => pdn,
        None => {
            log::warn!("[{}] Downlink Data Notification without PDN", ue.mme_ue_s1ap_id);
            return path::send_to_spgw(
                ctx.sink,
                seq,
                S11Message::DownlinkDataNotificationAck {
                    sgw_s11_teid: 0,
                    cause: GtpCause::ContextNotFound,
                },
            );
        }
    };
    let ack = S11Message::DownlinkDataNotificationAck {
        sgw_s11_teid: pdn.sgw_s11_teid().unwrap_or_default(),
        cause: GtpCause::RequestAccepted,
    };
    path::send_to_sgw(ctx.sink, pdn, seq, ack)?;

    if !ue.is_connected() && !ue.timers.paging_response.is_active() {
        page_ue(ctx, ue)?;
    }
    Ok(())
}

/// Page an IDLE UE in the served TAIs
pub fn page_ue(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    if ue.is_connected() {
        return Err(MmeError::Paging(
            ue.mme_ue_s1ap_id,
            "UE is connected".to_string(),
        ));
    }
    let paging = s1ap_build::build_paging(ue, ctx.cfg.served_tai())?;
    ue.paging_retx_count += 1;
    log::info!("[{}] Paging (attempt {})", ue.mme_ue_s1ap_id, ue.paging_retx_count);
    path::send_to_enb(ctx.sink, paging)?;
    ue.timers.paging_response = ctx.start_timer(MmeTimerId::PagingResponse, ue.mme_ue_s1ap_id);
    ctx.count(names::PAGING, &[]);
    Ok(())
}

/// Handle paging response timer expiry
pub fn handle_paging_expiry(ctx: &MmeCtx<'_>, ue: &mut UeContext, handle_id: u64) -> MmeResult<()> {
    if !ue.timers.claim(MmeTimerId::PagingResponse, handle_id) {
        return Ok(());
    }
    if ue.paging_retx_count <= MAX_PAGING_RETRY_COUNT {
        return page_ue(ctx, ue);
    }
    log::warn!("[{}] No paging response", ue.mme_ue_s1ap_id);
    ue.paging_retx_count = 0;
    dedicated_bearer::reject_pending_requests(ctx, ue, GtpCause::RequestRejected)
}
