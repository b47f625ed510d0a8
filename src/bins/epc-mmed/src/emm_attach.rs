//! EMM Attach Procedure
//!
//! Drives an Attach Request through identification, authentication, security
//! mode control, update location and create session up to Attach Accept, then
//! waits for Attach Complete under T3450.

use crate::app::MmeCtx;
use crate::bearer;
use crate::context::{
    Arp, ECgi, EcmState, EnbUeKey, EpsTai, MobilityState, PdnCid, Qos, SgsState, SubscriptionData,
    UeContext, ATTACH_COUNTER_MAX,
};
use crate::emm_common;
use crate::emm_detach;
use crate::error::{MmeError, MmeResult, SessionError};
use crate::event::{AttachRequest, EpsAttachType};
use crate::metrics::names;
use crate::nas_build::{self, EmmCause, EsmCause};
use crate::path;
use crate::procedure::{AttachProc, AttachState, Procedure};
use crate::s11_build;
use crate::s1ap_build::{self, nas_cause, S1apCause, S1apCauseGroup, UeS1apIds};
use crate::s6a_build;
use crate::sgsap_build;
use crate::timer::MmeTimerId;
use crate::ue_store::{lock_ue, UeKeys};

/// Default bearer QCI when the subscription does not say otherwise
const DEFAULT_BEARER_QCI: u8 = 9;

/// S1 connection an attach arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S1Origin {
    pub enb_ue_key: EnbUeKey,
    pub sctp_assoc_id: u32,
    pub tai: EpsTai,
    pub ecgi: ECgi,
}

/// How an attach request relates to the attach already running on a context
enum Duplicate {
    /// Same IEs, Attach Accept already sent
    AcceptSent,
    /// Same IEs, still in progress
    InProgress,
    /// Nothing running, or different IEs
    None,
}

fn classify(ue: &UeContext, req: &AttachRequest) -> Duplicate {
    match ue.attach_proc() {
        Some(attach) if attach.request == *req && attach.accept_sent() => Duplicate::AcceptSent,
        Some(attach) if attach.request == *req => Duplicate::InProgress,
        _ => Duplicate::None,
    }
}

pub(crate) fn set_attach_state(ue: &mut UeContext, state: AttachState) {
    let ue_id = ue.mme_ue_s1ap_id;
    if let Some(attach) = ue.attach_proc_mut() {
        attach.set_state(ue_id, state);
    }
}

/// Release an S1 connection that never got a context of its own
fn release_shadow(ctx: &MmeCtx<'_>, origin: &S1Origin) -> MmeResult<()> {
    let ids = UeS1apIds {
        mme_ue_s1ap_id: ctx.store.allocate_mme_ue_s1ap_id(),
        enb_ue_key: origin.enb_ue_key,
    };
    log::debug!("Releasing shadow S1 connection {}", origin.enb_ue_key);
    path::send_to_enb(
        ctx.sink,
        s1ap_build::build_ue_context_release_command(
            ids,
            S1apCause::new(S1apCauseGroup::Nas, nas_cause::NORMAL_RELEASE),
        ),
    )
}

/// Retransmit the Attach Accept of a duplicate request and restart T3450
/// without counting it
fn retransmit_accept(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let accept = match ue.attach_proc().and_then(|a| a.accept.clone()) {
        Some(accept) => accept,
        None => return Ok(()),
    };
    log::info!("[{}] Duplicate attach request, retransmitting attach accept", ue_id);
    path::send_downlink_nas(ctx.sink, ue, accept)?;
    let timer = ctx.start_timer(MmeTimerId::T3450, ue_id);
    if let Some(attach) = ue.attach_proc_mut() {
        attach.t3450 = timer;
    }
    Ok(())
}

// ============================================================================
// Attach Request
// ============================================================================

/// Handle Attach Request
pub fn handle_attach_request(
    ctx: &MmeCtx<'_>,
    origin: S1Origin,
    req: AttachRequest,
    integrity_ok: bool,
) -> MmeResult<()> {
    let guti_ref = req.guti().and_then(|g| ctx.store.lookup_by_temporary_id(g));
    let unknown_guti = req.guti().is_some() && guti_ref.is_none();
    let existing = req
        .imsi()
        .and_then(|imsi| ctx.store.lookup_by_subscriber_id(imsi))
        .or(guti_ref)
        .or_else(|| ctx.store.lookup_by_enb_ue_key(&origin.enb_ue_key));

    let mut inherited_security = None;
    if let Some(old_ref) = existing {
        let mut old = lock_ue(&old_ref);
        let same_s1 = old.enb_ue_key == Some(origin.enb_ue_key);
        match classify(&old, &req) {
            Duplicate::AcceptSent => {
                retransmit_accept(ctx, &mut old)?;
                drop(old);
                return if same_s1 { Ok(()) } else { release_shadow(ctx, &origin) };
            }
            Duplicate::InProgress => {
                log::info!("[{}] Duplicate attach request discarded", old.mme_ue_s1ap_id);
                drop(old);
                return if same_s1 { Ok(()) } else { release_shadow(ctx, &origin) };
            }
            Duplicate::None => {
                log::info!(
                    "[{}] Attach request for a known UE, detaching the old context",
                    old.mme_ue_s1ap_id
                );
                if integrity_ok && old.security.valid {
                    inherited_security = Some(old.security.clone());
                }
                emm_detach::detach_locally(ctx, &mut old, !same_s1);
            }
        }
    }

    // A stale context may still hold this S1 connection
    if let Some(stale_ref) = ctx.store.lookup_by_enb_ue_key(&origin.enb_ue_key) {
        let mut stale = lock_ue(&stale_ref);
        log::warn!("[{}] Stale context on {}, removed", stale.mme_ue_s1ap_id, origin.enb_ue_key);
        emm_detach::detach_locally(ctx, &mut stale, false);
    }

    if ctx.store.len() >= ctx.cfg.max_ue {
        return reject_congestion(ctx, &origin, &req);
    }

    let mut ue = ctx.store.create_context();
    ue.mme_ue_s1ap_id = ctx.store.allocate_mme_ue_s1ap_id();
    ue.enb_ue_key = Some(origin.enb_ue_key);
    ue.sctp_assoc_id = origin.sctp_assoc_id;
    ue.tai = origin.tai;
    ue.ecgi = origin.ecgi;
    ue.mme_s11_teid = ctx.alloc_s11_teid();
    ue.pdn_limit = ctx.cfg.pdn_limit();
    ue.imsi = req.imsi().map(str::to_string);
    ue.ue_network_capability = req.ue_network_capability;
    ue.emergency = req.attach_type == EpsAttachType::EmergencyAttach;
    ue.unknown_guti = unknown_guti;
    ue.ecm_state = EcmState::Connected;
    if let Some(security) = inherited_security {
        ue.security = security;
    }

    let ue_ref = ctx.store.insert(ue)?;
    let mut ue = lock_ue(&ue_ref);
    start_attach(ctx, &mut ue, req, integrity_ok)
}

fn reject_congestion(ctx: &MmeCtx<'_>, origin: &S1Origin, req: &AttachRequest) -> MmeResult<()> {
    let count = ctx.store.len();
    log::warn!("Attach request on {} rejected: {} UEs", origin.enb_ue_key, count);
    let mut transient = ctx.store.create_context();
    transient.mme_ue_s1ap_id = ctx.store.allocate_mme_ue_s1ap_id();
    transient.enb_ue_key = Some(origin.enb_ue_key);

    let reject = nas_build::build_attach_reject(EmmCause::Congestion, None, req.pdn.pti);
    path::send_downlink_nas(ctx.sink, &transient, reject)?;
    ctx.count(names::NAS_ATTACH_REJECT, &[("cause", EmmCause::Congestion.label())]);
    Err(MmeError::Congestion(count))
}

fn start_attach(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: AttachRequest,
    integrity_ok: bool,
) -> MmeResult<()> {
    log::info!(
        "[{}] Attach request IMSI[{}] {}",
        ue.mme_ue_s1ap_id,
        ue.imsi.as_deref().unwrap_or("-"),
        ue.enb_ue_key.map(|k| k.to_string()).unwrap_or_default()
    );
    if !ue.add_procedure(Procedure::Attach(AttachProc::new(req, integrity_ok))) {
        return Err(MmeError::InvalidState(
            ue.mme_ue_s1ap_id,
            "attach already running".to_string(),
        ));
    }

    if ue.imsi.is_none() {
        emm_common::start_identification(ctx, ue)
    } else {
        authenticate_or_skip(ctx, ue)
    }
}

/// Authenticate unless the security context is valid and the request passed
/// integrity checking
pub(crate) fn authenticate_or_skip(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let integrity_ok = ue.attach_proc().map(|a| a.integrity_ok).unwrap_or(false);
    if ue.security.valid && integrity_ok {
        log::debug!("[{}] Security context valid, authentication skipped", ue.mme_ue_s1ap_id);
        return after_security(ctx, ue);
    }

    ue.security.valid = false;
    let air = s6a_build::build_authentication_information_request(ue)?;
    path::send_to_hss(ctx.sink, air)?;
    set_attach_state(ue, AttachState::Authentication);
    Ok(())
}

/// Continue once NAS security is established
pub(crate) fn after_security(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    if ctx.cfg.nas.request_imeisv && ue.imeisv.is_none() {
        emm_common::start_imeisv_identification(ctx, ue)
    } else {
        send_update_location(ctx, ue)
    }
}

pub(crate) fn send_update_location(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let ulr = s6a_build::build_update_location_request(ue)?;
    path::send_to_hss(ctx.sink, ulr)?;
    set_attach_state(ue, AttachState::UpdateLocation);
    Ok(())
}

// ============================================================================
// Update Location / Create Session
// ============================================================================

/// APN for the default PDN: requested, then subscribed default, then configured
fn select_apn(requested: Option<&str>, sub: &SubscriptionData, fallback: &str) -> String {
    requested
        .or(sub.default_apn.as_deref())
        .unwrap_or(fallback)
        .to_string()
}

fn apn_allowed(sub: &SubscriptionData, apn: &str) -> bool {
    sub.apns.is_empty() || sub.apns.iter().any(|a| a.eq_ignore_ascii_case(apn))
}

/// Handle Update-Location-Answer
pub fn handle_update_location_answer(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    result: Result<SubscriptionData, u32>,
) -> MmeResult<()> {
    let request = match ue.attach_proc() {
        Some(attach) if attach.state == AttachState::UpdateLocation => attach.request.clone(),
        _ => {
            log::warn!("[{}] Unexpected Update-Location-Answer", ue.mme_ue_s1ap_id);
            return Ok(());
        }
    };

    let sub = match result {
        Ok(sub) => sub,
        Err(result_code) => {
            log::warn!("[{}] Update-Location-Answer error [{}]", ue.mme_ue_s1ap_id, result_code);
            return reject_attach(ctx, ue, EmmCause::NetworkFailure, None);
        }
    };

    let apn = select_apn(request.pdn.apn.as_deref(), &sub, &ctx.cfg.default_apn);
    ue.ue_ambr = sub.ambr;
    let allowed = apn_allowed(&sub, &apn);
    ue.subscription = Some(sub);
    if !allowed {
        log::warn!("[{}] APN[{}] not subscribed", ue.mme_ue_s1ap_id, apn);
        return reject_attach(ctx, ue, EmmCause::EsmFailure, Some(EsmCause::MissingOrUnknownApn));
    }

    let cid = match bearer::create_pdn_context(ue, &apn) {
        Ok(cid) => cid,
        Err(e) => {
            log::error!("[{}] Cannot create PDN[{}]: {}", ue.mme_ue_s1ap_id, apn, e);
            return reject_attach(ctx, ue, EmmCause::EsmFailure, Some(EsmCause::InsufficientResources));
        }
    };
    let ebi = bearer::create_bearer_context(ue, cid, None, true)?;
    let ue_ambr = ue.ue_ambr;
    if let Some(pdn) = bearer::pdn_context_mut(ue, cid) {
        pdn.pdn_type = request.pdn.pdn_type;
        pdn.pco = request.pdn.pco.clone();
        pdn.apn_ambr = ue_ambr;
    }
    if let Some(default) = bearer::get_bearer_context_mut(ue, ebi) {
        default.pti = request.pdn.pti;
        default.qos = Qos {
            qci: DEFAULT_BEARER_QCI,
            arp: Arp {
                priority_level: 1,
                pre_emption_capability: false,
                pre_emption_vulnerability: true,
            },
            ..Default::default()
        };
    }

    send_create_session(ctx, ue, cid)?;
    let ue_id = ue.mme_ue_s1ap_id;
    if let Some(attach) = ue.attach_proc_mut() {
        attach.default_pdn = Some(cid);
        attach.set_state(ue_id, AttachState::CreateSession);
    }
    Ok(())
}

fn send_create_session(ctx: &MmeCtx<'_>, ue: &mut UeContext, cid: PdnCid) -> MmeResult<()> {
    let csr = s11_build::build_create_session_request(ue, cid, ctx.s11_addr())?;
    let seq = ctx.next_seq();
    let pdn = bearer::pdn_context_mut(ue, cid).ok_or(SessionError::NoPdn(cid))?;
    pdn.xact = Some(seq);
    path::send_to_sgw(ctx.sink, pdn, seq, csr)
}

/// Outcome of the Create Session round for the default PDN
pub(crate) fn handle_create_session_result(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cid: PdnCid,
    result: Result<(), EsmCause>,
) -> MmeResult<()> {
    let attach_type = match ue.attach_proc() {
        Some(attach) if attach.state == AttachState::CreateSession && attach.default_pdn == Some(cid) => {
            attach.request.attach_type
        }
        _ => {
            log::warn!("[{}] Create session result without attach, PDN[{}]", ue.mme_ue_s1ap_id, cid);
            return Ok(());
        }
    };

    if let Err(esm_cause) = result {
        log::warn!("[{}] PDN connectivity failed [{:?}]", ue.mme_ue_s1ap_id, esm_cause);
        bearer::free_pdn_context(ue, cid)?;
        return reject_attach(ctx, ue, EmmCause::EsmFailure, Some(esm_cause));
    }

    let mut keys = UeKeys::of(ue);
    keys.guti = Some(ctx.alloc_guti());
    ctx.store.update_keys(ue, keys)?;

    let combined = attach_type == EpsAttachType::CombinedEpsImsiAttach && ctx.cfg.sgs.enabled;
    let accept = nas_build::build_attach_accept(ue, cid, ctx.cfg.served_tai(), combined)?;
    let ics = s1ap_build::build_initial_context_setup_request(ue, Some(accept.clone()), Some(cid))?;
    path::send_to_enb(ctx.sink, ics)?;

    let ue_id = ue.mme_ue_s1ap_id;
    ue.timers.ics_response = ctx.start_timer(MmeTimerId::IcsResponse, ue_id);
    let t3450 = ctx.start_timer(MmeTimerId::T3450, ue_id);
    if let Some(attach) = ue.attach_proc_mut() {
        attach.t3450 = t3450;
        attach.attach_accept_count += 1;
        attach.accept = Some(accept);
        attach.set_state(ue_id, AttachState::AcceptSent);
    }
    log::info!(
        "[{}] Attach accept GUTI[{}]",
        ue_id,
        ue.guti.map(|g| g.to_string()).unwrap_or_default()
    );
    Ok(())
}

// ============================================================================
// Reject / Failure
// ============================================================================

/// Send Attach Reject and drop the attach. An unregistered context is
/// released with it.
pub(crate) fn reject_attach(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: EmmCause,
    esm_cause: Option<EsmCause>,
) -> MmeResult<()> {
    let pti = ue.attach_proc().map(|a| a.request.pdn.pti).unwrap_or(0);
    log::warn!("[{}] Attach reject [{}]", ue.mme_ue_s1ap_id, cause.label());

    let reject = nas_build::build_attach_reject(cause, esm_cause, pti);
    let sent = path::send_downlink_nas(ctx.sink, ue, reject);
    ctx.count(names::NAS_ATTACH_REJECT, &[("cause", cause.label())]);

    ue.remove_attach_proc();
    if !ue.is_registered() {
        emm_detach::implicit_detach(ctx, ue);
    }
    sent
}

/// A common procedure failed. Emergency attaches continue without security.
pub(crate) fn attach_failed(ctx: &MmeCtx<'_>, ue: &mut UeContext, cause: EmmCause) -> MmeResult<()> {
    ue.failure_cause = Some(cause);
    if ue.emergency {
        log::info!(
            "[{}] Emergency attach continues after [{}]",
            ue.mme_ue_s1ap_id,
            cause.label()
        );
        ue.security.valid = false;
        return after_security(ctx, ue);
    }
    reject_attach(ctx, ue, cause, None)
}

/// Give up on the attach without a NAS reject
pub(crate) fn abort_attach(ctx: &MmeCtx<'_>, ue: &mut UeContext) {
    let ue_id = ue.mme_ue_s1ap_id;
    if let Some(mut attach) = ue.remove_attach_proc() {
        attach.set_state(ue_id, AttachState::Aborted);
    }
    ctx.count(names::UE_ATTACH, &[("result", "attach_proc_failure")]);
    if !ue.is_registered() {
        emm_detach::implicit_detach(ctx, ue);
    }
}

// ============================================================================
// Attach Complete
// ============================================================================

/// Handle Attach Complete
pub fn handle_attach_complete(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let (default_pdn, attach_type) = match ue.attach_proc_mut() {
        Some(attach) if attach.t3450.is_active() => {
            attach.t3450.stop();
            attach.set_state(ue_id, AttachState::Complete);
            (attach.default_pdn, attach.request.attach_type)
        }
        _ => {
            log::warn!("[{}] Attach complete with T3450 inactive, discarded", ue_id);
            return Ok(());
        }
    };

    let default_ebi = default_pdn
        .and_then(|cid| bearer::pdn_context(ue, cid))
        .and_then(|pdn| pdn.default_ebi);
    if let Some(bearer) = default_ebi.and_then(|ebi| bearer::get_bearer_context_mut(ue, ebi)) {
        bearer.activate();
    }

    ue.remove_attach_proc();
    ue.failure_cause = None;
    ue.set_mobility_state(MobilityState::Registered);
    ctx.count(names::UE_ATTACH, &[("result", "attach_proc_successful")]);
    log::info!("[{}] IMSI[{}] attached", ue_id, ue.imsi.as_deref().unwrap_or("-"));

    if attach_type == EpsAttachType::CombinedEpsImsiAttach && ctx.cfg.sgs.enabled {
        let lu = sgsap_build::build_location_update_request(ue)?;
        path::send_to_vlr(ctx.sink, lu)?;
        ue.sgs_state = SgsState::LaUpdateRequested;
    }
    Ok(())
}

/// Handle T3450 expiry
pub fn handle_t3450_expiry(ctx: &MmeCtx<'_>, ue: &mut UeContext, handle_id: u64) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let retransmit = match ue.attach_proc_mut() {
        Some(attach) if attach.t3450.matches(handle_id) => {
            attach.t3450.stop();
            if attach.attach_accept_count >= ATTACH_COUNTER_MAX {
                None
            } else {
                attach.attach_accept_count += 1;
                attach.accept.clone().map(|m| (m, attach.attach_accept_count))
            }
        }
        _ => {
            log::debug!("[{}] Stale T3450 ignored", ue_id);
            return Ok(());
        }
    };

    match retransmit {
        Some((accept, count)) => {
            log::info!("[{}] T3450 expired, attach accept sent {} times", ue_id, count);
            path::send_downlink_nas(ctx.sink, ue, accept)?;
            let timer = ctx.start_timer(MmeTimerId::T3450, ue_id);
            if let Some(attach) = ue.attach_proc_mut() {
                attach.t3450 = timer;
            }
            Ok(())
        }
        None => {
            log::warn!("[{}] T3450 expired {} times, attach aborted", ue_id, ATTACH_COUNTER_MAX);
            abort_attach(ctx, ue);
            Ok(())
        }
    }
}

// ============================================================================
// SGs Location Update
// ============================================================================

pub fn handle_sgs_location_update_accept(ue: &mut UeContext) -> MmeResult<()> {
    if ue.sgs_state != SgsState::LaUpdateRequested {
        log::warn!("[{}] SGs location update accept in {}", ue.mme_ue_s1ap_id, ue.sgs_state);
    }
    log::debug!("[{}] SGs: {} -> {}", ue.mme_ue_s1ap_id, ue.sgs_state, SgsState::Associated);
    ue.sgs_state = SgsState::Associated;
    Ok(())
}

pub fn handle_sgs_location_update_reject(ue: &mut UeContext, cause: u8) -> MmeResult<()> {
    log::warn!("[{}] SGs location update reject [{}]", ue.mme_ue_s1ap_id, cause);
    ue.sgs_state = SgsState::Null;
    Ok(())
}
