//! EMM Detach Procedures
//!
//! UE-initiated and network-initiated detach, and implicit detach. A detach
//! deletes every PDN session, releases the S1 connection and removes the UE
//! context from the store.

use crate::app::MmeCtx;
use crate::bearer;
use crate::context::{MobilityState, SgsState, UeContext, DETACH_COUNTER_MAX};
use crate::error::MmeResult;
use crate::event::DIAMETER_ERROR_USER_UNKNOWN;
use crate::metrics::names;
use crate::nas_build::{DetachType, NasMessage};
use crate::path;
use crate::procedure::{DetachKind, DetachProc, Procedure};
use crate::s11_build::{self, GtpCause};
use crate::s1ap_build::{self, nas_cause, S1apCause, S1apCauseGroup};
use crate::s6a_build::{S6aMessage, DIAMETER_SUCCESS};
use crate::sgsap_build::{self, EpsDetachType};
use crate::timer::MmeTimerId;

/// Notify the VLR of an EPS detach if the UE has an SGs association
fn sgs_detach(ctx: &MmeCtx<'_>, ue: &mut UeContext, detach_type: EpsDetachType) {
    if ue.sgs_state == SgsState::Null || !ctx.cfg.sgs.enabled {
        return;
    }
    match sgsap_build::build_eps_detach_indication(ue, detach_type)
        .and_then(|msg| path::send_to_vlr(ctx.sink, msg))
    {
        Ok(()) => log::debug!("[{}] SGs EPS detach indication sent", ue.mme_ue_s1ap_id),
        Err(e) => log::error!("[{}] SGs EPS detach indication failed: {}", ue.mme_ue_s1ap_id, e),
    }
    ue.sgs_state = SgsState::Null;
}

fn release_s1(ctx: &MmeCtx<'_>, ue: &UeContext, cause: u8) {
    if ue.enb_ue_key.is_none() {
        return;
    }
    let result = s1ap_build::ue_ids(ue).and_then(|ids| {
        path::send_to_enb(
            ctx.sink,
            s1ap_build::build_ue_context_release_command(
                ids,
                S1apCause::new(S1apCauseGroup::Nas, cause),
            ),
        )
    });
    if let Err(e) = result {
        log::error!("[{}] UE context release command failed: {}", ue.mme_ue_s1ap_id, e);
    }
}

/// Send Delete Session Request for every PDN with an SGW tunnel.
/// Returns how many were sent.
fn delete_sessions(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> usize {
    let mut sent = 0;
    for cid in bearer::pdn_cids(ue) {
        let dsr = match s11_build::build_delete_session_request(ue, cid) {
            Ok(dsr) => dsr,
            Err(e) => {
                log::debug!("[{}] PDN[{}] skipped: {}", ue.mme_ue_s1ap_id, cid, e);
                continue;
            }
        };
        let seq = ctx.next_seq();
        let ue_id = ue.mme_ue_s1ap_id;
        if let Some(pdn) = bearer::pdn_context_mut(ue, cid) {
            pdn.xact = Some(seq);
            match path::send_to_sgw(ctx.sink, pdn, seq, dsr) {
                Ok(()) => sent += 1,
                Err(e) => log::error!("[{}] Delete Session Request failed: {}", ue_id, e),
            }
        }
    }
    sent
}

// ============================================================================
// Implicit Detach
// ============================================================================

/// Detach without signalling the UE: delete sessions, release S1 and remove
/// the context at once. Late Delete Session Responses find no context.
pub fn implicit_detach(ctx: &MmeCtx<'_>, ue: &mut UeContext) {
    detach_locally(ctx, ue, true);
}

/// Implicit detach; `release` controls whether the S1 connection is released
pub(crate) fn detach_locally(ctx: &MmeCtx<'_>, ue: &mut UeContext, release: bool) {
    if !ue.is_indexed() {
        return;
    }
    log::info!(
        "[{}] Implicit detach IMSI[{}]",
        ue.mme_ue_s1ap_id,
        ue.imsi.as_deref().unwrap_or("-")
    );
    ue.abort_all_procedures();
    ue.timers.stop_all();

    delete_sessions(ctx, ue);
    sgs_detach(ctx, ue, EpsDetachType::NetworkInitiated);
    if release {
        release_s1(ctx, ue, nas_cause::DETACH);
    }

    ue.set_mobility_state(MobilityState::Unregistered);
    ctx.count(names::IMPLICIT_DETACH, &[]);
    ctx.store.remove(ue);
}

// ============================================================================
// UE-initiated Detach
// ============================================================================

/// Handle Detach Request from the UE
pub fn handle_detach_request(ctx: &MmeCtx<'_>, ue: &mut UeContext, switch_off: bool) -> MmeResult<()> {
    log::info!(
        "[{}] Detach request IMSI[{}]{}",
        ue.mme_ue_s1ap_id,
        ue.imsi.as_deref().unwrap_or("-"),
        if switch_off { " (switch off)" } else { "" }
    );
    ue.abort_all_procedures();
    ue.timers.stop_all();
    sgs_detach(ctx, ue, EpsDetachType::UeInitiated);

    let pending = delete_sessions(ctx, ue);
    let mut detach = DetachProc::new(DetachKind::UeInitiated { switch_off });
    detach.pending_sessions = pending;
    ue.add_procedure(Procedure::Detach(detach));
    if pending == 0 {
        finish_detach(ctx, ue);
    }
    Ok(())
}

/// Handle Delete Session Response
pub fn handle_delete_session_response(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    seq: u32,
    cause: GtpCause,
) -> MmeResult<()> {
    let cid = match bearer::pdn_by_xact(ue, seq) {
        Some(cid) => cid,
        None => {
            log::debug!("[{}] Delete Session Response #{} unmatched", ue.mme_ue_s1ap_id, seq);
            return Ok(());
        }
    };
    if !cause.is_accepted() {
        log::warn!("[{}] Delete Session Response PDN[{}] [{:?}]", ue.mme_ue_s1ap_id, cid, cause);
    }
    bearer::free_pdn_context(ue, cid)?;

    let done = match ue.detach_proc_mut() {
        Some(detach) => {
            detach.pending_sessions = detach.pending_sessions.saturating_sub(1);
            detach.pending_sessions == 0
        }
        None => false,
    };
    if done {
        finish_detach(ctx, ue);
    }
    Ok(())
}

fn finish_detach(ctx: &MmeCtx<'_>, ue: &mut UeContext) {
    let kind = ue
        .remove_procedures(|p| matches!(p, Procedure::Detach(_)))
        .into_iter()
        .find_map(|p| match p {
            Procedure::Detach(d) => Some(d.kind),
            _ => None,
        });

    if kind == Some(DetachKind::UeInitiated { switch_off: false }) {
        if let Err(e) = path::send_downlink_nas(ctx.sink, ue, NasMessage::DetachAccept) {
            log::error!("[{}] Detach accept failed: {}", ue.mme_ue_s1ap_id, e);
        }
    }
    release_s1(ctx, ue, nas_cause::DETACH);

    ue.set_mobility_state(MobilityState::Unregistered);
    ctx.count(names::UE_DETACH, &[]);
    log::info!("[{}] IMSI[{}] detached", ue.mme_ue_s1ap_id, ue.imsi.as_deref().unwrap_or("-"));
    ctx.store.remove(ue);
}

// ============================================================================
// Network-initiated Detach
// ============================================================================

/// Start a network-initiated detach. An IDLE UE is detached implicitly.
pub fn start_network_detach(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    if !ue.is_connected() {
        implicit_detach(ctx, ue);
        return Ok(());
    }
    log::info!("[{}] Network-initiated detach", ue.mme_ue_s1ap_id);
    ue.abort_all_procedures();

    let message = NasMessage::DetachRequest {
        detach_type: DetachType::ReattachRequired,
        cause: None,
    };
    path::send_downlink_nas(ctx.sink, ue, message.clone())?;

    let mut detach = DetachProc::new(DetachKind::NetworkInitiated);
    detach.t3422 = ctx.start_timer(MmeTimerId::T3422, ue.mme_ue_s1ap_id);
    detach.retx_count = 1;
    detach.message = Some(message);
    ue.add_procedure(Procedure::Detach(detach));
    Ok(())
}

/// Handle Detach Accept for a network-initiated detach
pub fn handle_detach_accept(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    match ue.detach_proc_mut() {
        Some(detach) if detach.kind == DetachKind::NetworkInitiated => detach.t3422.stop(),
        _ => {
            log::warn!("[{}] Unexpected detach accept", ue.mme_ue_s1ap_id);
            return Ok(());
        }
    }
    sgs_detach(ctx, ue, EpsDetachType::NetworkInitiated);

    let pending = delete_sessions(ctx, ue);
    if let Some(detach) = ue.detach_proc_mut() {
        detach.pending_sessions = pending;
    }
    if pending == 0 {
        finish_detach(ctx, ue);
    }
    Ok(())
}

/// Handle T3422 expiry
pub fn handle_t3422_expiry(ctx: &MmeCtx<'_>, ue: &mut UeContext, handle_id: u64) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let retransmit = match ue.detach_proc_mut() {
        Some(detach) if detach.t3422.matches(handle_id) => {
            detach.t3422.stop();
            if detach.retx_count >= DETACH_COUNTER_MAX {
                None
            } else {
                detach.retx_count += 1;
                detach.message.clone()
            }
        }
        _ => {
            log::debug!("[{}] Stale T3422 ignored", ue_id);
            return Ok(());
        }
    };

    match retransmit {
        Some(message) => {
            log::info!("[{}] T3422 expired, detach request retransmitted", ue_id);
            path::send_downlink_nas(ctx.sink, ue, message)?;
            let timer = ctx.start_timer(MmeTimerId::T3422, ue_id);
            if let Some(detach) = ue.detach_proc_mut() {
                detach.t3422 = timer;
            }
        }
        None => {
            log::warn!("[{}] T3422 expired {} times", ue_id, DETACH_COUNTER_MAX);
            implicit_detach(ctx, ue);
        }
    }
    Ok(())
}

/// Handle Cancel-Location-Request from the HSS
pub fn handle_cancel_location_request(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    let imsi = ue.imsi.clone().unwrap_or_default();
    let result_code = if imsi.is_empty() {
        DIAMETER_ERROR_USER_UNKNOWN
    } else {
        DIAMETER_SUCCESS
    };
    path::send_to_hss(ctx.sink, S6aMessage::CancelLocationAnswer { imsi, result_code })?;
    start_network_detach(ctx, ue)
}
