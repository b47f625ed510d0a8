//! S1 Mobility Procedures
//!
//! S1 handover through the MME, X2 path switch and E-RAB modification
//! indication. All three end in a Modify Bearer round towards the SGW whose
//! completion is answered from `session::finish_modify`.

use crate::app::MmeCtx;
use crate::bearer;
use crate::context::{Ebi, HandoverContext, ModifyAction, ReleaseAction, UeContext};
use crate::error::{MmeError, MmeResult};
use crate::event::{
    ErabAdmitted, HandoverNotify, HandoverRequestAcknowledge, HandoverRequired, PathSwitchRequest,
};
use crate::metrics::names;
use crate::path;
use crate::s1ap_build::{
    self, radio_network_cause, S1apCause, S1apCauseGroup, S1apMessage, UeS1apIds,
};
use crate::session;
use crate::ue_store::UeKeys;

const HANDOVER_CANCELLED: S1apCause =
    S1apCause::new(S1apCauseGroup::RadioNetwork, radio_network_cause::HANDOVER_CANCELLED);
const SUCCESSFUL_HANDOVER: S1apCause =
    S1apCause::new(S1apCauseGroup::RadioNetwork, radio_network_cause::SUCCESSFUL_HANDOVER);

fn require_connected(ue: &UeContext, what: &str) -> MmeResult<()> {
    if ue.is_connected() && ue.enb_ue_key.is_some() {
        return Ok(());
    }
    log::warn!("[{}] {} for a UE without S1 connection", ue.mme_ue_s1ap_id, what);
    Err(MmeError::InvalidState(ue.mme_ue_s1ap_id, format!("{} while {}", what, ue.ecm_state)))
}

fn admitted_ebis(admitted: &[ErabAdmitted]) -> Vec<Ebi> {
    admitted.iter().map(|a| a.ebi).collect()
}

// ============================================================================
// S1 Handover
// ============================================================================

/// Handle Handover Required
pub fn handle_handover_required(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: &HandoverRequired,
) -> MmeResult<()> {
    require_connected(ue, "Handover Required")?;
    let ue_id = ue.mme_ue_s1ap_id;

    if ue.handover.is_some() || ue.modify_action != ModifyAction::NoAction {
        log::warn!("[{}] Handover Required during another mobility procedure", ue_id);
        let ids = s1ap_build::ue_ids(ue)?;
        return path::send_to_enb(
            ctx.sink,
            S1apMessage::HandoverPreparationFailure {
                ids,
                cause: S1apCause::new(S1apCauseGroup::RadioNetwork, radio_network_cause::UNSPECIFIED),
            },
        );
    }

    log::info!("[{}] Handover Required towards eNB[{}]", ue_id, req.target_enb_id);
    ue.handover = Some(HandoverContext {
        source: ue.enb_ue_key,
        target_enb_id: req.target_enb_id,
        ..Default::default()
    });
    let msg =
        s1ap_build::build_handover_request(ue, req.target_enb_id, req.cause, req.container.clone());
    path::send_to_enb(ctx.sink, msg)
}

/// Handle Handover Request Acknowledge from the target eNB
pub fn handle_handover_request_ack(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    ack: &HandoverRequestAcknowledge,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let source = match ue.handover.as_mut() {
        Some(ho) => {
            ho.target = Some(ack.target);
            ho.admitted = ack.admitted.clone();
            ho.not_admitted = ack.not_admitted.clone();
            ho.source
        }
        None => {
            log::warn!("[{}] Handover Request Acknowledge without handover", ue_id);
            return Ok(());
        }
    };
    let source = source.ok_or_else(|| {
        MmeError::InvalidState(ue_id, "handover without source eNB".to_string())
    })?;

    log::info!(
        "[{}] Target {} admitted EBI{:?}",
        ue_id,
        ack.target,
        admitted_ebis(&ack.admitted)
    );
    path::send_to_enb(
        ctx.sink,
        S1apMessage::HandoverCommand {
            ids: UeS1apIds { mme_ue_s1ap_id: ue_id, enb_ue_key: source },
            not_admitted: ack.not_admitted.clone(),
            container: ack.container.clone(),
        },
    )
}

/// Handle Handover Failure from the target eNB
pub fn handle_handover_failure(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: S1apCause,
) -> MmeResult<()> {
    if ue.handover.take().is_none() {
        log::warn!("[{}] Handover Failure without handover", ue.mme_ue_s1ap_id);
        return Ok(());
    }
    log::warn!("[{}] Handover preparation failed [{:?}]", ue.mme_ue_s1ap_id, cause);
    let ids = s1ap_build::ue_ids(ue)?;
    ctx.count(names::S1_HANDOVER, &[("result", "failure")]);
    path::send_to_enb(ctx.sink, S1apMessage::HandoverPreparationFailure { ids, cause })
}

/// Handle Handover Cancel from the source eNB
pub fn handle_handover_cancel(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    cause: S1apCause,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let ho = ue.handover.take();
    log::info!("[{}] Handover cancelled [{:?}]", ue_id, cause);

    let ids = s1ap_build::ue_ids(ue)?;
    path::send_to_enb(ctx.sink, S1apMessage::HandoverCancelAcknowledge { ids })?;

    if let Some(target) = ho.and_then(|ho| ho.target) {
        let target_ids = UeS1apIds { mme_ue_s1ap_id: ue_id, enb_ue_key: target };
        path::send_to_enb(
            ctx.sink,
            s1ap_build::build_ue_context_release_command(target_ids, HANDOVER_CANCELLED),
        )?;
    }
    ctx.count(names::S1_HANDOVER, &[("result", "cancelled")]);
    Ok(())
}

/// Handle Handover Notify: the UE arrived at the target
pub fn handle_handover_notify(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    notify: &HandoverNotify,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let admitted = match &ue.handover {
        Some(ho) if ho.target == Some(notify.enb_ue_key) => ho.admitted.clone(),
        _ => {
            log::warn!("[{}] Handover Notify from unexpected {}", ue_id, notify.enb_ue_key);
            return Ok(());
        }
    };
    let requests = session::build_modify_bearer_requests(ue, &admitted)?;
    let source_ids = s1ap_build::ue_ids(ue)?;

    let mut keys = UeKeys::of(ue);
    keys.enb_ue_key = Some(notify.enb_ue_key);
    ctx.store.update_keys(ue, keys)?;
    ue.tai = notify.tai;
    ue.ecgi = notify.ecgi;

    ue.release_action = ReleaseAction::HandoverSourceRemove;
    path::send_to_enb(
        ctx.sink,
        s1ap_build::build_ue_context_release_command(source_ids, SUCCESSFUL_HANDOVER),
    )?;

    log::info!("[{}] Handover complete, now on {}", ue_id, notify.enb_ue_key);
    ctx.count(names::S1_HANDOVER, &[("result", "success")]);
    session::send_modify_bearer_requests(ctx, ue, requests, ModifyAction::InHandoverNotify)
}

// ============================================================================
// X2 Path Switch
// ============================================================================

/// Handle Path Switch Request from the new eNB
pub fn handle_path_switch_request(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: &PathSwitchRequest,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let requests = match session::build_modify_bearer_requests(ue, &req.to_be_switched) {
        Ok(requests) => requests,
        Err(e) => {
            log::error!("[{}] Path switch rejected: {}", ue_id, e);
            ctx.count(names::PATH_SWITCH, &[("result", "failure")]);
            return path::send_to_enb(
                ctx.sink,
                S1apMessage::PathSwitchRequestFailure {
                    ids: UeS1apIds { mme_ue_s1ap_id: ue_id, enb_ue_key: req.enb_ue_key },
                    cause: S1apCause::new(
                        S1apCauseGroup::RadioNetwork,
                        radio_network_cause::UNSPECIFIED,
                    ),
                },
            );
        }
    };

    let switched = admitted_ebis(&req.to_be_switched);
    let not_admitted: Vec<Ebi> = bearer::all_ebis(ue)
        .into_iter()
        .filter(|ebi| !switched.contains(ebi))
        .collect();

    let mut keys = UeKeys::of(ue);
    keys.enb_ue_key = Some(req.enb_ue_key);
    ctx.store.update_keys(ue, keys)?;
    ue.tai = req.tai;
    ue.ecgi = req.ecgi;
    log::info!("[{}] Path switch to {}", ue_id, req.enb_ue_key);

    ue.handover = Some(HandoverContext {
        target: Some(req.enb_ue_key),
        admitted: req.to_be_switched.clone(),
        not_admitted,
        ..Default::default()
    });
    session::send_modify_bearer_requests(ctx, ue, requests, ModifyAction::InPathSwitchRequest)
}

// ============================================================================
// E-RAB Modification
// ============================================================================

/// Handle E-RAB Modification Indication
pub fn handle_erab_modification_indication(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    modified: &[ErabAdmitted],
) -> MmeResult<()> {
    require_connected(ue, "E-RAB Modification Indication")?;
    if ue.modify_action != ModifyAction::NoAction {
        return Err(MmeError::InvalidState(
            ue.mme_ue_s1ap_id,
            "modify bearer round already running".to_string(),
        ));
    }
    let requests = session::build_modify_bearer_requests(ue, modified)?;
    ue.handover = Some(HandoverContext {
        admitted: modified.to_vec(),
        ..Default::default()
    });
    session::send_modify_bearer_requests(ctx, ue, requests, ModifyAction::InErabModification)
}
