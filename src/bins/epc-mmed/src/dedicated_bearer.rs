//! Dedicated Bearer Procedures
//!
//! SGW-initiated Create Bearer and Delete Bearer. One S11 procedure tracks
//! the N per-bearer confirmations of a request under its sequence number and
//! answers the SGW once, when all of them are recorded or its guard expires.

use crate::app::MmeCtx;
use crate::bearer::{self, EsmState};
use crate::context::{Ebi, PdnCid, UeContext};
use crate::error::MmeResult;
use crate::event::{CreateBearerRequest, DeleteBearerRequest};
use crate::metrics::names;
use crate::nas_build::{self, EsmCause};
use crate::path;
use crate::procedure::{BearerEntry, BearerOutcome, BearerProc, Procedure};
use crate::s11_build::{self, BearerResult, GtpCause, S11Message};
use crate::s1ap_build;
use crate::session;
use crate::timer::MmeTimerId;

/// Send an S11 answer on the PDN's path, or on the default path when the
/// PDN is gone
fn answer_sgw(
    ctx: &MmeCtx<'_>,
    ue: &UeContext,
    cid: Option<PdnCid>,
    seq: u32,
    msg: S11Message,
) -> MmeResult<()> {
    match cid.and_then(|cid| bearer::pdn_context(ue, cid)) {
        Some(pdn) => path::send_to_sgw(ctx.sink, pdn, seq, msg),
        None => path::send_to_spgw(ctx.sink, seq, msg),
    }
}

/// Reject every bearer of a Create Bearer Request with `cause`
fn reject_create_bearer(
    ctx: &MmeCtx<'_>,
    ue: &UeContext,
    req: &CreateBearerRequest,
    cause: GtpCause,
) -> MmeResult<()> {
    let cid = bearer::pdn_by_default_ebi(ue, req.linked_ebi);
    let sgw_s11_teid = cid
        .and_then(|cid| bearer::pdn_context(ue, cid))
        .and_then(|pdn| pdn.sgw_s11_teid())
        .unwrap_or_default();
    let results = req
        .bearers
        .iter()
        .map(|b| BearerResult {
            ebi: None,
            sgw_s1u_teid: b.sgw_s1u.teid,
            enb_s1u: None,
            cause,
        })
        .collect();
    ctx.count(names::DEDICATED_BEARER_ACTIVATION, &[("result", "rejected")]);
    answer_sgw(
        ctx,
        ue,
        cid,
        req.seq,
        s11_build::build_create_bearer_response(sgw_s11_teid, results),
    )
}

// ============================================================================
// Create Bearer
// ============================================================================

/// Handle Create Bearer Request
pub fn handle_create_bearer_request(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: CreateBearerRequest,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let cid = match bearer::pdn_by_default_ebi(ue, req.linked_ebi) {
        Some(cid) => cid,
        None => {
            log::warn!("[{}] Create Bearer Request for unknown LBI[{}]", ue_id, req.linked_ebi);
            return Ok(());
        }
    };
    if ue.s11_proc_by_token(req.seq).is_some() {
        log::warn!("[{}] Create Bearer Request #{} already running", ue_id, req.seq);
        return Ok(());
    }

    // Queued requests go out first, in order, once the UE is reachable
    if !ue.is_connected() || ue.pending_bearer_count() > 0 {
        return queue_create_bearer(ctx, ue, req);
    }

    let sgw_s11_teid = bearer::pdn_context(ue, cid)
        .and_then(|pdn| pdn.sgw_s11_teid())
        .unwrap_or_default();
    let mut proc_ = BearerProc::new(req.seq, sgw_s11_teid, req.linked_ebi, cid, req.pti);
    for candidate in &req.bearers {
        let ebi = match bearer::create_bearer_context(ue, cid, None, false) {
            Ok(ebi) => ebi,
            Err(e) => {
                log::warn!("[{}] No EBI for dedicated bearer: {}", ue_id, e);
                proc_.entries.push(BearerEntry {
                    ebi: None,
                    sgw_s1u_teid: candidate.sgw_s1u.teid,
                    outcome: BearerOutcome::Rejected(GtpCause::NoResourcesAvailable),
                });
                continue;
            }
        };
        let nas = match bearer::get_bearer_context_mut(ue, ebi) {
            Some(b) => {
                b.qos = candidate.qos;
                b.sgw_s1u = Some(candidate.sgw_s1u);
                b.pgw_s5u = candidate.pgw_s5u;
                b.tft = candidate.tft.clone();
                b.pti = req.pti;
                b.mark_pending();
                nas_build::build_activate_dedicated_bearer_request(b, req.linked_ebi)
            }
            None => continue,
        };

        let outcome = match s1ap_build::build_e_rab_setup_request(ue, ebi, nas)
            .and_then(|msg| path::send_to_enb(ctx.sink, msg))
        {
            Ok(()) => BearerOutcome::Pending,
            Err(e) => {
                log::error!("[{}] E-RAB setup EBI[{}] failed: {}", ue_id, ebi, e);
                bearer::free_bearer_context(ue, ebi)?;
                BearerOutcome::Rejected(GtpCause::NoResourcesAvailable)
            }
        };
        proc_.entries.push(BearerEntry {
            ebi: Some(ebi),
            sgw_s1u_teid: candidate.sgw_s1u.teid,
            outcome,
        });
    }

    log::info!(
        "[{}] Create Bearer #{} LBI[{}]: {} bearer(s) pending",
        ue_id,
        req.seq,
        req.linked_ebi,
        proc_.pending().len()
    );
    start_proc(ctx, ue, Procedure::CreateBearer(proc_))
}

/// Add an S11 procedure and start its guard, or answer at once when nothing
/// is pending
fn start_proc(ctx: &MmeCtx<'_>, ue: &mut UeContext, mut proc_: Procedure) -> MmeResult<()> {
    let token = match &mut proc_ {
        Procedure::CreateBearer(p) | Procedure::DeleteBearer(p) => {
            if !p.is_complete() {
                p.guard = ctx.start_timer(MmeTimerId::S11BearerGuard, ue.mme_ue_s1ap_id);
            }
            p.token
        }
        _ => return Ok(()),
    };
    ue.add_procedure(proc_);
    if ue.s11_proc_by_token(token).map_or(false, BearerProc::is_complete) {
        finish(ctx, ue, token)?;
    }
    Ok(())
}

/// Queue a request for an IDLE UE and page it once
fn queue_create_bearer(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: CreateBearerRequest,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    match ue.pending_bearer_requests.iter().position(Option::is_none) {
        Some(slot) => {
            log::info!("[{}] Create Bearer #{} queued in slot {}", ue_id, req.seq, slot);
            ue.pending_bearer_requests[slot] = Some(req);
        }
        None => {
            log::warn!("[{}] Pending bearer queue full", ue_id);
            return reject_create_bearer(ctx, ue, &req, GtpCause::NoResourcesAvailable);
        }
    }

    if !ue.is_connected() && !ue.timers.paging_response.is_active() {
        session::page_ue(ctx, ue)?;
    }
    Ok(())
}

/// Replay queued requests in slot order once the UE is connected
pub fn replay_pending_requests(ctx: &MmeCtx<'_>, ue: &mut UeContext) -> MmeResult<()> {
    if !ue.is_connected() || ue.pending_bearer_count() == 0 {
        return Ok(());
    }
    let queued: Vec<_> = ue
        .pending_bearer_requests
        .iter_mut()
        .filter_map(Option::take)
        .collect();
    log::debug!("[{}] Replaying {} queued bearer request(s)", ue.mme_ue_s1ap_id, queued.len());
    for req in queued {
        handle_create_bearer_request(ctx, ue, req)?;
    }
    Ok(())
}

/// Reject and drain every queued request
pub fn reject_pending_requests(ctx: &MmeCtx<'_>, ue: &mut UeContext, cause: GtpCause) -> MmeResult<()> {
    let queued: Vec<_> = ue
        .pending_bearer_requests
        .iter_mut()
        .filter_map(Option::take)
        .collect();
    for req in &queued {
        log::warn!("[{}] Create Bearer #{} rejected [{:?}]", ue.mme_ue_s1ap_id, req.seq, cause);
        reject_create_bearer(ctx, ue, req, cause)?;
    }
    Ok(())
}

/// Handle Activate Dedicated EPS Bearer Context Accept
pub fn handle_activate_accept(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: Ebi) -> MmeResult<()> {
    record(ctx, ue, ebi, BearerOutcome::Accepted)
}

/// Handle Activate Dedicated EPS Bearer Context Reject
pub fn handle_activate_reject(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: Ebi) -> MmeResult<()> {
    record(ctx, ue, ebi, BearerOutcome::Rejected(GtpCause::RequestRejected))
}

/// Record one UE confirmation; the first one for an EBI wins. Rejected
/// bearers and bearers under deactivation are released.
fn record(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: Ebi, outcome: BearerOutcome) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let recorded = match ue.s11_proc_for_ebi_mut(ebi) {
        Some(p) => {
            if p.record(ebi, outcome) {
                Some((p.token, p.is_complete()))
            } else {
                None
            }
        }
        None => None,
    };
    let (token, complete) = match recorded {
        Some(r) => r,
        None => {
            log::warn!("[{}] No pending procedure for EBI[{}], ignored", ue_id, ebi);
            return Ok(());
        }
    };
    log::debug!("[{}] EBI[{}] {:?}", ue_id, ebi, outcome);

    let deactivating = bearer::get_bearer_context(ue, ebi)
        .map_or(false, |b| b.state == EsmState::InactivePending);
    if outcome != BearerOutcome::Accepted || deactivating {
        bearer::free_bearer_context(ue, ebi)?;
    }
    if complete {
        finish(ctx, ue, token)?;
    }
    Ok(())
}

// ============================================================================
// Delete Bearer
// ============================================================================

/// Handle Delete Bearer Request
pub fn handle_delete_bearer_request(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    req: &DeleteBearerRequest,
) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let targets: Vec<Ebi> = match req.linked_ebi {
        Some(lbi) => vec![lbi],
        None => req.ebis.clone(),
    };
    let cid = targets
        .iter()
        .find_map(|ebi| bearer::get_bearer_context(ue, *ebi).map(|b| b.pdn_cid));
    let sgw_s11_teid = cid
        .and_then(|cid| bearer::pdn_context(ue, cid))
        .and_then(|pdn| pdn.sgw_s11_teid())
        .unwrap_or_default();
    log::info!("[{}] Delete Bearer #{} EBI{:?}", ue_id, req.seq, targets);

    let mut proc_ = BearerProc::new(
        req.seq,
        sgw_s11_teid,
        req.linked_ebi.unwrap_or_default(),
        cid.unwrap_or_default(),
        0,
    );
    let connected = ue.is_connected();
    for ebi in targets {
        let sgw_s1u_teid = match bearer::get_bearer_context(ue, ebi) {
            Some(b) => b.sgw_s1u.map(|f| f.teid).unwrap_or_default(),
            None => {
                proc_.entries.push(BearerEntry {
                    ebi: Some(ebi),
                    sgw_s1u_teid: 0,
                    outcome: BearerOutcome::Rejected(GtpCause::ContextNotFound),
                });
                continue;
            }
        };

        let outcome = if connected {
            match send_deactivation(ctx, ue, ebi) {
                Ok(()) => BearerOutcome::Pending,
                Err(e) => {
                    log::error!("[{}] Deactivate EBI[{}] failed: {}", ue_id, ebi, e);
                    bearer::free_bearer_context(ue, ebi)?;
                    BearerOutcome::Accepted
                }
            }
        } else {
            bearer::free_bearer_context(ue, ebi)?;
            BearerOutcome::Accepted
        };
        proc_.entries.push(BearerEntry {
            ebi: Some(ebi),
            sgw_s1u_teid,
            outcome,
        });
    }

    if proc_.is_complete() {
        return send_response(ctx, ue, Procedure::DeleteBearer(proc_));
    }
    start_proc(ctx, ue, Procedure::DeleteBearer(proc_))
}

fn send_deactivation(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: Ebi) -> MmeResult<()> {
    let nas = match bearer::get_bearer_context_mut(ue, ebi) {
        Some(b) => {
            b.mark_inactive_pending();
            nas_build::build_deactivate_bearer_request(b, EsmCause::RegularDeactivation)
        }
        None => return Ok(()),
    };
    let msg = s1ap_build::build_e_rab_release_command(ue, ebi, nas)?;
    path::send_to_enb(ctx.sink, msg)
}

/// Handle Deactivate EPS Bearer Context Accept
pub fn handle_deactivate_accept(ctx: &MmeCtx<'_>, ue: &mut UeContext, ebi: Ebi) -> MmeResult<()> {
    if ue.s11_proc_for_ebi(ebi).is_some() {
        return record(ctx, ue, ebi, BearerOutcome::Accepted);
    }
    match bearer::get_bearer_context(ue, ebi) {
        Some(b) if b.state == EsmState::InactivePending => {
            log::debug!("[{}] EBI[{}] deactivated", ue.mme_ue_s1ap_id, ebi);
            bearer::free_bearer_context(ue, ebi)?;
        }
        _ => log::warn!("[{}] Unexpected deactivate accept EBI[{}]", ue.mme_ue_s1ap_id, ebi),
    }
    Ok(())
}

// ============================================================================
// Completion
// ============================================================================

/// Handle S11 bearer procedure guard expiry: every pending confirmation
/// fails with NO_RESOURCES_AVAILABLE and its bearer is freed
pub fn handle_guard_expiry(ctx: &MmeCtx<'_>, ue: &mut UeContext, handle_id: u64) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let token = match ue
        .procedures
        .iter()
        .filter_map(Procedure::bearer_proc)
        .find(|p| p.guard.matches(handle_id))
    {
        Some(p) => p.token,
        None => {
            log::debug!("[{}] Stale S11 bearer guard ignored", ue_id);
            return Ok(());
        }
    };

    let pending = match ue.s11_proc_by_token_mut(token) {
        Some(p) => {
            p.guard.stop();
            let pending = p.pending();
            for ebi in &pending {
                p.record(*ebi, BearerOutcome::Rejected(GtpCause::NoResourcesAvailable));
            }
            pending
        }
        None => return Ok(()),
    };
    log::warn!("[{}] S11 procedure #{}: no confirmation for EBI{:?}", ue_id, token, pending);
    for ebi in pending {
        if let Err(e) = bearer::free_bearer_context(ue, ebi) {
            log::warn!("[{}] EBI[{}] release failed: {}", ue_id, ebi, e);
        }
    }
    finish(ctx, ue, token)
}

fn finish(ctx: &MmeCtx<'_>, ue: &mut UeContext, token: u32) -> MmeResult<()> {
    match ue.remove_s11_proc(token) {
        Some(proc_) => send_response(ctx, ue, proc_),
        None => Ok(()),
    }
}

fn bearer_results(ue: &mut UeContext, p: &BearerProc, activate: bool) -> Vec<BearerResult> {
    p.entries
        .iter()
        .map(|entry| {
            let cause = match entry.outcome {
                BearerOutcome::Accepted => GtpCause::RequestAccepted,
                BearerOutcome::Rejected(cause) => cause,
                BearerOutcome::Pending => GtpCause::NoResourcesAvailable,
            };
            let mut enb_s1u = None;
            if activate && entry.outcome == BearerOutcome::Accepted {
                if let Some(b) = entry.ebi.and_then(|ebi| bearer::get_bearer_context_mut(ue, ebi)) {
                    b.activate();
                    enb_s1u = b.enb_s1u;
                }
            }
            BearerResult {
                ebi: entry.ebi,
                sgw_s1u_teid: entry.sgw_s1u_teid,
                enb_s1u,
                cause,
            }
        })
        .collect()
}

/// Send the single aggregate response of a finished S11 procedure
fn send_response(ctx: &MmeCtx<'_>, ue: &mut UeContext, proc_: Procedure) -> MmeResult<()> {
    let ue_id = ue.mme_ue_s1ap_id;
    let (p, msg) = match proc_ {
        Procedure::CreateBearer(p) => {
            let results = bearer_results(ue, &p, true);
            let msg = s11_build::build_create_bearer_response(p.sgw_s11_teid, results);
            let result = if p.any_accepted() { "accepted" } else { "rejected" };
            ctx.count(names::DEDICATED_BEARER_ACTIVATION, &[("result", result)]);
            (p, msg)
        }
        Procedure::DeleteBearer(p) => {
            let results = bearer_results(ue, &p, false);
            let msg = s11_build::build_delete_bearer_response(p.sgw_s11_teid, results);
            (p, msg)
        }
        other => {
            log::error!("[{}] {} is not an S11 procedure", ue_id, other.name());
            return Ok(());
        }
    };
    log::info!("[{}] {} #{} answered", ue_id, msg.name(), p.token);
    answer_sgw(ctx, ue, Some(p.pdn_cid), p.token, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Fteid, FteidInterface, Qos};
    use crate::event::{BearerToBeCreated, MmeEvent, NasUplink, S11Event};
    use crate::path::OutboundMessage;
    use crate::s11_build::GtpXact;
    use crate::s1ap_build::S1apMessage;
    use crate::testing::{self, TestApp};
    use crate::timer::MmeTimer;
    use crate::ue_store::lock_ue;
    use bytes::Bytes;

    fn candidate(teid: u32) -> BearerToBeCreated {
        BearerToBeCreated {
            sgw_s1u: Fteid {
                interface: FteidInterface::S1uSgwGtpU,
                teid,
                addr: Default::default(),
            },
            pgw_s5u: None,
            qos: Qos {
                qci: 1,
                ..Default::default()
            },
            tft: Bytes::from_static(&[0x21]),
        }
    }

    fn create_bearer(t: &TestApp, ue_id: u32, seq: u32, n: u32) {
        let teid = testing::mme_s11_teid(t, ue_id);
        t.app
            .dispatch(MmeEvent::S11(S11Event::CreateBearerRequest(CreateBearerRequest {
                teid,
                seq,
                linked_ebi: 5,
                pti: 0,
                bearers: (0..n).map(|i| candidate(0x500 + i)).collect(),
                pco: Bytes::new(),
            })))
            .unwrap();
    }

    fn s11_responses(sent: &[(crate::path::PeerTask, OutboundMessage)]) -> Vec<S11Message> {
        sent.iter()
            .filter_map(|(_, m)| match m {
                OutboundMessage::S11(GtpXact { message, .. }) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_bearers_one_aggregate_response() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000021");
        t.sink.take();

        create_bearer(&t, ue_id, 100, 2);
        let setups = t
            .sink
            .take()
            .into_iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::S1ap(S1apMessage::ERabSetupRequest { .. })))
            .count();
        assert_eq!(setups, 2);

        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerAccept { ebi: 6 });
        assert!(s11_responses(&t.sink.take()).is_empty());

        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerReject { ebi: 7 });
        let rsps = s11_responses(&t.sink.take());
        assert_eq!(rsps.len(), 1);
        match &rsps[0] {
            S11Message::CreateBearerResponse { cause, bearers, .. } => {
                assert_eq!(*cause, GtpCause::RequestAccepted);
                assert_eq!(bearers[0].cause, GtpCause::RequestAccepted);
                assert_eq!(bearers[1].cause, GtpCause::RequestRejected);
            }
            other => panic!("unexpected {:?}", other),
        }

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert!(ue.s11_proc_by_token(100).is_none());
        assert_eq!(bearer::get_bearer_context(&ue, 6).unwrap().state, EsmState::Active);
        assert!(bearer::get_bearer_context(&ue, 7).is_none());
    }

    #[test]
    fn test_duplicate_confirmation_ignored() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000022");
        create_bearer(&t, ue_id, 101, 2);
        t.sink.take();

        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerAccept { ebi: 6 });
        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerReject { ebi: 6 });
        assert!(s11_responses(&t.sink.take()).is_empty());
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        assert!(bearer::get_bearer_context(&lock_ue(&ue_ref), 6).is_some());
    }

    #[test]
    fn test_guard_expiry_rejects_pending() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000023");
        create_bearer(&t, ue_id, 102, 2);
        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerAccept { ebi: 6 });
        t.sink.take();

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let guard = lock_ue(&ue_ref).s11_proc_by_token(102).unwrap().guard.id();
        t.app
            .on_timer(MmeTimer { id: MmeTimerId::S11BearerGuard, ue_id }, guard)
            .unwrap();

        let rsps = s11_responses(&t.sink.take());
        assert_eq!(rsps.len(), 1);
        match &rsps[0] {
            S11Message::CreateBearerResponse { bearers, .. } => {
                assert_eq!(bearers[1].cause, GtpCause::NoResourcesAvailable);
            }
            other => panic!("unexpected {:?}", other),
        }
        let ue = lock_ue(&ue_ref);
        assert!(ue.procedures.is_empty());
        assert!(bearer::get_bearer_context(&ue, 7).is_none());
    }

    #[test]
    fn test_unknown_lbi_dropped() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000024");
        t.sink.take();
        let teid = testing::mme_s11_teid(&t, ue_id);
        t.app
            .dispatch(MmeEvent::S11(S11Event::CreateBearerRequest(CreateBearerRequest {
                teid,
                seq: 7,
                linked_ebi: 9,
                pti: 0,
                bearers: vec![candidate(1)],
                pco: Bytes::new(),
            })))
            .unwrap();
        assert!(t.sink.take().is_empty());
    }

    #[test]
    fn test_idle_requests_queue_and_page_once() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000025");
        testing::make_idle(&t, ue_id);
        t.sink.take();

        create_bearer(&t, ue_id, 200, 1);
        create_bearer(&t, ue_id, 201, 1);
        let pages = t
            .sink
            .take()
            .into_iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::S1ap(S1apMessage::Paging { .. })))
            .count();
        assert_eq!(pages, 1);

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.pending_bearer_count(), 2);
        assert_eq!(ue.pending_bearer_requests[0].as_ref().unwrap().seq, 200);
        assert_eq!(ue.pending_bearer_requests[1].as_ref().unwrap().seq, 201);
    }

    #[test]
    fn test_queued_requests_replayed_before_newer_ones() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000029");
        testing::make_idle(&t, ue_id);
        create_bearer(&t, ue_id, 200, 1);

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let guti = lock_ue(&ue_ref).guti;
        t.app
            .dispatch(testing::service_request(testing::origin(testing::enb_key(2)), guti))
            .unwrap();
        t.sink.take();

        // Connected again, but the older request is still waiting
        create_bearer(&t, ue_id, 201, 1);
        assert!(!t
            .sink
            .take()
            .iter()
            .any(|(_, m)| matches!(m, OutboundMessage::S1ap(S1apMessage::ERabSetupRequest { .. }))));
        {
            let ue = lock_ue(&ue_ref);
            assert!(ue.s11_proc_by_token(201).is_none());
            assert_eq!(ue.pending_bearer_requests[0].as_ref().unwrap().seq, 200);
            assert_eq!(ue.pending_bearer_requests[1].as_ref().unwrap().seq, 201);
        }

        t.app
            .dispatch(MmeEvent::S1ap(crate::event::S1apEvent::InitialContextSetupResponse(
                crate::event::InitialContextSetupResponse {
                    mme_ue_s1ap_id: ue_id,
                    setup: vec![crate::event::ErabAdmitted {
                        ebi: 5,
                        transport_addr: Bytes::from_static(&[10, 0, 0, 1]),
                        teid: 0x200,
                    }],
                    failed: Vec::new(),
                },
            )))
            .unwrap();
        let mbr_seq = t
            .sink
            .take()
            .iter()
            .find_map(|(_, m)| match m {
                OutboundMessage::S11(x) if matches!(x.message, S11Message::ModifyBearerRequest(_)) => {
                    Some(x.seq)
                }
                _ => None,
            })
            .unwrap();
        t.app
            .dispatch(MmeEvent::S11(S11Event::ModifyBearerResponse(
                crate::event::ModifyBearerResponse {
                    teid: testing::mme_s11_teid(&t, ue_id),
                    seq: mbr_seq,
                    cause: GtpCause::RequestAccepted,
                    removed: Vec::new(),
                },
            )))
            .unwrap();

        let setups = t
            .sink
            .take()
            .into_iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::S1ap(S1apMessage::ERabSetupRequest { .. })))
            .count();
        assert_eq!(setups, 2);
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.pending_bearer_count(), 0);
        assert_eq!(ue.s11_proc_by_token(200).unwrap().entries[0].ebi, Some(6));
        assert_eq!(ue.s11_proc_by_token(201).unwrap().entries[0].ebi, Some(7));
    }

    #[test]
    fn test_paging_failure_rejects_queue() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000026");
        testing::make_idle(&t, ue_id);
        create_bearer(&t, ue_id, 300, 1);

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        for _ in 0..2 {
            let id = lock_ue(&ue_ref).timers.paging_response.id();
            t.app
                .on_timer(MmeTimer { id: MmeTimerId::PagingResponse, ue_id }, id)
                .unwrap();
        }
        let rsps = s11_responses(&t.sink.take());
        assert!(rsps.iter().any(|m| matches!(
            m,
            S11Message::CreateBearerResponse {
                cause: GtpCause::RequestRejected,
                ..
            }
        )));
        assert_eq!(lock_ue(&ue_ref).pending_bearer_count(), 0);
    }

    #[test]
    fn test_delete_bearer_connected_and_unknown() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000027");
        create_bearer(&t, ue_id, 400, 1);
        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerAccept { ebi: 6 });
        t.sink.take();

        let teid = testing::mme_s11_teid(&t, ue_id);
        t.app
            .dispatch(MmeEvent::S11(S11Event::DeleteBearerRequest(DeleteBearerRequest {
                teid,
                seq: 401,
                linked_ebi: None,
                ebis: vec![6, 12],
                cause: None,
            })))
            .unwrap();
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::ERabReleaseCommand { ebis, .. }) if ebis == &vec![6]
        )));
        assert!(s11_responses(&sent).is_empty());

        testing::uplink(&t, ue_id, NasUplink::DeactivateBearerAccept { ebi: 6 });
        let rsps = s11_responses(&t.sink.take());
        match &rsps[..] {
            [S11Message::DeleteBearerResponse { cause, bearers, .. }] => {
                assert_eq!(*cause, GtpCause::RequestAccepted);
                assert_eq!(bearers[0].cause, GtpCause::RequestAccepted);
                assert_eq!(bearers[1].cause, GtpCause::ContextNotFound);
            }
            other => panic!("unexpected {:?}", other),
        }
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        assert!(bearer::get_bearer_context(&lock_ue(&ue_ref), 6).is_none());
    }

    #[test]
    fn test_delete_bearer_idle_answers_at_once() {
        let t = testing::test_app();
        let ue_id = testing::attach_ue(&t, 1, "001010000000028");
        create_bearer(&t, ue_id, 500, 1);
        testing::uplink(&t, ue_id, NasUplink::ActivateDedicatedBearerAccept { ebi: 6 });
        testing::make_idle(&t, ue_id);
        t.sink.take();

        let teid = testing::mme_s11_teid(&t, ue_id);
        t.app
            .dispatch(MmeEvent::S11(S11Event::DeleteBearerRequest(DeleteBearerRequest {
                teid,
                seq: 501,
                linked_ebi: None,
                ebis: vec![6],
                cause: None,
            })))
            .unwrap();
        let sent = t.sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &s11_responses(&sent)[0],
            S11Message::DeleteBearerResponse {
                cause: GtpCause::RequestAccepted,
                ..
            }
        ));
    }
}
