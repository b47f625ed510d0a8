//! MME Application State
//!
//! Composition root: the UE context store, the timer manager, the current
//! configuration and the two outbound sinks. Every inbound event and every
//! expired timer enters through `MmeApp`, which resolves the UE and hands the
//! locked context to the procedure engines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::MmeConfig;
use crate::context::{EpsGuti, IpAddr, MmeUeS1apId, UeContext};
use crate::dedicated_bearer;
use crate::emm_attach::{self, S1Origin};
use crate::emm_common::{self, IdentityOutcome};
use crate::emm_detach;
use crate::error::{MmeError, MmeResult};
use crate::event::{
    InitialUeMessage, MmeEvent, NasUplink, S11Event, S1apEvent, S6aEvent, SgsapEvent,
    UplinkNasTransport, DIAMETER_ERROR_USER_UNKNOWN,
};
use crate::handover;
use crate::metrics::CounterSink;
use crate::path::{self, PeerSink};
use crate::s11_build::{GtpCause, S11Message};
use crate::s6a_build::S6aMessage;
use crate::session;
use crate::timer::{MmeTimer, MmeTimerHandle, MmeTimerId, MmeTimerMgr};
use crate::ue_store::{lock_ue, UeContextStore, UeRef};

// ============================================================================
// Identifier Allocation
// ============================================================================

#[derive(Debug)]
struct IdAllocator {
    m_tmsi: AtomicU32,
    s11_teid: AtomicU32,
    gtp_seq: AtomicU32,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            m_tmsi: AtomicU32::new(1),
            s11_teid: AtomicU32::new(1),
            gtp_seq: AtomicU32::new(1),
        }
    }

    fn next_nonzero(counter: &AtomicU32, mask: u32) -> u32 {
        loop {
            let value = counter.fetch_add(1, Ordering::Relaxed) & mask;
            if value != 0 {
                return value;
            }
        }
    }
}

// ============================================================================
// Call Context
// ============================================================================

/// View of the application handed to the procedure engines for one call.
/// The configuration is a single snapshot taken when the call started.
pub struct MmeCtx<'a> {
    pub store: &'a UeContextStore,
    pub timers: &'a Arc<MmeTimerMgr>,
    pub cfg: Arc<MmeConfig>,
    pub sink: &'a dyn PeerSink,
    pub metrics: &'a dyn CounterSink,
    ids: &'a IdAllocator,
}

impl MmeCtx<'_> {
    /// Start a one-shot timer with its configured duration
    pub fn start_timer(&self, id: MmeTimerId, ue_id: MmeUeS1apId) -> MmeTimerHandle {
        log::debug!("[{}] {} started", ue_id, id);
        self.timers
            .start(MmeTimer { id, ue_id }, id.duration(&self.cfg.timers))
    }

    /// Next GTPv2-C sequence number (24 bits, never 0)
    pub fn next_seq(&self) -> u32 {
        IdAllocator::next_nonzero(&self.ids.gtp_seq, 0x00ff_ffff)
    }

    pub fn alloc_s11_teid(&self) -> u32 {
        IdAllocator::next_nonzero(&self.ids.s11_teid, u32::MAX)
    }

    pub fn alloc_guti(&self) -> EpsGuti {
        EpsGuti {
            plmn_id: self.cfg.plmn_id(),
            mme_gid: self.cfg.mme_gid,
            mme_code: self.cfg.mme_code,
            m_tmsi: IdAllocator::next_nonzero(&self.ids.m_tmsi, u32::MAX),
        }
    }

    pub fn s11_addr(&self) -> IpAddr {
        IpAddr::v4(self.cfg.s11_addr)
    }

    pub fn count(&self, name: &str, labels: &[(&str, &str)]) {
        self.metrics.increment_counter(name, 1, labels);
    }
}

// ============================================================================
// MME Application
// ============================================================================

/// MME application state
pub struct MmeApp {
    store: UeContextStore,
    timers: Arc<MmeTimerMgr>,
    config: RwLock<Arc<MmeConfig>>,
    sink: Arc<dyn PeerSink>,
    metrics: Arc<dyn CounterSink>,
    ids: IdAllocator,
}

impl MmeApp {
    pub fn new(config: MmeConfig, sink: Arc<dyn PeerSink>, metrics: Arc<dyn CounterSink>) -> Self {
        Self {
            store: UeContextStore::new(),
            timers: Arc::new(MmeTimerMgr::new()),
            config: RwLock::new(Arc::new(config)),
            sink,
            metrics,
            ids: IdAllocator::new(),
        }
    }

    pub fn store(&self) -> &UeContextStore {
        &self.store
    }

    pub fn timer_mgr(&self) -> &Arc<MmeTimerMgr> {
        &self.timers
    }

    pub fn config_snapshot(&self) -> Arc<MmeConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration. Calls already running keep their snapshot.
    pub fn set_config(&self, config: MmeConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    pub(crate) fn ctx(&self) -> MmeCtx<'_> {
        MmeCtx {
            store: &self.store,
            timers: &self.timers,
            cfg: self.config_snapshot(),
            sink: self.sink.as_ref(),
            metrics: self.metrics.as_ref(),
            ids: &self.ids,
        }
    }

    /// Handle one inbound event
    pub fn dispatch(&self, event: MmeEvent) -> MmeResult<()> {
        log::trace!("{}", event.name());
        let ctx = self.ctx();
        match event {
            MmeEvent::S1ap(ev) => handle_s1ap(&ctx, ev),
            MmeEvent::S11(ev) => handle_s11(&ctx, ev),
            MmeEvent::S6a(ev) => handle_s6a(&ctx, ev),
            MmeEvent::Sgsap(ev) => handle_sgsap(&ctx, ev),
            MmeEvent::OperatorDetach { imsi } => {
                with_imsi(&ctx, &imsi, |ue| emm_detach::start_network_detach(&ctx, ue))
            }
        }
    }

    /// Dispatch every expired timer. Returns the number processed.
    pub fn process_timers(&self) -> usize {
        let expired = self.timers.process_expired();
        let count = expired.len();
        for entry in expired {
            if let Err(e) = self.on_timer(entry.kind, entry.id) {
                log::error!("[{}] {} handling failed: {}", entry.kind.ue_id, entry.kind.id, e);
            }
        }
        count
    }

    /// Handle one fired timer
    pub fn on_timer(&self, timer: MmeTimer, handle_id: u64) -> MmeResult<()> {
        let ctx = self.ctx();
        let ue_ref = match self.store.lookup_by_local_ref(timer.ue_id) {
            Some(ue_ref) => ue_ref,
            None => {
                log::info!("[{}] {} expired for a removed UE, ignored", timer.ue_id, timer.id);
                return Ok(());
            }
        };
        let mut ue = lock_ue(&ue_ref);
        log::debug!("[{}] {} expired", timer.ue_id, timer.id);

        match timer.id {
            MmeTimerId::T3450 => emm_attach::handle_t3450_expiry(&ctx, &mut ue, handle_id),
            MmeTimerId::T3460 | MmeTimerId::T3470 => {
                emm_common::handle_common_timer_expiry(&ctx, &mut ue, timer.id, handle_id)
            }
            MmeTimerId::T3422 => emm_detach::handle_t3422_expiry(&ctx, &mut ue, handle_id),
            MmeTimerId::S11BearerGuard => {
                dedicated_bearer::handle_guard_expiry(&ctx, &mut ue, handle_id)
            }
            MmeTimerId::PagingResponse => session::handle_paging_expiry(&ctx, &mut ue, handle_id),
            MmeTimerId::IcsResponse => session::handle_ics_expiry(&ctx, &mut ue, handle_id),
            MmeTimerId::MobileReachable => {
                session::handle_mobile_reachable_expiry(&ctx, &mut ue, handle_id)
            }
            MmeTimerId::ImplicitDetach => {
                session::handle_implicit_detach_expiry(&ctx, &mut ue, handle_id)
            }
        }
    }

    /// Implicitly detach every UE
    pub fn shutdown(&self) {
        let ctx = self.ctx();
        let ids = self.store.iter_ids();
        log::info!("Detaching {} UE(s)", ids.len());
        for id in ids {
            if let Some(ue_ref) = self.store.lookup_by_local_ref(id) {
                let mut ue = lock_ue(&ue_ref);
                emm_detach::implicit_detach(&ctx, &mut ue);
            }
        }
        self.timers.clear();
    }
}

impl std::fmt::Debug for MmeApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmeApp")
            .field("ues", &self.store.len())
            .field("timers", &self.timers.count())
            .finish()
    }
}

// ============================================================================
// Context Resolution
// ============================================================================

fn not_found(what: String) -> MmeError {
    log::warn!("No UE context for {}", what);
    MmeError::ContextNotFound(what)
}

fn with_ue<F>(ctx: &MmeCtx<'_>, id: MmeUeS1apId, f: F) -> MmeResult<()>
where
    F: FnOnce(&mut UeContext) -> MmeResult<()>,
{
    let ue_ref = ctx
        .store
        .lookup_by_local_ref(id)
        .ok_or_else(|| not_found(format!("mme_ue_s1ap_id {}", id)))?;
    let mut ue = lock_ue(&ue_ref);
    f(&mut ue)
}

fn with_tunnel<F>(ctx: &MmeCtx<'_>, teid: u32, f: F) -> MmeResult<()>
where
    F: FnOnce(&mut UeContext) -> MmeResult<()>,
{
    let ue_ref = ctx
        .store
        .lookup_by_tunnel_id(teid)
        .ok_or_else(|| not_found(format!("s11 teid {:#x}", teid)))?;
    let mut ue = lock_ue(&ue_ref);
    f(&mut ue)
}

fn with_imsi<F>(ctx: &MmeCtx<'_>, imsi: &str, f: F) -> MmeResult<()>
where
    F: FnOnce(&mut UeContext) -> MmeResult<()>,
{
    let ue_ref = ctx
        .store
        .lookup_by_subscriber_id(imsi)
        .ok_or_else(|| not_found(format!("imsi {}", imsi)))?;
    let mut ue = lock_ue(&ue_ref);
    f(&mut ue)
}

// ============================================================================
// S1AP
// ============================================================================

fn handle_s1ap(ctx: &MmeCtx<'_>, ev: S1apEvent) -> MmeResult<()> {
    match ev {
        S1apEvent::InitialUeMessage(msg) => handle_initial_ue_message(ctx, msg),
        S1apEvent::UplinkNasTransport(msg) => handle_uplink_nas_transport(ctx, msg),
        S1apEvent::InitialContextSetupResponse(rsp) => with_ue(ctx, rsp.mme_ue_s1ap_id, |ue| {
            session::handle_ics_response(ctx, ue, &rsp)
        }),
        S1apEvent::InitialContextSetupFailure { mme_ue_s1ap_id, cause } => {
            with_ue(ctx, mme_ue_s1ap_id, |ue| session::handle_ics_failure(ctx, ue, cause))
        }
        S1apEvent::UeContextReleaseRequest { mme_ue_s1ap_id, cause } => {
            with_ue(ctx, mme_ue_s1ap_id, |ue| {
                session::handle_ue_context_release_request(ctx, ue, cause)
            })
        }
        S1apEvent::UeContextReleaseComplete { mme_ue_s1ap_id } => {
            match ctx.store.lookup_by_local_ref(mme_ue_s1ap_id) {
                Some(ue_ref) => {
                    let mut ue = lock_ue(&ue_ref);
                    session::handle_ue_context_release_complete(ctx, &mut ue)
                }
                None => {
                    log::debug!("[{}] Release complete for a removed UE", mme_ue_s1ap_id);
                    Ok(())
                }
            }
        }
        S1apEvent::HandoverRequired(req) => with_ue(ctx, req.mme_ue_s1ap_id, |ue| {
            handover::handle_handover_required(ctx, ue, &req)
        }),
        S1apEvent::HandoverRequestAcknowledge(ack) => with_ue(ctx, ack.mme_ue_s1ap_id, |ue| {
            handover::handle_handover_request_ack(ctx, ue, &ack)
        }),
        S1apEvent::HandoverFailure { mme_ue_s1ap_id, cause } => {
            with_ue(ctx, mme_ue_s1ap_id, |ue| handover::handle_handover_failure(ctx, ue, cause))
        }
        S1apEvent::HandoverNotify(notify) => with_ue(ctx, notify.mme_ue_s1ap_id, |ue| {
            handover::handle_handover_notify(ctx, ue, &notify)
        }),
        S1apEvent::HandoverCancel { mme_ue_s1ap_id, cause } => {
            with_ue(ctx, mme_ue_s1ap_id, |ue| handover::handle_handover_cancel(ctx, ue, cause))
        }
        S1apEvent::PathSwitchRequest(req) => with_ue(ctx, req.source_mme_ue_s1ap_id, |ue| {
            handover::handle_path_switch_request(ctx, ue, &req)
        }),
        S1apEvent::ERabModificationIndication { mme_ue_s1ap_id, modified } => {
            with_ue(ctx, mme_ue_s1ap_id, |ue| {
                handover::handle_erab_modification_indication(ctx, ue, &modified)
            })
        }
    }
}

fn handle_initial_ue_message(ctx: &MmeCtx<'_>, msg: InitialUeMessage) -> MmeResult<()> {
    let InitialUeMessage {
        enb_ue_key,
        sctp_assoc_id,
        tai,
        ecgi,
        guti,
        nas,
    } = msg;
    let origin = S1Origin {
        enb_ue_key,
        sctp_assoc_id,
        tai,
        ecgi,
    };

    match nas.message {
        NasUplink::AttachRequest(req) => {
            emm_attach::handle_attach_request(ctx, origin, req, nas.integrity_ok)
        }
        NasUplink::ServiceRequest { .. } => session::handle_service_request(ctx, origin, guti),
        NasUplink::DetachRequest { switch_off } => {
            let ue_ref = guti
                .and_then(|g| ctx.store.lookup_by_temporary_id(&g))
                .ok_or_else(|| not_found(format!("{} on detach", enb_ue_key)))?;
            let mut ue = lock_ue(&ue_ref);
            session::attach_s1_connection(ctx, &mut ue, &origin)?;
            emm_detach::handle_detach_request(ctx, &mut ue, switch_off)
        }
        other => {
            log::warn!("[{}] Unexpected {} in Initial UE Message", enb_ue_key, other.name());
            Ok(())
        }
    }
}

fn handle_uplink_nas_transport(ctx: &MmeCtx<'_>, msg: UplinkNasTransport) -> MmeResult<()> {
    let UplinkNasTransport {
        mme_ue_s1ap_id,
        enb_ue_key,
        nas,
    } = msg;
    let ue_ref = ctx
        .store
        .lookup_by_local_ref(mme_ue_s1ap_id)
        .ok_or_else(|| not_found(format!("mme_ue_s1ap_id {}", mme_ue_s1ap_id)))?;

    let message = match nas.message {
        NasUplink::AttachRequest(req) => {
            let origin = {
                let ue = lock_ue(&ue_ref);
                S1Origin {
                    enb_ue_key,
                    sctp_assoc_id: ue.sctp_assoc_id,
                    tai: ue.tai,
                    ecgi: ue.ecgi,
                }
            };
            return emm_attach::handle_attach_request(ctx, origin, req, nas.integrity_ok);
        }
        message => message,
    };

    let outcome = {
        let mut ue = lock_ue(&ue_ref);
        handle_nas(ctx, &mut ue, message)?
    };
    match outcome {
        IdentityOutcome::Continue => Ok(()),
        IdentityOutcome::ImsiConflict(imsi) => resolve_imsi_conflict(ctx, &ue_ref, imsi),
    }
}

fn handle_nas(
    ctx: &MmeCtx<'_>,
    ue: &mut UeContext,
    message: NasUplink,
) -> MmeResult<IdentityOutcome> {
    log::debug!("[{}] {}", ue.mme_ue_s1ap_id, message.name());
    match message {
        NasUplink::IdentityResponse(rsp) => {
            return emm_common::handle_identity_response(ctx, ue, rsp);
        }
        NasUplink::AttachComplete => emm_attach::handle_attach_complete(ctx, ue)?,
        NasUplink::AuthenticationResponse { res } => {
            emm_common::handle_authentication_response(ctx, ue, &res)?
        }
        NasUplink::AuthenticationFailure { cause } => {
            emm_common::handle_authentication_failure(ctx, ue, cause)?
        }
        NasUplink::SecurityModeComplete { imeisv } => {
            emm_common::handle_security_mode_complete(ctx, ue, imeisv)?
        }
        NasUplink::SecurityModeReject { cause } => {
            emm_common::handle_security_mode_reject(ctx, ue, cause)?
        }
        NasUplink::DetachRequest { switch_off } => {
            emm_detach::handle_detach_request(ctx, ue, switch_off)?
        }
        NasUplink::DetachAccept => emm_detach::handle_detach_accept(ctx, ue)?,
        NasUplink::ActivateDedicatedBearerAccept { ebi } => {
            dedicated_bearer::handle_activate_accept(ctx, ue, ebi)?
        }
        NasUplink::ActivateDedicatedBearerReject { ebi } => {
            dedicated_bearer::handle_activate_reject(ctx, ue, ebi)?
        }
        NasUplink::DeactivateBearerAccept { ebi } => {
            dedicated_bearer::handle_deactivate_accept(ctx, ue, ebi)?
        }
        other @ (NasUplink::AttachRequest(_) | NasUplink::ServiceRequest { .. }) => {
            log::warn!("[{}] Unexpected {} in uplink NAS", ue.mme_ue_s1ap_id, other.name());
        }
    }
    Ok(IdentityOutcome::Continue)
}

/// The identified IMSI belongs to another context: detach that one first,
/// then continue the attach on the context that asked. The two contexts are
/// never locked together.
fn resolve_imsi_conflict(ctx: &MmeCtx<'_>, ue_ref: &UeRef, imsi: String) -> MmeResult<()> {
    if let Some(old_ref) = ctx.store.lookup_by_subscriber_id(&imsi) {
        if !Arc::ptr_eq(&old_ref, ue_ref) {
            let mut old = lock_ue(&old_ref);
            log::info!(
                "[{}] IMSI {} re-attaching on a new context, detaching the old one",
                old.mme_ue_s1ap_id,
                imsi
            );
            emm_detach::implicit_detach(ctx, &mut old);
        }
    }
    let mut ue = lock_ue(ue_ref);
    emm_common::resume_imsi_identification(ctx, &mut ue, imsi)
}

// ============================================================================
// S11
// ============================================================================

fn handle_s11(ctx: &MmeCtx<'_>, ev: S11Event) -> MmeResult<()> {
    match ev {
        S11Event::CreateSessionResponse(rsp) => with_tunnel(ctx, rsp.teid, |ue| {
            session::handle_create_session_response(ctx, ue, &rsp)
        }),
        S11Event::ModifyBearerResponse(rsp) => with_tunnel(ctx, rsp.teid, |ue| {
            session::handle_modify_bearer_response(ctx, ue, &rsp)
        }),
        S11Event::DeleteSessionResponse { teid, seq, cause } => {
            match ctx.store.lookup_by_tunnel_id(teid) {
                Some(ue_ref) => {
                    let mut ue = lock_ue(&ue_ref);
                    emm_detach::handle_delete_session_response(ctx, &mut ue, seq, cause)
                }
                None => {
                    log::debug!("Delete Session Response for removed UE (teid {:#x})", teid);
                    Ok(())
                }
            }
        }
        S11Event::CreateBearerRequest(req) => {
            let teid = req.teid;
            with_tunnel(ctx, teid, |ue| {
                dedicated_bearer::handle_create_bearer_request(ctx, ue, req)
            })
        }
        S11Event::DeleteBearerRequest(req) => match ctx.store.lookup_by_tunnel_id(req.teid) {
            Some(ue_ref) => {
                let mut ue = lock_ue(&ue_ref);
                dedicated_bearer::handle_delete_bearer_request(ctx, &mut ue, &req)
            }
            None => {
                log::warn!("Delete Bearer Request for unknown teid {:#x}", req.teid);
                let rsp = S11Message::DeleteBearerResponse {
                    sgw_s11_teid: 0,
                    cause: GtpCause::ContextNotFound,
                    bearers: Vec::new(),
                };
                path::send_to_spgw(ctx.sink, req.seq, rsp)
            }
        },
        S11Event::ReleaseAccessBearersResponse { teid, cause } => with_tunnel(ctx, teid, |ue| {
            session::handle_release_access_bearers_response(ctx, ue, cause)
        }),
        S11Event::DownlinkDataNotification { teid, seq, ebi } => {
            match ctx.store.lookup_by_tunnel_id(teid) {
                Some(ue_ref) => {
                    let mut ue = lock_ue(&ue_ref);
                    session::handle_downlink_data_notification(ctx, &mut ue, seq, ebi)
                }
                None => {
                    log::warn!("Downlink Data Notification for unknown teid {:#x}", teid);
                    let ack = S11Message::DownlinkDataNotificationAck {
                        sgw_s11_teid: 0,
                        cause: GtpCause::ContextNotFound,
                    };
                    path::send_to_spgw(ctx.sink, seq, ack)
                }
            }
        }
    }
}

// ============================================================================
// S6a / SGsAP
// ============================================================================

fn handle_s6a(ctx: &MmeCtx<'_>, ev: S6aEvent) -> MmeResult<()> {
    match ev {
        S6aEvent::AuthenticationInformationAnswer { imsi, result } => with_imsi(ctx, &imsi, |ue| {
            emm_common::handle_authentication_info_answer(ctx, ue, result)
        }),
        S6aEvent::UpdateLocationAnswer { imsi, result } => with_imsi(ctx, &imsi, |ue| {
            emm_attach::handle_update_location_answer(ctx, ue, result)
        }),
        S6aEvent::CancelLocationRequest { imsi } => match ctx.store.lookup_by_subscriber_id(&imsi) {
            Some(ue_ref) => {
                let mut ue = lock_ue(&ue_ref);
                emm_detach::handle_cancel_location_request(ctx, &mut ue)
            }
            None => {
                log::warn!("Cancel-Location-Request for unknown IMSI {}", imsi);
                path::send_to_hss(
                    ctx.sink,
                    S6aMessage::CancelLocationAnswer {
                        imsi,
                        result_code: DIAMETER_ERROR_USER_UNKNOWN,
                    },
                )
            }
        },
    }
}

fn handle_sgsap(ctx: &MmeCtx<'_>, ev: SgsapEvent) -> MmeResult<()> {
    match ev {
        SgsapEvent::LocationUpdateAccept { imsi } => {
            with_imsi(ctx, &imsi, |ue| emm_attach::handle_sgs_location_update_accept(ue))
        }
        SgsapEvent::LocationUpdateReject { imsi, cause } => with_imsi(ctx, &imsi, |ue| {
            emm_attach::handle_sgs_location_update_reject(ue, cause)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer;
    use crate::context::{EnbUeKey, MobilityState, SubscriptionData};
    use crate::event::{
        AttachRequest, BearerContextCreated, DeleteBearerRequest, IdentityResponse, MobileIdentity,
        NasPdu, NasUplink,
    };
    use crate::metrics::names;
    use crate::nas_build::{EmmCause, EsmCause, EsmMessage, NasMessage};
    use crate::path::{OutboundMessage, PeerTask};
    use crate::procedure::AttachState;
    use crate::s1ap_build::S1apMessage;
    use crate::testing::*;

    fn attach_proc_t3450(t: &TestApp, ue_id: MmeUeS1apId) -> (bool, u64) {
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        let attach = ue.attach_proc().unwrap();
        (attach.t3450.is_active(), attach.t3450.id())
    }

    fn accept_sent(t: &TestApp, ue_id: MmeUeS1apId) {
        let teid = mme_s11_teid(t, ue_id);
        let seq = {
            let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
            let ue = lock_ue(&ue_ref);
            let cid = ue.attach_proc().and_then(|a| a.default_pdn).unwrap();
            bearer::pdn_context(&ue, cid).and_then(|p| p.xact).unwrap()
        };
        t.app
            .dispatch(MmeEvent::S11(S11Event::CreateSessionResponse(create_session_response(
                teid, seq, 5,
            ))))
            .unwrap();
    }

    #[test]
    fn test_fresh_imsi_goes_straight_to_authentication() {
        let t = test_app();
        initial_attach(&t, enb_key(1), attach_request("001010000000001"));

        let sent = t.sink.take();
        assert!(sent.iter().any(|(dest, m)| *dest == PeerTask::S6a
            && matches!(m, OutboundMessage::S6a(S6aMessage::AuthenticationInformationRequest { .. }))));
        assert!(!sent
            .iter()
            .any(|(_, m)| matches!(nas_of(m), Some(NasMessage::IdentityRequest { .. }))));
    }

    #[test]
    fn test_attach_accept_waits_for_attach_complete() {
        let t = test_app();
        let (ue_id, _) = attach_to_create_session(&t, 1, "001010000000001");
        accept_sent(&t, ue_id);

        let sent = t.sink.take();
        let ics_nas = sent.iter().find_map(|(_, m)| match m {
            OutboundMessage::S1ap(S1apMessage::InitialContextSetupRequest { nas, .. }) => nas.clone(),
            _ => None,
        });
        assert!(matches!(ics_nas, Some(NasMessage::AttachAccept { .. })));
        assert!(attach_proc_t3450(&t, ue_id).0);
        {
            let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
            let ue = lock_ue(&ue_ref);
            assert_eq!(ue.mobility_state, MobilityState::Unregistered);
            assert!(ue.guti.is_some());
        }

        uplink(&t, ue_id, NasUplink::AttachComplete);
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.mobility_state, MobilityState::Registered);
        assert!(ue.attach_proc().is_none());
        assert_eq!(
            t.metrics.get(names::UE_ATTACH, &[("result", "attach_proc_successful")]),
            1
        );
    }

    #[test]
    fn test_attach_complete_without_t3450_discarded() {
        let t = test_app();
        let (ue_id, _) = attach_to_create_session(&t, 1, "001010000000001");
        accept_sent(&t, ue_id);
        {
            let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
            let mut ue = lock_ue(&ue_ref);
            ue.attach_proc_mut().unwrap().t3450.stop();
        }

        uplink(&t, ue_id, NasUplink::AttachComplete);
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.mobility_state, MobilityState::Unregistered);
        assert!(ue.attach_proc().is_some());
        assert_eq!(t.metrics.total(names::UE_ATTACH), 0);
    }

    #[test]
    fn test_create_session_installs_accepted_bearers_only() {
        let t = test_app();
        let (ue_id, seq) = attach_to_create_session(&t, 1, "001010000000001");
        let teid = mme_s11_teid(&t, ue_id);
        let mut rsp = create_session_response(teid, seq, 5);
        let mut rejected: BearerContextCreated = rsp.bearers[0].clone();
        rejected.ebi = 6;
        rejected.cause = GtpCause::ContextNotFound;
        rsp.bearers.push(rejected);

        t.app
            .dispatch(MmeEvent::S11(S11Event::CreateSessionResponse(rsp)))
            .unwrap();

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert!(bearer::get_bearer_context(&ue, 5).is_some());
        assert!(bearer::get_bearer_context(&ue, 6).is_none());
        assert!(ue.attach_proc().unwrap().accept_sent());
    }

    #[test]
    fn test_create_session_over_bearer_ceiling_rejects_attach() {
        let t = test_app();
        let (ue_id, seq) = attach_to_create_session(&t, 1, "001010000000001");
        let teid = mme_s11_teid(&t, ue_id);
        let mut rsp = create_session_response(teid, seq, 5);
        let template = rsp.bearers[0].clone();
        rsp.bearers.extend((6..=16).map(|ebi| BearerContextCreated {
            ebi,
            ..template.clone()
        }));

        t.app
            .dispatch(MmeEvent::S11(S11Event::CreateSessionResponse(rsp)))
            .unwrap();

        let sent = t.sink.take();
        let reject = sent.iter().find_map(|(_, m)| nas_of(m)).cloned();
        match reject {
            Some(NasMessage::AttachReject { cause, esm }) => {
                assert_eq!(cause, EmmCause::EsmFailure);
                assert!(matches!(
                    esm,
                    Some(EsmMessage::PdnConnectivityReject { cause: EsmCause::InsufficientResources, .. })
                ));
            }
            other => panic!("expected attach reject, got {:?}", other),
        }
        assert!(!sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::InitialContextSetupRequest { .. })
        )));
        if let Some(ue_ref) = t.app.store().lookup_by_local_ref(ue_id) {
            let ue = lock_ue(&ue_ref);
            assert_eq!(bearer::active_bearer_count(&ue), 0);
        }
    }

    #[test]
    fn test_duplicate_attach_after_accept_retransmits() {
        let t = test_app();
        let imsi = "001010000000001";
        let (ue_id, _) = attach_to_create_session(&t, 1, imsi);
        accept_sent(&t, ue_id);
        t.sink.take();

        t.app
            .dispatch(MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessage {
                enb_ue_key: enb_key(2),
                sctp_assoc_id: 1,
                tai: Default::default(),
                ecgi: Default::default(),
                guti: None,
                nas: crate::event::NasPdu::plain(NasUplink::AttachRequest(attach_request(imsi))),
            })))
            .unwrap();

        let sent = t.sink.take();
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(nas_of(m), Some(NasMessage::AttachAccept { .. }))));
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::UeContextReleaseCommand { ids, .. })
                if ids.enb_ue_key == enb_key(2)
        )));
        assert_eq!(t.app.store().len(), 1);
        assert!(t.app.store().lookup_by_enb_ue_key(&enb_key(2)).is_none());
        assert!(attach_proc_t3450(&t, ue_id).0);
    }

    fn attach_on(t: &TestApp, key: EnbUeKey, req: AttachRequest, integrity_ok: bool) {
        let nas = if integrity_ok {
            NasPdu::protected(NasUplink::AttachRequest(req))
        } else {
            NasPdu::plain(NasUplink::AttachRequest(req))
        };
        t.app
            .dispatch(MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessage {
                enb_ue_key: key,
                sctp_assoc_id: key.enb_id,
                tai: Default::default(),
                ecgi: Default::default(),
                guti: None,
                nas,
            })))
            .unwrap();
    }

    fn air_sent(sent: &[(PeerTask, OutboundMessage)]) -> bool {
        sent.iter().any(|(_, m)| {
            matches!(m, OutboundMessage::S6a(S6aMessage::AuthenticationInformationRequest { .. }))
        })
    }

    #[test]
    fn test_duplicate_attach_in_progress_discarded() {
        let t = test_app();
        let imsi = "001010000000001";
        let (ue_id, _) = attach_to_create_session(&t, 1, imsi);

        attach_on(&t, enb_key(2), attach_request(imsi), false);

        let sent = t.sink.take();
        assert!(!sent.iter().any(|(_, m)| nas_of(m).is_some()));
        assert!(!air_sent(&sent));
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::UeContextReleaseCommand { ids, .. })
                if ids.enb_ue_key == enb_key(2)
        )));
        assert_eq!(t.app.store().len(), 1);
        assert!(t.app.store().lookup_by_enb_ue_key(&enb_key(2)).is_none());

        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.enb_ue_key, Some(enb_key(1)));
        assert_eq!(ue.attach_proc().unwrap().state, AttachState::CreateSession);
    }

    #[test]
    fn test_changed_attach_inherits_security_with_integrity() {
        let t = test_app();
        let imsi = "001010000000001";
        let (old_id, _) = attach_to_create_session(&t, 1, imsi);
        let changed = AttachRequest {
            ksi: 3,
            ..attach_request(imsi)
        };

        attach_on(&t, enb_key(2), changed, true);

        let sent = t.sink.take();
        assert!(t.app.store().lookup_by_local_ref(old_id).is_none());
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::UeContextReleaseCommand { ids, .. })
                if ids.enb_ue_key == enb_key(1)
        )));
        assert!(!air_sent(&sent));
        assert_eq!(t.app.store().len(), 1);

        let ue_ref = t.app.store().lookup_by_enb_ue_key(&enb_key(2)).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_ne!(ue.mme_ue_s1ap_id, old_id);
        assert!(ue.security.valid);
        assert_eq!(ue.attach_proc().unwrap().request.ksi, 3);
    }

    #[test]
    fn test_changed_attach_without_integrity_reauthenticates() {
        let t = test_app();
        let imsi = "001010000000001";
        let (old_id, _) = attach_to_create_session(&t, 1, imsi);
        let changed = AttachRequest {
            ksi: 3,
            ..attach_request(imsi)
        };

        attach_on(&t, enb_key(2), changed, false);

        let sent = t.sink.take();
        assert!(t.app.store().lookup_by_local_ref(old_id).is_none());
        assert!(air_sent(&sent));
        assert_eq!(t.app.store().len(), 1);

        let ue_ref = t.app.store().lookup_by_enb_ue_key(&enb_key(2)).unwrap();
        let ue = lock_ue(&ue_ref);
        assert!(!ue.security.valid);
        assert_eq!(ue.attach_proc().unwrap().state, AttachState::Authentication);
    }

    #[test]
    fn test_unknown_guti_identified_as_attached_imsi() {
        let t = test_app();
        let imsi = "001010000000001";
        let old_id = attach_ue(&t, 1, imsi);
        t.sink.take();

        let foreign = EpsGuti {
            m_tmsi: 0xdead,
            ..Default::default()
        };
        let req = AttachRequest {
            identity: MobileIdentity::Guti(foreign),
            ..attach_request(imsi)
        };
        let new_id = initial_attach(&t, enb_key(2), req);
        assert_ne!(new_id, old_id);
        let sent = t.sink.take();
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(nas_of(m), Some(NasMessage::IdentityRequest { .. }))));
        assert!(!air_sent(&sent));
        assert_eq!(t.app.store().len(), 2);

        uplink(&t, new_id, NasUplink::IdentityResponse(IdentityResponse::Imsi(imsi.to_string())));

        let sent = t.sink.take();
        assert!(t.app.store().lookup_by_local_ref(old_id).is_none());
        assert_eq!(t.app.store().len(), 1);
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S1ap(S1apMessage::UeContextReleaseCommand { ids, .. })
                if ids.enb_ue_key == enb_key(1)
        )));
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            OutboundMessage::S11(x) if matches!(x.message, S11Message::DeleteSessionRequest { .. })
        )));
        assert!(air_sent(&sent));

        let ue_ref = t.app.store().lookup_by_subscriber_id(imsi).unwrap();
        let ue = lock_ue(&ue_ref);
        assert_eq!(ue.mme_ue_s1ap_id, new_id);
        assert!(ue.unknown_guti);
        assert_eq!(ue.attach_proc().unwrap().state, AttachState::Authentication);
        assert_eq!(t.metrics.total(names::IMPLICIT_DETACH), 1);
    }

    #[test]
    fn test_attach_rejected_on_congestion() {
        let t = test_app_with(MmeConfig {
            max_ue: 1,
            ..Default::default()
        });
        attach_ue(&t, 1, "001010000000001");
        t.sink.take();

        let result = t.app.dispatch(MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessage {
            enb_ue_key: enb_key(2),
            sctp_assoc_id: 1,
            tai: Default::default(),
            ecgi: Default::default(),
            guti: None,
            nas: crate::event::NasPdu::plain(NasUplink::AttachRequest(attach_request(
                "001010000000002",
            ))),
        })));

        assert!(matches!(result, Err(MmeError::Congestion(1))));
        let sent = t.sink.take();
        assert!(sent.iter().any(|(_, m)| matches!(
            nas_of(m),
            Some(NasMessage::AttachReject { cause: EmmCause::Congestion, .. })
        )));
        assert_eq!(t.app.store().len(), 1);
        assert_eq!(
            t.metrics.get(names::NAS_ATTACH_REJECT, &[("cause", EmmCause::Congestion.label())]),
            1
        );
    }

    #[test]
    fn test_unsubscribed_apn_rejects_attach() {
        let t = test_app();
        let imsi = "001010000000001";
        let ue_id = initial_attach(&t, enb_key(1), attach_request(imsi));
        authenticate(&t, ue_id, imsi);
        uplink(&t, ue_id, NasUplink::SecurityModeComplete { imeisv: None });
        t.sink.take();

        t.app
            .dispatch(MmeEvent::S6a(S6aEvent::UpdateLocationAnswer {
                imsi: imsi.to_string(),
                result: Ok(SubscriptionData {
                    apns: vec!["ims".to_string()],
                    ..Default::default()
                }),
            }))
            .unwrap();

        let sent = t.sink.take();
        let reject = sent.iter().find_map(|(_, m)| nas_of(m)).cloned();
        match reject {
            Some(NasMessage::AttachReject { cause, esm }) => {
                assert_eq!(cause, EmmCause::EsmFailure);
                assert!(matches!(
                    esm,
                    Some(EsmMessage::PdnConnectivityReject { cause: EsmCause::MissingOrUnknownApn, .. })
                ));
            }
            other => panic!("expected attach reject, got {:?}", other),
        }
        assert!(t.app.store().is_empty());
    }

    #[test]
    fn test_t3450_retransmits_then_aborts() {
        let t = test_app();
        let (ue_id, _) = attach_to_create_session(&t, 1, "001010000000001");
        accept_sent(&t, ue_id);
        t.sink.take();

        let timer = MmeTimer { id: MmeTimerId::T3450, ue_id };
        for _ in 1..crate::context::ATTACH_COUNTER_MAX {
            let (_, id) = attach_proc_t3450(&t, ue_id);
            t.app.on_timer(timer, id).unwrap();
            let sent = t.sink.take();
            assert!(sent
                .iter()
                .any(|(_, m)| matches!(nas_of(m), Some(NasMessage::AttachAccept { .. }))));
        }

        let (_, id) = attach_proc_t3450(&t, ue_id);
        t.app.on_timer(timer, id).unwrap();
        assert!(t.app.store().lookup_by_local_ref(ue_id).is_none());
        assert_eq!(
            t.metrics.get(names::UE_ATTACH, &[("result", "attach_proc_failure")]),
            1
        );
    }

    #[test]
    fn test_stale_timer_ignored() {
        let t = test_app();
        let (ue_id, _) = attach_to_create_session(&t, 1, "001010000000001");
        accept_sent(&t, ue_id);
        let (_, id) = attach_proc_t3450(&t, ue_id);
        t.sink.take();

        let timer = MmeTimer { id: MmeTimerId::T3450, ue_id };
        t.app.on_timer(timer, id + 1000).unwrap();
        assert!(t.sink.take().is_empty());
        assert!(attach_proc_t3450(&t, ue_id).0);
    }

    #[test]
    fn test_timer_after_removal_is_noop() {
        let t = test_app();
        let (ue_id, _) = attach_to_create_session(&t, 1, "001010000000001");
        accept_sent(&t, ue_id);
        let (_, id) = attach_proc_t3450(&t, ue_id);
        with_ctx(&t, |ctx| {
            let ue_ref = ctx.store.lookup_by_local_ref(ue_id).unwrap();
            let mut ue = lock_ue(&ue_ref);
            emm_detach::implicit_detach(ctx, &mut ue);
        });
        t.sink.take();

        let timer = MmeTimer { id: MmeTimerId::T3450, ue_id };
        t.app.on_timer(timer, id).unwrap();
        assert!(t.sink.take().is_empty());
        assert!(t.app.store().is_empty());
    }

    #[test]
    fn test_delete_bearer_for_unknown_teid_answered() {
        let t = test_app();
        t.app
            .dispatch(MmeEvent::S11(S11Event::DeleteBearerRequest(DeleteBearerRequest {
                teid: 0xdead,
                seq: 42,
                linked_ebi: None,
                ebis: vec![6],
                cause: None,
            })))
            .unwrap();

        let sent = t.sink.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (PeerTask::Spgw, OutboundMessage::S11(x)) => {
                assert_eq!(x.seq, 42);
                assert!(matches!(
                    x.message,
                    S11Message::DeleteBearerResponse { cause: GtpCause::ContextNotFound, .. }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_ue_reported() {
        let t = test_app();
        let result = t.app.dispatch(MmeEvent::S1ap(S1apEvent::UeContextReleaseRequest {
            mme_ue_s1ap_id: 77,
            cause: crate::s1ap_build::S1apCause::new(
                crate::s1ap_build::S1apCauseGroup::RadioNetwork,
                crate::s1ap_build::radio_network_cause::USER_INACTIVITY,
            ),
        }));
        assert!(matches!(result, Err(MmeError::ContextNotFound(_))));
    }

    #[test]
    fn test_shutdown_detaches_everyone() {
        let t = test_app();
        attach_ue(&t, 1, "001010000000001");
        attach_ue(&t, 2, "001010000000002");
        assert_eq!(t.app.store().len(), 2);

        t.app.shutdown();
        assert!(t.app.store().is_empty());
        assert_eq!(t.app.timer_mgr().count(), 0);
        assert_eq!(t.metrics.total(names::IMPLICIT_DETACH), 2);
    }
}
