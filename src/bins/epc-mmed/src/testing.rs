//! Shared fixtures for the engine tests: a recording peer sink and helpers
//! driving a UE through the common procedures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::app::{MmeApp, MmeCtx};
use crate::config::MmeConfig;
use crate::context::{
    AuthVector, Ebi, EnbUeKey, EpsGuti, Fteid, FteidInterface, IpAddr, MmeUeS1apId,
    SubscriptionData, UeNetworkCapability,
};
use crate::emm_attach::S1Origin;
use crate::event::{
    AttachRequest, BearerContextCreated, CreateSessionResponse, ErabAdmitted,
    InitialContextSetupResponse, InitialUeMessage, MmeEvent, MobileIdentity, ModifyBearerResponse,
    NasPdu, NasUplink, S11Event, S1apEvent, S6aEvent, UplinkNasTransport,
};
use crate::metrics::MetricsRegistry;
use crate::nas_build::NasMessage;
use crate::path::{MessageTicket, OutboundMessage, PeerSink, PeerTask};
use crate::s11_build::{GtpCause, S11Message};
use crate::s1ap_build::S1apMessage;
use crate::ue_store::lock_ue;

// ============================================================================
// Recording Sink
// ============================================================================

/// Peer sink that keeps every message handed to it
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(PeerTask, OutboundMessage)>>,
    fail: AtomicBool,
    next_id: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded messages
    pub fn take(&self) -> Vec<(PeerTask, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make every subsequent allocation fail
    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PeerSink for RecordingSink {
    fn allocate(&self, dest: PeerTask, _kind: &'static str) -> Option<MessageTicket> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        Some(MessageTicket {
            dest,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn send_to_peer(&self, ticket: MessageTicket, msg: OutboundMessage) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ticket.dest, msg));
    }
}

// ============================================================================
// Test Application
// ============================================================================

pub struct TestApp {
    pub app: MmeApp,
    pub sink: Arc<RecordingSink>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn test_app_with(config: MmeConfig) -> TestApp {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let app = MmeApp::new(config, sink.clone(), metrics.clone());
    TestApp { app, sink, metrics }
}

pub fn test_app() -> TestApp {
    test_app_with(MmeConfig::default())
}

/// Run `f` with an engine context borrowed from the app
pub fn with_ctx<R>(t: &TestApp, f: impl FnOnce(&MmeCtx<'_>) -> R) -> R {
    let ctx = t.app.ctx();
    f(&ctx)
}

pub fn enb_key(n: u32) -> EnbUeKey {
    EnbUeKey::new(1, n)
}

pub fn origin(key: EnbUeKey) -> S1Origin {
    S1Origin {
        enb_ue_key: key,
        sctp_assoc_id: key.enb_id,
        tai: Default::default(),
        ecgi: Default::default(),
    }
}

pub fn attach_request(imsi: &str) -> AttachRequest {
    AttachRequest {
        identity: MobileIdentity::Imsi(imsi.to_string()),
        ue_network_capability: UeNetworkCapability {
            eea: 0b1111,
            eia: 0b1111,
        },
        ..Default::default()
    }
}

pub fn auth_vector() -> AuthVector {
    AuthVector {
        rand: Bytes::from_static(&[0x11; 16]),
        autn: Bytes::from_static(&[0x22; 16]),
        xres: Bytes::from_static(&[0x33; 8]),
        kasme: Bytes::from_static(&[0x44; 32]),
    }
}

/// NAS message carried by an outbound S1AP message, if any
pub fn nas_of(msg: &OutboundMessage) -> Option<&NasMessage> {
    match msg {
        OutboundMessage::S1ap(S1apMessage::DownlinkNasTransport { nas, .. }) => Some(nas),
        OutboundMessage::S1ap(S1apMessage::InitialContextSetupRequest { nas, .. }) => nas.as_ref(),
        OutboundMessage::S1ap(S1apMessage::ERabReleaseCommand { nas, .. }) => Some(nas),
        OutboundMessage::S1ap(S1apMessage::ERabSetupRequest { erabs, .. }) => {
            erabs.first().and_then(|e| e.nas.as_ref())
        }
        _ => None,
    }
}

fn s11_seq(sent: &[(PeerTask, OutboundMessage)], pred: impl Fn(&S11Message) -> bool) -> Option<u32> {
    sent.iter().find_map(|(_, m)| match m {
        OutboundMessage::S11(x) if pred(&x.message) => Some(x.seq),
        _ => None,
    })
}

// ============================================================================
// Procedure Drivers
// ============================================================================

/// Initial UE Message carrying an Attach Request. Returns the new context id.
pub fn initial_attach(t: &TestApp, key: EnbUeKey, req: AttachRequest) -> MmeUeS1apId {
    t.app
        .dispatch(MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessage {
            enb_ue_key: key,
            sctp_assoc_id: key.enb_id,
            tai: Default::default(),
            ecgi: Default::default(),
            guti: None,
            nas: NasPdu::plain(NasUplink::AttachRequest(req)),
        })))
        .unwrap();
    let ue_ref = t.app.store().lookup_by_enb_ue_key(&key).expect("attached context");
    let id = lock_ue(&ue_ref).mme_ue_s1ap_id;
    id
}

/// Initial UE Message carrying a Service Request
pub fn service_request(origin: S1Origin, guti: Option<EpsGuti>) -> MmeEvent {
    MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessage {
        enb_ue_key: origin.enb_ue_key,
        sctp_assoc_id: origin.sctp_assoc_id,
        tai: origin.tai,
        ecgi: origin.ecgi,
        guti,
        nas: NasPdu::protected(NasUplink::ServiceRequest { ksi: 0 }),
    }))
}

/// Uplink NAS Transport on the UE's current S1 connection
pub fn uplink(t: &TestApp, ue_id: MmeUeS1apId, message: NasUplink) {
    let enb_ue_key = {
        let ue_ref = t.app.store().lookup_by_local_ref(ue_id).expect("context");
        let ue = lock_ue(&ue_ref);
        ue.enb_ue_key.expect("S1 connection")
    };
    t.app
        .dispatch(MmeEvent::S1ap(S1apEvent::UplinkNasTransport(UplinkNasTransport {
            mme_ue_s1ap_id: ue_id,
            enb_ue_key,
            nas: NasPdu::protected(message),
        })))
        .unwrap();
}

pub fn mme_s11_teid(t: &TestApp, ue_id: MmeUeS1apId) -> u32 {
    let ue_ref = t.app.store().lookup_by_local_ref(ue_id).expect("context");
    let teid = lock_ue(&ue_ref).mme_s11_teid;
    teid
}

/// Handle id of the running T3460/T3470
pub fn common_timer_id(t: &TestApp, ue_id: MmeUeS1apId) -> u64 {
    let ue_ref = t.app.store().lookup_by_local_ref(ue_id).expect("context");
    let ue = lock_ue(&ue_ref);
    ue.attach_proc()
        .and_then(|a| a.common.as_ref())
        .map(|c| c.timer.id())
        .expect("common procedure")
}

/// HSS answer plus a matching Authentication Response
pub fn authenticate(t: &TestApp, ue_id: MmeUeS1apId, imsi: &str) {
    t.app
        .dispatch(MmeEvent::S6a(S6aEvent::AuthenticationInformationAnswer {
            imsi: imsi.to_string(),
            result: Ok(auth_vector()),
        }))
        .unwrap();
    uplink(t, ue_id, NasUplink::AuthenticationResponse { res: auth_vector().xres });
}

fn sgw_fteid(interface: FteidInterface, teid: u32) -> Fteid {
    Fteid {
        interface,
        teid,
        addr: IpAddr::v4([10, 0, 0, 2].into()),
    }
}

/// Accepted Create Session Response for the request `seq`
pub fn create_session_response(teid: u32, seq: u32, ebi: Ebi) -> CreateSessionResponse {
    CreateSessionResponse {
        teid,
        seq,
        cause: GtpCause::RequestAccepted,
        sgw_s11: Some(sgw_fteid(FteidInterface::S11S4SgwGtpC, 0x5000 + teid)),
        pgw_s5c: None,
        paa: None,
        apn_ambr: None,
        pco: Bytes::new(),
        bearers: vec![BearerContextCreated {
            ebi,
            cause: GtpCause::RequestAccepted,
            sgw_s1u: sgw_fteid(FteidInterface::S1uSgwGtpU, 0x6000 + teid),
            pgw_s5u: None,
            qos: None,
        }],
    }
}

/// Drive an attach through security and update location. Returns the
/// context id and the sequence number of the Create Session Request.
pub fn attach_to_create_session(t: &TestApp, n: u32, imsi: &str) -> (MmeUeS1apId, u32) {
    let ue_id = initial_attach(t, enb_key(n), attach_request(imsi));
    authenticate(t, ue_id, imsi);
    uplink(t, ue_id, NasUplink::SecurityModeComplete { imeisv: None });
    t.sink.take();

    t.app
        .dispatch(MmeEvent::S6a(S6aEvent::UpdateLocationAnswer {
            imsi: imsi.to_string(),
            result: Ok(SubscriptionData::default()),
        }))
        .unwrap();
    let sent = t.sink.take();
    let csr_seq = s11_seq(&sent, |m| matches!(m, S11Message::CreateSessionRequest(_)))
        .expect("create session request");
    (ue_id, csr_seq)
}

/// Drive a UE from Attach Request to REGISTERED and CONNECTED with its
/// default bearer (EBI 5) active
pub fn attach_ue(t: &TestApp, n: u32, imsi: &str) -> MmeUeS1apId {
    let (ue_id, csr_seq) = attach_to_create_session(t, n, imsi);
    let teid = mme_s11_teid(t, ue_id);
    t.app
        .dispatch(MmeEvent::S11(S11Event::CreateSessionResponse(create_session_response(
            teid, csr_seq, 5,
        ))))
        .unwrap();

    t.app
        .dispatch(MmeEvent::S1ap(S1apEvent::InitialContextSetupResponse(
            InitialContextSetupResponse {
                mme_ue_s1ap_id: ue_id,
                setup: vec![ErabAdmitted {
                    ebi: 5,
                    transport_addr: Bytes::from_static(&[10, 0, 0, 1]),
                    teid: 0x100,
                }],
                failed: Vec::new(),
            },
        )))
        .unwrap();
    let sent = t.sink.take();
    let mbr_seq = s11_seq(&sent, |m| matches!(m, S11Message::ModifyBearerRequest(_)))
        .expect("modify bearer request");
    t.app
        .dispatch(MmeEvent::S11(S11Event::ModifyBearerResponse(ModifyBearerResponse {
            teid,
            seq: mbr_seq,
            cause: GtpCause::RequestAccepted,
            removed: Vec::new(),
        })))
        .unwrap();

    uplink(t, ue_id, NasUplink::AttachComplete);
    ue_id
}

/// Release the S1 connection of a CONNECTED UE: it ends up IDLE
pub fn make_idle(t: &TestApp, ue_id: MmeUeS1apId) {
    t.app
        .dispatch(MmeEvent::S1ap(S1apEvent::UeContextReleaseRequest {
            mme_ue_s1ap_id: ue_id,
            cause: crate::s1ap_build::S1apCause::new(
                crate::s1ap_build::S1apCauseGroup::RadioNetwork,
                crate::s1ap_build::radio_network_cause::USER_INACTIVITY,
            ),
        }))
        .unwrap();
    let teid = mme_s11_teid(t, ue_id);
    t.app
        .dispatch(MmeEvent::S11(S11Event::ReleaseAccessBearersResponse {
            teid,
            cause: GtpCause::RequestAccepted,
        }))
        .unwrap();
    t.app
        .dispatch(MmeEvent::S1ap(S1apEvent::UeContextReleaseComplete { mme_ue_s1ap_id: ue_id }))
        .unwrap();
}
