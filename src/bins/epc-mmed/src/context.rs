//! MME UE Context
//!
//! Identity types shared by every procedure and the per-UE context that the
//! EMM and session engines mutate.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;

use crate::bearer::{BearerContext, PdnContext};
use crate::event::CreateBearerRequest;
use crate::nas_build::EmmCause;
use crate::procedure::Procedure;
use crate::s1ap_build::S1apCause;
use crate::timer::UeTimers;

// ============================================================================
// Constants
// ============================================================================

/// Invalid MME UE S1AP ID
pub const INVALID_MME_UE_S1AP_ID: u32 = 0xffff_ffff;

/// Minimum EPS bearer ID
pub const MIN_EPS_BEARER_ID: u8 = 5;
/// Maximum EPS bearer ID
pub const MAX_EPS_BEARER_ID: u8 = 15;
/// Number of bearer slots per UE (EBI 5..=15)
pub const BEARERS_PER_UE: usize = (MAX_EPS_BEARER_ID - MIN_EPS_BEARER_ID + 1) as usize;
/// Hard limit of PDN connections per UE
pub const MAX_APN_PER_UE: usize = 10;

/// Paging retransmissions before pending activations are rejected
pub const MAX_PAGING_RETRY_COUNT: u8 = 1;
/// T3450 expirations before the attach is aborted
pub const ATTACH_COUNTER_MAX: u8 = 5;
/// T3422 expirations before a local detach
pub const DETACH_COUNTER_MAX: u8 = 5;
/// T3460/T3470 retransmissions before the attach is aborted
pub const NAS_RETRANSMISSION_MAX: u8 = 5;

/// NAS KSI no key available
pub const NAS_KSI_NO_KEY_IS_AVAILABLE: u8 = 7;

/// MME-local UE reference
pub type MmeUeS1apId = u32;
/// EPS bearer identity
pub type Ebi = u8;
/// PDN context id (index into the PDN array)
pub type PdnCid = usize;

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    /// 0xf for a 2-digit MNC
    pub mnc3: u8,
}

impl PlmnId {
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc: Vec<u8> = mcc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();
        let mnc: Vec<u8> = mnc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();

        Self {
            mcc1: mcc.first().copied().unwrap_or(0),
            mcc2: mcc.get(1).copied().unwrap_or(0),
            mcc3: mcc.get(2).copied().unwrap_or(0),
            mnc1: mnc.first().copied().unwrap_or(0),
            mnc2: mnc.get(1).copied().unwrap_or(0),
            mnc3: mnc.get(2).copied().unwrap_or(0xf),
        }
    }

    /// MCC+MNC digits
    pub fn to_bcd(&self) -> String {
        if self.mnc3 == 0xf {
            format!("{}{}{}{}{}", self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2)
        } else {
            format!(
                "{}{}{}{}{}{}",
                self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2, self.mnc3
            )
        }
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bcd())
    }
}

/// Tracking Area Identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    pub plmn_id: PlmnId,
    pub tac: u16,
}

/// E-UTRAN Cell Global Identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ECgi {
    pub plmn_id: PlmnId,
    /// 28 bits
    pub cell_id: u32,
}

/// EPS GUTI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
    pub m_tmsi: u32,
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04x}-{:02x}-{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

/// S-TMSI used for paging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct STmsi {
    pub mme_code: u8,
    pub m_tmsi: u32,
}

/// eNB-side UE identity: the eNB plus the eNB-UE-S1AP-ID it allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnbUeKey {
    pub enb_id: u32,
    pub enb_ue_s1ap_id: u32,
}

impl EnbUeKey {
    pub fn new(enb_id: u32, enb_ue_s1ap_id: u32) -> Self {
        Self { enb_id, enb_ue_s1ap_id }
    }
}

impl fmt::Display for EnbUeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enb:{}/{}", self.enb_id, self.enb_ue_s1ap_id)
    }
}

/// Transport address (IPv4 and/or IPv6)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpAddr {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl IpAddr {
    pub fn v4(addr: Ipv4Addr) -> Self {
        Self { ipv4: Some(addr), ipv6: None }
    }

    pub fn v6(addr: Ipv6Addr) -> Self {
        Self { ipv4: None, ipv6: Some(addr) }
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// F-TEID interface type (TS 29.274 8.22)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FteidInterface {
    #[default]
    S1uEnodebGtpU = 0,
    S1uSgwGtpU = 1,
    S5S8SgwGtpU = 4,
    S5S8PgwGtpU = 5,
    S5S8SgwGtpC = 6,
    S5S8PgwGtpC = 7,
    S11MmeGtpC = 10,
    S11S4SgwGtpC = 11,
}

/// Fully qualified TEID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fteid {
    pub interface: FteidInterface,
    pub teid: u32,
    pub addr: IpAddr,
}

/// Bitrate pair in bps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitrate {
    pub uplink: u64,
    pub downlink: u64,
}

/// Allocation and retention priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arp {
    pub priority_level: u8,
    pub pre_emption_capability: bool,
    pub pre_emption_vulnerability: bool,
}

/// Bearer QoS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qos {
    pub qci: u8,
    pub arp: Arp,
    pub mbr: Bitrate,
    pub gbr: Bitrate,
}

/// PDN type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdnType {
    #[default]
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv4v6 = 3,
}

/// PDN Address Allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paa {
    pub pdn_type: PdnType,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

// ============================================================================
// UE States
// ============================================================================

/// EMM mobility state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MobilityState {
    #[default]
    Unregistered,
    Registered,
}

impl fmt::Display for MobilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobilityState::Unregistered => write!(f, "UNREGISTERED"),
            MobilityState::Registered => write!(f, "REGISTERED"),
        }
    }
}

/// ECM signalling connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcmState {
    #[default]
    Idle,
    Connected,
}

impl fmt::Display for EcmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcmState::Idle => write!(f, "IDLE"),
            EcmState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// What to do once the eNB confirms a UE Context Release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseAction {
    #[default]
    None,
    /// Drop the S1 connection only, the UE goes IDLE
    S1ContextRemove,
    /// Release of the source side after a completed S1 handover
    HandoverSourceRemove,
}

/// SGs association state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SgsState {
    #[default]
    Null,
    LaUpdateRequested,
    Associated,
}

impl fmt::Display for SgsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SgsState::Null => write!(f, "SGS_NULL"),
            SgsState::LaUpdateRequested => write!(f, "LA_UPDATE_REQUESTED"),
            SgsState::Associated => write!(f, "SGS_ASSOCIATED"),
        }
    }
}

// ============================================================================
// Security and Subscription
// ============================================================================

/// NAS security context. Keys are opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub ksi: u8,
    /// Selected ciphering algorithm (EEA0..EEA3)
    pub eea: u8,
    /// Selected integrity algorithm (EIA0..EIA3)
    pub eia: u8,
    pub kasme: Bytes,
    pub ul_count: u32,
    pub dl_count: u32,
    pub valid: bool,
}

impl SecurityContext {
    pub fn invalidate(&mut self) {
        self.ksi = NAS_KSI_NO_KEY_IS_AVAILABLE;
        self.kasme = Bytes::new();
        self.valid = false;
    }
}

/// UE network capability: supported EEA/EIA as bitmaps (bit N = algorithm N)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeNetworkCapability {
    pub eea: u8,
    pub eia: u8,
}

/// Authentication vector returned by the HSS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthVector {
    pub rand: Bytes,
    pub autn: Bytes,
    pub xres: Bytes,
    pub kasme: Bytes,
}

/// Network access mode from the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkAccessMode {
    #[default]
    PacketAndCircuit,
    OnlyPacket,
}

/// Subscription data learned from the HSS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionData {
    pub msisdn: Option<String>,
    pub ambr: Bitrate,
    pub default_apn: Option<String>,
    pub apns: Vec<String>,
    pub network_access_mode: NetworkAccessMode,
}

// ============================================================================
// UE Context
// ============================================================================

/// S1 mobility state kept between an eNB request and the S11 round it starts:
/// handover, path switch or E-RAB modification
#[derive(Debug, Clone, Default)]
pub struct HandoverContext {
    pub source: Option<EnbUeKey>,
    pub target_enb_id: u32,
    pub target: Option<EnbUeKey>,
    pub admitted: Vec<crate::event::ErabAdmitted>,
    pub not_admitted: Vec<Ebi>,
}

/// Pending S11 Modify Bearer round: what to answer once every PDN replied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModifyAction {
    #[default]
    NoAction,
    InPathSwitchRequest,
    InErabModification,
    InHandoverNotify,
}

/// One UE with an MME relationship
#[derive(Debug)]
pub struct UeContext {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_key: Option<EnbUeKey>,
    pub sctp_assoc_id: u32,
    pub imsi: Option<String>,
    pub imeisv: Option<String>,
    pub guti: Option<EpsGuti>,
    pub mme_s11_teid: u32,

    pub mobility_state: MobilityState,
    pub ecm_state: EcmState,
    pub security: SecurityContext,
    pub ue_network_capability: UeNetworkCapability,
    pub auth_vector: Option<AuthVector>,

    pub tai: EpsTai,
    pub ecgi: ECgi,
    pub ue_ambr: Bitrate,
    pub subscription: Option<SubscriptionData>,

    pub bearers: [Option<BearerContext>; BEARERS_PER_UE],
    pub pdns: [Option<PdnContext>; MAX_APN_PER_UE],
    /// Configured PDN limit, at most `MAX_APN_PER_UE`
    pub pdn_limit: usize,

    pub procedures: Vec<Procedure>,
    pub timers: UeTimers,
    pub pending_bearer_requests: [Option<CreateBearerRequest>; BEARERS_PER_UE],
    pub paging_retx_count: u8,

    pub failure_cause: Option<EmmCause>,
    pub release_action: ReleaseAction,
    /// Cause of the pending UE Context Release
    pub release_cause: Option<S1apCause>,
    pub unknown_guti: bool,
    pub emergency: bool,
    pub sgs_state: SgsState,

    pub handover: Option<HandoverContext>,
    pub modify_action: ModifyAction,
    pub pending_modify: usize,
    pub pending_release: usize,

    /// Set while the context is registered in the store
    pub(crate) indexed: bool,
}

impl Default for UeContext {
    fn default() -> Self {
        Self {
            mme_ue_s1ap_id: INVALID_MME_UE_S1AP_ID,
            enb_ue_key: None,
            sctp_assoc_id: 0,
            imsi: None,
            imeisv: None,
            guti: None,
            mme_s11_teid: 0,
            mobility_state: MobilityState::default(),
            ecm_state: EcmState::default(),
            security: SecurityContext {
                ksi: NAS_KSI_NO_KEY_IS_AVAILABLE,
                ..Default::default()
            },
            ue_network_capability: UeNetworkCapability::default(),
            auth_vector: None,
            tai: EpsTai::default(),
            ecgi: ECgi::default(),
            ue_ambr: Bitrate::default(),
            subscription: None,
            bearers: Default::default(),
            pdns: Default::default(),
            pdn_limit: MAX_APN_PER_UE,
            procedures: Vec::new(),
            timers: UeTimers::default(),
            pending_bearer_requests: Default::default(),
            paging_retx_count: 0,
            failure_cause: None,
            release_action: ReleaseAction::None,
            release_cause: None,
            unknown_guti: false,
            emergency: false,
            sgs_state: SgsState::Null,
            handover: None,
            modify_action: ModifyAction::NoAction,
            pending_modify: 0,
            pending_release: 0,
            indexed: false,
        }
    }
}

impl UeContext {
    pub fn is_registered(&self) -> bool {
        self.mobility_state == MobilityState::Registered
    }

    pub fn is_connected(&self) -> bool {
        self.ecm_state == EcmState::Connected
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn s_tmsi(&self) -> Option<STmsi> {
        self.guti.map(|g| STmsi {
            mme_code: g.mme_code,
            m_tmsi: g.m_tmsi,
        })
    }

    pub fn set_mobility_state(&mut self, state: MobilityState) {
        if self.mobility_state != state {
            log::debug!(
                "EMM [{}]: {} -> {}",
                self.mme_ue_s1ap_id,
                self.mobility_state,
                state
            );
            self.mobility_state = state;
        }
    }

    pub fn set_ecm_state(&mut self, state: EcmState) {
        if self.ecm_state != state {
            log::debug!("ECM [{}]: {} -> {}", self.mme_ue_s1ap_id, self.ecm_state, state);
            self.ecm_state = state;
        }
    }

    /// Number of queued dedicated bearer activations
    pub fn pending_bearer_count(&self) -> usize {
        self.pending_bearer_requests.iter().filter(|r| r.is_some()).count()
    }
}
