//! Procedure Tracking
//!
//! The per-UE procedure list. An Attach may own one nested common procedure
//! (Identification, Authentication or Security Mode Control); common
//! procedures never exist on their own. S11 bearer procedures are correlated
//! by the GTP sequence number of the SGW request that started them.

use std::fmt;

use crate::context::{Ebi, PdnCid, UeContext};
use crate::event::AttachRequest;
use crate::nas_build::{EmmCause, NasMessage};
use crate::s11_build::GtpCause;
use crate::timer::MmeTimerHandle;

// ============================================================================
// EMM Procedures
// ============================================================================

/// Attach procedure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachState {
    #[default]
    None,
    Identification,
    Authentication,
    SecurityModeControl,
    ImeisvIdentification,
    UpdateLocation,
    CreateSession,
    AcceptSent,
    Complete,
    Aborted,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachState::None => write!(f, "NONE"),
            AttachState::Identification => write!(f, "IDENTIFICATION"),
            AttachState::Authentication => write!(f, "AUTHENTICATION"),
            AttachState::SecurityModeControl => write!(f, "SECURITY_MODE_CONTROL"),
            AttachState::ImeisvIdentification => write!(f, "IMEISV_IDENTIFICATION"),
            AttachState::UpdateLocation => write!(f, "UPDATE_LOCATION"),
            AttachState::CreateSession => write!(f, "CREATE_SESSION"),
            AttachState::AcceptSent => write!(f, "ACCEPT_SENT"),
            AttachState::Complete => write!(f, "COMPLETE"),
            AttachState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Common procedure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonProcKind {
    Identification,
    Authentication,
    SecurityModeControl,
}

impl fmt::Display for CommonProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonProcKind::Identification => write!(f, "IDENTIFICATION"),
            CommonProcKind::Authentication => write!(f, "AUTHENTICATION"),
            CommonProcKind::SecurityModeControl => write!(f, "SECURITY_MODE_CONTROL"),
        }
    }
}

/// Common procedure nested in an attach
#[derive(Debug)]
pub struct CommonProc {
    pub kind: CommonProcKind,
    /// T3470 for identification, T3460 otherwise
    pub timer: MmeTimerHandle,
    pub retx_count: u8,
    /// Last message sent, kept for retransmission
    pub message: NasMessage,
}

/// Attach procedure
#[derive(Debug)]
pub struct AttachProc {
    pub state: AttachState,
    /// The request as received, compared against duplicates and re-driven
    /// after an identification conflict
    pub request: AttachRequest,
    /// Integrity of the initial message was verified
    pub integrity_ok: bool,
    pub common: Option<CommonProc>,
    pub authenticated: bool,
    pub t3450: MmeTimerHandle,
    pub attach_accept_count: u8,
    /// Attach Accept as sent, kept for retransmission
    pub accept: Option<NasMessage>,
    pub default_pdn: Option<PdnCid>,
    pub emm_cause: Option<EmmCause>,
}

impl AttachProc {
    pub fn new(request: AttachRequest, integrity_ok: bool) -> Self {
        Self {
            state: AttachState::None,
            request,
            integrity_ok,
            common: None,
            authenticated: false,
            t3450: MmeTimerHandle::inactive(),
            attach_accept_count: 0,
            accept: None,
            default_pdn: None,
            emm_cause: None,
        }
    }

    pub fn set_state(&mut self, ue_id: u32, state: AttachState) {
        if self.state != state {
            log::debug!("EMM attach [{}]: {} -> {}", ue_id, self.state, state);
            self.state = state;
        }
    }

    pub fn accept_sent(&self) -> bool {
        self.accept.is_some()
    }
}

/// Detach kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachKind {
    UeInitiated { switch_off: bool },
    NetworkInitiated,
}

/// Detach procedure
#[derive(Debug)]
pub struct DetachProc {
    pub kind: DetachKind,
    pub t3422: MmeTimerHandle,
    pub retx_count: u8,
    /// Delete Session Responses still awaited
    pub pending_sessions: usize,
    pub message: Option<NasMessage>,
}

impl DetachProc {
    pub fn new(kind: DetachKind) -> Self {
        Self {
            kind,
            t3422: MmeTimerHandle::inactive(),
            retx_count: 0,
            pending_sessions: 0,
            message: None,
        }
    }
}

// ============================================================================
// S11 Bearer Procedures
// ============================================================================

/// Confirmation state of one bearer in a multi-bearer procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerOutcome {
    Pending,
    Accepted,
    Rejected(GtpCause),
}

/// One bearer tracked by an S11 procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerEntry {
    /// Local EBI, none when allocation failed
    pub ebi: Option<Ebi>,
    /// SGW S1-U TEID the SGW uses to correlate the bearer
    pub sgw_s1u_teid: u32,
    pub outcome: BearerOutcome,
}

/// Create-bearer / delete-bearer procedure
#[derive(Debug)]
pub struct BearerProc {
    /// GTP sequence number of the SGW request
    pub token: u32,
    pub sgw_s11_teid: u32,
    pub linked_ebi: Ebi,
    pub pdn_cid: PdnCid,
    pub pti: u8,
    pub entries: Vec<BearerEntry>,
    pub guard: MmeTimerHandle,
}

impl BearerProc {
    pub fn new(token: u32, sgw_s11_teid: u32, linked_ebi: Ebi, pdn_cid: PdnCid, pti: u8) -> Self {
        Self {
            token,
            sgw_s11_teid,
            linked_ebi,
            pdn_cid,
            pti,
            entries: Vec::new(),
            guard: MmeTimerHandle::inactive(),
        }
    }

    pub fn tracks(&self, ebi: Ebi) -> bool {
        self.entries.iter().any(|e| e.ebi == Some(ebi))
    }

    /// Record the outcome for `ebi`. The first confirmation wins.
    /// Returns false if the EBI is unknown or already confirmed.
    pub fn record(&mut self, ebi: Ebi, outcome: BearerOutcome) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.ebi == Some(ebi) && e.outcome == BearerOutcome::Pending)
        {
            Some(entry) => {
                entry.outcome = outcome;
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> Vec<Ebi> {
        self.entries
            .iter()
            .filter(|e| e.outcome == BearerOutcome::Pending)
            .filter_map(|e| e.ebi)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.outcome != BearerOutcome::Pending)
    }

    pub fn any_accepted(&self) -> bool {
        self.entries.iter().any(|e| e.outcome == BearerOutcome::Accepted)
    }
}

// ============================================================================
// Procedure
// ============================================================================

/// Per-UE procedure record
#[derive(Debug)]
pub enum Procedure {
    Attach(AttachProc),
    Detach(DetachProc),
    CreateBearer(BearerProc),
    DeleteBearer(BearerProc),
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Attach(_) => "ATTACH",
            Procedure::Detach(_) => "DETACH",
            Procedure::CreateBearer(_) => "CREATE_BEARER",
            Procedure::DeleteBearer(_) => "DELETE_BEARER",
        }
    }

    pub fn bearer_proc(&self) -> Option<&BearerProc> {
        match self {
            Procedure::CreateBearer(p) | Procedure::DeleteBearer(p) => Some(p),
            _ => None,
        }
    }

    fn bearer_proc_mut(&mut self) -> Option<&mut BearerProc> {
        match self {
            Procedure::CreateBearer(p) | Procedure::DeleteBearer(p) => Some(p),
            _ => None,
        }
    }
}

impl UeContext {
    /// Add a procedure. A second attach is refused.
    pub fn add_procedure(&mut self, proc_: Procedure) -> bool {
        if matches!(proc_, Procedure::Attach(_)) && self.attach_proc().is_some() {
            log::error!("[{}] attach procedure already running", self.mme_ue_s1ap_id);
            return false;
        }
        log::debug!("[{}] {} procedure started", self.mme_ue_s1ap_id, proc_.name());
        self.procedures.push(proc_);
        true
    }

    pub fn attach_proc(&self) -> Option<&AttachProc> {
        self.procedures.iter().find_map(|p| match p {
            Procedure::Attach(a) => Some(a),
            _ => None,
        })
    }

    pub fn attach_proc_mut(&mut self) -> Option<&mut AttachProc> {
        self.procedures.iter_mut().find_map(|p| match p {
            Procedure::Attach(a) => Some(a),
            _ => None,
        })
    }

    pub fn detach_proc(&self) -> Option<&DetachProc> {
        self.procedures.iter().find_map(|p| match p {
            Procedure::Detach(d) => Some(d),
            _ => None,
        })
    }

    pub fn detach_proc_mut(&mut self) -> Option<&mut DetachProc> {
        self.procedures.iter_mut().find_map(|p| match p {
            Procedure::Detach(d) => Some(d),
            _ => None,
        })
    }

    pub fn s11_proc_by_token(&self, token: u32) -> Option<&BearerProc> {
        self.procedures
            .iter()
            .filter_map(Procedure::bearer_proc)
            .find(|p| p.token == token)
    }

    pub fn s11_proc_by_token_mut(&mut self, token: u32) -> Option<&mut BearerProc> {
        self.procedures
            .iter_mut()
            .filter_map(Procedure::bearer_proc_mut)
            .find(|p| p.token == token)
    }

    /// S11 procedure with a pending confirmation for `ebi`
    pub fn s11_proc_for_ebi(&self, ebi: Ebi) -> Option<&BearerProc> {
        self.procedures
            .iter()
            .filter_map(Procedure::bearer_proc)
            .find(|p| p.pending().contains(&ebi))
    }

    pub fn s11_proc_for_ebi_mut(&mut self, ebi: Ebi) -> Option<&mut BearerProc> {
        self.procedures
            .iter_mut()
            .filter_map(Procedure::bearer_proc_mut)
            .find(|p| p.pending().contains(&ebi))
    }

    /// Remove and return every procedure matching `pred`. Owned timers are
    /// cancelled when the records are dropped.
    pub fn remove_procedures<F>(&mut self, mut pred: F) -> Vec<Procedure>
    where
        F: FnMut(&Procedure) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.procedures.len());
        for proc_ in self.procedures.drain(..) {
            if pred(&proc_) {
                removed.push(proc_);
            } else {
                kept.push(proc_);
            }
        }
        self.procedures = kept;
        removed
    }

    pub fn remove_attach_proc(&mut self) -> Option<AttachProc> {
        self.remove_procedures(|p| matches!(p, Procedure::Attach(_)))
            .into_iter()
            .find_map(|p| match p {
                Procedure::Attach(a) => Some(a),
                _ => None,
            })
    }

    pub fn remove_s11_proc(&mut self, token: u32) -> Option<Procedure> {
        self.remove_procedures(|p| p.bearer_proc().map(|b| b.token) == Some(token))
            .into_iter()
            .next()
    }

    /// Drop every procedure with its timers, and the pending bearer queue
    pub fn abort_all_procedures(&mut self) {
        if !self.procedures.is_empty() {
            log::debug!(
                "[{}] aborting {} procedure(s)",
                self.mme_ue_s1ap_id,
                self.procedures.len()
            );
        }
        self.procedures.clear();
        for slot in self.pending_bearer_requests.iter_mut() {
            *slot = None;
        }
    }
}
