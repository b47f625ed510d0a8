//! Bearer and PDN Context Model
//!
//! PDN connections live in a fixed array of `MAX_APN_PER_UE` slots bounded by
//! the configured per-UE limit. Bearers live in a fixed array of
//! `BEARERS_PER_UE` slots indexed by `ebi - MIN_EPS_BEARER_ID`, so a lookup by
//! EBI is a single index operation.

use std::fmt;

use bytes::Bytes;

use crate::context::{
    Bitrate, Ebi, Fteid, Paa, PdnCid, PdnType, Qos, UeContext, MAX_EPS_BEARER_ID,
    MIN_EPS_BEARER_ID,
};
use crate::error::BearerError;

// ============================================================================
// Types
// ============================================================================

/// ESM bearer context state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EsmState {
    #[default]
    Inactive,
    ActivePending,
    Active,
    InactivePending,
}

impl fmt::Display for EsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EsmState::Inactive => write!(f, "BEARER_CONTEXT_INACTIVE"),
            EsmState::ActivePending => write!(f, "BEARER_CONTEXT_ACTIVE_PENDING"),
            EsmState::Active => write!(f, "BEARER_CONTEXT_ACTIVE"),
            EsmState::InactivePending => write!(f, "BEARER_CONTEXT_INACTIVE_PENDING"),
        }
    }
}

/// One EPS bearer
#[derive(Debug, Clone, Default)]
pub struct BearerContext {
    /// EPS bearer identity (5..=15)
    pub ebi: Ebi,
    /// Owning PDN connection
    pub pdn_cid: PdnCid,
    /// Default bearer of its PDN
    pub is_default: bool,
    pub qos: Qos,
    /// eNB S1-U F-TEID, learned from ICS/E-RAB setup responses
    pub enb_s1u: Option<Fteid>,
    /// SGW S1-U F-TEID
    pub sgw_s1u: Option<Fteid>,
    /// PGW S5/S8-U F-TEID
    pub pgw_s5u: Option<Fteid>,
    /// Procedure transaction identity
    pub pti: u8,
    pub state: EsmState,
    pub tft: Bytes,
}

impl BearerContext {
    fn set_state(&mut self, state: EsmState) {
        if self.state != state {
            log::debug!("ESM [EBI:{}]: {} -> {}", self.ebi, self.state, state);
            self.state = state;
        }
    }

    pub fn activate(&mut self) {
        self.set_state(EsmState::Active);
    }

    pub fn mark_pending(&mut self) {
        self.set_state(EsmState::ActivePending);
    }

    pub fn mark_inactive_pending(&mut self) {
        self.set_state(EsmState::InactivePending);
    }
}

/// One PDN connection
#[derive(Debug, Clone, Default)]
pub struct PdnContext {
    pub cid: PdnCid,
    pub apn: String,
    pub pdn_type: PdnType,
    pub paa: Option<Paa>,
    /// Default bearer, set once the default bearer is created
    pub default_ebi: Option<Ebi>,
    /// Every bearer owned by this PDN, default included
    pub ebis: Vec<Ebi>,
    /// SGW S11 control tunnel
    pub sgw_s11: Option<Fteid>,
    /// PGW S5/S8 control tunnel
    pub pgw_s5c: Option<Fteid>,
    pub apn_ambr: Bitrate,
    /// Route S11 messages of this PDN to the SGW S8 task
    pub route_to_s8: bool,
    /// Outstanding S11 transaction sequence for this PDN
    pub xact: Option<u32>,
    pub pco: Bytes,
}

impl PdnContext {
    pub fn sgw_s11_teid(&self) -> Option<u32> {
        self.sgw_s11.map(|f| f.teid)
    }
}

fn ebi_to_index(ebi: Ebi) -> Option<usize> {
    if (MIN_EPS_BEARER_ID..=MAX_EPS_BEARER_ID).contains(&ebi) {
        Some((ebi - MIN_EPS_BEARER_ID) as usize)
    } else {
        None
    }
}

fn index_to_ebi(idx: usize) -> Ebi {
    idx as u8 + MIN_EPS_BEARER_ID
}

// ============================================================================
// PDN Contexts
// ============================================================================

/// Create a PDN connection for `apn` in the first free slot
pub fn create_pdn_context(ue: &mut UeContext, apn: &str) -> Result<PdnCid, BearerError> {
    let limit = ue.pdn_limit.min(ue.pdns.len());
    let cid = ue.pdns[..limit]
        .iter()
        .position(|p| p.is_none())
        .ok_or(BearerError::CapacityExceeded)?;

    ue.pdns[cid] = Some(PdnContext {
        cid,
        apn: apn.to_string(),
        ..Default::default()
    });
    log::debug!("[{}] PDN[{}] created APN[{}]", ue.mme_ue_s1ap_id, cid, apn);
    Ok(cid)
}

pub fn pdn_context(ue: &UeContext, cid: PdnCid) -> Option<&PdnContext> {
    ue.pdns.get(cid).and_then(|p| p.as_ref())
}

pub fn pdn_context_mut(ue: &mut UeContext, cid: PdnCid) -> Option<&mut PdnContext> {
    ue.pdns.get_mut(cid).and_then(|p| p.as_mut())
}

pub fn pdn_by_apn(ue: &UeContext, apn: &str) -> Option<PdnCid> {
    ue.pdns
        .iter()
        .flatten()
        .find(|p| p.apn.eq_ignore_ascii_case(apn))
        .map(|p| p.cid)
}

/// PDN whose default bearer is `ebi`
pub fn pdn_by_default_ebi(ue: &UeContext, ebi: Ebi) -> Option<PdnCid> {
    ue.pdns
        .iter()
        .flatten()
        .find(|p| p.default_ebi == Some(ebi))
        .map(|p| p.cid)
}

/// PDN with an outstanding S11 transaction `seq`
pub fn pdn_by_xact(ue: &UeContext, seq: u32) -> Option<PdnCid> {
    ue.pdns
        .iter()
        .flatten()
        .find(|p| p.xact == Some(seq))
        .map(|p| p.cid)
}

pub fn pdn_cids(ue: &UeContext) -> Vec<PdnCid> {
    ue.pdns.iter().flatten().map(|p| p.cid).collect()
}

pub fn pdn_count(ue: &UeContext) -> usize {
    ue.pdns.iter().flatten().count()
}

/// Free a PDN connection with every bearer it owns
pub fn free_pdn_context(ue: &mut UeContext, cid: PdnCid) -> Result<(), BearerError> {
    let ebis = match pdn_context(ue, cid) {
        Some(pdn) => pdn.ebis.clone(),
        None => return Err(BearerError::InvalidId(format!("PDN[{}]", cid))),
    };
    for ebi in &ebis {
        if ebi_to_index(*ebi).is_none() {
            log::error!("[{}] PDN[{}] owns invalid EBI[{}]", ue.mme_ue_s1ap_id, cid, ebi);
            return Err(BearerError::InvalidId(format!("EBI[{}]", ebi)));
        }
    }

    for ebi in ebis {
        if let Some(idx) = ebi_to_index(ebi) {
            ue.bearers[idx] = None;
        }
    }
    ue.pdns[cid] = None;
    log::debug!("[{}] PDN[{}] freed", ue.mme_ue_s1ap_id, cid);
    Ok(())
}

// ============================================================================
// Bearer Contexts
// ============================================================================

/// Create a bearer on PDN `pdn_cid`.
///
/// `None` allocates the lowest free EBI. A PDN accepts a single default bearer.
pub fn create_bearer_context(
    ue: &mut UeContext,
    pdn_cid: PdnCid,
    requested_ebi: Option<Ebi>,
    is_default: bool,
) -> Result<Ebi, BearerError> {
    let has_default = match pdn_context(ue, pdn_cid) {
        Some(pdn) => pdn.default_ebi.is_some(),
        None => return Err(BearerError::InvalidId(format!("PDN[{}]", pdn_cid))),
    };
    if is_default && has_default {
        return Err(BearerError::InvalidId(format!(
            "PDN[{}] already has a default bearer",
            pdn_cid
        )));
    }

    let idx = match requested_ebi {
        Some(ebi) => {
            let idx = ebi_to_index(ebi).ok_or_else(|| BearerError::InvalidId(format!("EBI[{}]", ebi)))?;
            if ue.bearers[idx].is_some() {
                return Err(BearerError::InvalidId(format!("EBI[{}] in use", ebi)));
            }
            idx
        }
        None => ue
            .bearers
            .iter()
            .position(|b| b.is_none())
            .ok_or(BearerError::CapacityExceeded)?,
    };
    let ebi = index_to_ebi(idx);

    ue.bearers[idx] = Some(BearerContext {
        ebi,
        pdn_cid,
        is_default,
        ..Default::default()
    });
    if let Some(pdn) = pdn_context_mut(ue, pdn_cid) {
        pdn.ebis.push(ebi);
        if is_default {
            pdn.default_ebi = Some(ebi);
        }
    }
    log::debug!(
        "[{}] EBI[{}] created on PDN[{}]{}",
        ue.mme_ue_s1ap_id,
        ebi,
        pdn_cid,
        if is_default { " (default)" } else { "" }
    );
    Ok(ebi)
}

pub fn get_bearer_context(ue: &UeContext, ebi: Ebi) -> Option<&BearerContext> {
    ebi_to_index(ebi).and_then(|idx| ue.bearers[idx].as_ref())
}

pub fn get_bearer_context_mut(ue: &mut UeContext, ebi: Ebi) -> Option<&mut BearerContext> {
    ebi_to_index(ebi).and_then(|idx| ue.bearers[idx].as_mut())
}

/// Free a bearer. Freeing a default bearer tears down its whole PDN.
pub fn free_bearer_context(ue: &mut UeContext, ebi: Ebi) -> Result<(), BearerError> {
    let (pdn_cid, is_default) = match get_bearer_context(ue, ebi) {
        Some(bearer) => (bearer.pdn_cid, bearer.is_default),
        None => return Err(BearerError::InvalidId(format!("EBI[{}]", ebi))),
    };
    if pdn_context(ue, pdn_cid).is_none() {
        log::error!("[{}] EBI[{}] refers to missing PDN[{}]", ue.mme_ue_s1ap_id, ebi, pdn_cid);
        return Err(BearerError::InvalidId(format!("PDN[{}]", pdn_cid)));
    }

    if is_default {
        return free_pdn_context(ue, pdn_cid);
    }

    if let Some(idx) = ebi_to_index(ebi) {
        ue.bearers[idx] = None;
    }
    if let Some(pdn) = pdn_context_mut(ue, pdn_cid) {
        pdn.ebis.retain(|e| *e != ebi);
    }
    log::debug!("[{}] EBI[{}] freed", ue.mme_ue_s1ap_id, ebi);
    Ok(())
}

pub fn active_bearer_count(ue: &UeContext) -> usize {
    ue.bearers.iter().flatten().count()
}

/// EBIs owned by a PDN, ascending
pub fn bearers_of_pdn(ue: &UeContext, cid: PdnCid) -> Vec<Ebi> {
    ue.bearers
        .iter()
        .flatten()
        .filter(|b| b.pdn_cid == cid)
        .map(|b| b.ebi)
        .collect()
}

pub fn all_ebis(ue: &UeContext) -> Vec<Ebi> {
    ue.bearers.iter().flatten().map(|b| b.ebi).collect()
}

/// Free every PDN and bearer of the UE
pub fn free_all(ue: &mut UeContext) {
    for slot in ue.bearers.iter_mut() {
        *slot = None;
    }
    for slot in ue.pdns.iter_mut() {
        *slot = None;
    }
}
