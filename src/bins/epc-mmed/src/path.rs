//! Peer Paths
//!
//! Outbound dispatch towards the peer tasks. The core never blocks on a peer:
//! a message is allocated, filled and handed to the sink fire-and-forget.
//! A failed allocation abandons the current step before anything is sent.

use std::fmt;

use crate::bearer::PdnContext;
use crate::context::UeContext;
use crate::error::{MmeError, MmeResult};
use crate::nas_build::NasMessage;
use crate::s11_build::{GtpXact, S11Message};
use crate::s1ap_build::{self, S1apMessage};
use crate::s6a_build::S6aMessage;
use crate::sgsap_build::SgsapMessage;

/// Peer task a message is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerTask {
    /// eNB (S1AP, carries NAS)
    S1ap,
    /// SGW/PGW over S11
    Spgw,
    /// SGW over S8 (home-routed PDNs)
    SgwS8,
    /// HSS over S6a
    S6a,
    /// MSC/VLR over SGs
    Sgs,
}

impl fmt::Display for PeerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerTask::S1ap => write!(f, "S1AP"),
            PeerTask::Spgw => write!(f, "SPGW"),
            PeerTask::SgwS8 => write!(f, "SGW_S8"),
            PeerTask::S6a => write!(f, "S6A"),
            PeerTask::Sgs => write!(f, "SGS"),
        }
    }
}

/// Opaque handle to an allocated outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTicket {
    pub dest: PeerTask,
    pub id: u64,
}

/// Message handed to a peer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    S1ap(S1apMessage),
    S11(GtpXact),
    S6a(S6aMessage),
    Sgsap(SgsapMessage),
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::S1ap(m) => m.name(),
            OutboundMessage::S11(x) => x.message.name(),
            OutboundMessage::S6a(m) => m.name(),
            OutboundMessage::Sgsap(m) => m.name(),
        }
    }
}

/// Dispatch interface towards the peer tasks
pub trait PeerSink: Send + Sync {
    /// Allocate a message for `dest`. `None` means out of memory.
    fn allocate(&self, dest: PeerTask, kind: &'static str) -> Option<MessageTicket>;

    /// Hand an allocated message to its peer task
    fn send_to_peer(&self, ticket: MessageTicket, msg: OutboundMessage);
}

fn send(sink: &dyn PeerSink, dest: PeerTask, msg: OutboundMessage) -> MmeResult<()> {
    let kind = msg.name();
    let ticket = match sink.allocate(dest, kind) {
        Some(ticket) => ticket,
        None => {
            log::error!("Cannot allocate {} towards {}", kind, dest);
            return Err(MmeError::AllocationFailed(dest));
        }
    };
    log::debug!("[{}] {}", dest, kind);
    sink.send_to_peer(ticket, msg);
    Ok(())
}

// ============================================================================
// Send Functions
// ============================================================================

pub fn send_to_enb(sink: &dyn PeerSink, msg: S1apMessage) -> MmeResult<()> {
    send(sink, PeerTask::S1ap, OutboundMessage::S1ap(msg))
}

/// Downlink NAS Transport to the UE's current eNB
pub fn send_downlink_nas(sink: &dyn PeerSink, ue: &UeContext, nas: NasMessage) -> MmeResult<()> {
    log::debug!("[{}] {}", ue.mme_ue_s1ap_id, nas.name());
    let msg = s1ap_build::build_downlink_nas_transport(ue, nas)?;
    send_to_enb(sink, msg)
}

/// S11 message for `pdn`, routed to the S8 task for home-routed PDNs
pub fn send_to_sgw(
    sink: &dyn PeerSink,
    pdn: &PdnContext,
    seq: u32,
    message: S11Message,
) -> MmeResult<()> {
    let dest = if pdn.route_to_s8 {
        PeerTask::SgwS8
    } else {
        PeerTask::Spgw
    };
    send(sink, dest, OutboundMessage::S11(GtpXact { seq, message }))
}

/// S11 message not tied to a PDN context (responses to unknown TEIDs)
pub fn send_to_spgw(sink: &dyn PeerSink, seq: u32, message: S11Message) -> MmeResult<()> {
    send(sink, PeerTask::Spgw, OutboundMessage::S11(GtpXact { seq, message }))
}

pub fn send_to_hss(sink: &dyn PeerSink, msg: S6aMessage) -> MmeResult<()> {
    send(sink, PeerTask::S6a, OutboundMessage::S6a(msg))
}

pub fn send_to_vlr(sink: &dyn PeerSink, msg: SgsapMessage) -> MmeResult<()> {
    send(sink, PeerTask::Sgs, OutboundMessage::Sgsap(msg))
}

// ============================================================================
// Logging Sink
// ============================================================================

/// Sink used by the daemon when no transport is attached: logs every message
#[derive(Debug, Default)]
pub struct LogSink {
    next_id: std::sync::atomic::AtomicU64,
}

impl PeerSink for LogSink {
    fn allocate(&self, dest: PeerTask, _kind: &'static str) -> Option<MessageTicket> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Some(MessageTicket { dest, id })
    }

    fn send_to_peer(&self, ticket: MessageTicket, msg: OutboundMessage) {
        log::info!("[{}] #{} {:?}", ticket.dest, ticket.id, msg);
    }
}
