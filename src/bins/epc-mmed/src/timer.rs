//! MME Timers
//!
//! Timer kinds and the UE-owned timer set. Procedure-owned timers (T3450,
//! T3460, T3470, T3422, S11 bearer guard) live in the procedure records.

use std::fmt;
use std::time::Duration;

use epc_timer::{TimerHandle, TimerMgr};

use crate::config::TimerConfig;
use crate::context::MmeUeS1apId;

/// MME Timer IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmeTimerId {
    /// T3450 - Attach accept retransmission
    T3450,
    /// T3460 - Authentication / security mode command retransmission
    T3460,
    /// T3470 - Identity request retransmission
    T3470,
    /// T3422 - Network-initiated detach request retransmission
    T3422,
    /// Guard on outstanding dedicated bearer confirmations
    S11BearerGuard,
    /// Paging response
    PagingResponse,
    /// Initial context setup response
    IcsResponse,
    /// Mobile reachable timer
    MobileReachable,
    /// Implicit detach timer
    ImplicitDetach,
}

impl fmt::Display for MmeTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmeTimerId::T3450 => write!(f, "T3450"),
            MmeTimerId::T3460 => write!(f, "T3460"),
            MmeTimerId::T3470 => write!(f, "T3470"),
            MmeTimerId::T3422 => write!(f, "T3422"),
            MmeTimerId::S11BearerGuard => write!(f, "S11_BEARER_GUARD"),
            MmeTimerId::PagingResponse => write!(f, "PAGING_RESPONSE"),
            MmeTimerId::IcsResponse => write!(f, "ICS_RESPONSE"),
            MmeTimerId::MobileReachable => write!(f, "MOBILE_REACHABLE"),
            MmeTimerId::ImplicitDetach => write!(f, "IMPLICIT_DETACH"),
        }
    }
}

impl MmeTimerId {
    /// Configured duration of this timer kind
    pub fn duration(&self, cfg: &TimerConfig) -> Duration {
        let ms = match self {
            MmeTimerId::T3450 => cfg.t3450_ms,
            MmeTimerId::T3460 => cfg.t3460_ms,
            MmeTimerId::T3470 => cfg.t3470_ms,
            MmeTimerId::T3422 => cfg.t3422_ms,
            MmeTimerId::S11BearerGuard => cfg.s11_bearer_guard_ms,
            MmeTimerId::PagingResponse => cfg.paging_response_ms,
            MmeTimerId::IcsResponse => cfg.ics_response_ms,
            MmeTimerId::MobileReachable => cfg.mobile_reachable_ms,
            MmeTimerId::ImplicitDetach => cfg.implicit_detach_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Timer payload: the callback selector plus the UE it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmeTimer {
    pub id: MmeTimerId,
    pub ue_id: MmeUeS1apId,
}

pub type MmeTimerMgr = TimerMgr<MmeTimer>;
pub type MmeTimerHandle = TimerHandle<MmeTimer>;

/// Timers owned by the UE context
#[derive(Debug, Default)]
pub struct UeTimers {
    pub paging_response: MmeTimerHandle,
    pub ics_response: MmeTimerHandle,
    pub mobile_reachable: MmeTimerHandle,
    pub implicit_detach: MmeTimerHandle,
}

impl UeTimers {
    /// Handle slot for a UE-owned timer kind
    pub fn slot_mut(&mut self, id: MmeTimerId) -> Option<&mut MmeTimerHandle> {
        match id {
            MmeTimerId::PagingResponse => Some(&mut self.paging_response),
            MmeTimerId::IcsResponse => Some(&mut self.ics_response),
            MmeTimerId::MobileReachable => Some(&mut self.mobile_reachable),
            MmeTimerId::ImplicitDetach => Some(&mut self.implicit_detach),
            _ => None,
        }
    }

    /// Take ownership of a fired UE timer and empty its slot. False if
    /// `handle_id` is not the timer currently held in the slot.
    pub fn claim(&mut self, id: MmeTimerId, handle_id: u64) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.matches(handle_id) => {
                slot.stop();
                true
            }
            _ => false,
        }
    }

    pub fn stop_all(&mut self) {
        self.paging_response.stop();
        self.ics_response.stop();
        self.mobile_reachable.stop();
        self.implicit_detach.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_timer_id_display() {
        assert_eq!(MmeTimerId::T3450.to_string(), "T3450");
        assert_eq!(MmeTimerId::S11BearerGuard.to_string(), "S11_BEARER_GUARD");
        assert_eq!(MmeTimerId::MobileReachable.to_string(), "MOBILE_REACHABLE");
    }

    #[test]
    fn test_duration_from_config() {
        let cfg = TimerConfig::default();
        assert_eq!(MmeTimerId::T3450.duration(&cfg), Duration::from_millis(cfg.t3450_ms));
        assert_eq!(
            MmeTimerId::ImplicitDetach.duration(&cfg),
            Duration::from_millis(cfg.implicit_detach_ms)
        );
    }

    #[test]
    fn test_ue_timers_stop_all() {
        let mgr = Arc::new(MmeTimerMgr::new());
        let mut timers = UeTimers::default();
        let ue_id = 7;
        timers.paging_response = mgr.start(
            MmeTimer { id: MmeTimerId::PagingResponse, ue_id },
            Duration::from_secs(5),
        );
        timers.mobile_reachable = mgr.start(
            MmeTimer { id: MmeTimerId::MobileReachable, ue_id },
            Duration::from_secs(5),
        );
        assert_eq!(mgr.count(), 2);

        timers.stop_all();
        assert_eq!(mgr.count(), 0);
        assert!(!timers.paging_response.is_active());
        assert!(timers.slot_mut(MmeTimerId::T3450).is_none());
    }
}
