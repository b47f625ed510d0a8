//! EPCCore Timer Library
//!
//! Timer manager shared by the EPCCore network functions. Timers are polled
//! from the NF event loop rather than fired from a background thread:
//! - `TimerMgr` keeps the pending timers and hands out expired ones
//! - `TimerHandle` is the owning reference a context keeps for a started timer;
//!   dropping it cancels the timer
//! - handle id `TIMER_INACTIVE_ID` is the "not running" sentinel

pub mod handle;
pub mod timer_mgr;

pub use handle::TimerHandle;
pub use timer_mgr::{compute_poll_interval, TimerEntry, TimerMgr};

/// Handle id of a timer that is not running
pub const TIMER_INACTIVE_ID: u64 = 0;
