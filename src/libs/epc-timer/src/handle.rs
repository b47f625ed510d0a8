//! Owning timer handle
//!
//! A `TimerHandle` is what a context stores for a started timer. The handle
//! holds only a weak reference to the manager, so a context outliving the
//! manager is harmless. Dropping the handle cancels the timer.

use std::fmt;
use std::sync::Weak;

use crate::timer_mgr::TimerMgr;
use crate::TIMER_INACTIVE_ID;

/// Owning reference to a scheduled timer
pub struct TimerHandle<T: Clone + fmt::Debug + Send + Sync + 'static> {
    id: u64,
    mgr: Weak<TimerMgr<T>>,
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> TimerHandle<T> {
    pub(crate) fn new(id: u64, mgr: Weak<TimerMgr<T>>) -> Self {
        Self { id, mgr }
    }

    /// A handle that refers to no timer
    pub fn inactive() -> Self {
        Self {
            id: TIMER_INACTIVE_ID,
            mgr: Weak::new(),
        }
    }

    /// Raw handle id (`TIMER_INACTIVE_ID` when not running)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True while the timer is scheduled and has neither fired nor been stopped
    pub fn is_active(&self) -> bool {
        if self.id == TIMER_INACTIVE_ID {
            return false;
        }
        self.mgr
            .upgrade()
            .map(|mgr| mgr.is_active(self.id))
            .unwrap_or(false)
    }

    /// True if this handle refers to the timer with the given id
    pub fn matches(&self, id: u64) -> bool {
        self.id != TIMER_INACTIVE_ID && self.id == id
    }

    /// Cancel the timer. Safe to call on an inactive or already fired handle.
    pub fn stop(&mut self) {
        if self.id == TIMER_INACTIVE_ID {
            return;
        }
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.cancel(self.id);
        }
        self.id = TIMER_INACTIVE_ID;
        self.mgr = Weak::new();
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Default for TimerHandle<T> {
    fn default() -> Self {
        Self::inactive()
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Drop for TimerHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> fmt::Debug for TimerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == TIMER_INACTIVE_ID {
            write!(f, "TimerHandle(inactive)")
        } else {
            write!(f, "TimerHandle({})", self.id)
        }
    }
}
