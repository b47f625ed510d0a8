//! Timer Manager
//!
//! Polled timer store for NF event loops. Supports:
//! - one-shot timers keyed by a monotonically increasing id
//! - cancel by id
//! - draining expired timers so the event loop can dispatch them
//!
//! The payload `T` is the NF-specific timer descriptor, usually an enum of
//! timer kinds plus the correlation argument needed to find the owner again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::handle::TimerHandle;
use crate::TIMER_INACTIVE_ID;

// ============================================================================
// Timer Types
// ============================================================================

/// A pending timer
#[derive(Debug, Clone)]
pub struct TimerEntry<T: Clone + fmt::Debug> {
    /// Handle id
    pub id: u64,
    /// NF-specific payload handed back on expiry
    pub kind: T,
    /// Absolute expiration time
    pub expires_at: Instant,
    /// Timer duration
    pub duration: Duration,
}

impl<T: Clone + fmt::Debug> TimerEntry<T> {
    fn new(id: u64, kind: T, duration: Duration) -> Self {
        Self {
            id,
            kind,
            expires_at: Instant::now() + duration,
            duration,
        }
    }

    /// Check if the timer has expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Get remaining time until expiration
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

// ============================================================================
// Timer Manager
// ============================================================================

/// Generic timer manager that works with any NF's timer payload.
///
/// # Usage
///
/// ```ignore
/// use std::sync::Arc;
/// use epc_timer::TimerMgr;
///
/// let mgr = Arc::new(TimerMgr::<MyTimer>::new());
///
/// // The handle owns the timer: dropping it cancels the timer
/// let handle = mgr.start(MyTimer::Guard, Duration::from_secs(6));
///
/// // In the event loop, poll for expired timers
/// for entry in mgr.process_expired() {
///     // Dispatch entry.kind to the state machine
/// }
/// ```
pub struct TimerMgr<T: Clone + fmt::Debug + Send + Sync + 'static> {
    /// Pending timers indexed by handle id
    timers: RwLock<HashMap<u64, TimerEntry<T>>>,
    /// Next handle id; zero is reserved for the inactive sentinel
    next_id: AtomicU64,
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> TimerMgr<T> {
    /// Create a new timer manager
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(TIMER_INACTIVE_ID + 1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, TimerEntry<T>>> {
        self.timers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, TimerEntry<T>>> {
        self.timers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a one-shot timer and return the owning handle.
    pub fn start(self: &Arc<Self>, kind: T, duration: Duration) -> TimerHandle<T> {
        let id = self.schedule(kind, duration);
        TimerHandle::new(id, Arc::downgrade(self))
    }

    fn schedule(&self, kind: T, duration: Duration) -> u64 {
        let mut id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id == TIMER_INACTIVE_ID {
            id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        log::debug!("Timer started: id={id} kind={kind:?} duration={duration:?}");
        self.write().insert(id, TimerEntry::new(id, kind, duration));
        id
    }

    /// Cancel a timer by id. Returns true if the timer was pending.
    pub fn cancel(&self, id: u64) -> bool {
        if id == TIMER_INACTIVE_ID {
            return false;
        }
        match self.write().remove(&id) {
            Some(entry) => {
                log::debug!("Timer cancelled: id={} kind={:?}", id, entry.kind);
                true
            }
            None => false,
        }
    }

    /// Drain all expired timers, ordered by expiration time. Fired timers
    /// are removed from the manager.
    pub fn process_expired(&self) -> Vec<TimerEntry<T>> {
        let mut timers = self.write();
        let fired: Vec<u64> = timers
            .values()
            .filter(|e| e.is_expired())
            .map(|e| e.id)
            .collect();
        let mut expired: Vec<_> = fired.iter().filter_map(|id| timers.remove(id)).collect();
        expired.sort_by_key(|e| e.expires_at);
        expired
    }

    /// Get the duration until the next timer expires.
    /// Returns `None` if there are no pending timers.
    pub fn next_expiration(&self) -> Option<Duration> {
        self.read().values().map(TimerEntry::remaining).min()
    }

    /// Get the number of pending timers
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Check if a timer is pending
    pub fn is_active(&self, id: u64) -> bool {
        id != TIMER_INACTIVE_ID && self.read().contains_key(&id)
    }

    /// Clear all timers
    pub fn clear(&self) {
        self.write().clear();
        log::debug!("Timer: all timers cleared");
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Default for TimerMgr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> fmt::Debug for TimerMgr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerMgr").field("pending", &self.count()).finish()
    }
}

// ============================================================================
// Helper: compute sleep duration for event loop tick
// ============================================================================

/// Compute the sleep duration for the next event loop iteration.
///
/// Returns the time until the next timer expires, capped at `max_interval`.
/// An already expired timer yields one millisecond to avoid busy-looping.
pub fn compute_poll_interval<T: Clone + fmt::Debug + Send + Sync + 'static>(
    mgr: &TimerMgr<T>,
    max_interval: Duration,
) -> Duration {
    match mgr.next_expiration() {
        Some(next) if next < max_interval => {
            if next.is_zero() {
                Duration::from_millis(1)
            } else {
                next
            }
        }
        _ => max_interval,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestTimer {
        Guard(u32),
        Paging(u32),
    }

    fn mgr() -> Arc<TimerMgr<TestTimer>> {
        Arc::new(TimerMgr::new())
    }

    #[test]
    fn test_timer_mgr_new() {
        let mgr = mgr();
        assert_eq!(mgr.count(), 0);
        assert!(mgr.next_expiration().is_none());
    }

    #[test]
    fn test_schedule_never_returns_sentinel() {
        let mgr = mgr();
        let id = mgr.schedule(TestTimer::Guard(1), Duration::from_secs(1));
        assert_ne!(id, TIMER_INACTIVE_ID);
        assert!(mgr.is_active(id));
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mgr = mgr();
        let id = mgr.schedule(TestTimer::Guard(1), Duration::from_secs(10));
        assert!(mgr.cancel(id));
        assert!(!mgr.is_active(id));
        assert_eq!(mgr.count(), 0);

        // Second cancel is a no-op
        assert!(!mgr.cancel(id));
        assert!(!mgr.cancel(TIMER_INACTIVE_ID));
    }

    #[test]
    fn test_oneshot_timer_expires_once() {
        let mgr = mgr();
        let id = mgr.schedule(TestTimer::Paging(7), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(20));

        let expired = mgr.process_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        assert_eq!(expired[0].kind, TestTimer::Paging(7));
        assert_eq!(mgr.count(), 0);
        assert!(mgr.process_expired().is_empty());
    }

    #[test]
    fn test_compute_poll_interval() {
        let mgr = mgr();
        let max = Duration::from_millis(100);

        assert_eq!(compute_poll_interval(&mgr, max), max);

        mgr.schedule(TestTimer::Guard(1), Duration::from_millis(50));
        let interval = compute_poll_interval(&mgr, max);
        assert!(interval <= Duration::from_millis(50));
        assert!(interval > Duration::ZERO);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(compute_poll_interval(&mgr, max), Duration::from_millis(1));
    }
}
