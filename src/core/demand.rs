//! Demand accounting primitives.
//!
//! Every producer in the crate is built from the same few pieces: a saturating
//! [`Demand`] counter, a [`WorkInProgress`] counter that serialises drain loops
//! without locks, and a [`SubscriptionCell`] holding the single upstream link.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::traits::{Consumer, Subscription};
use crate::error::Error;
use crate::hooks;

/// Demand value meaning "no limit". Once reached it is never decremented.
pub const UNBOUNDED: u64 = u64::MAX;

/// Saturating addition of two demand amounts.
#[inline]
pub fn add_cap(a: u64, b: u64) -> u64 {
    a.saturating_add(b)
}

/// Validates a request amount.
///
/// A zero request breaks the protocol; it is reported through the dropped-error
/// hook and must then be ignored by the caller.
#[inline]
pub fn validate(n: u64) -> bool {
    if n == 0 {
        hooks::error_dropped(Error::InvalidRequest(n));
        return false;
    }
    true
}

/// Lock-free saturating demand counter.
#[derive(Debug, Default)]
pub struct Demand {
    requested: AtomicU64,
}

impl Demand {
    /// Create a counter with no demand.
    pub const fn new() -> Self {
        Self {
            requested: AtomicU64::new(0),
        }
    }

    /// Add `n` to the outstanding demand, returning the previous value.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = add_cap(current, n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record that `n` items were emitted, returning the remaining demand.
    ///
    /// Producing more than was requested is a bookkeeping defect in the caller.
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            debug_assert!(n <= current, "produced {n} with only {current} requested");
            let next = current.saturating_sub(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Consume one unit of demand if any is available.
    pub fn try_take_one(&self) -> bool {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.requested.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current outstanding demand.
    #[inline]
    pub fn get(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// True once demand saturated to [`UNBOUNDED`].
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}

/// Missed-work counter used to serialise drain loops.
///
/// The caller that moves the counter from zero owns the drain; everybody else
/// just records that the state changed and leaves.
#[derive(Debug, Default)]
pub struct WorkInProgress {
    wip: AtomicUsize,
}

impl WorkInProgress {
    pub const fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
        }
    }

    /// Returns true if the caller now owns the drain loop.
    #[inline]
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Acknowledge `missed` rounds; returns the rounds that arrived meanwhile.
    /// The owner must loop again while the result is non-zero.
    #[inline]
    pub fn leave(&self, missed: usize) -> usize {
        self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
    }
}

/// A subscription that does nothing. Handed out with immediate terminal signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Complete a consumer immediately with no items.
pub fn complete<T>(consumer: &dyn Consumer<T>) -> Arc<dyn Subscription> {
    let subscription: Arc<dyn Subscription> = Arc::new(EmptySubscription);
    consumer.on_subscribe(subscription.clone());
    consumer.on_complete();
    subscription
}

/// Fail a consumer immediately, as when a subscription attempt is refused.
pub fn reject<T>(consumer: &dyn Consumer<T>, error: Error) -> Arc<dyn Subscription> {
    let subscription: Arc<dyn Subscription> = Arc::new(EmptySubscription);
    consumer.on_subscribe(subscription.clone());
    consumer.on_error(error);
    subscription
}

#[derive(Default)]
struct CellState {
    upstream: Option<Arc<dyn Subscription>>,
    deferred: u64,
}

/// Set-once holder for an upstream subscription.
///
/// Requests issued before the upstream arrives are accumulated and forwarded
/// when it is set. Cancellation is sticky: an upstream arriving after `cancel`
/// is cancelled on the spot.
#[derive(Default)]
pub struct SubscriptionCell {
    state: Mutex<CellState>,
    cancelled: AtomicBool,
}

impl SubscriptionCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the upstream. Returns false (and cancels `upstream`) if the cell
    /// was already set or cancelled.
    pub fn set(&self, upstream: Arc<dyn Subscription>) -> bool {
        let deferred = {
            let mut state = self.state.lock();
            if self.cancelled.load(Ordering::Acquire) {
                None
            } else if state.upstream.is_some() {
                drop(state);
                tracing::warn!("duplicate on_subscribe, cancelling the newcomer");
                upstream.cancel();
                return false;
            } else {
                state.upstream = Some(upstream.clone());
                Some(std::mem::take(&mut state.deferred))
            }
        };
        match deferred {
            None => {
                upstream.cancel();
                false
            }
            Some(0) => true,
            Some(n) => {
                upstream.request(n);
                true
            }
        }
    }

    /// Request from the upstream, or remember the amount until it arrives.
    pub fn request(&self, n: u64) {
        if !validate(n) {
            return;
        }
        let upstream = {
            let mut state = self.state.lock();
            match &state.upstream {
                Some(upstream) => upstream.clone(),
                None => {
                    state.deferred = add_cap(state.deferred, n);
                    return;
                }
            }
        };
        upstream.request(n);
    }

    /// Cancel the upstream (now or on arrival). Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = self.state.lock().upstream.take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once an upstream has been installed.
    pub fn is_set(&self) -> bool {
        self.state.lock().upstream.is_some()
    }
}

impl Subscription for SubscriptionCell {
    fn request(&self, n: u64) {
        SubscriptionCell::request(self, n)
    }

    fn cancel(&self) {
        SubscriptionCell::cancel(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for Recording {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_demand_saturates_to_unbounded() {
        let demand = Demand::new();
        demand.add(u64::MAX - 1);
        demand.add(10);
        assert!(demand.is_unbounded());
        assert_eq!(demand.produced(1_000), UNBOUNDED);
        assert!(demand.try_take_one());
    }

    #[test]
    fn test_demand_take_and_produce() {
        let demand = Demand::new();
        assert!(!demand.try_take_one());
        assert_eq!(demand.add(3), 0);
        assert!(demand.try_take_one());
        assert_eq!(demand.produced(2), 0);
        assert!(!demand.try_take_one());
    }

    #[test]
    fn test_work_in_progress_serialises() {
        let wip = WorkInProgress::new();
        assert!(wip.enter());
        assert!(!wip.enter());
        assert!(!wip.enter());
        // owner saw one round, two arrived meanwhile
        let missed = wip.leave(1);
        assert_eq!(missed, 2);
        assert_eq!(wip.leave(missed), 0);
        assert!(wip.enter());
    }

    #[test]
    fn test_cell_forwards_deferred_requests() {
        let cell = SubscriptionCell::new();
        cell.request(2);
        cell.request(3);
        let upstream = Arc::new(Recording::default());
        assert!(cell.set(upstream.clone()));
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 5);
        cell.request(1);
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cell_cancels_late_and_duplicate_upstreams() {
        let cell = SubscriptionCell::new();
        let first = Arc::new(Recording::default());
        let second = Arc::new(Recording::default());
        assert!(cell.set(first.clone()));
        assert!(!cell.set(second.clone()));
        assert!(second.cancelled.load(Ordering::SeqCst));

        cell.cancel();
        assert!(first.cancelled.load(Ordering::SeqCst));

        let late = Arc::new(Recording::default());
        assert!(!cell.set(late.clone()));
        assert!(late.cancelled.load(Ordering::SeqCst));
    }
}
