use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connectable::{Connection, Multicast};
use crate::context::Context;
use crate::core::traits::{Consumer, Producer, Subscription};
use crate::error::Error;
use crate::scheduler::{Disposable, Scheduler};

/// Keeps a [`Multicast`] connected while at least `n` consumers are live.
///
/// A consumer counts as live from `subscribe` until it cancels or receives a
/// terminal signal. Once the count falls below `n` the connection is disposed,
/// immediately or after the grace period. A grace timer is dropped if the
/// count climbs back to `n` before it fires.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use fluxweld::connectable::Multicast;
/// use fluxweld::core::{Producer, Sink};
/// use fluxweld::testing::{TestConsumer, TestProducer};
///
/// let upstream = TestProducer::<i32>::new();
/// let shared = Multicast::publish(Arc::new(upstream.clone()), 8).ref_count(1);
///
/// let probe = TestConsumer::new();
/// shared.subscribe(probe.clone());
/// upstream.next(1);
/// probe.cancel();
///
/// assert_eq!(probe.values(), vec![1]);
/// assert_eq!(upstream.cancellations(), 1);
/// ```
pub struct RefCount<T> {
    inner: Arc<RefCountInner<T>>,
}

struct RefCountInner<T> {
    source: Multicast<T>,
    min: usize,
    grace: Option<(Duration, Arc<dyn Scheduler>)>,
    state: Mutex<RefState<T>>,
}

struct RefState<T> {
    live: usize,
    connection: Option<Connection<T>>,
    timer: Option<Arc<dyn Disposable>>,
    /// Bumped whenever a pending timer is superseded.
    generation: u64,
}

impl<T: Send + 'static> RefCountInner<T> {
    fn release(self: &Arc<Self>) {
        let expired = {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
            if state.live >= self.min || state.connection.is_none() || state.timer.is_some() {
                None
            } else {
                match &self.grace {
                    None => state.connection.take(),
                    Some((grace, scheduler)) => {
                        state.generation += 1;
                        let generation = state.generation;
                        let inner = self.clone();
                        let timer = scheduler.schedule_after(
                            *grace,
                            Box::new(move || inner.grace_expired(generation)),
                        );
                        tracing::debug!(
                            grace_ms = grace.as_millis() as u64,
                            "ref count below threshold, disconnect scheduled"
                        );
                        state.timer = Some(timer);
                        None
                    }
                }
            }
        };
        if let Some(connection) = expired {
            connection.dispose();
        }
    }

    fn grace_expired(&self, generation: u64) {
        let expired = {
            let mut state = self.state.lock();
            if state.generation != generation || state.live >= self.min {
                return;
            }
            state.timer = None;
            state.connection.take()
        };
        if let Some(connection) = expired {
            tracing::debug!("grace period elapsed, disconnecting");
            connection.dispose();
        }
    }

    /// Count a new consumer. Returns true if the upstream must be connected.
    fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        state.live += 1;
        if state.live < self.min {
            return false;
        }
        if let Some(timer) = state.timer.take() {
            state.generation += 1;
            timer.dispose();
            tracing::debug!("ref count restored, disconnect cancelled");
        }
        match &state.connection {
            Some(connection) if connection.is_active() => false,
            _ => {
                state.connection = None;
                true
            }
        }
    }
}

struct RefCountSubscription<T> {
    upstream: OnceLock<Arc<dyn Subscription>>,
    released: AtomicBool,
    parent: Arc<RefCountInner<T>>,
}

impl<T: Send + 'static> RefCountSubscription<T> {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.parent.release();
        }
    }
}

impl<T: Send + 'static> Subscription for RefCountSubscription<T> {
    fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
        self.release();
    }
}

struct RefCountConsumer<T> {
    actual: Arc<dyn Consumer<T>>,
    subscription: Arc<RefCountSubscription<T>>,
}

impl<T: Send + 'static> Consumer<T> for RefCountConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.subscription.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        self.actual.on_subscribe(self.subscription.clone());
    }

    fn on_next(&self, value: T) {
        self.actual.on_next(value);
    }

    fn on_error(&self, error: Error) {
        self.subscription.release();
        self.actual.on_error(error);
    }

    fn on_complete(&self) {
        self.subscription.release();
        self.actual.on_complete();
    }

    fn current_context(&self) -> Context {
        self.actual.current_context()
    }
}

impl<T> Clone for RefCount<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> RefCount<T> {
    pub(crate) fn new(
        source: Multicast<T>,
        n: usize,
        grace: Option<(Duration, Arc<dyn Scheduler>)>,
    ) -> Self {
        Self {
            inner: Arc::new(RefCountInner {
                source,
                min: n.max(1),
                grace,
                state: Mutex::new(RefState {
                    live: 0,
                    connection: None,
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Consumers currently counted.
    pub fn live(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .connection
            .as_ref()
            .map_or(false, |c| c.is_active())
    }
}

impl<T: Send + 'static> Producer<T> for RefCount<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let inner = &self.inner;
        if inner.state.lock().connection.is_none() {
            inner.source.reset_if_done();
        }
        let subscription = Arc::new(RefCountSubscription {
            upstream: OnceLock::new(),
            released: AtomicBool::new(false),
            parent: inner.clone(),
        });
        let must_connect = inner.acquire();
        inner.source.subscribe(Arc::new(RefCountConsumer {
            actual: consumer,
            subscription: subscription.clone(),
        }));
        if must_connect && !subscription.released.load(Ordering::Acquire) {
            let connection = inner.source.connect();
            let mut state = inner.state.lock();
            if state.connection.is_none() {
                state.connection = Some(connection);
            }
        }
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sink;
    use crate::scheduler::TokioScheduler;
    use crate::testing::{TestConsumer, TestProducer};

    fn shared(n: usize) -> (TestProducer<u32>, RefCount<u32>) {
        let upstream = TestProducer::new();
        let shared = Multicast::publish(Arc::new(upstream.clone()), 8).ref_count(n);
        (upstream, shared)
    }

    #[test]
    fn test_connects_at_threshold_and_disconnects_below() {
        let (upstream, shared) = shared(2);
        let a = TestConsumer::new();
        let b = TestConsumer::new();
        shared.subscribe(a.clone());
        assert_eq!(upstream.subscriptions(), 0);
        shared.subscribe(b.clone());
        assert_eq!(upstream.subscriptions(), 1);
        assert!(shared.is_connected());

        upstream.next(1);
        b.cancel();
        assert_eq!(upstream.cancellations(), 1);
        assert!(!shared.is_connected());
        assert!(matches!(a.error(), Some(Error::Disconnected)));
        assert_eq!(shared.live(), 0);
    }

    #[test]
    fn test_reconnects_after_full_release() {
        let (upstream, shared) = shared(1);
        let first = TestConsumer::new();
        shared.subscribe(first.clone());
        first.cancel();

        let second = TestConsumer::new();
        shared.subscribe(second.clone());
        assert_eq!(upstream.subscriptions(), 2);
        upstream.next(9);
        assert_eq!(second.values(), vec![9]);
    }

    #[test]
    fn test_upstream_completion_releases_and_reconnects() {
        let (upstream, shared) = shared(1);
        let first = TestConsumer::new();
        shared.subscribe(first.clone());
        upstream.complete();
        assert_eq!(first.completions(), 1);
        assert_eq!(shared.live(), 0);

        let second = TestConsumer::new();
        shared.subscribe(second.clone());
        assert_eq!(upstream.subscriptions(), 2);
        assert_eq!(second.completions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_cancelled_by_resubscribe() {
        let upstream = TestProducer::<u32>::new();
        let shared = Multicast::publish(Arc::new(upstream.clone()), 8).ref_count_grace(
            1,
            Duration::from_millis(100),
            TokioScheduler::shared().unwrap(),
        );

        let first = TestConsumer::new();
        shared.subscribe(first.clone());
        first.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = TestConsumer::new();
        shared.subscribe(second.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(upstream.subscriptions(), 1);
        assert_eq!(upstream.cancellations(), 0);
        assert!(shared.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_expires() {
        let upstream = TestProducer::<u32>::new();
        let shared = Multicast::publish(Arc::new(upstream.clone()), 8).ref_count_grace(
            1,
            Duration::from_millis(100),
            TokioScheduler::shared().unwrap(),
        );
        let probe = TestConsumer::new();
        shared.subscribe(probe.clone());
        probe.cancel();
        assert!(shared.is_connected());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!shared.is_connected());
        assert_eq!(upstream.cancellations(), 1);
    }
}
