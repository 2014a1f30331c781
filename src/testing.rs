//! Test tooling.
//!
//! [`TestConsumer`] records every signal it receives and lets a test drive
//! demand by hand. [`TestProducer`] is a hot upstream the test pushes into,
//! counting the subscriptions, requests and cancellations it sees.
//!
//! # Examples
//!
//! ```rust
//! use fluxweld::core::{Producer, Sink};
//! use fluxweld::testing::{TestConsumer, TestProducer};
//!
//! let upstream = TestProducer::<&str>::new();
//! let probe = TestConsumer::with_request(3);
//! upstream.subscribe(probe.clone());
//!
//! upstream.next("a");
//! upstream.complete();
//!
//! assert_eq!(upstream.requests(), vec![3]);
//! assert_eq!(probe.values(), vec!["a"]);
//! assert_eq!(probe.completions(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::demand::{self, UNBOUNDED};
use crate::core::traits::{Consumer, Producer, Sink, Subscription};
use crate::error::{Error, Result};

/// Global order of terminal signals across all test consumers.
static TERMINAL_STAMP: AtomicU64 = AtomicU64::new(1);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A consumer that records what it receives.
///
/// Constructors return an `Arc` so the same probe can be subscribed and then
/// inspected.
pub struct TestConsumer<T> {
    initial_request: u64,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<Error>>,
    completions: AtomicUsize,
    subscriptions: AtomicUsize,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    terminated_at: AtomicU64,
    context: Mutex<Context>,
}

impl<T: Send + 'static> TestConsumer<T> {
    /// A probe that requests unbounded demand on subscription.
    pub fn new() -> Arc<Self> {
        Self::with_request(UNBOUNDED)
    }

    /// A probe that requests `n` on subscription; `0` requests nothing.
    pub fn with_request(n: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_request: n,
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            subscription: Mutex::new(None),
            terminated_at: AtomicU64::new(0),
            context: Mutex::new(Context::empty()),
        })
    }

    /// Report `context` upstream at subscription time.
    pub fn with_context(self: Arc<Self>, context: Context) -> Arc<Self> {
        *self.context.lock() = context;
        self
    }

    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.values.lock().clone()
    }

    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// The first error received.
    pub fn error(&self) -> Option<Error> {
        self.errors.lock().first().cloned()
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// Number of `on_subscribe` calls received.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_at.load(Ordering::SeqCst) != 0
    }

    /// True if this probe saw its terminal signal strictly before `other`.
    pub fn terminated_before<U>(&self, other: &TestConsumer<U>) -> bool {
        let mine = self.terminated_at.load(Ordering::SeqCst);
        let theirs = other.terminated_at.load(Ordering::SeqCst);
        mine != 0 && (theirs == 0 || mine < theirs)
    }

    fn current_subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.lock().clone()
    }

    pub fn request(&self, n: u64) {
        if let Some(subscription) = self.current_subscription() {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        if let Some(subscription) = self.current_subscription() {
            subscription.cancel();
        }
    }

    /// Wait until at least `n` values arrived.
    pub async fn await_values(&self, n: usize, timeout: Duration) -> Result<()> {
        self.await_until(timeout, || self.value_count() >= n).await
    }

    /// Wait until a terminal signal arrived.
    pub async fn await_terminal(&self, timeout: Duration) -> Result<()> {
        self.await_until(timeout, || self.is_terminated()).await
    }

    // Deadline on the wall clock: work on blocking threads does not advance
    // a paused tokio clock.
    async fn await_until(&self, timeout: Duration, done: impl Fn() -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !done() {
            if Instant::now() >= deadline {
                return Err(Error::timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn stamp(&self) {
        let stamp = TERMINAL_STAMP.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .terminated_at
            .compare_exchange(0, stamp, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl<T: Send + 'static> Consumer<T> for TestConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        {
            let mut current = self.subscription.lock();
            if current.is_some() {
                drop(current);
                tracing::warn!("test consumer subscribed twice, cancelling the second subscription");
                subscription.cancel();
                return;
            }
            *current = Some(subscription.clone());
        }
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        self.values.lock().push(value);
    }

    fn on_error(&self, error: Error) {
        self.errors.lock().push(error);
        self.stamp();
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.stamp();
    }

    fn current_context(&self) -> Context {
        self.context.lock().clone()
    }
}

struct TestSubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    parent: Arc<TestProducerInner<T>>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> Subscription for TestSubscription<T> {
    fn request(&self, n: u64) {
        self.parent.requests.lock().push(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.parent.cancellations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct TestProducerInner<T> {
    subscribers: Mutex<Vec<Arc<TestSubscription<T>>>>,
    subscriptions: AtomicUsize,
    cancellations: AtomicUsize,
    requests: Mutex<Vec<u64>>,
}

/// A hot producer driven by the test.
///
/// Signals go to every subscriber that has not cancelled, regardless of the
/// demand it granted, so a test can also play a misbehaving upstream.
pub struct TestProducer<T> {
    inner: Arc<TestProducerInner<T>>,
}

impl<T> Clone for TestProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> TestProducer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TestProducerInner {
                subscribers: Mutex::new(Vec::new()),
                subscriptions: AtomicUsize::new(0),
                cancellations: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of `subscribe` calls so far.
    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of subscriptions that were cancelled.
    pub fn cancellations(&self) -> usize {
        self.inner.cancellations.load(Ordering::SeqCst)
    }

    /// Every `request(n)` received, in order, across subscriptions.
    pub fn requests(&self) -> Vec<u64> {
        self.inner.requests.lock().clone()
    }

    /// Sum of every request, saturating at unbounded.
    pub fn total_requested(&self) -> u64 {
        self.requests()
            .into_iter()
            .fold(0, demand::add_cap)
    }

    /// Subscribers that have not cancelled.
    pub fn active(&self) -> usize {
        self.live().len()
    }

    pub fn has_subscribers(&self) -> bool {
        self.active() > 0
    }

    fn live(&self) -> Vec<Arc<TestSubscription<T>>> {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| !s.cancelled.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    fn finish(&self) -> Vec<Arc<TestSubscription<T>>> {
        std::mem::take(&mut *self.inner.subscribers.lock())
            .into_iter()
            .filter(|s| !s.cancelled.load(Ordering::SeqCst))
            .collect()
    }
}

impl<T: Clone + Send + 'static> Default for TestProducer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Producer<T> for TestProducer<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(TestSubscription {
            actual: consumer.clone(),
            parent: self.inner.clone(),
            cancelled: AtomicBool::new(false),
        });
        self.inner.subscribers.lock().push(subscription.clone());
        consumer.on_subscribe(subscription.clone());
        subscription
    }
}

impl<T: Clone + Send + 'static> Sink<T> for TestProducer<T> {
    fn next(&self, value: T) {
        for subscriber in self.live() {
            subscriber.actual.on_next(value.clone());
        }
    }

    fn error(&self, error: Error) {
        for subscriber in self.finish() {
            subscriber.actual.on_error(error.clone());
        }
    }

    fn complete(&self) {
        for subscriber in self.finish() {
            subscriber.actual.on_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_records_and_orders_terminals() {
        let upstream = TestProducer::<i32>::new();
        let first = TestConsumer::new();
        let second = TestConsumer::with_request(0);
        upstream.subscribe(first.clone());
        upstream.subscribe(second.clone());
        assert_eq!(upstream.requests(), vec![UNBOUNDED]);

        upstream.next(1);
        upstream.complete();
        assert_eq!(first.values(), vec![1]);
        assert!(first.terminated_before(&second) || second.terminated_before(&first));
        assert!(!upstream.has_subscribers());
    }

    #[test]
    fn test_cancel_is_counted_once() {
        let upstream = TestProducer::<u8>::new();
        let probe = TestConsumer::new();
        upstream.subscribe(probe.clone());
        probe.cancel();
        probe.cancel();
        assert_eq!(upstream.cancellations(), 1);
        upstream.next(3);
        assert!(probe.values().is_empty());
    }

    #[tokio::test]
    async fn test_await_times_out() {
        let probe = TestConsumer::<u8>::new();
        let error = tokio_test::assert_err!(probe.await_values(1, Duration::from_millis(20)).await);
        assert!(matches!(error, Error::Timeout { .. }));
    }
}
