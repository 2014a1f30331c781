use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connectable::{AutoConnect, RefCount};
use crate::context::Context;
use crate::core::demand::SubscriptionCell;
use crate::core::traits::{Consumer, Processor, Producer, Subscription};
use crate::error::Error;
use crate::processors::{EmitterConfig, EmitterProcessor, ReplayProcessor};
use crate::scheduler::{Disposable, Scheduler};

/// Builds the processor backing each new connection.
pub type ProcessorFactory<T> = dyn Fn() -> Arc<dyn Processor<T>> + Send + Sync;

/// A connectable producer.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use fluxweld::connectable::Multicast;
/// use fluxweld::core::Producer;
/// use fluxweld::scheduler::Disposable;
/// use fluxweld::sources;
/// use fluxweld::testing::TestConsumer;
///
/// let hot = Multicast::publish(Arc::new(sources::range(0..3)), 8);
/// let probe = TestConsumer::new();
/// hot.subscribe(probe.clone());
/// assert!(probe.values().is_empty());
///
/// let connection = hot.connect();
/// assert_eq!(probe.values(), vec![0, 1, 2]);
/// assert_eq!(probe.completions(), 1);
/// connection.dispose();
/// ```
pub struct Multicast<T> {
    inner: Arc<MulticastInner<T>>,
}

struct MulticastInner<T> {
    source: Arc<dyn Producer<T>>,
    factory: Arc<ProcessorFactory<T>>,
    current: Mutex<Option<Arc<ConnectionInner<T>>>>,
}

struct ConnectionInner<T> {
    processor: Arc<dyn Processor<T>>,
    parent: Weak<MulticastInner<T>>,
    upstream: SubscriptionCell,
    connected: AtomicBool,
    terminated: AtomicBool,
    disposed: AtomicBool,
}

impl<T: Send + 'static> ConnectionInner<T> {
    fn is_live(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && !self.terminated.load(Ordering::Acquire)
    }

    /// Forget this connection if it is still the current one.
    fn detach(self: &Arc<Self>) {
        if let Some(parent) = self.parent.upgrade() {
            let mut current = parent.current.lock();
            if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, self)) {
                *current = None;
            }
        }
    }

    fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("multicast disconnected");
        self.upstream.cancel();
        self.detach();
        if !self.terminated.load(Ordering::Acquire) && !self.processor.is_terminated() {
            self.processor.on_error(Error::Disconnected);
        }
    }
}

/// The upstream-facing end of a connection.
struct ConnectionConsumer<T> {
    connection: Arc<ConnectionInner<T>>,
}

impl<T: Send + 'static> ConnectionConsumer<T> {
    fn terminated(&self) {
        self.connection.terminated.store(true, Ordering::Release);
        tracing::debug!("multicast upstream terminated");
    }
}

impl<T: Send + 'static> Consumer<T> for ConnectionConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.connection.upstream.set(subscription.clone()) {
            self.connection.processor.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        self.connection.processor.on_next(value);
    }

    fn on_error(&self, error: Error) {
        self.terminated();
        self.connection.processor.on_error(error);
    }

    fn on_complete(&self) {
        self.terminated();
        self.connection.processor.on_complete();
    }

    fn current_context(&self) -> Context {
        self.connection.processor.current_context()
    }
}

/// Handle to an established connection. Disposing it disconnects.
pub struct Connection<T> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Connection<T> {
    /// True while the upstream has not terminated and the connection was not
    /// disposed.
    pub fn is_active(&self) -> bool {
        self.inner.is_live()
    }

    /// Whether two handles refer to the same connection.
    pub fn same_as(&self, other: &Connection<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Send + 'static> Disposable for Connection<T> {
    fn dispose(&self) {
        self.inner.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Multicast<T> {
    /// Multicast `source` through processors built by `factory`.
    pub fn new<F>(source: Arc<dyn Producer<T>>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Processor<T>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(MulticastInner {
                source,
                factory: Arc::new(factory),
                current: Mutex::new(None),
            }),
        }
    }

    /// Multicast through an [`EmitterProcessor`] requesting `prefetch` at a
    /// time. The processor stays up when its subscribers leave.
    pub fn publish(source: Arc<dyn Producer<T>>, prefetch: usize) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(source, move || {
            Arc::new(EmitterProcessor::with_config(
                EmitterConfig::default().prefetch(prefetch).auto_cancel(false),
            ))
        })
    }

    /// Multicast through a [`ReplayProcessor`] retaining `history` values.
    pub fn replay(source: Arc<dyn Producer<T>>, history: usize) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(source, move || Arc::new(ReplayProcessor::create(history)))
    }

    fn fresh(&self) -> Arc<ConnectionInner<T>> {
        Arc::new(ConnectionInner {
            processor: (self.inner.factory)(),
            parent: Arc::downgrade(&self.inner),
            upstream: SubscriptionCell::new(),
            connected: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// The connection subscribers attach to. A terminated connection keeps
    /// serving late subscribers its terminal state until the next connect.
    fn attachable(&self) -> Arc<ConnectionInner<T>> {
        let mut current = self.inner.current.lock();
        match current.as_ref() {
            Some(connection) if !connection.disposed.load(Ordering::Acquire) => connection.clone(),
            _ => {
                let connection = self.fresh();
                *current = Some(connection.clone());
                connection
            }
        }
    }

    /// Drop a terminated connection so the next subscriber starts a new one.
    pub(crate) fn reset_if_done(&self) {
        let mut current = self.inner.current.lock();
        if current.as_ref().map_or(false, |c| !c.is_live()) {
            *current = None;
        }
    }

    /// Subscribe to the upstream, unless the current connection already did.
    ///
    /// Returns the same connection until it is disposed or its upstream
    /// terminates.
    pub fn connect(&self) -> Connection<T> {
        let connection = {
            let mut current = self.inner.current.lock();
            match current.as_ref() {
                Some(connection) if connection.is_live() => connection.clone(),
                _ => {
                    let connection = self.fresh();
                    *current = Some(connection.clone());
                    connection
                }
            }
        };
        if !connection.connected.swap(true, Ordering::AcqRel) {
            tracing::debug!("multicast connecting upstream");
            self.inner.source.subscribe(Arc::new(ConnectionConsumer {
                connection: connection.clone(),
            }));
        }
        Connection { inner: connection }
    }

    /// True once the current connection subscribed upstream.
    pub fn is_connected(&self) -> bool {
        self.inner
            .current
            .lock()
            .as_ref()
            .map_or(false, |c| c.connected.load(Ordering::Acquire) && c.is_live())
    }

    /// Connect on the `n`-th subscription; `0` connects right away.
    pub fn auto_connect(&self, n: usize) -> AutoConnect<T> {
        AutoConnect::new(self.clone(), n)
    }

    /// Stay connected while at least `n` subscribers are live.
    pub fn ref_count(&self, n: usize) -> RefCount<T> {
        RefCount::new(self.clone(), n, None)
    }

    /// Like [`Multicast::ref_count`], but wait `grace` before disconnecting.
    pub fn ref_count_grace(
        &self,
        n: usize,
        grace: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> RefCount<T> {
        RefCount::new(self.clone(), n, Some((grace, scheduler)))
    }
}

impl<T: Send + 'static> Producer<T> for Multicast<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.attachable().processor.subscribe(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sink;
    use crate::testing::{TestConsumer, TestProducer};

    fn hot() -> (TestProducer<u32>, Multicast<u32>) {
        let upstream = TestProducer::new();
        let multicast = Multicast::publish(Arc::new(upstream.clone()), 16);
        (upstream, multicast)
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (upstream, multicast) = hot();
        let first = multicast.connect();
        let second = multicast.connect();
        assert!(first.same_as(&second));
        assert_eq!(upstream.subscriptions(), 1);
        assert_eq!(upstream.requests(), vec![16]);
    }

    #[test]
    fn test_pending_subscribers_see_nothing_until_connect() {
        let (upstream, multicast) = hot();
        let probe = TestConsumer::new();
        multicast.subscribe(probe.clone());
        upstream.next(1);
        assert_eq!(upstream.subscriptions(), 0);

        multicast.connect();
        upstream.next(2);
        assert_eq!(probe.values(), vec![2]);
    }

    #[test]
    fn test_dispose_fails_attached_and_resets() {
        let (upstream, multicast) = hot();
        let probe = TestConsumer::new();
        multicast.subscribe(probe.clone());
        let connection = multicast.connect();
        connection.dispose();

        assert_eq!(upstream.cancellations(), 1);
        assert!(matches!(probe.error(), Some(Error::Disconnected)));
        assert!(!multicast.is_connected());

        let next = multicast.connect();
        assert!(!next.same_as(&connection));
        assert_eq!(upstream.subscriptions(), 2);
    }

    #[test]
    fn test_upstream_completion_allows_reconnect() {
        let (upstream, multicast) = hot();
        let first = multicast.connect();
        upstream.complete();
        assert!(!first.is_active());

        let late = TestConsumer::new();
        multicast.subscribe(late.clone());
        assert_eq!(late.completions(), 1);

        let second = multicast.connect();
        assert!(second.is_active());
        assert_eq!(upstream.subscriptions(), 2);
    }

    #[test]
    fn test_replay_multicast_serves_history() {
        let upstream = TestProducer::<&str>::new();
        let multicast = Multicast::replay(Arc::new(upstream.clone()), 2);
        multicast.connect();
        upstream.next("a");
        upstream.next("b");
        upstream.next("c");

        let late = TestConsumer::new();
        multicast.subscribe(late.clone());
        assert_eq!(late.values(), vec!["b", "c"]);
    }
}
