use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::context::Context;
use crate::core::demand::{self, Demand, SubscriptionCell, WorkInProgress, UNBOUNDED};
use crate::core::registry::{Handle, Registry};
use crate::core::traits::{Consumer, Processor, Producer, Sink, Subscription};
use crate::error::Error;
use crate::hooks;
use crate::processors::{FirstContext, Terminal};

struct Node<T> {
    value: Option<T>,
    time: Instant,
    next: OnceLock<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            value,
            time: Instant::now(),
            next: OnceLock::new(),
        })
    }
}

impl<T> Drop for Node<T> {
    // unlink iteratively so long histories do not overflow the stack
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Retained values. `head` is the node *before* the oldest retained value.
struct History<T> {
    head: Arc<Node<T>>,
    tail: Arc<Node<T>>,
    size: usize,
}

/// Replays retained history to every new subscriber, then continues live.
///
/// History is bounded by count, age, or both. Eviction drops the oldest value;
/// a subscriber that is still replaying an evicted value keeps walking forward
/// from it. After termination, new subscribers receive the retained history
/// followed by the terminal signal.
///
/// Ages are measured with [`tokio::time::Instant`], so a paused test clock
/// controls eviction.
///
/// # Examples
///
/// ```rust
/// use fluxweld::core::{Producer, Sink};
/// use fluxweld::processors::ReplayProcessor;
/// use fluxweld::testing::TestConsumer;
///
/// let processor = ReplayProcessor::create(2);
/// processor.next(1);
/// processor.next(2);
/// processor.next(3);
///
/// let late = TestConsumer::new();
/// processor.subscribe(late.clone());
/// assert_eq!(late.values(), vec![2, 3]);
/// ```
pub struct ReplayProcessor<T> {
    inner: Arc<ReplayInner<T>>,
}

struct ReplayInner<T> {
    history: Mutex<History<T>>,
    limit: usize,
    max_age: Option<Duration>,
    subscribers: Registry<ReplaySubscription<T>>,
    terminal: Terminal,
    upstream: SubscriptionCell,
    context: FirstContext,
}

struct ReplaySubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    demand: Demand,
    wip: WorkInProgress,
    cancelled: AtomicBool,
    done: AtomicBool,
    /// Last node delivered.
    node: Mutex<Arc<Node<T>>>,
    handle: OnceLock<Handle>,
    parent: Weak<ReplayInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> ReplaySubscription<T> {
    fn drain(&self, parent: &ReplayInner<T>) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
                return;
            }
            let requested = self.demand.get();
            let mut emitted = 0u64;
            let mut node = self.node.lock().clone();
            while emitted != requested {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let Some(next) = node.next.get().cloned() else {
                    break;
                };
                if let Some(value) = next.value.clone() {
                    self.actual.on_next(value);
                }
                node = next;
                emitted += 1;
            }
            *self.node.lock() = node.clone();

            let terminated = parent.terminal.is_set();
            if terminated && node.next.get().is_none() {
                self.done.store(true, Ordering::Release);
                if let Some(handle) = self.handle.get() {
                    parent.subscribers.remove(*handle);
                }
                parent.terminal.deliver(&*self.actual);
                return;
            }
            if emitted != 0 && requested != UNBOUNDED {
                self.demand.produced(emitted);
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: u64) {
        if !demand::validate(n) {
            return;
        }
        self.demand.add(n);
        if let Some(parent) = self.parent.upgrade() {
            self.drain(&parent);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(parent), Some(handle)) = (self.parent.upgrade(), self.handle.get()) {
            parent.subscribers.remove(*handle);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ReplayInner<T> {
    fn evict(&self, history: &mut History<T>) {
        while history.size > self.limit {
            let Some(next) = history.head.next.get().cloned() else {
                break;
            };
            history.head = next;
            history.size -= 1;
        }
        if let Some(max_age) = self.max_age {
            let now = Instant::now();
            while let Some(next) = history.head.next.get().cloned() {
                if now.duration_since(next.time) <= max_age {
                    break;
                }
                history.head = next;
                history.size -= 1;
            }
        }
    }

    fn add(&self, value: T) {
        let mut history = self.history.lock();
        let node = Node::new(Some(value));
        if history.tail.next.set(node.clone()).is_err() {
            debug_assert!(false, "replay tail already linked");
        }
        history.tail = node;
        history.size += 1;
        self.evict(&mut history);
    }

    fn replay_start(&self) -> Arc<Node<T>> {
        let mut history = self.history.lock();
        self.evict(&mut history);
        history.head.clone()
    }

    fn drain_all(&self) {
        for (_, subscriber) in self.subscribers.snapshot().iter() {
            subscriber.drain(self);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ReplayProcessor<T> {
    fn with_bounds(limit: usize, max_age: Option<Duration>) -> Self {
        let sentinel = Node::new(None);
        Self {
            inner: Arc::new(ReplayInner {
                history: Mutex::new(History {
                    head: sentinel.clone(),
                    tail: sentinel,
                    size: 0,
                }),
                limit: limit.max(1),
                max_age,
                subscribers: Registry::new(),
                terminal: Terminal::default(),
                upstream: SubscriptionCell::new(),
                context: FirstContext::default(),
            }),
        }
    }

    /// Retain the last `history` values.
    pub fn create(history: usize) -> Self {
        Self::with_bounds(history, None)
    }

    /// Retain everything.
    pub fn unbounded() -> Self {
        Self::with_bounds(usize::MAX, None)
    }

    /// Retain only the latest value.
    pub fn cache_last() -> Self {
        Self::with_bounds(1, None)
    }

    /// Retain values younger than `max_age`.
    pub fn create_timeout(max_age: Duration) -> Self {
        Self::with_bounds(usize::MAX, Some(max_age))
    }

    /// Retain at most `size` values, each younger than `max_age`.
    pub fn create_size_and_timeout(size: usize, max_age: Duration) -> Self {
        Self::with_bounds(size, Some(max_age))
    }

    /// Number of values currently retained.
    pub fn history_len(&self) -> usize {
        let mut history = self.inner.history.lock();
        self.inner.evict(&mut history);
        history.size
    }
}

impl<T> Clone for ReplayProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for ReplayProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.inner.context.record(&*consumer);
        let subscription = Arc::new(ReplaySubscription {
            actual: consumer.clone(),
            demand: Demand::new(),
            wip: WorkInProgress::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            node: Mutex::new(self.inner.replay_start()),
            handle: OnceLock::new(),
            parent: Arc::downgrade(&self.inner),
        });
        consumer.on_subscribe(subscription.clone());
        if let Some(handle) = self.inner.subscribers.add(subscription.clone()) {
            let _ = subscription.handle.set(handle);
            if subscription.cancelled.load(Ordering::Acquire) {
                self.inner.subscribers.remove(handle);
                return subscription;
            }
        }
        subscription.drain(&self.inner);
        subscription
    }
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for ReplayProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.inner.terminal.is_set() {
            subscription.cancel();
            return;
        }
        if self.inner.upstream.set(subscription) {
            self.inner.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.inner.terminal.is_set() {
            hooks::next_dropped(value);
            return;
        }
        self.inner.add(value);
        self.inner.drain_all();
    }

    fn on_error(&self, error: Error) {
        if !self.inner.terminal.set(Some(error.clone())) {
            hooks::error_dropped(error);
            return;
        }
        tracing::debug!(%error, "replay processor terminated");
        self.inner.drain_all();
    }

    fn on_complete(&self) {
        if self.inner.terminal.set(None) {
            tracing::debug!("replay processor completed");
            self.inner.drain_all();
        }
    }

    fn current_context(&self) -> Context {
        self.inner.context.get()
    }
}

impl<T: Clone + Send + Sync + 'static> Sink<T> for ReplayProcessor<T> {
    fn next(&self, value: T) {
        self.on_next(value);
    }

    fn error(&self, error: Error) {
        self.on_error(error);
    }

    fn complete(&self) {
        self.on_complete();
    }
}

impl<T: Clone + Send + Sync + 'static> Processor<T> for ReplayProcessor<T> {
    fn is_terminated(&self) -> bool {
        self.inner.terminal.is_set()
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn terminal_error(&self) -> Option<Error> {
        self.inner.terminal.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn test_late_subscriber_after_completion_gets_history_then_terminal() {
        let processor = ReplayProcessor::unbounded();
        for i in 0..3 {
            processor.next(i);
        }
        processor.complete();

        let probe = TestConsumer::with_request(2);
        processor.subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0, 1]);
        assert_eq!(probe.completions(), 0);
        probe.request(1);
        assert_eq!(probe.values(), vec![0, 1, 2]);
        assert_eq!(probe.completions(), 1);
    }

    #[test]
    fn test_evicted_node_still_leads_forward() {
        let processor = ReplayProcessor::create(1);
        processor.next("a");
        let slow = TestConsumer::with_request(0);
        processor.subscribe(slow.clone());
        processor.next("b");
        processor.next("c");
        assert_eq!(processor.history_len(), 1);

        slow.request(10);
        assert_eq!(slow.values(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cache_last() {
        let processor = ReplayProcessor::cache_last();
        processor.next(1);
        processor.next(2);
        let probe = TestConsumer::new();
        processor.subscribe(probe.clone());
        processor.next(3);
        assert_eq!(probe.values(), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_eviction() {
        let processor = ReplayProcessor::create_timeout(Duration::from_millis(100));
        processor.next(1);
        tokio::time::advance(Duration::from_millis(60)).await;
        processor.next(2);
        tokio::time::advance(Duration::from_millis(60)).await;

        let probe = TestConsumer::new();
        processor.subscribe(probe.clone());
        assert_eq!(probe.values(), vec![2]);
    }
}
