use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::context::Context;
use crate::core::demand::{self, Demand, SubscriptionCell, UNBOUNDED};
use crate::core::registry::{Handle, Registry};
use crate::core::traits::{Consumer, Processor, Producer, Sink, Subscription};
use crate::error::Error;
use crate::hooks;
use crate::processors::{FirstContext, Terminal};

/// Broadcasts each value to every subscriber, without buffering.
///
/// A value is only delivered if *every* subscriber has outstanding demand.
/// Otherwise the value is dropped and the processor terminates with
/// `Error::Overflow`, delivered first to the subscribers that lacked demand.
/// Subscribers arriving after termination receive the cached terminal signal.
///
/// # Examples
///
/// ```rust
/// use fluxweld::core::{Processor, Producer, Sink};
/// use fluxweld::processors::DirectProcessor;
/// use fluxweld::testing::TestConsumer;
///
/// let processor = DirectProcessor::new();
/// let probe = TestConsumer::with_request(2);
/// processor.subscribe(probe.clone());
///
/// processor.next(1);
/// processor.next(2);
/// processor.next(3);
///
/// assert_eq!(probe.values(), vec![1, 2]);
/// assert!(probe.error().is_some());
/// assert!(processor.is_terminated());
/// ```
pub struct DirectProcessor<T> {
    inner: Arc<DirectInner<T>>,
}

struct DirectInner<T> {
    subscribers: Registry<DirectSubscription<T>>,
    terminal: Terminal,
    upstream: SubscriptionCell,
    context: FirstContext,
}

struct DirectSubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    demand: Demand,
    cancelled: AtomicBool,
    handle: OnceLock<Handle>,
    parent: Weak<DirectInner<T>>,
}

impl<T> Subscription for DirectSubscription<T>
where
    T: Send + 'static,
{
    fn request(&self, n: u64) {
        if demand::validate(n) {
            self.demand.add(n);
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

impl<T: Clone + Send + Sync + 'static> DirectProcessor<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectInner {
                subscribers: Registry::new(),
                terminal: Terminal::default(),
                upstream: SubscriptionCell::new(),
                context: FirstContext::default(),
            }),
        }
    }

    fn terminate(&self, error: Option<Error>, first: &[Arc<DirectSubscription<T>>]) {
        if !self.inner.terminal.set(error.clone()) {
            if let Some(error) = error {
                hooks::error_dropped(error);
            }
            return;
        }
        tracing::debug!(error = ?error, "direct processor terminated");
        let members = self.inner.subscribers.terminate();
        let (offenders, rest): (Vec<_>, Vec<_>) = members
            .into_iter()
            .partition(|m| first.iter().any(|f| Arc::ptr_eq(f, m)));
        for member in offenders.iter().chain(rest.iter()) {
            if !member.cancelled.load(Ordering::Acquire) {
                self.inner.terminal.deliver(&*member.actual);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for DirectProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for DirectProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for DirectProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.inner.context.record(&*consumer);
        let subscription = Arc::new(DirectSubscription {
            actual: consumer.clone(),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            handle: OnceLock::new(),
            parent: Arc::downgrade(&self.inner),
        });
        consumer.on_subscribe(subscription.clone());
        match self.inner.subscribers.add(subscription.clone()) {
            Some(handle) => {
                let _ = subscription.handle.set(handle);
                if subscription.cancelled.load(Ordering::Acquire) {
                    self.inner.subscribers.remove(handle);
                }
            }
            None => {
                self.inner.terminal.deliver(&*consumer);
            }
        }
        subscription
    }
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for DirectProcessor<T> {
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
        let subscribers = self.inner.subscribers.snapshot();
        let lacking: Vec<Arc<DirectSubscription<T>>> = subscribers
            .iter()
            .map(|(_, s)| s.clone())
            .filter(|s| !s.cancelled.load(Ordering::Acquire) && s.demand.get() == 0)
            .collect();

        if !lacking.is_empty() {
            let error = hooks::operator_error(
                Error::overflow("direct processor emitted to a subscriber without demand"),
                Some(&value),
            );
            hooks::next_dropped(value);
            self.inner.upstream.cancel();
            self.terminate(Some(error), &lacking);
            return;
        }

        for (_, subscriber) in subscribers.iter() {
            if subscriber.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if subscriber.demand.try_take_one() {
                subscriber.actual.on_next(value.clone());
            }
        }
    }

    fn on_error(&self, error: Error) {
        self.terminate(Some(error), &[]);
    }

    fn on_complete(&self) {
        self.terminate(None, &[]);
    }

    fn current_context(&self) -> Context {
        self.inner.context.get()
    }
}

impl<T: Clone + Send + Sync + 'static> Sink<T> for DirectProcessor<T> {
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

impl<T: Clone + Send + Sync + 'static> Processor<T> for DirectProcessor<T> {
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
    fn test_broadcasts_to_all_with_demand() {
        let processor = DirectProcessor::new();
        let a = TestConsumer::new();
        let b = TestConsumer::new();
        processor.subscribe(a.clone());
        processor.subscribe(b.clone());
        processor.next(1);
        processor.next(2);
        processor.complete();
        assert_eq!(a.values(), vec![1, 2]);
        assert_eq!(b.values(), vec![1, 2]);
        assert_eq!(b.completions(), 1);
    }

    #[test]
    fn test_overflow_reaches_offender_first() {
        let processor = DirectProcessor::new();
        let eager = TestConsumer::new();
        let lazy = TestConsumer::with_request(0);
        processor.subscribe(eager.clone());
        processor.subscribe(lazy.clone());

        processor.next("x");
        assert!(eager.values().is_empty());
        assert!(lazy.error().map_or(false, |e| e.is_overflow()));
        assert!(eager.error().map_or(false, |e| e.is_overflow()));
        assert!(lazy.terminated_before(&eager));
    }

    #[test]
    fn test_cancelled_subscriber_is_removed() {
        let processor = DirectProcessor::new();
        let probe = TestConsumer::new();
        processor.subscribe(probe.clone());
        assert_eq!(processor.subscriber_count(), 1);
        probe.cancel();
        assert_eq!(processor.subscriber_count(), 0);
        processor.next(5);
        assert!(probe.values().is_empty());
    }
}
