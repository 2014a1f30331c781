use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::demand::{self, Demand, SubscriptionCell, WorkInProgress, UNBOUNDED};
use crate::core::traits::{Consumer, Processor, Producer, Sink, Subscription};
use crate::error::Error;
use crate::hooks;
use crate::processors::queue::{Queue, UnboundedQueue};
use crate::processors::{FirstContext, Terminal};

type OverflowFn<T> = Box<dyn Fn(T) + Send + Sync>;
type TerminateFn = Box<dyn FnOnce() + Send>;

/// Builder for [`UnicastProcessor`].
pub struct UnicastBuilder<T> {
    queue: Box<dyn Queue<T>>,
    on_overflow: Option<OverflowFn<T>>,
    on_terminate: Option<TerminateFn>,
}

impl<T: Send + 'static> UnicastBuilder<T> {
    /// Set the buffer (unbounded by default)
    pub fn queue<Q: Queue<T> + 'static>(mut self, queue: Q) -> Self {
        self.queue = Box::new(queue);
        self
    }

    /// Receive the value rejected by a full queue
    pub fn on_overflow<F>(mut self, f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_overflow = Some(Box::new(f));
        self
    }

    /// Run once when the processor terminates or its subscriber cancels
    pub fn on_terminate<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_terminate = Some(Box::new(f));
        self
    }

    pub fn build(self) -> UnicastProcessor<T> {
        UnicastProcessor {
            inner: Arc::new(UnicastInner {
                queue: self.queue,
                on_overflow: self.on_overflow,
                on_terminate: Mutex::new(self.on_terminate),
                actual: Mutex::new(None),
                subscribed: AtomicBool::new(false),
                demand: Demand::new(),
                wip: WorkInProgress::new(),
                cancelled: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                terminal: Terminal::default(),
                upstream: SubscriptionCell::new(),
                context: FirstContext::default(),
            }),
        }
    }
}

/// Buffers values for exactly one subscriber.
///
/// Values pushed before the subscriber arrives, or faster than it requests,
/// wait in the queue. When a bounded queue is full the value is handed to the
/// `on_overflow` callback (or the dropped-Next hook) and the processor fails
/// with `Error::Overflow` once the values already queued have been delivered.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use fluxweld::core::Sink;
/// use fluxweld::processors::{BoundedQueue, UnicastProcessor};
///
/// let rejected = Arc::new(Mutex::new(Vec::new()));
/// let sink = rejected.clone();
/// let processor = UnicastProcessor::builder()
///     .queue(BoundedQueue::new(2))
///     .on_overflow(move |v| sink.lock().push(v))
///     .build();
///
/// processor.next(1);
/// processor.next(2);
/// processor.next(3);
/// assert_eq!(*rejected.lock(), vec![3]);
/// ```
pub struct UnicastProcessor<T> {
    inner: Arc<UnicastInner<T>>,
}

struct UnicastInner<T> {
    queue: Box<dyn Queue<T>>,
    on_overflow: Option<OverflowFn<T>>,
    on_terminate: Mutex<Option<TerminateFn>>,
    actual: Mutex<Option<Arc<dyn Consumer<T>>>>,
    subscribed: AtomicBool,
    demand: Demand,
    wip: WorkInProgress,
    cancelled: AtomicBool,
    /// Terminal signal handed to the subscriber.
    delivered: AtomicBool,
    terminal: Terminal,
    upstream: SubscriptionCell,
    context: FirstContext,
}

impl<T: Send + 'static> UnicastInner<T> {
    fn run_on_terminate(&self) {
        if let Some(f) = self.on_terminate.lock().take() {
            f();
        }
    }

    fn deliver_terminal(&self, actual: &Arc<dyn Consumer<T>>) {
        if self.delivered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.actual.lock().take();
        self.terminal.deliver(&**actual);
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
                self.actual.lock().take();
            } else if let Some(actual) = self.current_actual() {
                let requested = self.demand.get();
                let mut emitted = 0u64;
                while emitted != requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    let done = self.terminal.is_set();
                    match self.queue.poll() {
                        Some(value) => {
                            actual.on_next(value);
                            emitted += 1;
                        }
                        None => {
                            if done {
                                self.deliver_terminal(&actual);
                            }
                            break;
                        }
                    }
                }
                if emitted == requested && self.terminal.is_set() && self.queue.is_empty() {
                    self.deliver_terminal(&actual);
                }
                if emitted != 0 && requested != UNBOUNDED {
                    self.demand.produced(emitted);
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn current_actual(&self) -> Option<Arc<dyn Consumer<T>>> {
        if self.delivered.load(Ordering::Acquire) {
            return None;
        }
        self.actual.lock().clone()
    }

    fn terminate(&self, error: Option<Error>) {
        if !self.terminal.set(error.clone()) {
            if let Some(error) = error {
                hooks::error_dropped(error);
            }
            return;
        }
        tracing::debug!(error = ?error, "unicast processor terminated");
        self.run_on_terminate();
        self.drain();
    }
}

struct UnicastSubscription<T> {
    inner: Arc<UnicastInner<T>>,
}

impl<T: Send + 'static> Subscription for UnicastSubscription<T> {
    fn request(&self, n: u64) {
        if demand::validate(n) {
            self.inner.demand.add(n);
            self.inner.drain();
        }
    }

    fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.run_on_terminate();
        self.inner.upstream.cancel();
        self.inner.drain();
    }
}

impl<T: Send + 'static> UnicastProcessor<T> {
    /// A processor with an unbounded queue.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> UnicastBuilder<T> {
        UnicastBuilder {
            queue: Box::new(UnboundedQueue::new()),
            on_overflow: None,
            on_terminate: None,
        }
    }

    /// Queue `value` without terminating on overflow; a full queue hands it back.
    pub fn try_emit_next(&self, value: T) -> std::result::Result<(), T> {
        if self.inner.terminal.is_set() || self.inner.cancelled.load(Ordering::Acquire) {
            return Err(value);
        }
        self.inner.queue.offer(value)?;
        self.inner.drain();
        Ok(())
    }

    /// Values waiting for demand.
    pub fn buffered(&self) -> usize {
        self.inner.queue.len()
    }
}

impl<T: Send + 'static> Default for UnicastProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for UnicastProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Producer<T> for UnicastProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            return demand::reject(
                &*consumer,
                Error::rejected("UnicastProcessor allows only a single subscriber"),
            );
        }
        self.inner.context.record(&*consumer);
        let subscription: Arc<dyn Subscription> = Arc::new(UnicastSubscription {
            inner: self.inner.clone(),
        });
        consumer.on_subscribe(subscription.clone());
        *self.inner.actual.lock() = Some(consumer);
        self.inner.drain();
        subscription
    }
}

impl<T: Send + 'static> Consumer<T> for UnicastProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.inner.terminal.is_set() || self.inner.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        if self.inner.upstream.set(subscription) {
            self.inner.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        let inner = &self.inner;
        if inner.terminal.is_set() || inner.cancelled.load(Ordering::Acquire) {
            hooks::next_dropped(value);
            return;
        }
        match inner.queue.offer(value) {
            Ok(()) => inner.drain(),
            Err(value) => {
                let error = hooks::operator_error(
                    Error::overflow("unicast queue is full"),
                    Some(&value),
                );
                match &inner.on_overflow {
                    Some(f) => f(value),
                    None => hooks::next_dropped(value),
                }
                inner.upstream.cancel();
                inner.terminate(Some(error));
            }
        }
    }

    fn on_error(&self, error: Error) {
        self.inner.terminate(Some(error));
    }

    fn on_complete(&self) {
        self.inner.terminate(None);
    }

    fn current_context(&self) -> Context {
        self.inner.context.get()
    }
}

impl<T: Send + 'static> Sink<T> for UnicastProcessor<T> {
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

impl<T: Send + 'static> Processor<T> for UnicastProcessor<T> {
    fn is_terminated(&self) -> bool {
        self.inner.terminal.is_set() || self.inner.cancelled.load(Ordering::Acquire)
    }

    fn subscriber_count(&self) -> usize {
        let attached = self.inner.subscribed.load(Ordering::Acquire)
            && !self.inner.cancelled.load(Ordering::Acquire)
            && !self.inner.delivered.load(Ordering::Acquire);
        usize::from(attached)
    }

    fn terminal_error(&self) -> Option<Error> {
        self.inner.terminal.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::BoundedQueue;
    use crate::testing::TestConsumer;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_buffers_until_subscriber_requests() {
        let processor = UnicastProcessor::new();
        processor.next(1);
        processor.next(2);
        processor.complete();

        let probe = TestConsumer::with_request(1);
        processor.subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1]);
        assert_eq!(probe.completions(), 0);

        probe.request(1);
        assert_eq!(probe.values(), vec![1, 2]);
        assert_eq!(probe.completions(), 1);
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let processor = UnicastProcessor::<u8>::new();
        processor.subscribe(TestConsumer::new());
        let second = TestConsumer::new();
        processor.subscribe(second.clone());
        assert!(matches!(second.error(), Some(Error::Rejected(_))));
    }

    #[test]
    fn test_overflow_delivers_queued_then_errors() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let counter = terminated.clone();
        let processor = UnicastProcessor::builder()
            .queue(BoundedQueue::new(1))
            .on_overflow(|_| {})
            .on_terminate(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        processor.next(1);
        processor.next(2);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert!(processor.try_emit_next(9).is_err());

        let probe = TestConsumer::new();
        processor.subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1]);
        assert!(probe.error().map_or(false, |e| e.is_overflow()));
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_emit_next_hands_back_without_terminating() {
        let processor = UnicastProcessor::builder().queue(BoundedQueue::new(1)).build();
        assert!(processor.try_emit_next(1).is_ok());
        assert_eq!(processor.try_emit_next(2), Err(2));
        assert!(!processor.is_terminated());
        assert_eq!(processor.buffered(), 1);
    }
}
