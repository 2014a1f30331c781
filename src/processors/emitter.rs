use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::Config;
use crate::context::Context;
use crate::core::demand::{self, Demand, SubscriptionCell, WorkInProgress};
use crate::core::registry::{Handle, Registry};
use crate::core::traits::{Consumer, Processor, Producer, Sink, Subscription};
use crate::error::{Error, Result};
use crate::hooks;
use crate::processors::queue::{BoundedQueue, Queue};
use crate::processors::{AsyncSink, FirstContext, Terminal};
use crate::ring_buffer::Backoff;

/// Configuration for [`EmitterProcessor`].
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Size of the shared buffer, and the initial upstream request.
    pub prefetch: usize,
    /// Cancel upstream and refuse new subscribers once the last one leaves.
    pub auto_cancel: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            prefetch: Config::global().small_buffer_size,
            auto_cancel: true,
        }
    }
}

impl EmitterConfig {
    /// Set the prefetch size
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Enable or disable auto-cancel
    pub fn auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }
}

/// Broadcasts to many subscribers at the pace of the slowest one.
///
/// Values go through a bounded queue of `prefetch` slots. The drain loop emits
/// only as many values as the *smallest* outstanding demand among subscribers,
/// so one subscriber without demand pauses everybody. Values pushed while
/// nobody is subscribed stay queued and are delivered to the first subscriber.
///
/// When fed from an upstream, the processor requests `prefetch` values and
/// replenishes in batches of three quarters of that as they are drained.
/// Pushing through [`Sink::next`] while the queue is full blocks the caller;
/// [`EmitterProcessor::try_emit_next`] and [`AsyncSink::emit`] do not.
pub struct EmitterProcessor<T> {
    inner: Arc<EmitterInner<T>>,
}

struct EmitterInner<T> {
    queue: BoundedQueue<T>,
    prefetch: usize,
    limit: u64,
    auto_cancel: bool,
    subscribers: Registry<EmitterSubscription<T>>,
    wip: WorkInProgress,
    /// Values drained since the last upstream replenish.
    consumed: AtomicU64,
    terminal: Terminal,
    cancelled: AtomicBool,
    upstream: SubscriptionCell,
    space: Notify,
    context: FirstContext,
}

struct EmitterSubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    demand: Demand,
    cancelled: AtomicBool,
    handle: OnceLock<Handle>,
    parent: Weak<EmitterInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscription for EmitterSubscription<T> {
    fn request(&self, n: u64) {
        if !demand::validate(n) {
            return;
        }
        self.demand.add(n);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            if let Some(handle) = self.handle.get() {
                parent.remove(*handle);
            }
            parent.drain();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> EmitterInner<T> {
    fn remove(&self, handle: Handle) {
        if let Some(0) = self.subscribers.remove(handle) {
            if self.auto_cancel && !self.terminal.is_set() {
                self.cancel_all();
            }
        }
    }

    fn cancel_all(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("emitter processor auto-cancelled, last subscriber left");
        self.upstream.cancel();
        self.subscribers.terminate();
        self.queue.clear();
        self.space.notify_waiters();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
            } else {
                let subscribers = self.subscribers.snapshot();
                let active: Vec<_> = subscribers
                    .iter()
                    .filter(|(_, s)| !s.cancelled.load(Ordering::Acquire))
                    .map(|(_, s)| s.clone())
                    .collect();
                if !active.is_empty() {
                    let max = active.iter().map(|s| s.demand.get()).min().unwrap_or(0);
                    let mut emitted = 0u64;
                    while emitted != max {
                        let done = self.terminal.is_set();
                        let Some(value) = self.queue.poll() else {
                            if done {
                                self.finish();
                            }
                            break;
                        };
                        for subscriber in &active {
                            subscriber.actual.on_next(value.clone());
                        }
                        emitted += 1;
                        self.replenish();
                    }
                    if emitted > 0 {
                        for subscriber in &active {
                            subscriber.demand.produced(emitted);
                        }
                        self.space.notify_waiters();
                    }
                    if self.terminal.is_set() && self.queue.is_empty() {
                        self.finish();
                    }
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn replenish(&self) {
        if !self.upstream.is_set() {
            return;
        }
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed >= self.limit {
            self.consumed.store(0, Ordering::Release);
            self.upstream.request(self.limit);
        }
    }

    /// Deliver the terminal to everybody currently subscribed and close.
    fn finish(&self) {
        for member in self.subscribers.terminate() {
            if !member.cancelled.load(Ordering::Acquire) {
                self.terminal.deliver(&*member.actual);
            }
        }
        self.space.notify_waiters();
    }

    fn terminate(&self, error: Option<Error>) {
        if !self.terminal.set(error.clone()) {
            if let Some(error) = error {
                hooks::error_dropped(error);
            }
            return;
        }
        tracing::debug!(error = ?error, "emitter processor terminated");
        self.drain();
    }

    fn is_closed(&self) -> bool {
        self.terminal.is_set() || self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Clone + Send + Sync + 'static> EmitterProcessor<T> {
    /// Processor with the default prefetch and auto-cancel enabled.
    pub fn new() -> Self {
        Self::with_config(EmitterConfig::default())
    }

    pub fn with_config(config: EmitterConfig) -> Self {
        let prefetch = config.prefetch.max(1);
        let limit = (prefetch - (prefetch >> 2)).max(1) as u64;
        Self {
            inner: Arc::new(EmitterInner {
                queue: BoundedQueue::new(prefetch),
                prefetch,
                limit,
                auto_cancel: config.auto_cancel,
                subscribers: Registry::new(),
                wip: WorkInProgress::new(),
                consumed: AtomicU64::new(0),
                terminal: Terminal::default(),
                cancelled: AtomicBool::new(false),
                upstream: SubscriptionCell::new(),
                space: Notify::new(),
                context: FirstContext::default(),
            }),
        }
    }

    /// Queue `value` if there is room, otherwise hand it back.
    pub fn try_emit_next(&self, value: T) -> std::result::Result<(), T> {
        if self.inner.is_closed() {
            return Err(value);
        }
        self.inner.queue.offer(value)?;
        self.inner.drain();
        Ok(())
    }

    /// Values queued and not yet delivered.
    pub fn buffered(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn prefetch(&self) -> usize {
        self.inner.prefetch
    }
}

impl<T: Clone + Send + Sync + 'static> Default for EmitterProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EmitterProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for EmitterProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.inner.context.record(&*consumer);
        let subscription = Arc::new(EmitterSubscription {
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
                    self.inner.remove(handle);
                }
                self.inner.drain();
            }
            None => {
                if !self.inner.terminal.deliver(&*consumer) {
                    consumer.on_error(Error::rejected("EmitterProcessor has been cancelled"));
                }
            }
        }
        subscription
    }
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for EmitterProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.inner.is_closed() {
            subscription.cancel();
            return;
        }
        if self.inner.upstream.set(subscription) {
            self.inner.upstream.request(self.inner.prefetch as u64);
        }
    }

    /// Queue a value pushed by the upstream. An upstream that outruns the
    /// requested prefetch fails the processor with `Error::Overflow`.
    fn on_next(&self, value: T) {
        if self.inner.is_closed() {
            hooks::next_dropped(value);
            return;
        }
        if !self.inner.upstream.is_set() {
            self.next(value);
            return;
        }
        match self.inner.queue.offer(value) {
            Ok(()) => self.inner.drain(),
            Err(value) => {
                let error = hooks::operator_error(
                    Error::overflow("upstream emitted beyond the emitter prefetch"),
                    Some(&value),
                );
                hooks::next_dropped(value);
                self.inner.upstream.cancel();
                self.inner.terminate(Some(error));
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

impl<T: Clone + Send + Sync + 'static> Sink<T> for EmitterProcessor<T> {
    /// Push a value, blocking while the queue is full.
    fn next(&self, value: T) {
        let mut value = value;
        let mut backoff = Backoff::new();
        loop {
            if self.inner.is_closed() {
                hooks::next_dropped(value);
                return;
            }
            match self.inner.queue.offer(value) {
                Ok(()) => {
                    self.inner.drain();
                    return;
                }
                Err(back) => {
                    value = back;
                    self.inner.drain();
                    backoff.snooze();
                }
            }
        }
    }

    fn error(&self, error: Error) {
        self.on_error(error);
    }

    fn complete(&self) {
        self.on_complete();
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AsyncSink<T> for EmitterProcessor<T> {
    async fn emit(&self, value: T) -> Result<()> {
        let mut value = value;
        loop {
            let space = self.inner.space.notified();
            match self.try_emit_next(value) {
                Ok(()) => return Ok(()),
                Err(back) => value = back,
            }
            if self.inner.is_closed() {
                return Err(Error::rejected("EmitterProcessor is terminated"));
            }
            space.await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Processor<T> for EmitterProcessor<T> {
    fn is_terminated(&self) -> bool {
        self.inner.is_closed()
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
    fn test_first_subscriber_gets_backlog() {
        let processor = EmitterProcessor::with_config(EmitterConfig::default().prefetch(4));
        processor.next(1);
        processor.next(2);

        let first = TestConsumer::new();
        processor.subscribe(first.clone());
        assert_eq!(first.values(), vec![1, 2]);

        let second = TestConsumer::new();
        processor.subscribe(second.clone());
        processor.next(3);
        assert_eq!(first.values(), vec![1, 2, 3]);
        assert_eq!(second.values(), vec![3]);
    }

    #[test]
    fn test_slowest_subscriber_paces_everyone() {
        let processor = EmitterProcessor::with_config(EmitterConfig::default().prefetch(8));
        let fast = TestConsumer::new();
        let slow = TestConsumer::with_request(1);
        processor.subscribe(fast.clone());
        processor.subscribe(slow.clone());

        for i in 0..3 {
            processor.next(i);
        }
        assert_eq!(fast.values(), vec![0]);
        assert_eq!(slow.values(), vec![0]);
        assert_eq!(processor.buffered(), 2);

        slow.request(5);
        assert_eq!(fast.values(), vec![0, 1, 2]);
        processor.complete();
        assert_eq!(slow.completions(), 1);
        assert_eq!(fast.completions(), 1);
    }

    #[test]
    fn test_auto_cancel_rejects_late_subscribers() {
        let processor = EmitterProcessor::<u8>::new();
        let probe = TestConsumer::new();
        processor.subscribe(probe.clone());
        probe.cancel();
        assert!(processor.is_terminated());

        let late = TestConsumer::new();
        processor.subscribe(late.clone());
        assert!(matches!(late.error(), Some(Error::Rejected(_))));
    }

    #[test]
    fn test_try_emit_next_when_full() {
        let processor = EmitterProcessor::with_config(EmitterConfig::default().prefetch(1));
        assert!(processor.try_emit_next('a').is_ok());
        assert_eq!(processor.try_emit_next('b'), Err('b'));
    }

    #[tokio::test]
    async fn test_async_emit_waits_for_space() {
        let processor = EmitterProcessor::with_config(EmitterConfig::default().prefetch(1));
        processor.emit(1).await.unwrap();

        let probe = TestConsumer::with_request(0);
        processor.subscribe(probe.clone());

        let emitter = processor.clone();
        let pending = tokio::spawn(async move { emitter.emit(2).await });
        tokio::task::yield_now().await;
        probe.request(2);
        pending.await.unwrap().unwrap();
        assert_eq!(probe.values(), vec![1, 2]);
    }
}
