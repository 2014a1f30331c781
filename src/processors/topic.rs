use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::demand;
use crate::core::registry::{Handle, Registry};
use crate::core::traits::{Consumer, Processor, Producer, Signal, Sink, Subscription};
use crate::error::{Error, Result};
use crate::processors::ring::{DemandGate, RingCore, RingProcessorConfig};
use crate::ring_buffer::{Sequence, SequenceBarrier};
use crate::scheduler::{Disposable, Scheduler};

/// Ring-buffer broadcast: every subscriber sees every value, each on its own
/// loop scheduled on the supplied [`Scheduler`].
///
/// Producers block while the slowest subscriber is a full ring behind. Before
/// the first subscriber arrives (and, without auto-cancel, after the last one
/// leaves) values are retained up to the ring capacity and replayed to the next
/// subscriber.
///
/// With `auto_cancel` (the default), the upstream is cancelled when the last
/// subscriber leaves before termination; later subscribers are rejected with
/// `Error::Rejected`. Subscribers arriving after termination receive the cached
/// terminal signal.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use fluxweld::core::{Producer, Sink};
/// use fluxweld::processors::TopicProcessor;
/// use fluxweld::scheduler::TokioScheduler;
/// use fluxweld::testing::TestConsumer;
///
/// #[tokio::main]
/// async fn main() -> fluxweld::Result<()> {
///     let topic = TopicProcessor::create(TokioScheduler::shared()?)?;
///     let probe = TestConsumer::new();
///     topic.subscribe(probe.clone());
///
///     topic.next(1);
///     topic.next(2);
///     topic.complete();
///
///     probe.await_terminal(Duration::from_secs(5)).await?;
///     assert_eq!(probe.values(), vec![1, 2]);
///     Ok(())
/// }
/// ```
pub struct TopicProcessor<T> {
    inner: Arc<TopicInner<T>>,
}

struct Members {
    count: usize,
    /// The placeholder gating sequence is registered.
    retaining: bool,
    /// Auto-cancelled; no further subscribers.
    closed: bool,
}

struct TopicInner<T> {
    core: RingCore<T>,
    scheduler: Arc<dyn Scheduler>,
    members: Mutex<Members>,
    placeholder: Arc<Sequence>,
    subscribers: Registry<TopicSubscription<T>>,
    auto_cancel: bool,
    max_subscribers: usize,
}

struct TopicSubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    gate: DemandGate,
    /// Last sequence delivered.
    sequence: Arc<Sequence>,
    barrier: SequenceBarrier,
    cancelled: AtomicBool,
    handle: OnceLock<Handle>,
    task: OnceLock<Arc<dyn Disposable>>,
    started: AtomicBool,
}

impl<T: Send + Sync + 'static> Subscription for TopicSubscription<T> {
    fn request(&self, n: u64) {
        if demand::validate(n) {
            self.gate.add(n);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.barrier.alert();
            self.gate.wake();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TopicInner<T> {
    fn run(&self, subscriber: &TopicSubscription<T>) {
        if subscriber.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut next = subscriber.sequence.get() + 1;
        'outer: loop {
            if subscriber.cancelled.load(Ordering::Acquire) {
                break;
            }
            if self.core.terminal_sequence() < next {
                // subscribed while the terminal slot was being committed
                self.core.terminal.deliver(&*subscriber.actual);
                break;
            }
            let available = match subscriber.barrier.wait_for(next) {
                Ok(available) => available,
                Err(_) => {
                    if subscriber.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    subscriber.barrier.clear_alert();
                    continue;
                }
            };
            if available < next {
                std::hint::spin_loop();
                continue;
            }
            while next <= available {
                // SAFETY: `next` is published and our sequence (next - 1)
                // gates its slot.
                match unsafe { self.core.ring.read(next) } {
                    None => {}
                    Some(Signal::Next(value)) => {
                        if !subscriber
                            .gate
                            .acquire(|| subscriber.cancelled.load(Ordering::Acquire))
                        {
                            break 'outer;
                        }
                        subscriber.actual.on_next(value);
                    }
                    Some(terminal) => {
                        subscriber.sequence.set(next);
                        terminal.dispatch(&*subscriber.actual);
                        break 'outer;
                    }
                }
                subscriber.sequence.set(next);
                next += 1;
            }
        }
        self.leave(subscriber);
    }

    fn alert_subscribers(&self) {
        for (_, subscriber) in self.subscribers.snapshot().iter() {
            subscriber.barrier.alert();
        }
    }

    fn leave(&self, subscriber: &TopicSubscription<T>) {
        let mut members = self.members.lock();
        if let Some(handle) = subscriber.handle.get() {
            self.subscribers.remove(*handle);
        }
        members.count -= 1;
        let mut cancel_upstream = false;
        if members.count == 0 {
            if self.auto_cancel && !self.core.terminal.is_set() {
                members.closed = true;
                cancel_upstream = true;
            } else {
                // keep retaining from where the last subscriber stopped
                self.placeholder.set(subscriber.sequence.get());
                self.core.ring.add_gating_sequence(self.placeholder.clone());
                members.retaining = true;
            }
        }
        self.core.ring.remove_gating_sequence(&subscriber.sequence);
        drop(members);
        tracing::trace!(position = subscriber.sequence.get(), "topic subscriber left");
        if cancel_upstream {
            self.core.cancel_upstream();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TopicProcessor<T> {
    pub fn with_config(config: RingProcessorConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        let core = RingCore::new(&config)?;
        let placeholder = Arc::new(Sequence::new(Sequence::INITIAL));
        core.ring.add_gating_sequence(placeholder.clone());
        Ok(Self {
            inner: Arc::new(TopicInner {
                core,
                scheduler,
                members: Mutex::new(Members {
                    count: 0,
                    retaining: true,
                    closed: false,
                }),
                placeholder,
                subscribers: Registry::new(),
                auto_cancel: config.auto_cancel,
                max_subscribers: config.max_subscribers,
            }),
        })
    }

    /// Topic with the default configuration.
    pub fn create(scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        Self::with_config(RingProcessorConfig::default(), scheduler)
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.core.ring.buffer_size()
    }

    /// Slots producers can fill before blocking.
    pub fn remaining_capacity(&self) -> i64 {
        self.inner.core.ring.remaining_capacity()
    }

    /// Stop every subscriber loop without a terminal signal and cancel the
    /// upstream. Later subscribers are rejected.
    pub fn force_shutdown(&self) {
        self.inner.core.cancel_upstream();
        for (_, subscriber) in self.inner.subscribers.snapshot().iter() {
            subscriber.cancel();
            if let Some(task) = subscriber.task.get() {
                task.dispose();
            }
            if !subscriber.started.swap(true, Ordering::AcqRel) {
                self.inner.leave(subscriber);
            }
        }
    }
}

impl<T> Clone for TopicProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for TopicProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let inner = &self.inner;
        inner.core.context.record(&*consumer);

        let mut members = inner.members.lock();
        if inner.core.terminal.is_set() {
            let retained = members.retaining
                && inner.placeholder.get() < inner.core.terminal_sequence();
            if !retained {
                drop(members);
                return inner.core.replay_terminal(&*consumer);
            }
        }
        if members.closed || inner.core.is_cancelled() {
            drop(members);
            return demand::reject(&*consumer, Error::rejected("topic processor was cancelled"));
        }
        if members.count >= inner.max_subscribers {
            let error = Error::capacity(members.count, inner.max_subscribers);
            drop(members);
            return demand::reject(&*consumer, error);
        }

        let start = if members.retaining {
            inner.placeholder.get()
        } else {
            inner.core.ring.claimed_cursor()
        };
        let sequence = Arc::new(Sequence::new(start));
        inner.core.ring.add_gating_sequence(sequence.clone());
        if members.retaining {
            inner.core.ring.remove_gating_sequence(&inner.placeholder);
            members.retaining = false;
        }
        members.count += 1;
        drop(members);

        let subscription = Arc::new(TopicSubscription {
            actual: consumer.clone(),
            gate: DemandGate::default(),
            sequence,
            barrier: inner.core.ring.new_barrier(),
            cancelled: AtomicBool::new(false),
            handle: OnceLock::new(),
            task: OnceLock::new(),
            started: AtomicBool::new(false),
        });
        if let Some(handle) = inner.subscribers.add(subscription.clone()) {
            let _ = subscription.handle.set(handle);
        }
        consumer.on_subscribe(subscription.clone());

        let task_inner = inner.clone();
        let task_subscription = subscription.clone();
        let task = inner
            .scheduler
            .schedule(Box::new(move || task_inner.run(&task_subscription)));
        let _ = subscription.task.set(task);
        subscription
    }
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for TopicProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inner.core.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.inner.core.commit_next(value);
    }

    fn on_error(&self, error: Error) {
        if self.inner.core.commit_terminal(Some(error)) {
            self.inner.alert_subscribers();
        }
    }

    fn on_complete(&self) {
        if self.inner.core.commit_terminal(None) {
            self.inner.alert_subscribers();
        }
    }

    fn current_context(&self) -> Context {
        self.inner.core.context.get()
    }
}

impl<T: Clone + Send + Sync + 'static> Sink<T> for TopicProcessor<T> {
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

impl<T: Clone + Send + Sync + 'static> Processor<T> for TopicProcessor<T> {
    fn is_terminated(&self) -> bool {
        self.inner.core.terminal.is_set() || self.inner.core.is_cancelled()
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn terminal_error(&self) -> Option<Error> {
        self.inner.core.terminal.error()
    }
}
