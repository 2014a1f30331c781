//! Plumbing shared by the ring-buffer backed processors.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::demand::{Demand, EmptySubscription, SubscriptionCell, UNBOUNDED};
use crate::core::traits::{Consumer, Signal, Subscription};
use crate::error::{Error, Result};
use crate::hooks;
use crate::processors::{FirstContext, Terminal};
use crate::ring_buffer::{ProducerType, RingBuffer, RingBufferConfig, WaitStrategy};

const DEMAND_RECHECK: Duration = Duration::from_millis(10);

/// Configuration for [`TopicProcessor`](super::TopicProcessor) and
/// [`WorkQueueProcessor`](super::WorkQueueProcessor).
///
/// # Examples
///
/// ```rust
/// use fluxweld::processors::RingProcessorConfig;
/// use fluxweld::ring_buffer::WaitStrategy;
///
/// let config = RingProcessorConfig::default()
///     .buffer_size(1024)
///     .wait_strategy(WaitStrategy::Yielding)
///     .share(true)
///     .auto_cancel(false);
/// assert_eq!(config.buffer_size, 1024);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RingProcessorConfig {
    /// Ring capacity. Must be a power of two.
    pub buffer_size: usize,
    /// How subscriber loops wait for new items.
    pub wait_strategy: WaitStrategy,
    /// Allow concurrent producers (multi-producer claiming).
    pub share: bool,
    /// Cancel the upstream when the last subscriber leaves.
    pub auto_cancel: bool,
    /// Upper bound on simultaneous subscribers.
    pub max_subscribers: usize,
}

impl Default for RingProcessorConfig {
    fn default() -> Self {
        let global = Config::global();
        Self {
            buffer_size: global.small_buffer_size,
            wait_strategy: WaitStrategy::default(),
            share: false,
            auto_cancel: true,
            max_subscribers: global.topic_max_subscribers,
        }
    }
}

impl RingProcessorConfig {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn share(mut self, share: bool) -> Self {
        self.share = share;
        self
    }

    pub fn auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }

    pub fn max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = max;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_subscribers == 0 {
            return Err(Error::invalid_config("max_subscribers must be at least 1"));
        }
        Ok(())
    }
}

/// Outstanding demand a subscriber loop can block on.
#[derive(Default)]
pub(crate) struct DemandGate {
    demand: Demand,
    lock: Mutex<()>,
    ready: Condvar,
}

impl DemandGate {
    pub(crate) fn add(&self, n: u64) {
        self.demand.add(n);
        self.wake();
    }

    /// Give back a unit taken by [`DemandGate::acquire`] but not used.
    pub(crate) fn restore(&self) {
        self.demand.add(1);
    }

    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    /// Take one unit of demand, blocking until one is granted. Returns false,
    /// without taking anything, as soon as `stop` holds.
    pub(crate) fn acquire(&self, stop: impl Fn() -> bool) -> bool {
        loop {
            if stop() {
                return false;
            }
            if self.demand.try_take_one() {
                return true;
            }
            let mut guard = self.lock.lock();
            if stop() || self.demand.get() > 0 {
                continue;
            }
            self.ready.wait_for(&mut guard, DEMAND_RECHECK);
        }
    }
}

/// Ring, terminal bookkeeping and upstream link of a ring-backed processor.
pub(crate) struct RingCore<T> {
    pub(crate) ring: Arc<RingBuffer<Signal<T>>>,
    pub(crate) terminal: Terminal,
    pub(crate) context: FirstContext,
    upstream: SubscriptionCell,
    cancelled: AtomicBool,
    /// Sequence holding the terminal signal, `i64::MAX` until committed.
    terminal_seq: AtomicI64,
}

impl<T: Send + Sync + 'static> RingCore<T> {
    pub(crate) fn new(config: &RingProcessorConfig) -> Result<Self> {
        config.validate()?;
        let producer_type = if config.share {
            ProducerType::Multi
        } else {
            ProducerType::Single
        };
        let ring = RingBuffer::new(
            RingBufferConfig::default()
                .buffer_size(config.buffer_size)
                .producer_type(producer_type)
                .wait_strategy(config.wait_strategy),
        )?;
        Ok(Self {
            ring: Arc::new(ring),
            terminal: Terminal::default(),
            context: FirstContext::default(),
            upstream: SubscriptionCell::new(),
            cancelled: AtomicBool::new(false),
            terminal_seq: AtomicI64::new(i64::MAX),
        })
    }

    pub(crate) fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.terminal.is_set() || self.is_cancelled() {
            subscription.cancel();
            return;
        }
        if self.upstream.set(subscription) {
            self.upstream.request(UNBOUNDED);
        }
    }

    /// Publish a value, waiting for the slowest subscriber while the ring is
    /// full. Values arriving after termination or cancellation are dropped.
    pub(crate) fn commit_next(&self, value: T) {
        if self.terminal.is_set() || self.is_cancelled() {
            hooks::next_dropped(value);
            return;
        }
        let mut value = Some(value);
        let mut late = None;
        self.ring.commit_while(
            |_| {
                if self.terminal.is_set() {
                    late = value.take();
                    None
                } else {
                    value.take().map(Signal::Next)
                }
            },
            || !self.is_cancelled() && !self.terminal.is_set(),
        );
        if let Some(value) = late.or(value) {
            hooks::next_dropped(value);
        }
    }

    /// Record and publish the terminal signal. Returns false if the processor
    /// had already terminated.
    pub(crate) fn commit_terminal(&self, error: Option<Error>) -> bool {
        if !self.terminal.set(error.clone()) {
            if let Some(error) = error {
                hooks::error_dropped(error);
            }
            return false;
        }
        let mut signal = Some(match error {
            Some(error) => Signal::Error(error),
            None => Signal::Complete,
        });
        let committed = self.ring.commit_while(
            |sequence| {
                self.terminal_seq.store(sequence, Ordering::Release);
                signal.take()
            },
            || !self.is_cancelled(),
        );
        tracing::debug!(sequence = ?committed, "ring processor terminated");
        true
    }

    pub(crate) fn terminal_sequence(&self) -> i64 {
        self.terminal_seq.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_upstream(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!("last subscriber left, cancelling upstream");
            self.upstream.cancel();
        }
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Hand `consumer` the cached terminal signal without subscribing it.
    pub(crate) fn replay_terminal(&self, consumer: &dyn Consumer<T>) -> Arc<dyn Subscription> {
        let subscription: Arc<dyn Subscription> = Arc::new(EmptySubscription);
        consumer.on_subscribe(subscription.clone());
        if !self.terminal.deliver(consumer) {
            consumer.on_complete();
        }
        subscription
    }
}
