//! Programmatic sources driven through a [`FluxSink`].
//!
//! [`create`] hands each subscriber's sink to an emitter callback, which may
//! push values at any pace. What happens to values pushed beyond the
//! subscriber's demand is decided by the [`OverflowStrategy`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::core::demand::{self, Demand, WorkInProgress, UNBOUNDED};
use crate::core::traits::{Consumer, Producer, Sink, Subscription};
use crate::error::Error;
use crate::hooks;
use crate::processors::Terminal;

/// What a [`FluxSink`] does with a value that arrives without demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OverflowStrategy {
    /// Discard it silently.
    Ignore,
    /// Terminate the subscriber with `Error::Overflow`.
    Error,
    /// Keep only the most recent undelivered value.
    DropOldest,
    /// Discard it through the dropped-Next hook.
    DropLatest,
    /// Queue it without bound.
    #[default]
    Buffer,
}

struct SinkState<T> {
    actual: Arc<dyn Consumer<T>>,
    strategy: OverflowStrategy,
    demand: Demand,
    queue: Mutex<VecDeque<T>>,
    wip: WorkInProgress,
    terminal: Terminal,
    cancelled: AtomicBool,
    done: AtomicBool,
    on_dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T: Send + 'static> SinkState<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        let callback = self.on_dispose.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn push(&self, value: T) {
        if self.terminal.is_set() {
            hooks::next_dropped(value);
            return;
        }
        if self.is_cancelled() {
            return;
        }
        {
            let mut queue = self.queue.lock();
            let requested = self.demand.get();
            let has_room = requested == UNBOUNDED || requested > queue.len() as u64;
            match self.strategy {
                _ if has_room => queue.push_back(value),
                OverflowStrategy::Buffer => queue.push_back(value),
                OverflowStrategy::DropOldest => {
                    queue.clear();
                    queue.push_back(value);
                }
                OverflowStrategy::Ignore => return,
                OverflowStrategy::DropLatest => {
                    drop(queue);
                    hooks::next_dropped(value);
                    return;
                }
                OverflowStrategy::Error => {
                    drop(queue);
                    let error = hooks::operator_error(
                        Error::overflow("create sink received a value without demand"),
                        Some(&value),
                    );
                    hooks::next_dropped(value);
                    self.terminate(Some(error));
                    return;
                }
            }
        }
        self.drain();
    }

    fn terminate(&self, error: Option<Error>) {
        if self.is_cancelled() {
            return;
        }
        if !self.terminal.set(error.clone()) {
            if let Some(error) = error {
                hooks::error_dropped(error);
            }
            return;
        }
        self.drain();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let requested = self.demand.get();
            let mut emitted = 0u64;
            while emitted != requested {
                if self.is_cancelled() {
                    self.queue.lock().clear();
                    return;
                }
                let Some(value) = self.queue.lock().pop_front() else {
                    break;
                };
                self.actual.on_next(value);
                emitted += 1;
            }
            if self.is_cancelled() {
                self.queue.lock().clear();
                return;
            }
            if self.terminal.is_set() && self.queue.lock().is_empty() {
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.terminal.deliver(&*self.actual);
                    self.dispose();
                }
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

impl<T: Send + 'static> Subscription for SinkState<T> {
    fn request(&self, n: u64) {
        if !demand::validate(n) {
            self.terminate(Some(Error::InvalidRequest(n)));
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispose();
        if self.wip.enter() {
            self.queue.lock().clear();
        }
    }
}

/// Handle through which an emitter callback feeds one subscriber.
///
/// Calls must not overlap: the sink is meant to be driven by one thread or task
/// at a time.
pub struct FluxSink<T> {
    state: Arc<SinkState<T>>,
}

impl<T> Clone for FluxSink<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> FluxSink<T> {
    /// Outstanding demand of the subscriber.
    pub fn requested_from_downstream(&self) -> u64 {
        self.state.demand.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Run `callback` once, when the subscriber cancels or the sink terminates.
    pub fn on_dispose<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.done.load(Ordering::Acquire) || self.state.is_cancelled() {
            callback();
        } else {
            *self.state.on_dispose.lock() = Some(Box::new(callback));
        }
        self
    }

    /// The subscriber's Context.
    pub fn current_context(&self) -> Context {
        self.state.actual.current_context()
    }
}

impl<T: Send + 'static> Sink<T> for FluxSink<T> {
    fn next(&self, value: T) {
        self.state.push(value);
    }

    fn error(&self, error: Error) {
        self.state.terminate(Some(error));
    }

    fn complete(&self) {
        self.state.terminate(None);
    }
}

impl<T> fmt::Debug for FluxSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FluxSink")
            .field("strategy", &self.state.strategy)
            .field("requested", &self.state.demand.get())
            .finish()
    }
}

type Emitter<T> = dyn Fn(FluxSink<T>) + Send + Sync;

/// Producer returned by [`create`].
pub struct CreateSource<T> {
    emitter: Arc<Emitter<T>>,
    strategy: OverflowStrategy,
}

impl<T> Clone for CreateSource<T> {
    fn clone(&self) -> Self {
        Self {
            emitter: self.emitter.clone(),
            strategy: self.strategy,
        }
    }
}

impl<T: Send + 'static> Producer<T> for CreateSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let state = Arc::new(SinkState {
            actual: consumer.clone(),
            strategy: self.strategy,
            demand: Demand::new(),
            queue: Mutex::new(VecDeque::new()),
            wip: WorkInProgress::new(),
            terminal: Terminal::default(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            on_dispose: Mutex::new(None),
        });
        consumer.on_subscribe(state.clone());
        (self.emitter)(FluxSink {
            state: state.clone(),
        });
        state
    }
}

/// Build a producer from a callback that pushes into a [`FluxSink`].
///
/// The callback runs once per subscriber, after `on_subscribe`.
///
/// # Examples
///
/// ```rust
/// use fluxweld::core::{Producer, Sink};
/// use fluxweld::sinks::{self, OverflowStrategy};
/// use fluxweld::testing::TestConsumer;
///
/// let source = sinks::create(
///     |sink| {
///         for i in 0..5 {
///             sink.next(i);
///         }
///         sink.complete();
///     },
///     OverflowStrategy::DropOldest,
/// );
///
/// let probe = TestConsumer::with_request(1);
/// source.subscribe(probe.clone());
/// probe.request(10);
/// assert_eq!(probe.values(), vec![0, 4]);
/// assert_eq!(probe.completions(), 1);
/// ```
pub fn create<T, F>(emitter: F, strategy: OverflowStrategy) -> CreateSource<T>
where
    T: Send + 'static,
    F: Fn(FluxSink<T>) + Send + Sync + 'static,
{
    CreateSource {
        emitter: Arc::new(emitter),
        strategy,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing::TestConsumer;

    fn burst(strategy: OverflowStrategy) -> CreateSource<u32> {
        create(
            |sink| {
                for i in 0..4 {
                    sink.next(i);
                }
                sink.complete();
            },
            strategy,
        )
    }

    #[test]
    fn test_buffer_keeps_everything() {
        let probe = TestConsumer::with_request(1);
        burst(OverflowStrategy::Buffer).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0]);
        assert_eq!(probe.completions(), 0);
        probe.request(3);
        assert_eq!(probe.values(), vec![0, 1, 2, 3]);
        assert_eq!(probe.completions(), 1);
    }

    #[test]
    fn test_ignore_and_drop_latest_discard() {
        let ignore = TestConsumer::with_request(2);
        burst(OverflowStrategy::Ignore).subscribe(ignore.clone());
        assert_eq!(ignore.values(), vec![0, 1]);
        assert_eq!(ignore.completions(), 1);

        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        hooks::on_next_dropped("sinks-test-drop-latest", move |value| {
            if value.downcast_ref::<u32>().is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let latest = TestConsumer::with_request(1);
        burst(OverflowStrategy::DropLatest).subscribe(latest.clone());
        hooks::reset_next_dropped_key("sinks-test-drop-latest");
        assert_eq!(latest.values(), vec![0]);
        assert!(dropped.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_error_strategy_terminates() {
        let probe = TestConsumer::with_request(1);
        burst(OverflowStrategy::Error).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0]);
        assert!(probe.error().map_or(false, |e| e.is_overflow()));
        assert_eq!(probe.completions(), 0);
    }

    #[test]
    fn test_on_dispose_runs_on_cancel() {
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = disposed.clone();
        let source = create(
            move |sink: FluxSink<u8>| {
                let flag = flag.clone();
                sink.on_dispose(move || flag.store(true, Ordering::SeqCst));
            },
            OverflowStrategy::Buffer,
        );
        let probe = TestConsumer::new();
        source.subscribe(probe.clone());
        assert!(!disposed.load(Ordering::SeqCst));
        probe.cancel();
        assert!(disposed.load(Ordering::SeqCst));
    }
}
