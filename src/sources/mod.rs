//! Cold sources.
//!
//! Every subscription gets its own cursor over the data and only emits what
//! its consumer requested. Sources complete as soon as the last value has been
//! delivered, without waiting for further demand.

use std::iter::Peekable;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::demand::{self, Demand, EmptySubscription, WorkInProgress, UNBOUNDED};
use crate::core::traits::{Consumer, Producer, Subscription};
use crate::error::Error;

type BoxIter<T> = Box<dyn Iterator<Item = T> + Send>;

/// Per-subscription cursor shared by the iterator-backed sources.
struct IterSubscription<T> {
    actual: Arc<dyn Consumer<T>>,
    iter: Mutex<Peekable<BoxIter<T>>>,
    demand: Demand,
    wip: WorkInProgress,
    cancelled: AtomicBool,
    done: AtomicBool,
}

impl<T: Send + 'static> IterSubscription<T> {
    fn start(consumer: Arc<dyn Consumer<T>>, iter: BoxIter<T>) -> Arc<dyn Subscription> {
        let subscription = Arc::new(Self {
            actual: consumer.clone(),
            iter: Mutex::new(iter.peekable()),
            demand: Demand::new(),
            wip: WorkInProgress::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        consumer.on_subscribe(subscription.clone());
        subscription.drain();
        subscription
    }

    fn finish(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.actual.on_complete();
        }
    }

    fn stopped(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire)
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
                if self.stopped() {
                    return;
                }
                let (value, last) = {
                    let mut iter = self.iter.lock();
                    match iter.next() {
                        Some(value) => (value, iter.peek().is_none()),
                        None => break,
                    }
                };
                self.actual.on_next(value);
                emitted += 1;
                if last {
                    break;
                }
            }
            if self.stopped() {
                return;
            }
            if self.iter.lock().peek().is_none() {
                self.finish();
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

impl<T: Send + 'static> Subscription for IterSubscription<T> {
    fn request(&self, n: u64) {
        if !demand::validate(n) {
            self.cancelled.store(true, Ordering::Release);
            if !self.done.swap(true, Ordering::AcqRel) {
                self.actual.on_error(Error::InvalidRequest(n));
            }
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A producer that emits a sequence of `i64`s
#[derive(Debug, Clone)]
pub struct RangeSource {
    range: Range<i64>,
}

impl RangeSource {
    /// Create a new range producer
    pub fn new(range: Range<i64>) -> Self {
        Self { range }
    }
}

impl Producer<i64> for RangeSource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<i64>>) -> Arc<dyn Subscription> {
        IterSubscription::start(consumer, Box::new(self.range.clone()))
    }
}

/// A producer that replays a fixed list of values to each subscriber
#[derive(Debug)]
pub struct IterSource<T> {
    items: Arc<Vec<T>>,
}

impl<T> IterSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Clone for IterSource<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for IterSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let items = self.items.clone();
        let iter = (0..items.len()).map(move |i| items[i].clone());
        IterSubscription::start(consumer, Box::new(iter))
    }
}

/// A producer of a single value
pub type JustSource<T> = IterSource<T>;

/// Completes immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySource;

impl<T> Producer<T> for EmptySource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        demand::complete(&*consumer)
    }
}

/// Fails every subscriber immediately with the same error
#[derive(Debug, Clone)]
pub struct ErrorSource {
    error: Error,
}

impl<T> Producer<T> for ErrorSource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        demand::reject(&*consumer, self.error.clone())
    }
}

/// Never signals anything after `on_subscribe`
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSource;

impl<T> Producer<T> for NeverSource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let subscription: Arc<dyn Subscription> = Arc::new(EmptySubscription);
        consumer.on_subscribe(subscription.clone());
        subscription
    }
}

/// Emit the given values, in order, then complete.
pub fn from_iter<T, I>(items: I) -> IterSource<T>
where
    I: IntoIterator<Item = T>,
{
    IterSource::new(items.into_iter().collect())
}

/// Emit every number in `range`, then complete.
pub fn range(range: Range<i64>) -> RangeSource {
    RangeSource::new(range)
}

/// Emit `value`, then complete.
pub fn just<T>(value: T) -> JustSource<T> {
    IterSource::new(vec![value])
}

pub fn empty() -> EmptySource {
    EmptySource
}

pub fn error(error: Error) -> ErrorSource {
    ErrorSource { error }
}

pub fn never() -> NeverSource {
    NeverSource
}
