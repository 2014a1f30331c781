//! Ready-made consumers.
//!
//! [`LambdaConsumer`] adapts closures to the [`Consumer`] trait, and
//! [`StrictConsumer`] guards any consumer against a misbehaving upstream by
//! classifying out-of-protocol signals as dropped instead of delivering them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::core::demand::{Demand, SubscriptionCell, UNBOUNDED};
use crate::core::traits::{Consumer, Subscription};
use crate::error::{Error, Result};
use crate::hooks;
use crate::scheduler::Disposable;

type NextFn<T> = Box<dyn Fn(T) -> Result<()> + Send + Sync>;
type ErrorFn = Box<dyn Fn(Error) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// A consumer built from closures.
///
/// A failing `on_next` closure cancels the upstream; the error goes through the
/// operator-error hook and is then handed to the error closure.
///
/// # Examples
///
/// ```rust
/// use fluxweld::core::LambdaConsumer;
///
/// let consumer = LambdaConsumer::new(|x: i32| {
///     println!("got {x}");
///     Ok(())
/// })
/// .on_complete(|| println!("done"))
/// .initial_request(16);
/// ```
pub struct LambdaConsumer<T> {
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
    initial_request: u64,
    context: Context,
    upstream: SubscriptionCell,
    done: AtomicBool,
}

impl<T: Send + 'static> LambdaConsumer<T> {
    /// Create a consumer that requests unbounded demand.
    pub fn new<F>(on_next: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            on_next: Box::new(on_next),
            on_error: None,
            on_complete: None,
            initial_request: UNBOUNDED,
            context: Context::empty(),
            upstream: SubscriptionCell::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Set the error callback
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Set the completion callback
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Set the demand requested on subscription
    pub fn initial_request(mut self, n: u64) -> Self {
        self.initial_request = n;
        self
    }

    /// Set the Context contributed upstream
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Request more items from the upstream.
    pub fn request(&self, n: u64) {
        self.upstream.request(n);
    }
}

impl<T: Send + 'static> Consumer<T> for LambdaConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(subscription) && self.initial_request > 0 {
            self.upstream.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            hooks::next_dropped(value);
            return;
        }
        if let Err(error) = (self.on_next)(value) {
            self.upstream.cancel();
            let error = hooks::operator_error(error, None);
            self.on_error(error);
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::error_dropped(error);
            return;
        }
        match &self.on_error {
            Some(f) => f(error),
            None => hooks::error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(f) = &self.on_complete {
            f();
        }
    }

    fn current_context(&self) -> Context {
        self.context.clone()
    }
}

impl<T: Send + 'static> Disposable for LambdaConsumer<T> {
    fn dispose(&self) {
        self.upstream.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_cancelled() || self.done.load(Ordering::Acquire)
    }
}

struct StrictState {
    upstream: SubscriptionCell,
    outstanding: Demand,
}

impl Subscription for StrictState {
    fn request(&self, n: u64) {
        if n == 0 {
            tracing::warn!("non-positive request from downstream, cancelling upstream");
            self.upstream.cancel();
            return;
        }
        self.outstanding.add(n);
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

/// Enforces the protocol on signals *received* from an upstream.
///
/// - a second `on_subscribe` cancels the newcomer,
/// - a `Next` beyond the demand granted so far goes to the dropped-Next hook,
/// - anything after a terminal signal goes to the dropped hooks.
pub struct StrictConsumer<T> {
    actual: Arc<dyn Consumer<T>>,
    state: Arc<StrictState>,
    subscribed: AtomicBool,
    done: AtomicBool,
}

impl<T> StrictConsumer<T> {
    pub fn new(actual: Arc<dyn Consumer<T>>) -> Self {
        Self {
            actual,
            state: Arc::new(StrictState {
                upstream: SubscriptionCell::new(),
                outstanding: Demand::new(),
            }),
            subscribed: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }
}

impl<T: Send + 'static> Consumer<T> for StrictConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            tracing::warn!("on_subscribe called twice, cancelling the second subscription");
            subscription.cancel();
            return;
        }
        self.state.upstream.set(subscription);
        self.actual.on_subscribe(self.state.clone());
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            hooks::next_dropped(value);
            return;
        }
        if !self.state.outstanding.try_take_one() {
            tracing::warn!("upstream emitted beyond requested demand");
            hooks::next_dropped(value);
            return;
        }
        self.actual.on_next(value);
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::error_dropped(error);
            return;
        }
        self.actual.on_error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            tracing::debug!("completion after terminal signal ignored");
            return;
        }
        self.actual.on_complete();
    }

    fn current_context(&self) -> Context {
        self.actual.current_context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::demand::EmptySubscription;
    use crate::testing::TestConsumer;
    use parking_lot::Mutex;

    #[test]
    fn test_strict_consumer_drops_excess_next() {
        let probe = TestConsumer::<i32>::with_request(1);
        let strict = StrictConsumer::new(probe.clone());
        strict.on_subscribe(Arc::new(EmptySubscription));
        strict.on_next(1);
        strict.on_next(2);
        strict.on_complete();
        strict.on_complete();
        assert_eq!(probe.values(), vec![1]);
        assert_eq!(probe.completions(), 1);
    }

    #[test]
    fn test_lambda_consumer_failure_routes_to_error_callback() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let consumer = LambdaConsumer::new(|x: i32| {
            if x > 1 {
                Err(Error::custom("too big"))
            } else {
                Ok(())
            }
        })
        .on_error(move |e| sink.lock().push(e.to_string()));
        consumer.on_subscribe(Arc::new(EmptySubscription));
        consumer.on_next(1);
        consumer.on_next(2);
        assert_eq!(errors.lock().as_slice(), ["too big".to_string()]);
        assert!(consumer.is_disposed());
    }
}
