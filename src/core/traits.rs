//! Core traits for the demand protocol.
//!
//! This module defines the fundamental abstractions every producer/consumer pair
//! is built from: a [`Producer`] hands a [`Subscription`] to a [`Consumer`], the
//! consumer grants demand through it, and the producer emits at most that many
//! `Next` signals followed by at most one terminal signal.
//!
//! A [`Processor`] is both ends at once and exposes a [`Sink`] facade so that
//! arbitrary calling code can inject signals.

use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;

/// A single event travelling from producer to consumer.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// A value.
    Next(T),
    /// Terminal failure.
    Error(Error),
    /// Terminal success.
    Complete,
}

impl<T> Signal<T> {
    /// True for `Error` and `Complete`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// The carried value, if this is a `Next`.
    pub fn into_value(self) -> Option<T> {
        match self {
            Signal::Next(value) => Some(value),
            _ => None,
        }
    }

    /// Replays this signal into a consumer.
    pub fn dispatch(self, consumer: &dyn Consumer<T>) {
        match self {
            Signal::Next(value) => consumer.on_next(value),
            Signal::Error(error) => consumer.on_error(error),
            Signal::Complete => consumer.on_complete(),
        }
    }
}

/// The link between one producer and one consumer.
///
/// Both methods must be safe to call concurrently with emission.
pub trait Subscription: Send + Sync {
    /// Grant `n` more items of demand. `n` must be positive; demand saturates at
    /// `u64::MAX`, which means unbounded.
    fn request(&self, n: u64);

    /// Stop the flow. Idempotent, and never causes a terminal signal to be
    /// delivered to the cancelling consumer.
    fn cancel(&self);
}

/// The receiving side of the protocol.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use fluxweld::core::{Consumer, Subscription};
/// use fluxweld::Error;
///
/// struct LogConsumer {
///     seen: Mutex<Vec<String>>,
/// }
///
/// impl Consumer<String> for LogConsumer {
///     fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
///         subscription.request(u64::MAX);
///     }
///
///     fn on_next(&self, value: String) {
///         self.seen.lock().push(value);
///     }
///
///     fn on_error(&self, _error: Error) {}
///
///     fn on_complete(&self) {}
/// }
/// ```
pub trait Consumer<T>: Send + Sync {
    /// Called at most once, before any other signal.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    /// Called for each value, never beyond the demand granted so far.
    fn on_next(&self, value: T);

    /// Terminal failure. Nothing follows it.
    fn on_error(&self, error: Error);

    /// Terminal success. Nothing follows it.
    fn on_complete(&self);

    /// The Context this consumer contributes to everything upstream of it.
    ///
    /// Read once by each stage at subscription time.
    fn current_context(&self) -> Context {
        Context::empty()
    }
}

/// The emitting side of the protocol.
pub trait Producer<T>: Send + Sync {
    /// Attach a consumer.
    ///
    /// The returned subscription is the same one handed to
    /// [`Consumer::on_subscribe`], which lets the caller cancel without
    /// participating in the data flow.
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription>;
}

/// Facade used to push signals into a processor from arbitrary code.
pub trait Sink<T>: Send + Sync {
    /// Push a value.
    fn next(&self, value: T);

    /// Terminate with an error.
    fn error(&self, error: Error);

    /// Terminate successfully.
    fn complete(&self);
}

/// A value that is simultaneously a producer and a consumer.
pub trait Processor<T>: Producer<T> + Consumer<T> + Sink<T> {
    /// True once a terminal signal has been received or the processor was cancelled.
    fn is_terminated(&self) -> bool;

    /// Number of currently attached subscribers.
    fn subscriber_count(&self) -> usize;

    /// True if at least one subscriber is attached.
    fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// The terminal error, if the processor failed.
    fn terminal_error(&self) -> Option<Error>;
}

impl<T, P> Producer<T> for Arc<P>
where
    P: Producer<T> + ?Sized,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        (**self).subscribe(consumer)
    }
}

impl<T, S> Sink<T> for Arc<S>
where
    S: Sink<T> + ?Sized,
{
    fn next(&self, value: T) {
        (**self).next(value)
    }

    fn error(&self, error: Error) {
        (**self).error(error)
    }

    fn complete(&self) {
        (**self).complete()
    }
}
