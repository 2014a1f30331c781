//! The assembly surface.
//!
//! [`Flux`] is a cheap, clonable handle over any producer. Building one runs
//! the per-stage assembly hooks; subscribing through [`Flux::subscribe_with`]
//! runs the outermost-stage hooks and guards the consumer against protocol
//! violations. [`ProducerExt`] adds the same fluent constructors to every
//! [`Producer`].
//!
//! # Examples
//!
//! ```rust
//! use fluxweld::flux::{Flux, ProducerExt};
//! use fluxweld::context::Context;
//! use fluxweld::testing::TestConsumer;
//!
//! let probe = TestConsumer::new();
//! Flux::from_iter(vec!["a", "b"])
//!     .context_write(Context::of("tenant", 7u32))
//!     .subscribe_with(probe.clone());
//!
//! assert_eq!(probe.values(), vec!["a", "b"]);
//! assert_eq!(probe.completions(), 1);
//! ```

use std::ops::Range;
use std::sync::Arc;

use crate::connectable::Multicast;
use crate::context::{Context, ContextWrite, DeferContextual, WithContext};
use crate::core::consumer::{LambdaConsumer, StrictConsumer};
use crate::core::traits::{Consumer, Processor, Producer, Subscription};
use crate::error::{Error, Result};
use crate::hooks;
use crate::sinks::{self, FluxSink, OverflowStrategy};
use crate::sources;
use crate::util::{self, ProducerStream};

/// A handle over a type-erased producer.
pub struct Flux<T> {
    source: Arc<dyn Producer<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    fn assemble(stage: &'static str, source: Arc<dyn Producer<T>>) -> Self {
        Self {
            source: hooks::on_assembly(stage, source),
        }
    }

    /// Wrap an existing producer.
    pub fn from_producer(source: Arc<dyn Producer<T>>) -> Self {
        Self::assemble("from_producer", source)
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Clone + Sync,
    {
        Self::assemble("from_iter", Arc::new(sources::from_iter(items)))
    }

    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::assemble("just", Arc::new(sources::just(value)))
    }

    pub fn empty() -> Self {
        Self::assemble("empty", Arc::new(sources::empty()))
    }

    pub fn error(error: Error) -> Self {
        Self::assemble("error", Arc::new(sources::error(error)))
    }

    pub fn never() -> Self {
        Self::assemble("never", Arc::new(sources::never()))
    }

    /// Emit through a [`FluxSink`] handed to `emitter` once per subscriber.
    pub fn create<F>(emitter: F, strategy: OverflowStrategy) -> Self
    where
        F: Fn(FluxSink<T>) + Send + Sync + 'static,
    {
        Self::assemble("create", Arc::new(sinks::create(emitter, strategy)))
    }

    /// Build the upstream per subscription from the subscriber's Context.
    pub fn defer_contextual<F>(factory: F) -> Self
    where
        F: Fn(&Context) -> Result<Arc<dyn Producer<T>>> + Send + Sync + 'static,
    {
        Self::assemble("defer_contextual", Arc::new(DeferContextual::new(factory)))
    }

    /// The underlying producer.
    pub fn into_producer(self) -> Arc<dyn Producer<T>> {
        self.source
    }

    /// Subscribe `consumer` as the outermost stage.
    ///
    /// Signals that break the protocol are diverted to the dropped hooks
    /// instead of reaching `consumer`.
    pub fn subscribe_with(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let source = hooks::on_last_assembly("subscribe", self.source.clone());
        source.subscribe(Arc::new(StrictConsumer::new(consumer)))
    }

    /// Subscribe a closure with unbounded demand.
    ///
    /// Errors go to the dropped-error hook; use [`LambdaConsumer`] directly
    /// for finer control.
    pub fn subscribe_fn<F>(&self, on_next: F) -> Arc<dyn Subscription>
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(Arc::new(LambdaConsumer::new(on_next)))
    }

    /// Consume as a `Stream` requesting `prefetch` values at a time.
    pub fn into_stream(self, prefetch: usize) -> ProducerStream<T> {
        util::into_stream(self.source, prefetch)
    }
}

impl Flux<i64> {
    pub fn range(range: Range<i64>) -> Self {
        Self::assemble("range", Arc::new(sources::range(range)))
    }
}

impl<T: Send + 'static> Producer<T> for Flux<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        self.source.subscribe(consumer)
    }
}

/// Fluent constructors available on every producer.
pub trait ProducerExt<T: Send + 'static>: Producer<T> + Sized + 'static {
    /// Erase the producer type.
    fn into_flux(self) -> Flux<T> {
        Flux::from_producer(Arc::new(self))
    }

    /// Share one upstream subscription through an `EmitterProcessor`.
    fn publish(self) -> Multicast<T>
    where
        T: Clone + Sync,
    {
        self.publish_with(crate::config::Config::global().small_buffer_size)
    }

    fn publish_with(self, prefetch: usize) -> Multicast<T>
    where
        T: Clone + Sync,
    {
        Multicast::publish(Arc::new(self), prefetch)
    }

    /// Share one upstream subscription, replaying the last `history` values.
    fn replay(self, history: usize) -> Multicast<T>
    where
        T: Clone + Sync,
    {
        Multicast::replay(Arc::new(self), history)
    }

    /// Share one upstream subscription through processors built by `factory`.
    fn multicast<F>(self, factory: F) -> Multicast<T>
    where
        F: Fn() -> Arc<dyn Processor<T>> + Send + Sync + 'static,
    {
        Multicast::new(Arc::new(self), factory)
    }

    /// Contribute `context` to every stage upstream of this one.
    fn context_write(self, context: Context) -> Flux<T> {
        Flux::assemble("context_write", Arc::new(ContextWrite::new(Arc::new(self), context)))
    }

    /// Pair each value with the subscription's Context.
    fn with_context(self) -> Flux<(T, Context)> {
        Flux::assemble("with_context", Arc::new(WithContext::new(Arc::new(self))))
    }
}

impl<T: Send + 'static, P: Producer<T> + 'static> ProducerExt<T> for P {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::demand::UNBOUNDED;
    use crate::core::Sink;
    use crate::testing::{TestConsumer, TestProducer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_range_honours_demand() {
        let probe = TestConsumer::with_request(2);
        Flux::range(0..5).subscribe_with(probe.clone());
        assert_eq!(probe.values(), vec![0, 1]);
        probe.request(UNBOUNDED);
        assert_eq!(probe.values(), vec![0, 1, 2, 3, 4]);
        assert_eq!(probe.completions(), 1);
    }

    #[test]
    fn test_subscribe_with_guards_against_overproduction() {
        let upstream = TestProducer::<u8>::new();
        let probe = TestConsumer::with_request(1);
        Flux::from_producer(Arc::new(upstream.clone())).subscribe_with(probe.clone());

        upstream.next(1);
        upstream.next(2);
        assert_eq!(probe.values(), vec![1]);
    }

    #[test]
    fn test_subscribe_fn_receives_values() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        Flux::from_iter(vec![1, 2, 3]).subscribe_fn(move |v| {
            counter.fetch_add(v, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_context_reaches_deferred_source() {
        let probe = TestConsumer::new();
        Flux::defer_contextual(|ctx| {
            let user: String = ctx.get_or_default("user", String::from("anonymous"));
            Ok(Arc::new(sources::just(user)) as Arc<dyn Producer<String>>)
        })
        .context_write(Context::of("user", String::from("ada")))
        .subscribe_with(probe.clone());

        assert_eq!(probe.values(), vec![String::from("ada")]);
    }

    #[test]
    fn test_with_context_pairs_values() {
        let probe = TestConsumer::<(u8, Context)>::new()
            .with_context(Context::of("k", 1u8));
        Flux::just(4u8).with_context().subscribe_with(probe.clone());

        let values = probe.values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, 4);
        assert_eq!(values[0].1.get::<u8>("k"), Some(&1));
    }

    #[test]
    fn test_publish_shares_upstream() {
        let upstream = TestProducer::<char>::new();
        let shared = upstream.clone().publish_with(4);
        let a = TestConsumer::new();
        let b = TestConsumer::new();
        shared.subscribe(a.clone());
        shared.subscribe(b.clone());
        shared.connect();

        upstream.next('x');
        assert_eq!(upstream.subscriptions(), 1);
        assert_eq!(a.values(), vec!['x']);
        assert_eq!(b.values(), vec!['x']);
    }
}
