//! Stages that contribute to, read, or materialise the subscription Context.

use std::sync::Arc;

use crate::context::Context;
use crate::core::demand;
use crate::core::traits::{Consumer, Producer, Subscription};
use crate::error::{Error, Result};
use crate::hooks;

/// Contributes a Context to everything upstream of it.
///
/// The contributed pairs are merged under the downstream Context, so a key the
/// downstream already defines keeps its downstream value.
pub struct ContextWrite<T> {
    source: Arc<dyn Producer<T>>,
    contributed: Context,
}

impl<T: Send + 'static> ContextWrite<T> {
    pub fn new(source: Arc<dyn Producer<T>>, contributed: Context) -> Self {
        Self {
            source,
            contributed,
        }
    }
}

impl<T: Send + 'static> Producer<T> for ContextWrite<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let context = self.contributed.put_all(&consumer.current_context());
        self.source.subscribe(Arc::new(ContextWriteConsumer {
            actual: consumer,
            context,
        }))
    }
}

struct ContextWriteConsumer<T> {
    actual: Arc<dyn Consumer<T>>,
    context: Context,
}

impl<T: Send + 'static> Consumer<T> for ContextWriteConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.actual.on_next(value);
    }

    fn on_error(&self, error: Error) {
        self.actual.on_error(error);
    }

    fn on_complete(&self) {
        self.actual.on_complete();
    }

    fn current_context(&self) -> Context {
        self.context.clone()
    }
}

type ContextualFactory<T> = dyn Fn(&Context) -> Result<Arc<dyn Producer<T>>> + Send + Sync;

/// Builds its upstream per subscription from the subscriber's Context.
///
/// A failing factory terminates the subscriber with the error returned by the
/// operator-error hook.
pub struct DeferContextual<T> {
    factory: Box<ContextualFactory<T>>,
}

impl<T: Send + 'static> DeferContextual<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&Context) -> Result<Arc<dyn Producer<T>>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl<T: Send + 'static> Producer<T> for DeferContextual<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let context = consumer.current_context();
        match (self.factory)(&context) {
            Ok(source) => source.subscribe(consumer),
            Err(error) => demand::reject(&*consumer, hooks::operator_error(error, None)),
        }
    }
}

/// Pairs every value with the Context of the subscription that received it.
pub struct WithContext<T> {
    source: Arc<dyn Producer<T>>,
}

impl<T: Send + 'static> WithContext<T> {
    pub fn new(source: Arc<dyn Producer<T>>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Producer<(T, Context)> for WithContext<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<(T, Context)>>) -> Arc<dyn Subscription> {
        let context = consumer.current_context();
        self.source.subscribe(Arc::new(WithContextConsumer {
            actual: consumer,
            context,
        }))
    }
}

struct WithContextConsumer<T> {
    actual: Arc<dyn Consumer<(T, Context)>>,
    context: Context,
}

impl<T: Send + 'static> Consumer<T> for WithContextConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.actual.on_next((value, self.context.clone()));
    }

    fn on_error(&self, error: Error) {
        self.actual.on_error(error);
    }

    fn on_complete(&self) {
        self.actual.on_complete();
    }

    fn current_context(&self) -> Context {
        self.context.clone()
    }
}
