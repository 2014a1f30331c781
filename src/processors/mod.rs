//! Processor implementations.
//!
//! Every processor is both a [`Producer`](crate::core::Producer) and a
//! [`Consumer`](crate::core::Consumer): it can be subscribed to an upstream,
//! fed directly through its [`Sink`](crate::core::Sink) facade, and observed by
//! any number of subscribers (one, for [`UnicastProcessor`]).
//!
//! | Processor | Subscribers | Buffering |
//! |---|---|---|
//! | [`DirectProcessor`] | 0..N | none; lacking demand is an overflow |
//! | [`UnicastProcessor`] | 1 | pluggable [`Queue`] |
//! | [`EmitterProcessor`] | 0..N | shared bounded prefetch queue |
//! | [`ReplayProcessor`] | 0..N | count/age bounded history |
//! | [`TopicProcessor`] | 0..N | ring buffer, one loop per subscriber |
//! | [`WorkQueueProcessor`] | 0..N | ring buffer, competing workers |

mod direct;
mod emitter;
mod queue;
mod replay;
mod ring;
mod topic;
mod unicast;
mod work_queue;

pub use direct::DirectProcessor;
pub use emitter::{EmitterConfig, EmitterProcessor};
pub use queue::{BoundedQueue, Queue, UnboundedQueue};
pub use replay::ReplayProcessor;
pub use ring::RingProcessorConfig;
pub use topic::TopicProcessor;
pub use unicast::{UnicastBuilder, UnicastProcessor};
pub use work_queue::WorkQueueProcessor;

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::context::Context;
use crate::core::traits::Consumer;
use crate::error::{Error, Result};

/// Non-blocking, awaitable emission into a processor.
#[async_trait]
pub trait AsyncSink<T: Send + 'static>: Send + Sync {
    /// Push `value`, waiting asynchronously while the processor has no room.
    /// Fails with `Error::Rejected` if the processor terminated meanwhile.
    async fn emit(&self, value: T) -> Result<()>;
}

/// Write-once terminal signal cache. `Some(None)` is completion.
#[derive(Debug, Default)]
pub(crate) struct Terminal {
    signal: OnceLock<Option<Error>>,
}

impl Terminal {
    /// Returns false if a terminal was already recorded.
    pub(crate) fn set(&self, error: Option<Error>) -> bool {
        self.signal.set(error).is_ok()
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        self.signal.get().is_some()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.signal.get().and_then(|e| e.clone())
    }

    /// Replay the cached terminal, if any. Returns true if one was delivered.
    pub(crate) fn deliver<T>(&self, consumer: &dyn Consumer<T>) -> bool {
        match self.signal.get() {
            Some(Some(error)) => consumer.on_error(error.clone()),
            Some(None) => consumer.on_complete(),
            None => return false,
        }
        true
    }
}

/// The Context of a processor's first subscriber.
#[derive(Debug, Default)]
pub(crate) struct FirstContext(OnceLock<Context>);

impl FirstContext {
    pub(crate) fn record<T>(&self, consumer: &dyn Consumer<T>) {
        if self.0.get().is_none() {
            let _ = self.0.set(consumer.current_context());
        }
    }

    pub(crate) fn get(&self) -> Context {
        self.0.get().cloned().unwrap_or_default()
    }
}
