//! # Demand-driven reactive streams for Rust
//!
//! A consumer subscribes to a producer, requests as many values as it can
//! handle, and receives at most that many, followed by at most one terminal
//! signal. Everything in the crate is built on that contract.
//!
//! ## Core Concepts
//!
//! - **Producer** / **Consumer** / **Subscription**: the demand protocol
//! - **Processor**: a producer and a consumer at once, with a push [`Sink`](core::Sink) facade
//! - **RingBuffer**: a preallocated, lock-free buffer gating producers on their slowest consumer
//! - **Multicast**: one upstream subscription shared by many consumers, connected by hand,
//!   on the n-th subscriber, or while enough subscribers are live
//! - **Context**: immutable key/value data flowing upstream at subscription time
//!
//! ## Example
//!
//! ```rust
//! use fluxweld::prelude::*;
//!
//! let probe = TestConsumer::with_request(2);
//! Flux::range(1..101).subscribe_with(probe.clone());
//! assert_eq!(probe.values(), vec![1, 2]);
//!
//! probe.cancel();
//! assert_eq!(probe.completions(), 0);
//! ```

pub mod config;
pub mod connectable;
pub mod context;
pub mod core;
pub mod error;
pub mod flux;
pub mod hooks;
pub mod processors;
pub mod ring_buffer;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod testing;
pub mod util;

// Re-export commonly used items
pub mod prelude {
    pub use crate::connectable::{AutoConnect, Connection, Multicast, RefCount};
    pub use crate::context::Context;
    pub use crate::core::{Consumer, LambdaConsumer, Processor, Producer, Sink, Subscription};
    pub use crate::error::{Error, Result};
    pub use crate::flux::{Flux, ProducerExt};
    pub use crate::processors::{
        AsyncSink, DirectProcessor, EmitterProcessor, ReplayProcessor, TopicProcessor,
        UnicastProcessor, WorkQueueProcessor,
    };
    pub use crate::scheduler::{Disposable, Scheduler, TokioScheduler};
    pub use crate::sinks::{FluxSink, OverflowStrategy};
    pub use crate::testing::{TestConsumer, TestProducer};
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
