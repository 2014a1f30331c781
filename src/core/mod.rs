//! Core traits and types for the demand protocol.
//!
//! This module contains the producer/consumer contract, demand accounting and
//! the shared building blocks every processor is assembled from.

pub mod consumer;
pub mod demand;
pub mod registry;
pub mod traits;

// Re-export core items
pub use crate::error::{Error, Result};
pub use consumer::{LambdaConsumer, StrictConsumer};
pub use demand::{add_cap, validate, Demand, EmptySubscription, SubscriptionCell, WorkInProgress, UNBOUNDED};
pub use registry::{Handle, Registry};
pub use traits::{Consumer, Processor, Producer, Signal, Sink, Subscription};
