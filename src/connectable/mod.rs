//! Hot producers with an explicit connection lifecycle.
//!
//! A [`Multicast`] puts a processor between one upstream subscription and any
//! number of consumers. Consumers attach to the pending connection's processor
//! at any time; the upstream is only subscribed when the connection is made,
//! either by hand ([`Multicast::connect`]) or by one of the wrappers:
//!
//! - [`AutoConnect`] connects exactly once, on the n-th subscription.
//! - [`RefCount`] connects when n consumers are live and disconnects when the
//!   count drops below n again, optionally after a grace period.
//!
//! Disconnecting cancels the upstream and fails the consumers still attached
//! with `Error::Disconnected`; the next connection starts from a fresh
//! processor.

mod auto_connect;
mod multicast;
mod ref_count;

pub use auto_connect::AutoConnect;
pub use multicast::{Connection, Multicast, ProcessorFactory};
pub use ref_count::RefCount;
