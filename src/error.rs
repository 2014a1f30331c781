//! Error types for the reactive-stream engine.
//!
//! Every terminal `on_error` signal carries an [`Error`]. Broadcast processors hand
//! the same terminal to many subscribers, so the type is `Clone` and wraps foreign
//! errors in an `Arc`.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// The main error type for the reactive-stream engine.
#[non_exhaustive]
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A bounded buffer rejected a value, or a value arrived without demand.
    #[error("overflow: {0}")]
    Overflow(Cow<'static, str>),

    /// A producer or consumer broke the subscription protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(Cow<'static, str>),

    /// `Subscription::request` was called with a non-positive amount.
    #[error("invalid request amount {0}: demand must be positive")]
    InvalidRequest(u64),

    /// A subscription attempt was refused by the producer.
    #[error("subscription rejected: {0}")]
    Rejected(Cow<'static, str>),

    /// A limited resource reached capacity.
    #[error("at capacity: {current}/{max}")]
    Capacity { current: usize, max: usize },

    /// A non-blocking ring-buffer claim found no free slot.
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// A builder or configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// A sequence barrier was alerted while waiting.
    #[error("sequence barrier alerted")]
    Alerted,

    /// A connectable producer was disconnected from its upstream.
    #[error("connection was disconnected from its upstream")]
    Disconnected,

    /// An operation timed out.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A user-supplied function failed while processing a signal.
    #[error("operator error: {0}")]
    Operator(Arc<dyn std::error::Error + Send + Sync>),

    /// A custom error with a message.
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create an overflow error
    pub fn overflow<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::Overflow(reason.into())
    }

    /// Create a protocol violation error
    pub fn protocol<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::ProtocolViolation(reason.into())
    }

    /// Create a rejection error
    pub fn rejected<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::Rejected(reason.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::InvalidConfig(reason.into())
    }

    /// Create an operator error from any error type
    pub fn operator<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Operator(Arc::new(error))
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Error::Timeout { duration_ms }
    }

    /// Create a capacity error
    pub fn capacity(current: usize, max: usize) -> Self {
        Error::Capacity { current, max }
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Returns a short stable label (snake_case) for use in log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Overflow(_) => "overflow",
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Rejected(_) => "rejected",
            Error::Capacity { .. } => "capacity",
            Error::InsufficientCapacity => "insufficient_capacity",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Alerted => "alerted",
            Error::Disconnected => "disconnected",
            Error::Timeout { .. } => "timeout",
            Error::Operator(_) => "operator",
            Error::Custom(_) => "custom",
        }
    }

    /// True for the overflow family (`Overflow`, `InsufficientCapacity`, `Capacity`).
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            Error::Overflow(_) | Error::InsufficientCapacity | Error::Capacity { .. }
        )
    }
}

// Common conversions
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Custom(format!("Timeout: {}", e))
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Operator(Arc::from(e))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into our Error type
pub trait IntoError<T> {
    fn into_operator_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_operator_error(self) -> Result<T> {
        self.map_err(Error::operator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(Error::overflow("full").as_label(), "overflow");
        assert_eq!(Error::Disconnected.as_label(), "disconnected");
        assert_eq!(Error::capacity(3, 3).as_label(), "capacity");
    }

    #[test]
    fn test_operator_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Result<()> = Err::<(), _>(io).into_operator_error();
        let err = err.unwrap_err();
        assert!(matches!(err, Error::Operator(_)));
        assert_eq!(err.to_string(), "operator error: boom");
    }

    #[test]
    fn test_overflow_family() {
        assert!(Error::InsufficientCapacity.is_overflow());
        assert!(Error::capacity(1, 1).is_overflow());
        assert!(!Error::Disconnected.is_overflow());
    }
}
