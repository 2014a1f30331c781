//! Crate-wide defaults.
//!
//! [`Config`] holds the buffer sizes and limits processors fall back to when a
//! builder does not set them explicitly. [`Config::global`] is read once from
//! the environment:
//!
//! | Variable | Default |
//! |---|---|
//! | `FLUXWELD_BUFFER_SIZE_SMALL` | 256 |
//! | `FLUXWELD_BUFFER_SIZE_XS` | 32 |
//! | `FLUXWELD_TOPIC_MAX_SUBSCRIBERS` | 64 |
//!
//! Unparseable values are logged and ignored. Buffer sizes are rounded up to
//! the next power of two.

use std::str::FromStr;

use once_cell::sync::Lazy;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const ENV_BUFFER_SIZE_SMALL: &str = "FLUXWELD_BUFFER_SIZE_SMALL";
pub const ENV_BUFFER_SIZE_XS: &str = "FLUXWELD_BUFFER_SIZE_XS";
pub const ENV_TOPIC_MAX_SUBSCRIBERS: &str = "FLUXWELD_TOPIC_MAX_SUBSCRIBERS";

/// Default sizes and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Ring size, broadcast prefetch and replay history used by default.
    pub small_buffer_size: usize,
    /// Prefetch for lightweight bridges such as [`crate::util::into_stream`].
    pub xs_buffer_size: usize,
    /// Subscribers a topic accepts before rejecting with `Error::Capacity`.
    pub topic_max_subscribers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            small_buffer_size: 256,
            xs_buffer_size: 32,
            topic_max_subscribers: 64,
        }
    }
}

static GLOBAL: Lazy<Config> = Lazy::new(Config::from_env);

impl Config {
    /// Defaults overridden by the `FLUXWELD_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            small_buffer_size: env_or(ENV_BUFFER_SIZE_SMALL, defaults.small_buffer_size)
                .max(1)
                .next_power_of_two(),
            xs_buffer_size: env_or(ENV_BUFFER_SIZE_XS, defaults.xs_buffer_size)
                .max(1)
                .next_power_of_two(),
            topic_max_subscribers: env_or(ENV_TOPIC_MAX_SUBSCRIBERS, defaults.topic_max_subscribers)
                .max(1),
        }
    }

    /// The process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static Config {
        &GLOBAL
    }

    /// Set the small buffer size
    pub fn small_buffer_size(mut self, size: usize) -> Self {
        self.small_buffer_size = size;
        self
    }

    /// Set the extra-small buffer size
    pub fn xs_buffer_size(mut self, size: usize) -> Self {
        self.xs_buffer_size = size;
        self
    }

    /// Set the topic subscriber limit
    pub fn topic_max_subscribers(mut self, max: usize) -> Self {
        self.topic_max_subscribers = max;
        self
    }
}

fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "ignoring unparseable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.small_buffer_size, 256);
        assert_eq!(config.xs_buffer_size, 32);
        assert_eq!(config.topic_max_subscribers, 64);
    }

    #[test]
    fn test_env_or_falls_back() {
        assert_eq!(env_or("FLUXWELD_TEST_SURELY_UNSET", 9usize), 9);
    }

    #[test]
    fn test_builder() {
        let config = Config::default().small_buffer_size(8).topic_max_subscribers(2);
        assert_eq!(config.small_buffer_size, 8);
        assert_eq!(config.topic_max_subscribers, 2);
    }
}
