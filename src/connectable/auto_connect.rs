use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connectable::{Connection, Multicast};
use crate::core::traits::{Consumer, Producer, Subscription};

/// Connects a [`Multicast`] exactly once, when the n-th consumer subscribes.
///
/// Consumers arriving before that wait on the pending connection; consumers
/// arriving after it join the live one.
pub struct AutoConnect<T> {
    source: Multicast<T>,
    remaining: AtomicUsize,
    connection: Mutex<Option<Connection<T>>>,
}

impl<T: Send + 'static> AutoConnect<T> {
    pub(crate) fn new(source: Multicast<T>, n: usize) -> Self {
        let auto = Self {
            source,
            remaining: AtomicUsize::new(n),
            connection: Mutex::new(None),
        };
        if n == 0 {
            auto.connect();
        }
        auto
    }

    fn connect(&self) {
        let connection = self.source.connect();
        *self.connection.lock() = Some(connection);
    }

    /// The connection, once made. Disposing it disconnects for good: this
    /// wrapper never connects again.
    pub fn connection(&self) -> Option<Connection<T>> {
        self.connection.lock().clone()
    }

    /// Subscriptions still needed before connecting.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Producer<T> for AutoConnect<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let subscription = self.source.subscribe(consumer);
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
        if previous == Ok(1) {
            self.connect();
        }
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sink;
    use crate::testing::{TestConsumer, TestProducer};

    #[test]
    fn test_connects_on_nth_subscriber_only() {
        let upstream = TestProducer::<u8>::new();
        let auto = Multicast::publish(Arc::new(upstream.clone()), 8).auto_connect(2);

        let a = TestConsumer::new();
        auto.subscribe(a.clone());
        assert_eq!(upstream.subscriptions(), 0);
        assert_eq!(auto.remaining(), 1);

        let b = TestConsumer::new();
        auto.subscribe(b.clone());
        assert_eq!(upstream.subscriptions(), 1);

        let c = TestConsumer::new();
        auto.subscribe(c.clone());
        assert_eq!(upstream.subscriptions(), 1);

        upstream.next(5);
        assert_eq!(a.values(), vec![5]);
        assert_eq!(c.values(), vec![5]);
    }

    #[test]
    fn test_zero_connects_immediately() {
        let upstream = TestProducer::<u8>::new();
        let auto = Multicast::publish(Arc::new(upstream.clone()), 8).auto_connect(0);
        assert_eq!(upstream.subscriptions(), 1);
        assert!(auto.connection().is_some());
    }
}
