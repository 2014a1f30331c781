//! Bridges to the `futures` ecosystem.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::Config;
use crate::core::demand::SubscriptionCell;
use crate::core::traits::{Consumer, Producer, Subscription};
use crate::error::{Error, Result};
use crate::hooks;

/// Subscribe to `producer` and expose its signals as a [`Stream`].
///
/// Demand is requested `prefetch` at a time (the configured extra-small
/// buffer size when `0`) and replenished once three quarters of it has been
/// consumed. The stream yields `Err` for an error signal and then ends.
/// Dropping the stream cancels the subscription.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use futures::StreamExt;
/// use fluxweld::{sources, util};
///
/// #[tokio::main]
/// async fn main() {
///     let stream = util::into_stream(Arc::new(sources::range(0..4)), 2);
///     let values: Vec<i64> = stream.filter_map(|r| async move { r.ok() }).collect().await;
///     assert_eq!(values, vec![0, 1, 2, 3]);
/// }
/// ```
pub fn into_stream<T: Send + 'static>(
    producer: Arc<dyn Producer<T>>,
    prefetch: usize,
) -> ProducerStream<T> {
    let prefetch = match prefetch {
        0 => Config::global().xs_buffer_size,
        n => n,
    };
    let (sender, receiver) = mpsc::unbounded_channel();
    let upstream = Arc::new(SubscriptionCell::new());
    producer.subscribe(Arc::new(ChannelConsumer {
        sender: Mutex::new(Some(sender)),
        upstream: upstream.clone(),
        prefetch: prefetch as u64,
    }));
    ProducerStream {
        receiver: UnboundedReceiverStream::new(receiver),
        upstream,
        limit: prefetch - (prefetch >> 2),
        consumed: 0,
    }
}

struct ChannelConsumer<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<Result<T>>>>,
    upstream: Arc<SubscriptionCell>,
    prefetch: u64,
}

impl<T: Send + 'static> Consumer<T> for ChannelConsumer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(subscription) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, value: T) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if let Err(mpsc::error::SendError(Ok(value))) = sender.send(Ok(value)) {
                    hooks::next_dropped(value);
                }
            }
            None => hooks::next_dropped(value),
        }
    }

    fn on_error(&self, error: Error) {
        match self.sender.lock().take() {
            Some(sender) => {
                if let Err(mpsc::error::SendError(Err(error))) = sender.send(Err(error)) {
                    hooks::error_dropped(error);
                }
            }
            None => hooks::error_dropped(error),
        }
    }

    fn on_complete(&self) {
        self.sender.lock().take();
    }
}

/// A [`Stream`] over a producer's signals, returned by [`into_stream`].
pub struct ProducerStream<T> {
    receiver: UnboundedReceiverStream<Result<T>>,
    upstream: Arc<SubscriptionCell>,
    limit: usize,
    consumed: usize,
}

impl<T> Stream for ProducerStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.receiver).poll_next(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.consumed += 1;
            if this.consumed >= this.limit {
                this.upstream.request(this.consumed as u64);
                this.consumed = 0;
            }
        }
        polled
    }
}

impl<T> Drop for ProducerStream<T> {
    fn drop(&mut self) {
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sink;
    use crate::testing::TestProducer;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_replenishes_in_batches() {
        let upstream = TestProducer::<u32>::new();
        let mut stream = into_stream(Arc::new(upstream.clone()), 4);
        assert_eq!(upstream.requests(), vec![4]);

        for i in 0..4 {
            upstream.next(i);
        }
        for i in 0..3 {
            assert_eq!(stream.next().await.and_then(|r| r.ok()), Some(i));
        }
        assert_eq!(upstream.requests(), vec![4, 3]);
    }

    #[tokio::test]
    async fn test_stream_yields_error_then_ends() {
        let upstream = TestProducer::<u32>::new();
        let mut stream = into_stream(Arc::new(upstream.clone()), 8);
        upstream.next(1);
        upstream.error(Error::custom("boom"));

        assert!(matches!(stream.next().await, Some(Ok(1))));
        assert!(matches!(stream.next().await, Some(Err(Error::Custom(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_cancels_upstream() {
        let upstream = TestProducer::<u32>::new();
        let stream = into_stream(Arc::new(upstream.clone()), 8);
        drop(stream);
        assert_eq!(upstream.cancellations(), 1);
    }
}
