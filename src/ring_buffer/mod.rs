//! Lock-free circular buffer with sequence-based claiming.
//!
//! A [`RingBuffer`] is a power-of-two array of slots addressed by a monotonic
//! sequence number. Producers claim sequences, write the matching slots and
//! publish them; consumers track their own [`Sequence`] and wait on a
//! [`SequenceBarrier`] until the producer cursor passes the slot they need.
//! Every registered consumer sequence *gates* the producers: a slot is reused
//! only after all of them have moved past it.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use fluxweld::ring_buffer::{RingBuffer, RingBufferConfig};
//!
//! let ring = Arc::new(RingBuffer::new(RingBufferConfig::default().buffer_size(8))?);
//! let reader = ring.reader();
//!
//! ring.emit("a");
//! ring.emit("b");
//!
//! assert_eq!(reader.try_recv(), Some("a"));
//! assert_eq!(reader.try_recv(), Some("b"));
//! assert_eq!(reader.try_recv(), None);
//! # Ok::<(), fluxweld::Error>(())
//! ```

mod barrier;
mod sequence;
mod sequencer;
mod wait;

pub use barrier::SequenceBarrier;
pub use sequence::{minimum_sequence, Sequence};
pub use sequencer::ProducerType;
pub use wait::WaitStrategy;

pub(crate) use wait::Backoff;

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use sequencer::Sequencer;

/// Configuration for a [`RingBuffer`].
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Number of slots. Must be a power of two.
    pub buffer_size: usize,
    /// Single or multi producer claiming.
    pub producer_type: ProducerType,
    /// How consumers wait for new sequences.
    pub wait_strategy: WaitStrategy,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: Config::global().small_buffer_size,
            producer_type: ProducerType::Single,
            wait_strategy: WaitStrategy::Blocking,
        }
    }
}

impl RingBufferConfig {
    /// Set the number of slots
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the producer type
    pub fn producer_type(mut self, producer_type: ProducerType) -> Self {
        self.producer_type = producer_type;
        self
    }

    /// Set the consumer wait strategy
    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }
}

/// Fixed-capacity slot array with gated producer claims.
///
/// With [`ProducerType::Single`] every claim must be published before the
/// next claim is made; a second producer waits until the first publishes.
pub struct RingBuffer<T> {
    sequencer: Arc<Sequencer>,
    slots: Box<[UnsafeCell<Option<T>>]>,
}

// Slots are only written between claim and publish by the claiming producer,
// and only read after publication by consumers whose sequence gates reuse.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    pub fn new(config: RingBufferConfig) -> Result<Self> {
        let sequencer = Sequencer::new(
            config.buffer_size,
            config.producer_type,
            config.wait_strategy,
        )?;
        let slots = (0..config.buffer_size)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            sequencer: Arc::new(sequencer),
            slots,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.sequencer.buffer_size() as usize
    }

    pub fn producer_type(&self) -> ProducerType {
        self.sequencer.producer_type()
    }

    pub fn wait_strategy(&self) -> WaitStrategy {
        self.sequencer.waiter.strategy()
    }

    /// Highest sequence consumers may wait for.
    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor()
    }

    /// Highest sequence claimed by a producer, published or not.
    pub fn claimed_cursor(&self) -> i64 {
        self.sequencer.claimed()
    }

    /// Slots that can be claimed without waiting.
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Claim the next slot, waiting for the slowest consumer if the ring is full.
    pub fn next(&self) -> i64 {
        self.next_n(1)
    }

    /// Claim `n` slots, returning the highest claimed sequence.
    pub fn next_n(&self, n: usize) -> i64 {
        // an unconditional wait only ends with a claim
        self.sequencer
            .next_while(n as i64, || true)
            .unwrap_or_else(|| self.sequencer.claimed())
    }

    /// Claim the next slot, or fail with `Error::InsufficientCapacity`.
    pub fn try_next(&self) -> Result<i64> {
        self.try_next_n(1)
    }

    pub fn try_next_n(&self, n: usize) -> Result<i64> {
        self.sequencer.try_next(n as i64)
    }

    /// Publish a claimed sequence.
    pub fn publish(&self, sequence: i64) {
        self.sequencer.publish(sequence, sequence);
    }

    /// Publish a claimed batch.
    pub fn publish_range(&self, low: i64, high: i64) {
        self.sequencer.publish(low, high);
    }

    /// Store `value` in the slot for `sequence`.
    ///
    /// # Safety
    ///
    /// `sequence` must have been claimed by the caller and not yet published.
    pub unsafe fn write(&self, sequence: i64, value: T) {
        self.write_slot(sequence, Some(value));
    }

    unsafe fn write_slot(&self, sequence: i64, value: Option<T>) {
        *self.slots[self.sequencer.index(sequence)].get() = value;
    }

    /// Clone of the value published at `sequence`; `None` for a skipped slot.
    ///
    /// # Safety
    ///
    /// `sequence` must be published and the caller must hold a registered
    /// gating sequence below it, so the slot cannot be reclaimed meanwhile.
    pub(crate) unsafe fn read(&self, sequence: i64) -> Option<T>
    where
        T: Clone,
    {
        (*self.slots[self.sequencer.index(sequence)].get()).clone()
    }

    /// Move the value out of a published slot.
    ///
    /// # Safety
    ///
    /// As for [`RingBuffer::read`], and the caller must be the only reader of
    /// `sequence`.
    pub(crate) unsafe fn take(&self, sequence: i64) -> Option<T> {
        (*self.slots[self.sequencer.index(sequence)].get()).take()
    }

    /// Claim, fill and publish one slot. `fill` runs after the claim succeeded
    /// and decides the slot content; `None` publishes an empty slot.
    ///
    /// Returns `None` without claiming if `keep_waiting` turned false while the
    /// ring was full.
    pub(crate) fn commit_while<F>(&self, fill: F, keep_waiting: impl Fn() -> bool) -> Option<i64>
    where
        F: FnOnce(i64) -> Option<T>,
    {
        let sequence = self.sequencer.next_while(1, keep_waiting)?;
        // SAFETY: claimed above, published below.
        unsafe { self.write_slot(sequence, fill(sequence)) };
        self.sequencer.publish(sequence, sequence);
        Some(sequence)
    }

    /// Claim, write and publish `value`, waiting for capacity.
    pub fn emit(&self, value: T) -> i64 {
        let mut value = Some(value);
        self.commit_while(|_| value.take(), || true)
            .unwrap_or_else(|| self.sequencer.claimed())
    }

    /// Publish `value` if a slot is free, otherwise hand it back.
    pub fn try_emit(&self, value: T) -> std::result::Result<i64, T> {
        match self.sequencer.try_next(1) {
            Ok(sequence) => {
                // SAFETY: claimed above, published below.
                unsafe { self.write_slot(sequence, Some(value)) };
                self.sequencer.publish(sequence, sequence);
                Ok(sequence)
            }
            Err(_) => Err(value),
        }
    }

    /// Register a consumer sequence. A sequence behind the current gating
    /// minimum is raised to it.
    pub fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.sequencer.add_gating_sequence(sequence);
    }

    /// Deregister a consumer sequence. Returns false if it was not registered.
    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.sequencer.remove_gating_sequence(sequence)
    }

    /// Slowest registered consumer, or the claimed cursor if there is none.
    pub fn minimum_gating_sequence(&self) -> i64 {
        self.sequencer
            .minimum_gating_sequence(self.sequencer.claimed())
    }

    pub fn gating_sequence_count(&self) -> usize {
        self.sequencer.gating_count()
    }

    pub fn new_barrier(&self) -> SequenceBarrier {
        SequenceBarrier::new(self.sequencer.clone())
    }

    /// Attach a consumer that sees everything published from now on.
    pub fn reader(self: &Arc<Self>) -> RingReader<T> {
        let sequence = Arc::new(Sequence::new(self.claimed_cursor()));
        self.add_gating_sequence(sequence.clone());
        RingReader {
            ring: self.clone(),
            sequence,
            barrier: self.new_barrier(),
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("buffer_size", &self.buffer_size())
            .field("producer_type", &self.producer_type())
            .field("cursor", &self.cursor())
            .field("gating", &self.gating_sequence_count())
            .finish()
    }
}

/// An independent consumer cursor over a [`RingBuffer`].
///
/// Dropping the reader deregisters its sequence so it no longer gates producers.
pub struct RingReader<T> {
    ring: Arc<RingBuffer<T>>,
    sequence: Arc<Sequence>,
    barrier: SequenceBarrier,
}

impl<T: Clone> RingReader<T> {
    /// Next published value, if one is ready.
    pub fn try_recv(&self) -> Option<T> {
        loop {
            let next = self.sequence.get() + 1;
            if self.barrier.available(next) < next {
                return None;
            }
            // SAFETY: `next` is published and our sequence (next - 1) gates it.
            let value = unsafe { self.ring.read(next) };
            self.sequence.set(next);
            if value.is_some() {
                return value;
            }
        }
    }

    /// Next published value, waiting with the ring's wait strategy.
    /// Fails with `Error::Alerted` once [`RingReader::alert`] was called.
    pub fn recv(&self) -> Result<T> {
        loop {
            let next = self.sequence.get() + 1;
            let available = self.barrier.wait_for(next)?;
            if available < next {
                continue;
            }
            // SAFETY: as in `try_recv`.
            let value = unsafe { self.ring.read(next) };
            self.sequence.set(next);
            if let Some(value) = value {
                return Ok(value);
            }
        }
    }

    /// Last sequence consumed.
    pub fn position(&self) -> i64 {
        self.sequence.get()
    }

    /// Interrupt a blocked [`RingReader::recv`].
    pub fn alert(&self) {
        self.barrier.alert();
    }
}

impl<T> Drop for RingReader<T> {
    fn drop(&mut self) {
        self.ring.remove_gating_sequence(&self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;

    fn ring<T>(size: usize, producer_type: ProducerType) -> Arc<RingBuffer<T>> {
        Arc::new(
            RingBuffer::new(
                RingBufferConfig::default()
                    .buffer_size(size)
                    .producer_type(producer_type)
                    .wait_strategy(WaitStrategy::Yielding),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_try_emit_respects_slowest_reader() {
        let ring = ring::<u32>(2, ProducerType::Single);
        let reader = ring.reader();
        assert_eq!(ring.try_emit(1), Ok(0));
        assert_eq!(ring.try_emit(2), Ok(1));
        assert_eq!(ring.try_emit(3), Err(3));
        assert!(matches!(ring.try_next(), Err(Error::InsufficientCapacity)));

        assert_eq!(reader.try_recv(), Some(1));
        assert_eq!(ring.try_emit(3), Ok(2));
        drop(reader);
        assert_eq!(ring.gating_sequence_count(), 0);
        assert!(ring.try_emit(4).is_ok());
    }

    #[test]
    fn test_multi_producer_delivers_everything_once() {
        let ring = ring::<(usize, usize)>(16, ProducerType::Multi);
        let reader = ring.reader();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        ring.emit((p, i));
                    }
                })
            })
            .collect();

        let mut last = [None::<usize>; 4];
        for _ in 0..1000 {
            let (p, i) = reader.recv().unwrap();
            // per-producer order is preserved
            assert!(last[p].map_or(true, |prev| prev < i));
            last[p] = Some(i);
        }
        for handle in producers {
            handle.join().unwrap();
        }
        assert_eq!(last, [Some(249); 4]);
        assert_eq!(reader.try_recv(), None);
    }

    #[test]
    fn test_alert_interrupts_recv() {
        let ring = ring::<u8>(4, ProducerType::Single);
        let reader = ring.reader();
        reader.alert();
        assert!(matches!(reader.recv(), Err(Error::Alerted)));
    }

    proptest! {
        #[test]
        fn prop_every_reader_sees_publication_order(
            items in proptest::collection::vec(any::<u16>(), 0..64),
            readers in 1usize..4,
        ) {
            let ring = ring::<u16>(8, ProducerType::Single);
            let cursors: Vec<_> = (0..readers).map(|_| ring.reader()).collect();
            let mut seen = vec![Vec::new(); readers];

            // publish with readers draining at different paces
            for (n, item) in items.iter().enumerate() {
                while ring.try_emit(*item).is_err() {
                    for (r, cursor) in cursors.iter().enumerate() {
                        if let Some(v) = cursor.try_recv() {
                            seen[r].push(v);
                        }
                    }
                }
                if let Some(v) = cursors[n % readers].try_recv() {
                    seen[n % readers].push(v);
                }
            }
            for (r, cursor) in cursors.iter().enumerate() {
                while let Some(v) = cursor.try_recv() {
                    seen[r].push(v);
                }
            }
            for observed in seen {
                prop_assert_eq!(&observed, &items);
            }
        }
    }
}
