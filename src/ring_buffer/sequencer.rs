use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[cfg(debug_assertions)]
use parking_lot::Mutex;
use parking_lot::RwLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring_buffer::sequence::{minimum_sequence, Sequence};
use crate::ring_buffer::wait::{Backoff, WaitStrategy, Waiter};

/// Whether one or many threads claim slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProducerType {
    /// One producer at a time. Claim-to-publish is exclusive, so publication
    /// is a single cursor store.
    #[default]
    Single,
    /// Concurrent producers. Claims race on a CAS and each slot carries an
    /// availability marker, so consumers wait for contiguous publication.
    Multi,
}

/// Claims and publishes sequences, gated by the slowest consumer.
pub(crate) struct Sequencer {
    buffer_size: i64,
    index_mask: i64,
    index_shift: u32,
    producer_type: ProducerType,
    /// Highest claimed sequence.
    claimed: Sequence,
    /// Highest published sequence (single producer only).
    published: Sequence,
    /// Round number last published into each slot (multi producer only).
    available: Box<[AtomicI64]>,
    gating: RwLock<Arc<[Arc<Sequence>]>>,
    gating_cache: Sequence,
    /// Held from claim to publish by the single producer.
    producing: AtomicBool,
    /// Thread holding `producing`, to catch a second claim before publish.
    #[cfg(debug_assertions)]
    owner: Mutex<Option<std::thread::ThreadId>>,
    pub(crate) waiter: Waiter,
}

impl Sequencer {
    pub(crate) fn new(
        buffer_size: usize,
        producer_type: ProducerType,
        wait_strategy: WaitStrategy,
    ) -> Result<Self> {
        if buffer_size == 0 || !buffer_size.is_power_of_two() {
            return Err(Error::invalid_config(format!(
                "ring buffer size must be a power of two, got {buffer_size}"
            )));
        }
        let available = match producer_type {
            ProducerType::Single => Vec::new(),
            ProducerType::Multi => (0..buffer_size).map(|_| AtomicI64::new(-1)).collect(),
        };
        Ok(Self {
            buffer_size: buffer_size as i64,
            index_mask: buffer_size as i64 - 1,
            index_shift: buffer_size.trailing_zeros(),
            producer_type,
            claimed: Sequence::default(),
            published: Sequence::default(),
            available: available.into_boxed_slice(),
            gating: RwLock::new(Arc::from(Vec::new())),
            gating_cache: Sequence::default(),
            producing: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            owner: Mutex::new(None),
            waiter: Waiter::new(wait_strategy),
        })
    }

    #[inline]
    pub(crate) fn buffer_size(&self) -> i64 {
        self.buffer_size
    }

    #[inline]
    pub(crate) fn index(&self, sequence: i64) -> usize {
        (sequence & self.index_mask) as usize
    }

    pub(crate) fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    /// The sequence consumers wait on.
    #[inline]
    pub(crate) fn cursor_sequence(&self) -> &Sequence {
        match self.producer_type {
            ProducerType::Single => &self.published,
            ProducerType::Multi => &self.claimed,
        }
    }

    #[inline]
    pub(crate) fn cursor(&self) -> i64 {
        self.cursor_sequence().get()
    }

    #[inline]
    pub(crate) fn claimed(&self) -> i64 {
        self.claimed.get()
    }

    pub(crate) fn minimum_gating_sequence(&self, default: i64) -> i64 {
        minimum_sequence(&self.gating.read(), default)
    }

    /// Register a consumer sequence. Its value is raised to the current
    /// minimum if it lags behind, so the gating minimum never decreases.
    pub(crate) fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        let mut gating = self.gating.write();
        let floor = minimum_sequence(&gating, self.claimed.get());
        if sequence.get() < floor {
            sequence.set(floor);
        }
        let mut next: Vec<Arc<Sequence>> = gating.to_vec();
        next.push(sequence);
        *gating = Arc::from(next);
    }

    pub(crate) fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut gating = self.gating.write();
        let before = gating.len();
        let next: Vec<Arc<Sequence>> = gating
            .iter()
            .filter(|s| !Arc::ptr_eq(s, sequence))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *gating = Arc::from(next);
        removed
    }

    pub(crate) fn gating_count(&self) -> usize {
        self.gating.read().len()
    }

    fn begin_claim(&self) {
        if self.producer_type == ProducerType::Multi {
            return;
        }
        #[cfg(debug_assertions)]
        debug_assert_ne!(
            *self.owner.lock(),
            Some(std::thread::current().id()),
            "single producer claimed again before publishing"
        );
        let mut backoff = Backoff::new();
        while self
            .producing
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        self.set_owner(true);
    }

    fn abort_claim(&self) {
        if self.producer_type == ProducerType::Single {
            self.set_owner(false);
            self.producing.store(false, Ordering::Release);
        }
    }

    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    fn set_owner(&self, claiming: bool) {
        #[cfg(debug_assertions)]
        {
            *self.owner.lock() = claiming.then(|| std::thread::current().id());
        }
    }

    fn claim_once(&self, n: i64) -> Result<i64> {
        debug_assert!(n > 0 && n <= self.buffer_size, "claim of {n} slots");
        loop {
            let current = self.claimed.get();
            let next = current + n;
            let wrap_point = next - self.buffer_size;
            let cached = self.gating_cache.get();
            if wrap_point > cached || cached > current {
                let min = self.minimum_gating_sequence(current);
                self.gating_cache.set(min);
                if wrap_point > min {
                    return Err(Error::InsufficientCapacity);
                }
            }
            if self.claimed.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    /// Claim `n` slots without waiting.
    pub(crate) fn try_next(&self, n: i64) -> Result<i64> {
        self.begin_claim();
        let claimed = self.claim_once(n);
        if claimed.is_err() {
            self.abort_claim();
        }
        claimed
    }

    /// Claim `n` slots, waiting for capacity while `keep_waiting` holds.
    pub(crate) fn next_while(&self, n: i64, keep_waiting: impl Fn() -> bool) -> Option<i64> {
        self.begin_claim();
        let mut backoff = Backoff::new();
        loop {
            match self.claim_once(n) {
                Ok(sequence) => return Some(sequence),
                Err(_) if keep_waiting() => backoff.snooze(),
                Err(_) => {
                    self.abort_claim();
                    return None;
                }
            }
        }
    }

    /// Make `low..=high` visible to consumers.
    pub(crate) fn publish(&self, low: i64, high: i64) {
        debug_assert!(high <= self.claimed.get(), "publishing unclaimed sequence {high}");
        match self.producer_type {
            ProducerType::Single => {
                self.published.set(high);
                self.set_owner(false);
                self.producing.store(false, Ordering::Release);
            }
            ProducerType::Multi => {
                for sequence in low..=high {
                    let flag = sequence >> self.index_shift;
                    self.available[self.index(sequence)].store(flag, Ordering::Release);
                }
            }
        }
        self.waiter.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.available[self.index(sequence)].load(Ordering::Acquire) == sequence >> self.index_shift
    }

    /// Highest sequence in `low..=available` published without gaps.
    pub(crate) fn highest_published(&self, low: i64, available: i64) -> i64 {
        match self.producer_type {
            ProducerType::Single => available,
            ProducerType::Multi => {
                for sequence in low..=available {
                    if !self.is_available(sequence) {
                        return sequence - 1;
                    }
                }
                available
            }
        }
    }

    pub(crate) fn remaining_capacity(&self) -> i64 {
        let claimed = self.claimed.get();
        let consumed = self.minimum_gating_sequence(claimed);
        self.buffer_size - (claimed - consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(Sequencer::new(6, ProducerType::Single, WaitStrategy::BusySpin).is_err());
        assert!(Sequencer::new(0, ProducerType::Multi, WaitStrategy::BusySpin).is_err());
    }

    #[test]
    fn test_gating_blocks_wrap() {
        let sequencer = Sequencer::new(4, ProducerType::Multi, WaitStrategy::BusySpin).unwrap();
        let consumer = Arc::new(Sequence::default());
        sequencer.add_gating_sequence(consumer.clone());

        let high = sequencer.try_next(4).unwrap();
        assert_eq!(high, 3);
        sequencer.publish(0, high);
        assert!(matches!(sequencer.try_next(1), Err(Error::InsufficientCapacity)));

        consumer.set(1);
        assert_eq!(sequencer.try_next(2).unwrap(), 5);
        assert_eq!(sequencer.remaining_capacity(), 0);
    }

    #[test]
    fn test_multi_producer_contiguous_availability() {
        let sequencer = Sequencer::new(8, ProducerType::Multi, WaitStrategy::BusySpin).unwrap();
        let first = sequencer.try_next(1).unwrap();
        let second = sequencer.try_next(1).unwrap();
        sequencer.publish(second, second);
        // the gap at `first` hides `second`
        assert_eq!(sequencer.highest_published(first, second), first - 1);
        sequencer.publish(first, first);
        assert_eq!(sequencer.highest_published(first, second), second);
    }

    #[test]
    fn test_late_gating_sequence_is_raised_to_minimum() {
        let sequencer = Sequencer::new(8, ProducerType::Single, WaitStrategy::BusySpin).unwrap();
        let high = sequencer.try_next(3).unwrap();
        sequencer.publish(0, high);
        let late = Arc::new(Sequence::default());
        sequencer.add_gating_sequence(late.clone());
        assert_eq!(late.get(), 2);
        assert!(sequencer.remove_gating_sequence(&late));
        assert!(!sequencer.remove_gating_sequence(&late));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "claimed again before publishing")]
    fn test_single_producer_reclaim_without_publish_panics() {
        let sequencer = Sequencer::new(8, ProducerType::Single, WaitStrategy::BusySpin).unwrap();
        sequencer.try_next(1).unwrap();
        let _ = sequencer.try_next(1);
    }

    #[test]
    fn test_single_producer_reclaims_after_abort_and_publish() {
        let sequencer = Sequencer::new(2, ProducerType::Single, WaitStrategy::BusySpin).unwrap();
        let consumer = Arc::new(Sequence::default());
        sequencer.add_gating_sequence(consumer.clone());
        let high = sequencer.try_next(2).unwrap();
        sequencer.publish(0, high);
        assert!(sequencer.try_next(1).is_err());

        consumer.set(0);
        let next = sequencer.try_next(1).unwrap();
        assert_eq!(next, 2);
        sequencer.publish(next, next);
    }
}
