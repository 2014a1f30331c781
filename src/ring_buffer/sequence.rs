use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A padded atomic sequence number.
///
/// Aligned to 128 bytes so that neighbouring sequences never share a cache
/// line (adjacent-line prefetch pulls pairs of 64-byte lines on x86).
#[repr(align(128))]
pub struct Sequence {
    value: AtomicI64,
}

impl Sequence {
    /// Value of a sequence that has not seen any slot yet.
    pub const INITIAL: i64 = -1;

    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn add_and_get(&self, increment: i64) -> i64 {
        self.value.fetch_add(increment, Ordering::AcqRel) + increment
    }

    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(Self::INITIAL)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

/// Smallest value among `sequences`, or `default` if there are none.
pub fn minimum_sequence(sequences: &[Arc<Sequence>], default: i64) -> i64 {
    sequences.iter().map(|s| s.get()).min().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_initial_value() {
        assert_eq!(std::mem::align_of::<Sequence>(), 128);
        assert_eq!(Sequence::default().get(), -1);
    }

    #[test]
    fn test_minimum() {
        let seqs = vec![Arc::new(Sequence::new(4)), Arc::new(Sequence::new(2))];
        assert_eq!(minimum_sequence(&seqs, 10), 2);
        assert_eq!(minimum_sequence(&[], 10), 10);
        assert!(seqs[1].compare_and_set(2, 3));
        assert!(!seqs[1].compare_and_set(2, 5));
        assert_eq!(seqs[1].increment_and_get(), 4);
    }
}
