use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring_buffer::sequence::Sequence;

/// How a consumer waits for the producer cursor to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WaitStrategy {
    /// Spin on the cursor. Lowest latency, burns a core.
    BusySpin,
    /// Spin briefly, then yield the thread.
    Yielding,
    /// Spin, yield, then sleep for short intervals.
    Sleeping,
    /// Park on a condition variable until a publish signals it.
    #[default]
    Blocking,
    /// Sleep for a fixed interval between checks.
    Parking(Duration),
}

const SPIN_TRIES: u32 = 100;
const SLEEP_TRIES: u32 = 200;
const BLOCKING_RECHECK: Duration = Duration::from_millis(10);

/// Per-ring waiting state. Only `Blocking` uses the lock.
pub(crate) struct Waiter {
    strategy: WaitStrategy,
    mutex: Mutex<()>,
    condvar: Condvar,
    signal_needed: AtomicBool,
}

impl Waiter {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            signal_needed: AtomicBool::new(false),
        }
    }

    pub(crate) fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Wait until `cursor >= sequence`, returning the observed cursor.
    pub(crate) fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        alerted: &AtomicBool,
    ) -> Result<i64> {
        let mut counter = match self.strategy {
            WaitStrategy::Sleeping => SLEEP_TRIES,
            _ => SPIN_TRIES,
        };
        loop {
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            if alerted.load(Ordering::Acquire) {
                return Err(Error::Alerted);
            }
            match self.strategy {
                WaitStrategy::BusySpin => std::hint::spin_loop(),
                WaitStrategy::Yielding => {
                    if counter == 0 {
                        std::thread::yield_now();
                    } else {
                        counter -= 1;
                        std::hint::spin_loop();
                    }
                }
                WaitStrategy::Sleeping => {
                    if counter > SPIN_TRIES {
                        counter -= 1;
                        std::hint::spin_loop();
                    } else if counter > 0 {
                        counter -= 1;
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(Duration::from_nanos(100));
                    }
                }
                WaitStrategy::Parking(interval) => std::thread::park_timeout(interval),
                WaitStrategy::Blocking => {
                    let mut guard = self.mutex.lock();
                    self.signal_needed.store(true, Ordering::Release);
                    if cursor.get() >= sequence || alerted.load(Ordering::Acquire) {
                        continue;
                    }
                    self.condvar.wait_for(&mut guard, BLOCKING_RECHECK);
                }
            }
        }
    }

    /// Wake blocked waiters after a publish.
    pub(crate) fn signal_all_when_blocking(&self) {
        if self.strategy == WaitStrategy::Blocking
            && self.signal_needed.swap(false, Ordering::AcqRel)
        {
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }

    /// Wake blocked waiters unconditionally, used by alerts.
    pub(crate) fn signal_all(&self) {
        if self.strategy == WaitStrategy::Blocking {
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }
}

/// Bounded spin-then-yield backoff for producers waiting on capacity.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < 6 {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else if self.step < 16 {
            std::thread::yield_now();
            self.step += 1;
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_returns_immediately_when_available() {
        let waiter = Waiter::new(WaitStrategy::BusySpin);
        let cursor = Sequence::new(5);
        let alerted = AtomicBool::new(false);
        assert_eq!(waiter.wait_for(3, &cursor, &alerted).unwrap(), 5);
    }

    #[test]
    fn test_alert_interrupts_wait() {
        let waiter = Waiter::new(WaitStrategy::Yielding);
        let cursor = Sequence::default();
        let alerted = AtomicBool::new(true);
        assert!(matches!(
            waiter.wait_for(0, &cursor, &alerted),
            Err(Error::Alerted)
        ));
    }

    #[test]
    fn test_blocking_wakes_on_publish() {
        let waiter = Arc::new(Waiter::new(WaitStrategy::Blocking));
        let cursor = Arc::new(Sequence::default());
        let alerted = Arc::new(AtomicBool::new(false));

        let handle = {
            let (waiter, cursor, alerted) = (waiter.clone(), cursor.clone(), alerted.clone());
            std::thread::spawn(move || waiter.wait_for(0, &cursor, &alerted))
        };
        std::thread::sleep(Duration::from_millis(5));
        cursor.set(0);
        waiter.signal_all_when_blocking();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }
}
