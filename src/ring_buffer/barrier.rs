use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ring_buffer::sequencer::Sequencer;

/// Coordinates a consumer waiting on the producer cursor.
///
/// `alert` interrupts a wait in progress, which is how consumer loops are told
/// to shut down.
pub struct SequenceBarrier {
    sequencer: Arc<Sequencer>,
    alerted: AtomicBool,
}

impl SequenceBarrier {
    pub(crate) fn new(sequencer: Arc<Sequencer>) -> Self {
        Self {
            sequencer,
            alerted: AtomicBool::new(false),
        }
    }

    /// Wait until `sequence` is published. Returns the highest sequence that
    /// is safe to read, which may be larger than requested.
    pub fn wait_for(&self, sequence: i64) -> Result<i64> {
        self.check_alert()?;
        let available =
            self.sequencer
                .waiter
                .wait_for(sequence, self.sequencer.cursor_sequence(), &self.alerted)?;
        if available < sequence {
            return Ok(available);
        }
        Ok(self.sequencer.highest_published(sequence, available))
    }

    /// Highest sequence readable right now, without waiting.
    pub fn available(&self, sequence: i64) -> i64 {
        let cursor = self.sequencer.cursor();
        if cursor < sequence {
            return cursor;
        }
        self.sequencer.highest_published(sequence, cursor)
    }

    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor()
    }

    pub fn alert(&self) {
        self.alerted.store(true, Ordering::Release);
        self.sequencer.waiter.signal_all();
    }

    pub fn clear_alert(&self) {
        self.alerted.store(false, Ordering::Release);
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    pub fn check_alert(&self) -> Result<()> {
        if self.is_alerted() {
            Err(Error::Alerted)
        } else {
            Ok(())
        }
    }
}
