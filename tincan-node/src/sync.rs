//! SYNC producer
//!
//! When bit 30 of object 1005h is set and object 1006h holds a non-zero
//! communication cycle period, the node emits SYNC frames itself. With a
//! non-zero counter overflow value (object 1019h) each frame carries a
//! counter cycling 1..=overflow.

use tincan_common::{messages::SyncMessage, sdo::AbortCode};

use crate::dict::{RawValue, ScalarCell};

/// Periodic SYNC frame generation state
#[derive(Debug, Default)]
pub struct SyncProducer {
    countdown: u32,
    counter: u8,
}

impl SyncProducer {
    /// Create an idle producer
    pub const fn new() -> Self {
        Self {
            countdown: 0,
            counter: 0,
        }
    }

    /// Advance one millisecond tick
    ///
    /// `period_us` is object 1006h; generation is suspended while it is
    /// zero or `enabled` (bit 30 of 1005h) is clear.
    pub fn tick(&mut self, enabled: bool, period_us: u32, overflow: u8) -> Option<SyncMessage> {
        if !enabled || period_us == 0 {
            self.countdown = 0;
            self.counter = 0;
            return None;
        }
        // Periods shorter than the tick are clamped to one tick
        let ticks = (period_us / 1000).max(1);
        if self.countdown > 1 {
            self.countdown -= 1;
            return None;
        }
        self.countdown = ticks;
        let counter = if overflow > 0 {
            self.counter = if self.counter >= overflow {
                1
            } else {
                self.counter + 1
            };
            Some(self.counter)
        } else {
            None
        };
        Some(SyncMessage { counter })
    }
}

/// Cell for the SYNC counter overflow value (object 1019h)
///
/// Valid values are 0 (no counter) and 2..=240.
#[derive(Debug)]
pub struct SyncCounterCell {
    cell: ScalarCell<u8>,
}

impl SyncCounterCell {
    /// Create a cell with the given initial overflow value
    pub const fn new(value: u8) -> Self {
        Self {
            cell: ScalarCell::new(value),
        }
    }

    /// The current overflow value
    pub fn load(&self) -> u8 {
        self.cell.load()
    }
}

impl RawValue for SyncCounterCell {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.cell.read(offset, buf)
    }

    fn read_size(&self) -> usize {
        1
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() != 1 {
            return Err(AbortCode::DataTypeMismatch);
        }
        if data[0] == 1 || data[0] > 240 {
            return Err(AbortCode::InvalidValue);
        }
        self.cell.write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_produces_nothing() {
        let mut producer = SyncProducer::new();
        assert_eq!(producer.tick(false, 10_000, 0), None);
        assert_eq!(producer.tick(true, 0, 0), None);
    }

    #[test]
    fn period_and_counter_wrap() {
        let mut producer = SyncProducer::new();
        // 2 ms period, counter overflow 3
        assert_eq!(
            producer.tick(true, 2000, 3),
            Some(SyncMessage { counter: Some(1) })
        );
        assert_eq!(producer.tick(true, 2000, 3), None);
        assert_eq!(
            producer.tick(true, 2000, 3),
            Some(SyncMessage { counter: Some(2) })
        );
        assert_eq!(producer.tick(true, 2000, 3), None);
        assert_eq!(
            producer.tick(true, 2000, 3),
            Some(SyncMessage { counter: Some(3) })
        );
        assert_eq!(producer.tick(true, 2000, 3), None);
        assert_eq!(
            producer.tick(true, 2000, 3),
            Some(SyncMessage { counter: Some(1) })
        );
    }

    #[test]
    fn sub_millisecond_period_clamps() {
        let mut producer = SyncProducer::new();
        assert_eq!(producer.tick(true, 500, 0), Some(SyncMessage { counter: None }));
        assert_eq!(producer.tick(true, 500, 0), Some(SyncMessage { counter: None }));
    }

    #[test]
    fn overflow_cell_rejects_invalid() {
        let cell = SyncCounterCell::new(0);
        assert_eq!(cell.write(&[1]), Err(AbortCode::InvalidValue));
        assert_eq!(cell.write(&[241]), Err(AbortCode::InvalidValue));
        assert!(cell.write(&[240]).is_ok());
        assert_eq!(cell.load(), 240);
        assert!(cell.write(&[0]).is_ok());
    }
}
