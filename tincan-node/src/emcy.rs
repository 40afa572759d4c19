//! Emergency (EMCY) producer
//!
//! Errors raised by the application or by the stack itself are queued
//! and drained one frame per [`Node::process`](crate::Node::process)
//! call, subject to the inhibit time configured in object 1015h. Each
//! transmitted error is also recorded in the pre-defined error field
//! (object 1003h), newest first.

use core::cell::UnsafeCell;

use heapless::Deque;
use tincan_common::{
    messages::{EmcyMessage, NmtState},
    objects::SubInfo,
    sdo::AbortCode,
};

use crate::dict::{DictCallback, DictEntry, ScalarCell, WriteOutcome};

/// Number of errors retained in object 1003h
pub const EMCY_HISTORY_DEPTH: usize = 8;

/// Emergency error codes raised by the stack itself
pub mod codes {
    /// Error reset / no error
    pub const RESET: u16 = 0x0000;
    /// CAN controller reached warning level
    pub const CAN_WARNING: u16 = 0x8100;
    /// CAN controller went error passive
    pub const CAN_PASSIVE: u16 = 0x8120;
    /// Heartbeat consumer timeout (life guarding event)
    pub const LIFEGUARD: u16 = 0x8130;
}

/// The pre-defined error field (object 1003h)
///
/// Shared with the SDO server through the dictionary, so access is
/// guarded by a critical section.
#[allow(missing_debug_implementations)]
pub struct EmcyHistory {
    errors: UnsafeCell<Deque<u32, EMCY_HISTORY_DEPTH>>,
}

// Access only happens inside critical sections
unsafe impl Sync for EmcyHistory {}

impl EmcyHistory {
    /// Create an empty history
    pub const fn new() -> Self {
        Self {
            errors: UnsafeCell::new(Deque::new()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Deque<u32, EMCY_HISTORY_DEPTH>) -> R) -> R {
        critical_section::with(|_| f(unsafe { &mut *self.errors.get() }))
    }

    /// Record a transmitted error, newest first
    pub fn push(&self, code: u16, info: &[u8; 5]) {
        let value = code as u32 | (u16::from_le_bytes([info[0], info[1]]) as u32) << 16;
        self.with(|errors| {
            if errors.is_full() {
                errors.pop_back();
            }
            // Cannot fail, an element was just popped if full
            errors.push_front(value).ok();
        });
    }

    /// Number of stored errors
    pub fn len(&self) -> usize {
        self.with(|errors| errors.len())
    }

    /// True when no errors are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, slot: usize) -> Option<u32> {
        self.with(|errors| errors.iter().nth(slot).copied())
    }
}

impl Default for EmcyHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl DictCallback for EmcyHistory {
    fn read(
        &self,
        _od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        if sub == 0 {
            if buf.is_empty() || offset != 0 {
                return Ok(0);
            }
            buf[0] = self.len() as u8;
            Ok(1)
        } else {
            let value = self
                .get(sub as usize - 1)
                .ok_or(AbortCode::NoSuchSubIndex)?;
            let bytes = value.to_le_bytes();
            if offset >= 4 {
                return Ok(0);
            }
            let read_len = buf.len().min(4 - offset);
            buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
            Ok(read_len)
        }
    }

    fn read_size(&self, _od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, _od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        // Only writing 0 to sub 0 is allowed, and it flushes the log
        if sub != 0 {
            return Err(AbortCode::ReadOnly);
        }
        if data.len() != 1 {
            return Err(AbortCode::DataTypeMismatch);
        }
        if data[0] != 0 {
            return Err(AbortCode::InvalidValue);
        }
        self.with(|errors| errors.clear());
        Ok(WriteOutcome::Done)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::new_u8().rw())
        } else if (sub as usize) <= EMCY_HISTORY_DEPTH {
            Ok(SubInfo::new_u32().ro())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

/// Map an emergency error code to its error register bits (object 1001h)
fn register_bits(code: u16) -> u8 {
    match code >> 12 {
        0x2 => 0x03, // current
        0x3 => 0x05, // voltage
        0x4 => 0x09, // temperature
        0x8 => 0x11, // communication
        0xF => 0x81, // manufacturer
        _ => 0x01,   // generic
    }
}

/// Queues and transmits EMCY frames for the node
#[allow(missing_debug_implementations)]
pub struct EmcyEngine {
    queue: Deque<(u16, [u8; 5]), EMCY_HISTORY_DEPTH>,
    register: &'static ScalarCell<u8>,
    history: &'static EmcyHistory,
    inhibit_countdown: u16,
}

impl EmcyEngine {
    /// Create an engine updating the given error register cell (1001h)
    /// and error history (1003h)
    pub fn new(register: &'static ScalarCell<u8>, history: &'static EmcyHistory) -> Self {
        Self {
            queue: Deque::new(),
            register,
            history,
            inhibit_countdown: 0,
        }
    }

    /// Queue an error for transmission and set its register bits
    pub fn raise(&mut self, code: u16, info: [u8; 5]) {
        self.register.store(self.register.load() | register_bits(code));
        if self.queue.is_full() {
            self.queue.pop_front();
        }
        self.queue.push_back((code, info)).ok();
    }

    /// Clear the error register and queue the error-reset frame
    pub fn clear(&mut self) {
        self.register.store(0);
        if self.queue.is_full() {
            self.queue.pop_front();
        }
        self.queue.push_back((codes::RESET, [0; 5])).ok();
    }

    /// Advance the inhibit window by one millisecond tick
    pub fn tick(&mut self) {
        self.inhibit_countdown = self.inhibit_countdown.saturating_sub(1);
    }

    /// Emit at most one queued frame
    ///
    /// `inhibit_100us` is the current value of object 1015h. In the
    /// Stopped state EMCY transmission is suspended; queued frames go
    /// out once the state is left.
    pub fn drain(
        &mut self,
        state: NmtState,
        inhibit_100us: u16,
        send: &mut dyn FnMut(EmcyMessage),
    ) {
        if state == NmtState::Stopped {
            return;
        }
        if self.inhibit_countdown > 0 {
            return;
        }
        if let Some((code, info)) = self.queue.pop_front() {
            if code != codes::RESET {
                self.history.push(code, &info);
            }
            send(EmcyMessage {
                code,
                register: self.register.load(),
                vendor: info,
            });
            // 100 us units, rounded up to the 1 ms tick
            self.inhibit_countdown = inhibit_100us.div_ceil(10);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_engine() -> (EmcyEngine, &'static ScalarCell<u8>, &'static EmcyHistory) {
        let register = Box::leak(Box::new(ScalarCell::<u8>::new(0)));
        let history = Box::leak(Box::new(EmcyHistory::new()));
        (EmcyEngine::new(register, history), register, history)
    }

    fn collect(engine: &mut EmcyEngine, state: NmtState, inhibit: u16) -> Vec<EmcyMessage> {
        let mut sent = Vec::new();
        engine.drain(state, inhibit, &mut |msg| sent.push(msg));
        sent
    }

    #[test]
    fn raise_sets_register_and_records_history() {
        let (mut engine, register, history) = leaked_engine();
        engine.raise(0x8100, [1, 2, 3, 4, 5]);
        assert_eq!(register.load(), 0x11);

        let sent = collect(&mut engine, NmtState::Operational, 0);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, 0x8100);
        assert_eq!(sent[0].register, 0x11);
        assert_eq!(sent[0].vendor, [1, 2, 3, 4, 5]);
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(0), Some(0x0201_8100));
    }

    #[test]
    fn clear_resets_register_and_sends_reset_frame() {
        let (mut engine, register, history) = leaked_engine();
        engine.raise(0x2000, [0; 5]);
        collect(&mut engine, NmtState::Operational, 0);
        engine.clear();
        assert_eq!(register.load(), 0);
        let sent = collect(&mut engine, NmtState::Operational, 0);
        assert_eq!(sent[0].code, 0x0000);
        // The reset frame is not logged
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn inhibit_spaces_frames() {
        let (mut engine, _register, _history) = leaked_engine();
        engine.raise(0x5000, [0; 5]);
        engine.raise(0x5001, [0; 5]);
        // 2 ms inhibit
        assert_eq!(collect(&mut engine, NmtState::Operational, 20).len(), 1);
        assert_eq!(collect(&mut engine, NmtState::Operational, 20).len(), 0);
        engine.tick();
        assert_eq!(collect(&mut engine, NmtState::Operational, 20).len(), 0);
        engine.tick();
        assert_eq!(collect(&mut engine, NmtState::Operational, 20).len(), 1);
    }

    #[test]
    fn stopped_defers_queue() {
        let (mut engine, _register, history) = leaked_engine();
        engine.raise(0x8120, [0; 5]);
        assert!(collect(&mut engine, NmtState::Stopped, 0).is_empty());
        assert!(history.is_empty());
        // Transmitted once the node leaves Stopped
        let sent = collect(&mut engine, NmtState::Operational, 0);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, 0x8120);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn history_sub_reads_newest_first() {
        let (mut engine, _register, history) = leaked_engine();
        for code in [0x1000u16, 0x2000, 0x3000] {
            engine.raise(code, [0; 5]);
            collect(&mut engine, NmtState::Operational, 0);
        }
        let mut buf = [0u8; 1];
        history.read(&[], 0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 3);
        let mut word = [0u8; 4];
        history.read(&[], 1, 0, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0x3000);
        history.read(&[], 3, 0, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0x1000);

        history.write(&[], 0, &[0]).unwrap();
        assert!(history.is_empty());
    }
}
