//! NMT state handling and error control
//!
//! Covers the slave side of the NMT state machine, heartbeat production
//! (1017h), node guarding (100Ch/100Dh) and heartbeat consumption
//! (1016h). The [`NmtEngine`] owns the timing state; the
//! [`Node`](crate::Node) wires its events to frame transmission and
//! EMCY reporting.

use tincan_common::{
    messages::NmtState,
    objects::{DataType, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::dict::{DictCallback, DictEntry, WriteOutcome};
use crate::mbox::MAX_HEARTBEAT_CONSUMERS;

#[derive(Debug, Default, Clone, Copy)]
struct ConsumerSlot {
    countdown: u32,
    alive: bool,
}

/// NMT state machine and error control timers
#[derive(Debug)]
pub struct NmtEngine {
    state: NmtState,
    hb_countdown: u16,
    guard_toggle: bool,
    guard_armed: bool,
    guard_countdown: u32,
    consumers: [ConsumerSlot; MAX_HEARTBEAT_CONSUMERS],
}

impl NmtEngine {
    /// Create an engine in the Bootup state
    pub const fn new() -> Self {
        Self {
            state: NmtState::Bootup,
            hb_countdown: 0,
            guard_toggle: false,
            guard_armed: false,
            guard_countdown: 0,
            consumers: [ConsumerSlot {
                countdown: 0,
                alive: false,
            }; MAX_HEARTBEAT_CONSUMERS],
        }
    }

    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.state
    }

    /// Enter a new NMT state
    pub fn set_state(&mut self, state: NmtState) {
        self.state = state;
    }

    /// Leave Bootup after the boot-up frame has been sent
    ///
    /// With `self_start` the node skips Pre-Operational (1F80h bit 2).
    pub fn boot(&mut self, self_start: bool) {
        self.state = if self_start {
            NmtState::Operational
        } else {
            NmtState::PreOperational
        };
        self.guard_toggle = false;
        self.guard_armed = false;
    }

    /// Advance the heartbeat producer timer; returns true when a
    /// heartbeat frame is due this tick
    pub fn hb_tick(&mut self, hb_time_ms: u16) -> bool {
        if hb_time_ms == 0 {
            self.hb_countdown = 0;
            return false;
        }
        match self.hb_countdown {
            0 => {
                // Timer was just enabled; first frame after one period
                self.hb_countdown = hb_time_ms;
                false
            }
            1 => {
                self.hb_countdown = hb_time_ms;
                true
            }
            _ => {
                self.hb_countdown -= 1;
                false
            }
        }
    }

    /// Build the node-guard RTR response and rearm the life guarding
    /// timer
    ///
    /// Returns the state byte with the alternating toggle bit.
    pub fn guard_response(&mut self, guard_ms: u32) -> u8 {
        let mut byte = self.state as u8;
        if self.guard_toggle {
            byte |= 0x80;
        }
        self.guard_toggle = !self.guard_toggle;
        if guard_ms > 0 {
            self.guard_armed = true;
            self.guard_countdown = guard_ms;
        }
        byte
    }

    /// Advance the life guarding timer; returns true when the master
    /// stopped polling (life guarding event)
    ///
    /// The event fires once; the next RTR poll rearms the timer.
    pub fn guard_tick(&mut self, guard_ms: u32) -> bool {
        if !self.guard_armed || guard_ms == 0 {
            return false;
        }
        if self.guard_countdown > 1 {
            self.guard_countdown -= 1;
            false
        } else {
            self.guard_armed = false;
            true
        }
    }

    /// A heartbeat from the monitored producer in `slot` arrived
    pub fn consumer_reset(&mut self, slot: usize, time_ms: u16) {
        let slot = &mut self.consumers[slot];
        slot.countdown = time_ms as u32;
        slot.alive = true;
    }

    /// Advance one consumer timer; returns true when the producer went
    /// silent (fires once until its next heartbeat)
    pub fn consumer_tick(&mut self, slot: usize, time_ms: u16) -> bool {
        let slot = &mut self.consumers[slot];
        if !slot.alive || time_ms == 0 {
            return false;
        }
        if slot.countdown > 1 {
            slot.countdown -= 1;
            false
        } else {
            slot.alive = false;
            true
        }
    }
}

impl Default for NmtEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The consumer heartbeat time object (1016h)
///
/// Each sub entry holds `node_id << 16 | timeout_ms`; a zero timeout
/// disables the slot. Changes raise a dirty flag so the node can
/// rebuild its receive filters.
#[allow(missing_debug_implementations)]
pub struct HeartbeatConsumerObject {
    entries: [AtomicCell<u32>; MAX_HEARTBEAT_CONSUMERS],
    dirty: AtomicCell<bool>,
}

impl HeartbeatConsumerObject {
    /// Create with all slots disabled
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicCell::new(0) }; MAX_HEARTBEAT_CONSUMERS],
            dirty: AtomicCell::new(false),
        }
    }

    /// Monitored node and timeout of one slot
    pub fn slot(&self, slot: usize) -> (u8, u16) {
        let value = self.entries[slot].load();
        ((value >> 16) as u8, value as u16)
    }

    /// Clear and return the configuration-changed flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.take()
    }
}

impl Default for HeartbeatConsumerObject {
    fn default() -> Self {
        Self::new()
    }
}

impl DictCallback for HeartbeatConsumerObject {
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
            buf[0] = MAX_HEARTBEAT_CONSUMERS as u8;
            Ok(1)
        } else if (sub as usize) <= MAX_HEARTBEAT_CONSUMERS {
            let bytes = self.entries[(sub - 1) as usize].load().to_le_bytes();
            if offset >= 4 {
                return Ok(0);
            }
            let read_len = buf.len().min(4 - offset);
            buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
            Ok(read_len)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, _od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, _od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        if sub == 0 {
            return Err(AbortCode::ReadOnly);
        }
        if (sub as usize) > MAX_HEARTBEAT_CONSUMERS {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if data.len() != 4 {
            return Err(AbortCode::DataTypeMismatch);
        }
        let value = u32::from_le_bytes(data.try_into().unwrap());
        let node = (value >> 16) & 0xFF;
        let time = value & 0xFFFF;
        if time != 0 {
            if node == 0 || node > 127 {
                return Err(AbortCode::InvalidValue);
            }
            // One consumer per producer
            for (i, entry) in self.entries.iter().enumerate() {
                if i == (sub - 1) as usize {
                    continue;
                }
                let other = entry.load();
                if other & 0xFFFF != 0 && (other >> 16) & 0xFF == node {
                    return Err(AbortCode::InvalidValue);
                }
            }
        }
        self.entries[(sub - 1) as usize].store(value);
        self.dirty.store(true);
        Ok(WriteOutcome::Done)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo {
                size: 1,
                data_type: DataType::UInt8,
                access_type: tincan_common::objects::AccessType::Const,
                pdo_mapping: tincan_common::objects::PdoMapping::None,
                persist: false,
            })
        } else if (sub as usize) <= MAX_HEARTBEAT_CONSUMERS {
            Ok(SubInfo::new_u32().rw().persist())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}
