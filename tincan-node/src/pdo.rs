//! PDO engine
//!
//! Each of the four receive and four transmit PDOs is represented by a
//! [`Pdo`] struct holding the communication parameters and the dynamic
//! mapping. The structs are shared between the receive interrupt (which
//! buffers matching RPDO frames) and the processing loop, so every field
//! is an [`AtomicCell`].
//!
//! The communication parameter record (1400h-1403h / 1800h-1803h) and
//! the mapping parameter record (1600h-1603h / 1A00h-1A03h) are exposed
//! as dictionary callbacks which are bound to their `Pdo` at node
//! initialization.

use defmt_or_log::warn;
use tincan_common::{
    messages::reserved_cob_id,
    objects::{DataType, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanId,
};

use crate::dict::{find_entry, DictCallback, DictEntry, WriteOutcome};

/// Mapping slots per PDO; classic CAN frames cannot carry more than 8
/// byte-aligned objects
pub const MAX_PDO_MAPPINGS: usize = 8;

/// State of a single receive or transmit PDO
#[allow(missing_debug_implementations)]
pub struct Pdo {
    /// COB-ID used to match or transmit this PDO
    pub cob_id: AtomicCell<CanId>,
    /// The COB-ID valid bit (bit 31, inverted: set means disabled)
    pub valid: AtomicCell<bool>,
    /// If set, the PDO may not be requested via RTR (bit 30)
    pub rtr_disabled: AtomicCell<bool>,
    /// Transmission type (sub 2): 0 = sync-acyclic, 1-240 = every Nth
    /// SYNC, 254/255 = event-driven
    pub transmission_type: AtomicCell<u8>,
    /// Inhibit time (sub 3), in multiples of 100 us
    pub inhibit_time: AtomicCell<u16>,
    /// Event timer (sub 5), in ms; 0 disables
    pub event_time: AtomicCell<u16>,
    /// Sync start value (sub 6); for cyclic types, transmission starts
    /// at the SYNC whose counter matches
    pub sync_start: AtomicCell<u8>,
    /// SYNC frames seen since the last transmission
    pub sync_counter: AtomicCell<u8>,
    /// Set once the sync-start condition has been met
    pub sync_started: AtomicCell<bool>,
    /// Remaining ticks of the inhibit window
    pub inhibit_countdown: AtomicCell<u16>,
    /// Remaining ticks until the event timer fires
    pub event_countdown: AtomicCell<u16>,
    /// A transmission was blocked by the inhibit window and is waiting
    /// for it to elapse
    pub tx_pending: AtomicCell<bool>,
    /// Last received frame data, for RPDOs
    pub buffered_value: AtomicCell<Option<[u8; 8]>>,
    /// Set when received RPDO data has been applied to the dictionary
    pub received: AtomicCell<bool>,
    /// Number of valid mapping entries (mapping sub 0)
    pub valid_maps: AtomicCell<u8>,
    /// Raw mapping parameters: index << 16 | sub << 8 | bit length
    pub mapping_params: [AtomicCell<u32>; MAX_PDO_MAPPINGS],
}

impl Default for Pdo {
    fn default() -> Self {
        Self::new()
    }
}

impl Pdo {
    /// Create a disabled PDO
    pub const fn new() -> Self {
        Self {
            cob_id: AtomicCell::new(CanId::Std(0)),
            valid: AtomicCell::new(false),
            rtr_disabled: AtomicCell::new(false),
            transmission_type: AtomicCell::new(254),
            inhibit_time: AtomicCell::new(0),
            event_time: AtomicCell::new(0),
            sync_start: AtomicCell::new(0),
            sync_counter: AtomicCell::new(0),
            sync_started: AtomicCell::new(false),
            inhibit_countdown: AtomicCell::new(0),
            event_countdown: AtomicCell::new(0),
            tx_pending: AtomicCell::new(false),
            buffered_value: AtomicCell::new(None),
            received: AtomicCell::new(false),
            valid_maps: AtomicCell::new(0),
            mapping_params: [const { AtomicCell::new(0) }; MAX_PDO_MAPPINGS],
        }
    }

    /// Is the PDO enabled
    pub fn valid(&self) -> bool {
        self.valid.load()
    }

    /// Clear and return the received-data flag
    ///
    /// For RPDOs; the flag is raised each time received data is applied
    /// to the mapped dictionary objects.
    pub fn take_received(&self) -> bool {
        self.received.take()
    }

    /// The configured COB-ID
    pub fn cob_id(&self) -> CanId {
        self.cob_id.load()
    }

    /// The raw u32 value of comm sub 1
    pub fn cob_id_value(&self) -> u32 {
        let cob_id = self.cob_id.load();
        let mut value = cob_id.raw();
        if cob_id.is_extended() {
            value |= 1 << 29;
        }
        if self.rtr_disabled.load() {
            value |= 1 << 30;
        }
        if !self.valid.load() {
            value |= 1 << 31;
        }
        value
    }

    /// Number of payload bytes the current mapping covers
    pub fn mapped_len(&self) -> usize {
        let mut bits = 0usize;
        for i in 0..self.valid_maps.load() as usize {
            bits += (self.mapping_params[i].load() & 0xFF) as usize;
        }
        bits.div_ceil(8)
    }

    /// Whether this PDO transmits in response to a SYNC frame
    ///
    /// `counter` is the payload counter of the received SYNC frame, if
    /// the producer sends one.
    pub fn sync_update(&self, counter: Option<u8>, od: &[DictEntry]) -> bool {
        if !self.valid.load() {
            return false;
        }
        let tt = self.transmission_type.load();
        if tt == 0 {
            self.read_events(od)
        } else if tt <= 240 {
            let start = self.sync_start.load();
            if start != 0 && !self.sync_started.load() {
                if counter != Some(start) {
                    return false;
                }
                self.sync_started.store(true);
            }
            let count = self.sync_counter.fetch_add(1) + 1;
            if count >= tt {
                self.sync_counter.store(0);
                true
            } else {
                false
            }
        } else {
            false
        }
    }

    /// Check mapped objects for a raised event flag
    pub fn read_events(&self, od: &[DictEntry]) -> bool {
        for i in 0..self.valid_maps.load() as usize {
            let param = self.mapping_params[i].load();
            if param == 0 {
                continue;
            }
            let index = (param >> 16) as u16;
            let sub = ((param >> 8) & 0xFF) as u8;
            if let Ok(entry) = find_entry(od, index, sub) {
                if entry.read_event_flag(sub) {
                    return true;
                }
            }
        }
        false
    }

    /// Clear event flags on all mapped objects
    pub fn clear_events(&self, od: &[DictEntry]) {
        for i in 0..self.valid_maps.load() as usize {
            let param = self.mapping_params[i].load();
            if param == 0 {
                continue;
            }
            let index = (param >> 16) as u16;
            let sub = ((param >> 8) & 0xFF) as u8;
            if let Ok(entry) = find_entry(od, index, sub) {
                entry.clear_event_flag(sub);
            }
        }
    }

    /// Decide whether a triggered transmission may go out now
    ///
    /// Starts the inhibit window when it does; defers the transmission
    /// to the end of the window when it does not.
    pub fn try_transmit(&self) -> bool {
        if self.inhibit_countdown.load() > 0 {
            self.tx_pending.store(true);
            return false;
        }
        let inhibit = self.inhibit_time.load();
        if inhibit > 0 {
            // 100 us units, rounded up to the 1 ms tick
            self.inhibit_countdown.store(inhibit.div_ceil(10));
        }
        true
    }

    /// Reload the event timer countdown
    pub fn arm_event_timer(&self) {
        self.event_countdown.store(self.event_time.load());
    }

    /// Advance the per-tick countdowns
    ///
    /// Returns true if a transmission is due this tick, either because
    /// the event timer expired or because a deferred transmission's
    /// inhibit window elapsed.
    pub fn tick(&self) -> bool {
        let mut due = false;
        let inhibit = self.inhibit_countdown.load();
        if inhibit > 0 {
            self.inhibit_countdown.store(inhibit - 1);
            if inhibit == 1 && self.tx_pending.swap(false) {
                due = true;
            }
        }
        if self.valid.load() && self.event_time.load() > 0 {
            let tt = self.transmission_type.load();
            if tt >= 254 {
                let count = self.event_countdown.load();
                if count > 1 {
                    self.event_countdown.store(count - 1);
                } else {
                    self.arm_event_timer();
                    due = true;
                }
            }
        }
        due
    }
}

/// Copy received PDO data into the mapped dictionary objects
pub(crate) fn store_pdo_data(data: &[u8], pdo: &Pdo, od: &[DictEntry]) {
    let mut offset = 0;
    for i in 0..pdo.valid_maps.load() as usize {
        let param = pdo.mapping_params[i].load();
        if param == 0 {
            continue;
        }
        let index = (param >> 16) as u16;
        let sub = ((param >> 8) & 0xFF) as u8;
        let length = ((param & 0xFF) as usize).div_ceil(8);
        if offset + length > data.len() {
            break;
        }
        // The mapping was validated against the dictionary when it was
        // written, so failures here can only come from access changes
        // and are ignored
        match find_entry(od, index, sub) {
            Ok(entry) => {
                entry.write(od, sub, &data[offset..offset + length]).ok();
            }
            Err(_) => warn!("PDO mapping references missing object {:x}", index),
        }
        offset += length;
    }
}

/// Gather mapped dictionary objects into a PDO payload
pub(crate) fn read_pdo_data(data: &mut [u8], pdo: &Pdo, od: &[DictEntry]) -> usize {
    let mut offset = 0;
    for i in 0..pdo.valid_maps.load() as usize {
        let param = pdo.mapping_params[i].load();
        if param == 0 {
            continue;
        }
        let index = (param >> 16) as u16;
        let sub = ((param >> 8) & 0xFF) as u8;
        let length = ((param & 0xFF) as usize).div_ceil(8);
        if offset + length > data.len() {
            break;
        }
        match find_entry(od, index, sub) {
            Ok(entry) => {
                entry.read(od, sub, 0, &mut data[offset..offset + length]).ok();
            }
            Err(_) => warn!("PDO mapping references missing object {:x}", index),
        }
        offset += length;
    }
    offset
}

fn read_u32_field(value: u32, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
    let bytes = value.to_le_bytes();
    if offset >= 4 {
        return Ok(0);
    }
    let read_len = buf.len().min(4 - offset);
    buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
    Ok(read_len)
}

/// Dictionary handler for a PDO communication parameter record
/// (1400h-1403h / 1800h-1803h)
#[allow(missing_debug_implementations)]
pub struct PdoCommCallback {
    pdo: AtomicCell<Option<&'static Pdo>>,
}

impl PdoCommCallback {
    /// Create an unbound handler
    pub const fn new() -> Self {
        Self {
            pdo: AtomicCell::new(None),
        }
    }

    /// Bind the handler to its PDO state
    pub fn bind(&self, pdo: &'static Pdo) {
        self.pdo.store(Some(pdo));
    }

    fn pdo(&self) -> Result<&'static Pdo, AbortCode> {
        self.pdo.load().ok_or(AbortCode::ResourceNotAvailable)
    }
}

impl Default for PdoCommCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl DictCallback for PdoCommCallback {
    fn read(
        &self,
        _od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        let pdo = self.pdo()?;
        match sub {
            0 => {
                if buf.is_empty() || offset != 0 {
                    return Ok(0);
                }
                buf[0] = 6;
                Ok(1)
            }
            1 => read_u32_field(pdo.cob_id_value(), offset, buf),
            2 => {
                if buf.is_empty() || offset != 0 {
                    return Ok(0);
                }
                buf[0] = pdo.transmission_type.load();
                Ok(1)
            }
            3 => read_u32_field(pdo.inhibit_time.load() as u32, offset, buf).map(|n| n.min(2)),
            5 => read_u32_field(pdo.event_time.load() as u32, offset, buf).map(|n| n.min(2)),
            6 => {
                if buf.is_empty() || offset != 0 {
                    return Ok(0);
                }
                buf[0] = pdo.sync_start.load();
                Ok(1)
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, _od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, _od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        let pdo = self.pdo()?;
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => {
                if data.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let value = u32::from_le_bytes(data.try_into().unwrap());
                let valid = value & (1 << 31) == 0;
                let no_rtr = value & (1 << 30) != 0;
                let extended = value & (1 << 29) != 0;
                let can_id = if extended {
                    CanId::extended(value & 0x1FFF_FFFF)
                } else {
                    CanId::std((value & 0x7FF) as u16)
                };
                if valid && reserved_cob_id(can_id) {
                    return Err(AbortCode::InvalidValue);
                }
                pdo.cob_id.store(can_id);
                pdo.rtr_disabled.store(no_rtr);
                pdo.valid.store(valid);
                if valid {
                    pdo.sync_counter.store(0);
                    pdo.sync_started.store(false);
                    pdo.arm_event_timer();
                }
                Ok(WriteOutcome::Done)
            }
            2 => {
                if data.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let tt = data[0];
                if (241..=253).contains(&tt) {
                    return Err(AbortCode::InvalidValue);
                }
                pdo.transmission_type.store(tt);
                pdo.sync_counter.store(0);
                Ok(WriteOutcome::Done)
            }
            3 => {
                if data.len() != 2 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                pdo.inhibit_time
                    .store(u16::from_le_bytes(data.try_into().unwrap()));
                Ok(WriteOutcome::Done)
            }
            5 => {
                if data.len() != 2 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                pdo.event_time
                    .store(u16::from_le_bytes(data.try_into().unwrap()));
                pdo.arm_event_timer();
                Ok(WriteOutcome::Done)
            }
            6 => {
                if data.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                pdo.sync_start.store(data[0]);
                pdo.sync_started.store(false);
                Ok(WriteOutcome::Done)
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u32().rw().persist()),
            2 | 6 => Ok(SubInfo::new_u8().rw().persist()),
            3 | 5 => Ok(SubInfo::new_u16().rw().persist()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Dictionary handler for a PDO mapping parameter record
/// (1600h-1603h / 1A00h-1A03h)
#[allow(missing_debug_implementations)]
pub struct PdoMapCallback {
    pdo: AtomicCell<Option<&'static Pdo>>,
    is_tpdo: bool,
}

impl PdoMapCallback {
    /// Create an unbound handler for a transmit or receive mapping
    pub const fn new(is_tpdo: bool) -> Self {
        Self {
            pdo: AtomicCell::new(None),
            is_tpdo,
        }
    }

    /// Bind the handler to its PDO state
    pub fn bind(&self, pdo: &'static Pdo) {
        self.pdo.store(Some(pdo));
    }

    fn pdo(&self) -> Result<&'static Pdo, AbortCode> {
        self.pdo.load().ok_or(AbortCode::ResourceNotAvailable)
    }
}

impl DictCallback for PdoMapCallback {
    fn read(
        &self,
        _od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        let pdo = self.pdo()?;
        if sub == 0 {
            if buf.is_empty() || offset != 0 {
                return Ok(0);
            }
            buf[0] = pdo.valid_maps.load();
            Ok(1)
        } else if sub as usize <= MAX_PDO_MAPPINGS {
            read_u32_field(pdo.mapping_params[(sub - 1) as usize].load(), offset, buf)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, _od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        let pdo = self.pdo()?;
        // Mapping is frozen while the PDO is active
        if pdo.valid.load() {
            return Err(AbortCode::CantStoreDeviceState);
        }
        if sub == 0 {
            if data.len() != 1 {
                return Err(AbortCode::DataTypeMismatch);
            }
            let count = data[0];
            if count as usize > MAX_PDO_MAPPINGS {
                return Err(AbortCode::InvalidValue);
            }
            let mut bits = 0u32;
            for i in 0..count as usize {
                bits += pdo.mapping_params[i].load() & 0xFF;
            }
            if bits > 64 {
                return Err(AbortCode::PdoTooLong);
            }
            pdo.valid_maps.store(count);
            Ok(WriteOutcome::Done)
        } else if sub as usize <= MAX_PDO_MAPPINGS {
            if data.len() != 4 {
                return Err(AbortCode::DataTypeMismatch);
            }
            let value = u32::from_le_bytes(data.try_into().unwrap());
            if value != 0 {
                let index = (value >> 16) as u16;
                let map_sub = ((value >> 8) & 0xFF) as u8;
                let bits = (value & 0xFF) as usize;
                if bits == 0 || bits % 8 != 0 {
                    // Only byte-aligned mapping is supported
                    return Err(AbortCode::IncompatibleParameter);
                }
                let entry =
                    find_entry(od, index, map_sub).map_err(|_| AbortCode::NoSuchObject)?;
                let info = entry.sub_info(map_sub)?;
                let allowed = if self.is_tpdo {
                    info.pdo_mapping.allows_tpdo()
                } else {
                    info.pdo_mapping.allows_rpdo()
                };
                if !allowed {
                    return Err(AbortCode::UnmappablePdo);
                }
                if info.size < bits / 8 {
                    return Err(AbortCode::IncompatibleParameter);
                }
            }
            pdo.mapping_params[(sub - 1) as usize].store(value);
            Ok(WriteOutcome::Done)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo {
                size: 1,
                data_type: DataType::UInt8,
                access_type: tincan_common::objects::AccessType::Rw,
                pdo_mapping: tincan_common::objects::PdoMapping::None,
                persist: true,
            })
        } else if sub as usize <= MAX_PDO_MAPPINGS {
            Ok(SubInfo::new_u32().rw().persist())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}
