//! Static device context
//!
//! [`DeviceContext`] bundles the storage behind all communication
//! profile objects (1000h..1019h, 1F80h, and the PDO parameter
//! records). It is const-constructible so it can live in a `static` and
//! be shared between the CAN receive interrupt and the processing loop:
//!
//! ```ignore
//! static CTX: DeviceContext = DeviceContext::new();
//! static MBOX: NodeMbox = NodeMbox::new(&CTX.rpdos);
//! ```
//!
//! [`Node::new`](crate::Node::new) registers the context's entries into
//! the object dictionary and fills in the node-ID dependent defaults.

use tincan_common::{
    object_ids,
    objects::{PdoMapping, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::dict::{
    CobIdCell, DictBuildError, DictBuilder, DictCallback, DictEntry, ScalarCell, StrCell,
    WriteOutcome,
};
use crate::emcy::EmcyHistory;
use crate::nmt::HeartbeatConsumerObject;
use crate::pdo::{Pdo, PdoCommCallback, PdoMapCallback};
use crate::sync::SyncCounterCell;

/// Number of receive and transmit PDOs
pub const NUM_PDOS: usize = 4;

/// Capacity of the string cells backing objects 1008h..100Ah
pub const DEVICE_STR_LEN: usize = 32;

/// The store/restore command object (1010h / 1011h)
///
/// Writing the magic word arms a pending request and defers the SDO
/// response until the node has finished the NVM operation.
#[allow(missing_debug_implementations)]
pub struct StorageCommandObject {
    magic: u32,
    pending: AtomicCell<bool>,
}

impl StorageCommandObject {
    /// Create a command object armed by `magic`
    pub const fn new(magic: u32) -> Self {
        Self {
            magic,
            pending: AtomicCell::new(false),
        }
    }

    /// Clear and return the pending-request flag
    pub fn take_pending(&self) -> bool {
        self.pending.take()
    }
}

impl DictCallback for StorageCommandObject {
    fn read(
        &self,
        _od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        if offset != 0 || buf.is_empty() {
            return Ok(0);
        }
        match sub {
            0 => {
                buf[0] = 1;
                Ok(1)
            }
            1 => {
                // Saves on command only
                let bytes = 1u32.to_le_bytes();
                let read_len = buf.len().min(4);
                buf[..read_len].copy_from_slice(&bytes[..read_len]);
                Ok(read_len)
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, _od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, _od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => {
                if data.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                if u32::from_le_bytes(data.try_into().unwrap()) != self.magic {
                    return Err(AbortCode::CantStore);
                }
                self.pending.store(true);
                Ok(WriteOutcome::Deferred)
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::new_u8().konst()),
            1 => Ok(SubInfo::new_u32().rw()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// The identity object (1018h)
#[allow(missing_debug_implementations)]
pub struct IdentityObject {
    values: [AtomicCell<u32>; 4],
}

impl IdentityObject {
    /// Create an all-zero identity
    pub const fn new() -> Self {
        Self {
            values: [const { AtomicCell::new(0) }; 4],
        }
    }

    /// Fill in the identity fields
    pub fn set(&self, vendor_id: u32, product_code: u32, revision: u32, serial: u32) {
        self.values[0].store(vendor_id);
        self.values[1].store(product_code);
        self.values[2].store(revision);
        self.values[3].store(serial);
    }
}

impl Default for IdentityObject {
    fn default() -> Self {
        Self::new()
    }
}

impl DictCallback for IdentityObject {
    fn read(
        &self,
        _od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        if sub == 0 {
            if offset != 0 || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = 4;
            Ok(1)
        } else if sub <= 4 {
            let bytes = self.values[(sub - 1) as usize].load().to_le_bytes();
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

    fn write(&self, _od: &[DictEntry], _sub: u8, _data: &[u8]) -> Result<WriteOutcome, AbortCode> {
        Err(AbortCode::ReadOnly)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::new_u8().konst()),
            1..=4 => Ok(SubInfo::new_u32().ro()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Storage for the communication profile objects
///
/// All fields are interrupt-safe cells; the struct is meant to live in a
/// `static`.
#[allow(missing_debug_implementations)]
pub struct DeviceContext {
    /// Device type (1000h)
    pub device_type: ScalarCell<u32>,
    /// Error register (1001h), maintained by the EMCY engine
    pub error_register: ScalarCell<u8>,
    /// Manufacturer status register (1002h), set by the application
    pub mfr_status: ScalarCell<u32>,
    /// Pre-defined error field (1003h)
    pub emcy_history: EmcyHistory,
    /// SYNC COB-ID (1005h); bit 30 enables the SYNC producer
    pub sync_cob: CobIdCell,
    /// Communication cycle period in us (1006h)
    pub comm_cycle: ScalarCell<u32>,
    /// Manufacturer device name (1008h)
    pub device_name: StrCell<DEVICE_STR_LEN>,
    /// Manufacturer hardware version (1009h)
    pub hardware_version: StrCell<DEVICE_STR_LEN>,
    /// Manufacturer software version (100Ah)
    pub software_version: StrCell<DEVICE_STR_LEN>,
    /// Guard time in ms (100Ch)
    pub guard_time: ScalarCell<u16>,
    /// Life time factor (100Dh)
    pub life_factor: ScalarCell<u8>,
    /// Store parameters command (1010h)
    pub store_cmd: StorageCommandObject,
    /// Restore parameters command (1011h)
    pub restore_cmd: StorageCommandObject,
    /// EMCY COB-ID (1014h)
    pub emcy_cob: CobIdCell,
    /// EMCY inhibit time in 100 us units (1015h)
    pub emcy_inhibit: ScalarCell<u16>,
    /// Consumer heartbeat times (1016h)
    pub hb_consumers: HeartbeatConsumerObject,
    /// Heartbeat producer time in ms (1017h)
    pub hb_producer_time: ScalarCell<u16>,
    /// Identity (1018h)
    pub identity: IdentityObject,
    /// SYNC counter overflow value (1019h)
    pub sync_overflow: SyncCounterCell,
    /// NMT startup behavior (1F80h); bit 2 makes the node self-starting
    pub nmt_startup: ScalarCell<u32>,
    /// Receive PDO state
    pub rpdos: [Pdo; NUM_PDOS],
    /// Transmit PDO state
    pub tpdos: [Pdo; NUM_PDOS],
    /// RPDO communication parameter handlers (1400h..1403h)
    pub rpdo_comm: [PdoCommCallback; NUM_PDOS],
    /// RPDO mapping parameter handlers (1600h..1603h)
    pub rpdo_map: [PdoMapCallback; NUM_PDOS],
    /// TPDO communication parameter handlers (1800h..1803h)
    pub tpdo_comm: [PdoCommCallback; NUM_PDOS],
    /// TPDO mapping parameter handlers (1A00h..1A03h)
    pub tpdo_map: [PdoMapCallback; NUM_PDOS],
}

impl DeviceContext {
    /// Create a context with profile defaults
    pub const fn new() -> Self {
        Self {
            device_type: ScalarCell::new(0),
            error_register: ScalarCell::new(0),
            mfr_status: ScalarCell::new(0),
            emcy_history: EmcyHistory::new(),
            sync_cob: CobIdCell::new(0x80, 1 << 30, Some(0x80)),
            comm_cycle: ScalarCell::new(0),
            device_name: StrCell::new(),
            hardware_version: StrCell::new(),
            software_version: StrCell::new(),
            guard_time: ScalarCell::new(0),
            life_factor: ScalarCell::new(0),
            store_cmd: StorageCommandObject::new(object_ids::STORE_MAGIC),
            restore_cmd: StorageCommandObject::new(object_ids::RESTORE_MAGIC),
            emcy_cob: CobIdCell::new(0x80, 1 << 31, None),
            emcy_inhibit: ScalarCell::new(0),
            hb_consumers: HeartbeatConsumerObject::new(),
            hb_producer_time: ScalarCell::new(0),
            identity: IdentityObject::new(),
            sync_overflow: SyncCounterCell::new(0),
            nmt_startup: ScalarCell::new(0),
            rpdos: [const { Pdo::new() }; NUM_PDOS],
            tpdos: [const { Pdo::new() }; NUM_PDOS],
            rpdo_comm: [const { PdoCommCallback::new() }; NUM_PDOS],
            rpdo_map: [const { PdoMapCallback::new(false) }; NUM_PDOS],
            tpdo_comm: [const { PdoCommCallback::new() }; NUM_PDOS],
            tpdo_map: [const { PdoMapCallback::new(true) }; NUM_PDOS],
        }
    }

    /// Bind the PDO parameter handlers to their PDO state
    pub fn bind_pdos(&'static self) {
        for i in 0..NUM_PDOS {
            self.rpdo_comm[i].bind(&self.rpdos[i]);
            self.rpdo_map[i].bind(&self.rpdos[i]);
            self.tpdo_comm[i].bind(&self.tpdos[i]);
            self.tpdo_map[i].bind(&self.tpdos[i]);
        }
    }

    /// Register the communication profile entries into a dictionary
    /// builder
    pub fn add_entries<const N: usize>(
        &'static self,
        builder: &mut DictBuilder<N>,
    ) -> Result<(), DictBuildError> {
        use object_ids::*;
        builder.add(DictEntry::raw(
            DEVICE_TYPE,
            0,
            SubInfo::new_u32().ro(),
            &self.device_type,
        ))?;
        builder.add(DictEntry::raw(
            ERROR_REGISTER,
            0,
            SubInfo::new_u8().ro(),
            &self.error_register,
        ))?;
        builder.add(DictEntry::raw(
            MANUFACTURER_STATUS,
            0,
            SubInfo::new_u32().ro().mappable(PdoMapping::Tpdo),
            &self.mfr_status,
        ))?;
        builder.add(DictEntry::callback(
            PREDEFINED_ERROR_FIELD,
            &self.emcy_history,
        ))?;
        builder.add(DictEntry::raw(
            SYNC_COB_ID,
            0,
            SubInfo::new_u32().rw().persist(),
            &self.sync_cob,
        ))?;
        builder.add(DictEntry::raw(
            COMM_CYCLE_PERIOD,
            0,
            SubInfo::new_u32().rw().persist(),
            &self.comm_cycle,
        ))?;
        builder.add(DictEntry::raw(
            DEVICE_NAME,
            0,
            SubInfo::new_visible_str(DEVICE_STR_LEN).konst(),
            &self.device_name,
        ))?;
        builder.add(DictEntry::raw(
            HARDWARE_VERSION,
            0,
            SubInfo::new_visible_str(DEVICE_STR_LEN).konst(),
            &self.hardware_version,
        ))?;
        builder.add(DictEntry::raw(
            SOFTWARE_VERSION,
            0,
            SubInfo::new_visible_str(DEVICE_STR_LEN).konst(),
            &self.software_version,
        ))?;
        builder.add(DictEntry::raw(
            GUARD_TIME,
            0,
            SubInfo::new_u16().rw().persist(),
            &self.guard_time,
        ))?;
        builder.add(DictEntry::raw(
            LIFE_TIME_FACTOR,
            0,
            SubInfo::new_u8().rw().persist(),
            &self.life_factor,
        ))?;
        builder.add(DictEntry::callback(STORE_PARAMETERS, &self.store_cmd))?;
        builder.add(DictEntry::callback(RESTORE_PARAMETERS, &self.restore_cmd))?;
        builder.add(DictEntry::raw(
            EMCY_COB_ID,
            0,
            SubInfo::new_u32().rw().persist(),
            &self.emcy_cob,
        ))?;
        builder.add(DictEntry::raw(
            EMCY_INHIBIT_TIME,
            0,
            SubInfo::new_u16().rw().persist(),
            &self.emcy_inhibit,
        ))?;
        builder.add(DictEntry::callback(HEARTBEAT_CONSUMER, &self.hb_consumers))?;
        builder.add(DictEntry::raw(
            HEARTBEAT_PRODUCER,
            0,
            SubInfo::new_u16().rw().persist(),
            &self.hb_producer_time,
        ))?;
        builder.add(DictEntry::callback(IDENTITY, &self.identity))?;
        builder.add(DictEntry::raw(
            SYNC_COUNTER_OVERFLOW,
            0,
            SubInfo::new_u8().rw().persist(),
            &self.sync_overflow,
        ))?;
        builder.add(DictEntry::raw(
            NMT_STARTUP,
            0,
            SubInfo::new_u32().rw().persist(),
            &self.nmt_startup,
        ))?;
        for i in 0..NUM_PDOS {
            builder.add(DictEntry::callback(
                RPDO_COMM_BASE + i as u16,
                &self.rpdo_comm[i],
            ))?;
            builder.add(DictEntry::callback(
                RPDO_MAPPING_BASE + i as u16,
                &self.rpdo_map[i],
            ))?;
            builder.add(DictEntry::callback(
                TPDO_COMM_BASE + i as u16,
                &self.tpdo_comm[i],
            ))?;
            builder.add(DictEntry::callback(
                TPDO_MAPPING_BASE + i as u16,
                &self.tpdo_map[i],
            ))?;
        }
        Ok(())
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::find_entry;

    #[test]
    fn profile_entries_register_and_resolve() {
        let ctx: &'static DeviceContext = Box::leak(Box::new(DeviceContext::new()));
        ctx.bind_pdos();
        let mut builder: DictBuilder<64> = DictBuilder::new();
        ctx.add_entries(&mut builder).unwrap();
        let dict = Box::leak(Box::new(builder.build().unwrap()));
        let od = dict.entries();

        // Identity reads through the dictionary
        ctx.identity.set(0xCAFE, 2, 3, 4);
        let entry = find_entry(od, object_ids::IDENTITY, 1).unwrap();
        let mut buf = [0u8; 4];
        entry.read(od, 1, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xCAFE);

        // PDO comm parameters are reachable at their profile indexes
        let entry = find_entry(od, object_ids::TPDO_COMM_BASE + 3, 2).unwrap();
        let mut tt = [0u8; 1];
        entry.read(od, 2, 0, &mut tt).unwrap();
        assert_eq!(tt[0], 254);
    }

    #[test]
    fn store_command_requires_magic() {
        let cmd = StorageCommandObject::new(object_ids::STORE_MAGIC);
        assert_eq!(
            cmd.write(&[], 1, &u32::to_le_bytes(0x1234_5678)),
            Err(AbortCode::CantStore)
        );
        assert!(!cmd.take_pending());
        assert_eq!(
            cmd.write(&[], 1, &u32::to_le_bytes(object_ids::STORE_MAGIC)),
            Ok(WriteOutcome::Deferred)
        );
        assert!(cmd.take_pending());
        assert!(!cmd.take_pending());
    }
}
