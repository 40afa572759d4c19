//! Well-known object dictionary indices from CiA 301.

/// Device type (1000h)
pub const DEVICE_TYPE: u16 = 0x1000;
/// Error register (1001h)
pub const ERROR_REGISTER: u16 = 0x1001;
/// Manufacturer status register (1002h)
pub const MANUFACTURER_STATUS: u16 = 0x1002;
/// Pre-defined error field (1003h)
pub const PREDEFINED_ERROR_FIELD: u16 = 0x1003;
/// SYNC COB-ID (1005h)
pub const SYNC_COB_ID: u16 = 0x1005;
/// Communication cycle period (1006h)
pub const COMM_CYCLE_PERIOD: u16 = 0x1006;
/// Manufacturer device name (1008h)
pub const DEVICE_NAME: u16 = 0x1008;
/// Manufacturer hardware version (1009h)
pub const HARDWARE_VERSION: u16 = 0x1009;
/// Manufacturer software version (100Ah)
pub const SOFTWARE_VERSION: u16 = 0x100A;
/// Guard time (100Ch)
pub const GUARD_TIME: u16 = 0x100C;
/// Life time factor (100Dh)
pub const LIFE_TIME_FACTOR: u16 = 0x100D;
/// Store parameters (1010h)
pub const STORE_PARAMETERS: u16 = 0x1010;
/// Restore default parameters (1011h)
pub const RESTORE_PARAMETERS: u16 = 0x1011;
/// EMCY COB-ID (1014h)
pub const EMCY_COB_ID: u16 = 0x1014;
/// EMCY inhibit time (1015h)
pub const EMCY_INHIBIT_TIME: u16 = 0x1015;
/// Heartbeat consumer entries (1016h)
pub const HEARTBEAT_CONSUMER: u16 = 0x1016;
/// Heartbeat producer time (1017h)
pub const HEARTBEAT_PRODUCER: u16 = 0x1017;
/// Identity object (1018h)
pub const IDENTITY: u16 = 0x1018;
/// SYNC counter overflow value (1019h)
pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
/// NMT startup behavior (1F80h)
pub const NMT_STARTUP: u16 = 0x1F80;

/// First RPDO communication parameter object (1400h)
pub const RPDO_COMM_BASE: u16 = 0x1400;
/// First RPDO mapping parameter object (1600h)
pub const RPDO_MAPPING_BASE: u16 = 0x1600;
/// First TPDO communication parameter object (1800h)
pub const TPDO_COMM_BASE: u16 = 0x1800;
/// First TPDO mapping parameter object (1A00h)
pub const TPDO_MAPPING_BASE: u16 = 0x1A00;

/// Magic written to 1010h to request a store ("save" in ASCII, LE)
pub const STORE_MAGIC: u32 = 0x6576_6173;
/// Magic written to 1011h to request a restore ("load" in ASCII, LE)
pub const RESTORE_MAGIC: u32 = 0x6461_6F6C;
