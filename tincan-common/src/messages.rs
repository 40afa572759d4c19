//! CAN message model and CANopen message codecs.
//!
//! Covers the pre-defined connection set (CiA 301 §7.3.3): NMT commands,
//! heartbeat / node-guarding frames, SYNC and EMCY frames, plus the
//! COB-ID constants and the reserved-identifier check used to validate
//! run-time configurable COB-IDs.

use int_enum::IntEnum;
use snafu::Snafu;

/// A standard (11-bit) or extended (29-bit) CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanId {
    /// 29-bit identifier
    Extended(u32),
    /// 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id & 0x1FFF_FFFF)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id & 0x7FF)
    }

    /// Get the raw identifier bits
    pub const fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for extended identifiers
    pub const fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Payload bytes; only the first `dlc` are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes
    pub dlc: u8,
    /// Frame identifier
    pub id: CanId,
    /// Remote transmission request flag
    pub rtr: bool,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a data frame from a payload slice
    ///
    /// Panics if `data` exceeds 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        assert!(
            data.len() <= MAX_DATA_LENGTH,
            "CAN payload exceeds {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
            rtr: false,
        }
    }

    /// Create a remote frame requesting `dlc` bytes
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            dlc,
            data: [0; MAX_DATA_LENGTH],
            rtr: true,
        }
    }

    /// Get the frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// COB-ID of NMT command frames
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Default COB-ID of SYNC frames
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// Base COB-ID for EMCY frames (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// Base COB-ID for heartbeat / node-guard frames (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// Base COB-ID for SDO requests received by a server (node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base COB-ID for SDO responses sent by a server (node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Default base COB-IDs of the four transmit PDOs (node ID is added)
pub const TPDO_BASE: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// Default base COB-IDs of the four receive PDOs (node ID is added)
pub const RPDO_BASE: [u16; 4] = [0x200, 0x300, 0x400, 0x500];

/// Check whether a standard identifier falls in a range reserved by the
/// pre-defined connection set
///
/// Writes to run-time configurable COB-ID objects (PDO comm parameters,
/// 1005h, 1014h) must reject these values. Extended identifiers are never
/// reserved.
pub fn reserved_cob_id(id: CanId) -> bool {
    let raw = match id {
        CanId::Extended(_) => return false,
        CanId::Std(raw) => raw,
    };
    matches!(raw,
        0x000..=0x080        // NMT, reserved low block, default SYNC
        | 0x581..=0x5FF      // SDO server-to-client
        | 0x601..=0x67F      // SDO client-to-server
        | 0x6E0..=0x6FF      // reserved
        | 0x701..=0x77F      // NMT error control / heartbeat
        | 0x780..=0x7FF      // reserved
    )
}

/// NMT command specifiers
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum NmtCommandCode {
    /// Enter Operational
    Start = 1,
    /// Enter Stopped
    Stop = 2,
    /// Enter Pre-Operational
    EnterPreOp = 128,
    /// Full application reset
    ResetNode = 129,
    /// Reset communication parameters only
    ResetComm = 130,
}

/// NMT device states, encoded as reported in heartbeat frames
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum NmtState {
    /// Initial state, before the boot-up frame has been sent
    Bootup = 0,
    /// Only NMT and heartbeat are serviced
    Stopped = 4,
    /// All services active
    Operational = 5,
    /// All services except PDO active
    PreOperational = 127,
}

/// An NMT command addressed to one node (or broadcast with `node == 0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command specifier
    pub code: NmtCommandCode,
    /// Addressed node ID, 0 for broadcast
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != NMT_CMD_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            });
        }
        let payload = msg.data();
        if payload.len() < 2 {
            return Err(MessageError::MessageTooShort);
        }
        let code = NmtCommandCode::try_from(payload[0])
            .map_err(|_| MessageError::InvalidField)?;
        Ok(NmtCommand {
            code,
            node: payload[1],
        })
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.code as u8, cmd.node])
    }
}

/// A heartbeat (or node-guard response) frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Producing node ID
    pub node: u8,
    /// Node-guarding toggle bit; always 0 for plain heartbeats
    pub toggle: bool,
    /// Reported NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut byte = value.state as u8;
        if value.toggle {
            byte |= 1 << 7;
        }
        CanMessage::new(CanId::Std(HEARTBEAT_BASE | value.node as u16), &[byte])
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let raw = msg.id().raw();
        if raw & !0x7F != HEARTBEAT_BASE as u32 {
            return Err(MessageError::UnrecognizedId { cob_id: msg.id() });
        }
        if msg.data().is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let byte = msg.data()[0];
        let state = NmtState::try_from(byte & 0x7F)
            .map_err(|_| MessageError::InvalidNmtState { value: byte & 0x7F })?;
        Ok(Heartbeat {
            node: (raw & 0x7F) as u8,
            toggle: byte & 0x80 != 0,
            state,
        })
    }
}

/// A SYNC frame, with optional counter payload (object 1019h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncMessage {
    /// Counter value, present when the sync counter is enabled
    pub counter: Option<u8>,
}

impl SyncMessage {
    /// Build the frame for transmission on `cob_id`
    pub fn to_can_message(self, cob_id: CanId) -> CanMessage {
        match self.counter {
            Some(count) => CanMessage::new(cob_id, &[count]),
            None => CanMessage::new(cob_id, &[]),
        }
    }
}

impl From<CanMessage> for SyncMessage {
    fn from(msg: CanMessage) -> Self {
        let counter = msg.data().first().copied();
        SyncMessage { counter }
    }
}

/// An emergency frame: error code, error register, 5 manufacturer bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// CiA 301 emergency error code
    pub code: u16,
    /// Current value of the error register (object 1001h)
    pub register: u8,
    /// Manufacturer-specific payload
    pub vendor: [u8; 5],
}

impl EmcyMessage {
    /// Build the 8-byte frame for transmission on `cob_id`
    pub fn to_can_message(self, cob_id: CanId) -> CanMessage {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.code.to_le_bytes());
        data[2] = self.register;
        data[3..8].copy_from_slice(&self.vendor);
        CanMessage::new(cob_id, &data)
    }
}

impl TryFrom<CanMessage> for EmcyMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let data = msg.data();
        if data.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(EmcyMessage {
            code: u16::from_le_bytes(data[0..2].try_into().unwrap()),
            register: data[2],
            vendor: data[3..8].try_into().unwrap(),
        })
    }
}

/// Errors raised while decoding received frames
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The payload is shorter than the message type requires
    MessageTooShort,
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID: {cob_id:?}, expected {expected:?}"))]
    UnexpectedId {
        /// The ID found on the frame
        cob_id: CanId,
        /// The ID the decoder required
        expected: CanId,
    },
    /// A field holds a value outside its allowed set
    InvalidField,
    /// The COB-ID does not belong to any known service
    UnrecognizedId {
        /// The ID found on the frame
        cob_id: CanId,
    },
    /// The NMT state byte is not a valid state
    InvalidNmtState {
        /// The offending byte
        value: u8,
    },
}
