//! Parameter persistence
//!
//! Objects marked persistent are serialized into a framed image and
//! handed to an [`NvmStore`] implementation, typically backed by a flash
//! page or an EEPROM. The image is:
//!
//! ```text
//! [crc16 u16][signature u16][payload_len u16][payload]
//! ```
//!
//! where the payload is a sequence of nodes, each
//! `[len u16][type u8][index u16][sub u8][data]`. The CRC (XMODEM)
//! covers everything after itself. Unknown node types are skipped on
//! restore, so images written by newer firmware remain loadable.

use crc16::{State, XMODEM};
use defmt_or_log::{debug, warn};
use tincan_common::object_ids;

use crate::dict::{find_entry, DictEntry, EntryValue};

/// Size of the serialized parameter image buffer
///
/// The full communication profile (nine scalar objects, four heartbeat
/// consumer slots, and eight PDO parameter records with their mapping
/// tables) serializes to a little over 1.1 KB; the rest of the buffer is
/// headroom for persisted application objects.
pub const NVM_IMAGE_SIZE: usize = 2048;

const SIGNATURE: u16 = 0x5AC1;
const HEADER_SIZE: usize = 6;

/// Node type tags used in the serialized payload
const NODE_OBJECT_VALUE: u8 = 1;

/// Errors reported by an [`NvmStore`] backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmError {
    /// The access fell outside the backing storage
    OutOfBounds,
    /// The backing storage failed
    Io,
    /// No backing storage is available
    Unavailable,
}

/// Byte-addressed non-volatile storage for parameter images
pub trait NvmStore {
    /// Read `buf.len()` bytes starting at `offset`
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError>;

    /// Write `data` starting at `offset`
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmError>;
}

/// The no-storage backend: loads find no image, saves fail
impl NvmStore for () {
    fn read(&mut self, _offset: usize, buf: &mut [u8]) -> Result<(), NvmError> {
        buf.fill(0);
        Ok(())
    }

    fn write(&mut self, _offset: usize, _data: &[u8]) -> Result<(), NvmError> {
        Err(NvmError::Unavailable)
    }
}

/// A RAM-backed store, for tests and battery-backed memory
#[derive(Debug, Clone)]
pub struct ArrayNvm<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> ArrayNvm<N> {
    /// Create a blank store
    pub const fn new() -> Self {
        Self { data: [0; N] }
    }
}

impl<const N: usize> Default for ArrayNvm<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> NvmStore for ArrayNvm<N> {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError> {
        let end = offset.checked_add(buf.len()).ok_or(NvmError::OutOfBounds)?;
        if end > N {
            return Err(NvmError::OutOfBounds);
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmError> {
        let end = offset.checked_add(data.len()).ok_or(NvmError::OutOfBounds)?;
        if end > N {
            return Err(NvmError::OutOfBounds);
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Highest sub-index probed when walking callback objects
const MAX_PROBED_SUB: u8 = 254;

fn persisted_subs<'a>(entry: &'a DictEntry<'a>) -> impl Iterator<Item = u8> + 'a {
    let range = match entry.value {
        EntryValue::Raw(_) => entry.sub..=entry.sub,
        EntryValue::Callback(_) => 0..=MAX_PROBED_SUB,
    };
    range.filter(|&sub| entry.sub_info(sub).map(|i| i.persist).unwrap_or(false))
}

fn append(buf: &mut [u8; NVM_IMAGE_SIZE], pos: &mut usize, data: &[u8]) -> Result<(), NvmError> {
    if *pos + data.len() > NVM_IMAGE_SIZE {
        return Err(NvmError::OutOfBounds);
    }
    buf[*pos..*pos + data.len()].copy_from_slice(data);
    *pos += data.len();
    Ok(())
}

/// Serialize all persistent objects and write the image to `nvm`
pub fn save_params<S: NvmStore>(nvm: &mut S, od: &[DictEntry]) -> Result<(), NvmError> {
    let mut buf = [0u8; NVM_IMAGE_SIZE];
    let mut pos = HEADER_SIZE;

    for entry in od {
        for sub in persisted_subs(entry) {
            let data_size = entry
                .read_size(od, sub)
                .map_err(|_| NvmError::OutOfBounds)?;
            let node_len = (data_size + 4) as u16;
            append(&mut buf, &mut pos, &node_len.to_le_bytes())?;
            append(&mut buf, &mut pos, &[NODE_OBJECT_VALUE])?;
            append(&mut buf, &mut pos, &entry.index.to_le_bytes())?;
            append(&mut buf, &mut pos, &[sub])?;
            if pos + data_size > NVM_IMAGE_SIZE {
                return Err(NvmError::OutOfBounds);
            }
            entry
                .read(od, sub, 0, &mut buf[pos..pos + data_size])
                .map_err(|_| NvmError::OutOfBounds)?;
            pos += data_size;
        }
    }

    let payload_len = (pos - HEADER_SIZE) as u16;
    buf[2..4].copy_from_slice(&SIGNATURE.to_le_bytes());
    buf[4..6].copy_from_slice(&payload_len.to_le_bytes());
    let crc = State::<XMODEM>::calculate(&buf[2..pos]);
    buf[0..2].copy_from_slice(&crc.to_le_bytes());

    debug!("Saving {} bytes of parameters", pos);
    nvm.write(0, &buf[..pos])
}

fn is_pdo_comm(index: u16) -> bool {
    (object_ids::RPDO_COMM_BASE..object_ids::RPDO_COMM_BASE + 4).contains(&index)
        || (object_ids::TPDO_COMM_BASE..object_ids::TPDO_COMM_BASE + 4).contains(&index)
}

fn is_pdo_activation(index: u16, sub: u8) -> bool {
    // PDO COB-ID entries carry the valid bit and must be restored after
    // the mapping they activate
    sub == 1 && is_pdo_comm(index)
}

/// Disable every PDO ahead of a restore
///
/// Mapping parameters are frozen while their PDO is active. The stored
/// COB-ID entries re-activate the PDOs in the final restore pass; a PDO
/// whose communication record is missing from the image stays disabled.
fn deactivate_pdos(od: &[DictEntry]) {
    for entry in od {
        if is_pdo_comm(entry.index) {
            let mut value = [0u8; 4];
            if entry.read(od, 1, 0, &mut value).is_ok() {
                value[3] |= 0x80;
                entry.write(od, 1, &value).ok();
            }
        }
    }
}

fn restore_node(od: &[DictEntry], index: u16, sub: u8, data: &[u8]) {
    match find_entry(od, index, sub) {
        Ok(entry) => {
            if let Err(abort_code) = entry.write(od, sub, data) {
                warn!(
                    "Error restoring object {:x}sub{}: {:x}",
                    index, sub, abort_code as u32
                );
            }
        }
        Err(_) => warn!("Saved object {:x}sub{} not found in dictionary", index, sub),
    }
}

fn walk_nodes(payload: &[u8], mut visit: impl FnMut(u16, u8, &[u8])) {
    let mut pos = 0;
    while payload.len() - pos >= 2 {
        let node_len = u16::from_le_bytes(payload[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if pos + node_len > payload.len() || node_len < 4 {
            warn!("Truncated parameter node, stopping restore");
            return;
        }
        let node = &payload[pos..pos + node_len];
        pos += node_len;
        if node[0] != NODE_OBJECT_VALUE {
            warn!("Unknown persisted node type {}", node[0]);
            continue;
        }
        let index = u16::from_le_bytes(node[1..3].try_into().unwrap());
        let sub = node[3];
        visit(index, sub, &node[4..]);
    }
}

/// Load a parameter image from `nvm` and restore the stored objects
///
/// Returns `Ok(false)` when no valid image is present; the dictionary is
/// left at its defaults. All PDOs are disabled before the stored objects
/// are applied, so mappings can be written past the active-PDO freeze;
/// the stored COB-ID entries re-activate the PDOs in a second pass.
pub fn load_params<S: NvmStore>(nvm: &mut S, od: &[DictEntry]) -> Result<bool, NvmError> {
    let mut header = [0u8; HEADER_SIZE];
    nvm.read(0, &mut header)?;
    if u16::from_le_bytes(header[2..4].try_into().unwrap()) != SIGNATURE {
        return Ok(false);
    }
    let payload_len = u16::from_le_bytes(header[4..6].try_into().unwrap()) as usize;
    if payload_len > NVM_IMAGE_SIZE - HEADER_SIZE {
        warn!("Parameter image length {} is implausible", payload_len);
        return Ok(false);
    }
    let mut buf = [0u8; NVM_IMAGE_SIZE];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    nvm.read(HEADER_SIZE, &mut buf[HEADER_SIZE..HEADER_SIZE + payload_len])?;

    let stored_crc = u16::from_le_bytes(header[0..2].try_into().unwrap());
    let crc = State::<XMODEM>::calculate(&buf[2..HEADER_SIZE + payload_len]);
    if crc != stored_crc {
        warn!("Parameter image CRC mismatch");
        return Ok(false);
    }

    let payload = &buf[HEADER_SIZE..HEADER_SIZE + payload_len];
    deactivate_pdos(od);
    walk_nodes(payload, |index, sub, data| {
        if !is_pdo_activation(index, sub) {
            restore_node(od, index, sub, data);
        }
    });
    walk_nodes(payload, |index, sub, data| {
        if is_pdo_activation(index, sub) {
            restore_node(od, index, sub, data);
        }
    });
    Ok(true)
}

/// Invalidate any stored parameter image
///
/// Used by the restore-defaults command (1011h); the defaults take
/// effect on the next reset.
pub fn invalidate_params<S: NvmStore>(nvm: &mut S) -> Result<(), NvmError> {
    nvm.write(0, &[0u8; HEADER_SIZE])
}
