//! Object dictionary
//!
//! The dictionary is a table of [`DictEntry`] records sorted by
//! (index, sub-index). Each entry is either a raw storage cell
//! ([`EntryValue::Raw`]) or a handler which claims the whole index and
//! dispatches sub-indexes itself ([`EntryValue::Callback`]). The table
//! structure is immutable once built; only cell contents mutate, and all
//! cells are safe to touch from interrupt context.
//!
//! Lookup uses a binary search. The `linear-search` cargo feature swaps
//! in a functionally identical linear scan; both implementations are
//! always compiled so tests can check their equivalence.

use core::cell::UnsafeCell;

use tincan_common::{
    objects::{DataType, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

/// Outcome of a dictionary write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteOutcome {
    /// The write completed
    Done,
    /// The write was accepted but completes later; the SDO response is
    /// withheld until the node resolves the pending operation
    Deferred,
}

/// Byte-level access to a raw storage cell
pub trait RawValue: Sync + Send {
    /// Read `buf.len()` bytes starting at `offset`, returning the number
    /// of bytes read
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// The number of bytes available to read
    fn read_size(&self) -> usize;

    /// Replace the stored value
    fn write(&self, data: &[u8]) -> Result<(), AbortCode>;

    /// Read the TPDO event flag for this cell
    fn read_event_flag(&self) -> bool {
        false
    }

    /// Clear the TPDO event flag
    fn clear_event_flag(&self) {}
}

/// A handler implementing every sub-index of one object
pub trait DictCallback: Sync + Send {
    /// Read bytes from a sub-object
    fn read(
        &self,
        od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode>;

    /// The number of bytes available to read from a sub-object
    fn read_size(&self, od: &[DictEntry], sub: u8) -> Result<usize, AbortCode>;

    /// Write a complete value to a sub-object
    fn write(&self, od: &[DictEntry], sub: u8, data: &[u8]) -> Result<WriteOutcome, AbortCode>;

    /// Metadata for a sub-object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;
}

/// The storage or handler behind a dictionary entry
#[derive(Clone, Copy)]
#[allow(missing_debug_implementations)]
pub enum EntryValue<'a> {
    /// A raw storage cell for one (index, sub) pair
    Raw(&'a dyn RawValue),
    /// A handler claiming the whole index
    Callback(&'a dyn DictCallback),
}

/// One record of the dictionary table
#[derive(Clone, Copy)]
#[allow(missing_debug_implementations)]
pub struct DictEntry<'a> {
    /// Object index
    pub index: u16,
    /// Sub-index; always 0 for callback entries
    pub sub: u8,
    /// Metadata; for callback entries the handler's `sub_info` is
    /// authoritative and this field is ignored
    pub info: SubInfo,
    /// The storage or handler
    pub value: EntryValue<'a>,
}

const CALLBACK_INFO: SubInfo = SubInfo {
    size: 0,
    data_type: DataType::UInt8,
    access_type: tincan_common::objects::AccessType::Ro,
    pdo_mapping: tincan_common::objects::PdoMapping::None,
    persist: false,
};

impl<'a> DictEntry<'a> {
    /// Create a raw entry for one (index, sub) pair
    pub const fn raw(index: u16, sub: u8, info: SubInfo, value: &'a dyn RawValue) -> Self {
        Self {
            index,
            sub,
            info,
            value: EntryValue::Raw(value),
        }
    }

    /// Create a callback entry claiming the whole index
    pub const fn callback(index: u16, value: &'a dyn DictCallback) -> Self {
        Self {
            index,
            sub: 0,
            info: CALLBACK_INFO,
            value: EntryValue::Callback(value),
        }
    }

    /// Metadata for `sub` on this entry
    pub fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match self.value {
            EntryValue::Raw(_) => {
                if sub == self.sub {
                    Ok(self.info)
                } else {
                    Err(AbortCode::NoSuchSubIndex)
                }
            }
            EntryValue::Callback(cb) => cb.sub_info(sub),
        }
    }

    /// Read bytes from `sub`, enforcing the access type
    pub fn read(
        &self,
        od: &[DictEntry],
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        if !self.sub_info(sub)?.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        match self.value {
            EntryValue::Raw(v) => v.read(offset, buf),
            EntryValue::Callback(cb) => cb.read(od, sub, offset, buf),
        }
    }

    /// The number of bytes a read of `sub` returns
    pub fn read_size(&self, od: &[DictEntry], sub: u8) -> Result<usize, AbortCode> {
        match self.value {
            EntryValue::Raw(v) => {
                self.sub_info(sub)?;
                Ok(v.read_size())
            }
            EntryValue::Callback(cb) => cb.read_size(od, sub),
        }
    }

    /// Write a complete value to `sub`, enforcing the access type
    pub fn write(
        &self,
        od: &[DictEntry],
        sub: u8,
        data: &[u8],
    ) -> Result<WriteOutcome, AbortCode> {
        if !self.sub_info(sub)?.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        match self.value {
            EntryValue::Raw(v) => {
                v.write(data)?;
                Ok(WriteOutcome::Done)
            }
            EntryValue::Callback(cb) => cb.write(od, sub, data),
        }
    }

    /// Read the TPDO event flag for `sub`
    pub fn read_event_flag(&self, sub: u8) -> bool {
        match self.value {
            EntryValue::Raw(v) => sub == self.sub && v.read_event_flag(),
            EntryValue::Callback(_) => false,
        }
    }

    /// Clear the TPDO event flag for `sub`
    pub fn clear_event_flag(&self, sub: u8) {
        if let EntryValue::Raw(v) = self.value {
            if sub == self.sub {
                v.clear_event_flag();
            }
        }
    }
}

/// Reason a dictionary lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictError {
    /// No object with the requested index exists
    NoIndex,
    /// The object exists but has no such sub-index
    NoSub,
}

impl DictError {
    /// The SDO abort code reported for this lookup failure
    pub fn abort_code(self) -> AbortCode {
        match self {
            DictError::NoIndex => AbortCode::NoSuchObject,
            DictError::NoSub => AbortCode::NoSuchSubIndex,
        }
    }
}

pub(crate) fn find_binary<'a, 'b>(
    table: &'b [DictEntry<'a>],
    index: u16,
    sub: u8,
) -> Result<&'b DictEntry<'a>, DictError> {
    match table.binary_search_by_key(&(index, sub), |e| (e.index, e.sub)) {
        Ok(i) => Ok(&table[i]),
        Err(_) => {
            // A callback entry is stored once, at sub 0, and matches any sub
            let first = table.partition_point(|e| e.index < index);
            if first < table.len() && table[first].index == index {
                if matches!(table[first].value, EntryValue::Callback(_)) {
                    Ok(&table[first])
                } else {
                    Err(DictError::NoSub)
                }
            } else {
                Err(DictError::NoIndex)
            }
        }
    }
}

pub(crate) fn find_linear<'a, 'b>(
    table: &'b [DictEntry<'a>],
    index: u16,
    sub: u8,
) -> Result<&'b DictEntry<'a>, DictError> {
    let mut index_seen = false;
    for entry in table {
        if entry.index != index {
            continue;
        }
        index_seen = true;
        if entry.sub == sub || matches!(entry.value, EntryValue::Callback(_)) {
            return Ok(entry);
        }
    }
    if index_seen {
        Err(DictError::NoSub)
    } else {
        Err(DictError::NoIndex)
    }
}

/// Look up the entry serving (index, sub)
///
/// The table must be sorted by (index, sub), as produced by
/// [`DictBuilder`].
pub fn find_entry<'a, 'b>(
    table: &'b [DictEntry<'a>],
    index: u16,
    sub: u8,
) -> Result<&'b DictEntry<'a>, DictError> {
    #[cfg(not(feature = "linear-search"))]
    {
        find_binary(table, index, sub)
    }
    #[cfg(feature = "linear-search")]
    {
        find_linear(table, index, sub)
    }
}

/// Error raised while assembling the dictionary table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictBuildError {
    /// The table capacity was exceeded
    Capacity,
    /// Two entries claim the same (index, sub) pair, or a callback entry
    /// shares an index with another entry
    Duplicate {
        /// Colliding object index
        index: u16,
        /// Colliding sub-index
        sub: u8,
    },
}

/// Assembles communication-profile and application entries into a sorted
/// dictionary table
#[allow(missing_debug_implementations)]
pub struct DictBuilder<const N: usize> {
    entries: heapless::Vec<DictEntry<'static>, N>,
}

impl<const N: usize> Default for DictBuilder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DictBuilder<N> {
    /// Create an empty builder
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Add one entry
    pub fn add(&mut self, entry: DictEntry<'static>) -> Result<(), DictBuildError> {
        self.entries
            .push(entry)
            .map_err(|_| DictBuildError::Capacity)
    }

    /// Add a slice of entries
    pub fn add_all(&mut self, entries: &[DictEntry<'static>]) -> Result<(), DictBuildError> {
        for entry in entries {
            self.add(*entry)?;
        }
        Ok(())
    }

    /// Sort the table and check for collisions
    pub fn build(mut self) -> Result<ObjectDict<N>, DictBuildError> {
        self.entries
            .sort_unstable_by_key(|e| (e.index, e.sub));
        for pair in self.entries.windows(2) {
            let collides = (pair[0].index, pair[0].sub) == (pair[1].index, pair[1].sub)
                || (pair[0].index == pair[1].index
                    && (matches!(pair[0].value, EntryValue::Callback(_))
                        || matches!(pair[1].value, EntryValue::Callback(_))));
            if collides {
                return Err(DictBuildError::Duplicate {
                    index: pair[1].index,
                    sub: pair[1].sub,
                });
            }
        }
        Ok(ObjectDict {
            entries: self.entries,
        })
    }
}

/// The built dictionary table
#[allow(missing_debug_implementations)]
pub struct ObjectDict<const N: usize> {
    entries: heapless::Vec<DictEntry<'static>, N>,
}

impl<const N: usize> ObjectDict<N> {
    /// The sorted entry table
    pub fn entries(&self) -> &[DictEntry<'static>] {
        &self.entries
    }

    /// Look up the entry serving (index, sub)
    pub fn find(&self, index: u16, sub: u8) -> Result<&DictEntry<'static>, DictError> {
        find_entry(&self.entries, index, sub)
    }
}

/// A raw cell holding one scalar value, with a TPDO event flag
///
/// [`ScalarCell::set`] is the application-facing setter; it marks the
/// event flag so mapped TPDOs fire. Writes arriving through the
/// dictionary (SDO, RPDO) use [`RawValue::write`] and do not set the
/// flag.
#[derive(Debug)]
pub struct ScalarCell<T: Copy> {
    value: AtomicCell<T>,
    flag: AtomicCell<bool>,
}

impl<T: Send + Copy> ScalarCell<T> {
    /// Create a cell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            value: AtomicCell::new(value),
            flag: AtomicCell::new(false),
        }
    }

    /// Read the current value
    pub fn load(&self) -> T {
        self.value.load()
    }

    /// Store a value without raising the event flag
    pub fn store(&self, value: T) {
        self.value.store(value);
    }

    /// Store a value and raise the event flag
    pub fn set(&self, value: T) {
        self.value.store(value);
        self.flag.store(true);
    }
}

macro_rules! impl_scalar_cell {
    ($t:ty) => {
        impl RawValue for ScalarCell<$t> {
            fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
                let bytes = self.value.load().to_le_bytes();
                if offset >= bytes.len() {
                    return Ok(0);
                }
                let read_len = buf.len().min(bytes.len() - offset);
                buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
                Ok(read_len)
            }

            fn read_size(&self) -> usize {
                core::mem::size_of::<$t>()
            }

            fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
                let value = <$t>::from_le_bytes(data.try_into().map_err(|_| {
                    if data.len() < core::mem::size_of::<$t>() {
                        AbortCode::DataTypeMismatchLengthLow
                    } else {
                        AbortCode::DataTypeMismatchLengthHigh
                    }
                })?);
                self.value.store(value);
                Ok(())
            }

            fn read_event_flag(&self) -> bool {
                self.flag.load()
            }

            fn clear_event_flag(&self) {
                self.flag.store(false);
            }
        }
    };
}

impl_scalar_cell!(u8);
impl_scalar_cell!(u16);
impl_scalar_cell!(u32);
impl_scalar_cell!(i8);
impl_scalar_cell!(i16);
impl_scalar_cell!(i32);
impl_scalar_cell!(f32);

/// A raw cell holding a fixed-size byte array
#[allow(missing_debug_implementations)]
pub struct BytesCell<const N: usize> {
    value: UnsafeCell<[u8; N]>,
}

// Access always happens inside a critical section
unsafe impl<const N: usize> Sync for BytesCell<N> {}

impl<const N: usize> BytesCell<N> {
    /// Create a cell holding `value`
    pub const fn new(value: [u8; N]) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Atomically read the stored bytes
    pub fn load(&self) -> [u8; N] {
        critical_section::with(|_| unsafe { *self.value.get() })
    }

    /// Atomically replace the stored bytes
    pub fn store(&self, value: [u8; N]) {
        critical_section::with(|_| {
            let bytes = unsafe { &mut *self.value.get() };
            *bytes = value;
        });
    }
}

impl<const N: usize> Default for BytesCell<N> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

impl<const N: usize> RawValue for BytesCell<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        critical_section::with(|_| {
            let bytes = unsafe { &*self.value.get() };
            if offset >= bytes.len() {
                return Ok(0);
            }
            let read_len = buf.len().min(bytes.len() - offset);
            buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
            Ok(read_len)
        })
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        critical_section::with(|_| {
            let bytes = unsafe { &mut *self.value.get() };
            if data.len() > bytes.len() {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
            bytes[..data.len()].copy_from_slice(data);
            Ok(())
        })
    }
}

/// A null-terminated string cell backing the visible-string objects
///
/// Values shorter than the capacity are terminated with a zero byte, and
/// reads report the terminated length.
#[allow(missing_debug_implementations)]
pub struct StrCell<const N: usize>(BytesCell<N>);

impl<const N: usize> StrCell<N> {
    /// Create an empty string cell
    pub const fn new() -> Self {
        Self(BytesCell::new([0; N]))
    }

    /// Store a string value, null-terminating short values
    ///
    /// Values longer than the capacity are truncated.
    pub fn set_str(&self, value: &[u8]) {
        let mut buf = [0u8; N];
        let len = value.len().min(N);
        buf[..len].copy_from_slice(&value[..len]);
        self.0.store(buf);
    }
}

impl<const N: usize> Default for StrCell<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RawValue for StrCell<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let size = self.0.read(offset, buf)?;
        Ok(buf[..size].iter().position(|b| *b == 0).unwrap_or(size))
    }

    fn read_size(&self) -> usize {
        let bytes = self.0.load();
        bytes.iter().position(|b| *b == 0).unwrap_or(N)
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        let mut buf = [0u8; N];
        buf[..data.len()].copy_from_slice(data);
        self.0.store(buf);
        Ok(())
    }
}

/// A read-only cell whose value never changes
#[derive(Debug)]
pub struct ConstCell<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> ConstCell<N> {
    /// Create a const cell; use `to_le_bytes` for scalar values
    pub const fn new(bytes: [u8; N]) -> Self {
        Self { bytes }
    }
}

impl<const N: usize> RawValue for ConstCell<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if offset >= N {
            return Ok(0);
        }
        let read_len = buf.len().min(N - offset);
        buf[..read_len].copy_from_slice(&self.bytes[offset..offset + read_len]);
        Ok(read_len)
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::ReadOnly)
    }
}

/// A COB-ID cell with reserved-range validation
///
/// `flag_mask` selects which of the three configuration bits (29:
/// extended frame, 30: generator enable, 31: invalid) a write may set.
/// `allow_reserved` permits one identifier from the reserved ranges, for
/// objects whose default assignment lives there (1005h).
#[derive(Debug)]
pub struct CobIdCell {
    value: AtomicCell<u32>,
    flag_mask: u32,
    allow_reserved: Option<u16>,
}

impl CobIdCell {
    /// Create a cell holding `value`
    pub const fn new(value: u32, flag_mask: u32, allow_reserved: Option<u16>) -> Self {
        Self {
            value: AtomicCell::new(value),
            flag_mask,
            allow_reserved,
        }
    }

    /// Read the raw 32-bit object value
    pub fn load(&self) -> u32 {
        self.value.load()
    }

    /// Store the raw 32-bit object value without validation
    pub fn store(&self, value: u32) {
        self.value.store(value);
    }

    /// The CAN identifier encoded in the current value
    pub fn can_id(&self) -> tincan_common::CanId {
        let value = self.value.load();
        if value & (1 << 29) != 0 {
            tincan_common::CanId::extended(value & 0x1FFF_FFFF)
        } else {
            tincan_common::CanId::std((value & 0x7FF) as u16)
        }
    }
}

impl RawValue for CobIdCell {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let bytes = self.value.load().to_le_bytes();
        if offset >= 4 {
            return Ok(0);
        }
        let read_len = buf.len().min(4 - offset);
        buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
        Ok(read_len)
    }

    fn read_size(&self) -> usize {
        4
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() != 4 {
            return Err(AbortCode::DataTypeMismatch);
        }
        let value = u32::from_le_bytes(data.try_into().unwrap());
        if value & 0xE000_0000 & !self.flag_mask != 0 {
            return Err(AbortCode::InvalidValue);
        }
        let id = if value & (1 << 29) != 0 {
            tincan_common::CanId::extended(value & 0x1FFF_FFFF)
        } else {
            tincan_common::CanId::std((value & 0x7FF) as u16)
        };
        if tincan_common::messages::reserved_cob_id(id)
            && self.allow_reserved != Some((value & 0x7FF) as u16)
        {
            return Err(AbortCode::InvalidValue);
        }
        self.value.store(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tincan_common::objects::{AccessType, PdoMapping};

    struct DummyCallback;

    impl DictCallback for DummyCallback {
        fn read(
            &self,
            _od: &[DictEntry],
            sub: u8,
            _offset: usize,
            buf: &mut [u8],
        ) -> Result<usize, AbortCode> {
            if sub > 2 {
                return Err(AbortCode::NoSuchSubIndex);
            }
            buf[0] = sub;
            Ok(1)
        }

        fn read_size(&self, _od: &[DictEntry], _sub: u8) -> Result<usize, AbortCode> {
            Ok(1)
        }

        fn write(
            &self,
            _od: &[DictEntry],
            _sub: u8,
            _data: &[u8],
        ) -> Result<WriteOutcome, AbortCode> {
            Err(AbortCode::ReadOnly)
        }

        fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
            if sub > 2 {
                return Err(AbortCode::NoSuchSubIndex);
            }
            Ok(SubInfo::new_u8())
        }
    }

    fn sample_table() -> &'static [DictEntry<'static>] {
        let a = Box::leak(Box::new(ScalarCell::<u32>::new(7)));
        let b = Box::leak(Box::new(ScalarCell::<u16>::new(8)));
        let c = Box::leak(Box::new(ScalarCell::<u8>::new(9)));
        let cb = Box::leak(Box::new(DummyCallback));
        let mut builder: DictBuilder<8> = DictBuilder::new();
        builder
            .add(DictEntry::raw(0x2000, 0, SubInfo::new_u32().rw(), a))
            .unwrap();
        builder
            .add(DictEntry::raw(0x2001, 1, SubInfo::new_u16(), b))
            .unwrap();
        builder
            .add(DictEntry::raw(0x2001, 2, SubInfo::new_u8(), c))
            .unwrap();
        builder.add(DictEntry::callback(0x2002, cb)).unwrap();
        let dict = builder.build().unwrap();
        Box::leak(Box::new(dict)).entries()
    }

    #[test]
    fn binary_and_linear_search_agree() {
        let table = sample_table();
        for index in [0x1FFF, 0x2000, 0x2001, 0x2002, 0x2003] {
            for sub in 0..4 {
                let bin = find_binary(table, index, sub).map(|e| (e.index, e.sub));
                let lin = find_linear(table, index, sub).map(|e| (e.index, e.sub));
                assert_eq!(bin, lin, "mismatch at {index:#x} sub {sub}");
            }
        }
    }

    #[test]
    fn callback_entry_matches_any_sub() {
        let table = sample_table();
        let entry = find_entry(table, 0x2002, 2).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(entry.read(table, 2, 0, &mut buf), Ok(1));
        assert_eq!(buf[0], 2);
        assert_eq!(
            find_entry(table, 0x2001, 3).map(|e| (e.index, e.sub)),
            Err(DictError::NoSub)
        );
        assert_eq!(
            find_entry(table, 0x3000, 0).map(|e| (e.index, e.sub)),
            Err(DictError::NoIndex)
        );
    }

    #[test]
    fn duplicate_entries_rejected() {
        let a = Box::leak(Box::new(ScalarCell::<u8>::new(0)));
        let mut builder: DictBuilder<4> = DictBuilder::new();
        builder
            .add(DictEntry::raw(0x2000, 0, SubInfo::new_u8(), a))
            .unwrap();
        builder
            .add(DictEntry::raw(0x2000, 0, SubInfo::new_u8(), a))
            .unwrap();
        assert_eq!(
            builder.build().err(),
            Some(DictBuildError::Duplicate {
                index: 0x2000,
                sub: 0
            })
        );
    }

    #[test]
    fn scalar_cell_set_raises_event_flag() {
        let cell = ScalarCell::<u16>::new(0);
        assert!(!cell.read_event_flag());
        cell.store(1);
        assert!(!cell.read_event_flag());
        cell.set(2);
        assert!(cell.read_event_flag());
        cell.clear_event_flag();
        assert!(!cell.read_event_flag());
    }

    #[test]
    fn str_cell_reports_terminated_length() {
        let cell = StrCell::<10>::new();
        cell.set_str(b"node");
        assert_eq!(cell.read_size(), 4);
        let mut buf = [0u8; 10];
        assert_eq!(cell.read(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"node");
    }

    #[test]
    fn cob_id_cell_rejects_reserved_ranges() {
        let cell = CobIdCell::new(0x81, 1 << 31, None);
        assert_eq!(
            cell.write(&0x000u32.to_le_bytes()),
            Err(AbortCode::InvalidValue)
        );
        assert_eq!(
            cell.write(&0x601u32.to_le_bytes()),
            Err(AbortCode::InvalidValue)
        );
        cell.write(&0x85u32.to_le_bytes()).unwrap();
        assert_eq!(cell.load(), 0x85);
        // disable flag is allowed, extended flag is not
        cell.write(&(0x85u32 | 1 << 31).to_le_bytes()).unwrap();
        assert_eq!(
            cell.write(&(0x85u32 | 1 << 29).to_le_bytes()),
            Err(AbortCode::InvalidValue)
        );
    }

    #[test]
    fn access_type_enforced_by_entry() {
        let cell = Box::leak(Box::new(ScalarCell::<u8>::new(3)));
        let entry = DictEntry::raw(
            0x2000,
            0,
            SubInfo {
                size: 1,
                data_type: DataType::UInt8,
                access_type: AccessType::Ro,
                pdo_mapping: PdoMapping::None,
                persist: false,
            },
            cell,
        );
        assert_eq!(entry.write(&[], 0, &[1]), Err(AbortCode::ReadOnly));
        let mut buf = [0u8; 1];
        assert_eq!(entry.read(&[], 0, 0, &mut buf), Ok(1));
    }
}
