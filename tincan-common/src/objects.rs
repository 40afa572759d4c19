//! Object dictionary data model: data types, access rights, PDO
//! mappability, and the per-sub metadata consumed by the SDO and PDO
//! engines.

/// A container for the address of a sub-object
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

/// Access type of a sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only and never changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }
}

/// Possible PDO mapping permissions for an object
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum PdoMapping {
    /// Object cannot be mapped to PDOs
    #[default]
    None,
    /// Object can be mapped to RPDOs only
    Rpdo,
    /// Object can be mapped to TPDOs only
    Tpdo,
    /// Object can be mapped to both RPDOs and TPDOs
    Both,
}

impl PdoMapping {
    /// Returns true if the object may appear in a TPDO mapping
    pub fn allows_tpdo(&self) -> bool {
        matches!(self, PdoMapping::Tpdo | PdoMapping::Both)
    }

    /// Returns true if the object may appear in an RPDO mapping
    pub fn allows_rpdo(&self) -> bool {
        matches!(self, PdoMapping::Rpdo | PdoMapping::Both)
    }
}

/// CiA 301 data type codes
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean = 1,
    #[default]
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    Real32 = 8,
    VisibleString = 9,
    OctetString = 0xa,
    UnicodeString = 0xb,
    Domain = 0xf,
}

impl DataType {
    /// Returns true if the data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }
}

/// Metadata describing a sub-object
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SubInfo {
    /// The size (or max size) of this sub-object, in bytes
    pub size: usize,
    /// The data type of this sub-object
    pub data_type: DataType,
    /// Which accesses are allowed on this sub-object
    pub access_type: AccessType,
    /// Whether this sub may be mapped to PDOs
    pub pdo_mapping: PdoMapping,
    /// Whether this sub is included when parameters are stored to NVM
    pub persist: bool,
}

impl SubInfo {
    /// Shorthand for sub0 on record and array objects
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        pdo_mapping: PdoMapping::None,
        persist: false,
    };

    /// A read-only u32 sub-object
    pub const fn new_u32() -> Self {
        Self {
            size: 4,
            data_type: DataType::UInt32,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// A read-only u16 sub-object
    pub const fn new_u16() -> Self {
        Self {
            size: 2,
            data_type: DataType::UInt16,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// A read-only u8 sub-object
    pub const fn new_u8() -> Self {
        Self {
            size: 1,
            data_type: DataType::UInt8,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// A read-only visible string sub-object with max size `size`
    pub const fn new_visible_str(size: usize) -> Self {
        Self {
            size,
            data_type: DataType::VisibleString,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Set the access type to read-only
    pub const fn ro(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }

    /// Set the access type to read-write
    pub const fn rw(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }

    /// Set the access type to const
    pub const fn konst(mut self) -> Self {
        self.access_type = AccessType::Const;
        self
    }

    /// Mark the sub-object as persistable
    pub const fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Set the PDO mapping permission
    pub const fn mappable(mut self, mapping: PdoMapping) -> Self {
        self.pdo_mapping = mapping;
        self
    }
}
