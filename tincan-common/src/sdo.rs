//! SDO protocol codec: command specifiers, abort codes, and the
//! request/response frame encodings for expedited and segmented
//! transfers.
//!
//! All SDO frames are 8 bytes. Byte 0 carries the command specifier in
//! bits 5..7 and the transfer flags in the low bits; multi-byte fields
//! are little-endian.

/// Error produced while decoding an SDO frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoDecodeError {
    /// The frame is not 8 bytes long
    BadLength,
    /// The command specifier is unknown
    BadCommand,
}

/// Server command specifier (SCS) values used in responses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerCommand {
    /// Upload segment response
    SegmentUpload = 0,
    /// Download segment acknowledge
    SegmentDownload = 1,
    /// Initiate upload response
    Upload = 2,
    /// Initiate download acknowledge
    Download = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = SdoDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(SdoDecodeError::BadCommand),
        }
    }
}

/// Client command specifier (CCS) values used in requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate download
    InitiateDownload = 1,
    /// Initiate upload
    InitiateUpload = 2,
    /// Request upload segment
    ReqUploadSegment = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = SdoDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            _ => Err(SdoDecodeError::BadCommand),
        }
    }
}

/// SDO abort codes (CiA 301 §7.2.4.3.17)
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write-only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read-only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041,
    /// The number and length of mapped objects would exceed the PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    MinOverMax = 0x0609_0036,
    /// Resource not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be stored because of the present device state
    CantStoreDeviceState = 0x0800_0022,
    /// Object dictionary dynamic generation failed or no dictionary present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

/// A request frame received by the SDO server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoRequest {
    /// Start a download (client write); expedited when `e` is set
    InitiateDownload {
        /// Number of unused bytes in `data` (valid when `e` and `s`)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Inline value (expedited) or announced size (`e=0, s=1`)
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Last-segment flag
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Start an upload (client read)
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next upload segment
    ReqUploadSegment {
        /// Toggle bit
        t: bool,
    },
    /// Client-side abort
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download request carrying up to 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        debug_assert!(!data.is_empty() && data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented download initiate request, optionally announcing size
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create a download segment request
    pub fn download_segment(toggle: bool, last: bool, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= 7);
        let mut data = [0u8; 7];
        data[..payload.len()].copy_from_slice(payload);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (7 - payload.len()) as u8,
            c: last,
            data,
        }
    }

    /// Create an initiate upload request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Encode to an 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | (n & 0x3) << 2
                    | (e as u8) << 1
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 0x7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = SdoDecodeError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(SdoDecodeError::BadLength);
        }
        let ccs: ClientCommand = (value[0] >> 5).try_into()?;
        match ccs {
            ClientCommand::DownloadSegment => Ok(SdoRequest::DownloadSegment {
                t: value[0] & (1 << 4) != 0,
                n: (value[0] >> 1) & 0x7,
                c: value[0] & 1 != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateDownload => Ok(SdoRequest::InitiateDownload {
                n: (value[0] >> 2) & 0x3,
                e: value[0] & (1 << 1) != 0,
                s: value[0] & 1 != 0,
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
                data: value[4..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload {
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
            }),
            ClientCommand::ReqUploadSegment => Ok(SdoRequest::ReqUploadSegment {
                t: value[0] & (1 << 4) != 0,
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}

/// A response frame sent by the SDO server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoResponse {
    /// Initiate upload response; inline value when `e` is set
    ConfirmUpload {
        /// Number of unused bytes in `data` (valid when `e` and `s`)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Inline value (expedited) or total size (`e=0, s=1`)
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Last-segment flag
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Download initiate acknowledge
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Download segment acknowledge
    ConfirmDownloadSegment {
        /// Toggle bit
        t: bool,
    },
    /// Server-side abort
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create an expedited upload response carrying `data.len()` bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        debug_assert!(!data.is_empty() && data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        SdoResponse::ConfirmUpload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented upload initiate response announcing `size` bytes
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> Self {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment response
    pub fn upload_segment(t: bool, c: bool, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= 7);
        let mut data = [0u8; 7];
        data[..payload.len()].copy_from_slice(payload);
        SdoResponse::UploadSegment {
            t,
            n: (7 - payload.len()) as u8,
            c,
            data,
        }
    }

    /// Create a download acknowledge
    pub fn download_acknowledge(index: u16, sub: u8) -> Self {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledge
    pub fn download_segment_acknowledge(t: bool) -> Self {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Encode to an 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | (n & 0x3) << 2
                    | (e as u8) << 1
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | (n & 0x7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = SdoDecodeError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(SdoDecodeError::BadLength);
        }
        let scs: ServerCommand = (value[0] >> 5).try_into()?;
        match scs {
            ServerCommand::SegmentUpload => Ok(SdoResponse::UploadSegment {
                t: value[0] & (1 << 4) != 0,
                n: (value[0] >> 1) & 0x7,
                c: value[0] & 1 != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ServerCommand::SegmentDownload => Ok(SdoResponse::ConfirmDownloadSegment {
                t: value[0] & (1 << 4) != 0,
            }),
            ServerCommand::Upload => Ok(SdoResponse::ConfirmUpload {
                n: (value[0] >> 2) & 0x3,
                e: value[0] & (1 << 1) != 0,
                s: value[0] & 1 != 0,
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
                data: value[4..8].try_into().unwrap(),
            }),
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload {
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
            }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                sub: value[3],
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}
