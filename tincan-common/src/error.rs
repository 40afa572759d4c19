//! Error and bus-health types shared across the stack.

use snafu::Snafu;

/// Errors surfaced by the node engine to the application
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum NodeError {
    /// The configured node ID is outside 1..=127
    #[snafu(display("node ID {id} is outside 1..=127"))]
    InvalidNodeId {
        /// The rejected value
        id: u8,
    },
    /// The configured bitrate is not one of the standard CiA rates
    #[snafu(display("bitrate {bitrate} is not a standard CiA rate"))]
    InvalidBitrate {
        /// The rejected value, in bits per second
        bitrate: u32,
    },
    /// Two dictionary entries claim the same address
    #[snafu(display("duplicate dictionary entry at {index:#06x} sub {sub}"))]
    DictCollision {
        /// Colliding object index
        index: u16,
        /// Colliding sub-index
        sub: u8,
    },
    /// The dictionary table capacity was exceeded
    DictCapacity,
    /// Loading parameters from non-volatile storage failed
    ParamLoad,
    /// Saving parameters to non-volatile storage failed
    ParamSave,
    /// The NMT master commanded a full device reset; the application
    /// must re-create the node
    ResetRequested,
    /// The CAN controller is bus-off and cannot transmit
    BusOff,
}

/// Health of the CAN controller as reported by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusState {
    /// Error counters below the warning threshold
    #[default]
    Active,
    /// Error-warning level reached (counter >= 96)
    Warning,
    /// Error-passive level reached (counter >= 128)
    Passive,
    /// Controller has gone bus-off
    BusOff,
}
