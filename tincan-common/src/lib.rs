//! Shared types for the tincan CANopen slave stack.
//!
//! This crate holds everything the node engine and its tests both need:
//! the CAN message model, the CANopen message codecs (NMT, heartbeat,
//! SYNC, EMCY), the SDO request/response codec with the CiA 301 abort
//! code taxonomy, the object data model, and the `AtomicCell` primitive
//! used to share state between interrupt and main-loop context.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

mod atomic_cell;
pub use atomic_cell::AtomicCell;

mod error;
pub mod messages;
pub mod node_id;
pub mod object_ids;
pub mod objects;
pub mod sdo;

pub use error::{BusState, NodeError};
pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
