//! Library for implementing a CANopen (CiA 301) slave node, primarily
//! on an MCU
//!
//! The stack is split between interrupt context and the main loop: a
//! statically allocated [`NodeMbox`] receives frames from the CAN
//! driver (usually in an IRQ) and a [`Node`] object drives the protocol
//! engines from the application's main loop.
//!
//! ```ignore
//! use tincan_node::{DeviceContext, Node, NodeMbox, StackConfig};
//! use tincan_node::common::NodeId;
//!
//! static CTX: DeviceContext = DeviceContext::new();
//! static MBOX: NodeMbox = NodeMbox::new(&CTX.rpdos);
//!
//! let config = StackConfig::new(NodeId::new(5).unwrap());
//! let mut node = Node::new(config, &CTX, &MBOX, &[], ()).unwrap();
//!
//! loop {
//!     // Feed received frames to MBOX.store_message() from the IRQ,
//!     // then run the engines:
//!     node.process(now_ms(), &mut |msg| can_tx(msg)).unwrap();
//! }
//! ```
//!
//! Implemented services:
//!
//! - Object dictionary with statically registered entries
//! - SDO server with expedited and segmented transfers
//! - Four receive and four transmit PDOs with dynamic mapping
//! - NMT slave state machine, heartbeat production and consumption,
//!   node guarding
//! - EMCY production with error history (1003h)
//! - SYNC consumption and optional SYNC production
//! - Parameter persistence (1010h/1011h) through a pluggable NVM
//!   backend

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod context;
pub mod dict;
pub mod emcy;
pub mod mbox;
pub mod nmt;
pub mod nvm;
pub mod pdo;
pub mod sdo_server;
pub mod sync;

mod node;

pub use context::DeviceContext;
pub use mbox::NodeMbox;
pub use node::{Node, StackConfig, DICT_CAPACITY, STARTUP_SELF_START};

pub use tincan_common as common;

// Re-exported because implementing critical-section is a requirement for
// using this crate on bare-metal targets
pub use critical_section;
