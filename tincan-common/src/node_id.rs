//! Node ID newtype enforcing the CANopen 1..=127 range.

use crate::error::NodeError;

/// The ID of a node on the bus.
///
/// Valid node IDs are 1 through 127; everything else is rejected at
/// construction so the engines never have to re-validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u8);

impl NodeId {
    /// Create a new node ID, rejecting values outside 1..=127
    pub const fn new(value: u8) -> Result<Self, NodeError> {
        if value >= 1 && value <= 127 {
            Ok(NodeId(value))
        } else {
            Err(NodeError::InvalidNodeId { id: value })
        }
    }

    /// Get the raw ID value
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = NodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}
