//! Storage node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a storage node ID in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Identifier of a storage node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Create a NodeId from raw bytes.
    pub fn from_array(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode from the raw bytes stored in the database.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidNodeId(format!(
                "expected {NODE_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse from a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|e| crate::Error::InvalidNodeId(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
