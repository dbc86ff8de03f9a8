//! Cluster Protocol
//!
//! Datagram messages exchanged between servers on the cluster port, and
//! the frame header shared by the datagram and client stream encodings.

use serde::{Deserialize, Serialize};

use crate::clock::LamportTs;
use crate::state::StateOp;

/// Server-to-server messages, distinguished by variant tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Periodic liveness announcement
    Heartbeat {
        sender_id: String,
        lamport_ts: LamportTs,
        /// Leader the sender currently believes in (diagnostics only)
        leader_id: Option<String>,
    },

    /// Sent by a server when it becomes leader
    LeaderAnnounce {
        sender_id: String,
        lamport_ts: LamportTs,
    },

    /// Leader-originated state mutation
    Replicate {
        sender_id: String,
        lamport_ts: LamportTs,
        op: StateOp,
    },
}

impl ClusterMessage {
    /// Sending member
    pub fn sender_id(&self) -> &str {
        match self {
            ClusterMessage::Heartbeat { sender_id, .. }
            | ClusterMessage::LeaderAnnounce { sender_id, .. }
            | ClusterMessage::Replicate { sender_id, .. } => sender_id,
        }
    }

    /// Lamport time the message was sent at
    pub fn lamport_ts(&self) -> LamportTs {
        match self {
            ClusterMessage::Heartbeat { lamport_ts, .. }
            | ClusterMessage::LeaderAnnounce { lamport_ts, .. }
            | ClusterMessage::Replicate { lamport_ts, .. } => *lamport_ts,
        }
    }

    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Heartbeat { .. } => "HEARTBEAT",
            ClusterMessage::LeaderAnnounce { .. } => "LEADER_ANNOUNCE",
            ClusterMessage::Replicate { .. } => "REPLICATE",
        }
    }
}

/// Frame header for length-prefixed, checksummed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// CRC-32 of the body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check a body against this header
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.length as usize && crc32fast::hash(body) == self.checksum
    }
}
