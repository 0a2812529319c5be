//! Coordination Protocol
//!
//! Defines the wire protocol spoken between nodes on the coordination
//! channel. Every request frame is answered with exactly one response frame.

use serde::{Deserialize, Serialize};

use crate::state::{Epoch, NodeId, NodeRole};

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Liveness ==========
    /// Liveness probe
    Probe { from: NodeId, epoch: Epoch },

    /// Probe acknowledgement carrying the responder's view
    ProbeAck {
        from: NodeId,
        epoch: Epoch,
        leader: Option<NodeId>,
        role: NodeRole,
    },

    // ========== Leader Election ==========
    /// Candidacy announcement for the round `(epoch, initiator)`
    Announce {
        from: NodeId,
        epoch: Epoch,
        initiator: NodeId,
    },

    /// Announcement received
    AnnounceAck { from: NodeId, epoch: Epoch },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Sender is not a cluster member
    UnknownNode,
    /// Request type not valid on this channel
    Unsupported,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Identifier of the sending node, if the message carries one
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            Message::Probe { from, .. }
            | Message::ProbeAck { from, .. }
            | Message::Announce { from, .. }
            | Message::AnnounceAck { from, .. } => Some(*from),
            Message::Error { .. } => None,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Probe { .. } => "Probe",
            Message::ProbeAck { .. } => "ProbeAck",
            Message::Announce { .. } => "Announce",
            Message::AnnounceAck { .. } => "AnnounceAck",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
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
}
