//! WolfElect Error Types

use thiserror::Error;

use crate::state::NodeId;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unknown node identifier: {0}")]
    UnknownNode(NodeId),

    // Protocol errors
    #[error("Protocol serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message checksum mismatch")]
    ChecksumMismatch,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    #[error("Malformed query: {0}")]
    MalformedQuery(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error proves the peer is not accepting connections.
    ///
    /// The coordination channel is connection oriented, so a refused
    /// connection is enough to consider the peer gone.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::ConnectionFailed { .. })
    }
}
