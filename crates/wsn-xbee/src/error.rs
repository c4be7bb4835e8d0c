//! Error types for XBee gateway operations
//!
//! This module provides error handling for the protocol engine: serial
//! transport failures, API frame decoding, node lookups and the discovery
//! protocol.

use crate::frame::NodeKey;
use thiserror::Error;

/// Main error type for XBee gateway operations
#[derive(Error, Debug)]
pub enum XbeeError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Transport could not be opened
    #[error("Failed to open transport {port}: {reason}")]
    TransportOpenFailed {
        /// Port path or transport name
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Transport write failed
    #[error("Transport write failed: {0}")]
    TransportWriteFailed(String),

    /// Transport read failed
    #[error("Transport read failed: {0}")]
    TransportReadFailed(String),

    /// Transport is not open
    #[error("Transport disconnected")]
    Disconnected,

    // ===== Protocol Errors =====
    /// Checksum mismatch on an inbound API frame
    #[error("Invalid API frame checksum: expected 0x{expected:02X}, got 0x{got:02X}")]
    InvalidChecksum {
        /// Checksum computed over the frame data
        expected: u8,
        /// Checksum byte received
        got: u8,
    },

    /// Malformed API frame
    #[error("Invalid API frame: {0}")]
    InvalidFrame(String),

    /// Address string that is not fixed-width hex
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Outbound frame data larger than an API frame can carry
    #[error("Frame data too large: {len} bytes, limit {max}")]
    FrameTooLarge {
        /// Frame data length requested
        len: usize,
        /// Largest accepted length
        max: usize,
    },

    /// AT command that is not two ASCII characters
    #[error("Invalid AT command: {0:?}")]
    InvalidAtCommand(String),

    // ===== Node Errors =====
    /// Lookup of a node key that was never configured
    #[error("Unknown node key: {0}")]
    InvalidKey(NodeKey),

    // ===== Discovery Errors =====
    /// A discovery session is already running
    #[error("Node discovery already in progress")]
    DiscoveryInProgress,

    /// Retries exhausted before every target responded
    #[error("Node discovery exhausted, undiscovered nodes: {}", format_keys(.undiscovered))]
    DiscoveryExhausted {
        /// Keys that never answered
        undiscovered: Vec<NodeKey>,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Controller channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_keys(keys: &[NodeKey]) -> String {
    keys.iter()
        .map(NodeKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl XbeeError {
    /// Check if this error is recoverable by reopening the transport
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            XbeeError::Disconnected
                | XbeeError::TransportReadFailed(_)
                | XbeeError::TransportWriteFailed(_)
                | XbeeError::TransportOpenFailed { .. }
        )
    }

    /// Check if this is a protocol error (bad data from the radio)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            XbeeError::InvalidChecksum { .. } | XbeeError::InvalidFrame(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            XbeeError::PortNotFound(_) => "PORT_NOT_FOUND",
            XbeeError::TransportOpenFailed { .. } => "TRANSPORT_OPEN_FAILED",
            XbeeError::TransportWriteFailed(_) => "TRANSPORT_WRITE_FAILED",
            XbeeError::TransportReadFailed(_) => "TRANSPORT_READ_FAILED",
            XbeeError::Disconnected => "DISCONNECTED",
            XbeeError::InvalidChecksum { .. } => "INVALID_CHECKSUM",
            XbeeError::InvalidFrame(_) => "INVALID_FRAME",
            XbeeError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            XbeeError::InvalidAddress(_) => "INVALID_ADDRESS",
            XbeeError::InvalidAtCommand(_) => "INVALID_AT_COMMAND",
            XbeeError::InvalidKey(_) => "INVALID_KEY",
            XbeeError::DiscoveryInProgress => "DISCOVERY_IN_PROGRESS",
            XbeeError::DiscoveryExhausted { .. } => "DISCOVERY_EXHAUSTED",
            XbeeError::InvalidConfig(_) => "INVALID_CONFIG",
            XbeeError::ChannelClosed => "CHANNEL_CLOSED",
            XbeeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for XBee operations
pub type Result<T> = std::result::Result<T, XbeeError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for XbeeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        XbeeError::ChannelClosed
    }
}
