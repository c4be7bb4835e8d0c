//! Transport to the coordinator radio
//!
//! - [`serial::SerialInterface`] - Serial port in API mode (requires `serial` feature)
//! - [`crate::test_utils::MockTransport`] - In-memory radio for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use crate::frame::{InboundFrame, OutboundFrame};
use async_trait::async_trait;

/// Link to the local (coordinator) radio
///
/// Implementations own the wire format: callers hand over typed frames and
/// receive decoded ones.
#[async_trait]
pub trait XbeeTransport: Send {
    /// Open the link; opening an open link does nothing
    async fn open(&mut self) -> Result<()>;

    /// Close the link
    async fn close(&mut self) -> Result<()>;

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Encode and write one frame
    async fn write(&mut self, frame: &OutboundFrame) -> Result<()>;

    /// Wait for the next decoded frame
    ///
    /// Returns `None` if no complete frame is available yet.
    /// Returns `Err` on link errors or frames that fail to decode.
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>>;

    /// Transport name (for logging)
    fn name(&self) -> &str;
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not open
    Closed,
    /// Open in progress
    Opening,
    /// Ready for reads and writes
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
