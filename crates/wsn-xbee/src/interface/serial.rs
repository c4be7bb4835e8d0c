//! Serial port interface for the coordinator radio
//!
//! This module provides async serial communication with an XBee module
//! running API firmware, using tokio-serial. Framing, escaping and checksums
//! are handled by [`ApiCodec`].

use crate::codec::{ApiCodec, ApiMode};
use crate::config::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use crate::error::{Result, XbeeError};
use crate::frame::{InboundFrame, OutboundFrame};
use crate::interface::{ConnectionState, XbeeTransport};
use async_trait::async_trait;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial interface to an XBee coordinator
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    /// Serial stream (when open)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Accumulates partial frames
    read_buffer: BytesMut,

    /// Frame encoder/decoder
    codec: ApiCodec,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Closed,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
            codec: ApiCodec::default(),
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create with the API mode of the radio firmware
    pub fn with_api_mode(mut self, mode: ApiMode) -> Self {
        self.codec = ApiCodec::new(mode);
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn mark_closed(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Closed;
    }
}

#[async_trait]
impl XbeeTransport for SerialInterface {
    async fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        info!(port = %self.port_path.display(), baud = self.baud_rate, mode = ?self.codec.mode(), "Opening serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Closed;
            return Err(XbeeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Closed;
                XbeeError::TransportOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        // Drop whatever the radio sent while nobody was listening
        if let Err(e) = stream.clear(tokio_serial::ClearBuffer::Input) {
            debug!(error = %e, "Failed to clear serial input buffer");
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Open;
        self.read_buffer.clear();

        info!(port = %self.port_path.display(), "Connected to XBee coordinator");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.flush().await {
                debug!(error = %e, "Flush on close failed");
            }
        }

        self.state = ConnectionState::Closed;
        self.read_buffer.clear();

        info!(port = %self.port_path.display(), "Closed serial port");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.stream.is_some()
    }

    async fn write(&mut self, frame: &OutboundFrame) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(XbeeError::Disconnected)?;

        let bytes = self.codec.encode(frame)?;
        debug!(frame = frame.frame_type().name(), size = bytes.len(), "Writing frame");
        trace!(bytes = %hex::encode(&bytes), "Frame bytes");

        let written = match stream.write_all(&bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!(error = %e, "Serial write error");
            self.mark_closed();
            return Err(XbeeError::TransportWriteFailed(e.to_string()));
        }

        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<InboundFrame>> {
        // Frames already buffered come first
        if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        let stream = self.stream.as_mut().ok_or(XbeeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match stream.read(&mut buf).await {
            Ok(0) => {
                self.mark_closed();
                Err(XbeeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                self.read_buffer.extend_from_slice(&buf[..n]);
                self.codec.decode(&mut self.read_buffer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.mark_closed();
                Err(XbeeError::TransportReadFailed(e.to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("api_mode", &self.codec.mode())
            .field("state", &self.state)
            .field("buffer_len", &self.read_buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_state() {
        let iface = SerialInterface::new("/dev/ttyUSB0");
        assert_eq!(iface.state(), ConnectionState::Closed);
        assert!(!iface.is_open());
    }

    #[test]
    fn test_interface_name() {
        let iface = SerialInterface::new("/dev/ttyO2");
        assert_eq!(iface.name(), "serial:/dev/ttyO2");
    }

    #[tokio::test]
    async fn test_missing_port() {
        let mut iface = SerialInterface::new("/dev/does-not-exist-xbee");
        let err = iface.open().await.unwrap_err();
        assert!(matches!(err, XbeeError::PortNotFound(_)));
        assert_eq!(iface.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_buffered_frames_decode_without_port() {
        let mut iface = SerialInterface::new("/dev/null").with_api_mode(ApiMode::Unescaped);
        // AT response to NJ, status OK
        let data = [0x88, 0x01, b'N', b'J', 0x00];
        let wire = iface.codec.wrap(&data).unwrap();
        iface.read_buffer.extend_from_slice(&wire);

        let frame = iface.next_frame().await.unwrap();
        assert!(matches!(frame, Some(InboundFrame::AtCommandResponse { frame_id: 1, .. })));
        assert!(iface.read_buffer.is_empty());
        assert!(matches!(iface.next_frame().await, Err(XbeeError::Disconnected)));
    }
}
