//! Test utilities for running the gateway with and without hardware
//!
//! This module provides device detection for a coordinator attached over USB,
//! plus in-memory stand-ins for the radio, the outbound queue and the timer
//! so the protocol can be exercised deterministically.
//!
//! # Example
//!
//! ```rust,ignore
//! use wsn_xbee::test_utils::MockTransport;
//!
//! let (transport, mut radio) = MockTransport::new();
//! let (controller, handle) = WsnController::new(transport, &config);
//! tokio::spawn(controller.run());
//!
//! let frame = radio.next_outbound().await.unwrap();
//! radio.deliver(response_for(frame));
//! ```

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
#[cfg(feature = "serial")]
use tracing::{debug, info};

use crate::dispatcher::FrameSink;
use crate::error::{Result, XbeeError};
use crate::frame::{InboundFrame, OutboundFrame};
use crate::interface::XbeeTransport;
use crate::timer::{Timer, TimerId};

/// Common serial port paths for XBee explorer boards and UART capes
#[cfg(feature = "serial")]
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux USB adapters
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyACM0",
    "/dev/serial/by-id/usb-FTDI_FT231X_USB_UART*",
    // BeagleBone UART2
    "/dev/ttyO2",
    // macOS
    "/dev/tty.usbserial-*",
    "/dev/cu.usbserial-*",
];

/// USB vendors used by XBee explorer boards (FTDI, Silicon Labs)
#[cfg(feature = "serial")]
const KNOWN_VIDS: [u16; 2] = [0x0403, 0x10C4];

/// Find a connected XBee coordinator by scanning serial ports
///
/// Returns the path to the first likely device, or None if no device is found.
#[cfg(feature = "serial")]
pub fn find_xbee_device() -> Option<String> {
    if let Ok(ports) = serialport::available_ports() {
        for port in ports {
            if is_likely_xbee_port(&port) {
                info!("Found likely XBee device: {}", port.port_name);
                return Some(port.port_name);
            }
        }
    }

    for pattern in COMMON_DEVICE_PATHS {
        if let Ok(entries) = glob::glob(pattern) {
            for entry in entries.flatten() {
                if entry.exists() {
                    let path = entry.to_string_lossy().to_string();
                    debug!("Found serial port: {}", path);
                    return Some(path);
                }
            }
        }
    }

    None
}

#[cfg(feature = "serial")]
fn is_likely_xbee_port(port: &serialport::SerialPortInfo) -> bool {
    use serialport::SerialPortType;

    match &port.port_type {
        SerialPortType::UsbPort(usb_info) => {
            if KNOWN_VIDS.contains(&usb_info.vid) {
                debug!(
                    "USB device matches known vendor: VID={:#06X} PID={:#06X}",
                    usb_info.vid, usb_info.pid
                );
                return true;
            }
            usb_info
                .product
                .as_deref()
                .map(|p| {
                    let p = p.to_lowercase();
                    p.contains("xbee") || p.contains("ft231x") || p.contains("cp210")
                })
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// In-memory coordinator for tests
///
/// Inbound frames are fed through the paired [`MockRadio`]; frames written
/// by the code under test show up there too.
#[derive(Debug)]
pub struct MockTransport {
    open: bool,
    inbound_rx: mpsc::UnboundedReceiver<Result<InboundFrame>>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    failing_opens: u32,
    fail_writes: bool,
    opens: u32,
}

/// Test side of a [`MockTransport`]
#[derive(Debug)]
pub struct MockRadio {
    inbound_tx: mpsc::UnboundedSender<Result<InboundFrame>>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl MockTransport {
    /// Create a closed transport and its radio
    pub fn new() -> (Self, MockRadio) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                open: false,
                inbound_rx,
                outbound_tx,
                failing_opens: 0,
                fail_writes: false,
                opens: 0,
            },
            MockRadio {
                inbound_tx,
                outbound_rx,
            },
        )
    }

    /// Make the next `n` open attempts fail
    pub fn fail_opens(mut self, n: u32) -> Self {
        self.failing_opens = n;
        self
    }

    /// Make every write fail
    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Number of successful opens
    pub fn opens(&self) -> u32 {
        self.opens
    }
}

#[async_trait::async_trait]
impl XbeeTransport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(XbeeError::TransportOpenFailed {
                port: "mock".to_string(),
                reason: "Simulated error".to_string(),
            });
        }
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, frame: &OutboundFrame) -> Result<()> {
        if !self.open {
            return Err(XbeeError::Disconnected);
        }
        if self.fail_writes {
            return Err(XbeeError::TransportWriteFailed("Simulated error".to_string()));
        }
        // The radio half may be gone; writes still succeed
        let _ = self.outbound_tx.send(frame.clone());
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<InboundFrame>> {
        if !self.open {
            return Err(XbeeError::Disconnected);
        }
        match self.inbound_rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                if e.is_retriable() {
                    self.open = false;
                }
                Err(e)
            }
            // Radio dropped: the link stays silent
            None => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl MockRadio {
    /// Deliver a frame as if received from the network
    pub fn deliver(&self, frame: InboundFrame) {
        let _ = self.inbound_tx.send(Ok(frame));
    }

    /// Make the next read fail
    pub fn inject_error(&self, error: XbeeError) {
        let _ = self.inbound_tx.send(Err(error));
    }

    /// Wait for the next frame written to the radio
    pub async fn next_outbound(&mut self) -> Option<OutboundFrame> {
        self.outbound_rx.recv().await
    }

    /// Frames written so far, without waiting
    pub fn drain_outbound(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Frame sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Vec<OutboundFrame>,
}

impl RecordingSink {
    /// Frames submitted so far
    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.frames.clone()
    }
}

impl FrameSink for RecordingSink {
    fn submit(&mut self, frame: OutboundFrame) -> Result<()> {
        self.frames.push(frame);
        Ok(())
    }
}

/// Timer that only fires when told to
#[derive(Debug, Default)]
pub struct ManualTimer {
    next_id: u64,
    scheduled: Vec<(TimerId, Duration)>,
    cancelled: BTreeSet<TimerId>,
    fired: BTreeSet<TimerId>,
}

impl ManualTimer {
    /// Durations of every schedule call, in order
    pub fn scheduled(&self) -> Vec<Duration> {
        self.scheduled.iter().map(|(_, d)| *d).collect()
    }

    /// Most recently scheduled timer
    pub fn last_scheduled(&self) -> Option<TimerId> {
        self.scheduled.last().map(|(id, _)| *id)
    }

    /// Mark a timer as fired; the caller then delivers the expiry
    pub fn fire(&mut self, id: TimerId) {
        self.fired.insert(id);
    }

    /// Whether `id` was cancelled before it fired
    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.cancelled.contains(&id)
    }

    /// Timers neither fired nor cancelled
    pub fn pending(&self) -> Vec<TimerId> {
        self.scheduled
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !self.cancelled.contains(id) && !self.fired.contains(id))
            .collect()
    }
}

impl Timer for ManualTimer {
    fn schedule_once(&mut self, after: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.scheduled.push((id, after));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if !self.fired.contains(&id) {
            self.cancelled.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Addr16, Addr64, AtCommand, CommandStatus};

    #[tokio::test]
    async fn test_mock_transport_open_close() {
        let (mut mock, _radio) = MockTransport::new();
        assert!(!mock.is_open());

        mock.open().await.unwrap();
        mock.open().await.unwrap();
        assert!(mock.is_open());
        assert_eq!(mock.opens(), 1);

        mock.close().await.unwrap();
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_mock_transport_read_write() {
        let (mock, mut radio) = MockTransport::new();
        let mut mock = mock;
        mock.open().await.unwrap();

        let frame = OutboundFrame::AtCommand {
            frame_id: Some(1),
            command: AtCommand::new("NJ").unwrap(),
            parameter: None,
        };
        mock.write(&frame).await.unwrap();
        assert_eq!(radio.drain_outbound(), vec![frame]);

        let response = InboundFrame::RemoteCommandResponse {
            frame_id: 1,
            remote64: Addr64(0x0013_A200_40B3_2D72),
            remote16: Addr16(0x1A2B),
            command: AtCommand::ND,
            status: CommandStatus::Ok,
            data: Vec::new(),
        };
        radio.deliver(response.clone());
        assert_eq!(mock.next_frame().await.unwrap(), Some(response));
    }

    #[tokio::test]
    async fn test_mock_transport_simulated_errors() {
        let (mock, radio) = MockTransport::new();
        let mut mock = mock.fail_opens(1).fail_writes();

        assert!(mock.open().await.is_err());
        mock.open().await.unwrap();

        let frame = OutboundFrame::AtCommand {
            frame_id: None,
            command: AtCommand::ND,
            parameter: None,
        };
        assert!(mock.write(&frame).await.is_err());

        radio.inject_error(XbeeError::Disconnected);
        assert!(mock.next_frame().await.is_err());
        assert!(!mock.is_open());
    }

    #[test]
    fn test_manual_timer() {
        let mut timer = ManualTimer::default();
        let a = timer.schedule_once(Duration::from_secs(8));
        let b = timer.schedule_once(Duration::from_secs(8));
        timer.fire(a);
        timer.cancel(a);
        timer.cancel(b);
        timer.cancel(b);

        assert!(!timer.is_cancelled(a));
        assert!(timer.is_cancelled(b));
        assert!(timer.pending().is_empty());
    }
}
