//! XBee/ZigBee protocol engine for a wireless sensor network gateway
//!
//! This crate drives a ZigBee mesh of XBee radio modules through the
//! coordinator attached to the gateway's serial port. It tracks which
//! modules are reachable and how they route, discovers them with Node
//! Discovery broadcasts, sends AT commands and application payloads, and
//! decodes sensor readings reported by the field nodes.
//!
//! # Architecture
//!
//! The engine is built from synchronous components driven by one reactor:
//!
//! 1. **Transport** - [`XbeeTransport`], API frames over serial via [`ApiCodec`]
//! 2. **State** - [`AddressRegistry`] and [`TelemetryStore`]
//! 3. **Protocol** - [`CommandDispatcher`], [`DiscoveryProtocol`], [`FrameEventRouter`]
//! 4. **Reactor** - [`WsnController`] and its cloneable [`WsnHandle`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: wsn-xbee = { version = "0.1", features = ["serial"] }
//!
//! use wsn_xbee::{SerialInterface, WsnConfigBuilder, WsnController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WsnConfigBuilder::new().serial_port("/dev/ttyO2").build();
//!     let transport = SerialInterface::new("/dev/ttyO2");
//!
//!     let (controller, handle) = WsnController::new(transport, &config);
//!     tokio::spawn(controller.run());
//!
//!     handle.discover_all().await?;
//!     println!("{:?}", handle.snapshot().await?);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport and device detection (requires `libudev-dev` on Linux)
//!
//! # Frame Flow
//!
//! ## Inbound
//!
//! 1. The coordinator emits an API frame on the serial link
//! 2. [`ApiCodec`] unescapes it and verifies the checksum
//! 3. Node Discovery answers go to the running [`DiscoveryProtocol`] session
//! 4. [`FrameEventRouter`] updates the registry and telemetry store
//! 5. Subscribers receive a [`NodeSummary`] when something changed
//!
//! ## Outbound
//!
//! 1. A [`WsnHandle`] call reaches the controller
//! 2. [`CommandDispatcher`] resolves addresses and queues the frame
//! 3. The controller opens the transport if needed and writes it
//! 4. Any answer arrives later as an independent status frame

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Wire format
pub mod codec;
pub mod error;
pub mod frame;
pub mod interface;

// Protocol state
pub mod config;
pub mod registry;
pub mod telemetry;

// Protocol engine
pub mod discovery;
pub mod dispatcher;
pub mod router;
pub mod timer;

// Reactor
pub mod controller;

// Testing utilities
pub mod test_utils;

pub use codec::{ApiCodec, ApiMode};
pub use config::{
    DiscoveryConfig, InterfaceConfig, NetworkConfig, NodeEntry, ReconnectConfig,
    TelemetryConfig, WsnConfig, WsnConfigBuilder,
};
pub use error::{Result, XbeeError};
pub use frame::{
    pin_mode, Addr16, Addr64, AnalogChannel, AtCommand, CommandStatus, DeliveryStatus,
    DiscoveryStatus, FrameType, InboundFrame, NodeKey, OutboundFrame,
};
pub use interface::{ConnectionState, XbeeTransport};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use registry::{AddressRegistry, Node, RegistrySnapshot};
pub use telemetry::{Reading, SensorKind, TelemetryRecord, TelemetryStore};

pub use discovery::{DiscoveryOutcome, DiscoveryPhase, DiscoveryProtocol};
pub use dispatcher::{CommandDispatcher, DispatcherStats, FrameSink, Target};
pub use router::{FrameEventRouter, NodeEvent, NodeSummary};
pub use timer::{DeadlineTimer, Timer, TimerId};

pub use controller::{ControllerCommand, ControllerStats, WsnController, WsnHandle};

#[cfg(feature = "serial")]
pub use test_utils::find_xbee_device;
pub use test_utils::{ManualTimer, MockRadio, MockTransport, RecordingSink};

// Protocol constants re-exports
pub use codec::{ESCAPE, MAX_FRAME_DATA, MAX_TRANSMIT_PAYLOAD, START_DELIMITER};
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_DISCOVERY_RETRIES, DEFAULT_DISCOVERY_WINDOW_MS, DEFAULT_TIMEOUT_MS,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(START_DELIMITER, 0x7E);
        assert_eq!(ESCAPE, 0x7D);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(DEFAULT_DISCOVERY_WINDOW_MS, 8000);
        assert_eq!(DEFAULT_DISCOVERY_RETRIES, 1);
    }
}
