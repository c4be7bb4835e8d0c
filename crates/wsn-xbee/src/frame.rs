//! Frame catalogue for the XBee ZigBee API
//!
//! Typed addresses, node keys, status codes and the inbound/outbound frame
//! sum types. Byte-level encoding lives in [`crate::codec`].
//!
//! | Code | Direction | Frame |
//! |------|-----------|-------|
//! | 0x08 | out | AT Command Request |
//! | 0x10 | out | ZigBee Transmit Request |
//! | 0x17 | out | Remote AT Command Request |
//! | 0x88 | in  | AT Command Response |
//! | 0x8B | in  | ZigBee Transmit Status |
//! | 0x90 | in  | ZigBee Receive Packet |
//! | 0x92 | in  | ZigBee IO Data Sample Rx Indicator |
//! | 0x97 | in  | Remote AT Command Response |
//! | 0xA1 | in  | Route Record Indicator |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, XbeeError};

// ============================================================================
// Addresses
// ============================================================================

/// 64-bit hardware address of a radio module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr64(pub u64);

impl Addr64 {
    /// Broadcast destination
    pub const BROADCAST: Addr64 = Addr64(0x0000_0000_0000_FFFF);
    /// Address that always targets the coordinator
    pub const COORDINATOR: Addr64 = Addr64(0);

    /// Big-endian bytes as transmitted
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Build from big-endian bytes
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Addr64(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Addr64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Addr64 {
    type Err = XbeeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex::<8>(s)
            .map(|bytes| Addr64(u64::from_be_bytes(bytes)))
            .ok_or_else(|| XbeeError::InvalidAddress(s.to_string()))
    }
}

/// 16-bit network address of a radio module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr16(pub u16);

impl Addr16 {
    /// Address not yet known (also the broadcast 16-bit destination)
    pub const UNKNOWN: Addr16 = Addr16(0xFFFE);
    /// Network address of the coordinator
    pub const COORDINATOR: Addr16 = Addr16(0x0000);

    /// Big-endian bytes as transmitted
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Build from big-endian bytes
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Addr16(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for Addr16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl FromStr for Addr16 {
    type Err = XbeeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex::<2>(s)
            .map(Addr16::from_bytes)
            .ok_or_else(|| XbeeError::InvalidAddress(s.to_string()))
    }
}

/// Decode exactly `N` bytes of hex, big-endian
fn parse_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    let mut bytes = [0u8; N];
    hex::decode_to_slice(s, &mut bytes).ok()?;
    Some(bytes)
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(Addr64);
hex_serde!(Addr16);

// ============================================================================
// Node keys and AT commands
// ============================================================================

/// Stable logical identifier of a configured module (e.g. `xb1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Create a key
    pub fn new(key: impl Into<String>) -> Self {
        NodeKey(key.into())
    }

    /// Borrow the key text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        NodeKey::new(s)
    }
}

/// Two-character AT command, always upper case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtCommand([u8; 2]);

impl AtCommand {
    /// Node Discovery
    pub const ND: AtCommand = AtCommand(*b"ND");
    /// Digital IO 4 configuration (the actuator output on field nodes)
    pub const D4: AtCommand = AtCommand(*b"D4");

    /// Parse a command, upper-casing it
    pub fn new(cmd: &str) -> Result<Self> {
        let bytes = cmd.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(XbeeError::InvalidAtCommand(cmd.to_string()));
        }
        Ok(AtCommand([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
        ]))
    }

    /// Build from the two bytes of a received frame
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        AtCommand([bytes[0].to_ascii_uppercase(), bytes[1].to_ascii_uppercase()])
    }

    /// Raw command bytes
    pub fn as_bytes(&self) -> [u8; 2] {
        self.0
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
    }
}

impl FromStr for AtCommand {
    type Err = XbeeError;

    fn from_str(s: &str) -> Result<Self> {
        AtCommand::new(s)
    }
}

/// Parameter values for the `Dn` pin configuration commands
pub mod pin_mode {
    /// Digital output, driven low
    pub const DIGITAL_OUTPUT_LOW: u8 = 0x04;
    /// Digital output, driven high
    pub const DIGITAL_OUTPUT_HIGH: u8 = 0x05;
}

// ============================================================================
// Status codes
// ============================================================================

/// Frame type byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// AT Command Request
    AtCommand = 0x08,
    /// ZigBee Transmit Request
    TransmitRequest = 0x10,
    /// Remote AT Command Request
    RemoteAtCommandRequest = 0x17,
    /// AT Command Response
    AtCommandResponse = 0x88,
    /// ZigBee Transmit Status
    TransmitStatus = 0x8B,
    /// ZigBee Receive Packet
    ReceivePacket = 0x90,
    /// ZigBee IO Data Sample Rx Indicator
    IoDataSample = 0x92,
    /// Remote AT Command Response
    RemoteCommandResponse = 0x97,
    /// Route Record Indicator
    RouteRecord = 0xA1,
}

impl FrameType {
    /// Map a type byte to a known frame type
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x08 => Self::AtCommand,
            0x10 => Self::TransmitRequest,
            0x17 => Self::RemoteAtCommandRequest,
            0x88 => Self::AtCommandResponse,
            0x8B => Self::TransmitStatus,
            0x90 => Self::ReceivePacket,
            0x92 => Self::IoDataSample,
            0x97 => Self::RemoteCommandResponse,
            0xA1 => Self::RouteRecord,
            _ => return None,
        })
    }

    /// Human readable frame name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AtCommand => "AT Command",
            Self::TransmitRequest => "ZigBee Transmit Request",
            Self::RemoteAtCommandRequest => "Remote Command Request",
            Self::AtCommandResponse => "AT Command Response",
            Self::TransmitStatus => "ZigBee Transmit Status",
            Self::ReceivePacket => "ZigBee Receive Packet (AO=0)",
            Self::IoDataSample => "ZigBee IO Data Sample Rx Indicator",
            Self::RemoteCommandResponse => "Remote Command Response",
            Self::RouteRecord => "Route Record Indicator",
        }
    }
}

/// Status of an AT command, local or remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// OK
    Ok,
    /// ERROR
    Error,
    /// Invalid command
    InvalidCommand,
    /// Invalid parameter
    InvalidParameter,
    /// Remote command transmission failed
    RemoteTransmissionFailure,
    /// Code not in the catalogue
    Other(u8),
}

impl From<u8> for CommandStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Error,
            0x02 => Self::InvalidCommand,
            0x03 => Self::InvalidParameter,
            0x04 => Self::RemoteTransmissionFailure,
            other => Self::Other(other),
        }
    }
}

impl From<CommandStatus> for u8 {
    fn from(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Ok => 0x00,
            CommandStatus::Error => 0x01,
            CommandStatus::InvalidCommand => 0x02,
            CommandStatus::InvalidParameter => 0x03,
            CommandStatus::RemoteTransmissionFailure => 0x04,
            CommandStatus::Other(code) => code,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK (0x00)"),
            Self::Error => write!(f, "ERROR (0x01)"),
            Self::InvalidCommand => write!(f, "Invalid Command (0x02)"),
            Self::InvalidParameter => write!(f, "Invalid Parameter (0x03)"),
            Self::RemoteTransmissionFailure => {
                write!(f, "Remote Command Transmission Failed (0x04)")
            }
            Self::Other(code) => write!(f, "Unknown (0x{code:02X})"),
        }
    }
}

/// Delivery outcome reported by a transmit status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered
    Success,
    /// MAC ACK failure
    MacAckFailure,
    /// Clear channel assessment failure
    CcaFailure,
    /// Invalid destination endpoint
    InvalidDestination,
    /// Network ACK failure, the destination did not acknowledge
    NetworkAckFailure,
    /// Not joined to a network
    NotJoined,
    /// Self-addressed
    SelfAddressed,
    /// Address not found
    AddressNotFound,
    /// Route not found
    RouteNotFound,
    /// Payload too large
    PayloadTooLarge,
    /// Code not in the catalogue
    Other(u8),
}

impl From<u8> for DeliveryStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::MacAckFailure,
            0x02 => Self::CcaFailure,
            0x15 => Self::InvalidDestination,
            0x21 => Self::NetworkAckFailure,
            0x22 => Self::NotJoined,
            0x23 => Self::SelfAddressed,
            0x24 => Self::AddressNotFound,
            0x25 => Self::RouteNotFound,
            0x74 => Self::PayloadTooLarge,
            other => Self::Other(other),
        }
    }
}

impl From<DeliveryStatus> for u8 {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Success => 0x00,
            DeliveryStatus::MacAckFailure => 0x01,
            DeliveryStatus::CcaFailure => 0x02,
            DeliveryStatus::InvalidDestination => 0x15,
            DeliveryStatus::NetworkAckFailure => 0x21,
            DeliveryStatus::NotJoined => 0x22,
            DeliveryStatus::SelfAddressed => 0x23,
            DeliveryStatus::AddressNotFound => 0x24,
            DeliveryStatus::RouteNotFound => 0x25,
            DeliveryStatus::PayloadTooLarge => 0x74,
            DeliveryStatus::Other(code) => code,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::MacAckFailure => "MAC ACK Failure",
            Self::CcaFailure => "CCA Failure",
            Self::InvalidDestination => "Invalid destination endpoint",
            Self::NetworkAckFailure => "Network ACK Failure",
            Self::NotJoined => "Not Joined to Network",
            Self::SelfAddressed => "Self-addressed",
            Self::AddressNotFound => "Address Not Found",
            Self::RouteNotFound => "Route Not Found",
            Self::PayloadTooLarge => "Payload too large",
            Self::Other(_) => "Unknown",
        };
        write!(f, "{} (0x{:02X})", name, u8::from(*self))
    }
}

/// Discovery overhead reported by a transmit status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    /// No discovery overhead
    NoOverhead,
    /// Address discovery
    AddressDiscovery,
    /// Route discovery
    RouteDiscovery,
    /// Address and route discovery
    AddressAndRoute,
    /// Extended timeout discovery
    ExtendedTimeout,
    /// Code not in the catalogue
    Other(u8),
}

impl From<u8> for DiscoveryStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::NoOverhead,
            0x01 => Self::AddressDiscovery,
            0x02 => Self::RouteDiscovery,
            0x03 => Self::AddressAndRoute,
            0x40 => Self::ExtendedTimeout,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOverhead => write!(f, "No Discovery Overhead (0x00)"),
            Self::AddressDiscovery => write!(f, "Address Discovery (0x01)"),
            Self::RouteDiscovery => write!(f, "Route Discovery (0x02)"),
            Self::AddressAndRoute => write!(f, "Address and Route (0x03)"),
            Self::ExtendedTimeout => write!(f, "Extended Timeout Discovery (0x40)"),
            Self::Other(code) => write!(f, "Unknown (0x{code:02X})"),
        }
    }
}

// ============================================================================
// IO samples
// ============================================================================

/// Analog input channel of an IO sample, in mask bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnalogChannel {
    /// AD0
    Ad0,
    /// AD1
    Ad1,
    /// AD2
    Ad2,
    /// AD3
    Ad3,
    /// Supply voltage (mask bit 7)
    SupplyVoltage,
}

impl AnalogChannel {
    /// Channels paired with their bit in the analog channel mask
    pub const MASK_BITS: [(AnalogChannel, u8); 5] = [
        (AnalogChannel::Ad0, 0x01),
        (AnalogChannel::Ad1, 0x02),
        (AnalogChannel::Ad2, 0x04),
        (AnalogChannel::Ad3, 0x08),
        (AnalogChannel::SupplyVoltage, 0x80),
    ];
}

// ============================================================================
// Frames
// ============================================================================

/// Frame written to the local radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// 0x08: command executed by the coordinator itself
    AtCommand {
        /// Frame id, allocated by the codec when `None`
        frame_id: Option<u8>,
        /// Command
        command: AtCommand,
        /// Parameter, omitted from the frame when `None`
        parameter: Option<Vec<u8>>,
    },
    /// 0x17: command forwarded to a remote module
    RemoteAtCommand {
        /// Destination 64-bit address
        destination64: Addr64,
        /// Destination 16-bit address
        destination16: Addr16,
        /// Frame id, allocated by the codec when `None`
        frame_id: Option<u8>,
        /// Command
        command: AtCommand,
        /// Parameter, omitted from the frame when `None`
        parameter: Option<Vec<u8>>,
    },
    /// 0x10: application payload for a remote module
    TransmitRequest {
        /// Destination 64-bit address
        destination64: Addr64,
        /// Destination 16-bit address
        destination16: Addr16,
        /// Maximum hops, 0 = network maximum
        broadcast_radius: u8,
        /// Transmit options
        options: u8,
        /// Payload
        data: Vec<u8>,
    },
}

impl OutboundFrame {
    /// Frame type byte of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            OutboundFrame::AtCommand { .. } => FrameType::AtCommand,
            OutboundFrame::RemoteAtCommand { .. } => FrameType::RemoteAtCommandRequest,
            OutboundFrame::TransmitRequest { .. } => FrameType::TransmitRequest,
        }
    }
}

/// Frame received from the local radio
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// 0x88
    AtCommandResponse {
        /// Frame id of the request
        frame_id: u8,
        /// Command
        command: AtCommand,
        /// Outcome
        status: CommandStatus,
        /// Returned data, possibly empty
        data: Vec<u8>,
    },
    /// 0x8B
    TransmitStatus {
        /// Frame id of the request
        frame_id: u8,
        /// 16-bit address the packet was delivered to
        remote16: Addr16,
        /// Number of application retries
        retry_count: u8,
        /// Delivery outcome
        delivery_status: DeliveryStatus,
        /// Discovery overhead
        discovery_status: DiscoveryStatus,
    },
    /// 0x90
    ReceivePacket {
        /// Sender 64-bit address
        remote64: Addr64,
        /// Sender 16-bit address
        remote16: Addr16,
        /// Receive options
        receive_options: u8,
        /// Payload
        data: Vec<u8>,
    },
    /// 0x92
    IoDataSample {
        /// Sender 64-bit address
        remote64: Addr64,
        /// Sender 16-bit address
        remote16: Addr16,
        /// Receive options
        receive_options: u8,
        /// Digital channel mask
        digital_mask: u16,
        /// Digital sample word, present when the mask is non-zero
        digital_samples: Option<u16>,
        /// Raw analog readings
        analog_samples: BTreeMap<AnalogChannel, u16>,
    },
    /// 0x97
    RemoteCommandResponse {
        /// Frame id of the request
        frame_id: u8,
        /// Responder 64-bit address
        remote64: Addr64,
        /// Responder 16-bit address
        remote16: Addr16,
        /// Command
        command: AtCommand,
        /// Outcome
        status: CommandStatus,
        /// Returned data, possibly empty
        data: Vec<u8>,
    },
    /// 0xA1
    RouteRecord {
        /// Source 64-bit address
        remote64: Addr64,
        /// Source 16-bit address
        remote16: Addr16,
        /// Receive options
        receive_options: u8,
        /// Relay addresses, closest to the source first
        hops: Vec<Addr16>,
    },
    /// Any other frame type, kept for logging
    Unknown {
        /// Type byte
        frame_type: u8,
        /// Frame data after the type byte
        data: Vec<u8>,
    },
}

impl InboundFrame {
    /// Type byte of this frame
    pub fn type_code(&self) -> u8 {
        match self {
            InboundFrame::AtCommandResponse { .. } => FrameType::AtCommandResponse as u8,
            InboundFrame::TransmitStatus { .. } => FrameType::TransmitStatus as u8,
            InboundFrame::ReceivePacket { .. } => FrameType::ReceivePacket as u8,
            InboundFrame::IoDataSample { .. } => FrameType::IoDataSample as u8,
            InboundFrame::RemoteCommandResponse { .. } => FrameType::RemoteCommandResponse as u8,
            InboundFrame::RouteRecord { .. } => FrameType::RouteRecord as u8,
            InboundFrame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    /// Responder and its network address when this is a successful Node
    /// Discovery answer
    pub fn node_discovery_response(&self) -> Option<(Addr64, Addr16)> {
        match self {
            InboundFrame::RemoteCommandResponse {
                remote64,
                remote16,
                command,
                status: CommandStatus::Ok,
                ..
            } if *command == AtCommand::ND => Some((*remote64, *remote16)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr: Addr64 = "0013A20040AFB72D".parse().unwrap();
        assert_eq!(addr.to_string(), "0013a20040afb72d");
        assert_eq!(Addr64::BROADCAST.to_string(), "000000000000ffff");
        assert_eq!(Addr16::UNKNOWN.to_string(), "fffe");
        assert_eq!("0000".parse::<Addr16>().unwrap(), Addr16::COORDINATOR);
    }

    #[test]
    fn test_address_rejects_wrong_width() {
        assert!("fffe0".parse::<Addr16>().is_err());
        assert!("xyzw".parse::<Addr16>().is_err());
        assert!("13a20040afb72d".parse::<Addr64>().is_err());
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let json = serde_json::to_string(&Addr16(0x1a2b)).unwrap();
        assert_eq!(json, "\"1a2b\"");
        let back: Addr64 = serde_json::from_str("\"0013a20040b32d72\"").unwrap();
        assert_eq!(back, Addr64(0x0013_A200_40B3_2D72));
    }

    #[test]
    fn test_at_command_upper_cases() {
        assert_eq!(AtCommand::new("nd").unwrap(), AtCommand::ND);
        assert_eq!(AtCommand::new("d4").unwrap().to_string(), "D4");
        assert!(AtCommand::new("NDX").is_err());
        assert!(AtCommand::new("").is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DeliveryStatus::from(0x21), DeliveryStatus::NetworkAckFailure);
        assert_eq!(u8::from(DeliveryStatus::Other(0x99)), 0x99);
        assert_eq!(CommandStatus::from(0x04), CommandStatus::RemoteTransmissionFailure);
        assert_eq!(
            DeliveryStatus::NetworkAckFailure.to_string(),
            "Network ACK Failure (0x21)"
        );
    }

    #[test]
    fn test_frame_type_lookup() {
        assert_eq!(FrameType::from_u8(0xA1), Some(FrameType::RouteRecord));
        assert_eq!(FrameType::from_u8(0x95), None);
    }

    #[test]
    fn test_node_discovery_response_detection() {
        let frame = InboundFrame::RemoteCommandResponse {
            frame_id: 1,
            remote64: Addr64(0x0013_A200_40B3_2D72),
            remote16: Addr16(0x1234),
            command: AtCommand::ND,
            status: CommandStatus::Ok,
            data: vec![],
        };
        assert_eq!(
            frame.node_discovery_response(),
            Some((Addr64(0x0013_A200_40B3_2D72), Addr16(0x1234)))
        );

        let failed = InboundFrame::RemoteCommandResponse {
            frame_id: 1,
            remote64: Addr64(0x0013_A200_40B3_2D72),
            remote16: Addr16(0x1234),
            command: AtCommand::ND,
            status: CommandStatus::RemoteTransmissionFailure,
            data: vec![],
        };
        assert_eq!(failed.node_discovery_response(), None);
    }
}
