//! XBee API frame codec
//!
//! Every API frame on the serial link has the same envelope:
//!
//! ```text
//! 0x7E | length (u16, big-endian) | frame data ... | checksum
//! ```
//!
//! The checksum is `0xFF` minus the low byte of the sum of the frame data.
//! In API mode 2 (escaped) any byte after the delimiter equal to `0x7E`,
//! `0x7D`, `0x11` or `0x13` is sent as `0x7D` followed by the byte XOR `0x20`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

use crate::error::{Result, XbeeError};
use crate::frame::{
    Addr16, Addr64, AnalogChannel, AtCommand, CommandStatus, DeliveryStatus, DiscoveryStatus,
    FrameType, InboundFrame, OutboundFrame,
};

/// Start of every API frame
pub const START_DELIMITER: u8 = 0x7E;

/// Escape marker in API mode 2
pub const ESCAPE: u8 = 0x7D;

/// XON flow-control byte
pub const XON: u8 = 0x11;

/// XOFF flow-control byte
pub const XOFF: u8 = 0x13;

/// Value XORed into an escaped byte
const ESCAPE_XOR: u8 = 0x20;

/// Largest frame data length accepted on encode and decode
pub const MAX_FRAME_DATA: usize = 1024;

/// Bytes of a Transmit Request before the payload: type, id, addresses,
/// radius and options
const TRANSMIT_REQUEST_HEADER: usize = 14;

/// Largest application payload a Transmit Request can carry
pub const MAX_TRANSMIT_PAYLOAD: usize = MAX_FRAME_DATA - TRANSMIT_REQUEST_HEADER;

/// Remote command option: apply changes on the remote immediately
const REMOTE_APPLY_CHANGES: u8 = 0x02;

/// Serial API operating mode of the local radio (`AP` parameter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// AP=1, no escaping
    Unescaped,
    /// AP=2, control bytes escaped
    #[default]
    Escaped,
}

/// Stateful encoder/decoder for API frames
///
/// The only state is the rolling frame id used for outbound frames that do
/// not carry one explicitly.
#[derive(Debug, Clone)]
pub struct ApiCodec {
    mode: ApiMode,
    next_frame_id: u8,
}

impl ApiCodec {
    /// Create a codec for the given API mode
    pub fn new(mode: ApiMode) -> Self {
        Self {
            mode,
            next_frame_id: 1,
        }
    }

    /// API mode in use
    pub fn mode(&self) -> ApiMode {
        self.mode
    }

    /// Allocate the next frame id, skipping 0 (which suppresses responses)
    pub fn allocate_frame_id(&mut self) -> u8 {
        let id = self.next_frame_id;
        self.next_frame_id = if id == u8::MAX { 1 } else { id + 1 };
        id
    }

    /// Encode an outbound frame into a complete wire frame
    pub fn encode(&mut self, frame: &OutboundFrame) -> Result<Bytes> {
        let mut data = BytesMut::with_capacity(32);
        data.put_u8(frame.frame_type() as u8);

        match frame {
            OutboundFrame::AtCommand {
                frame_id,
                command,
                parameter,
            } => {
                let id = frame_id.unwrap_or_else(|| self.allocate_frame_id());
                data.put_u8(id);
                data.put_slice(&command.as_bytes());
                if let Some(param) = parameter {
                    data.put_slice(param);
                }
            }
            OutboundFrame::RemoteAtCommand {
                destination64,
                destination16,
                frame_id,
                command,
                parameter,
            } => {
                let id = frame_id.unwrap_or_else(|| self.allocate_frame_id());
                data.put_u8(id);
                data.put_slice(&destination64.to_bytes());
                data.put_slice(&destination16.to_bytes());
                data.put_u8(REMOTE_APPLY_CHANGES);
                data.put_slice(&command.as_bytes());
                if let Some(param) = parameter {
                    data.put_slice(param);
                }
            }
            OutboundFrame::TransmitRequest {
                destination64,
                destination16,
                broadcast_radius,
                options,
                data: payload,
            } => {
                let id = self.allocate_frame_id();
                data.put_u8(id);
                data.put_slice(&destination64.to_bytes());
                data.put_slice(&destination16.to_bytes());
                data.put_u8(*broadcast_radius);
                data.put_u8(*options);
                data.put_slice(payload);
            }
        }

        self.wrap(&data)
    }

    /// Wrap raw frame data in the API envelope
    ///
    /// Fails with [`XbeeError::FrameTooLarge`] when `data` exceeds
    /// [`MAX_FRAME_DATA`].
    pub fn wrap(&self, data: &[u8]) -> Result<Bytes> {
        if data.len() > MAX_FRAME_DATA {
            return Err(XbeeError::FrameTooLarge {
                len: data.len(),
                max: MAX_FRAME_DATA,
            });
        }

        let mut body = Vec::with_capacity(data.len() + 3);
        body.extend_from_slice(&(data.len() as u16).to_be_bytes());
        body.extend_from_slice(data);
        body.push(checksum(data));

        let mut out = BytesMut::with_capacity(body.len() * 2 + 1);
        out.put_u8(START_DELIMITER);
        for byte in body {
            if self.mode == ApiMode::Escaped && needs_escape(byte) {
                out.put_u8(ESCAPE);
                out.put_u8(byte ^ ESCAPE_XOR);
            } else {
                out.put_u8(byte);
            }
        }
        Ok(out.freeze())
    }

    /// Try to decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from the buffer, including those of a rejected frame, so the
    /// caller can log the error and call again.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<InboundFrame>> {
        match buf.iter().position(|&b| b == START_DELIMITER) {
            Some(0) => {}
            Some(pos) => {
                warn!(discarded = pos, "Discarding bytes before start delimiter");
                buf.advance(pos);
            }
            None => {
                if !buf.is_empty() {
                    warn!(discarded = buf.len(), "Discarding buffer without start delimiter");
                    buf.clear();
                }
                return Ok(None);
            }
        }

        // Unescaped bytes following the delimiter: length, data, checksum
        let mut raw = Vec::new();
        let mut needed: Option<usize> = None;
        let mut i = 1;

        while i < buf.len() {
            let mut byte = buf[i];
            if self.mode == ApiMode::Escaped {
                if byte == START_DELIMITER {
                    buf.advance(i);
                    return Err(XbeeError::InvalidFrame(
                        "frame interrupted by start delimiter".to_string(),
                    ));
                }
                if byte == ESCAPE {
                    if i + 1 >= buf.len() {
                        return Ok(None);
                    }
                    i += 1;
                    byte = buf[i] ^ ESCAPE_XOR;
                }
            }
            raw.push(byte);
            i += 1;

            if raw.len() == 2 {
                let length = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if length == 0 || length > MAX_FRAME_DATA {
                    buf.advance(1);
                    return Err(XbeeError::InvalidFrame(format!(
                        "frame length {} out of range",
                        length
                    )));
                }
                needed = Some(length + 3);
            }
            if needed == Some(raw.len()) {
                break;
            }
        }

        let total = match needed {
            Some(total) if raw.len() == total => total,
            _ => {
                trace!(have = raw.len(), "Waiting for complete frame");
                return Ok(None);
            }
        };
        buf.advance(i);

        let data = &raw[2..total - 1];
        let got = raw[total - 1];
        let expected = checksum(data);
        if got != expected {
            return Err(XbeeError::InvalidChecksum { expected, got });
        }

        parse_frame_data(data).map(Some)
    }
}

impl Default for ApiCodec {
    fn default() -> Self {
        Self::new(ApiMode::default())
    }
}

/// Checksum over unescaped frame data
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF - sum
}

fn needs_escape(byte: u8) -> bool {
    matches!(byte, START_DELIMITER | ESCAPE | XON | XOFF)
}

fn ensure(body: &[u8], len: usize, frame: FrameType) -> Result<()> {
    if body.remaining() < len {
        return Err(XbeeError::InvalidFrame(format!(
            "{} truncated: {} bytes, need {}",
            frame.name(),
            body.remaining(),
            len
        )));
    }
    Ok(())
}

fn get_addr64(body: &mut &[u8]) -> Addr64 {
    Addr64(body.get_u64())
}

fn get_addr16(body: &mut &[u8]) -> Addr16 {
    Addr16(body.get_u16())
}

fn get_command(body: &mut &[u8]) -> AtCommand {
    let cmd = [body.get_u8(), body.get_u8()];
    AtCommand::from_bytes(cmd)
}

/// Parse unescaped frame data (type byte first)
pub fn parse_frame_data(data: &[u8]) -> Result<InboundFrame> {
    let (&type_byte, rest) = data
        .split_first()
        .ok_or_else(|| XbeeError::InvalidFrame("empty frame data".to_string()))?;
    let mut body = rest;

    let frame_type = match FrameType::from_u8(type_byte) {
        Some(frame_type) => frame_type,
        None => {
            return Ok(InboundFrame::Unknown {
                frame_type: type_byte,
                data: body.to_vec(),
            })
        }
    };

    let frame = match frame_type {
        FrameType::AtCommandResponse => {
            ensure(body, 4, frame_type)?;
            let frame_id = body.get_u8();
            let command = get_command(&mut body);
            let status = CommandStatus::from(body.get_u8());
            InboundFrame::AtCommandResponse {
                frame_id,
                command,
                status,
                data: body.to_vec(),
            }
        }
        FrameType::TransmitStatus => {
            ensure(body, 6, frame_type)?;
            InboundFrame::TransmitStatus {
                frame_id: body.get_u8(),
                remote16: get_addr16(&mut body),
                retry_count: body.get_u8(),
                delivery_status: DeliveryStatus::from(body.get_u8()),
                discovery_status: DiscoveryStatus::from(body.get_u8()),
            }
        }
        FrameType::ReceivePacket => {
            ensure(body, 11, frame_type)?;
            InboundFrame::ReceivePacket {
                remote64: get_addr64(&mut body),
                remote16: get_addr16(&mut body),
                receive_options: body.get_u8(),
                data: body.to_vec(),
            }
        }
        FrameType::IoDataSample => parse_io_sample(body)?,
        FrameType::RemoteCommandResponse => {
            ensure(body, 14, frame_type)?;
            let frame_id = body.get_u8();
            let remote64 = get_addr64(&mut body);
            let remote16 = get_addr16(&mut body);
            let command = get_command(&mut body);
            let status = CommandStatus::from(body.get_u8());
            InboundFrame::RemoteCommandResponse {
                frame_id,
                remote64,
                remote16,
                command,
                status,
                data: body.to_vec(),
            }
        }
        FrameType::RouteRecord => {
            ensure(body, 12, frame_type)?;
            let remote64 = get_addr64(&mut body);
            let remote16 = get_addr16(&mut body);
            let receive_options = body.get_u8();
            let count = body.get_u8() as usize;
            ensure(body, count * 2, frame_type)?;
            let hops = (0..count).map(|_| get_addr16(&mut body)).collect();
            InboundFrame::RouteRecord {
                remote64,
                remote16,
                receive_options,
                hops,
            }
        }
        // Outbound types echoed back are not expected; keep them for logging.
        FrameType::AtCommand | FrameType::TransmitRequest | FrameType::RemoteAtCommandRequest => {
            InboundFrame::Unknown {
                frame_type: type_byte,
                data: body.to_vec(),
            }
        }
    };

    Ok(frame)
}

fn parse_io_sample(mut body: &[u8]) -> Result<InboundFrame> {
    let frame_type = FrameType::IoDataSample;
    ensure(body, 15, frame_type)?;
    let remote64 = get_addr64(&mut body);
    let remote16 = get_addr16(&mut body);
    let receive_options = body.get_u8();
    let _sample_sets = body.get_u8();
    let digital_mask = body.get_u16();
    let analog_mask = body.get_u8();

    let digital_samples = if digital_mask != 0 {
        ensure(body, 2, frame_type)?;
        Some(body.get_u16())
    } else {
        None
    };

    let mut analog_samples = BTreeMap::new();
    for (channel, bit) in AnalogChannel::MASK_BITS {
        if analog_mask & bit != 0 {
            ensure(body, 2, frame_type)?;
            analog_samples.insert(channel, body.get_u16());
        }
    }

    Ok(InboundFrame::IoDataSample {
        remote64,
        remote16,
        receive_options,
        digital_mask,
        digital_samples,
        analog_samples,
    })
}
