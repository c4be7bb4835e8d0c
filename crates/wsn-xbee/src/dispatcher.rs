//! Outbound command framing
//!
//! [`CommandDispatcher`] turns the three kinds of requests the gateway makes
//! (local AT command, remote AT command, application data) into
//! [`OutboundFrame`]s and hands them to a non-blocking [`FrameSink`].
//! Sends are fire-and-forget: any answer from the radio arrives later as an
//! independent status frame.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::codec::MAX_TRANSMIT_PAYLOAD;
use crate::error::{Result, XbeeError};
use crate::frame::{Addr16, Addr64, AtCommand, NodeKey, OutboundFrame};
use crate::registry::AddressRegistry;

/// Non-blocking destination for outbound frames
pub trait FrameSink {
    /// Queue a frame for transmission
    fn submit(&mut self, frame: OutboundFrame) -> Result<()>;
}

impl FrameSink for mpsc::UnboundedSender<OutboundFrame> {
    fn submit(&mut self, frame: OutboundFrame) -> Result<()> {
        self.send(frame)?;
        Ok(())
    }
}

/// Destination of a remote AT command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A configured node
    Node(NodeKey),
    /// Every module in the network
    Broadcast,
}

impl Target {
    /// Parse a target name; `broadcast` selects every module
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("broadcast") {
            Target::Broadcast
        } else {
            Target::Node(NodeKey::new(name))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(key) => write!(f, "{}", key),
            Target::Broadcast => write!(f, "broadcast"),
        }
    }
}

impl From<NodeKey> for Target {
    fn from(key: NodeKey) -> Self {
        Target::Node(key)
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Frames handed to the sink
    pub queued: u64,
    /// Frames lost because the sink was closed
    pub dropped: u64,
}

/// Builds and queues outbound frames
#[derive(Debug)]
pub struct CommandDispatcher<S: FrameSink> {
    sink: S,
    stats: DispatcherStats,
}

impl<S: FrameSink> CommandDispatcher<S> {
    /// Create a dispatcher writing into `sink`
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            stats: DispatcherStats::default(),
        }
    }

    /// Counters since creation
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// Access the sink (used by tests to inspect queued frames)
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// AT Command Request (0x08) executed by the coordinator
    pub fn send_local_at_command(
        &mut self,
        frame_id: Option<u8>,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) {
        let parameter = normalize_parameter(parameter);
        debug!(%command, parameter = ?parameter.as_deref().map(hex::encode), "Local AT command");
        self.submit(OutboundFrame::AtCommand {
            frame_id,
            command,
            parameter,
        });
    }

    /// Remote AT Command Request (0x17)
    ///
    /// Fails only when the target key is not configured.
    pub fn send_remote_at_command(
        &mut self,
        registry: &AddressRegistry,
        target: &Target,
        frame_id: Option<u8>,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) -> Result<()> {
        let (destination64, destination16) = match target {
            Target::Broadcast => (Addr64::BROADCAST, Addr16::UNKNOWN),
            Target::Node(key) => registry.addresses(key)?,
        };
        let parameter = normalize_parameter(parameter);
        debug!(
            %target,
            %command,
            addr64 = %destination64,
            addr16 = %destination16,
            parameter = ?parameter.as_deref().map(hex::encode),
            "Remote AT command"
        );
        self.submit(OutboundFrame::RemoteAtCommand {
            destination64,
            destination16,
            frame_id,
            command,
            parameter,
        });
        Ok(())
    }

    /// ZigBee Transmit Request (0x10) carrying an application payload
    ///
    /// Payloads longer than [`MAX_TRANSMIT_PAYLOAD`] fail with
    /// `FrameTooLarge` and nothing is queued.
    pub fn send_data(
        &mut self,
        registry: &AddressRegistry,
        key: &NodeKey,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let (destination64, destination16) = registry.addresses(key)?;
        let data = payload.into();
        if data.len() > MAX_TRANSMIT_PAYLOAD {
            return Err(XbeeError::FrameTooLarge {
                len: data.len(),
                max: MAX_TRANSMIT_PAYLOAD,
            });
        }
        debug!(%key, size = data.len(), "ZigBee transmit request");
        self.submit(OutboundFrame::TransmitRequest {
            destination64,
            destination16,
            broadcast_radius: 0,
            options: 0,
            data,
        });
        Ok(())
    }

    /// Broadcast a Node Discovery request
    pub fn broadcast_node_discovery(&mut self) {
        self.submit(OutboundFrame::RemoteAtCommand {
            destination64: Addr64::BROADCAST,
            destination16: Addr16::UNKNOWN,
            frame_id: None,
            command: AtCommand::ND,
            parameter: None,
        });
    }

    fn submit(&mut self, frame: OutboundFrame) {
        let frame_type = frame.frame_type();
        match self.sink.submit(frame) {
            Ok(()) => self.stats.queued += 1,
            Err(e) => {
                self.stats.dropped += 1;
                error!(frame = frame_type.name(), error = %e, "Dropping outbound frame");
            }
        }
    }
}

/// An empty parameter means "query": it must not appear in the frame at all
fn normalize_parameter(parameter: Option<Vec<u8>>) -> Option<Vec<u8>> {
    parameter.filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;

    fn registry() -> AddressRegistry {
        AddressRegistry::new(
            (NodeKey::new("xb0"), Addr64(0x0013_A200_40AF_B72D)),
            vec![(NodeKey::new("xb1"), Addr64(0x0013_A200_40B3_2D72))],
        )
    }

    #[test]
    fn test_local_at_command() {
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());
        dispatcher.send_local_at_command(None, AtCommand::new("AI").unwrap(), None);

        assert_eq!(
            dispatcher.sink().frames(),
            vec![OutboundFrame::AtCommand {
                frame_id: None,
                command: AtCommand::new("AI").unwrap(),
                parameter: None,
            }]
        );
    }

    #[test]
    fn test_remote_at_command_resolves_addresses() {
        let mut reg = registry();
        reg.set_addr16(&NodeKey::new("xb1"), Addr16(0x4E21)).unwrap();
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());

        dispatcher
            .send_remote_at_command(
                &reg,
                &Target::parse("xb1"),
                Some(7),
                AtCommand::D4,
                Some(vec![0x05]),
            )
            .unwrap();

        assert_eq!(
            dispatcher.sink().frames()[0],
            OutboundFrame::RemoteAtCommand {
                destination64: Addr64(0x0013_A200_40B3_2D72),
                destination16: Addr16(0x4E21),
                frame_id: Some(7),
                command: AtCommand::D4,
                parameter: Some(vec![0x05]),
            }
        );
    }

    #[test]
    fn test_broadcast_uses_reserved_addresses_and_omits_empty_parameter() {
        let reg = registry();
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());

        dispatcher
            .send_remote_at_command(
                &reg,
                &Target::parse("broadcast"),
                None,
                AtCommand::ND,
                Some(Vec::new()),
            )
            .unwrap();

        match &dispatcher.sink().frames()[0] {
            OutboundFrame::RemoteAtCommand {
                destination64,
                destination16,
                parameter,
                ..
            } => {
                assert_eq!(destination64.to_string(), "000000000000ffff");
                assert_eq!(destination16.to_string(), "fffe");
                assert!(parameter.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_send_data_defaults() {
        let reg = registry();
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());
        dispatcher.send_data(&reg, &NodeKey::new("xb1"), "off").unwrap();

        assert_eq!(
            dispatcher.sink().frames()[0],
            OutboundFrame::TransmitRequest {
                destination64: Addr64(0x0013_A200_40B3_2D72),
                destination16: Addr16::UNKNOWN,
                broadcast_radius: 0,
                options: 0,
                data: b"off".to_vec(),
            }
        );
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let reg = registry();
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());
        let err = dispatcher
            .send_data(&reg, &NodeKey::new("xb5"), "on")
            .unwrap_err();
        assert!(matches!(err, XbeeError::InvalidKey(_)));
        assert!(dispatcher.sink().frames().is_empty());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let reg = registry();
        let mut dispatcher = CommandDispatcher::new(RecordingSink::default());

        let err = dispatcher
            .send_data(&reg, &NodeKey::new("xb1"), vec![b'x'; MAX_TRANSMIT_PAYLOAD + 1])
            .unwrap_err();
        assert!(matches!(err, XbeeError::FrameTooLarge { .. }));
        assert!(dispatcher.sink().frames().is_empty());

        dispatcher
            .send_data(&reg, &NodeKey::new("xb1"), vec![b'x'; MAX_TRANSMIT_PAYLOAD])
            .unwrap();
        assert_eq!(dispatcher.stats().queued, 1);
    }

    #[test]
    fn test_closed_sink_is_counted_not_returned() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let reg = registry();
        let mut dispatcher = CommandDispatcher::new(tx);

        assert!(dispatcher
            .send_remote_at_command(&reg, &Target::Broadcast, None, AtCommand::ND, None)
            .is_ok());
        assert_eq!(dispatcher.stats(), DispatcherStats { queued: 0, dropped: 1 });
    }
}
