//! Inbound frame handling
//!
//! Every decoded frame from the coordinator passes through
//! [`FrameEventRouter::route`], which applies its effect to the registry and
//! telemetry store and describes what it touched as a [`NodeEvent`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::frame::{
    Addr16, Addr64, AnalogChannel, CommandStatus, DeliveryStatus, InboundFrame, NodeKey,
};
use crate::registry::AddressRegistry;
use crate::telemetry::{parse_sensor_payload, power_from_ad0, temperature_from_ad3, TelemetryStore};

/// Node facts touched by one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    /// Node the frame came from
    pub key: NodeKey,
    /// Current 16-bit address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr16: Option<Addr16>,
    /// Current liveness, when the frame carried a delivery outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered: Option<bool>,
    /// Current route, when the frame was a route record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Vec<NodeKey>>,
}

impl NodeSummary {
    fn new(key: NodeKey) -> Self {
        Self {
            key,
            addr16: None,
            discovered: None,
            route: None,
        }
    }
}

/// Outcome of routing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// Whether the registry actually changed
    pub changed: bool,
    /// What the frame touched
    pub summary: NodeSummary,
}

/// Decodes inbound frames into registry and telemetry updates
#[derive(Debug, Clone, Default)]
pub struct FrameEventRouter {
    power_monitor: Option<NodeKey>,
}

impl FrameEventRouter {
    /// Create a router; AD0 power samples are logged for `power_monitor`
    pub fn new(power_monitor: Option<NodeKey>) -> Self {
        Self { power_monitor }
    }

    /// Apply one frame
    ///
    /// Returns `None` for frames that do not concern a configured node
    /// (local command responses, unknown frame types, unknown senders,
    /// sensor data from the coordinator).
    /// Never fails: problems are logged and the frame is dropped.
    pub fn route(
        &self,
        frame: &InboundFrame,
        registry: &mut AddressRegistry,
        telemetry: &mut TelemetryStore,
    ) -> Option<NodeEvent> {
        match self.try_route(frame, registry, telemetry) {
            Ok(event) => event,
            Err(e) => {
                warn!(frame_type = format_args!("0x{:02X}", frame.type_code()), error = %e, "Failed to apply frame");
                None
            }
        }
    }

    fn try_route(
        &self,
        frame: &InboundFrame,
        registry: &mut AddressRegistry,
        telemetry: &mut TelemetryStore,
    ) -> Result<Option<NodeEvent>> {
        match frame {
            InboundFrame::AtCommandResponse {
                frame_id,
                command,
                status,
                data,
            } => {
                if data.is_empty() {
                    info!(frame_id, %command, %status, "AT command response");
                } else {
                    info!(frame_id, %command, %status, data = %hex::encode(data), "AT command response");
                }
                Ok(None)
            }

            InboundFrame::TransmitStatus {
                frame_id,
                remote16,
                retry_count,
                delivery_status,
                discovery_status,
            } => {
                debug!(
                    frame_id,
                    remote16 = %remote16,
                    retry_count,
                    %delivery_status,
                    %discovery_status,
                    "Transmit status"
                );
                let Some(key) = registry.resolve_key_by_addr16(*remote16).cloned() else {
                    debug!(remote16 = %remote16, "Transmit status for unknown 16-bit address");
                    return Ok(None);
                };
                let liveness = match delivery_status {
                    DeliveryStatus::Success => Some(true),
                    DeliveryStatus::NetworkAckFailure => Some(false),
                    _ => None,
                };
                apply_liveness(registry, key, *remote16, liveness).map(Some)
            }

            InboundFrame::ReceivePacket {
                remote64,
                remote16,
                data,
                ..
            } => {
                let Some(key) = field_sender(registry, *remote64) else {
                    return Ok(None);
                };
                let readings = parse_sensor_payload(data);
                debug!(%key, payload = %String::from_utf8_lossy(data), readings = readings.len(), "Sensor packet");
                for (kind, value) in readings {
                    telemetry.record_reading(&key, kind, value)?;
                }
                apply_addr16(registry, key, *remote16).map(Some)
            }

            InboundFrame::IoDataSample {
                remote64,
                remote16,
                analog_samples,
                ..
            } => {
                let Some(key) = field_sender(registry, *remote64) else {
                    return Ok(None);
                };
                match analog_samples.get(&AnalogChannel::Ad3) {
                    Some(raw) => {
                        let sample = temperature_from_ad3(*raw);
                        trace!(%key, raw, volts = sample.volts, celsius = sample.celsius, "Temperature sample");
                        telemetry.accumulate(&key, sample.celsius)?;
                    }
                    None => debug!(%key, "IO sample without AD3"),
                }
                if self.power_monitor.as_ref() == Some(&key) {
                    if let Some(raw) = analog_samples.get(&AnalogChannel::Ad0) {
                        let power = power_from_ad0(*raw);
                        info!(
                            %key,
                            millivolts = format_args!("{:.1}", power.millivolts),
                            amps = format_args!("{:.2}", power.amps),
                            watts = format_args!("{:.1}", power.watts),
                            "Power reading"
                        );
                    }
                }
                apply_addr16(registry, key, *remote16).map(Some)
            }

            InboundFrame::RemoteCommandResponse {
                frame_id,
                remote64,
                remote16,
                command,
                status,
                data,
            } => {
                debug!(frame_id, remote64 = %remote64, %command, %status, data = %hex::encode(data), "Remote command response");
                let Some(key) = sender(registry, *remote64) else {
                    return Ok(None);
                };
                let liveness = match status {
                    CommandStatus::Ok => Some(true),
                    CommandStatus::RemoteTransmissionFailure => Some(false),
                    _ => None,
                };
                apply_liveness(registry, key, *remote16, liveness).map(Some)
            }

            InboundFrame::RouteRecord {
                remote64,
                remote16,
                hops,
                ..
            } => {
                let Some(key) = sender(registry, *remote64) else {
                    return Ok(None);
                };
                let mut event = apply_addr16(registry, key, *remote16)?;

                let resolved: Option<Vec<NodeKey>> = hops
                    .iter()
                    .map(|hop| registry.resolve_key_by_addr16(*hop).cloned())
                    .collect();
                match resolved {
                    Some(route) => {
                        event.changed |= registry.set_route(&event.summary.key, route.clone())?;
                        debug!(key = %event.summary.key, route = ?route, "Route record");
                        event.summary.route = Some(route);
                    }
                    None => {
                        let hops: Vec<String> = hops.iter().map(Addr16::to_string).collect();
                        warn!(key = %event.summary.key, hops = ?hops, "Route record with unknown hop, keeping previous route");
                    }
                }
                Ok(Some(event))
            }

            InboundFrame::Unknown { frame_type, data } => {
                debug!(
                    frame_type = format_args!("0x{:02X}", frame_type),
                    size = data.len(),
                    "Ignoring unsupported frame"
                );
                Ok(None)
            }
        }
    }
}

fn sender(registry: &AddressRegistry, addr64: Addr64) -> Option<NodeKey> {
    let key = registry.resolve_key_by_addr64(addr64).cloned();
    if key.is_none() {
        warn!(remote64 = %addr64, "Frame from unconfigured module");
    }
    key
}

/// Sender of a sensor frame; the coordinator keeps no telemetry
fn field_sender(registry: &AddressRegistry, addr64: Addr64) -> Option<NodeKey> {
    let key = sender(registry, addr64)?;
    if registry.is_coordinator(&key) {
        debug!(%key, "Ignoring sensor data from the coordinator");
        return None;
    }
    Some(key)
}

fn apply_addr16(registry: &mut AddressRegistry, key: NodeKey, addr16: Addr16) -> Result<NodeEvent> {
    let changed = registry.set_addr16(&key, addr16)?;
    let mut summary = NodeSummary::new(key);
    summary.addr16 = Some(registry.node(&summary.key)?.addr16());
    Ok(NodeEvent { changed, summary })
}

fn apply_liveness(
    registry: &mut AddressRegistry,
    key: NodeKey,
    addr16: Addr16,
    liveness: Option<bool>,
) -> Result<NodeEvent> {
    let mut event = apply_addr16(registry, key, addr16)?;
    if let Some(discovered) = liveness {
        event.changed |= registry.set_discovered(&event.summary.key, discovered)?;
    }
    event.summary.discovered = Some(registry.node(&event.summary.key)?.discovered());
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AtCommand, DiscoveryStatus};
    use crate::telemetry::SensorKind;
    use std::collections::BTreeMap;

    const XB1: Addr64 = Addr64(0x0013_A200_40B3_2D72);
    const XB2: Addr64 = Addr64(0x0013_A200_40B3_2D6C);

    fn key(k: &str) -> NodeKey {
        NodeKey::new(k)
    }

    fn setup() -> (FrameEventRouter, AddressRegistry, TelemetryStore) {
        let registry = AddressRegistry::new(
            (key("xb0"), Addr64(0x0013_A200_40AF_B72D)),
            vec![(key("xb1"), XB1), (key("xb2"), XB2)],
        );
        let telemetry = TelemetryStore::new(registry.field_keys());
        (FrameEventRouter::new(Some(key("xb1"))), registry, telemetry)
    }

    fn status(remote16: u16, delivery_status: DeliveryStatus) -> InboundFrame {
        InboundFrame::TransmitStatus {
            frame_id: 1,
            remote16: Addr16(remote16),
            retry_count: 0,
            delivery_status,
            discovery_status: DiscoveryStatus::NoOverhead,
        }
    }

    fn io_sample(remote64: Addr64, ad3: u16) -> InboundFrame {
        let mut analog_samples = BTreeMap::new();
        analog_samples.insert(AnalogChannel::Ad0, 512);
        analog_samples.insert(AnalogChannel::Ad3, ad3);
        InboundFrame::IoDataSample {
            remote64,
            remote16: Addr16(0x1A2B),
            receive_options: 0x01,
            digital_mask: 0,
            digital_samples: None,
            analog_samples,
        }
    }

    #[test]
    fn test_liveness_toggling() {
        let (router, mut reg, mut tel) = setup();
        reg.set_addr16(&key("xb1"), Addr16(0x1A2B)).unwrap();
        reg.set_discovered(&key("xb1"), true).unwrap();

        let down = router
            .route(&status(0x1A2B, DeliveryStatus::NetworkAckFailure), &mut reg, &mut tel)
            .unwrap();
        assert!(down.changed);
        assert_eq!(down.summary.discovered, Some(false));

        let again = router
            .route(&status(0x1A2B, DeliveryStatus::NetworkAckFailure), &mut reg, &mut tel)
            .unwrap();
        assert!(!again.changed);

        let up = router
            .route(&status(0x1A2B, DeliveryStatus::Success), &mut reg, &mut tel)
            .unwrap();
        assert!(up.changed);
        assert!(reg.node(&key("xb1")).unwrap().discovered());
    }

    #[test]
    fn test_other_delivery_status_leaves_liveness() {
        let (router, mut reg, mut tel) = setup();
        reg.set_addr16(&key("xb1"), Addr16(0x1A2B)).unwrap();

        let event = router
            .route(&status(0x1A2B, DeliveryStatus::RouteNotFound), &mut reg, &mut tel)
            .unwrap();
        assert!(!event.changed);
        assert_eq!(event.summary.discovered, Some(false));
    }

    #[test]
    fn test_status_for_unknown_address_is_dropped() {
        let (router, mut reg, mut tel) = setup();
        assert!(router
            .route(&status(0xFFFE, DeliveryStatus::Success), &mut reg, &mut tel)
            .is_none());
    }

    #[test]
    fn test_receive_packet_stores_readings() {
        let (router, mut reg, mut tel) = setup();
        let frame = InboundFrame::ReceivePacket {
            remote64: XB2,
            remote16: Addr16(0x0042),
            receive_options: 0x01,
            data: b"t21.0|g40|z1".to_vec(),
        };

        let event = router.route(&frame, &mut reg, &mut tel).unwrap();
        assert!(event.changed);
        assert_eq!(event.summary.addr16, Some(Addr16(0x0042)));

        let temp = tel.last_reading(&key("xb2"), SensorKind::Temperature).unwrap();
        assert_eq!(temp.map(|r| r.value), Some(21.0));
        let gas = tel.last_reading(&key("xb2"), SensorKind::Gas).unwrap();
        assert_eq!(gas.map(|r| r.value), Some(22.7));
    }

    #[test]
    fn test_io_sample_accumulates_once() {
        let (router, mut reg, mut tel) = setup();
        router.route(&io_sample(XB1, 600), &mut reg, &mut tel).unwrap();

        let record = tel.record(&key("xb1")).unwrap();
        assert_eq!(record.count, 1);
        assert!((record.sum - 2.85).abs() < 1e-9);

        router.route(&io_sample(XB1, 600), &mut reg, &mut tel).unwrap();
        assert_eq!(tel.record(&key("xb1")).unwrap().count, 2);
    }

    #[test]
    fn test_remote_response_liveness() {
        let (router, mut reg, mut tel) = setup();
        let response = |status| InboundFrame::RemoteCommandResponse {
            frame_id: 3,
            remote64: XB2,
            remote16: Addr16(0x0042),
            command: AtCommand::D4,
            status,
            data: Vec::new(),
        };

        let up = router.route(&response(CommandStatus::Ok), &mut reg, &mut tel).unwrap();
        assert!(up.changed);
        assert_eq!(up.summary.discovered, Some(true));
        assert_eq!(up.summary.addr16, Some(Addr16(0x0042)));

        let down = router
            .route(&response(CommandStatus::RemoteTransmissionFailure), &mut reg, &mut tel)
            .unwrap();
        assert!(down.changed);
        assert!(!reg.node(&key("xb2")).unwrap().discovered());
    }

    #[test]
    fn test_route_record() {
        let (router, mut reg, mut tel) = setup();
        reg.set_addr16(&key("xb1"), Addr16(0x1A2B)).unwrap();
        reg.set_addr16(&key("xb2"), Addr16(0x0042)).unwrap();
        let record = InboundFrame::RouteRecord {
            remote64: XB2,
            remote16: Addr16(0x0042),
            receive_options: 0x01,
            hops: vec![Addr16(0x1A2B)],
        };

        let event = router.route(&record, &mut reg, &mut tel).unwrap();
        assert!(event.changed);
        assert_eq!(event.summary.route, Some(vec![key("xb1")]));
        assert!(!router.route(&record, &mut reg, &mut tel).unwrap().changed);
    }

    #[test]
    fn test_route_record_with_unknown_hop_keeps_route() {
        let (router, mut reg, mut tel) = setup();
        reg.set_route(&key("xb2"), vec![key("xb1")]).unwrap();
        let record = InboundFrame::RouteRecord {
            remote64: XB2,
            remote16: Addr16(0x0042),
            receive_options: 0x01,
            hops: vec![Addr16(0x7777)],
        };

        let event = router.route(&record, &mut reg, &mut tel).unwrap();
        assert!(event.changed);
        assert_eq!(event.summary.route, None);
        assert_eq!(reg.node(&key("xb2")).unwrap().route(), &[key("xb1")]);
    }

    #[test]
    fn test_unrelated_frames_emit_nothing() {
        let (router, mut reg, mut tel) = setup();
        let before = reg.snapshot();
        let frames = [
            InboundFrame::AtCommandResponse {
                frame_id: 1,
                command: AtCommand::new("AI").unwrap(),
                status: CommandStatus::Ok,
                data: vec![0x00],
            },
            InboundFrame::Unknown {
                frame_type: 0x95,
                data: vec![1, 2, 3],
            },
            InboundFrame::ReceivePacket {
                remote64: Addr64(0xDEAD_BEEF),
                remote16: Addr16(0x0001),
                receive_options: 0,
                data: b"t1".to_vec(),
            },
        ];
        for frame in &frames {
            assert!(router.route(frame, &mut reg, &mut tel).is_none());
        }
        assert_eq!(reg.snapshot(), before);
    }

    #[test]
    fn test_sensor_frames_from_coordinator_are_ignored() {
        let (router, mut reg, mut tel) = setup();
        let coordinator = Addr64(0x0013_A200_40AF_B72D);
        let before = reg.snapshot();

        let packet = InboundFrame::ReceivePacket {
            remote64: coordinator,
            remote16: Addr16(0x0000),
            receive_options: 0x01,
            data: b"t21.0".to_vec(),
        };
        assert!(router.route(&packet, &mut reg, &mut tel).is_none());
        assert!(router.route(&io_sample(coordinator, 600), &mut reg, &mut tel).is_none());

        assert_eq!(reg.snapshot(), before);
        assert!(tel.snapshot().values().all(|record| record.count == 0 && record.readings.is_empty()));
    }
}
