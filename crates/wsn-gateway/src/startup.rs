//! Gateway startup and periodic reporting
//!
//! Everything here talks to the controller through a [`WsnHandle`] only, so
//! it runs the same against the serial coordinator and the mock transport.

use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wsn_xbee::{pin_mode, AtCommand, NodeKey, NodeSummary, Target, WsnHandle, XbeeError};

/// Run discovery over every field node
///
/// A partial failure is logged and the gateway continues with the nodes
/// that answered.
pub async fn discover(handle: &WsnHandle) -> wsn_xbee::Result<()> {
    match handle.discover_all().await {
        Ok(()) => {
            info!(nodes = handle.field_keys().len(), "All nodes discovered");
            Ok(())
        }
        Err(XbeeError::DiscoveryExhausted { undiscovered }) => {
            let keys: Vec<&str> = undiscovered.iter().map(NodeKey::as_str).collect();
            warn!(undiscovered = ?keys, "Continuing without undiscovered nodes");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Drive each listed node's D4 output to its saved level
pub async fn restore_outputs(
    handle: &WsnHandle,
    outputs: &BTreeMap<NodeKey, bool>,
) -> wsn_xbee::Result<()> {
    for (key, high) in outputs {
        let level = if *high {
            pin_mode::DIGITAL_OUTPUT_HIGH
        } else {
            pin_mode::DIGITAL_OUTPUT_LOW
        };
        info!(%key, high, "Restoring output");
        match handle
            .send_remote_at_command(Target::Node(key.clone()), None, AtCommand::D4, Some(vec![level]))
            .await
        {
            Ok(()) => {}
            Err(XbeeError::InvalidKey(key)) => warn!(%key, "Skipping output for unknown node"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Log and reset the temperature average of every field node, with the
/// latest discrete readings
pub async fn report_telemetry(handle: &WsnHandle) -> anyhow::Result<()> {
    let records = handle.telemetry_snapshot().await?;

    for key in handle.field_keys() {
        let readings = records
            .get(key)
            .map(|record| {
                record
                    .readings
                    .iter()
                    .map(|(kind, reading)| format!("{}={}", kind, reading.value))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        match handle.drain_average(key.clone()).await? {
            Some(celsius) => info!(
                %key,
                temperature = format_args!("{:.2}", celsius),
                readings = %readings,
                "Telemetry report"
            ),
            None => debug!(%key, readings = %readings, "No temperature samples since last report"),
        }
    }

    let snapshot = handle.snapshot().await?;
    debug!(registry = %serde_json::to_string(&snapshot)?, "Registry snapshot");
    Ok(())
}

/// Log node changes until the controller goes away
pub async fn log_changes(mut events: broadcast::Receiver<NodeSummary>) {
    loop {
        match events.recv().await {
            Ok(summary) => {
                let json = serde_json::to_string(&summary).unwrap_or_default();
                info!(key = %summary.key, change = %json, "Node changed");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Node change log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wsn_xbee::{
        Addr16, Addr64, InboundFrame, MockRadio, MockTransport, OutboundFrame, WsnConfigBuilder,
        WsnController,
    };

    fn start() -> (WsnHandle, MockRadio) {
        let config = WsnConfigBuilder::new()
            .discovery(0, Duration::from_secs(8))
            .build();
        let (transport, radio) = MockTransport::new();
        let (controller, handle) = WsnController::new(transport, &config);
        tokio::spawn(controller.run());
        (handle, radio)
    }

    #[tokio::test]
    async fn test_restore_outputs_sends_d4() {
        let (handle, mut radio) = start();
        let mut outputs = BTreeMap::new();
        outputs.insert(NodeKey::new("xb1"), true);
        outputs.insert(NodeKey::new("xb2"), false);
        outputs.insert(NodeKey::new("xb9"), true);

        restore_outputs(&handle, &outputs).await.unwrap();

        let mut levels = Vec::new();
        for _ in 0..2 {
            match radio.next_outbound().await {
                Some(OutboundFrame::RemoteAtCommand {
                    command, parameter, ..
                }) => {
                    assert_eq!(command, AtCommand::D4);
                    levels.push(parameter);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(levels, vec![Some(vec![0x05]), Some(vec![0x04])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_discovery_is_not_fatal() {
        let (handle, mut radio) = start();

        let task = {
            let handle = handle.clone();
            tokio::spawn(async move { discover(&handle).await })
        };
        assert!(radio.next_outbound().await.is_some());
        radio.deliver(InboundFrame::RemoteCommandResponse {
            frame_id: 1,
            remote64: Addr64(0x0013_A200_40B3_2D72),
            remote16: Addr16(0x1A2B),
            command: AtCommand::ND,
            status: wsn_xbee::CommandStatus::Ok,
            data: Vec::new(),
        });

        assert!(task.await.unwrap().is_ok());
        assert_eq!(
            handle.undiscovered_keys().await.unwrap(),
            vec![NodeKey::new("xb2")]
        );
    }

    #[tokio::test]
    async fn test_report_drains_averages() {
        let (handle, radio) = start();
        let mut analog_samples = BTreeMap::new();
        analog_samples.insert(wsn_xbee::AnalogChannel::Ad3, 600);
        radio.deliver(InboundFrame::IoDataSample {
            remote64: Addr64(0x0013_A200_40B3_2D72),
            remote16: Addr16(0x1A2B),
            receive_options: 0x01,
            digital_mask: 0,
            digital_samples: None,
            analog_samples,
        });

        loop {
            let records = handle.telemetry_snapshot().await.unwrap();
            if records[&NodeKey::new("xb1")].count == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        report_telemetry(&handle).await.unwrap();
        assert_eq!(handle.drain_average(NodeKey::new("xb1")).await.unwrap(), None);
    }
}
