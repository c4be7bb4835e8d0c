//! WsnController - single-task reactor for the sensor network
//!
//! The controller owns every piece of protocol state and the transport. All
//! inbound frames, outbound writes, discovery timers and caller requests are
//! serialized through one `tokio::select!` loop, so nothing is shared and
//! nothing is locked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       WsnController                          │
//! │                                                              │
//! │  WsnHandle ──cmd──► ┌──────────────┐ ──frames──► transport   │
//! │                     │ Dispatcher   │                         │
//! │  transport ──rx───► │ Router       │ ──NodeSummary──► subs   │
//! │                     │ Discovery    │                         │
//! │  DeadlineTimer ───► │ Registry     │                         │
//! │                     │ Telemetry    │                         │
//! │                     └──────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let (controller, handle) = WsnController::new(transport, &config);
//! tokio::spawn(controller.run());
//!
//! if let Err(e) = handle.discover_all().await {
//!     warn!("Degraded network: {}", e);
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DiscoveryConfig, ReconnectConfig, WsnConfig};
use crate::discovery::{DiscoveryOutcome, DiscoveryProtocol};
use crate::dispatcher::{CommandDispatcher, DispatcherStats, Target};
use crate::error::{Result, XbeeError};
use crate::frame::{Addr16, Addr64, AtCommand, InboundFrame, NodeKey, OutboundFrame};
use crate::interface::XbeeTransport;
use crate::registry::{AddressRegistry, RegistrySnapshot};
use crate::router::{FrameEventRouter, NodeSummary};
use crate::telemetry::{Reading, SensorKind, TelemetryRecord, TelemetryStore};
use crate::timer::DeadlineTimer;

/// Capacity of the handle command channel
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the node-change broadcast
const EVENT_CHANNEL_SIZE: usize = 64;

/// Requests sent from a [`WsnHandle`] to the controller
#[derive(Debug)]
pub enum ControllerCommand {
    /// AT command for the coordinator
    LocalAtCommand {
        /// Frame id, allocated when `None`
        frame_id: Option<u8>,
        /// Command
        command: AtCommand,
        /// Parameter bytes
        parameter: Option<Vec<u8>>,
    },
    /// AT command for a remote module or the whole network
    RemoteAtCommand {
        /// Destination
        target: Target,
        /// Frame id, allocated when `None`
        frame_id: Option<u8>,
        /// Command
        command: AtCommand,
        /// Parameter bytes
        parameter: Option<Vec<u8>>,
        /// Address lookup result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Application payload for a node
    SendData {
        /// Destination
        key: NodeKey,
        /// Payload
        payload: Vec<u8>,
        /// Address lookup result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Run a discovery session
    StartDiscovery {
        /// Nodes that must answer
        targets: Vec<NodeKey>,
        /// Re-broadcasts after the first window
        max_retries: u32,
        /// Response window
        window: Duration,
        /// Resolved when the session ends
        reply: oneshot::Sender<Result<()>>,
    },
    /// Copy of the address registry
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    /// Field nodes currently down
    UndiscoveredKeys(oneshot::Sender<Vec<NodeKey>>),
    /// Mean of accumulated samples, resetting the accumulator
    DrainAverage {
        /// Node
        key: NodeKey,
        /// `None` when no samples arrived
        reply: oneshot::Sender<Result<Option<f64>>>,
    },
    /// Last value of one sensor
    LastReading {
        /// Node
        key: NodeKey,
        /// Sensor
        kind: SensorKind,
        /// Reading, if any
        reply: oneshot::Sender<Result<Option<Reading>>>,
    },
    /// Copy of all telemetry records
    TelemetrySnapshot(oneshot::Sender<BTreeMap<NodeKey, TelemetryRecord>>),
    /// Controller statistics
    GetStats(oneshot::Sender<ControllerStats>),
    /// Stop the controller
    Shutdown,
}

/// Controller statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// 0x88 frames received
    pub at_responses: u64,
    /// 0x8B frames received
    pub transmit_statuses: u64,
    /// 0x90 frames received
    pub receive_packets: u64,
    /// 0x92 frames received
    pub io_samples: u64,
    /// 0x97 frames received
    pub remote_responses: u64,
    /// 0xA1 frames received
    pub route_records: u64,
    /// Frames of unsupported types
    pub unknown_frames: u64,
    /// Frames rejected by the decoder
    pub decode_errors: u64,
    /// Frames written to the transport
    pub frames_written: u64,
    /// Writes that failed
    pub write_failures: u64,
    /// Transport opens that failed
    pub open_failures: u64,
    /// Node-change notifications published
    pub notifications: u64,
    /// Outbound queue counters
    pub dispatcher: DispatcherStats,
}

impl ControllerStats {
    fn count_frame(&mut self, frame: &InboundFrame) {
        let counter = match frame {
            InboundFrame::AtCommandResponse { .. } => &mut self.at_responses,
            InboundFrame::TransmitStatus { .. } => &mut self.transmit_statuses,
            InboundFrame::ReceivePacket { .. } => &mut self.receive_packets,
            InboundFrame::IoDataSample { .. } => &mut self.io_samples,
            InboundFrame::RemoteCommandResponse { .. } => &mut self.remote_responses,
            InboundFrame::RouteRecord { .. } => &mut self.route_records,
            InboundFrame::Unknown { .. } => &mut self.unknown_frames,
        };
        *counter += 1;
    }
}

/// Handle for controlling a running [`WsnController`]
#[derive(Debug, Clone)]
pub struct WsnHandle {
    command_tx: mpsc::Sender<ControllerCommand>,
    events_tx: broadcast::Sender<NodeSummary>,
    field_keys: Vec<NodeKey>,
    discovery: DiscoveryConfig,
}

impl WsnHandle {
    async fn send(&self, cmd: ControllerCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| XbeeError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| XbeeError::ChannelClosed)
    }

    /// Queue an AT command for the coordinator
    pub async fn send_local_at_command(
        &self,
        frame_id: Option<u8>,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) -> Result<()> {
        self.send(ControllerCommand::LocalAtCommand {
            frame_id,
            command,
            parameter,
        })
        .await
    }

    /// Queue an AT command for a node or, with [`Target::Broadcast`], every node
    pub async fn send_remote_at_command(
        &self,
        target: Target,
        frame_id: Option<u8>,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) -> Result<()> {
        self.request(|reply| ControllerCommand::RemoteAtCommand {
            target,
            frame_id,
            command,
            parameter,
            reply,
        })
        .await?
    }

    /// Queue an application payload for a node
    pub async fn send_data(&self, key: NodeKey, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| ControllerCommand::SendData {
            key,
            payload,
            reply,
        })
        .await?
    }

    /// Run a discovery session and wait for it to end
    pub async fn start_discovery(
        &self,
        targets: Vec<NodeKey>,
        max_retries: u32,
        window: Duration,
    ) -> Result<()> {
        self.request(|reply| ControllerCommand::StartDiscovery {
            targets,
            max_retries,
            window,
            reply,
        })
        .await?
    }

    /// Discover every field node with the configured retry and window
    pub async fn discover_all(&self) -> Result<()> {
        self.start_discovery(
            self.field_keys.clone(),
            self.discovery.max_retries,
            self.discovery.window,
        )
        .await
    }

    /// Copy of the address registry
    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        self.request(ControllerCommand::Snapshot).await
    }

    /// Field nodes currently believed down
    pub async fn undiscovered_keys(&self) -> Result<Vec<NodeKey>> {
        self.request(ControllerCommand::UndiscoveredKeys).await
    }

    /// Mean of the samples accumulated for `key` since the last drain
    pub async fn drain_average(&self, key: NodeKey) -> Result<Option<f64>> {
        self.request(|reply| ControllerCommand::DrainAverage { key, reply })
            .await?
    }

    /// Last value of one sensor
    pub async fn last_reading(&self, key: NodeKey, kind: SensorKind) -> Result<Option<Reading>> {
        self.request(|reply| ControllerCommand::LastReading { key, kind, reply })
            .await?
    }

    /// Copy of all telemetry records
    pub async fn telemetry_snapshot(&self) -> Result<BTreeMap<NodeKey, TelemetryRecord>> {
        self.request(ControllerCommand::TelemetrySnapshot).await
    }

    /// Get controller statistics
    pub async fn stats(&self) -> Result<ControllerStats> {
        self.request(ControllerCommand::GetStats).await
    }

    /// Receive a [`NodeSummary`] every time a frame changes a node
    pub fn subscribe(&self) -> broadcast::Receiver<NodeSummary> {
        self.events_tx.subscribe()
    }

    /// Field node keys in configuration order
    pub fn field_keys(&self) -> &[NodeKey] {
        &self.field_keys
    }

    /// Stop the controller
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControllerCommand::Shutdown).await
    }
}

/// Reactor owning the protocol state and the transport
pub struct WsnController<T: XbeeTransport> {
    /// Link to the coordinator
    transport: T,
    /// Node identity, liveness and routes
    registry: AddressRegistry,
    /// Sensor readings
    telemetry: TelemetryStore,
    /// Outbound frame builder
    dispatcher: CommandDispatcher<mpsc::UnboundedSender<OutboundFrame>>,
    /// Frames waiting to be written
    outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Node discovery
    discovery: DiscoveryProtocol,
    /// Caller waiting for the running discovery session
    discovery_reply: Option<oneshot::Sender<Result<()>>>,
    /// Discovery windows
    timer: DeadlineTimer,
    /// Inbound frame handling
    router: FrameEventRouter,
    /// Command receiver
    command_rx: mpsc::Receiver<ControllerCommand>,
    /// Node-change notifications
    events_tx: broadcast::Sender<NodeSummary>,
    /// Reconnection policy
    reconnect: ReconnectConfig,
    /// Pending reopen while the link is down
    reconnect_state: Option<Reconnect>,
    /// Statistics
    stats: ControllerStats,
}

impl<T: XbeeTransport + 'static> WsnController<T> {
    /// Create a controller for a validated configuration
    pub fn new(transport: T, config: &WsnConfig) -> (Self, WsnHandle) {
        let registry = AddressRegistry::from_config(&config.network);
        let field_keys = registry.field_keys();
        let telemetry = TelemetryStore::new(field_keys.clone());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let handle = WsnHandle {
            command_tx,
            events_tx: events_tx.clone(),
            field_keys,
            discovery: config.discovery.clone(),
        };

        let controller = Self {
            transport,
            registry,
            telemetry,
            dispatcher: CommandDispatcher::new(outbound_tx),
            outbound_rx,
            discovery: DiscoveryProtocol::new(),
            discovery_reply: None,
            timer: DeadlineTimer::new(),
            router: FrameEventRouter::new(config.network.power_monitor.clone()),
            command_rx,
            events_tx,
            reconnect: config.reconnect.clone(),
            reconnect_state: None,
            stats: ControllerStats::default(),
        };

        (controller, handle)
    }

    /// Run the event loop until shutdown or an unrecoverable transport error
    ///
    /// While the link is down, reopen attempts are scheduled like any other
    /// deadline so commands and discovery windows keep being served.
    pub async fn run(mut self) -> Result<()> {
        info!(transport = self.transport.name(), "Starting WSN controller");

        if let Err(e) = self.transport.open().await {
            self.stats.open_failures += 1;
            warn!(error = %e, "Failed to open transport");
            self.schedule_reconnect(e)?;
        }

        let result = loop {
            let deadline = self.timer.next_deadline();
            let reopen_at = self.reconnect_state.as_ref().map(|r| r.at);
            let link_up = reopen_at.is_none();

            tokio::select! {
                // Inbound frames
                result = self.transport.next_frame(), if link_up => {
                    match result {
                        Ok(Some(frame)) => self.handle_frame(frame),
                        Ok(None) => trace!("No complete frame available"),
                        Err(e) if e.is_protocol_error() => {
                            self.stats.decode_errors += 1;
                            warn!(error = %e, code = e.error_code(), "Dropping malformed frame");
                        }
                        Err(e) => {
                            warn!(error = %e, "Error reading from transport");
                            if let Err(e) = self.schedule_reconnect(e) {
                                break Err(e);
                            }
                        }
                    }
                }

                // Queued outbound frames
                Some(frame) = self.outbound_rx.recv() => {
                    self.write_frame(frame).await;
                }

                // Handle commands
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControllerCommand::Shutdown) => {
                            info!("Controller shutdown requested");
                            break Ok(());
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("All controller handles dropped");
                            break Ok(());
                        }
                    }
                }

                // Discovery windows
                _ = sleep_until(deadline) => {
                    self.handle_deadlines();
                }

                // Reopen the link
                _ = sleep_until(reopen_at) => {
                    if let Err(e) = self.reopen().await {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(outcome) = self.discovery.abort(&mut self.timer) {
            self.finish_discovery(outcome);
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }

        info!("WSN controller stopped");
        result
    }

    /// Apply one inbound frame, publishing at most one notification
    fn handle_frame(&mut self, frame: InboundFrame) {
        self.stats.count_frame(&frame);

        let discovery_changed = frame
            .node_discovery_response()
            .and_then(|(addr64, addr16)| self.offer_discovery_response(addr64, addr16));

        let routed = self
            .router
            .route(&frame, &mut self.registry, &mut self.telemetry);

        let summary = match routed {
            Some(event) if event.changed || discovery_changed.is_some() => Some(event.summary),
            Some(_) => None,
            None => discovery_changed,
        };
        if let Some(summary) = summary {
            self.notify(summary);
        }
    }

    /// Feed a Node Discovery answer to the running session
    ///
    /// Returns what changed in the registry, if anything.
    fn offer_discovery_response(&mut self, addr64: Addr64, addr16: Addr16) -> Option<NodeSummary> {
        if !self.discovery.is_active() {
            return None;
        }
        let Some(key) = self.registry.resolve_key_by_addr64(addr64).cloned() else {
            debug!(remote64 = %addr64, "Discovery response from unconfigured module");
            return None;
        };

        match self
            .discovery
            .on_response(&key, addr16, &mut self.registry, &mut self.timer)
        {
            Ok(effect) => {
                if let Some(outcome) = effect.outcome {
                    self.finish_discovery(outcome);
                }
                effect.changed.then(|| NodeSummary {
                    key,
                    addr16: Some(addr16),
                    discovered: Some(true),
                    route: None,
                })
            }
            Err(e) => {
                warn!(%key, error = %e, "Failed to apply discovery response");
                None
            }
        }
    }

    fn handle_deadlines(&mut self) {
        for id in self.timer.take_expired(Instant::now()) {
            if let Some(outcome) = self
                .discovery
                .on_timer(id, &mut self.timer, &mut self.dispatcher)
            {
                self.finish_discovery(outcome);
            }
        }
    }

    fn finish_discovery(&mut self, outcome: DiscoveryOutcome) {
        match self.discovery_reply.take() {
            Some(reply) => {
                let _ = reply.send(outcome.into_result());
            }
            None => debug!(?outcome, "Discovery finished with nobody waiting"),
        }
    }

    fn notify(&mut self, summary: NodeSummary) {
        debug!(key = %summary.key, ?summary, "Node changed");
        self.stats.notifications += 1;
        // No subscribers is fine
        let _ = self.events_tx.send(summary);
    }

    fn handle_command(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::LocalAtCommand {
                frame_id,
                command,
                parameter,
            } => {
                self.dispatcher
                    .send_local_at_command(frame_id, command, parameter);
            }
            ControllerCommand::RemoteAtCommand {
                target,
                frame_id,
                command,
                parameter,
                reply,
            } => {
                let result = self.dispatcher.send_remote_at_command(
                    &self.registry,
                    &target,
                    frame_id,
                    command,
                    parameter,
                );
                let _ = reply.send(result);
            }
            ControllerCommand::SendData {
                key,
                payload,
                reply,
            } => {
                let _ = reply.send(self.dispatcher.send_data(&self.registry, &key, payload));
            }
            ControllerCommand::StartDiscovery {
                targets,
                max_retries,
                window,
                reply,
            } => {
                let field_keys = self.registry.field_keys();
                if let Some(key) = targets.iter().find(|k| !field_keys.contains(*k)) {
                    let _ = reply.send(Err(XbeeError::InvalidKey(key.clone())));
                    return;
                }
                match self.discovery.start(
                    targets,
                    max_retries,
                    window,
                    &mut self.timer,
                    &mut self.dispatcher,
                ) {
                    Ok(Some(outcome)) => {
                        let _ = reply.send(outcome.into_result());
                    }
                    Ok(None) => self.discovery_reply = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ControllerCommand::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            ControllerCommand::UndiscoveredKeys(reply) => {
                let _ = reply.send(self.registry.undiscovered_keys());
            }
            ControllerCommand::DrainAverage { key, reply } => {
                let _ = reply.send(self.telemetry.drain_average(&key));
            }
            ControllerCommand::LastReading { key, kind, reply } => {
                let _ = reply.send(self.telemetry.last_reading(&key, kind));
            }
            ControllerCommand::TelemetrySnapshot(reply) => {
                let _ = reply.send(self.telemetry.snapshot());
            }
            ControllerCommand::GetStats(reply) => {
                let mut stats = self.stats.clone();
                stats.dispatcher = self.dispatcher.stats();
                let _ = reply.send(stats);
            }
            ControllerCommand::Shutdown => {}
        }
    }

    /// Write one queued frame, opening the transport first if needed
    ///
    /// Failures are logged and the frame is abandoned. A successful open
    /// here also ends a pending reconnect.
    async fn write_frame(&mut self, frame: OutboundFrame) {
        if !self.transport.is_open() {
            if let Err(e) = self.transport.open().await {
                self.stats.open_failures += 1;
                error!(frame = frame.frame_type().name(), error = %e, "Transport open failed, frame dropped");
                return;
            }
            if self.reconnect_state.take().is_some() {
                info!("Coordinator link restored");
            }
        }

        match self.transport.write(&frame).await {
            Ok(()) => {
                self.stats.frames_written += 1;
                trace!(frame = frame.frame_type().name(), "Frame written");
            }
            Err(e) => {
                self.stats.write_failures += 1;
                error!(frame = frame.frame_type().name(), error = %e, "Transport write failed, frame dropped");
            }
        }
    }

    /// Arm the first reopen attempt after the link went down
    ///
    /// Returns `cause` when reconnection is disabled.
    fn schedule_reconnect(&mut self, cause: XbeeError) -> Result<()> {
        if !self.reconnect.enabled {
            error!(error = %cause, "Transport lost and reconnection disabled");
            return Err(cause);
        }
        if self.reconnect_state.is_some() {
            return Ok(());
        }

        let delay = self.reconnect.initial_delay;
        warn!(
            delay = %humantime::format_duration(delay),
            "Coordinator link down, scheduling reconnect"
        );
        self.reconnect_state = Some(Reconnect {
            at: Instant::now() + delay,
            delay,
            attempt: 0,
        });
        Ok(())
    }

    /// One reopen attempt; on failure the next one is armed with a doubled
    /// delay
    ///
    /// Returns the open error once `max_attempts` is exhausted.
    async fn reopen(&mut self) -> Result<()> {
        let Some(mut state) = self.reconnect_state.take() else {
            return Ok(());
        };
        state.attempt += 1;
        warn!(attempt = state.attempt, "Attempting to reconnect to coordinator...");

        // Ignore close errors on a broken link
        let _ = self.transport.close().await;

        match self.transport.open().await {
            Ok(()) => {
                info!(attempt = state.attempt, "Successfully reconnected to coordinator");
                Ok(())
            }
            Err(e) => {
                self.stats.open_failures += 1;
                if self.reconnect.max_attempts != 0 && state.attempt >= self.reconnect.max_attempts {
                    error!(attempt = state.attempt, error = %e, "Giving up on coordinator");
                    return Err(e);
                }
                state.delay = (state.delay * 2).min(self.reconnect.max_delay);
                state.at = Instant::now() + state.delay;
                debug!(
                    attempt = state.attempt,
                    next = %humantime::format_duration(state.delay),
                    error = %e,
                    "Reconnect attempt failed"
                );
                self.reconnect_state = Some(state);
                Ok(())
            }
        }
    }
}

/// Backoff state while the coordinator link is down
#[derive(Debug, Clone, Copy)]
struct Reconnect {
    /// When the next attempt runs
    at: Instant,
    /// Delay that led to `at`
    delay: Duration,
    /// Attempts made so far
    attempt: u32,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
