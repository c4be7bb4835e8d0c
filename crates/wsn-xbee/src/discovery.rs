//! Node Discovery session
//!
//! A session broadcasts `ND`, waits one response window and re-broadcasts
//! while retries remain. It finishes as soon as every target has answered,
//! or when the last window expires with some targets still silent.
//!
//! The protocol does no I/O of its own: frames go through the
//! [`CommandDispatcher`], windows are armed on an injected [`Timer`], and the
//! owner feeds responses and timer expirations back in.

use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::{CommandDispatcher, FrameSink};
use crate::error::{Result, XbeeError};
use crate::frame::{Addr16, NodeKey};
use crate::registry::AddressRegistry;
use crate::timer::{Timer, TimerId};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Every target answered
    Complete,
    /// Retries ran out; these targets never answered
    Exhausted {
        /// Silent targets in request order
        undiscovered: Vec<NodeKey>,
    },
}

impl DiscoveryOutcome {
    /// `Ok` on completion, `DiscoveryExhausted` otherwise
    pub fn into_result(self) -> Result<()> {
        match self {
            DiscoveryOutcome::Complete => Ok(()),
            DiscoveryOutcome::Exhausted { undiscovered } => {
                Err(XbeeError::DiscoveryExhausted { undiscovered })
            }
        }
    }
}

/// Observable phase of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    /// No session
    Idle,
    /// Broadcast sent, window armed
    WaitingResponses {
        /// 0 for the first broadcast, then one per retry
        attempt: u32,
    },
}

#[derive(Debug)]
struct Session {
    targets: Vec<NodeKey>,
    responded: BTreeSet<NodeKey>,
    retries_left: u32,
    attempt: u32,
    window: Duration,
    timer: TimerId,
}

impl Session {
    fn is_complete(&self) -> bool {
        self.targets.iter().all(|k| self.responded.contains(k))
    }

    fn silent_targets(&self) -> Vec<NodeKey> {
        self.targets
            .iter()
            .filter(|k| !self.responded.contains(*k))
            .cloned()
            .collect()
    }
}

/// Result of feeding one ND response into the protocol
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseEffect {
    /// Whether the registry changed
    pub changed: bool,
    /// Set when this response completed the session
    pub outcome: Option<DiscoveryOutcome>,
}

/// Node Discovery state machine
#[derive(Debug, Default)]
pub struct DiscoveryProtocol {
    session: Option<Session>,
}

impl DiscoveryProtocol {
    /// Create an idle protocol
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is running
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Current phase
    pub fn phase(&self) -> DiscoveryPhase {
        match &self.session {
            None => DiscoveryPhase::Idle,
            Some(s) => DiscoveryPhase::WaitingResponses { attempt: s.attempt },
        }
    }

    /// Start a session
    ///
    /// Returns `Some(Complete)` without broadcasting when there is nothing
    /// to discover. Fails with `DiscoveryInProgress` while another session
    /// is running.
    pub fn start<S: FrameSink>(
        &mut self,
        targets: Vec<NodeKey>,
        max_retries: u32,
        window: Duration,
        timer: &mut impl Timer,
        dispatcher: &mut CommandDispatcher<S>,
    ) -> Result<Option<DiscoveryOutcome>> {
        if self.session.is_some() {
            return Err(XbeeError::DiscoveryInProgress);
        }
        if targets.is_empty() {
            return Ok(Some(DiscoveryOutcome::Complete));
        }

        info!(
            targets = targets.len(),
            max_retries,
            window = %humantime::format_duration(window),
            "Starting node discovery"
        );
        dispatcher.broadcast_node_discovery();
        let id = timer.schedule_once(window);

        self.session = Some(Session {
            targets,
            responded: BTreeSet::new(),
            retries_left: max_retries,
            attempt: 0,
            window,
            timer: id,
        });
        Ok(None)
    }

    /// Handle an ND response from `key`
    ///
    /// Marks the node discovered with its reported address. Responses while
    /// idle are ignored.
    pub fn on_response(
        &mut self,
        key: &NodeKey,
        addr16: Addr16,
        registry: &mut AddressRegistry,
        timer: &mut impl Timer,
    ) -> Result<ResponseEffect> {
        let Some(session) = self.session.as_mut() else {
            return Ok(ResponseEffect::default());
        };

        let mut changed = registry.set_addr16(key, addr16)?;
        changed |= registry.set_discovered(key, true)?;

        if session.targets.contains(key) && session.responded.insert(key.clone()) {
            debug!(
                %key,
                %addr16,
                responded = session.responded.len(),
                targets = session.targets.len(),
                "Node discovered"
            );
        }

        let mut effect = ResponseEffect {
            changed,
            outcome: None,
        };
        if session.is_complete() {
            timer.cancel(session.timer);
            info!(attempt = session.attempt, "Node discovery complete");
            self.session = None;
            effect.outcome = Some(DiscoveryOutcome::Complete);
        }
        Ok(effect)
    }

    /// Handle an expired timer
    ///
    /// Timers other than the current window are ignored. Re-broadcasts while
    /// retries remain, otherwise ends the session.
    pub fn on_timer<S: FrameSink>(
        &mut self,
        id: TimerId,
        timer: &mut impl Timer,
        dispatcher: &mut CommandDispatcher<S>,
    ) -> Option<DiscoveryOutcome> {
        let session = self.session.as_mut().filter(|s| s.timer == id)?;

        if session.retries_left > 0 {
            session.retries_left -= 1;
            session.attempt += 1;
            warn!(
                attempt = session.attempt,
                missing = session.targets.len() - session.responded.len(),
                "Discovery window expired, re-broadcasting"
            );
            dispatcher.broadcast_node_discovery();
            session.timer = timer.schedule_once(session.window);
            return None;
        }

        let undiscovered = session.silent_targets();
        warn!(undiscovered = ?undiscovered, "Node discovery exhausted");
        self.session = None;
        Some(DiscoveryOutcome::Exhausted { undiscovered })
    }

    /// Abandon the running session, disarming its timer
    pub fn abort(&mut self, timer: &mut impl Timer) -> Option<DiscoveryOutcome> {
        let session = self.session.take()?;
        timer.cancel(session.timer);
        Some(DiscoveryOutcome::Exhausted {
            undiscovered: session.silent_targets(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Addr64, AtCommand, OutboundFrame};
    use crate::test_utils::{ManualTimer, RecordingSink};

    const WINDOW: Duration = Duration::from_millis(8000);

    struct Fixture {
        registry: AddressRegistry,
        timer: ManualTimer,
        dispatcher: CommandDispatcher<RecordingSink>,
        discovery: DiscoveryProtocol,
    }

    fn key(k: &str) -> NodeKey {
        NodeKey::new(k)
    }

    fn fixture() -> Fixture {
        Fixture {
            registry: AddressRegistry::new(
                (key("xb0"), Addr64(0x0013_A200_40AF_B72D)),
                vec![
                    (key("xb1"), Addr64(0x0013_A200_40B3_2D72)),
                    (key("xb2"), Addr64(0x0013_A200_40B3_2D6C)),
                ],
            ),
            timer: ManualTimer::default(),
            dispatcher: CommandDispatcher::new(RecordingSink::default()),
            discovery: DiscoveryProtocol::new(),
        }
    }

    impl Fixture {
        fn start(&mut self, max_retries: u32) -> Result<Option<DiscoveryOutcome>> {
            self.discovery.start(
                vec![key("xb1"), key("xb2")],
                max_retries,
                WINDOW,
                &mut self.timer,
                &mut self.dispatcher,
            )
        }

        fn respond(&mut self, k: &str, addr16: u16) -> ResponseEffect {
            self.discovery
                .on_response(&key(k), Addr16(addr16), &mut self.registry, &mut self.timer)
                .unwrap()
        }

        fn expire(&mut self) -> Option<DiscoveryOutcome> {
            let id = self.timer.last_scheduled().unwrap();
            self.timer.fire(id);
            self.discovery
                .on_timer(id, &mut self.timer, &mut self.dispatcher)
        }

        fn nd_broadcasts(&self) -> usize {
            self.dispatcher
                .sink()
                .frames()
                .iter()
                .filter(|f| {
                    matches!(f, OutboundFrame::RemoteAtCommand {
                        destination64,
                        command,
                        ..
                    } if *destination64 == Addr64::BROADCAST && *command == AtCommand::ND)
                })
                .count()
        }
    }

    #[test]
    fn test_all_nodes_respond_within_window() {
        let mut f = fixture();
        assert_eq!(f.start(1).unwrap(), None);
        assert_eq!(f.nd_broadcasts(), 1);
        assert_eq!(f.timer.scheduled(), vec![WINDOW]);

        let first = f.respond("xb1", 0x1A2B);
        assert!(first.changed);
        assert_eq!(first.outcome, None);

        let second = f.respond("xb2", 0x3C4D);
        assert_eq!(second.outcome, Some(DiscoveryOutcome::Complete));
        assert!(f.timer.is_cancelled(f.timer.last_scheduled().unwrap()));
        assert_eq!(f.discovery.phase(), DiscoveryPhase::Idle);

        let xb2 = f.registry.node(&key("xb2")).unwrap();
        assert!(xb2.discovered());
        assert_eq!(xb2.addr16(), Addr16(0x3C4D));
        assert!(f.registry.undiscovered_keys().is_empty());
    }

    #[test]
    fn test_silent_node_exhausts_after_retry() {
        let mut f = fixture();
        f.start(1).unwrap();
        f.respond("xb1", 0x1A2B);

        assert_eq!(f.expire(), None);
        assert_eq!(f.nd_broadcasts(), 2);
        assert_eq!(f.discovery.phase(), DiscoveryPhase::WaitingResponses { attempt: 1 });
        assert_eq!(f.timer.scheduled(), vec![WINDOW, WINDOW]);

        assert_eq!(
            f.expire(),
            Some(DiscoveryOutcome::Exhausted {
                undiscovered: vec![key("xb2")]
            })
        );
        assert!(!f.discovery.is_active());
        assert!(f.registry.node(&key("xb1")).unwrap().discovered());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut f = fixture();
        f.start(1).unwrap();
        assert!(matches!(f.start(1), Err(XbeeError::DiscoveryInProgress)));
        assert_eq!(f.nd_broadcasts(), 1);
    }

    #[test]
    fn test_already_discovered_target_still_counts() {
        let mut f = fixture();
        f.registry.set_discovered(&key("xb1"), true).unwrap();
        f.registry.set_addr16(&key("xb1"), Addr16(0x1A2B)).unwrap();
        f.start(0).unwrap();

        let effect = f.respond("xb1", 0x1A2B);
        assert!(!effect.changed);
        assert_eq!(effect.outcome, None);
        assert_eq!(
            f.respond("xb2", 0x0042).outcome,
            Some(DiscoveryOutcome::Complete)
        );
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut f = fixture();
        f.start(1).unwrap();
        assert_eq!(
            f.discovery
                .on_timer(TimerId(999), &mut f.timer, &mut f.dispatcher),
            None
        );
        assert_eq!(f.nd_broadcasts(), 1);
    }

    #[test]
    fn test_response_while_idle_is_ignored() {
        let mut f = fixture();
        let effect = f.respond("xb1", 0x1A2B);
        assert_eq!(effect, ResponseEffect::default());
        assert!(!f.registry.node(&key("xb1")).unwrap().discovered());
    }

    #[test]
    fn test_empty_target_set_completes_immediately() {
        let mut f = fixture();
        let outcome = f
            .discovery
            .start(Vec::new(), 1, WINDOW, &mut f.timer, &mut f.dispatcher)
            .unwrap();
        assert_eq!(outcome, Some(DiscoveryOutcome::Complete));
        assert_eq!(f.nd_broadcasts(), 0);
    }

    #[test]
    fn test_exhausted_into_result() {
        let err = DiscoveryOutcome::Exhausted {
            undiscovered: vec![key("xb2")],
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(err, XbeeError::DiscoveryExhausted { undiscovered } if undiscovered == vec![key("xb2")]));
    }
}
