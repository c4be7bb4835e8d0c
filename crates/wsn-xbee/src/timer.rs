//! One-shot timers for the discovery protocol
//!
//! The protocol only needs "call me back after `d`" and "never mind". The
//! controller drives [`DeadlineTimer`] from its event loop; tests use
//! [`crate::test_utils::ManualTimer`] and fire timers by hand.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// Schedule-once and cancel primitives
pub trait Timer {
    /// Arm a timer that fires once after `after`
    fn schedule_once(&mut self, after: Duration) -> TimerId;

    /// Disarm a timer; cancelling a fired or cancelled timer does nothing
    fn cancel(&mut self, id: TimerId);
}

/// Timer set backed by tokio instants
#[derive(Debug, Default)]
pub struct DeadlineTimer {
    next_id: u64,
    armed: BTreeMap<TimerId, Instant>,
}

impl DeadlineTimer {
    /// Create an empty timer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .armed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.armed.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        self.armed.len()
    }
}

impl Timer for DeadlineTimer {
    fn schedule_once(&mut self, after: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.armed.insert(id, Instant::now() + after);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.armed.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_timer_expiry() {
        let mut timer = DeadlineTimer::new();
        let late = timer.schedule_once(Duration::from_secs(8));
        let early = timer.schedule_once(Duration::from_secs(2));
        assert_eq!(timer.armed(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(timer.take_expired(Instant::now()), vec![early]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(timer.take_expired(Instant::now()), vec![late]);
        assert!(timer.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let mut timer = DeadlineTimer::new();
        let id = timer.schedule_once(Duration::from_secs(1));
        timer.cancel(id);
        timer.cancel(id);
        assert_eq!(timer.armed(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(timer.take_expired(Instant::now()).is_empty());
    }
}
