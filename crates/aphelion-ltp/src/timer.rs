//! Deadline bookkeeping for both engines.
//!
//! Timers live in a slab and are addressed by generation-checked
//! handles, so a handle kept past cancellation can never fire a slot
//! that was reused for another session. The wheel never calls back;
//! the engines poll [`TimerWheel::expire`] from their service loop
//! and act on the kinds handed back.

use crate::wire::SessionId;
use slab::Slab;

/// What to do when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// No traffic on a receiving session for too long.
    Inactivity { session: SessionId },
    /// A reception report was not acked in time.
    ReportRetransmit { session: SessionId, report_serial: u64 },
    /// A checkpoint was not answered by a report in time.
    CheckpointRetransmit { session: SessionId, start_byte: u64 },
    /// A cancel was not acked in time.
    CancelRetransmit { session: SessionId },
}

impl TimerKind {
    pub fn session(&self) -> SessionId {
        match self {
            TimerKind::Inactivity { session }
            | TimerKind::ReportRetransmit { session, .. }
            | TimerKind::CheckpointRetransmit { session, .. }
            | TimerKind::CancelRetransmit { session } => *session,
        }
    }
}

/// Stable reference to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    deadline: u64,
    generation: u64,
    kind: TimerKind,
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    entries: Slab<Entry>,
    next_generation: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedules `kind` to come due at `deadline`.
    pub fn schedule(&mut self, deadline: u64, kind: TimerKind) -> TimerHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = self.entries.insert(Entry { deadline, generation, kind });
        TimerHandle { slot, generation }
    }

    /// Cancels a scheduled timer. Returns false if it already fired,
    /// was cancelled before, or the slot moved on to a new occupant.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.entries.get(handle.slot) {
            Some(entry) if entry.generation == handle.generation => {
                self.entries.remove(handle.slot);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns everything due at or before `now`, in
    /// deadline order.
    pub fn expire(&mut self, now: u64) -> Vec<TimerKind> {
        let mut due: Vec<(u64, usize)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(slot, entry)| (entry.deadline, slot))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, slot)| self.entries.remove(slot).kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(1, n)
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(30, TimerKind::Inactivity { session: sid(3) });
        wheel.schedule(10, TimerKind::Inactivity { session: sid(1) });
        wheel.schedule(20, TimerKind::Inactivity { session: sid(2) });

        let fired = wheel.expire(25);
        assert_eq!(
            fired,
            vec![
                TimerKind::Inactivity { session: sid(1) },
                TimerKind::Inactivity { session: sid(2) },
            ]
        );
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn not_yet_due_stays_scheduled() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(100, TimerKind::CancelRetransmit { session: sid(1) });
        assert!(wheel.expire(99).is_empty());
        assert_eq!(wheel.expire(100).len(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut wheel = TimerWheel::new();
        let h = wheel.schedule(5, TimerKind::Inactivity { session: sid(1) });
        assert!(wheel.cancel(h));
        assert!(!wheel.cancel(h));
        assert!(wheel.expire(10).is_empty());
    }

    #[test]
    fn stale_handle_cannot_cancel_reused_slot() {
        let mut wheel = TimerWheel::new();
        let h1 = wheel.schedule(5, TimerKind::Inactivity { session: sid(1) });
        wheel.cancel(h1);

        // slab reuses the slot for the next insert
        let h2 = wheel.schedule(7, TimerKind::CancelRetransmit { session: sid(2) });
        assert!(!wheel.cancel(h1));
        assert_eq!(wheel.len(), 1);
        assert!(wheel.cancel(h2));
    }

    #[test]
    fn expired_timer_carries_its_kind() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(
            1,
            TimerKind::CheckpointRetransmit { session: sid(9), start_byte: 2800 },
        );
        let fired = wheel.expire(1);
        assert_eq!(
            fired,
            vec![TimerKind::CheckpointRetransmit { session: sid(9), start_byte: 2800 }]
        );
    }
}
