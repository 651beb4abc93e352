//! Bounded table of live sessions.

use crate::session::{Session, SessionState};
use crate::wire::SessionId;
use std::collections::HashMap;

/// Sessions keyed by their wire id, capped at a configured ceiling.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    max_sessions: usize,
    peak: usize,
}

/// Live session counts by state, for snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub undefined: usize,
    pub transfer: usize,
    pub reporting: usize,
    pub cancelling: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self { sessions: HashMap::new(), max_sessions, peak: 0 }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    /// Most sessions ever live at once.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Inserts a session. Callers check [`Self::is_full`] first; an
    /// insert past the cap is refused.
    pub fn insert(&mut self, session: Session) -> bool {
        if self.is_full() {
            return false;
        }
        self.sessions.insert(session.id(), session);
        self.peak = self.peak.max(self.sessions.len());
        true
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for session in self.sessions.values() {
            match session.state() {
                SessionState::Undefined => counts.undefined += 1,
                SessionState::Transfer => counts.transfer += 1,
                SessionState::Reporting => counts.reporting += 1,
                SessionState::Cancelling => counts.cancelling += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRole;

    fn session(n: u64) -> Session {
        Session::new(SessionId::new(7, n), SessionRole::Receiver, 0)
    }

    #[test]
    fn cap_refuses_further_inserts() {
        let mut reg = SessionRegistry::new(2);
        assert!(reg.insert(session(1)));
        assert!(reg.insert(session(2)));
        assert!(reg.is_full());
        assert!(!reg.insert(session(3)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn peak_survives_removal() {
        let mut reg = SessionRegistry::new(10);
        reg.insert(session(1));
        reg.insert(session(2));
        reg.remove(SessionId::new(7, 1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.peak(), 2);
    }

    #[test]
    fn state_counts_track_transitions() {
        let mut reg = SessionRegistry::new(10);
        reg.insert(session(1));
        reg.insert(session(2));
        reg.get_mut(SessionId::new(7, 2))
            .expect("session present")
            .set_state(SessionState::Transfer);

        let counts = reg.state_counts();
        assert_eq!(counts.undefined, 1);
        assert_eq!(counts.transfer, 1);
        assert_eq!(counts.cancelling, 0);
    }
}
