//! Session registry for the in-memory network.
//!
//! Every dialed connection is one session, visible from both peers. A
//! session stays registered until the last peer view has reclaimed it, so
//! the registry length is the number of sessions the layer still holds
//! resources for.

use crate::net::PeerId;
use slab::Slab;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both peers hold the connection.
    Open,
    /// Closed by one side, waiting for the remote view to be reclaimed.
    Closing {
        /// Peer that issued the close.
        closer: PeerId,
    },
}

/// A registered session.
#[derive(Debug)]
pub struct Session {
    /// Monotonic connection id (slab slots are reused, ids are not).
    pub conn_id: u64,
    pub dialer: PeerId,
    pub listener: PeerId,
    pub state: SessionState,
}

impl Session {
    pub fn new(conn_id: u64, dialer: PeerId, listener: PeerId) -> Self {
        Self {
            conn_id,
            dialer,
            listener,
            state: SessionState::Open,
        }
    }

    /// Mark the session as closed by `closer`.
    pub fn close(&mut self, closer: PeerId) {
        self.state = SessionState::Closing { closer };
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open)
    }
}

/// Registry of sessions using slab allocation.
pub struct SessionRegistry {
    sessions: Slab<Session>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::new(),
            max_sessions,
        }
    }

    /// Insert a new session.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, session: Session) -> Option<usize> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        Some(self.sessions.insert(session))
    }

    pub fn get(&self, slot: usize) -> Option<&Session> {
        self.sessions.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.sessions.get_mut(slot)
    }

    /// Remove the session in `slot` if it still belongs to `conn_id`.
    pub fn remove(&mut self, slot: usize, conn_id: u64) -> Option<Session> {
        match self.get(slot) {
            Some(session) if session.conn_id == conn_id => Some(self.sessions.remove(slot)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn open_count(&self) -> usize {
        self.sessions.iter().filter(|(_, s)| s.is_open()).count()
    }
}
