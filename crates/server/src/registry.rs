//! Peer registry.
//!
//! Tracks admitted sessions in admission order. Session ids come from a
//! monotonic counter and are never handed out twice within a process.

use crate::transport::ConnectionHandle;
use protocol::{Position, SessionId};
use thiserror::Error;
use tracing::debug;

/// Why a connection was not promoted to a session.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AdmissionRejected {
    #[error("Server full ({capacity} sessions)")]
    Full { capacity: usize },

    #[error("Session ids exhausted")]
    IdsExhausted,
}

/// One connected client's server-side state.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Server-assigned id.
    pub id: SessionId,
    /// Transport connection this session arrived on.
    pub handle: ConnectionHandle,
    /// Last reported position. Not validated.
    pub position: Position,
}

impl Session {
    fn new(id: SessionId, handle: ConnectionHandle) -> Self {
        Self {
            id,
            handle,
            position: Position::ZERO,
        }
    }
}

/// Connected sessions, bounded by a fixed capacity.
#[derive(Debug)]
pub struct PeerRegistry {
    sessions: Vec<Session>,
    next_session_id: SessionId,
    capacity: usize,
}

impl PeerRegistry {
    /// Session ids start from 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Vec::with_capacity(capacity),
            next_session_id: 1,
            capacity,
        }
    }

    /// Admit a new session for `handle`.
    ///
    /// At capacity nothing is stored and no id is consumed.
    pub fn admit(&mut self, handle: ConnectionHandle) -> Result<SessionId, AdmissionRejected> {
        if self.is_full() {
            return Err(AdmissionRejected::Full {
                capacity: self.capacity,
            });
        }

        let id = self.next_session_id;
        self.next_session_id = id
            .checked_add(1)
            .ok_or(AdmissionRejected::IdsExhausted)?;

        self.sessions.push(Session::new(id, handle));
        debug!("Session {} admitted on {}", id, handle);
        Ok(id)
    }

    /// Remove a session. Unknown ids return `None`.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        // Vec::remove keeps admission order for snapshots.
        let session = self.sessions.remove(index);
        debug!("Session {} removed ({})", id, session.handle);
        Some(session)
    }

    /// Overwrite a session's position. Returns false for unknown ids.
    pub fn update_position(&mut self, id: SessionId, position: Position) -> bool {
        match self.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.position = position;
                true
            }
            None => false,
        }
    }

    pub fn find(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn find_by_handle(&self, handle: ConnectionHandle) -> Option<&Session> {
        self.sessions.iter().find(|s| s.handle == handle)
    }

    /// Whether `id` has ever been handed out, live or not.
    pub fn was_assigned(&self, id: SessionId) -> bool {
        id != 0 && id < self.next_session_id
    }

    /// Sessions in admission order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
