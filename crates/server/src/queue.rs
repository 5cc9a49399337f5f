//! Chunk streaming queue.
//!
//! FIFO of terrain requests. The server drains one request per tick, so
//! generation cost per tick stays bounded no matter how deep the queue gets.
//! Depth itself is capped globally and per session.

use protocol::{ChunkPosition, SessionId};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// A pending request for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub position: ChunkPosition,
    pub session_id: SessionId,
}

/// Why a request was not queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueRejected {
    #[error("Chunk queue full ({limit} pending)")]
    QueueFull { limit: usize },

    #[error("Session {session_id} has {limit} chunk requests pending")]
    SessionLimit { session_id: SessionId, limit: usize },
}

#[derive(Debug)]
pub struct ChunkQueue {
    requests: VecDeque<ChunkRequest>,
    pending_per_session: HashMap<SessionId, usize>,
    max_pending: usize,
    max_pending_per_session: usize,
}

impl ChunkQueue {
    pub fn new(max_pending: usize, max_pending_per_session: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            pending_per_session: HashMap::new(),
            max_pending,
            max_pending_per_session,
        }
    }

    /// Append a request, or reject it if a cap is reached.
    pub fn enqueue(&mut self, request: ChunkRequest) -> Result<(), QueueRejected> {
        if self.requests.len() >= self.max_pending {
            return Err(QueueRejected::QueueFull {
                limit: self.max_pending,
            });
        }

        if self.pending_for(request.session_id) >= self.max_pending_per_session {
            return Err(QueueRejected::SessionLimit {
                session_id: request.session_id,
                limit: self.max_pending_per_session,
            });
        }

        *self
            .pending_per_session
            .entry(request.session_id)
            .or_insert(0) += 1;
        self.requests.push_back(request);
        Ok(())
    }

    /// Pop the oldest request.
    pub fn drain_one(&mut self) -> Option<ChunkRequest> {
        let request = self.requests.pop_front()?;
        if let Some(pending) = self.pending_per_session.get_mut(&request.session_id) {
            *pending -= 1;
            if *pending == 0 {
                self.pending_per_session.remove(&request.session_id);
            }
        }
        Some(request)
    }

    pub fn pending_for(&self, session_id: SessionId) -> usize {
        self.pending_per_session
            .get(&session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
