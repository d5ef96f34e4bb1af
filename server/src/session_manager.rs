//! Registry of live sessions for the file server
//!
//! This module tracks which connections are currently being served:
//! - Session id assignment for newly accepted sockets
//! - Peer address and connect time for logging and monitoring
//! - The connection limit, enforced before a session is started
//!
//! Sessions own their sockets and protocol state; the registry only holds
//! the metadata needed to answer "who is connected".

use crate::session::SessionId;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Metadata about one accepted connection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier assigned by the registry
    pub id: SessionId,
    /// Address of the connected client
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
}

impl SessionInfo {
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
        }
    }

    /// How long this session has been connected
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Tracks live sessions and enforces the connection limit
///
/// Shared between the accept loop, which registers new sessions, and the
/// session tasks, which remove themselves when they close.
pub struct SessionManager {
    /// Live sessions indexed by id
    sessions: HashMap<SessionId, SessionInfo>,
    /// Next id handed out to an accepted connection
    next_session_id: SessionId,
    /// Maximum number of concurrent sessions allowed
    max_sessions: usize,
}

impl SessionManager {
    /// Creates an empty registry. Session ids start from 1.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
        }
    }

    /// Registers a connection
    ///
    /// Returns the new session id, or None if the server is at capacity.
    pub fn add_session(&mut self, addr: SocketAddr) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let mut session_id = self.next_session_id;
        while self.sessions.contains_key(&session_id) {
            session_id = next_id(session_id);
        }
        self.next_session_id = next_id(session_id);

        info!("Session {} connected from {}", session_id, addr);
        self.sessions
            .insert(session_id, SessionInfo::new(session_id, addr));

        Some(session_id)
    }

    /// Removes a session, returning false if it was already gone
    pub fn remove_session(&mut self, session_id: &SessionId) -> bool {
        if let Some(session) = self.sessions.remove(session_id) {
            info!(
                "Session {} ({}) disconnected after {:.1}s",
                session.id,
                session.addr,
                session.uptime().as_secs_f32()
            );
            true
        } else {
            false
        }
    }

    /// Returns the number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Ids wrap back to 1; 0 is never handed out.
fn next_id(id: SessionId) -> SessionId {
    id.wrapping_add(1).max(1)
}
