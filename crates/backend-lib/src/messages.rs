// ================
// crates/backend-lib/src/messages.rs
// ================
//! Wire types plus the per-connection role state.
pub use pika_common::{
    ClientMessage, Envelope, ServerMessage, SessionId, TempoDirection, TrackInfo,
};

/// What a connection has established itself as
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionRole {
    /// No role-establishing message yet
    #[default]
    Pending,
    Dj {
        session_id: SessionId,
    },
    Listener {
        session_id: SessionId,
        client_id: Option<String>,
    },
}

/// `OPEN -> (DJ | LISTENER) -> CLOSED`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub role: ConnectionRole,
    pub closed: bool,
}

impl ConnectionState {
    pub fn dj_session(&self) -> Option<&str> {
        match &self.role {
            ConnectionRole::Dj { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn listener_session(&self) -> Option<&str> {
        match &self.role {
            ConnectionRole::Listener { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// The client id a listener subscribed with
    pub fn listener_client_id(&self) -> Option<&str> {
        match &self.role {
            ConnectionRole::Listener { client_id, .. } => client_id.as_deref(),
            _ => None,
        }
    }

    pub fn become_dj(&mut self, session_id: impl Into<SessionId>) {
        self.role = ConnectionRole::Dj {
            session_id: session_id.into(),
        };
    }

    pub fn become_listener(&mut self, session_id: impl Into<SessionId>, client_id: Option<String>) {
        self.role = ConnectionRole::Listener {
            session_id: session_id.into(),
            client_id,
        };
    }

    /// Mark the connection closed; returns the role it held, once
    pub fn close(&mut self) -> Option<ConnectionRole> {
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(std::mem::take(&mut self.role))
    }
}
