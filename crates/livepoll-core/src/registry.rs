// Session registry: who is connected and in which role.

use std::collections::HashMap;

use tracing::debug;

use crate::protocol::{ConnectionId, Role};

/// One connected participant. Name and role stay `None` until the
/// participant announces itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    pub display_name: Option<String>,
    pub role: Option<Role>,
}

impl Participant {
    pub fn is_student(&self) -> bool {
        self.role == Some(Role::Student)
    }
}

/// Tracks live connections. Nothing survives a closed connection; a
/// reconnecting participant must announce again.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    participants: HashMap<ConnectionId, Participant>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an anonymous entry for a freshly opened connection.
    pub fn on_connect(&mut self, conn: ConnectionId) {
        self.participants.entry(conn).or_default();
    }

    /// Record the name and role declared by a connection.
    ///
    /// Re-announcing replaces the previous values, so a connection is counted
    /// at most once regardless of how often it announces. Announcing on an
    /// unknown connection registers it.
    pub fn announce(&mut self, conn: ConnectionId, display_name: String, role: Role) {
        let entry = self.participants.entry(conn).or_default();
        if let Some(previous) = entry.role {
            if previous != role {
                debug!("Connection {} changed role {} -> {}", conn, previous, role);
            }
        }
        entry.display_name = Some(display_name);
        entry.role = Some(role);
    }

    /// Drop a closed connection, returning what was known about it.
    pub fn on_disconnect(&mut self, conn: ConnectionId) -> Option<Participant> {
        self.participants.remove(&conn)
    }

    /// Number of connections currently announced as students. Derived from
    /// the live entries, so it can never go negative.
    pub fn student_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_student()).count()
    }

    pub fn connection_count(&self) -> usize {
        self.participants.len()
    }
}
