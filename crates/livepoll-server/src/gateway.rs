// Broadcast gateway: the single fan-out point from the poll loop to
// connected participants.
//
// Delivery never awaits. Each connection owns a bounded outbound queue that a
// transport writer drains. A connection whose queue is full has fallen behind
// and is evicted: its queue is closed, the transport drops the socket, and the
// client resyncs from the snapshot sent when it announces again.

use std::collections::HashMap;

use livepoll_core::protocol::{ConnectionId, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Outbound queue handle for one connection.
pub type Outbound = mpsc::Sender<ServerMessage>;

#[derive(Debug, Default)]
pub struct BroadcastGateway {
    outbound: HashMap<ConnectionId, Outbound>,
}

/// Result of handing one event to one queue.
enum Delivery {
    Queued,
    Lagging,
    Gone,
}

impl BroadcastGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conn: ConnectionId, tx: Outbound) {
        if self.outbound.insert(conn, tx).is_some() {
            warn!("Connection {} registered twice, replacing its outbound queue", conn);
        }
    }

    pub fn unregister(&mut self, conn: ConnectionId) {
        self.outbound.remove(&conn);
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }

    /// Deliver `msg` to one connection. Returns whether it was queued.
    pub fn send_to(&mut self, conn: ConnectionId, msg: ServerMessage) -> bool {
        let Some(tx) = self.outbound.get(&conn) else {
            debug!("No outbound queue for connection {}, dropping event", conn);
            return false;
        };
        match deliver(tx, msg) {
            Delivery::Queued => true,
            Delivery::Lagging => {
                self.evict(conn);
                false
            }
            Delivery::Gone => false,
        }
    }

    /// Deliver `msg` to every registered connection. Returns how many
    /// connections it was queued for.
    pub fn broadcast_all(&mut self, msg: &ServerMessage) -> usize {
        let mut queued = 0;
        let mut lagging = Vec::new();
        for (conn, tx) in &self.outbound {
            match deliver(tx, msg.clone()) {
                Delivery::Queued => queued += 1,
                Delivery::Lagging => lagging.push(*conn),
                Delivery::Gone => {}
            }
        }
        for conn in lagging {
            self.evict(conn);
        }
        queued
    }

    /// Dropping the only sender closes the queue. The writer flushes what is
    /// already queued, then closes the socket.
    fn evict(&mut self, conn: ConnectionId) {
        warn!("Outbound queue full for connection {}, disconnecting it", conn);
        self.outbound.remove(&conn);
    }
}

fn deliver(tx: &Outbound, msg: ServerMessage) -> Delivery {
    match tx.try_send(msg) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(_)) => Delivery::Lagging,
        // Writer already gone; the transport's disconnect event cleans up.
        Err(TrySendError::Closed(_)) => Delivery::Gone,
    }
}
