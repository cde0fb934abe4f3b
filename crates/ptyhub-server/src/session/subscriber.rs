//! Attached viewers and their stream cursors.

use ptyhub_core::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Process-unique id of one attach connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A message queued for a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw terminal bytes (binary frame).
    Data(Vec<u8>),
    /// JSON control frame (text frame).
    Control(ServerFrame),
    /// Close the transport with this code and reason; nothing follows.
    Close { code: u16, reason: &'static str },
}

/// The session-side end of one attach connection.
///
/// Sending never blocks: messages queue in order and the transport task
/// drains them.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its transport task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns `false` if the transport is gone.
    pub fn send(&self, msg: Outbound) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    conn: ConnectionHandle,
    /// Stream offset this subscriber has been sent bytes up to.
    cursor: u64,
}

/// The subscribers of one session, keyed by connection.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    entries: HashMap<ConnectionId, Subscriber>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection at `cursor`, replacing any previous entry.
    pub fn insert(&mut self, conn: ConnectionHandle, cursor: u64) {
        self.entries.insert(conn.id(), Subscriber { conn, cursor });
    }

    /// Remove a connection. Returns whether it was present.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    #[cfg(test)]
    pub fn cursor(&self, id: ConnectionId) -> Option<u64> {
        self.entries.get(&id).map(|s| s.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver a chunk to everyone and advance their cursors to `total`.
    /// Connections whose transport has gone away are dropped.
    pub fn broadcast_data(&mut self, chunk: &[u8], total: u64) {
        self.entries.retain(|id, sub| {
            if sub.conn.send(Outbound::Data(chunk.to_vec())) {
                sub.cursor = total;
                true
            } else {
                debug!(connection = id, "dropping dead subscriber");
                false
            }
        });
    }

    /// Deliver a control frame to everyone.
    pub fn broadcast_control(&mut self, frame: &ServerFrame) {
        self.entries.retain(|id, sub| {
            let alive = sub.conn.send(Outbound::Control(frame.clone()));
            if !alive {
                debug!(connection = id, "dropping dead subscriber");
            }
            alive
        });
    }

    /// Close every connection and empty the set.
    pub fn close_all(&mut self, code: u16, reason: &'static str) {
        for (_, sub) in self.entries.drain() {
            sub.conn.send(Outbound::Close { code, reason });
        }
    }
}
