//! Per-session output stream: ring buffer, subscribers and idle state.
//!
//! All three are mutated together under the session lock, so an attach
//! (register + replay) can never interleave with an append + broadcast.
//! Every viewer therefore sees each byte exactly once.

use super::idle::{IdleDetector, Rearm};
use super::ring_buffer::RingBuffer;
use super::subscriber::{ConnectionHandle, ConnectionId, Outbound, SubscriberSet};
use ptyhub_core::{ServerFrame, CLOSE_NORMAL};
use std::time::{Duration, Instant};
use tracing::debug;

/// Reason sent with the normal closure when the process ends.
pub const REASON_EXITED: &str = "process exited";
/// Reason sent with the normal closure when the session is destroyed.
pub const REASON_DESTROYED: &str = "session destroyed";

/// Bounds on what a reattaching client is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayLimits {
    /// Most recent bytes replayed at most.
    pub max_burst: u64,
    /// Size of each replay frame.
    pub chunk_size: usize,
}

/// What an attach delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Absolute offset of the first replayed byte.
    pub replay_from: u64,
    /// Number of bytes replayed.
    pub replayed: usize,
    /// The subscriber's live cursor.
    pub cursor: u64,
}

#[derive(Debug)]
pub struct OutputState {
    ring: RingBuffer,
    subscribers: SubscriberSet,
    idle: IdleDetector,
    /// `Some` once the process has exited, holding its exit code.
    exit: Option<Option<u32>>,
}

impl OutputState {
    pub fn new(ring_capacity: usize, idle_threshold: Duration) -> Self {
        Self {
            ring: RingBuffer::new(ring_capacity),
            subscribers: SubscriberSet::new(),
            idle: IdleDetector::new(idle_threshold),
            exit: None,
        }
    }

    /// Append a chunk, fan it out, and reset the silence timer.
    ///
    /// The caller arms a timer per the returned [`Rearm`].
    pub fn on_output(&mut self, chunk: &[u8], now: Instant) -> Rearm {
        let rearm = self.idle.on_output(now);
        if rearm.became_active {
            debug!("session active");
            self.subscribers.broadcast_control(&ServerFrame::Active);
        }
        self.ring.append(chunk);
        self.subscribers
            .broadcast_data(chunk, self.ring.total_written());
        rearm
    }

    /// The silence timer for `generation` fired.
    pub fn on_idle_timer(&mut self, generation: u64) -> bool {
        if !self.idle.on_timer(generation) {
            return false;
        }
        debug!("session idle");
        self.subscribers.broadcast_control(&ServerFrame::Idle);
        true
    }

    /// Register a connection live and replay what it is missing.
    ///
    /// Replay covers `[max(client_cursor, total - max_burst), total)`,
    /// further clipped to what the ring still holds, sent in
    /// `chunk_size` frames between `replay-start` and `replay-done`.
    /// A `cursor` frame always follows.
    pub fn attach(
        &mut self,
        conn: &ConnectionHandle,
        client_cursor: u64,
        limits: ReplayLimits,
    ) -> AttachOutcome {
        let total = self.ring.total_written();
        self.subscribers.insert(conn.clone(), total);

        let mut outcome = AttachOutcome {
            replay_from: total,
            replayed: 0,
            cursor: total,
        };

        if client_cursor < total {
            let start = client_cursor.max(total.saturating_sub(limits.max_burst));
            if let Some(bytes) = self.ring.read(start) {
                let from = total - bytes.len() as u64;
                conn.send(Outbound::Control(ServerFrame::ReplayStart {
                    from,
                    to: total,
                    truncated: from > client_cursor,
                }));
                for chunk in bytes.chunks(limits.chunk_size.max(1)) {
                    conn.send(Outbound::Data(chunk.to_vec()));
                }
                conn.send(Outbound::Control(ServerFrame::ReplayDone));
                outcome.replay_from = from;
                outcome.replayed = bytes.len();
            }
        }

        conn.send(Outbound::Control(ServerFrame::Cursor { cursor: total }));

        if let Some(code) = self.exit {
            conn.send(Outbound::Control(ServerFrame::Exit { code }));
            conn.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: REASON_EXITED,
            });
            self.subscribers.remove(conn.id());
        }

        outcome
    }

    pub fn detach(&mut self, id: ConnectionId) -> bool {
        self.subscribers.remove(id)
    }

    /// The process ended: notify and close every viewer.
    pub fn on_exit(&mut self, code: Option<u32>) {
        self.exit = Some(code);
        self.idle.disarm();
        self.subscribers
            .broadcast_control(&ServerFrame::Exit { code });
        self.subscribers.close_all(CLOSE_NORMAL, REASON_EXITED);
    }

    /// Tear down for session destruction.
    pub fn shutdown(&mut self, code: u16, reason: &'static str) {
        self.idle.disarm();
        self.subscribers.close_all(code, reason);
    }

    pub fn configure_idle(&mut self, threshold: Duration) {
        self.idle.configure(threshold);
    }

    pub fn total_written(&self) -> u64 {
        self.ring.total_written()
    }

    /// Bytes of history currently held for replay.
    pub fn retained(&self) -> usize {
        self.ring.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    pub fn idle(&self) -> &IdleDetector {
        &self.idle
    }

    #[cfg(test)]
    pub fn cursor_of(&self, id: ConnectionId) -> Option<u64> {
        self.subscribers.cursor(id)
    }
}
