//! Circular buffer for stream replay on session reattach.
//!
//! Stores the last N bytes of PTY output and addresses them by absolute
//! stream offset, so a reconnecting client can ask for exactly the bytes
//! after its last cursor without the server keeping unbounded history.

/// A fixed-capacity circular byte buffer with monotonic write accounting.
///
/// The readable range is always `[total_written - len(), total_written)`;
/// anything older has been overwritten.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Next write position, always in `[0, capacity)`.
    write_pos: usize,
    /// Total bytes ever appended. Never decreases.
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    ///
    /// A zero capacity is a configuration error and is rejected when the
    /// config is loaded, never here.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append a chunk, discarding the oldest bytes once capacity is exceeded.
    pub fn append(&mut self, chunk: &[u8]) {
        let len = chunk.len();

        if len >= self.capacity {
            // Only the tail survives.
            self.buf.copy_from_slice(&chunk[len - self.capacity..]);
            self.write_pos = 0;
        } else {
            let room = self.capacity - self.write_pos;
            if len <= room {
                self.buf[self.write_pos..self.write_pos + len].copy_from_slice(chunk);
                self.write_pos += len;
                if self.write_pos == self.capacity {
                    self.write_pos = 0;
                }
            } else {
                self.buf[self.write_pos..].copy_from_slice(&chunk[..room]);
                self.buf[..len - room].copy_from_slice(&chunk[room..]);
                self.write_pos = len - room;
            }
        }

        self.total_written += len as u64;
    }

    /// Read everything from absolute offset `from` up to the write head.
    ///
    /// Offsets older than the retained window are moved forward to the
    /// oldest byte still held. Returns `None` when there is nothing newer
    /// than `from`, which includes cursors pointing past the write head.
    pub fn read(&self, from: u64) -> Option<Vec<u8>> {
        let effective_from = from.max(self.start_offset());
        if effective_from >= self.total_written {
            return None;
        }

        let n = (self.total_written - effective_from) as usize;
        let start = (self.write_pos + self.capacity - n) % self.capacity;

        let mut out = Vec::with_capacity(n);
        if start + n <= self.capacity {
            out.extend_from_slice(&self.buf[start..start + n]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..n - (self.capacity - start)]);
        }
        Some(out)
    }

    /// Absolute offset of the oldest byte still retained.
    pub fn start_offset(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity as u64)
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        (self.total_written - self.start_offset()) as usize
    }

    /// Whether nothing has ever been written.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    #[cfg(test)]
    fn write_pos(&self) -> usize {
        self.write_pos
    }
}
