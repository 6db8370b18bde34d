//! Bounded in-memory scrollback.
//!
//! The ring holds the most recent suffix of the child's cumulative output.
//! Writes never block and never fail; when full, the oldest bytes are
//! evicted. The session owns the lock around the ring, so the ring itself
//! carries no synchronisation.

use crate::config::DEFAULT_HISTORY_BUFFER_SIZE;

#[derive(Debug)]
pub struct HistoryRing {
    buf: Vec<u8>,
    capacity: usize,
    start: usize,
    len: usize,
}

impl HistoryRing {
    /// A zero capacity ring is not permitted; it is replaced by the default.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_HISTORY_BUFFER_SIZE
        } else {
            capacity
        };
        Self {
            buf: vec![0; capacity],
            capacity,
            start: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let n = data.len();
        if n >= self.capacity {
            self.buf.copy_from_slice(&data[n - self.capacity..]);
            self.start = 0;
            self.len = self.capacity;
            return;
        }

        let evict = (self.len + n).saturating_sub(self.capacity);
        let mut pos = (self.start + self.len) % self.capacity;
        for &byte in data {
            self.buf[pos] = byte;
            pos = (pos + 1) % self.capacity;
        }
        self.start = (self.start + evict) % self.capacity;
        self.len = (self.len + n).min(self.capacity);
    }

    /// Copy of the current contents in logical order, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        if self.start + self.len <= self.capacity {
            out.extend_from_slice(&self.buf[self.start..self.start + self.len]);
        } else {
            let head = self.capacity - self.start;
            out.extend_from_slice(&self.buf[self.start..]);
            out.extend_from_slice(&self.buf[..self.len - head]);
        }
        out
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
