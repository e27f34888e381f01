use std::collections::VecDeque;

/// Bounded tail of a session's output.
///
/// Only the most recent `capacity` bytes survive; older output is dropped
/// from the front. A client reconnecting after a long silence replays the
/// tail, not the transcript.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.data.clear();
            self.data.extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }

        self.data.extend(bytes);
        let excess = self.data.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.data.drain(..excess);
        }
    }

    /// Contiguous copy of the buffered bytes; the buffer keeps accumulating.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
