use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Default number of output chunks retained per session.
pub const DEFAULT_HISTORY_CHUNKS: usize = 1000;

/// Bounded FIFO of raw output chunks.
///
/// Eviction is by chunk count, not byte count: once more than `capacity`
/// chunks are held, whole chunks are dropped from the front.
#[derive(Debug)]
pub struct OutputHistory {
    chunks: VecDeque<Bytes>,
    capacity: usize,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CHUNKS)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.capacity {
            self.chunks.pop_front();
        }
    }

    /// Concatenation of all retained chunks in arrival order.
    pub fn concat(&self) -> Bytes {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutputHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CHUNKS)
    }
}
