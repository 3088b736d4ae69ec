use std::collections::VecDeque;

/// Bounded FIFO of output chunks; pushing onto a full buffer evicts the oldest chunk.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, chunk: String) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
            self.evicted += 1;
        }
        self.chunks.push_back(chunk);
    }

    /// The last `n` chunks in arrival order.
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let skip = self.chunks.len().saturating_sub(n);
        self.chunks.iter().skip(skip).map(String::as_str).collect()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
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

    /// Chunks dropped since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
