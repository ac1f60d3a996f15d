//! Bounded scrollback for terminal output
//!
//! Sessions push every chunk here regardless of subscribers. Once the ring
//! is full the oldest bytes are dropped, so a missing reader never stalls
//! the backend.

use std::collections::VecDeque;

use bytes::Bytes;

pub struct OutputRing {
    bytes: VecDeque<u8>,
    capacity: usize,
    /// Total bytes evicted since the session started
    dropped: u64,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a chunk, evicting from the front when over capacity
    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }

        // Only the tail of an oversized chunk can survive
        let chunk = if chunk.len() > self.capacity {
            self.dropped += (chunk.len() - self.capacity) as u64;
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(chunk);
    }

    /// Copy of the buffered bytes, oldest first
    pub fn snapshot(&self) -> Bytes {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_newest_bytes() {
        let mut ring = OutputRing::new(8);
        ring.push(b"hello ");
        ring.push(b"world");

        assert_eq!(ring.snapshot(), Bytes::from_static(b"lo world"));
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.dropped(), 3);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut ring = OutputRing::new(4);
        ring.push(b"ab");
        ring.push(b"0123456789");

        assert_eq!(ring.snapshot(), Bytes::from_static(b"6789"));
        assert_eq!(ring.dropped(), 8);
    }

    #[test]
    fn test_zero_capacity_drops_everything() {
        let mut ring = OutputRing::new(0);
        ring.push(b"abc");
        assert!(ring.is_empty());
        assert_eq!(ring.dropped(), 3);
    }
}
