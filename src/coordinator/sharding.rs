//! Upload sharding pipeline.
//!
//! Buffers an incoming byte stream into fixed-size chunks. Chunk boundaries
//! are byte-exact: every chunk except possibly the last is exactly
//! `chunk_size` long, and shard order follows stream order.

use bytes::{Bytes, BytesMut};

pub struct Chunker {
    chunk_size: usize,
    buf: BytesMut,
    total: u64,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            buf: BytesMut::new(),
            total: 0,
        }
    }

    /// Feed stream data in; returns every chunk completed by this push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.total += data.len() as u64;
        self.buf.extend_from_slice(data);

        let mut complete = Vec::new();
        while self.buf.len() >= self.chunk_size {
            complete.push(self.buf.split_to(self.chunk_size).freeze());
        }
        complete
    }

    /// Drain the trailing partial chunk, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    /// Total bytes pushed so far.
    pub fn total_len(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_fixed_chunks() {
        let mut chunker = Chunker::new(5);
        let chunks = chunker.push(b"hello world!");
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"hello");
        assert_eq!(&chunks[1][..], b" worl");
        assert_eq!(chunker.finish().unwrap(), Bytes::from_static(b"d!"));
        assert_eq!(chunker.total_len(), 12);
    }

    #[test]
    fn exact_multiple_leaves_no_tail() {
        let mut chunker = Chunker::new(4);
        let chunks = chunker.push(b"abcdefgh");
        assert_eq!(chunks.len(), 2);
        assert!(chunker.finish().is_none());
    }

    #[test]
    fn input_of_exactly_one_chunk_produces_one_shard() {
        let mut chunker = Chunker::new(8);
        let chunks = chunker.push(b"12345678");
        assert_eq!(chunks.len(), 1);
        assert!(chunker.finish().is_none());
        assert_eq!(chunker.total_len(), 8);
    }

    #[test]
    fn empty_input_produces_nothing() {
        let mut chunker = Chunker::new(8);
        assert!(chunker.push(b"").is_empty());
        assert!(chunker.finish().is_none());
        assert_eq!(chunker.total_len(), 0);
    }

    #[test]
    fn accumulates_across_pushes() {
        let mut chunker = Chunker::new(6);
        assert!(chunker.push(b"abc").is_empty());
        let chunks = chunker.push(b"defgh");
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"abcdef");
        assert_eq!(chunker.finish().unwrap(), Bytes::from_static(b"gh"));
    }
}
