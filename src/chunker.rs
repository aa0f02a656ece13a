//! Streaming chunk splitter for object uploads.
//!
//! The splitter buffers incoming byte runs and drains full chunks of the
//! bucket's configured size, keeping memory bounded at roughly one chunk
//! plus the current input run. A rolling digest over the whole stream is
//! maintained in input order for the object-level digest.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Digest algorithm name as stored in object metadata.
pub const DIGEST_ALGORITHM: &str = "SHA-256";

/// Hex digest of a single buffer. Used for content-addressing chunks.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Splits an incoming byte stream into fixed-size chunks.
pub struct Chunker {
    chunk_size: usize,
    buf: BytesMut,
    hasher: Sha256,
    total: u64,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            chunk_size,
            buf: BytesMut::with_capacity(chunk_size),
            hasher: Sha256::new(),
            total: 0,
        }
    }

    /// Total bytes accepted so far, including buffered leftover.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Feeds a byte run and drains every full chunk it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.total += data.len() as u64;
        self.hasher.update(data);
        self.buf.extend_from_slice(data);

        let mut chunks = Vec::new();
        while self.buf.len() >= self.chunk_size {
            chunks.push(self.buf.split_to(self.chunk_size).freeze());
        }
        chunks
    }

    /// Ends the stream, returning the final short chunk (if any) and the
    /// object-level hex digest.
    pub fn finish(self) -> (Option<Bytes>, String) {
        let leftover = if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.freeze())
        };
        (leftover, hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_emit_full_chunks_and_keep_leftover() {
        // given
        let mut chunker = Chunker::new(4);

        // when - 10 bytes in runs of 3
        let mut chunks = Vec::new();
        chunks.extend(chunker.push(b"abc"));
        chunks.extend(chunker.push(b"def"));
        chunks.extend(chunker.push(b"ghij"));
        let (leftover, _) = chunker.finish();

        // then
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"abcd");
        assert_eq!(&chunks[1][..], b"efgh");
        assert_eq!(leftover.as_deref(), Some(&b"ij"[..]));
    }

    #[test]
    fn should_emit_multiple_chunks_from_one_large_run() {
        // given
        let mut chunker = Chunker::new(2);

        // when
        let chunks = chunker.push(b"abcdefg");
        let (leftover, _) = chunker.finish();

        // then
        assert_eq!(chunks.len(), 3);
        assert_eq!(leftover.as_deref(), Some(&b"g"[..]));
    }

    #[test]
    fn should_have_no_leftover_on_exact_multiple() {
        // given
        let mut chunker = Chunker::new(4);

        // when
        let chunks = chunker.push(b"abcdefgh");
        let (leftover, _) = chunker.finish();

        // then
        assert_eq!(chunks.len(), 2);
        assert!(leftover.is_none());
    }

    #[test]
    fn should_track_total_bytes() {
        // given
        let mut chunker = Chunker::new(1024);

        // when
        chunker.push(b"hello");
        chunker.push(b", world");

        // then
        assert_eq!(chunker.total_bytes(), 12);
    }

    #[test]
    fn should_digest_stream_in_input_order() {
        // given - the same bytes pushed in different run sizes
        let data = b"0123456789ABCDEFGHIJ";
        let mut a = Chunker::new(3);
        let mut b = Chunker::new(7);
        a.push(&data[..5]);
        a.push(&data[5..]);
        b.push(data);

        // when
        let (_, digest_a) = a.finish();
        let (_, digest_b) = b.finish();

        // then - run boundaries and chunk size do not affect the digest
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a, digest_hex(data));
    }

    #[test]
    fn should_digest_empty_stream() {
        // given
        let chunker = Chunker::new(4);

        // when
        let (leftover, digest) = chunker.finish();

        // then
        assert!(leftover.is_none());
        assert_eq!(digest, digest_hex(b""));
    }
}
