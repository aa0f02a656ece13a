//! Byte-range handling for object downloads.
//!
//! Parses `Range: bytes=...` headers, resolves them against an object's size,
//! and computes the chunk window a resolved range touches. Only single
//! ranges are supported; multipart ranges are rejected at parse time.

/// A parsed (unresolved) byte range from a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, both bounds inclusive.
    Bounded(u64, u64),
    /// `bytes=a-`, from offset to end of object.
    From(u64),
    /// `bytes=-n`, the final `n` bytes.
    Suffix(u64),
}

/// A range resolved against a concrete object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub offset: u64,
    pub length: u64,
}

impl ResolvedRange {
    /// Inclusive end offset, as used in `Content-Range`.
    pub fn end(&self) -> u64 {
        self.offset + self.length - 1
    }

    /// `Content-Range` header value for a satisfiable range.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.offset, self.end(), size)
    }
}

/// `Content-Range` header value for an unsatisfiable request.
pub fn unsatisfiable_content_range(size: u64) -> String {
    format!("bytes */{size}")
}

/// Parses a `Range` header value. Returns `None` for anything that is not a
/// well-formed single byte range.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        ("", "") => None,
        ("", suffix) => suffix.parse().ok().map(ByteRange::Suffix),
        (start, "") => start.parse().ok().map(ByteRange::From),
        (start, end) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            (start <= end).then_some(ByteRange::Bounded(start, end))
        }
    }
}

/// Resolves a parsed range against the object size.
///
/// The end bound is clamped to the object size; a range starting at or past
/// the end of the object (or an empty suffix) is unsatisfiable.
pub fn resolve(range: ByteRange, size: u64) -> Result<ResolvedRange, ()> {
    if size == 0 {
        return Err(());
    }
    match range {
        ByteRange::Bounded(start, end) => {
            if start >= size {
                return Err(());
            }
            let end = end.min(size - 1);
            Ok(ResolvedRange {
                offset: start,
                length: end - start + 1,
            })
        }
        ByteRange::From(start) => {
            if start >= size {
                return Err(());
            }
            Ok(ResolvedRange {
                offset: start,
                length: size - start,
            })
        }
        ByteRange::Suffix(n) => {
            if n == 0 {
                return Err(());
            }
            let length = n.min(size);
            Ok(ResolvedRange {
                offset: size - length,
                length,
            })
        }
    }
}

/// Chunk indices (inclusive) covered by `length` bytes starting at `offset`.
pub fn chunk_window(offset: u64, length: u64, chunk_size: u64) -> (i32, i32) {
    let start_chunk = offset / chunk_size;
    let end_chunk = (offset + length - 1) / chunk_size;
    (start_chunk as i32, end_chunk as i32)
}
