//! Message bodies for the reference adapter.
//!
//! A [`Body`] is either fully materialized bytes or a streaming reader.
//! Reads are consuming: what the guest takes off a streamed body is gone for
//! everyone downstream, which is exactly what request-body buffering exists
//! to paper over.

use std::io::Read;

use bytes::{Bytes, BytesMut};

enum Inner {
    Empty,
    Full(Bytes),
    Reader(Box<dyn Read + Send>),
}

/// A request or response body.
pub struct Body(Inner);

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body(Inner::Empty)
    }

    /// A fully materialized body.
    pub fn full(bytes: impl Into<Bytes>) -> Body {
        Body(Inner::Full(bytes.into()))
    }

    /// A streaming body backed by a reader.
    pub fn reader(reader: impl Read + Send + 'static) -> Body {
        Body(Inner::Reader(Box::new(reader)))
    }

    /// Read up to `max` bytes, advancing the body.
    ///
    /// Returns the chunk and an EOF flag. For a streaming body the flag only
    /// turns on once the underlying reader reports end of input, so the final
    /// data-carrying chunk may be followed by one empty EOF chunk.
    pub fn read_chunk(&mut self, max: usize) -> std::io::Result<(Bytes, bool)> {
        match &mut self.0 {
            Inner::Empty => Ok((Bytes::new(), true)),
            Inner::Full(bytes) => {
                let n = max.min(bytes.len());
                let chunk = bytes.split_to(n);
                Ok((chunk, bytes.is_empty()))
            }
            Inner::Reader(reader) => {
                if max == 0 {
                    return Ok((Bytes::new(), false));
                }
                let mut buf = vec![0u8; max];
                let n = reader.read(&mut buf)?;
                buf.truncate(n);
                Ok((buf.into(), n == 0))
            }
        }
    }

    /// Drain the rest of the body into one buffer, leaving it empty.
    pub fn read_to_end(&mut self) -> std::io::Result<Bytes> {
        match std::mem::replace(&mut self.0, Inner::Empty) {
            Inner::Empty => Ok(Bytes::new()),
            Inner::Full(bytes) => Ok(bytes),
            Inner::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(buf.into())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::full(bytes)
    }
}

impl From<BytesMut> for Body {
    fn from(bytes: BytesMut) -> Body {
        Body::full(bytes.freeze())
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Body {
        Body::full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::full(s)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::full(s)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Inner::Empty => f.write_str("Body::Empty"),
            Inner::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Inner::Reader(_) => f.write_str("Body::Reader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_body() {
        let mut body = Body::empty();
        let (chunk, eof) = body.read_chunk(16).unwrap();
        assert!(chunk.is_empty());
        assert!(eof);
        assert!(body.read_to_end().unwrap().is_empty());
    }

    #[test]
    fn test_full_body_chunked_reads() {
        let mut body = Body::full("hello, world");

        let (chunk, eof) = body.read_chunk(5).unwrap();
        assert_eq!(chunk.as_ref(), b"hello");
        assert!(!eof);

        let (chunk, eof) = body.read_chunk(64).unwrap();
        assert_eq!(chunk.as_ref(), b", world");
        assert!(eof);

        let (chunk, eof) = body.read_chunk(64).unwrap();
        assert!(chunk.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_full_body_zero_max() {
        let mut body = Body::full("data");
        let (chunk, eof) = body.read_chunk(0).unwrap();
        assert!(chunk.is_empty());
        assert!(!eof);
    }

    #[test]
    fn test_reader_body() {
        let mut body = Body::reader(Cursor::new(b"stream".to_vec()));

        let (chunk, eof) = body.read_chunk(4).unwrap();
        assert_eq!(chunk.as_ref(), b"stre");
        assert!(!eof);

        let (chunk, _eof) = body.read_chunk(4).unwrap();
        assert_eq!(chunk.as_ref(), b"am");

        // The reader reports EOF with an empty read.
        let (chunk, eof) = body.read_chunk(4).unwrap();
        assert!(chunk.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_read_to_end_consumes() {
        let mut body = Body::reader(Cursor::new(b"abc".to_vec()));
        assert_eq!(body.read_to_end().unwrap().as_ref(), b"abc");

        let (chunk, eof) = body.read_chunk(8).unwrap();
        assert!(chunk.is_empty());
        assert!(eof);
    }
}
