//! The response snapshot the guest reads and mutates.
//!
//! Before `next` this is the response being authored by the guest; after
//! `next` the upstream response is merged into it. The snapshot is flushed to
//! a real `http::Response` when the guest returns.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};

/// Response trailers, attached to the finalized response's extensions when
/// the trailers feature is on.
#[derive(Debug, Clone, Default)]
pub struct Trailers(pub HeaderMap);

/// Mutable response state for one request.
pub(crate) struct ResponseState {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) trailers: HeaderMap,
    body: BytesMut,
    read_pos: usize,
    written: bool,
}

impl ResponseState {
    pub(crate) fn new(version: Version) -> Self {
        Self {
            status: StatusCode::OK,
            version,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            body: BytesMut::new(),
            read_pos: 0,
            written: false,
        }
    }

    /// Guest write: the first write since the last [`rearm`](Self::rearm)
    /// replaces the body, later writes append.
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        if !self.written {
            self.body.clear();
            self.read_pos = 0;
            self.written = true;
        }
        self.body.extend_from_slice(bytes);
    }

    /// Append captured upstream bytes without disturbing write state.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Arm replace-on-first-write again, so the guest can rewrite a captured
    /// body wholesale.
    pub(crate) fn rearm(&mut self) {
        self.written = false;
    }

    /// Read up to `max` bytes from the body, advancing a cursor.
    pub(crate) fn read(&mut self, max: usize) -> (Bytes, bool) {
        let remaining = self.body.len().saturating_sub(self.read_pos);
        let n = remaining.min(max);
        let chunk = Bytes::copy_from_slice(&self.body[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        (chunk, self.read_pos >= self.body.len())
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn into_parts(self) -> (StatusCode, Version, HeaderMap, HeaderMap, Bytes) {
        (
            self.status,
            self.version,
            self.headers,
            self.trailers,
            self.body.freeze(),
        )
    }
}
