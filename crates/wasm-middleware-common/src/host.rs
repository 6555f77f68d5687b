//! The host interface consumed by the ABI layer.
//!
//! Every host function the guest can call ultimately dispatches to a [`Host`]
//! implementation. The reference HTTP adapter implements it against real
//! request/response state; [`NopHost`] is a stub returning zero values so
//! adapters can override selectively.

use bytes::Bytes;

use crate::Features;

/// Name of the host module the guest imports.
pub const HOST_MODULE: &str = "http_handler";

/// Name of the guest entry point, invoked once per request.
///
/// The export must be a nullary function returning nothing.
pub const GUEST_ENTRYPOINT: &str = "handle";

/// Name of the linear memory the guest must export.
pub const GUEST_MEMORY: &str = "memory";

/// Which header block a header operation targets.
///
/// The trailer kinds require the [`Features::TRAILERS`] feature; without it,
/// trailer getters return empty results and trailer mutators do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Request headers.
    Request,
    /// Response headers.
    Response,
    /// Request trailer headers.
    RequestTrailers,
    /// Response trailer headers.
    ResponseTrailers,
}

impl HeaderKind {
    /// Decode the ABI discriminator. Unknown values are a guest violation.
    pub fn from_raw(raw: u32) -> Option<HeaderKind> {
        match raw {
            0 => Some(HeaderKind::Request),
            1 => Some(HeaderKind::Response),
            2 => Some(HeaderKind::RequestTrailers),
            3 => Some(HeaderKind::ResponseTrailers),
            _ => None,
        }
    }

    /// Returns `true` for the trailer kinds.
    pub fn is_trailers(self) -> bool {
        matches!(
            self,
            HeaderKind::RequestTrailers | HeaderKind::ResponseTrailers
        )
    }
}

/// Which body a body operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// The request body.
    Request,
    /// The response body.
    Response,
}

impl BodyKind {
    /// Decode the ABI discriminator. Unknown values are a guest violation.
    pub fn from_raw(raw: u32) -> Option<BodyKind> {
        match raw {
            0 => Some(BodyKind::Request),
            1 => Some(BodyKind::Response),
            _ => None,
        }
    }
}

/// Bridges the guest's view of a request to the embedding HTTP server.
///
/// `Ctx` is the adapter's per-request state; the runtime moves one `Ctx` in
/// for each `handle` invocation and hands it back when the guest returns, so
/// an implementation never observes state from another request.
///
/// Every method has a zero-value default body. A minimal adapter overrides
/// only what it can support; anything left out behaves like [`NopHost`].
pub trait Host: Send + Sync + 'static {
    /// Per-request state, owned by the invoking thread for the duration of
    /// one `handle` call.
    type Ctx: Send + 'static;

    /// Answer a feature request with the subset this host supports.
    ///
    /// Called during the prewarm invocation to fix the middleware's feature
    /// set, and again (idempotently) whenever a guest repeats the call on a
    /// normal request.
    fn enable_features(&self, requested: Features) -> Features {
        let _ = requested;
        Features::none()
    }

    /// The request URI: path plus raw query.
    fn get_uri(&self, ctx: &Self::Ctx) -> String {
        let _ = ctx;
        String::new()
    }

    /// Replace the request URI.
    fn set_uri(&self, ctx: &mut Self::Ctx, uri: &str) {
        let _ = (ctx, uri);
    }

    /// The request method, e.g. `GET`.
    fn get_method(&self, ctx: &Self::Ctx) -> String {
        let _ = ctx;
        String::new()
    }

    /// Replace the request method.
    fn set_method(&self, ctx: &mut Self::Ctx, method: &str) {
        let _ = (ctx, method);
    }

    /// The protocol version, e.g. `HTTP/1.1`.
    fn get_protocol_version(&self, ctx: &Self::Ctx) -> String {
        let _ = ctx;
        String::new()
    }

    /// All header names of the given kind.
    fn get_header_names(&self, ctx: &Self::Ctx, kind: HeaderKind) -> Vec<String> {
        let _ = (ctx, kind);
        Vec::new()
    }

    /// All values for `name`, looked up case-insensitively.
    fn get_header_values(&self, ctx: &Self::Ctx, kind: HeaderKind, name: &str) -> Vec<String> {
        let _ = (ctx, kind, name);
        Vec::new()
    }

    /// Replace all values for `name` with a single value.
    fn set_header_value(&self, ctx: &mut Self::Ctx, kind: HeaderKind, name: &str, value: &str) {
        let _ = (ctx, kind, name, value);
    }

    /// Append one value under `name`.
    fn add_header_value(&self, ctx: &mut Self::Ctx, kind: HeaderKind, name: &str, value: &str) {
        let _ = (ctx, kind, name, value);
    }

    /// Remove all values for `name`.
    fn remove_header(&self, ctx: &mut Self::Ctx, kind: HeaderKind, name: &str) {
        let _ = (ctx, kind, name);
    }

    /// Read up to `max` bytes from the given body.
    ///
    /// Returns the chunk and an EOF flag. Repeated calls advance; the chunk
    /// must never exceed `max` bytes.
    fn read_body(&self, ctx: &mut Self::Ctx, kind: BodyKind, max: usize) -> (Bytes, bool) {
        let _ = (ctx, kind, max);
        (Bytes::new(), true)
    }

    /// Write bytes to the given body.
    ///
    /// The first write per message within one `handle` invocation replaces
    /// the body (an empty first write clears it); subsequent writes append.
    fn write_body(&self, ctx: &mut Self::Ctx, kind: BodyKind, body: &[u8]) {
        let _ = (ctx, kind, body);
    }

    /// The current response status code. Defaults to 200.
    fn get_status_code(&self, ctx: &Self::Ctx) -> u16 {
        let _ = ctx;
        200
    }

    /// Set the response status code.
    fn set_status_code(&self, ctx: &mut Self::Ctx, status: u16) {
        let _ = (ctx, status);
    }

    /// Invoke the upstream handler. At most once per `handle`; a second call
    /// must be ignored.
    fn next(&self, ctx: &mut Self::Ctx) {
        let _ = ctx;
    }
}

/// A [`Host`] that does nothing and returns zero values for every method.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHost;

impl Host for NopHost {
    type Ctx = ();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_kind_from_raw() {
        assert_eq!(HeaderKind::from_raw(0), Some(HeaderKind::Request));
        assert_eq!(HeaderKind::from_raw(1), Some(HeaderKind::Response));
        assert_eq!(HeaderKind::from_raw(2), Some(HeaderKind::RequestTrailers));
        assert_eq!(HeaderKind::from_raw(3), Some(HeaderKind::ResponseTrailers));
        assert_eq!(HeaderKind::from_raw(4), None);
    }

    #[test]
    fn test_header_kind_is_trailers() {
        assert!(!HeaderKind::Request.is_trailers());
        assert!(!HeaderKind::Response.is_trailers());
        assert!(HeaderKind::RequestTrailers.is_trailers());
        assert!(HeaderKind::ResponseTrailers.is_trailers());
    }

    #[test]
    fn test_body_kind_from_raw() {
        assert_eq!(BodyKind::from_raw(0), Some(BodyKind::Request));
        assert_eq!(BodyKind::from_raw(1), Some(BodyKind::Response));
        assert_eq!(BodyKind::from_raw(2), None);
    }

    #[test]
    fn test_nop_host_zero_values() {
        let host = NopHost;
        let mut ctx = ();

        assert_eq!(host.enable_features(Features::all()), Features::none());
        assert_eq!(host.get_uri(&ctx), "");
        assert_eq!(host.get_method(&ctx), "");
        assert_eq!(host.get_status_code(&ctx), 200);
        assert!(host.get_header_names(&ctx, HeaderKind::Request).is_empty());

        let (chunk, eof) = host.read_body(&mut ctx, BodyKind::Request, 64);
        assert!(chunk.is_empty());
        assert!(eof);
    }
}
