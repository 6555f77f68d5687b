//! Per-request middleware state.
//!
//! A [`RequestScope`] is created by the middleware for each request, moved
//! into the runtime for the duration of the guest's `handle` call, and
//! finalized into the outgoing response afterwards. It mediates everything
//! the guest sees: the request view, body buffering, response capture, and
//! the `next` invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use tracing::{debug, warn};

use wasm_middleware_common::{BodyKind, Features, HeaderKind};

use crate::body::Body;
use crate::middleware::Handler;
use crate::response::{ResponseState, Trailers};

/// Cooperative cancellation flag for one request.
///
/// Cancellation is never delivered into a running guest; instead, a cancelled
/// scope answers ABI calls with empty results and skips the upstream handler,
/// which terminates most guests promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Mark the request as cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// State for exactly one `handle` invocation.
pub struct RequestScope {
    method: Method,
    uri: Uri,
    version: http::Version,
    headers: HeaderMap,
    request_trailers: HeaderMap,

    body: Body,
    buffered_request: Option<Bytes>,
    request_read_pos: usize,
    request_written: bool,

    features: Features,
    next: Arc<dyn Handler>,
    next_called: bool,
    committed: bool,
    response: ResponseState,
    cancel: CancelToken,
}

impl RequestScope {
    pub(crate) fn new(
        request: Request<Body>,
        next: Arc<dyn Handler>,
        features: Features,
        cancel: CancelToken,
    ) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            request_trailers: HeaderMap::new(),
            body,
            buffered_request: None,
            request_read_pos: 0,
            request_written: false,
            features,
            next,
            next_called: false,
            committed: false,
            response: ResponseState::new(parts.version),
            cancel,
        }
    }

    /// The features negotiated for this middleware.
    pub fn features(&self) -> Features {
        self.features
    }

    pub(crate) fn uri(&self) -> String {
        if self.cancel.is_cancelled() {
            return String::new();
        }
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn set_uri(&mut self, value: &str) {
        if value.is_empty() {
            self.uri = Uri::default();
            return;
        }
        let new_uri: Uri = match value.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(uri = value, error = %e, "Ignoring unparseable URI from guest");
                return;
            }
        };
        // Keep scheme and authority; the guest only controls path and query.
        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query = new_uri.into_parts().path_and_query;
        match Uri::from_parts(parts) {
            Ok(uri) => self.uri = uri,
            Err(e) => warn!(uri = value, error = %e, "Ignoring unusable URI from guest"),
        }
    }

    pub(crate) fn method(&self) -> String {
        if self.cancel.is_cancelled() {
            return String::new();
        }
        self.method.as_str().to_string()
    }

    pub(crate) fn set_method(&mut self, value: &str) {
        match Method::from_bytes(value.as_bytes()) {
            Ok(method) => self.method = method,
            Err(e) => warn!(method = value, error = %e, "Ignoring invalid method from guest"),
        }
    }

    pub(crate) fn protocol_version(&self) -> String {
        if self.cancel.is_cancelled() {
            return String::new();
        }
        format!("{:?}", self.version)
    }

    fn header_map(&self, kind: HeaderKind) -> Option<&HeaderMap> {
        let trailers = self.features.contains(Features::TRAILERS);
        match kind {
            HeaderKind::Request => Some(&self.headers),
            HeaderKind::Response => Some(&self.response.headers),
            HeaderKind::RequestTrailers if trailers => Some(&self.request_trailers),
            HeaderKind::ResponseTrailers if trailers => Some(&self.response.trailers),
            _ => None,
        }
    }

    fn header_map_mut(&mut self, kind: HeaderKind) -> Option<&mut HeaderMap> {
        let trailers = self.features.contains(Features::TRAILERS);
        match kind {
            HeaderKind::Request => Some(&mut self.headers),
            HeaderKind::Response if !self.committed => Some(&mut self.response.headers),
            HeaderKind::RequestTrailers if trailers => Some(&mut self.request_trailers),
            HeaderKind::ResponseTrailers if trailers && !self.committed => {
                Some(&mut self.response.trailers)
            }
            _ => {
                debug!(?kind, "Dropping header mutation");
                None
            }
        }
    }

    pub(crate) fn header_names(&self, kind: HeaderKind) -> Vec<String> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        match self.header_map(kind) {
            Some(map) => map.keys().map(|name| name.as_str().to_string()).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn header_values(&self, kind: HeaderKind, name: &str) -> Vec<String> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let Some(map) = self.header_map(kind) else {
            return Vec::new();
        };
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return Vec::new();
        };
        map.get_all(&name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect()
    }

    pub(crate) fn set_header(&mut self, kind: HeaderKind, name: &str, value: &str) {
        let Some((name, value)) = parse_header(name, value) else {
            return;
        };
        if let Some(map) = self.header_map_mut(kind) {
            map.insert(name, value);
        }
    }

    pub(crate) fn add_header(&mut self, kind: HeaderKind, name: &str, value: &str) {
        let Some((name, value)) = parse_header(name, value) else {
            return;
        };
        if let Some(map) = self.header_map_mut(kind) {
            map.append(name, value);
        }
    }

    pub(crate) fn remove_header(&mut self, kind: HeaderKind, name: &str) {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(name, "Ignoring invalid header name from guest");
            return;
        };
        if let Some(map) = self.header_map_mut(kind) {
            map.remove(&name);
        }
    }

    pub(crate) fn read_body(&mut self, kind: BodyKind, max: usize) -> (Bytes, bool) {
        if self.cancel.is_cancelled() {
            return (Bytes::new(), true);
        }
        match kind {
            BodyKind::Request => self.read_request_body(max),
            BodyKind::Response => {
                if self.features.contains(Features::BUFFER_RESPONSE) {
                    self.response.read(max)
                } else {
                    (Bytes::new(), true)
                }
            }
        }
    }

    fn read_request_body(&mut self, max: usize) -> (Bytes, bool) {
        if self.features.contains(Features::BUFFER_REQUEST) && self.buffered_request.is_none() {
            // First read drains the stream into a cache so the upstream
            // handler can still see the body after the guest has read it.
            match self.body.read_to_end() {
                Ok(bytes) => self.buffered_request = Some(bytes),
                Err(e) => {
                    warn!(error = %e, "Failed to buffer request body");
                    self.buffered_request = Some(Bytes::new());
                }
            }
        }

        if let Some(cache) = &self.buffered_request {
            let remaining = cache.len().saturating_sub(self.request_read_pos);
            let n = remaining.min(max);
            let chunk = cache.slice(self.request_read_pos..self.request_read_pos + n);
            self.request_read_pos += n;
            (chunk, self.request_read_pos >= cache.len())
        } else {
            match self.body.read_chunk(max) {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Failed to read request body");
                    (Bytes::new(), true)
                }
            }
        }
    }

    pub(crate) fn write_body(&mut self, kind: BodyKind, bytes: &[u8]) {
        match kind {
            BodyKind::Request => {
                if !self.request_written {
                    // First write replaces the inbound body outright.
                    self.buffered_request = Some(Bytes::copy_from_slice(bytes));
                    self.body = Body::empty();
                    self.request_read_pos = 0;
                    self.request_written = true;
                } else {
                    let mut buf = match self.buffered_request.take() {
                        Some(existing) => BytesMut::from(existing.as_ref()),
                        None => BytesMut::new(),
                    };
                    buf.extend_from_slice(bytes);
                    self.buffered_request = Some(buf.freeze());
                }
            }
            BodyKind::Response => {
                if self.committed {
                    debug!("Dropping response body write after next");
                    return;
                }
                self.response.write(bytes);
            }
        }
    }

    pub(crate) fn status_code(&self) -> u16 {
        self.response.status.as_u16()
    }

    pub(crate) fn set_status_code(&mut self, status: u16) {
        if self.committed {
            debug!(status, "Dropping status code write after next");
            return;
        }
        match StatusCode::from_u16(status) {
            Ok(status) => self.response.status = status,
            Err(_) => warn!(status, "Ignoring invalid status code from guest"),
        }
    }

    /// Run the upstream handler and merge its response into the snapshot.
    pub(crate) fn next(&mut self) {
        if self.next_called {
            debug!("Ignoring repeated next call");
            return;
        }
        self.next_called = true;

        if self.cancel.is_cancelled() {
            debug!("Skipping upstream handler: request cancelled");
            return;
        }

        let body = match self.buffered_request.clone() {
            Some(cache) => Body::full(cache),
            None => std::mem::take(&mut self.body),
        };

        let mut request = Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();

        let response = self.next.handle(request);
        let (parts, mut body) = response.into_parts();
        let upstream_body = match body.read_to_end() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to read upstream response body");
                Bytes::new()
            }
        };

        self.response.status = parts.status;
        self.response.version = parts.version;
        // Upstream keys replace whatever the guest staged under the same
        // name; multi-valued upstream headers append in order.
        let names: Vec<HeaderName> = parts.headers.keys().cloned().collect();
        for name in &names {
            self.response.headers.remove(name);
        }
        for (name, value) in parts.headers.iter() {
            self.response.headers.append(name.clone(), value.clone());
        }

        self.response.append(&upstream_body);
        // The captured body counts as unwritten: the guest's first write
        // after next replaces it wholesale.
        self.response.rearm();

        if !self.features.contains(Features::BUFFER_RESPONSE) {
            self.committed = true;
        }
    }

    /// Flush the response snapshot into the outgoing response.
    pub(crate) fn finalize(self) -> Response<Body> {
        let trailers_enabled = self.features.contains(Features::TRAILERS);
        let (status, version, mut headers, trailers, body) = self.response.into_parts();

        if trailers_enabled && !trailers.is_empty() {
            // Advertise trailer names and force chunked framing before the
            // headers go out.
            let names = trailers
                .keys()
                .map(HeaderName::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&names) {
                headers.insert(http::header::TRAILER, value);
            }
            headers.insert(
                http::header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
        }

        let mut response = Response::new(Body::full(body));
        *response.status_mut() = status;
        *response.version_mut() = version;
        *response.headers_mut() = headers;
        if trailers_enabled && !trailers.is_empty() {
            response.extensions_mut().insert(Trailers(trailers));
        }
        response
    }
}

fn parse_header(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let parsed_name = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(name, error = %e, "Ignoring invalid header name from guest");
            return None;
        }
    };
    let parsed_value = match HeaderValue::from_bytes(value.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(name, error = %e, "Ignoring invalid header value from guest");
            return None;
        }
    };
    Some((parsed_name, parsed_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn noop_next() -> Arc<dyn Handler> {
        Arc::new(|_req: Request<Body>| Response::new(Body::empty()))
    }

    fn scope_with(features: Features, next: Arc<dyn Handler>) -> RequestScope {
        let request = Request::builder()
            .method("GET")
            .uri("/v1.0/hi?name=panda")
            .body(Body::empty())
            .unwrap();
        RequestScope::new(request, next, features, CancelToken::new())
    }

    fn scope(features: Features) -> RequestScope {
        scope_with(features, noop_next())
    }

    #[test]
    fn test_uri_round_trip() {
        let mut scope = scope(Features::none());
        assert_eq!(scope.uri(), "/v1.0/hi?name=panda");

        scope.set_uri("/v1.0/hello?name=teddy");
        assert_eq!(scope.uri(), "/v1.0/hello?name=teddy");

        scope.set_uri("");
        assert_eq!(scope.uri(), "/");

        // Junk is dropped, the previous URI stays.
        scope.set_uri("/ok");
        scope.set_uri("http://exa mple/bad");
        assert_eq!(scope.uri(), "/ok");
    }

    #[test]
    fn test_method_round_trip() {
        let mut scope = scope(Features::none());
        assert_eq!(scope.method(), "GET");

        scope.set_method("POST");
        assert_eq!(scope.method(), "POST");

        scope.set_method("b a d");
        assert_eq!(scope.method(), "POST");
    }

    #[test]
    fn test_protocol_version() {
        let scope = scope(Features::none());
        assert_eq!(scope.protocol_version(), "HTTP/1.1");
    }

    #[test]
    fn test_set_then_get_header_yields_exactly_one_value() {
        let mut scope = scope(Features::none());

        scope.add_header(HeaderKind::Request, "x-k", "old1");
        scope.add_header(HeaderKind::Request, "x-k", "old2");
        scope.set_header(HeaderKind::Request, "x-k", "v");

        assert_eq!(scope.header_values(HeaderKind::Request, "x-k"), ["v"]);
        // Lookup is case-insensitive.
        assert_eq!(scope.header_values(HeaderKind::Request, "X-K"), ["v"]);
    }

    #[test]
    fn test_add_preserves_order() {
        let mut scope = scope(Features::none());

        scope.add_header(HeaderKind::Response, "x-k", "v1");
        scope.add_header(HeaderKind::Response, "x-k", "v2");

        assert_eq!(
            scope.header_values(HeaderKind::Response, "x-k"),
            ["v1", "v2"]
        );
    }

    #[test]
    fn test_remove_header_empties_values() {
        let mut scope = scope(Features::none());

        scope.add_header(HeaderKind::Request, "x-k", "v1");
        scope.add_header(HeaderKind::Request, "x-k", "v2");
        scope.remove_header(HeaderKind::Request, "x-k");

        assert!(scope.header_values(HeaderKind::Request, "x-k").is_empty());
        assert!(!scope
            .header_names(HeaderKind::Request)
            .contains(&"x-k".to_string()));
    }

    #[test]
    fn test_invalid_header_name_is_dropped() {
        let mut scope = scope(Features::none());
        scope.set_header(HeaderKind::Request, "bad name", "v");
        assert!(scope.header_names(HeaderKind::Request).is_empty());
    }

    #[test]
    fn test_trailers_require_feature() {
        let mut scope = scope(Features::none());
        scope.set_header(HeaderKind::ResponseTrailers, "grpc-status", "0");
        assert!(scope
            .header_values(HeaderKind::ResponseTrailers, "grpc-status")
            .is_empty());

        let mut scope = scope_with(Features::TRAILERS, noop_next());
        scope.set_header(HeaderKind::ResponseTrailers, "grpc-status", "0");
        assert_eq!(
            scope.header_values(HeaderKind::ResponseTrailers, "grpc-status"),
            ["0"]
        );
    }

    #[test]
    fn test_next_merges_upstream_response() {
        let next: Arc<dyn Handler> = Arc::new(|_req: Request<Body>| {
            let mut response = Response::new(Body::full("upstream"));
            *response.status_mut() = StatusCode::CREATED;
            response
                .headers_mut()
                .insert("x-upstream", HeaderValue::from_static("yes"));
            response
        });
        let mut scope = scope_with(Features::none(), next);

        scope.set_header(HeaderKind::Response, "x-guest", "pre");
        scope.write_body(BodyKind::Response, b"pre-next ");
        scope.next();

        assert_eq!(scope.status_code(), 201);
        assert_eq!(scope.header_values(HeaderKind::Response, "x-upstream"), ["yes"]);
        // Guest-staged headers under other names survive the merge.
        assert_eq!(scope.header_values(HeaderKind::Response, "x-guest"), ["pre"]);

        let response = scope.finalize();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_second_next_is_ignored() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let next: Arc<dyn Handler> = Arc::new(move |_req: Request<Body>| {
            seen.fetch_add(1, Ordering::Relaxed);
            Response::new(Body::empty())
        });
        let mut scope = scope_with(Features::none(), next);

        scope.next();
        scope.next();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_post_next_mutations_dropped_without_buffering() {
        let next: Arc<dyn Handler> =
            Arc::new(|_req: Request<Body>| Response::new(Body::full("upstream")));
        let mut scope = scope_with(Features::none(), next);

        scope.next();
        scope.set_status_code(503);
        scope.set_header(HeaderKind::Response, "x-late", "v");
        scope.write_body(BodyKind::Response, b"late");

        let response = scope.finalize();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-late").is_none());
        let mut body = response.into_body();
        assert_eq!(body.read_to_end().unwrap().as_ref(), b"upstream");
    }

    #[test]
    fn test_post_next_mutations_observable_with_buffering() {
        let next: Arc<dyn Handler> =
            Arc::new(|_req: Request<Body>| Response::new(Body::full("upstream")));
        let mut scope = scope_with(Features::BUFFER_RESPONSE, next);

        scope.next();

        // The captured body is readable...
        let (chunk, eof) = scope.read_body(BodyKind::Response, 64);
        assert_eq!(chunk.as_ref(), b"upstream");
        assert!(eof);

        // ...and the first write after capture replaces it.
        scope.set_status_code(503);
        scope.set_header(HeaderKind::Response, "x-late", "v");
        scope.write_body(BodyKind::Response, b"rewritten");

        let response = scope.finalize();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("x-late").unwrap(), "v");
        let mut body = response.into_body();
        assert_eq!(body.read_to_end().unwrap().as_ref(), b"rewritten");
    }

    #[test]
    fn test_buffered_request_feeds_guest_and_upstream() {
        let upstream_body: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&upstream_body);
        let next: Arc<dyn Handler> = Arc::new(move |mut req: Request<Body>| {
            let body = req.body_mut().read_to_end().unwrap();
            seen.lock().unwrap().extend_from_slice(&body);
            Response::new(Body::empty())
        });

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::full("payload"))
            .unwrap();
        let mut scope = RequestScope::new(
            request,
            next,
            Features::BUFFER_REQUEST,
            CancelToken::new(),
        );

        let mut guest_view = Vec::new();
        loop {
            let (chunk, eof) = scope.read_body(BodyKind::Request, 3);
            guest_view.extend_from_slice(&chunk);
            if eof {
                break;
            }
        }
        assert_eq!(guest_view, b"payload");

        scope.next();
        assert_eq!(upstream_body.lock().unwrap().as_slice(), b"payload");
    }

    #[test]
    fn test_unbuffered_request_read_starves_upstream() {
        let upstream_body: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&upstream_body);
        let next: Arc<dyn Handler> = Arc::new(move |mut req: Request<Body>| {
            let body = req.body_mut().read_to_end().unwrap();
            seen.lock().unwrap().extend_from_slice(&body);
            Response::new(Body::empty())
        });

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::full("payload"))
            .unwrap();
        let mut scope = RequestScope::new(request, next, Features::none(), CancelToken::new());

        let (chunk, _eof) = scope.read_body(BodyKind::Request, 1024);
        assert_eq!(chunk.as_ref(), b"payload");

        scope.next();
        assert!(upstream_body.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_request_body_replaces_then_appends() {
        let upstream_body: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&upstream_body);
        let next: Arc<dyn Handler> = Arc::new(move |mut req: Request<Body>| {
            let body = req.body_mut().read_to_end().unwrap();
            seen.lock().unwrap().extend_from_slice(&body);
            Response::new(Body::empty())
        });

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::full("original"))
            .unwrap();
        let mut scope = RequestScope::new(request, next, Features::none(), CancelToken::new());

        scope.write_body(BodyKind::Request, b"new");
        scope.write_body(BodyKind::Request, b" body");
        scope.next();

        assert_eq!(upstream_body.lock().unwrap().as_slice(), b"new body");
    }

    #[test]
    fn test_cancelled_scope_goes_quiet() {
        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let next: Arc<dyn Handler> = Arc::new(move |_req: Request<Body>| {
            seen.store(true, Ordering::Relaxed);
            Response::new(Body::empty())
        });

        let token = CancelToken::new();
        let request = Request::builder()
            .method("GET")
            .uri("/path")
            .body(Body::full("data"))
            .unwrap();
        let mut scope = RequestScope::new(request, next, Features::all(), token.clone());

        token.cancel();

        assert_eq!(scope.uri(), "");
        assert_eq!(scope.method(), "");
        let (chunk, eof) = scope.read_body(BodyKind::Request, 64);
        assert!(chunk.is_empty());
        assert!(eof);

        scope.next();
        assert!(!called.load(Ordering::Relaxed));
    }

    #[test]
    fn test_finalize_emits_trailer_headers() {
        let mut scope = scope(Features::TRAILERS);
        scope.write_body(BodyKind::Response, b"payload");
        scope.add_header(HeaderKind::ResponseTrailers, "grpc-status", "0");

        let response = scope.finalize();
        assert_eq!(response.headers().get(http::header::TRAILER).unwrap(), "grpc-status");
        assert_eq!(
            response.headers().get(http::header::TRANSFER_ENCODING).unwrap(),
            "chunked"
        );
        let trailers = response.extensions().get::<Trailers>().unwrap();
        assert_eq!(trailers.0.get("grpc-status").unwrap(), "0");
    }
}
