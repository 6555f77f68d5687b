//! The middleware itself: a Wasm guest in front of a next handler.

use std::sync::Arc;

use http::{Request, Response, StatusCode};
use tracing::error;

use wasm_middleware_abi::{Runtime, RuntimeOptions};
use wasm_middleware_common::{BodyKind, Features, HeaderKind, Host, RuntimeError};

use bytes::Bytes;

use crate::body::Body;
use crate::scope::{CancelToken, RequestScope};

/// The handler a middleware wraps: the upstream the guest reaches by calling
/// `next`.
///
/// Implemented for any matching closure.
pub trait Handler: Send + Sync + 'static {
    /// Serve one request.
    fn handle(&self, request: Request<Body>) -> Response<Body>;
}

impl<F> Handler for F
where
    F: Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static,
{
    fn handle(&self, request: Request<Body>) -> Response<Body> {
        self(request)
    }
}

/// [`Host`] implementation over [`RequestScope`].
///
/// Supports all three optional features; `enable_features` grants whatever
/// subset the guest asks for.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpHost;

impl Host for HttpHost {
    type Ctx = RequestScope;

    fn enable_features(&self, requested: Features) -> Features {
        requested & Features::all()
    }

    fn get_uri(&self, ctx: &RequestScope) -> String {
        ctx.uri()
    }

    fn set_uri(&self, ctx: &mut RequestScope, uri: &str) {
        ctx.set_uri(uri);
    }

    fn get_method(&self, ctx: &RequestScope) -> String {
        ctx.method()
    }

    fn set_method(&self, ctx: &mut RequestScope, method: &str) {
        ctx.set_method(method);
    }

    fn get_protocol_version(&self, ctx: &RequestScope) -> String {
        ctx.protocol_version()
    }

    fn get_header_names(&self, ctx: &RequestScope, kind: HeaderKind) -> Vec<String> {
        ctx.header_names(kind)
    }

    fn get_header_values(&self, ctx: &RequestScope, kind: HeaderKind, name: &str) -> Vec<String> {
        ctx.header_values(kind, name)
    }

    fn set_header_value(&self, ctx: &mut RequestScope, kind: HeaderKind, name: &str, value: &str) {
        ctx.set_header(kind, name, value);
    }

    fn add_header_value(&self, ctx: &mut RequestScope, kind: HeaderKind, name: &str, value: &str) {
        ctx.add_header(kind, name, value);
    }

    fn remove_header(&self, ctx: &mut RequestScope, kind: HeaderKind, name: &str) {
        ctx.remove_header(kind, name);
    }

    fn read_body(&self, ctx: &mut RequestScope, kind: BodyKind, max: usize) -> (Bytes, bool) {
        ctx.read_body(kind, max)
    }

    fn write_body(&self, ctx: &mut RequestScope, kind: BodyKind, body: &[u8]) {
        ctx.write_body(kind, body);
    }

    fn get_status_code(&self, ctx: &RequestScope) -> u16 {
        ctx.status_code()
    }

    fn set_status_code(&self, ctx: &mut RequestScope, status: u16) {
        ctx.set_status_code(status);
    }

    fn next(&self, ctx: &mut RequestScope) {
        ctx.next();
    }
}

/// HTTP middleware backed by a WebAssembly guest.
///
/// Construct once, then call [`Middleware::handle`] from as many threads as
/// the embedding server runs; instances are pooled internally and never
/// shared between concurrent requests.
#[derive(Clone)]
pub struct Middleware {
    runtime: Arc<Runtime<HttpHost>>,
    next: Arc<dyn Handler>,
}

impl Middleware {
    /// Build a middleware from a compiled guest, wrapping `next`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the guest does not satisfy the
    /// middleware contract, or an instantiation/trap error if the eager
    /// prewarm instance fails.
    pub fn new(
        guest: &[u8],
        next: Arc<dyn Handler>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        let runtime = Runtime::new(guest, Arc::new(HttpHost), options)?;
        Ok(Self {
            runtime: Arc::new(runtime),
            next,
        })
    }

    /// The features negotiated with the guest at construction.
    pub fn features(&self) -> Features {
        self.runtime.features()
    }

    /// Number of idle guest instances currently pooled.
    pub fn idle_instances(&self) -> usize {
        self.runtime.idle_instances()
    }

    /// Total guest instances created so far.
    pub fn instances_created(&self) -> u64 {
        self.runtime.instances_created()
    }

    /// Serve one request, translating guest failures into an empty 500.
    pub fn handle(&self, request: Request<Body>) -> Response<Body> {
        match self.try_handle(request) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Guest failed; responding 500");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    /// Serve one request, surfacing guest failures to the caller.
    ///
    /// # Errors
    ///
    /// Returns an instantiation error if no guest instance could be created,
    /// or a trap error if the guest trapped.
    pub fn try_handle(&self, request: Request<Body>) -> Result<Response<Body>, RuntimeError> {
        self.try_handle_cancellable(request, CancelToken::new())
    }

    /// Like [`Middleware::try_handle`], with a caller-held cancellation
    /// token. Cancelling makes host calls answer empty and skips `next`; it
    /// does not preempt a running guest.
    pub fn try_handle_cancellable(
        &self,
        request: Request<Body>,
        cancel: CancelToken,
    ) -> Result<Response<Body>, RuntimeError> {
        let scope = RequestScope::new(
            request,
            Arc::clone(&self.next),
            self.runtime.features(),
            cancel,
        );
        let scope = self.runtime.handle(scope)?;
        Ok(scope.finalize())
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}
