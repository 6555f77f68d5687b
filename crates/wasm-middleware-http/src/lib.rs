//! Reference HTTP adapter for wasm-middleware.
//!
//! Wraps a next [`Handler`] with a WebAssembly guest speaking the
//! `http_handler` ABI. The adapter targets the plain handler model: a
//! request object, a response being written, and a next handler — expressed
//! over `http` crate types with a [`Body`] that is either bytes or a stream.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wasm_middleware_http::{Body, Middleware};
//! use wasm_middleware_abi::RuntimeOptions;
//!
//! let next = Arc::new(|req: http::Request<Body>| {
//!     http::Response::new(Body::full("hello"))
//! });
//! let middleware = Middleware::new(&wasm, next, RuntimeOptions::new())?;
//!
//! // One call per request, from any number of threads:
//! let response = middleware.handle(request);
//! ```
//!
//! Feature-dependent behavior (request buffering, response capture,
//! trailers) is negotiated by the guest at construction and fixed from then
//! on; see [`Middleware::features`].

pub mod body;
pub mod middleware;
pub mod response;
pub mod scope;

pub use body::Body;
pub use middleware::{Handler, HttpHost, Middleware};
pub use response::Trailers;
pub use scope::{CancelToken, RequestScope};

pub use wasm_middleware_abi::{Logger, RuntimeOptions};
pub use wasm_middleware_common::{Features, RuntimeError};
