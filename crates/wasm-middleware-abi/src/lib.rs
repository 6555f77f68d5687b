//! Host ABI and runtime for WebAssembly HTTP middleware.
//!
//! This crate wires guests to hosts:
//! - [`linker::register_host_module`]: registers the `http_handler` host
//!   module — the complete set of functions a guest can import, with their
//!   buffer retry protocol and bit-level encodings
//! - [`Runtime`]: compiles and validates a guest, negotiates features on a
//!   prewarm instance, and serves requests from an idle-instance pool
//! - [`RuntimeOptions`]: the construction options bag
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wasm_middleware_abi::{Runtime, RuntimeOptions};
//!
//! let runtime = Runtime::new(&wasm_bytes, Arc::new(MyHost), RuntimeOptions::new())?;
//! let ctx = runtime.handle(my_request_scope)?;
//! ```
//!
//! Per-request state (`Host::Ctx`) is moved into [`Runtime::handle`] and
//! handed back when the guest returns; host functions reach it through the
//! store's scope, so no mutable state lives in the host module and requests
//! can never observe one another.

pub mod linker;
pub mod options;
mod pool;
pub mod runtime;

pub use options::{Logger, RuntimeOptions};
pub use runtime::Runtime;
