//! Engine-facing building blocks for wasm-middleware.
//!
//! - [`mem`]: bounds-checked guest-memory transfer primitives and the
//!   write-if-under-limit retry protocol
//! - [`StoreData`] / [`Scope`]: the per-instance store payload host
//!   functions dispatch against, with [`create_store`] applying the
//!   per-instance resource limits
//!
//! Everything mutable lives in a per-instance store; compiled modules and
//! the engine are shared immutably by the runtime layer above.

pub mod mem;
pub mod state;

pub use state::{create_store, InitState, Scope, StoreData};
