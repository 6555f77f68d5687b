//! Common types for the wasm-middleware workspace.
//!
//! This crate provides the shared vocabulary used across the workspace:
//! - [`RuntimeError`]: typed errors using `thiserror`
//! - [`Features`]: the negotiated ABI capability bitset
//! - [`StoreConfig`]: per-instance resource limits
//! - [`Host`]: the interface the ABI layer dispatches to, with [`NopHost`]
//!   as a selectively-overridable stub

pub mod config;
pub mod error;
pub mod features;
pub mod host;

pub use config::StoreConfig;
pub use error::RuntimeError;
pub use features::Features;
pub use host::{BodyKind, HeaderKind, Host, NopHost, GUEST_ENTRYPOINT, GUEST_MEMORY, HOST_MODULE};
