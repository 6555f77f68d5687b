//! Error types for the wasm-middleware runtime.
//!
//! This module defines [`RuntimeError`] using `thiserror`. The variants map
//! onto the phases of a middleware's life:
//! - Construction: [`RuntimeError::InvalidConfig`], [`RuntimeError::Compilation`],
//!   [`RuntimeError::InvalidGuest`]
//! - Lazy instantiation: [`RuntimeError::Instantiation`]
//! - Guest execution: [`RuntimeError::Trap`]

use thiserror::Error;

/// Errors surfaced by the middleware runtime.
///
/// Construction-phase errors mean the middleware object was never produced.
/// [`RuntimeError::Instantiation`] and [`RuntimeError::Trap`] occur while
/// serving a request; the embedding adapter translates them to an HTTP
/// failure response.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The engine configuration was invalid or the engine failed to start.
    #[error("invalid runtime configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// WebAssembly compilation failed.
    #[error("error compiling guest: {reason}")]
    Compilation {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The guest module does not satisfy the middleware contract.
    ///
    /// The guest must export a nullary `handle` function and a linear memory
    /// named `memory`.
    #[error("invalid guest module: {reason}")]
    InvalidGuest {
        /// Description of the contract violation.
        reason: String,
    },

    /// Instantiating a guest failed at request time.
    #[error("error instantiating guest: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The guest trapped during `handle`.
    ///
    /// This covers Wasm traps, out-of-bounds memory access by the guest, and
    /// panics escaping host callbacks. The instance that trapped is discarded.
    #[error("wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `Compilation` error.
    pub fn compilation(reason: impl Into<String>) -> Self {
        Self::Compilation {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidGuest` error.
    pub fn invalid_guest(reason: impl Into<String>) -> Self {
        Self::InvalidGuest {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Returns `true` if this error occurred while constructing the
    /// middleware (engine setup, compilation, or guest validation).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::Compilation { .. } | Self::InvalidGuest { .. }
        )
    }

    /// Returns `true` if this error is a guest trap.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap { .. })
    }
}
