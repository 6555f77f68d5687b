//! Construction options for a middleware runtime.

use std::sync::Arc;

use bytes::Bytes;
use wasmtime::Engine;

use wasm_middleware_common::StoreConfig;

/// Callback invoked for each guest `log` call.
pub type Logger = Arc<dyn Fn(&str) + Send + Sync>;

/// Options accepted when constructing a [`Runtime`](crate::Runtime).
///
/// All options have defaults; override selectively:
///
/// ```ignore
/// let options = RuntimeOptions::new()
///     .with_guest_config(config_bytes)
///     .with_logger(|msg| println!("guest: {msg}"));
/// ```
pub struct RuntimeOptions {
    pub(crate) guest_config: Bytes,
    pub(crate) logger: Logger,
    pub(crate) engine: Option<Engine>,
    pub(crate) pooled_instances: Option<u32>,
    pub(crate) store_config: StoreConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            guest_config: Bytes::new(),
            logger: Arc::new(|_| {}),
            engine: None,
            pooled_instances: None,
            store_config: StoreConfig::default(),
        }
    }
}

impl RuntimeOptions {
    /// Options with all defaults: empty guest config, no-op logger, an
    /// on-demand engine built by the runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque bytes returned verbatim to the guest by `get_config`.
    pub fn with_guest_config(mut self, config: impl Into<Bytes>) -> Self {
        self.guest_config = config.into();
        self
    }

    /// Callback receiving guest `log` messages. Defaults to a no-op.
    pub fn with_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Supply a pre-built engine instead of letting the runtime build one.
    /// Lets several middlewares share one engine; when set,
    /// [`RuntimeOptions::with_pooled_instances`] has no effect.
    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Pre-allocate slots for up to `max_instances` live guest instances,
    /// sized by the store limits, instead of allocating on demand. Takes
    /// instantiation cost off the floor of a cold request.
    pub fn with_pooled_instances(mut self, max_instances: u32) -> Self {
        self.pooled_instances = Some(max_instances);
        self
    }

    /// Per-instance resource limits, applied to every guest instantiation
    /// and to pre-allocated slot sizing.
    pub fn with_store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("guest_config_len", &self.guest_config.len())
            .field("engine", &self.engine.is_some())
            .field("pooled_instances", &self.pooled_instances)
            .field("store_config", &self.store_config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::new();
        assert!(options.guest_config.is_empty());
        assert!(options.engine.is_none());
        assert!(options.pooled_instances.is_none());
    }

    #[test]
    fn test_builders() {
        let options = RuntimeOptions::new()
            .with_guest_config(vec![1u8, 2, 3])
            .with_pooled_instances(16)
            .with_store_config(StoreConfig {
                max_memory_bytes: 1 << 20,
                ..Default::default()
            });

        assert_eq!(options.guest_config.as_ref(), &[1, 2, 3]);
        assert_eq!(options.pooled_instances, Some(16));
        assert_eq!(options.store_config.max_memory_bytes, 1 << 20);
    }

    #[test]
    fn test_logger_callback() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = RuntimeOptions::new().with_logger(move |msg| {
            sink.lock().unwrap().push(msg.to_string());
        });

        (options.logger)("hello");
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello".to_string()]);
    }
}
