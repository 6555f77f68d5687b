//! Per-instance resource limits.

use serde::{Deserialize, Serialize};

/// Resource limits applied to every guest instance.
///
/// Each instance runs in its own store with these limits installed; when the
/// runtime pre-allocates instance slots, the same numbers size the slots.
/// The embedding server remains responsible for wall-clock timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum linear memory in bytes a single instance may grow to.
    ///
    /// A guest whose initial memory already exceeds this fails to
    /// instantiate.
    #[serde(default = "defaults::max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Maximum table elements a single instance may allocate.
    #[serde(default = "defaults::max_table_elements")]
    pub max_table_elements: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: defaults::max_memory_bytes(),
            max_table_elements: defaults::max_table_elements(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn max_memory_bytes() -> usize {
        64 * 1024 * 1024
    }

    pub const fn max_table_elements() -> usize {
        20_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.max_table_elements, 20_000);
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let json = r#"{"max_memory_bytes": 65536}"#;
        let config: StoreConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_memory_bytes, 65536);
        assert_eq!(config.max_table_elements, 20_000);
    }

    #[test]
    fn test_round_trip() {
        let config = StoreConfig {
            max_memory_bytes: 1 << 20,
            max_table_elements: 100,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(back.max_memory_bytes, config.max_memory_bytes);
        assert_eq!(back.max_table_elements, config.max_table_elements);
    }
}
