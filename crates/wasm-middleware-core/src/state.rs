//! Per-instance store state.
//!
//! Each guest instance owns a [`wasmtime::Store`] whose data is a
//! [`StoreData`]: the request scope consumed by host functions plus the
//! store's resource limits. The store is the isolation unit; nothing mutable
//! is shared between instances.

use wasmtime::{Engine, Store, StoreLimits, StoreLimitsBuilder};

use wasm_middleware_common::{Features, StoreConfig};

/// Sentinel state for the prewarm invocation of `handle`.
///
/// The prewarm call carries no request; its sole observable purpose is to let
/// the guest call `enable_features`, whose result is recorded here.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitState {
    /// Features granted to the guest during negotiation.
    pub features: Features,
}

/// What the host functions currently dispatch against.
///
/// The scope is installed immediately before calling the guest entry point
/// and taken back out right after it returns, so a scope value is owned by
/// exactly one invocation.
#[derive(Debug)]
pub enum Scope<C> {
    /// No call in flight. Host functions answer with zero values.
    Idle,

    /// The prewarm invocation. `enable_features` records its result;
    /// request-state functions are side-effect-free.
    Init(InitState),

    /// A live request with the adapter's per-request state.
    Active(C),
}

impl<C> Scope<C> {
    /// Take the scope out, leaving [`Scope::Idle`] behind.
    pub fn take(&mut self) -> Scope<C> {
        std::mem::replace(self, Scope::Idle)
    }
}

/// Store payload for one guest instance.
pub struct StoreData<C> {
    /// The scope host functions dispatch against.
    pub scope: Scope<C>,

    limits: StoreLimits,
}

/// Create a store for a fresh guest instance, with limits applied.
///
/// A guest whose initial linear memory exceeds `config.max_memory_bytes`
/// fails to instantiate in the resulting store, and growth past the limit is
/// denied at runtime.
pub fn create_store<C: Send + 'static>(
    engine: &Engine,
    config: &StoreConfig,
) -> Store<StoreData<C>> {
    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory_bytes)
        .table_elements(config.max_table_elements.try_into().unwrap())
        .build();

    let mut store = Store::new(
        engine,
        StoreData {
            scope: Scope::Idle,
            limits,
        },
    );
    store.limiter(|data| &mut data.limits);
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_take() {
        let mut scope: Scope<String> = Scope::Active("request".into());

        match scope.take() {
            Scope::Active(ctx) => assert_eq!(ctx, "request"),
            other => panic!("expected active scope, got {other:?}"),
        }
        assert!(matches!(scope, Scope::Idle));
    }

    #[test]
    fn test_init_state_default() {
        let init = InitState::default();
        assert!(init.features.is_none());
    }

    #[test]
    fn test_create_store() {
        let engine = Engine::default();
        let store = create_store::<()>(&engine, &StoreConfig::default());
        assert!(matches!(store.data().scope, Scope::Idle));
    }
}
