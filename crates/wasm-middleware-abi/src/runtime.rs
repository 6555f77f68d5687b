//! Guest lifecycle: compile, validate, prewarm, pool, invoke.
//!
//! A [`Runtime`] owns everything shared between requests: the engine, the
//! compiled guest module, the linker with the `http_handler` host module
//! registered, and the idle-instance pool. Per-request state enters through
//! [`Runtime::handle`] and leaves with it; the runtime itself is immutable
//! after construction apart from the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wasmtime::{
    Config, Engine, ExternType, InstanceAllocationStrategy, Linker, Module,
    PoolingAllocationConfig, Store, TypedFunc,
};

use wasm_middleware_common::{
    Features, Host, RuntimeError, StoreConfig, GUEST_ENTRYPOINT, GUEST_MEMORY, HOST_MODULE,
};
use wasm_middleware_core::{create_store, InitState, Scope, StoreData};

use crate::linker::{register_host_module, HOST_FUNCTIONS};
use crate::options::RuntimeOptions;
use crate::pool::InstancePool;

/// One live guest instance: a store, its instance, and the typed entry point.
///
/// Not thread-safe by construction: exactly one request owns a `Guest` at a
/// time, enforced by the pool.
pub(crate) struct Guest<C> {
    pub(crate) id: u64,
    pub(crate) store: Store<StoreData<C>>,
    handle: TypedFunc<(), ()>,
}

impl<C: Send + 'static> Guest<C> {
    fn call_handle(&mut self) -> wasmtime::Result<()> {
        self.handle.call(&mut self.store, ())
    }
}

/// The middleware runtime: compiled guest + host module + instance pool.
///
/// `H` is the [`Host`] implementation the ABI dispatches to; `H::Ctx` is the
/// per-request state threaded through [`Runtime::handle`].
pub struct Runtime<H: Host> {
    engine: Engine,
    module: Module,
    linker: Linker<StoreData<H::Ctx>>,
    store_config: StoreConfig,
    pool: InstancePool<H::Ctx>,
    features: Features,
    instances_created: AtomicU64,
}

impl<H: Host> Runtime<H> {
    /// Build a runtime for `guest`, dispatching host calls to `host`.
    ///
    /// Compiles and validates the guest, registers the host module, then
    /// eagerly instantiates one guest and runs its entry point under an
    /// init scope: this surfaces initialization failures at construction
    /// time and gives the guest its one chance to call `enable_features`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the engine cannot be built or the
    /// guest violates the middleware contract (does not compile, is missing
    /// the `handle`/`memory` exports, or imports anything this host does not
    /// provide); an instantiation error or trap if the prewarm instance
    /// fails.
    pub fn new(guest: &[u8], host: Arc<H>, options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let engine = match options.engine {
            Some(engine) => engine,
            None => build_engine(options.pooled_instances, &options.store_config)?,
        };

        let module = compile_guest(&engine, guest)?;

        let mut linker = Linker::new(&engine);
        register_host_module(&mut linker, host, options.guest_config, options.logger)?;

        let mut runtime = Self {
            engine,
            module,
            linker,
            store_config: options.store_config,
            pool: InstancePool::new(),
            features: Features::none(),
            instances_created: AtomicU64::new(0),
        };

        // One eager instance: initialization failures surface here instead of
        // on the first request, and the init invocation fixes the feature set.
        let mut guest = runtime.new_guest()?;
        guest.store.data_mut().scope = Scope::Init(InitState::default());
        let result = guest.call_handle();
        let scope = guest.store.data_mut().scope.take();
        result.map_err(|e| RuntimeError::trap(format!("guest init invocation failed: {e}")))?;

        if let Scope::Init(init) = scope {
            runtime.features = init.features;
        }
        runtime.pool.release(guest);

        info!(features = %runtime.features, "Middleware runtime ready");
        Ok(runtime)
    }

    /// Handle one request by invoking the guest entry point with `ctx`
    /// installed as the request scope.
    ///
    /// Acquires an idle instance (instantiating a fresh one when the pool is
    /// empty) and returns it to the pool when the guest returns cleanly. An
    /// instance that traps is discarded: its linear memory may be
    /// inconsistent.
    ///
    /// # Errors
    ///
    /// Returns an instantiation error if a fresh guest could not be created,
    /// or a trap error if the guest trapped; in both cases `ctx` is lost and
    /// the adapter fails the request.
    pub fn handle(&self, ctx: H::Ctx) -> Result<H::Ctx, RuntimeError> {
        let mut guest = match self.pool.acquire() {
            Some(guest) => guest,
            None => self.new_guest()?,
        };

        guest.store.data_mut().scope = Scope::Active(ctx);
        let result = guest.call_handle();
        let scope = guest.store.data_mut().scope.take();

        match result {
            Ok(()) => {
                self.pool.release(guest);
                match scope {
                    Scope::Active(ctx) => Ok(ctx),
                    // The scope is only replaced by this function and the
                    // constructor, so this does not happen.
                    _ => Err(RuntimeError::trap("request scope disappeared")),
                }
            }
            Err(e) => {
                warn!(instance_id = guest.id, error = %e, "Guest trapped; discarding instance");
                Err(RuntimeError::trap(e.to_string()))
            }
        }
    }

    /// The feature set negotiated during construction.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Number of idle instances currently in the pool.
    pub fn idle_instances(&self) -> usize {
        self.pool.idle_count()
    }

    /// Total instances created over the runtime's lifetime, including the
    /// prewarm instance and any later discarded ones.
    pub fn instances_created(&self) -> u64 {
        self.instances_created.load(Ordering::Relaxed)
    }

    /// Instantiate a fresh guest in its own store.
    fn new_guest(&self) -> Result<Guest<H::Ctx>, RuntimeError> {
        let mut store = create_store(&self.engine, &self.store_config);

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| RuntimeError::instantiation(e.to_string()))?;

        let handle = instance
            .get_typed_func::<(), ()>(&mut store, GUEST_ENTRYPOINT)
            .map_err(|e| {
                RuntimeError::invalid_guest(format!(
                    "guest doesn't export func[{GUEST_ENTRYPOINT}]: {e}"
                ))
            })?;

        let id = self.instances_created.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(instance_id = id, "Guest instantiated");

        Ok(Guest { id, store, handle })
    }
}

impl<H: Host> std::fmt::Debug for Runtime<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("features", &self.features)
            .field("idle_instances", &self.pool.idle_count())
            .finish_non_exhaustive()
    }
}

/// Build the engine guests run on.
///
/// The default is on-demand allocation: the guest-facing instance pool
/// already keeps warm instances around, so pre-allocation only matters when
/// the embedder expects bursts of cold instantiations. When slot pooling is
/// requested, every slot is sized from the same per-instance limits the
/// stores enforce, so the two layers agree on what a guest may use.
fn build_engine(
    pooled_instances: Option<u32>,
    store_config: &StoreConfig,
) -> Result<Engine, RuntimeError> {
    let Some(max_instances) = pooled_instances else {
        return Ok(Engine::default());
    };

    let mut slots = PoolingAllocationConfig::default();
    slots.total_core_instances(max_instances);
    slots.total_memories(max_instances);
    slots.total_tables(max_instances);
    slots.max_memory_size(store_config.max_memory_bytes);
    slots.table_elements(store_config.max_table_elements.try_into().unwrap());

    let mut config = Config::new();
    config.allocation_strategy(InstanceAllocationStrategy::Pooling(slots));

    Engine::new(&config)
        .map_err(|e| RuntimeError::invalid_config(format!("failed to create engine: {e}")))
}

/// Compile the guest and check the middleware contract:
///
/// - a nullary `handle` export and a linear memory named `memory`;
/// - an import surface confined to the `http_handler` functions this host
///   registers, so a guest built against the wrong world (WASI, another host
///   version) is rejected here with a contract error instead of surfacing as
///   a link failure on some later request.
fn compile_guest(engine: &Engine, bytes: &[u8]) -> Result<Module, RuntimeError> {
    let module = Module::new(engine, bytes)
        .map_err(|e| RuntimeError::compilation(format!("guest compilation failed: {e}")))?;

    let mut handle_ty = None;
    let mut has_memory = false;
    for export in module.exports() {
        match (export.name(), export.ty()) {
            (GUEST_ENTRYPOINT, ExternType::Func(ty)) => handle_ty = Some(ty),
            (GUEST_MEMORY, ExternType::Memory(_)) => has_memory = true,
            _ => {}
        }
    }

    match handle_ty {
        None => {
            return Err(RuntimeError::invalid_guest(format!(
                "guest doesn't export func[{GUEST_ENTRYPOINT}]"
            )))
        }
        Some(ty) if ty.params().len() != 0 || ty.results().len() != 0 => {
            return Err(RuntimeError::invalid_guest(format!(
                "guest exports the wrong signature for func[{GUEST_ENTRYPOINT}]: \
                 must take no parameters and return nothing"
            )))
        }
        Some(_) => {}
    }

    if !has_memory {
        return Err(RuntimeError::invalid_guest(format!(
            "guest doesn't export memory[{GUEST_MEMORY}]"
        )));
    }

    for import in module.imports() {
        if import.module() != HOST_MODULE {
            return Err(RuntimeError::invalid_guest(format!(
                "guest imports {}.{}; only {HOST_MODULE} host functions are provided",
                import.module(),
                import.name()
            )));
        }
        if !HOST_FUNCTIONS.contains(&import.name()) {
            return Err(RuntimeError::invalid_guest(format!(
                "guest imports unknown host function {HOST_MODULE}.{}",
                import.name()
            )));
        }
    }

    Ok(module)
}
