//! Host function registration for the `http_handler` module.
//!
//! Registers every function the guest can import. All integer parameters are
//! 32-bit; `u64` returns pack two 32-bit halves as `(high << 32) | low`:
//! header getters return `(count << 32) | bytes_len`, body reads return
//! `(eof << 32) | bytes_len`.
//!
//! # Memory protocol
//!
//! Getters take a caller-supplied `(buf, buf_limit)` pair and always return
//! the true payload length; the payload is written only when it fits (see
//! [`wasm_middleware_core::mem`]). Out-of-range guest pointers trap.
//!
//! # Scope dispatch
//!
//! Mutable request state lives in the store's [`Scope`], never in the host
//! module itself; with [`Scope::Idle`] or [`Scope::Init`] installed, request
//! functions answer with zero values and mutators do nothing, which is what
//! makes the prewarm invocation side-effect-free.

use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tracing::debug;
use wasmtime::{Caller, Extern, Linker, Memory};

use wasm_middleware_common::{
    BodyKind, Features, HeaderKind, Host, RuntimeError, GUEST_MEMORY, HOST_MODULE,
};
use wasm_middleware_core::{mem, Scope, StoreData};

use crate::options::Logger;

/// Pack a `(count, bytes_len)` pair into the ABI's u64 return.
fn pack_count_len(count: u32, len: u32) -> u64 {
    (u64::from(count) << 32) | u64::from(len)
}

/// Pack an `(eof, bytes_len)` pair into the ABI's u64 return.
fn pack_eof_len(eof: bool, len: u32) -> u64 {
    (u64::from(eof) << 32) | u64::from(len)
}

/// Locate the guest's exported linear memory from inside a host function.
fn guest_memory<C>(caller: &mut Caller<'_, StoreData<C>>) -> anyhow::Result<Memory> {
    match caller.get_export(GUEST_MEMORY) {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => bail!("guest does not export memory[{GUEST_MEMORY}]"),
    }
}

fn register_err(name: &'static str) -> impl FnOnce(wasmtime::Error) -> RuntimeError {
    move |e| RuntimeError::invalid_config(format!("failed to register {name}: {e}"))
}

/// Every function [`register_host_module`] exports, in registration order.
///
/// Guest import surfaces are validated against this list at construction, so
/// it must stay in step with the registrations below.
pub const HOST_FUNCTIONS: &[&str] = &[
    "enable_features",
    "get_config",
    "log",
    "get_uri",
    "set_uri",
    "get_method",
    "set_method",
    "get_protocol_version",
    "get_header_names",
    "get_header_values",
    "set_header_value",
    "add_header_value",
    "remove_header",
    "read_body",
    "write_body",
    "get_status_code",
    "set_status_code",
    "next",
];

/// Register the complete `http_handler` host module on `linker`.
///
/// The linker is built once per runtime and shared by every instance; the
/// captured `host`, `guest_config` and `logger` are immutable after
/// construction.
pub fn register_host_module<H: Host>(
    linker: &mut Linker<StoreData<H::Ctx>>,
    host: Arc<H>,
    guest_config: Bytes,
    logger: Logger,
) -> Result<(), RuntimeError> {
    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "enable_features",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>, features: u64| -> u64 {
                let requested = Features::from_bits(features);
                let supported = h.enable_features(requested);
                // Only the prewarm invocation fixes the feature set; later
                // calls are idempotent and just report the supported subset.
                if let Scope::Init(init) = &mut caller.data_mut().scope {
                    init.features = supported;
                }
                supported.bits()
            },
        )
        .map_err(register_err("enable_features"))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "get_config",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u32> {
                let memory = guest_memory(&mut caller)?;
                let (data, _state) = memory.data_and_store_mut(&mut caller);
                mem::write_if_under_limit(data, "config", buf, buf_limit, &guest_config)
            },
        )
        .map_err(register_err("get_config"))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "log",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  message: u32,
                  message_len: u32|
                  -> wasmtime::Result<()> {
                if message_len == 0 {
                    return Ok(()); // nothing to log
                }
                let memory = guest_memory(&mut caller)?;
                let (data, _state) = memory.data_and_store_mut(&mut caller);
                let message = mem::read_string(data, "message", message, message_len)?;
                debug!(guest_log = true, "{message}");
                logger(message);
                Ok(())
            },
        )
        .map_err(register_err("log"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_uri",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u32> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let uri = match &state.scope {
                    Scope::Active(ctx) => h.get_uri(ctx),
                    _ => String::new(),
                };
                mem::write_string_if_under_limit(data, "uri", buf, buf_limit, &uri)
            },
        )
        .map_err(register_err("get_uri"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "set_uri",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  uri: u32,
                  uri_len: u32|
                  -> wasmtime::Result<()> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let uri = mem::read_string(data, "uri", uri, uri_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.set_uri(ctx, uri);
                }
                Ok(())
            },
        )
        .map_err(register_err("set_uri"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_method",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u32> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let method = match &state.scope {
                    Scope::Active(ctx) => h.get_method(ctx),
                    _ => String::new(),
                };
                mem::write_string_if_under_limit(data, "method", buf, buf_limit, &method)
            },
        )
        .map_err(register_err("get_method"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "set_method",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  method: u32,
                  method_len: u32|
                  -> wasmtime::Result<()> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let method = mem::read_string(data, "method", method, method_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.set_method(ctx, method);
                }
                Ok(())
            },
        )
        .map_err(register_err("set_method"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_protocol_version",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u32> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let version = match &state.scope {
                    Scope::Active(ctx) => h.get_protocol_version(ctx),
                    _ => String::new(),
                };
                mem::write_string_if_under_limit(data, "protocol version", buf, buf_limit, &version)
            },
        )
        .map_err(register_err("get_protocol_version"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_header_names",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u64> {
                let Some(kind) = HeaderKind::from_raw(kind) else {
                    bail!("unknown header kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let names = match &state.scope {
                    Scope::Active(ctx) => h.get_header_names(ctx, kind),
                    _ => Vec::new(),
                };
                let joined = names.join("\0");
                let len =
                    mem::write_string_if_under_limit(data, "header names", buf, buf_limit, &joined)?;
                Ok(pack_count_len(names.len() as u32, len))
            },
        )
        .map_err(register_err("get_header_names"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_header_values",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  name: u32,
                  name_len: u32,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u64> {
                let Some(kind) = HeaderKind::from_raw(kind) else {
                    bail!("unknown header kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let values = {
                    let name = mem::read_string(data, "name", name, name_len)?;
                    match &state.scope {
                        Scope::Active(ctx) => h.get_header_values(ctx, kind, name),
                        _ => Vec::new(),
                    }
                };
                let joined = values.join("\0");
                let len = mem::write_string_if_under_limit(
                    data,
                    "header values",
                    buf,
                    buf_limit,
                    &joined,
                )?;
                Ok(pack_count_len(values.len() as u32, len))
            },
        )
        .map_err(register_err("get_header_values"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "set_header_value",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  name: u32,
                  name_len: u32,
                  value: u32,
                  value_len: u32|
                  -> wasmtime::Result<()> {
                let Some(kind) = HeaderKind::from_raw(kind) else {
                    bail!("unknown header kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let name = mem::read_string(data, "name", name, name_len)?;
                let value = mem::read_string(data, "value", value, value_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.set_header_value(ctx, kind, name, value);
                }
                Ok(())
            },
        )
        .map_err(register_err("set_header_value"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "add_header_value",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  name: u32,
                  name_len: u32,
                  value: u32,
                  value_len: u32|
                  -> wasmtime::Result<()> {
                let Some(kind) = HeaderKind::from_raw(kind) else {
                    bail!("unknown header kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let name = mem::read_string(data, "name", name, name_len)?;
                let value = mem::read_string(data, "value", value, value_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.add_header_value(ctx, kind, name, value);
                }
                Ok(())
            },
        )
        .map_err(register_err("add_header_value"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "remove_header",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  name: u32,
                  name_len: u32|
                  -> wasmtime::Result<()> {
                let Some(kind) = HeaderKind::from_raw(kind) else {
                    bail!("unknown header kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let name = mem::read_string(data, "name", name, name_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.remove_header(ctx, kind, name);
                }
                Ok(())
            },
        )
        .map_err(register_err("remove_header"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "read_body",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  buf: u32,
                  buf_limit: u32|
                  -> wasmtime::Result<u64> {
                let Some(kind) = BodyKind::from_raw(kind) else {
                    bail!("unknown body kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let (chunk, eof) = match &mut state.scope {
                    Scope::Active(ctx) => h.read_body(ctx, kind, buf_limit as usize),
                    _ => (Bytes::new(), true),
                };
                if chunk.len() > buf_limit as usize {
                    bail!(
                        "host produced {} body bytes for a {buf_limit} byte buffer",
                        chunk.len()
                    );
                }
                mem::write(data, "body", buf, &chunk)?;
                Ok(pack_eof_len(eof, chunk.len() as u32))
            },
        )
        .map_err(register_err("read_body"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "write_body",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>,
                  kind: u32,
                  body: u32,
                  body_len: u32|
                  -> wasmtime::Result<()> {
                let Some(kind) = BodyKind::from_raw(kind) else {
                    bail!("unknown body kind: {kind}");
                };
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                // A zero-length write clears the body, so it still dispatches.
                let body = mem::read(data, "body", body, body_len)?;
                if let Scope::Active(ctx) = &mut state.scope {
                    h.write_body(ctx, kind, body);
                }
                Ok(())
            },
        )
        .map_err(register_err("write_body"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "get_status_code",
            move |caller: Caller<'_, StoreData<H::Ctx>>| -> u32 {
                match &caller.data().scope {
                    Scope::Active(ctx) => u32::from(h.get_status_code(ctx)),
                    _ => 200,
                }
            },
        )
        .map_err(register_err("get_status_code"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "set_status_code",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>, status_code: u32| {
                if let Scope::Active(ctx) = &mut caller.data_mut().scope {
                    // Out-of-range codes are passed through as 0 and rejected
                    // by the adapter.
                    let status = u16::try_from(status_code).unwrap_or(0);
                    h.set_status_code(ctx, status);
                }
            },
        )
        .map_err(register_err("set_status_code"))?;

    let h = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "next",
            move |mut caller: Caller<'_, StoreData<H::Ctx>>| {
                if let Scope::Active(ctx) = &mut caller.data_mut().scope {
                    h.next(ctx);
                }
            },
        )
        .map_err(register_err("next"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_middleware_common::NopHost;
    use wasmtime::Engine;

    #[test]
    fn test_pack_count_len() {
        assert_eq!(pack_count_len(0, 0), 0);
        assert_eq!(pack_count_len(1, 4096), 0x1_0000_1000);
        assert_eq!(pack_count_len(3, 17), (3 << 32) | 17);
    }

    #[test]
    fn test_pack_eof_len() {
        assert_eq!(pack_eof_len(false, 10), 10);
        assert_eq!(pack_eof_len(true, 0), 1 << 32);
        assert_eq!(pack_eof_len(true, 5), (1 << 32) | 5);
    }

    #[test]
    fn test_host_functions_has_no_duplicates() {
        let mut names = HOST_FUNCTIONS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HOST_FUNCTIONS.len());
    }

    #[test]
    fn test_register_host_module() {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);

        let result = register_host_module(
            &mut linker,
            Arc::new(NopHost),
            Bytes::new(),
            Arc::new(|_| {}),
        );
        assert!(result.is_ok());
    }
}
