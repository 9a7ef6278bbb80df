//! WASM message handler (§4.2, §6.4). The engine and compiled module are shared,
//! reference-counted, read-only; each shard builds its own `Store`/`Instance` on its own
//! worker thread, since wasmtime stores cannot cross threads (mirrors the original's
//! `WASMMessageHandler`, which holds a per-instance `mutable Store` next to a
//! `shared_ptr<Engine>`/`shared_ptr<Module>`).

use std::sync::Arc;

use wasmtime::{Engine, Instance, Module, Store, TypedFunc};

use crate::error::{ProtocolError, WasmError};
use crate::handler::{HeaderResult, HeaderStatus, ResponsePacket};

/// Shared, immutable compiled module plus its engine. Cheap to clone (both are
/// internally reference-counted by wasmtime); building a `WasmHandler` from this is the
/// only per-shard-thread-sensitive step.
#[derive(Clone)]
pub struct WasmModuleSource {
    engine: Arc<Engine>,
    module: Arc<Module>,
}

impl WasmModuleSource {
    pub fn compile(bytes: &[u8]) -> Result<Self, WasmError> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).map_err(|e| WasmError::Compile(e.to_string()))?;
        Ok(WasmModuleSource {
            engine: Arc::new(engine),
            module: Arc::new(module),
        })
    }

    /// Builds a fresh store + instance pair, exactly the per-shard-thread-only step the
    /// original delays to `thread_entry()`.
    pub fn instantiate(&self) -> Result<WasmHandler, WasmError> {
        let mut store = Store::new(&self.engine, ());
        let instance = Instance::new(&mut store, &self.module, &[])
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;

        let alloc: TypedFunc<u32, u32> = instance
            .get_typed_func(&mut store, "alloc")
            .map_err(|_| WasmError::MissingExport("alloc"))?;
        let dealloc: TypedFunc<(u32, u32), ()> = instance
            .get_typed_func(&mut store, "dealloc")
            .map_err(|_| WasmError::MissingExport("dealloc"))?;
        let handle_body: TypedFunc<(u32, u32), u64> = instance
            .get_typed_func(&mut store, "handle_body")
            .map_err(|_| WasmError::MissingExport("handle_body"))?;
        let handle_header: Option<TypedFunc<(u32, u32), u32>> =
            instance.get_typed_func(&mut store, "handle_header").ok();

        Ok(WasmHandler {
            store,
            instance,
            alloc,
            dealloc,
            handle_body,
            handle_header,
        })
    }
}

/// Per-shard WASM handler instance. Not `Send`/`Sync` by construction (wasmtime's
/// `Store` isn't either) — one of these is built per shard worker thread and never
/// crosses it.
pub struct WasmHandler {
    store: Store<()>,
    instance: Instance,
    alloc: TypedFunc<u32, u32>,
    dealloc: TypedFunc<(u32, u32), ()>,
    handle_body: TypedFunc<(u32, u32), u64>,
    handle_header: Option<TypedFunc<(u32, u32), u32>>,
}

impl WasmHandler {
    fn memory(&mut self) -> wasmtime::Memory {
        self.instance
            .get_memory(&mut self.store, "memory")
            .expect("wasm module must export linear memory named 'memory'")
    }

    /// Allocates scratch space, copies `data` in, invokes `call`, and deallocates
    /// afterwards regardless of the call's outcome.
    fn with_scratch<T>(
        &mut self,
        data: &[u8],
        call: impl FnOnce(&mut Self, u32, u32) -> Result<T, wasmtime::Error>,
    ) -> Result<T, WasmError> {
        let len = data.len() as u32;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| WasmError::Trap(e.to_string()))?;

        let memory = self.memory();
        memory
            .write(&mut self.store, ptr as usize, data)
            .map_err(|e| WasmError::Trap(e.to_string()))?;

        let result = call(self, ptr, len);

        let _ = self.dealloc.call(&mut self.store, (ptr, len));

        result.map_err(|e| WasmError::Trap(e.to_string()))
    }

    pub fn parse_header(&mut self, buf: &[u8]) -> HeaderResult {
        let outcome = match self.handle_header {
            None => return HeaderResult::ok(0),
            Some(_) => {
                let buf = buf.to_vec();
                self.with_scratch(&buf, |this, ptr, len| {
                    let export = this.handle_header.unwrap();
                    export.call(&mut this.store, (ptr, len))
                })
            }
        };

        match outcome {
            Ok(length) => HeaderResult::ok(length as usize),
            Err(_) => HeaderResult { length: 0, status: HeaderStatus::Error },
        }
    }

    pub fn parse_message(
        &mut self,
        _header: &[u8],
        body: &[u8],
    ) -> Result<ResponsePacket, ProtocolError> {
        let body = body.to_vec();
        let packed = self
            .with_scratch(&body, |this, ptr, len| {
                this.handle_body.call(&mut this.store, (ptr, len))
            })
            .map_err(|_| ProtocolError)?;

        if packed == 0 {
            return Ok(Vec::new());
        }

        let response_ptr = (packed & 0xffff_ffff) as u32;
        let response_len = (packed >> 32) as u32;

        let memory = self.memory();
        let mut response = vec![0u8; response_len as usize];
        memory
            .read(&self.store, response_ptr as usize, &mut response)
            .map_err(|_| ProtocolError)?;

        let _ = self
            .dealloc
            .call(&mut self.store, (response_ptr, response_len));

        Ok(response)
    }
}

/// `HandlerFactory` impl for the WASM variant: clones the shared engine/module handles
/// and instantiates a private store per call, so each shard gets its own `WasmHandler`.
pub struct WasmHandlerFactory {
    source: WasmModuleSource,
}

impl WasmHandlerFactory {
    pub fn new(source: WasmModuleSource) -> Self {
        WasmHandlerFactory { source }
    }
}

impl crate::handler::HandlerFactory for WasmHandlerFactory {
    fn build(&self) -> crate::handler::Handler {
        match self.source.instantiate() {
            Ok(handler) => crate::handler::Handler::Wasm(handler),
            Err(err) => panic!("failed to instantiate wasm handler: {}", err),
        }
    }
}
