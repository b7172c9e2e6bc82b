//! Shared wasmtime engine and compiled-module cache.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use strata_cbor::Digest;
use wasmtime::{Config, Engine, Module};

use crate::error::RuntimeError;
use crate::instance::{CancelHandle, ModuleDescriptor, ModuleInstance};

/// Entrypoint called when a descriptor names none.
pub const DEFAULT_ENTRYPOINT: &str = "process_block";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub default_entrypoint: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_entrypoint: DEFAULT_ENTRYPOINT.into(),
        }
    }
}

/// Deterministic wasmtime engine shared by every shard of a run.
///
/// Compiled modules are kept in memory keyed by the digest of their binary,
/// so instantiating many shards of one module compiles it once.
pub struct ModuleRuntime {
    engine: Arc<Engine>,
    config: RuntimeConfig,
    module_cache: Mutex<HashMap<Digest, Arc<Module>>>,
}

impl ModuleRuntime {
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Build a runtime with deterministic configuration: no threads, no fuel,
    /// canonical NaNs, and epoch interruption for cancellation.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.wasm_multi_value(true);
        cfg.wasm_threads(false);
        cfg.consume_fuel(false);
        cfg.debug_info(false);
        cfg.cranelift_nan_canonicalization(true);
        cfg.epoch_interruption(true);
        let engine = Engine::new(&cfg)?;
        Ok(Self {
            engine: Arc::new(engine),
            config,
            module_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compiled module for `wasm_bytes`, compiling on first use.
    pub fn cached_module(&self, wasm_bytes: &[u8]) -> Result<Arc<Module>> {
        let key = Digest::of_bytes(wasm_bytes);
        if let Some(existing) = self.get_cached_module(&key) {
            return Ok(existing);
        }

        log::debug!("compiling module {key}");
        let compiled = Arc::new(Module::new(&self.engine, wasm_bytes)?);
        Ok(self.insert_cached_module(key, compiled))
    }

    /// Instantiate one shard of `descriptor`.
    pub fn instantiate(&self, descriptor: &ModuleDescriptor) -> Result<ModuleInstance, RuntimeError> {
        let module = self.cached_module(&descriptor.binary)?;
        ModuleInstance::new(self, &module, descriptor)
    }

    pub(crate) fn cancel_handle(&self, flag: Arc<AtomicBool>) -> CancelHandle {
        CancelHandle::new(self.engine.clone(), flag)
    }

    fn get_cached_module(&self, key: &Digest) -> Option<Arc<Module>> {
        self.module_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Two threads may compile the same binary at once; the first insert wins.
    fn insert_cached_module(&self, key: Digest, module: Arc<Module>) -> Arc<Module> {
        let mut cache = self
            .module_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cache.entry(key).or_insert(module).clone()
    }

    #[cfg(test)]
    fn cached_module_count(&self) -> usize {
        self.module_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
