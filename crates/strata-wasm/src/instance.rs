use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use strata_state::{Builder, StoreConfig, StoreDelta, StoreResult, StoreSnapshot};
use wasmtime::{AsContextMut, Engine, Linker, Module, Store, TypedFunc, UpdateDeadline};

use crate::error::RuntimeError;
use crate::guest::GuestExports;
use crate::heap::{Allocation, HeapState};
use crate::host::{HostState, with_heap};
use crate::imports::register_state_imports;
use crate::runtime::ModuleRuntime;

/// A validated module as handed over by the manifest layer.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub binary: Vec<u8>,
    /// Export called once per block; the runtime default when unset.
    pub entrypoint: Option<String>,
    pub output_store: Option<StoreConfig>,
    pub input_stores: Vec<StoreConfig>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, binary: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            binary,
            entrypoint: None,
            output_store: None,
            input_stores: Vec::new(),
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_output_store(mut self, config: StoreConfig) -> Self {
        self.output_store = Some(config);
        self
    }

    pub fn with_input_store(mut self, config: StoreConfig) -> Self {
        self.input_stores.push(config);
        self
    }
}

/// Stops the guest call of one instance from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    engine: Arc<Engine>,
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub(crate) fn new(engine: Arc<Engine>, flag: Arc<AtomicBool>) -> Self {
        Self { engine, flag }
    }

    /// Flag the instance and bump the engine epoch so the running call traps
    /// at its next deadline check. The heap is still cleared afterwards.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What one block produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockOutput {
    pub output: Option<Vec<u8>>,
    pub deltas: Vec<StoreDelta>,
}

/// One shard: a guest instance with its own heap and stores.
pub struct ModuleInstance {
    name: String,
    store: Store<HostState>,
    entrypoint: TypedFunc<(i32, i32), ()>,
    cancel: CancelHandle,
    poisoned: bool,
}

impl ModuleInstance {
    pub(crate) fn new(
        runtime: &ModuleRuntime,
        module: &Module,
        descriptor: &ModuleDescriptor,
    ) -> Result<Self, RuntimeError> {
        let writer = descriptor
            .output_store
            .clone()
            .map(Builder::new)
            .transpose()?;
        let readers = descriptor
            .input_stores
            .iter()
            .cloned()
            .map(Builder::new)
            .collect::<StoreResult<Vec<_>>>()?;
        let state = HostState::new(descriptor.name.clone(), writer, readers);
        let cancel = runtime.cancel_handle(state.cancelled.clone());

        let mut store = Store::new(runtime.engine(), state);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|cx| {
            let state = cx.data();
            if state.interruptible && state.is_cancelled() {
                return Err(anyhow::Error::new(RuntimeError::Cancelled(
                    state.module.clone(),
                )));
            }
            Ok(UpdateDeadline::Continue(1))
        });

        let mut linker = Linker::new(runtime.engine());
        register_state_imports(&mut linker)?;
        let instance = linker.instantiate(&mut store, module)?;
        let exports = GuestExports::resolve(&descriptor.name, &instance, &mut store)?;
        let entrypoint_name = descriptor
            .entrypoint
            .as_deref()
            .unwrap_or(&runtime.config().default_entrypoint);
        let entrypoint = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, entrypoint_name)
            .map_err(|_| RuntimeError::MissingExport {
                module: descriptor.name.clone(),
                export: entrypoint_name.to_string(),
            })?;
        store.data_mut().exports = Some(exports);

        Ok(Self {
            name: descriptor.name.clone(),
            store,
            entrypoint,
            cancel,
            poisoned: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn heap_state(&self) -> HeapState {
        self.store.data().heap.state()
    }

    pub fn output_store(&self) -> Option<&Builder> {
        self.store.data().writer.as_ref()
    }

    /// For seeding the output store before the first block.
    pub fn output_store_mut(&mut self) -> Option<&mut Builder> {
        self.store.data_mut().writer.as_mut()
    }

    pub fn input_store(&self, index: usize) -> Option<&Builder> {
        self.store.data().readers.get(index)
    }

    pub fn input_store_mut(&mut self, index: usize) -> Option<&mut Builder> {
        self.store.data_mut().readers.get_mut(index)
    }

    /// Replace input store `index` with the contents of `snapshot`.
    pub fn load_input_snapshot(
        &mut self,
        index: usize,
        snapshot: &StoreSnapshot,
    ) -> Result<(), RuntimeError> {
        let readers = &mut self.store.data_mut().readers;
        let count = readers.len();
        let slot = readers.get_mut(index).ok_or(RuntimeError::UnknownStore {
            index: i32::try_from(index).unwrap_or(i32::MAX),
            count,
        })?;
        *slot = Builder::from_snapshot_with(slot.config().clone(), snapshot)?;
        Ok(())
    }

    /// Run the entrypoint over one block.
    ///
    /// The heap is cleared afterwards whether or not the call succeeded. On
    /// failure the output store's writes for this block are rolled back and
    /// the call error is returned; a failed clear also poisons the instance.
    pub fn process_block(&mut self, input: &[u8]) -> Result<BlockOutput, RuntimeError> {
        if self.poisoned {
            return Err(RuntimeError::Poisoned(self.name.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled(self.name.clone()));
        }
        self.store.set_epoch_deadline(1);
        self.store.data_mut().output = None;

        let call = self.call_entrypoint(input);

        self.store.set_epoch_deadline(1);
        let cleared = with_heap(self.store.as_context_mut(), |heap, guest| heap.clear(guest));
        if let Err(err) = &cleared {
            self.poisoned = true;
            log::warn!("module '{}' poisoned: {err}", self.name);
        }

        match call.and(cleared) {
            Ok(()) => {
                let state = self.store.data_mut();
                let deltas = state
                    .writer
                    .as_mut()
                    .map(Builder::flush)
                    .unwrap_or_default();
                Ok(BlockOutput {
                    output: state.output.take(),
                    deltas,
                })
            }
            Err(err) => {
                let state = self.store.data_mut();
                state.output = None;
                if let Some(writer) = state.writer.as_mut() {
                    writer.rollback();
                }
                Err(err)
            }
        }
    }

    /// Drop the instance, returning whatever the heap could not free.
    pub fn teardown(mut self) -> Vec<Allocation> {
        let leaked = self.store.data_mut().heap.reset();
        if !leaked.is_empty() {
            log::warn!(
                "module '{}' torn down with {} leaked allocation(s)",
                self.name,
                leaked.len()
            );
        }
        leaked
    }

    fn call_entrypoint(&mut self, input: &[u8]) -> Result<(), RuntimeError> {
        let len = i32::try_from(input.len()).context("block input too large for wasm32")?;
        let ptr = with_heap(self.store.as_context_mut(), |heap, guest| heap.write(guest, input))?;

        self.store.data_mut().interruptible = true;
        let result = self.entrypoint.call(&mut self.store, (ptr as i32, len));
        self.store.data_mut().interruptible = false;
        result.map_err(|err| self.classify(err))
    }

    /// Recover host errors raised inside imports; anything else is a trap.
    fn classify(&self, err: anyhow::Error) -> RuntimeError {
        if self.cancel.is_cancelled() {
            log::warn!("module '{}' cancelled mid-block", self.name);
            return RuntimeError::Cancelled(self.name.clone());
        }
        match err.downcast::<RuntimeError>() {
            Ok(err) => err,
            Err(err) => RuntimeError::Wasm(err),
        }
    }
}
