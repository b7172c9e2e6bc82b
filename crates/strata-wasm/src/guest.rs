use anyhow::{Context, Result};
use wasmtime::{AsContextMut, Instance, Memory, StoreContextMut, TypedFunc};

use crate::error::RuntimeError;

pub const MEMORY_EXPORT: &str = "memory";
pub const ALLOC_EXPORT: &str = "alloc";
pub const DEALLOC_EXPORT: &str = "dealloc";

/// What the memory bridge needs from a guest: its allocator and its linear
/// memory.
pub trait Guest {
    fn memory_size(&self) -> usize;

    /// Fill `buf` from guest memory at `ptr`.
    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<()>;

    fn allocate(&mut self, len: u32) -> Result<u32>;

    fn deallocate(&mut self, ptr: u32, len: u32) -> Result<()>;
}

/// Exports every guest module must provide.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub alloc: TypedFunc<i32, i32>,
    pub dealloc: TypedFunc<(i32, i32), ()>,
}

impl GuestExports {
    pub fn resolve(
        module: &str,
        instance: &Instance,
        mut store: impl AsContextMut,
    ) -> Result<Self, RuntimeError> {
        let missing = |export: &str| RuntimeError::MissingExport {
            module: module.to_string(),
            export: export.to_string(),
        };
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| missing(MEMORY_EXPORT))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|_| missing(ALLOC_EXPORT))?;
        let dealloc = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, DEALLOC_EXPORT)
            .map_err(|_| missing(DEALLOC_EXPORT))?;
        Ok(Self {
            memory,
            alloc,
            dealloc,
        })
    }
}

/// [`Guest`] backed by a live wasmtime instance.
pub struct WasmGuest<'a, T: 'static> {
    store: StoreContextMut<'a, T>,
    exports: &'a GuestExports,
}

impl<'a, T: 'static> WasmGuest<'a, T> {
    pub fn new(store: StoreContextMut<'a, T>, exports: &'a GuestExports) -> Self {
        Self { store, exports }
    }
}

impl<T: 'static> Guest for WasmGuest<'_, T> {
    fn memory_size(&self) -> usize {
        self.exports.memory.data_size(&self.store)
    }

    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()> {
        self.exports
            .memory
            .read(&self.store, ptr as usize, buf)
            .with_context(|| format!("read {} bytes at {ptr}", buf.len()))
    }

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.exports
            .memory
            .write(&mut self.store, ptr as usize, bytes)
            .with_context(|| format!("write {} bytes at {ptr}", bytes.len()))
    }

    fn allocate(&mut self, len: u32) -> Result<u32> {
        let len = i32::try_from(len).context("allocation too large for wasm32")?;
        let ptr = self.exports.alloc.call(&mut self.store, len)?;
        Ok(ptr as u32)
    }

    fn deallocate(&mut self, ptr: u32, len: u32) -> Result<()> {
        self.exports
            .dealloc
            .call(&mut self.store, (ptr as i32, len as i32))
    }
}
