use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use strata_state::Builder;
use wasmtime::{AsContextMut, StoreContextMut};

use crate::error::{HeapError, RuntimeError};
use crate::guest::{GuestExports, WasmGuest};
use crate::heap::Heap;

/// Per-instance data held in the wasmtime store.
pub struct HostState {
    pub(crate) module: String,
    pub(crate) heap: Heap,
    pub(crate) exports: Option<GuestExports>,
    pub(crate) writer: Option<Builder>,
    pub(crate) readers: Vec<Builder>,
    pub(crate) output: Option<Vec<u8>>,
    pub(crate) cancelled: Arc<AtomicBool>,
    /// Only the entrypoint call may be interrupted; heap cleanup never is.
    pub(crate) interruptible: bool,
}

impl HostState {
    pub(crate) fn new(module: String, writer: Option<Builder>, readers: Vec<Builder>) -> Self {
        Self {
            module,
            heap: Heap::new(),
            exports: None,
            writer,
            readers,
            output: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            interruptible: false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn writer_mut(&mut self) -> Result<&mut Builder, RuntimeError> {
        self.writer
            .as_mut()
            .ok_or_else(|| RuntimeError::NoOutputStore(self.module.clone()))
    }

    pub(crate) fn reader(&self, index: i32) -> Result<&Builder, RuntimeError> {
        usize::try_from(index)
            .ok()
            .and_then(|idx| self.readers.get(idx))
            .ok_or(RuntimeError::UnknownStore {
                index,
                count: self.readers.len(),
            })
    }
}

/// Run `f` against the instance heap, with the guest borrowed out of the
/// store.
///
/// The heap is moved out of the store for the duration of the call so the
/// guest can hold the store mutably; a guest allocator that re-enters a host
/// import sees an empty heap.
pub(crate) fn with_heap<R>(
    mut cx: StoreContextMut<'_, HostState>,
    f: impl FnOnce(&mut Heap, &mut WasmGuest<'_, HostState>) -> Result<R, HeapError>,
) -> Result<R, RuntimeError> {
    let exports = cx.data().exports.clone().ok_or(RuntimeError::Unbound)?;
    let mut heap = mem::take(&mut cx.data_mut().heap);
    let result = {
        let mut guest = WasmGuest::new(cx.as_context_mut(), &exports);
        f(&mut heap, &mut guest)
    };
    cx.data_mut().heap = heap;
    Ok(result?)
}
