//! Sandboxed execution of transformation modules over wasmtime.
//!
//! [`Heap`] marshals buffers across the host/guest boundary; [`ModuleRuntime`]
//! compiles and caches modules; a [`ModuleInstance`] is one shard that runs a
//! module block by block against its stores.

pub mod error;
pub mod guest;
pub mod heap;
pub mod host;
pub mod imports;
pub mod instance;
pub mod runtime;

pub use error::{HeapError, RuntimeError};
pub use guest::{Guest, GuestExports, WasmGuest};
pub use heap::{Allocation, Heap, HeapState};
pub use host::HostState;
pub use imports::{STATE_NAMESPACE, register_state_imports};
pub use instance::{BlockOutput, CancelHandle, ModuleDescriptor, ModuleInstance};
pub use runtime::{DEFAULT_ENTRYPOINT, ModuleRuntime, RuntimeConfig};
