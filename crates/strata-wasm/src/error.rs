use strata_state::StoreError;
use thiserror::Error;

/// Failures of the memory bridge.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("guest allocation of {len} bytes failed: {source}")]
    Allocation {
        len: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("range {ptr}+{len} lies outside guest memory ({memory_size} bytes)")]
    OutOfBounds {
        ptr: u32,
        len: usize,
        memory_size: usize,
    },
    #[error(
        "failed to free {len} bytes at {ptr}; {remaining} allocation(s) still tracked: {source}"
    )]
    ResourceLeak {
        ptr: u32,
        len: u32,
        remaining: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("guest string at {ptr} is not UTF-8: {source}")]
    Decode {
        ptr: u32,
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("heap is poisoned by an earlier failed clear")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("wasm runtime error: {0}")]
    Wasm(#[from] anyhow::Error),
    #[error("memory bridge error: {0}")]
    Heap(#[from] HeapError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("module '{module}' does not export '{export}'")]
    MissingExport { module: String, export: String },
    #[error("host import called before the guest exports were bound")]
    Unbound,
    #[error("module '{0}' declares no output store")]
    NoOutputStore(String),
    #[error("input store index {index} out of range ({count} declared)")]
    UnknownStore { index: i32, count: usize },
    #[error("negative ordinal {0}")]
    NegativeOrdinal(i64),
    #[error("module '{0}' was cancelled")]
    Cancelled(String),
    #[error("module '{0}' is poisoned and must be re-instantiated")]
    Poisoned(String),
}
