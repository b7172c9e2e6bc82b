use thiserror::Error;

use crate::codec::DecodeError;
use crate::policy::{UpdatePolicy, ValueType};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store name must not be empty")]
    EmptyName,
    #[error("store '{store}': {policy} policy cannot operate on {value_type} values")]
    UnsupportedValueType {
        store: String,
        policy: UpdatePolicy,
        value_type: ValueType,
    },
    #[error(
        "store '{store}' is declared {policy}/{value_type}; operation '{operation}' is not allowed"
    )]
    PolicyMismatch {
        store: String,
        operation: &'static str,
        policy: UpdatePolicy,
        value_type: ValueType,
    },
    #[error("store '{store}', key '{key}': {source}")]
    Decode {
        store: String,
        key: String,
        #[source]
        source: DecodeError,
    },
    #[error("store '{store}': ordinal {ordinal} is below the last written ordinal {last}")]
    OrdinalRegression {
        store: String,
        ordinal: u64,
        last: u64,
    },
    #[error("store '{store}', key '{key}': value would grow to {size} bytes (limit {limit})")]
    ValueTooLarge {
        store: String,
        key: String,
        size: usize,
        limit: usize,
    },
    #[error(
        "store '{store}' ({policy}/{value_type}) cannot take snapshot '{other}' ({other_policy}/{other_type})"
    )]
    IncompatibleSnapshot {
        store: String,
        policy: UpdatePolicy,
        value_type: ValueType,
        other: String,
        other_policy: UpdatePolicy,
        other_type: ValueType,
    },
    #[error("store '{store}' has {count} unflushed write(s); flush before merging")]
    PendingDeltas { store: String, count: usize },
    #[error("snapshot encoding error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}
