//! Keyed accumulator stores written by transformation modules.
//!
//! A [`Builder`] holds one store: values under a fixed [`UpdatePolicy`] and
//! [`ValueType`], kept in canonical encoding so two shards that saw the same
//! writes end with byte-identical snapshots.

pub mod bigfloat;
pub mod builder;
pub mod codec;
pub mod delta;
pub mod error;
pub mod policy;
pub mod snapshot;

pub use bigfloat::{BigFloat, FloatContext, ParseBigFloatError, RoundingMode};
pub use builder::Builder;
pub use codec::{DecodeError, NumericValue};
pub use delta::{DeltaOperation, StoreDelta};
pub use error::{StoreError, StoreResult};
pub use num_bigint::BigInt;
pub use policy::{
    BIG_FLOAT_PRECISION, BIG_FLOAT_ROUNDING, MAX_APPEND_VALUE_SIZE, StoreConfig, UpdatePolicy,
    ValueType,
};
pub use snapshot::{SnapshotEntry, StoreSnapshot};
