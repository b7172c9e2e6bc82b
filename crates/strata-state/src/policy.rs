//! Merge policies, value types and the per-store configuration handed over by
//! the manifest layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bigfloat::RoundingMode;

/// Mantissa bits kept by arbitrary-precision float sums.
pub const BIG_FLOAT_PRECISION: u32 = 100;

/// Rounding applied whenever a big float result exceeds [`BIG_FLOAT_PRECISION`].
pub const BIG_FLOAT_ROUNDING: RoundingMode = RoundingMode::NearestEven;

/// Upper bound for a single value grown through `append`.
pub const MAX_APPEND_VALUE_SIZE: usize = 8 * 1024 * 1024;

/// How a new value combines with the one already stored under a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    Set,
    SetIfNotExists,
    Append,
    Sum,
    Min,
    Max,
}

impl UpdatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePolicy::Set => "set",
            UpdatePolicy::SetIfNotExists => "set_if_not_exists",
            UpdatePolicy::Append => "append",
            UpdatePolicy::Sum => "sum",
            UpdatePolicy::Min => "min",
            UpdatePolicy::Max => "max",
        }
    }

    /// Whether the store can evaluate this policy over `value_type`.
    pub fn supports(&self, value_type: ValueType) -> bool {
        match self {
            UpdatePolicy::Set | UpdatePolicy::SetIfNotExists => true,
            UpdatePolicy::Append => !value_type.is_numeric(),
            UpdatePolicy::Sum | UpdatePolicy::Min | UpdatePolicy::Max => value_type.is_numeric(),
        }
    }

    /// Folding shard deltas with this policy gives the same result in any order.
    ///
    /// `Set`, `SetIfNotExists` and `Append` must be folded in block order.
    pub fn is_order_independent(&self) -> bool {
        matches!(
            self,
            UpdatePolicy::Sum | UpdatePolicy::Min | UpdatePolicy::Max
        )
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation of the values held by a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bytes,
    String,
    Int64,
    Float64,
    BigInt,
    BigFloat,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bytes => "bytes",
            ValueType::String => "string",
            ValueType::Int64 => "int64",
            ValueType::Float64 => "float64",
            ValueType::BigInt => "bigint",
            ValueType::BigFloat => "bigfloat",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::Int64 | ValueType::Float64 | ValueType::BigInt | ValueType::BigFloat
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store declaration resolved by the manifest layer.
///
/// The policy/type pair is trusted to be what the module author declared; the
/// builder only refuses pairs it has no way to evaluate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    pub update_policy: UpdatePolicy,
    pub value_type: ValueType,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, update_policy: UpdatePolicy, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            update_policy,
            value_type,
        }
    }
}
