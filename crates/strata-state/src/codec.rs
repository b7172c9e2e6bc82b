//! Canonical text encodings for store values.
//!
//! Numeric values never hit a store as raw binary: they are kept as decimal
//! ASCII so stores stay readable and `decode(encode(x)) == x` holds for every
//! variant.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::Zero;

use crate::bigfloat::BigFloat;
use crate::policy::ValueType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {value_type} encoding: {reason}")]
pub struct DecodeError {
    pub value_type: ValueType,
    pub reason: String,
}

impl DecodeError {
    fn new(value_type: ValueType, reason: impl ToString) -> Self {
        Self {
            value_type,
            reason: reason.to_string(),
        }
    }
}

/// A numeric representation a store can sum and compare.
pub trait NumericValue: Sized {
    const VALUE_TYPE: ValueType;

    /// Additive identity, used when the key is absent.
    fn zero() -> Self;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;

    fn encode(&self) -> Vec<u8>;

    fn sum(&self, other: &Self) -> Self;

    /// Total order used by `Min`/`Max`.
    fn compare(&self, other: &Self) -> Ordering;
}

fn as_text(value_type: ValueType, bytes: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|err| DecodeError::new(value_type, err))
}

/// Optional sign followed by ASCII digits only.
fn is_decimal_integer(text: &str) -> bool {
    let digits = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

impl NumericValue for i64 {
    const VALUE_TYPE: ValueType = ValueType::Int64;

    fn zero() -> Self {
        0
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        as_text(Self::VALUE_TYPE, bytes)?
            .parse()
            .map_err(|err| DecodeError::new(Self::VALUE_TYPE, err))
    }

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Wraps on overflow, like native fixed-width addition.
    fn sum(&self, other: &Self) -> Self {
        self.wrapping_add(*other)
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl NumericValue for f64 {
    const VALUE_TYPE: ValueType = ValueType::Float64;

    fn zero() -> Self {
        0.0
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        as_text(Self::VALUE_TYPE, bytes)?
            .parse()
            .map_err(|err| DecodeError::new(Self::VALUE_TYPE, err))
    }

    /// `Display` for `f64` is the shortest text that parses back to the same bits.
    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn sum(&self, other: &Self) -> Self {
        self + other
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl NumericValue for BigInt {
    const VALUE_TYPE: ValueType = ValueType::BigInt;

    fn zero() -> Self {
        Zero::zero()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = as_text(Self::VALUE_TYPE, bytes)?;
        if !is_decimal_integer(text) {
            return Err(DecodeError::new(
                Self::VALUE_TYPE,
                format!("{text:?} is not a decimal integer"),
            ));
        }
        text.parse()
            .map_err(|err| DecodeError::new(Self::VALUE_TYPE, err))
    }

    fn encode(&self) -> Vec<u8> {
        self.to_str_radix(10).into_bytes()
    }

    fn sum(&self, other: &Self) -> Self {
        self + other
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl NumericValue for BigFloat {
    const VALUE_TYPE: ValueType = ValueType::BigFloat;

    fn zero() -> Self {
        BigFloat::zero()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        BigFloat::parse(as_text(Self::VALUE_TYPE, bytes)?)
            .map_err(|err| DecodeError::new(Self::VALUE_TYPE, err))
    }

    fn encode(&self) -> Vec<u8> {
        self.to_canonical_string().into_bytes()
    }

    fn sum(&self, other: &Self) -> Self {
        self.add(other)
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// Re-encode `bytes` in the canonical form of `value_type`.
///
/// Byte stores accept anything; string stores require UTF-8; numeric stores
/// decode and encode again so `"+007"` lands as `"7"`.
pub fn canonicalize(value_type: ValueType, bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match value_type {
        ValueType::Bytes => Ok(bytes.to_vec()),
        ValueType::String => Ok(as_text(value_type, bytes)?.as_bytes().to_vec()),
        ValueType::Int64 => Ok(i64::decode(bytes)?.encode()),
        ValueType::Float64 => Ok(f64::decode(bytes)?.encode()),
        ValueType::BigInt => Ok(BigInt::decode(bytes)?.encode()),
        ValueType::BigFloat => Ok(BigFloat::decode(bytes)?.encode()),
    }
}

/// Accept `bytes` only if they already are the canonical form of `value_type`.
pub fn ensure_canonical(value_type: ValueType, bytes: &[u8]) -> Result<(), DecodeError> {
    let canonical = canonicalize(value_type, bytes)?;
    if canonical != bytes {
        return Err(DecodeError::new(
            value_type,
            format!(
                "not in canonical form, expected {:?}",
                String::from_utf8_lossy(&canonical)
            ),
        ));
    }
    Ok(())
}
