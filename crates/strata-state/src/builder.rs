//! The keyed accumulator store a module writes to while a block executes.

use std::collections::BTreeMap;

use num_bigint::BigInt;

use crate::bigfloat::BigFloat;
use crate::codec::{self, NumericValue};
use crate::delta::StoreDelta;
use crate::error::{StoreError, StoreResult};
use crate::policy::{MAX_APPEND_VALUE_SIZE, StoreConfig, UpdatePolicy, ValueType};
use crate::snapshot::{SnapshotEntry, StoreSnapshot};

/// Keyed values under a single merge policy.
///
/// Every write goes through a policy operation that decodes the existing
/// value, combines, and stores the canonical encoding. Writes of the current
/// block are logged as [`StoreDelta`]s so reads can be answered as of an
/// earlier ordinal.
#[derive(Debug, Clone)]
pub struct Builder {
    config: StoreConfig,
    kv: BTreeMap<String, Vec<u8>>,
    deltas: Vec<StoreDelta>,
    last_ordinal: u64,
}

impl Builder {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        if config.name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if !config.update_policy.supports(config.value_type) {
            return Err(StoreError::UnsupportedValueType {
                store: config.name,
                policy: config.update_policy,
                value_type: config.value_type,
            });
        }
        Ok(Self {
            config,
            kv: BTreeMap::new(),
            deltas: Vec::new(),
            last_ordinal: 0,
        })
    }

    /// Rebuild a store from the canonical snapshot of a previous range.
    pub fn from_snapshot(snapshot: &StoreSnapshot) -> StoreResult<Self> {
        let mut builder = Self::new(snapshot.config())?;
        for entry in &snapshot.entries {
            builder.seed(entry.key.clone(), &entry.value)?;
        }
        Ok(builder)
    }

    /// Like [`Builder::from_snapshot`], but the snapshot must match `config`.
    pub fn from_snapshot_with(config: StoreConfig, snapshot: &StoreSnapshot) -> StoreResult<Self> {
        let builder = Self::new(config)?;
        builder.ensure_compatible(snapshot)?;
        Self::from_snapshot(snapshot)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.config.update_policy
    }

    pub fn value_type(&self) -> ValueType {
        self.config.value_type
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.kv.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Deltas recorded since the last [`Builder::flush`].
    pub fn deltas(&self) -> &[StoreDelta] {
        &self.deltas
    }

    /// Seed a value without recording a delta. The value must already be in
    /// the store's canonical form (`"4"`, not `"+4"`); this is how snapshots
    /// and test fixtures populate a store.
    pub fn seed(&mut self, key: impl Into<String>, value: &[u8]) -> StoreResult<()> {
        let key = key.into();
        if let Err(source) = codec::ensure_canonical(self.config.value_type, value) {
            return Err(self.decode_error(&key, source));
        }
        self.kv.insert(key, value.to_vec());
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    /// Value of `key` as of `ordinal`: writes of this block with a higher
    /// ordinal are not visible, writes at the same ordinal are.
    pub fn get_at(&self, ordinal: u64, key: &str) -> Option<&[u8]> {
        let mut value = self.kv.get(key).map(Vec::as_slice);
        for delta in self.deltas.iter().rev() {
            if delta.ordinal <= ordinal {
                break;
            }
            if delta.key == key {
                value = delta.old_value.as_deref();
            }
        }
        value
    }

    /// Latest value, including every write of this block.
    pub fn get_last(&self, key: &str) -> Option<&[u8]> {
        self.kv.get(key).map(Vec::as_slice)
    }

    /// Value as it was when the block started.
    pub fn get_first(&self, key: &str) -> Option<&[u8]> {
        match self.deltas.iter().find(|delta| delta.key == key) {
            Some(delta) => delta.old_value.as_deref(),
            None => self.get_last(key),
        }
    }

    pub fn has_at(&self, ordinal: u64, key: &str) -> bool {
        self.get_at(ordinal, key).is_some()
    }

    pub fn has_last(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    pub fn has_first(&self, key: &str) -> bool {
        self.get_first(key).is_some()
    }

    // ---- policy operations ---------------------------------------------

    pub fn set(&mut self, ordinal: u64, key: impl Into<String>, value: &[u8]) -> StoreResult<()> {
        self.expect_policy("set", UpdatePolicy::Set, None)?;
        let key = key.into();
        let value = self.canonical(&key, value)?;
        self.write(ordinal, key, value)
    }

    pub fn set_if_not_exists(
        &mut self,
        ordinal: u64,
        key: impl Into<String>,
        value: &[u8],
    ) -> StoreResult<()> {
        self.expect_policy("set_if_not_exists", UpdatePolicy::SetIfNotExists, None)?;
        let key = key.into();
        if self.kv.contains_key(&key) {
            return self.bump_ordinal(ordinal);
        }
        let value = self.canonical(&key, value)?;
        self.write(ordinal, key, value)
    }

    pub fn append(&mut self, ordinal: u64, key: impl Into<String>, value: &[u8]) -> StoreResult<()> {
        self.expect_policy("append", UpdatePolicy::Append, None)?;
        let key = key.into();
        let value = self.canonical(&key, value)?;
        let combined = self.appended(&key, self.kv.get(&key).map(Vec::as_slice), &value)?;
        self.write(ordinal, key, combined)
    }

    pub fn sum_int64(&mut self, ordinal: u64, key: impl Into<String>, delta: i64) -> StoreResult<()> {
        self.sum("sum_int64", ordinal, key.into(), delta)
    }

    pub fn sum_float64(&mut self, ordinal: u64, key: impl Into<String>, delta: f64) -> StoreResult<()> {
        self.sum("sum_float64", ordinal, key.into(), delta)
    }

    pub fn sum_bigint(&mut self, ordinal: u64, key: impl Into<String>, delta: &BigInt) -> StoreResult<()> {
        self.sum("sum_bigint", ordinal, key.into(), delta.clone())
    }

    pub fn sum_bigfloat(
        &mut self,
        ordinal: u64,
        key: impl Into<String>,
        delta: &BigFloat,
    ) -> StoreResult<()> {
        self.sum("sum_bigfloat", ordinal, key.into(), delta.clone())
    }

    pub fn set_min_int64(&mut self, ordinal: u64, key: impl Into<String>, value: i64) -> StoreResult<()> {
        self.extremum("set_min_int64", UpdatePolicy::Min, ordinal, key.into(), value)
    }

    pub fn set_max_int64(&mut self, ordinal: u64, key: impl Into<String>, value: i64) -> StoreResult<()> {
        self.extremum("set_max_int64", UpdatePolicy::Max, ordinal, key.into(), value)
    }

    pub fn set_min_float64(&mut self, ordinal: u64, key: impl Into<String>, value: f64) -> StoreResult<()> {
        self.extremum("set_min_float64", UpdatePolicy::Min, ordinal, key.into(), value)
    }

    pub fn set_max_float64(&mut self, ordinal: u64, key: impl Into<String>, value: f64) -> StoreResult<()> {
        self.extremum("set_max_float64", UpdatePolicy::Max, ordinal, key.into(), value)
    }

    pub fn set_min_bigint(&mut self, ordinal: u64, key: impl Into<String>, value: &BigInt) -> StoreResult<()> {
        self.extremum("set_min_bigint", UpdatePolicy::Min, ordinal, key.into(), value.clone())
    }

    pub fn set_max_bigint(&mut self, ordinal: u64, key: impl Into<String>, value: &BigInt) -> StoreResult<()> {
        self.extremum("set_max_bigint", UpdatePolicy::Max, ordinal, key.into(), value.clone())
    }

    pub fn set_min_bigfloat(
        &mut self,
        ordinal: u64,
        key: impl Into<String>,
        value: &BigFloat,
    ) -> StoreResult<()> {
        self.extremum("set_min_bigfloat", UpdatePolicy::Min, ordinal, key.into(), value.clone())
    }

    pub fn set_max_bigfloat(
        &mut self,
        ordinal: u64,
        key: impl Into<String>,
        value: &BigFloat,
    ) -> StoreResult<()> {
        self.extremum("set_max_bigfloat", UpdatePolicy::Max, ordinal, key.into(), value.clone())
    }

    /// Remove every key starting with `prefix`. Allowed under any policy.
    pub fn delete_prefix(&mut self, ordinal: u64, prefix: &str) -> StoreResult<()> {
        self.bump_ordinal(ordinal)?;
        let doomed: Vec<String> = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(old) = self.kv.remove(&key) {
                self.deltas.push(StoreDelta::delete(ordinal, key, old));
            }
        }
        Ok(())
    }

    // ---- block boundaries ----------------------------------------------

    /// Hand over the block's deltas and start a new block.
    pub fn flush(&mut self) -> Vec<StoreDelta> {
        self.last_ordinal = 0;
        std::mem::take(&mut self.deltas)
    }

    /// Undo every write of the current block. Returns how many were undone.
    pub fn rollback(&mut self) -> usize {
        let undone = self.deltas.len();
        for delta in std::mem::take(&mut self.deltas).into_iter().rev() {
            match delta.old_value {
                Some(old) => self.kv.insert(delta.key, old),
                None => self.kv.remove(&delta.key),
            };
        }
        self.last_ordinal = 0;
        if undone > 0 {
            log::debug!("store '{}': rolled back {undone} write(s)", self.config.name);
        }
        undone
    }

    /// Ordered `(key, value)` contents plus the policy needed to fold them.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            name: self.config.name.clone(),
            update_policy: self.config.update_policy,
            value_type: self.config.value_type,
            entries: self
                .kv
                .iter()
                .map(|(key, value)| SnapshotEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    /// Fold another shard's snapshot into this store with this store's policy.
    ///
    /// Order-sensitive policies (`Set`, `SetIfNotExists`, `Append`) take
    /// `next` as the later range, so callers fold in block order. Folding
    /// writes directly and records no delta, so it is refused while a block
    /// has unflushed writes.
    pub fn merge(&mut self, next: &StoreSnapshot) -> StoreResult<()> {
        self.ensure_compatible(next)?;
        if !self.deltas.is_empty() {
            return Err(StoreError::PendingDeltas {
                store: self.config.name.clone(),
                count: self.deltas.len(),
            });
        }
        for entry in &next.entries {
            let incoming = self.canonical(&entry.key, &entry.value)?;
            let existing = self.kv.get(&entry.key).map(Vec::as_slice);
            let folded = match (self.config.update_policy, existing) {
                (_, None) => incoming,
                (UpdatePolicy::Set, Some(_)) => incoming,
                (UpdatePolicy::SetIfNotExists, Some(_)) => continue,
                (UpdatePolicy::Append, Some(existing)) => {
                    self.appended(&entry.key, Some(existing), &incoming)?
                }
                (UpdatePolicy::Sum, Some(existing)) => {
                    self.fold_numeric(&entry.key, existing, &incoming, FoldKind::Sum)?
                }
                (UpdatePolicy::Min, Some(existing)) => {
                    self.fold_numeric(&entry.key, existing, &incoming, FoldKind::Min)?
                }
                (UpdatePolicy::Max, Some(existing)) => {
                    self.fold_numeric(&entry.key, existing, &incoming, FoldKind::Max)?
                }
            };
            self.kv.insert(entry.key.clone(), folded);
        }
        Ok(())
    }

    // ---- internals -----------------------------------------------------

    fn expect_policy(
        &self,
        operation: &'static str,
        policy: UpdatePolicy,
        value_type: Option<ValueType>,
    ) -> StoreResult<()> {
        let type_ok = value_type.is_none_or(|expected| expected == self.config.value_type);
        if self.config.update_policy == policy && type_ok {
            return Ok(());
        }
        Err(StoreError::PolicyMismatch {
            store: self.config.name.clone(),
            operation,
            policy: self.config.update_policy,
            value_type: self.config.value_type,
        })
    }

    fn ensure_compatible(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        if snapshot.update_policy == self.config.update_policy
            && snapshot.value_type == self.config.value_type
        {
            return Ok(());
        }
        Err(StoreError::IncompatibleSnapshot {
            store: self.config.name.clone(),
            policy: self.config.update_policy,
            value_type: self.config.value_type,
            other: snapshot.name.clone(),
            other_policy: snapshot.update_policy,
            other_type: snapshot.value_type,
        })
    }

    fn canonical(&self, key: &str, value: &[u8]) -> StoreResult<Vec<u8>> {
        codec::canonicalize(self.config.value_type, value).map_err(|source| self.decode_error(key, source))
    }

    fn decode_error(&self, key: &str, source: codec::DecodeError) -> StoreError {
        StoreError::Decode {
            store: self.config.name.clone(),
            key: key.to_string(),
            source,
        }
    }

    /// Decode `bytes` as `T`, reporting failures against this store and `key`.
    pub fn decode_value<T: NumericValue>(&self, key: &str, bytes: &[u8]) -> StoreResult<T> {
        T::decode(bytes).map_err(|source| self.decode_error(key, source))
    }

    fn appended(&self, key: &str, existing: Option<&[u8]>, value: &[u8]) -> StoreResult<Vec<u8>> {
        let existing = existing.unwrap_or_default();
        let size = existing.len() + value.len();
        if size > MAX_APPEND_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                store: self.config.name.clone(),
                key: key.to_string(),
                size,
                limit: MAX_APPEND_VALUE_SIZE,
            });
        }
        let mut combined = Vec::with_capacity(size);
        combined.extend_from_slice(existing);
        combined.extend_from_slice(value);
        Ok(combined)
    }

    fn sum<T: NumericValue>(
        &mut self,
        operation: &'static str,
        ordinal: u64,
        key: String,
        delta: T,
    ) -> StoreResult<()> {
        self.expect_policy(operation, UpdatePolicy::Sum, Some(T::VALUE_TYPE))?;
        let existing = match self.kv.get(&key) {
            Some(bytes) => self.decode_value::<T>(&key, bytes)?,
            None => T::zero(),
        };
        let result = existing.sum(&delta);
        self.write(ordinal, key, result.encode())
    }

    fn extremum<T: NumericValue>(
        &mut self,
        operation: &'static str,
        policy: UpdatePolicy,
        ordinal: u64,
        key: String,
        value: T,
    ) -> StoreResult<()> {
        self.expect_policy(operation, policy, Some(T::VALUE_TYPE))?;
        if let Some(bytes) = self.kv.get(&key) {
            let existing = self.decode_value::<T>(&key, bytes)?;
            let keep_existing = match policy {
                UpdatePolicy::Min => existing.compare(&value).is_le(),
                _ => existing.compare(&value).is_ge(),
            };
            if keep_existing {
                return self.bump_ordinal(ordinal);
            }
        }
        self.write(ordinal, key, value.encode())
    }

    fn fold_numeric(
        &self,
        key: &str,
        existing: &[u8],
        incoming: &[u8],
        kind: FoldKind,
    ) -> StoreResult<Vec<u8>> {
        match self.config.value_type {
            ValueType::Int64 => self.fold_as::<i64>(key, existing, incoming, kind),
            ValueType::Float64 => self.fold_as::<f64>(key, existing, incoming, kind),
            ValueType::BigInt => self.fold_as::<BigInt>(key, existing, incoming, kind),
            ValueType::BigFloat => self.fold_as::<BigFloat>(key, existing, incoming, kind),
            ValueType::Bytes | ValueType::String => Err(StoreError::UnsupportedValueType {
                store: self.config.name.clone(),
                policy: self.config.update_policy,
                value_type: self.config.value_type,
            }),
        }
    }

    fn fold_as<T: NumericValue>(
        &self,
        key: &str,
        existing: &[u8],
        incoming: &[u8],
        kind: FoldKind,
    ) -> StoreResult<Vec<u8>> {
        let a = self.decode_value::<T>(key, existing)?;
        let b = self.decode_value::<T>(key, incoming)?;
        let folded = match kind {
            FoldKind::Sum => a.sum(&b),
            FoldKind::Min if b.compare(&a).is_lt() => b,
            FoldKind::Max if b.compare(&a).is_gt() => b,
            FoldKind::Min | FoldKind::Max => a,
        };
        Ok(folded.encode())
    }

    fn bump_ordinal(&mut self, ordinal: u64) -> StoreResult<()> {
        if ordinal < self.last_ordinal {
            return Err(StoreError::OrdinalRegression {
                store: self.config.name.clone(),
                ordinal,
                last: self.last_ordinal,
            });
        }
        self.last_ordinal = ordinal;
        Ok(())
    }

    fn write(&mut self, ordinal: u64, key: String, value: Vec<u8>) -> StoreResult<()> {
        self.bump_ordinal(ordinal)?;
        let old = self.kv.insert(key.clone(), value.clone());
        self.deltas.push(StoreDelta::write(ordinal, key, old, value));
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum FoldKind {
    Sum,
    Min,
    Max,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaOperation;

    fn store(policy: UpdatePolicy, value_type: ValueType) -> Builder {
        Builder::new(StoreConfig::new("b", policy, value_type)).unwrap()
    }

    fn text(bytes: Option<&[u8]>) -> Option<&str> {
        bytes.map(|b| std::str::from_utf8(b).unwrap())
    }

    #[test]
    fn construction_validates_name_and_policy() {
        assert!(matches!(
            Builder::new(StoreConfig::new("", UpdatePolicy::Set, ValueType::Bytes)),
            Err(StoreError::EmptyName)
        ));
        assert!(matches!(
            Builder::new(StoreConfig::new("b", UpdatePolicy::Sum, ValueType::String)),
            Err(StoreError::UnsupportedValueType { .. })
        ));
    }

    #[test]
    fn reads_at_ordinal_see_own_writes_but_not_later_ones() {
        let mut b = store(UpdatePolicy::Set, ValueType::String);
        b.seed("k", b"start").unwrap();
        b.set(10, "k", b"ten").unwrap();
        b.set(20, "k", b"twenty").unwrap();
        b.set(20, "other", b"x").unwrap();

        assert_eq!(text(b.get_at(5, "k")), Some("start"));
        assert_eq!(text(b.get_at(10, "k")), Some("ten"));
        assert_eq!(text(b.get_at(15, "k")), Some("ten"));
        assert_eq!(text(b.get_at(20, "k")), Some("twenty"));
        assert_eq!(text(b.get_last("k")), Some("twenty"));
        assert_eq!(text(b.get_first("k")), Some("start"));

        assert!(!b.has_at(19, "other"));
        assert!(b.has_at(20, "other"));
        assert!(!b.has_first("other"));
        assert!(b.has_last("other"));
    }

    #[test]
    fn ordinals_must_not_go_backwards_within_a_block() {
        let mut b = store(UpdatePolicy::Sum, ValueType::Int64);
        b.sum_int64(5, "k", 1).unwrap();
        let err = b.sum_int64(4, "k", 1).unwrap_err();
        assert!(matches!(err, StoreError::OrdinalRegression { ordinal: 4, last: 5, .. }));
        assert_eq!(text(b.get_last("k")), Some("1"));

        b.flush();
        b.sum_int64(0, "k", 1).unwrap();
        assert_eq!(text(b.get_last("k")), Some("2"));
    }

    #[test]
    fn operations_must_match_the_declared_policy() {
        let mut b = store(UpdatePolicy::Sum, ValueType::BigInt);
        let err = b.sum_int64(0, "k", 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::PolicyMismatch {
                operation: "sum_int64",
                ..
            }
        ));
        assert!(b.set(0, "k", b"1").is_err());
        assert!(b.is_empty());
        assert!(b.deltas().is_empty());
    }

    #[test]
    fn set_if_not_exists_keeps_the_first_value() {
        let mut b = store(UpdatePolicy::SetIfNotExists, ValueType::String);
        b.set_if_not_exists(1, "owner", b"alice").unwrap();
        b.set_if_not_exists(2, "owner", b"bob").unwrap();
        assert_eq!(text(b.get_last("owner")), Some("alice"));
        assert_eq!(b.deltas().len(), 1);
    }

    #[test]
    fn append_concatenates_and_caps_size() {
        let mut b = store(UpdatePolicy::Append, ValueType::Bytes);
        b.append(1, "log", b"a;").unwrap();
        b.append(2, "log", b"b;").unwrap();
        assert_eq!(b.get_last("log"), Some(&b"a;b;"[..]));

        let huge = vec![0u8; MAX_APPEND_VALUE_SIZE];
        let err = b.append(3, "log", &huge).unwrap_err();
        assert!(matches!(err, StoreError::ValueTooLarge { .. }));
        assert_eq!(b.get_last("log"), Some(&b"a;b;"[..]));
    }

    #[test]
    fn min_and_max_keep_extremes() {
        let mut lo = store(UpdatePolicy::Min, ValueType::Float64);
        lo.set_min_float64(1, "p", 2.5).unwrap();
        lo.set_min_float64(2, "p", 3.0).unwrap();
        lo.set_min_float64(3, "p", -1.25).unwrap();
        assert_eq!(text(lo.get_last("p")), Some("-1.25"));
        assert_eq!(lo.deltas().len(), 2);

        let mut hi = store(UpdatePolicy::Max, ValueType::BigInt);
        hi.set_max_bigint(1, "p", &BigInt::from(10)).unwrap();
        hi.set_max_bigint(2, "p", &BigInt::from(-10)).unwrap();
        hi.set_max_bigint(3, "p", &BigInt::from(11)).unwrap();
        assert_eq!(text(hi.get_last("p")), Some("11"));
    }

    #[test]
    fn numeric_set_stores_canonical_text() {
        let mut b = store(UpdatePolicy::Set, ValueType::BigFloat);
        b.set(0, "k", b"007.50").unwrap();
        assert_eq!(text(b.get_last("k")), Some("7.5"));
        assert!(matches!(
            b.set(1, "k", b"seven"),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn delete_prefix_removes_only_matching_keys() {
        let mut b = store(UpdatePolicy::Set, ValueType::String);
        for key in ["pool:1", "pool:2", "poolside", "token:1"] {
            b.set(1, key, b"v").unwrap();
        }
        b.flush();
        b.delete_prefix(2, "pool:").unwrap();

        let keys: Vec<_> = b.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["poolside", "token:1"]);
        let deleted: Vec<_> = b
            .deltas()
            .iter()
            .map(|d| (d.operation, d.key.as_str()))
            .collect();
        assert_eq!(
            deleted,
            [
                (DeltaOperation::Delete, "pool:1"),
                (DeltaOperation::Delete, "pool:2")
            ]
        );
        assert_eq!(text(b.get_at(1, "pool:1")), Some("v"));
    }

    #[test]
    fn rollback_restores_block_start() {
        let mut b = store(UpdatePolicy::Sum, ValueType::Int64);
        b.seed("a", b"1").unwrap();
        b.sum_int64(1, "a", 5).unwrap();
        b.sum_int64(2, "b", 7).unwrap();
        b.delete_prefix(3, "a").unwrap();

        assert_eq!(b.rollback(), 3);
        assert_eq!(text(b.get_last("a")), Some("1"));
        assert_eq!(b.get_last("b"), None);
        assert!(b.deltas().is_empty());
    }

    #[test]
    fn deltas_record_old_and_new_values() {
        let mut b = store(UpdatePolicy::Sum, ValueType::Int64);
        b.sum_int64(1, "k", 3).unwrap();
        b.sum_int64(2, "k", 4).unwrap();
        let deltas = b.flush();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].operation, DeltaOperation::Create);
        assert_eq!(deltas[0].old_value, None);
        assert_eq!(deltas[1].operation, DeltaOperation::Update);
        assert_eq!(deltas[1].old_value.as_deref(), Some(&b"3"[..]));
        assert_eq!(deltas[1].new_value.as_deref(), Some(&b"7"[..]));
        assert!(b.deltas().is_empty());
    }

    #[test]
    fn seed_requires_canonical_text() {
        let mut b = store(UpdatePolicy::Sum, ValueType::Int64);
        assert!(matches!(b.seed("k", b"1.5"), Err(StoreError::Decode { .. })));
        assert!(matches!(
            b.seed("k", b"+4"),
            Err(StoreError::Decode { ref key, .. }) if key == "k"
        ));
        assert_eq!(b.get_last("k"), None);
        b.seed("k", b"4").unwrap();
        assert_eq!(text(b.get_last("k")), Some("4"));
        assert!(b.deltas().is_empty());
    }

    #[test]
    fn no_op_writes_still_check_the_ordinal() {
        let mut first = store(UpdatePolicy::SetIfNotExists, ValueType::String);
        first.set_if_not_exists(5, "k", b"a").unwrap();
        assert!(matches!(
            first.set_if_not_exists(3, "k", b"b"),
            Err(StoreError::OrdinalRegression { ordinal: 3, last: 5, .. })
        ));
        first.set_if_not_exists(7, "k", b"c").unwrap();
        assert!(matches!(
            first.set_if_not_exists(6, "k", b"d"),
            Err(StoreError::OrdinalRegression { ordinal: 6, last: 7, .. })
        ));
        assert_eq!(text(first.get_last("k")), Some("a"));

        let mut low = store(UpdatePolicy::Min, ValueType::Int64);
        low.set_min_int64(4, "k", 1).unwrap();
        assert!(matches!(
            low.set_min_int64(2, "k", 9),
            Err(StoreError::OrdinalRegression { ordinal: 2, last: 4, .. })
        ));
        let mut high = store(UpdatePolicy::Max, ValueType::Int64);
        high.set_max_int64(4, "k", 9).unwrap();
        assert!(matches!(
            high.set_max_int64(2, "k", 1),
            Err(StoreError::OrdinalRegression { ordinal: 2, last: 4, .. })
        ));
        assert_eq!(low.deltas().len(), 1);
        assert_eq!(high.deltas().len(), 1);
    }

    #[test]
    fn merge_is_refused_while_writes_are_pending() {
        let mut b = store(UpdatePolicy::Sum, ValueType::Int64);
        let mut other = store(UpdatePolicy::Sum, ValueType::Int64);
        other.sum_int64(1, "k", 5).unwrap();

        b.sum_int64(1, "k", 2).unwrap();
        assert!(matches!(
            b.merge(&other.snapshot()),
            Err(StoreError::PendingDeltas { count: 1, .. })
        ));
        assert_eq!(text(b.get_last("k")), Some("2"));

        b.flush();
        b.merge(&other.snapshot()).unwrap();
        assert_eq!(text(b.get_last("k")), Some("7"));
        assert!(b.deltas().is_empty());
    }
}
