use serde::{Deserialize, Serialize};
use strata_cbor::Digest;

use crate::error::StoreResult;
use crate::policy::{StoreConfig, UpdatePolicy, ValueType};

/// One stored value, in the canonical encoding of the store's value type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

/// Ordered contents of a store at the end of a block range.
///
/// Entries are sorted by key, and the policy travels with them so another
/// shard's store can be folded in without looking the module up again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub name: String,
    pub update_policy: UpdatePolicy,
    pub value_type: ValueType,
    pub entries: Vec<SnapshotEntry>,
}

impl StoreSnapshot {
    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.name.clone(), self.update_policy, self.value_type)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .binary_search_by(|entry| entry.key.as_str().cmp(key))
            .ok()
            .map(|idx| self.entries[idx].value.as_slice())
    }

    pub fn to_canonical_cbor(&self) -> StoreResult<Vec<u8>> {
        Ok(strata_cbor::to_canonical_cbor(self)?)
    }

    pub fn from_cbor(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    /// SHA-256 of the canonical encoding.
    pub fn hash(&self) -> StoreResult<Digest> {
        Ok(Digest::of_cbor(self)?)
    }
}
