use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

/// One write recorded while a block executes.
///
/// `old_value` is what the key held just before the write, which is what lets
/// the builder answer reads at an earlier ordinal and undo a failed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub operation: DeltaOperation,
    pub ordinal: u64,
    pub key: String,
    #[serde(default, with = "serde_bytes")]
    pub old_value: Option<Vec<u8>>,
    #[serde(default, with = "serde_bytes")]
    pub new_value: Option<Vec<u8>>,
}

impl StoreDelta {
    pub(crate) fn write(ordinal: u64, key: String, old_value: Option<Vec<u8>>, new_value: Vec<u8>) -> Self {
        let operation = if old_value.is_some() {
            DeltaOperation::Update
        } else {
            DeltaOperation::Create
        };
        Self {
            operation,
            ordinal,
            key,
            old_value,
            new_value: Some(new_value),
        }
    }

    pub(crate) fn delete(ordinal: u64, key: String, old_value: Vec<u8>) -> Self {
        Self {
            operation: DeltaOperation::Delete,
            ordinal,
            key,
            old_value: Some(old_value),
            new_value: None,
        }
    }
}
