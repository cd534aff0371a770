use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("revision conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid record {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Conflicts and backend outages may succeed on retry; the rest will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last modification of this key.
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// None for deletions.
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Revisioned key/value storage with prefix watches.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Unconditional write. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64>;

    async fn delete(&self, key: &str) -> StoreResult<u64>;

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Write only if the key is still at `expected_revision` (0 = absent).
    /// Returns `Ok(Err(actual))` when the revision moved.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<Result<u64, u64>>;

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;
}
