use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// How often a compare-and-swap loop re-reads before giving up.
const CAS_MAX_RETRIES: usize = 10;

/// Errors from the key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend failed; the caller may retry.
    #[error("kv backend error: {0}")]
    Backend(String),

    /// A compare-and-swap lost the race; re-read and retry.
    #[error("kv compare-and-swap conflict for key {key}")]
    CasConflict {
        /// The contended key.
        key: String,
    },

    /// The stored value could not be decoded.
    #[error("kv value for key {key} is corrupt: {source}")]
    Corrupt {
        /// The affected key.
        key: String,
        /// The decode failure.
        source: serde_json::Error,
    },

    /// A CAS loop exhausted its retries.
    #[error("kv update of key {key} did not converge after {CAS_MAX_RETRIES} attempts")]
    TooManyRetries {
        /// The contended key.
        key: String,
    },
}

impl KvError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::CasConflict { .. } | Self::TooManyRetries { .. }
        )
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Monotonic per-key version; 0 is never a stored version.
    pub version: u64,
    /// The raw stored bytes.
    pub data: Vec<u8>,
}

/// An external consistent key-value store with compare-and-swap.
///
/// Ring descriptors and HA-tracker elections both replicate through it.
#[async_trait]
pub trait KvStore: Debug + Send + Sync {
    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError>;

    /// Store `value` iff the current version of `key` is
    /// `expected_version` (0 for "key must be absent").
    ///
    /// Returns [`KvError::CasConflict`] when the version does not match.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<(), KvError>;

    /// All keys starting with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// Read-modify-write `key` with a typed update function, retrying CAS
/// conflicts.
///
/// `update` receives the decoded current value (or `None`) and returns the
/// new value to store, or `None` to leave the key untouched. Returns the
/// value that ended up stored by this call, if any.
pub async fn update_typed<T, F>(
    kv: &dyn KvStore,
    key: &str,
    mut update: F,
) -> Result<Option<T>, KvError>
where
    T: Serialize + DeserializeOwned + Clone + Send,
    F: FnMut(Option<T>) -> Option<T> + Send,
{
    for _ in 0..CAS_MAX_RETRIES {
        let current = kv.get(key).await?;
        let (version, decoded) = match &current {
            Some(v) => (
                v.version,
                Some(
                    serde_json::from_slice::<T>(&v.data).map_err(|source| KvError::Corrupt {
                        key: key.to_owned(),
                        source,
                    })?,
                ),
            ),
            None => (0, None),
        };

        let new = match update(decoded) {
            Some(new) => new,
            None => return Ok(None),
        };

        let encoded = serde_json::to_vec(&new).expect("serializable kv value");
        match kv.compare_and_swap(key, version, encoded).await {
            Ok(()) => return Ok(Some(new)),
            Err(KvError::CasConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(KvError::TooManyRetries {
        key: key.to_owned(),
    })
}

/// Read and decode the current value of `key`.
pub async fn get_typed<T>(kv: &dyn KvStore, key: &str) -> Result<Option<T>, KvError>
where
    T: DeserializeOwned,
{
    match kv.get(key).await? {
        Some(v) => Ok(Some(serde_json::from_slice(&v.data).map_err(|source| {
            KvError::Corrupt {
                key: key.to_owned(),
                source,
            }
        })?)),
        None => Ok(None),
    }
}

/// An in-process [`KvStore`], used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, VersionedValue>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        let current_version = entries.get(key).map(|v| v.version).unwrap_or(0);
        if current_version != expected_version {
            return Err(KvError::CasConflict {
                key: key.to_owned(),
            });
        }
        entries.insert(
            key.to_owned(),
            VersionedValue {
                version: current_version + 1,
                data: value,
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
