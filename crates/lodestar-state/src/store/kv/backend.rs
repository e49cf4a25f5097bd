//! Versioned key-value backend contract.
//!
//! Every stored entry carries an opaque version that changes on each write.
//! Writes and deletes take a [`WritePrecondition`] so read-modify-write cycles
//! can detect a racing writer without holding locks.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use lodestar_core::Error;

use crate::Result;

/// Precondition for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the key does not exist.
    DoesNotExist,
    /// Write only if the key's version matches.
    MatchesVersion(u64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The write was applied.
    Success {
        /// Version after the write.
        version: u64,
    },
    /// The precondition did not hold; nothing was written.
    PreconditionFailed {
        /// Current version, or 0 if the key is absent.
        current_version: u64,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A stored value and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full key.
    pub key: String,
    /// Stored bytes.
    pub value: Bytes,
    /// Version of this value.
    pub version: u64,
}

/// Key-value storage with per-key versions.
///
/// A precondition failure is a normal result, never an error.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + 'static {
    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Writes one key if `precondition` holds.
    async fn put(&self, key: &str, value: Bytes, precondition: WritePrecondition)
        -> Result<WriteResult>;

    /// Deletes one key if `precondition` holds.
    ///
    /// Deleting an absent key with [`WritePrecondition::None`] succeeds.
    async fn delete(&self, key: &str, precondition: WritePrecondition) -> Result<WriteResult>;

    /// Lists every entry under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>>;
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, (Bytes, u64)>,
    revision: u64,
}

/// In-memory key-value backend.
///
/// Versions come from one store-wide revision counter, so a key that is
/// deleted and recreated never reuses a version.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValue {
    inner: Arc<RwLock<Inner>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::unrecoverable("key-value lock poisoned")
}

impl MemoryKeyValue {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(current: Option<u64>, precondition: WritePrecondition) -> Option<WriteResult> {
        let failed = match (precondition, current) {
            (WritePrecondition::DoesNotExist, Some(_)) => true,
            (WritePrecondition::MatchesVersion(expected), Some(version)) => expected != version,
            (WritePrecondition::MatchesVersion(_), None) => true,
            _ => false,
        };
        failed.then(|| WriteResult::PreconditionFailed {
            current_version: current.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl KeyValueBackend for MemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.entries.get(key).map(|(value, version)| Entry {
            key: key.to_string(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let current = inner.entries.get(key).map(|(_, version)| *version);
        if let Some(failed) = Self::check(current, precondition) {
            return Ok(failed);
        }
        inner.revision += 1;
        let version = inner.revision;
        inner.entries.insert(key.to_string(), (value, version));
        drop(inner);
        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, key: &str, precondition: WritePrecondition) -> Result<WriteResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let current = inner.entries.get(key).map(|(_, version)| *version);
        if let Some(failed) = Self::check(current, precondition) {
            return Ok(failed);
        }
        inner.entries.remove(key);
        inner.revision += 1;
        let version = inner.revision;
        drop(inner);
        Ok(WriteResult::Success { version })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, version))| Entry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn does_not_exist_guards_creation() {
        let kv = MemoryKeyValue::new();
        let first = kv
            .put("/a", Bytes::from("1"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = kv
            .put("/a", Bytes::from("2"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(second, WriteResult::PreconditionFailed { .. }));
        assert_eq!(kv.get("/a").await.expect("get").expect("entry").value, "1");
    }

    #[tokio::test]
    async fn matches_version_detects_racing_writer() {
        let kv = MemoryKeyValue::new();
        let WriteResult::Success { version } = kv
            .put("/a", Bytes::from("1"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("unconditional put failed");
        };

        kv.put("/a", Bytes::from("2"), WritePrecondition::MatchesVersion(version))
            .await
            .expect("put");
        let stale = kv
            .put("/a", Bytes::from("3"), WritePrecondition::MatchesVersion(version))
            .await
            .expect("put");
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn recreated_keys_get_new_versions() {
        let kv = MemoryKeyValue::new();
        kv.put("/a", Bytes::from("1"), WritePrecondition::None)
            .await
            .expect("put");
        let old = kv.get("/a").await.expect("get").expect("entry").version;
        kv.delete("/a", WritePrecondition::MatchesVersion(old))
            .await
            .expect("delete");
        kv.put("/a", Bytes::from("1"), WritePrecondition::None)
            .await
            .expect("put");
        let new = kv.get("/a").await.expect("get").expect("entry").version;
        assert_ne!(old, new);
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_ordered() {
        let kv = MemoryKeyValue::new();
        for key in ["/v1/b/2", "/v1/a/1", "/v1/b/1", "/v2/b/1"] {
            kv.put(key, Bytes::new(), WritePrecondition::None)
                .await
                .expect("put");
        }
        let keys: Vec<_> = kv
            .list("/v1/b/")
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["/v1/b/1", "/v1/b/2"]);
    }
}
