//! Key-value backend with operation recording.
//!
//! Wraps [`MemoryKeyValue`] and records every call so tests can assert on
//! the write pattern of the key-value store, or make calls fail on demand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use lodestar_core::{Error, Result};
use lodestar_state::store::kv::{
    Entry, KeyValueBackend, MemoryKeyValue, WritePrecondition, WriteResult,
};

/// Record of a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Single-key read.
    Get {
        /// Key that was read.
        key: String,
    },
    /// Conditional write.
    Put {
        /// Key that was written.
        key: String,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the write was applied.
        applied: bool,
    },
    /// Conditional delete.
    Delete {
        /// Key that was deleted.
        key: String,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the delete was applied.
        applied: bool,
    },
    /// Prefix scan.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

/// In-memory backend that records calls and can inject failures.
///
/// Clones share data, the operation log and the failure list.
#[derive(Debug, Clone, Default)]
pub struct RecordingKeyValue {
    inner: MemoryKeyValue,
    operations: Arc<Mutex<Vec<KvOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    deadlocks: Arc<AtomicUsize>,
}

impl RecordingKeyValue {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<KvOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the writes that lost a precondition race.
    #[must_use]
    pub fn rejected_writes(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    KvOp::Put { applied: false, .. } | KvOp::Delete { applied: false, .. }
                )
            })
            .count()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Makes every call on a key under `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
        self.deadlocks.store(0, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with a deadlock.
    pub fn inject_deadlocks(&self, count: usize) {
        self.deadlocks.store(count, Ordering::SeqCst);
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn memory(&self) -> &MemoryKeyValue {
        &self.inner
    }

    fn record(&self, op: KvOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        if self
            .deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::deadlock(format!("injected deadlock for key: {key}")));
        }
        let fail = self.fail_prefixes.lock().expect("lock");
        if fail.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Err(Error::unknown(format!("injected failure for key: {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for RecordingKeyValue {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.record(KvOp::Get {
            key: key.to_string(),
        });
        self.check_failure(key)?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_failure(key)?;
        let result = self.inner.put(key, value, precondition).await?;
        self.record(KvOp::Put {
            key: key.to_string(),
            precondition,
            applied: result.is_success(),
        });
        Ok(result)
    }

    async fn delete(&self, key: &str, precondition: WritePrecondition) -> Result<WriteResult> {
        self.check_failure(key)?;
        let result = self.inner.delete(key, precondition).await?;
        self.record(KvOp::Delete {
            key: key.to_string(),
            precondition,
            applied: result.is_success(),
        });
        Ok(result)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        self.record(KvOp::List {
            prefix: prefix.to_string(),
        });
        self.check_failure(prefix)?;
        self.inner.list(prefix).await
    }
}
