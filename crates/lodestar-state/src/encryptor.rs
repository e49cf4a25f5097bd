//! Startup key rotation.

use std::sync::Arc;

use crate::Result;
use crate::store::{EncryptionReport, Store};

/// Brings stored blobs under the active encryption key.
///
/// Runs once before serving: if the label recorded in the store differs from
/// the active one, every blob is re-encrypted and the new label recorded.
#[derive(Clone)]
pub struct Encryptor {
    store: Arc<dyn Store>,
    active_label: String,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("backend", &self.store.backend())
            .field("active_label", &self.active_label)
            .finish()
    }
}

impl Encryptor {
    /// Creates an encryptor for `active_label`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, active_label: impl Into<String>) -> Self {
        Self {
            store,
            active_label: active_label.into(),
        }
    }

    /// Rotates if needed.
    ///
    /// Returns `None` if the store was already on the active key.
    ///
    /// # Errors
    ///
    /// Returns the store error if reading the label, re-encrypting or
    /// recording the label fails. The label is only recorded after a
    /// complete pass.
    pub async fn run(&self) -> Result<Option<EncryptionReport>> {
        let stored = self.store.encryption_key_label().await?;
        if stored.as_deref() == Some(self.active_label.as_str()) {
            tracing::debug!(key_label = %self.active_label, "stored records already use the active key");
            return Ok(None);
        }

        tracing::info!(
            from = stored.as_deref().unwrap_or("<none>"),
            to = %self.active_label,
            "rotating encryption key"
        );
        let report = self.store.perform_encryption().await?;
        self.store
            .set_encryption_key_label(&self.active_label)
            .await?;
        Ok(Some(report))
    }
}
