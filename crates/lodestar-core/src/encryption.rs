//! Key ring and authenticated encryption for blob columns.
//!
//! Keys are addressed by label. One key encrypts; every configured key can
//! decrypt, so records written under a retired key stay readable until the
//! store rotates them.
//!
//! ## Ciphertext Layout
//!
//! ```text
//! [label_len: u8][label: label_len bytes][nonce: 12 bytes][ChaCha20-Poly1305 ciphertext]
//! ```

use std::collections::HashMap;
use std::fmt;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const MAX_LABEL_LEN: usize = u8::MAX as usize;

/// A labelled symmetric key derived from a passphrase.
#[derive(Clone)]
pub struct Key {
    label: String,
    material: [u8; 32],
}

impl Key {
    /// Derives a key from `phrase` and addresses it by `label`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the label is empty or longer than
    /// 255 bytes, or if the phrase is empty.
    pub fn new(label: impl Into<String>, phrase: &str) -> Result<Self> {
        let label = label.into();
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::configuration(format!(
                "encryption key label must be 1..={MAX_LABEL_LEN} bytes"
            )));
        }
        if phrase.is_empty() {
            return Err(Error::configuration(format!(
                "encryption key {label} has an empty passphrase"
            )));
        }
        let digest = Sha256::digest(phrase.as_bytes());
        let mut material = [0u8; 32];
        material.copy_from_slice(&digest);
        Ok(Self { label, material })
    }

    /// Parses a `label:phrase` pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the separator is missing.
    pub fn parse(spec: &str) -> Result<Self> {
        let (label, phrase) = spec
            .split_once(':')
            .ok_or_else(|| Error::configuration("encryption key must be label:phrase"))?;
        Self::new(label.trim(), phrase)
    }

    /// Returns the key label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn aead(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.material)
            .map_err(|_| Error::configuration(format!("invalid key material for {}", self.label)))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// The active encryption key plus every key allowed to decrypt.
#[derive(Debug, Clone)]
pub struct KeyManager {
    encryption_key: Key,
    decryption_keys: HashMap<String, Key>,
}

impl KeyManager {
    /// Creates a key manager.
    ///
    /// The encryption key is always usable for decryption.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if two different keys share a label.
    pub fn new(encryption_key: Key, decryption_keys: impl IntoIterator<Item = Key>) -> Result<Self> {
        let mut by_label: HashMap<String, Key> = HashMap::new();
        for key in decryption_keys.into_iter().chain([encryption_key.clone()]) {
            if let Some(existing) = by_label.get(key.label()) {
                if existing.material != key.material {
                    return Err(Error::configuration(format!(
                        "multiple encryption keys share the label {}",
                        key.label()
                    )));
                }
            }
            by_label.insert(key.label().to_string(), key);
        }
        Ok(Self {
            encryption_key,
            decryption_keys: by_label,
        })
    }

    /// Builds a key manager from `label:phrase` specs and the active label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a spec is malformed or the active
    /// label is not among them.
    pub fn from_specs(specs: &[String], active_label: &str) -> Result<Self> {
        let keys = specs
            .iter()
            .map(|spec| Key::parse(spec))
            .collect::<Result<Vec<_>>>()?;
        let active = keys
            .iter()
            .find(|key| key.label() == active_label)
            .cloned()
            .ok_or_else(|| {
                Error::configuration(format!(
                    "active key label {active_label} is not among the configured keys"
                ))
            })?;
        Self::new(active, keys)
    }

    /// Returns the key used for new ciphertexts.
    #[must_use]
    pub fn encryption_key(&self) -> &Key {
        &self.encryption_key
    }

    /// Looks up a decryption key by label.
    #[must_use]
    pub fn decryption_key(&self, label: &str) -> Option<&Key> {
        self.decryption_keys.get(label)
    }
}

/// Authenticated encryption over a [`KeyManager`].
#[derive(Debug, Clone)]
pub struct Cryptor {
    keys: KeyManager,
}

impl Cryptor {
    /// Creates a cryptor.
    #[must_use]
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    /// Returns the label of the active key.
    #[must_use]
    pub fn active_label(&self) -> &str {
        self.keys.encryption_key().label()
    }

    /// Encrypts `plaintext` under the active key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unknown`] if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.keys.encryption_key();
        let nonce_source = Uuid::new_v4().into_bytes();
        let nonce = Nonce::from_slice(&nonce_source[..NONCE_LEN]);
        let ciphertext = key
            .aead()?
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::unknown(format!("failed to encrypt with key {}", key.label())))?;

        let label = key.label().as_bytes();
        let mut out = Vec::with_capacity(1 + label.len() + NONCE_LEN + ciphertext.len());
        // Key::new bounds the label to 255 bytes.
        out.push(u8::try_from(label.len()).unwrap_or(u8::MAX));
        out.extend_from_slice(label);
        out.extend_from_slice(&nonce_source[..NONCE_LEN]);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a payload produced by [`Cryptor::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the payload is truncated, names an
    /// unknown key, or fails authentication.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let (&label_len, rest) = payload
            .split_first()
            .ok_or_else(|| Error::invalid_record("encrypted payload is empty"))?;
        let label_len = usize::from(label_len);
        if rest.len() < label_len + NONCE_LEN {
            return Err(Error::invalid_record("encrypted payload is truncated"));
        }
        let (label, rest) = rest.split_at(label_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let label = std::str::from_utf8(label)
            .map_err(|_| Error::invalid_record("encrypted payload has a non-utf8 key label"))?;
        let key = self.keys.decryption_key(label).ok_or_else(|| {
            Error::invalid_record(format!("no decryption key with label {label}"))
        })?;

        key.aead()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::invalid_record(format!("failed to decrypt with key {label}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn cryptor(active: &str, all: &[(&str, &str)]) -> Cryptor {
        let keys: Vec<Key> = all
            .iter()
            .map(|(label, phrase)| Key::new(*label, phrase).unwrap())
            .collect();
        let active = keys.iter().find(|k| k.label() == active).unwrap().clone();
        Cryptor::new(KeyManager::new(active, keys).unwrap())
    }

    #[test]
    fn encrypt_then_decrypt() {
        let c = cryptor("k1", &[("k1", "alpha")]);
        let sealed = c.encrypt(b"run info").unwrap();
        assert_ne!(sealed.as_slice(), b"run info");
        assert_eq!(c.decrypt(&sealed).unwrap(), b"run info");
    }

    #[test]
    fn retired_key_still_decrypts() {
        let old = cryptor("k1", &[("k1", "alpha")]);
        let sealed = old.encrypt(b"secret").unwrap();

        let rotated = cryptor("k2", &[("k1", "alpha"), ("k2", "beta")]);
        assert_eq!(rotated.decrypt(&sealed).unwrap(), b"secret");
        assert_eq!(rotated.active_label(), "k2");
    }

    #[test]
    fn unknown_label_is_invalid_record() {
        let old = cryptor("k1", &[("k1", "alpha")]);
        let sealed = old.encrypt(b"secret").unwrap();

        let other = cryptor("k2", &[("k2", "beta")]);
        let err = other.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRecord);
    }

    #[test]
    fn tampering_fails_authentication() {
        let c = cryptor("k1", &[("k1", "alpha")]);
        let mut sealed = c.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(c.decrypt(&sealed).is_err());
    }

    #[test]
    fn duplicate_labels_with_different_phrases_are_rejected() {
        let a = Key::new("k1", "alpha").unwrap();
        let b = Key::new("k1", "beta").unwrap();
        assert!(KeyManager::new(a, [b]).is_err());
    }

    #[test]
    fn from_specs_requires_active_label() {
        let specs = vec!["k1:alpha".to_string()];
        assert!(KeyManager::from_specs(&specs, "k1").is_ok());
        assert!(KeyManager::from_specs(&specs, "k9").is_err());
        assert!(Key::parse("no-separator").is_err());
    }
}
