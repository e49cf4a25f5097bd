//! Versioned envelope for blob columns.
//!
//! Every stored blob starts with a two-character ASCII format prefix:
//!
//! | Prefix | Body |
//! |--------|------|
//! | `00` | payload as-is (UTF-8) |
//! | `01` | base64 of the payload |
//! | `02` | base64 of the encrypted payload |
//!
//! An empty payload encodes to an empty column and an empty column decodes
//! to an empty payload, whatever the format. Legacy rows with empty blob
//! columns therefore read back cleanly.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::encryption::Cryptor;
use crate::error::{Error, Result};

const PREFIX_LEN: usize = 2;

/// Envelope format of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Stored as-is.
    Unencoded,
    /// Base64 encoded.
    Base64,
    /// Encrypted, then base64 encoded.
    #[default]
    Base64Encrypted,
}

impl Format {
    /// Returns the envelope prefix.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Unencoded => "00",
            Self::Base64 => "01",
            Self::Base64Encrypted => "02",
        }
    }

    fn from_prefix(prefix: &str) -> Result<Self> {
        match prefix {
            "00" => Ok(Self::Unencoded),
            "01" => Ok(Self::Base64),
            "02" => Ok(Self::Base64Encrypted),
            other => Err(Error::invalid_record(format!(
                "unknown envelope format {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Encodes and decodes blob envelopes.
///
/// Cheap to clone; clones share the key ring.
#[derive(Debug, Clone)]
pub struct Encoder {
    cryptor: Arc<Cryptor>,
}

impl Encoder {
    /// Creates an encoder over a cryptor.
    #[must_use]
    pub fn new(cryptor: Cryptor) -> Self {
        Self {
            cryptor: Arc::new(cryptor),
        }
    }

    /// Returns the label of the key new envelopes are sealed with.
    #[must_use]
    pub fn active_label(&self) -> &str {
        self.cryptor.active_label()
    }

    /// Wraps `payload` in an envelope of the given format.
    ///
    /// # Errors
    ///
    /// - [`Error::BadRequest`] if `Unencoded` is asked to store non-UTF-8 bytes
    /// - Any encryption failure from the cryptor
    pub fn encode(&self, format: Format, payload: &[u8]) -> Result<String> {
        if payload.is_empty() {
            return Ok(String::new());
        }
        let body = match format {
            Format::Unencoded => std::str::from_utf8(payload)
                .map_err(|_| Error::bad_request("unencoded payload must be utf-8"))?
                .to_string(),
            Format::Base64 => STANDARD.encode(payload),
            Format::Base64Encrypted => STANDARD.encode(self.cryptor.encrypt(payload)?),
        };
        let mut out = String::with_capacity(PREFIX_LEN + body.len());
        out.push_str(format.prefix());
        out.push_str(&body);
        Ok(out)
    }

    /// Unwraps an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the prefix is unknown, the body is
    /// not valid base64, or decryption fails.
    pub fn decode(&self, envelope: &str) -> Result<Vec<u8>> {
        if envelope.is_empty() {
            return Ok(Vec::new());
        }
        let (prefix, body) = envelope
            .split_at_checked(PREFIX_LEN)
            .ok_or_else(|| Error::invalid_record("envelope shorter than its prefix"))?;
        match Format::from_prefix(prefix)? {
            Format::Unencoded => Ok(body.as_bytes().to_vec()),
            Format::Base64 => decode_base64(body),
            Format::Base64Encrypted => self.cryptor.decrypt(&decode_base64(body)?),
        }
    }

    /// Serializes `value` as JSON and seals it.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or encoding fails.
    pub fn encode_json<T: Serialize>(&self, format: Format, value: &T) -> Result<String> {
        let payload = serde_json::to_vec(value)?;
        self.encode(format, &payload)
    }

    /// Opens an envelope and parses the JSON inside.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] on any decoding failure, including an
    /// empty envelope.
    pub fn decode_json<T: DeserializeOwned>(&self, envelope: &str) -> Result<T> {
        let payload = self.decode(envelope)?;
        if payload.is_empty() {
            return Err(Error::invalid_record("blob column is empty"));
        }
        Ok(serde_json::from_slice(&payload)?)
    }
}

fn decode_base64(body: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(body)
        .map_err(|e| Error::invalid_record(format!("invalid base64 envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{Key, KeyManager};
    use proptest::prelude::*;

    fn encoder(active: &str, labels: &[&str]) -> Encoder {
        let keys: Vec<Key> = labels
            .iter()
            .map(|label| Key::new(*label, &format!("phrase-{label}")).unwrap())
            .collect();
        let active = keys.iter().find(|k| k.label() == active).unwrap().clone();
        Encoder::new(Cryptor::new(KeyManager::new(active, keys).unwrap()))
    }

    #[test]
    fn prefixes_are_stable() {
        let enc = encoder("k1", &["k1"]);
        assert!(enc.encode(Format::Unencoded, b"{}").unwrap().starts_with("00"));
        assert!(enc.encode(Format::Base64, b"{}").unwrap().starts_with("01"));
        assert!(enc
            .encode(Format::Base64Encrypted, b"{}")
            .unwrap()
            .starts_with("02"));
    }

    #[test]
    fn empty_payloads_round_trip_for_every_format() {
        let enc = encoder("k1", &["k1"]);
        for format in [Format::Unencoded, Format::Base64, Format::Base64Encrypted] {
            let sealed = enc.encode(format, b"").unwrap();
            assert!(sealed.is_empty());
            assert!(enc.decode(&sealed).unwrap().is_empty());
        }
    }

    #[test]
    fn decodes_across_key_rotation() {
        let before = encoder("k1", &["k1"]);
        let sealed = before.encode(Format::Base64Encrypted, b"payload").unwrap();

        let after = encoder("k2", &["k1", "k2"]);
        assert_eq!(after.decode(&sealed).unwrap(), b"payload");

        let resealed = after
            .encode(Format::Base64Encrypted, &after.decode(&sealed).unwrap())
            .unwrap();
        let only_new = encoder("k2", &["k2"]);
        assert_eq!(only_new.decode(&resealed).unwrap(), b"payload");
        assert!(only_new.decode(&sealed).is_err());
    }

    #[test]
    fn rejects_unknown_prefix() {
        let enc = encoder("k1", &["k1"]);
        assert!(enc.decode("99abc").is_err());
        assert!(enc.decode("0").is_err());
    }

    #[test]
    fn json_helpers_round_trip() {
        let enc = encoder("k1", &["k1"]);
        let sealed = enc
            .encode_json(Format::Base64Encrypted, &vec!["a".to_string(), "b".to_string()])
            .unwrap();
        let back: Vec<String> = enc.decode_json(&sealed).unwrap();
        assert_eq!(back, vec!["a", "b"]);
    }

    proptest! {
        #[test]
        fn encrypted_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let enc = encoder("k1", &["k1"]);
            let sealed = enc.encode(Format::Base64Encrypted, &payload).unwrap();
            prop_assert_eq!(enc.decode(&sealed).unwrap(), payload);
        }
    }
}
