//! Optimistic concurrency tags.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Version stamp carried by every mutable record.
///
/// The epoch is assigned once when the record is created and never changes.
/// The index advances by one on every accepted write. A writer that presents
/// an expected tag must present exactly the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationTag {
    /// Generation identifier, unique per record incarnation.
    pub epoch: String,
    /// Write counter within the epoch.
    pub index: u32,
}

impl ModificationTag {
    /// Creates a tag for a newly created record.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            epoch: Ulid::new().to_string(),
            index: 0,
        }
    }

    /// Advances the write counter.
    pub fn increment(&mut self) {
        self.index = self.index.wrapping_add(1);
    }

    /// Returns a copy with the write counter advanced.
    #[must_use]
    pub fn incremented(&self) -> Self {
        let mut next = self.clone();
        next.increment();
        next
    }

    /// Checks a caller's expected tag against this stored tag.
    ///
    /// `None` means the caller writes unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when an expected tag is given and differs.
    pub fn check(&self, expected: Option<&Self>) -> Result<()> {
        match expected {
            Some(expected) if expected != self => Err(Error::conflict(format!(
                "expected modification tag {expected}, found {self}"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ModificationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn fresh_tags_have_distinct_epochs() {
        let a = ModificationTag::fresh();
        let b = ModificationTag::fresh();
        assert_ne!(a.epoch, b.epoch);
        assert_eq!(a.index, 0);
    }

    #[test]
    fn check_accepts_absent_and_equal() {
        let tag = ModificationTag::fresh();
        assert!(tag.check(None).is_ok());
        assert!(tag.check(Some(&tag.clone())).is_ok());
    }

    #[test]
    fn check_rejects_stale_index() {
        let tag = ModificationTag::fresh();
        let stored = tag.incremented();
        let err = stored.check(Some(&tag)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    proptest! {
        #[test]
        fn increment_preserves_epoch(steps in 1u32..64) {
            let original = ModificationTag::fresh();
            let mut tag = original.clone();
            for _ in 0..steps {
                tag.increment();
            }
            prop_assert_eq!(&tag.epoch, &original.epoch);
            prop_assert_eq!(tag.index, steps);
        }
    }
}
