//! Error types and result aliases for Lodestar.
//!
//! Every failure that leaves a store, coordinator or convergence cycle is one
//! of the variants below. Backend-specific errors (driver codes, key-value
//! precondition failures) are translated into this taxonomy at the edge of the
//! backend and never escape in raw form.

use std::fmt;

/// The result type used throughout Lodestar.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Lodestar operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested record does not exist.
    #[error("resource not found: {resource_type} {id}")]
    ResourceNotFound {
        /// The record family that was looked up.
        resource_type: &'static str,
        /// The key that was looked up.
        id: String,
    },

    /// A record with the same natural key already exists.
    #[error("resource exists: {resource_type} {id}")]
    ResourceExists {
        /// The record family being created.
        resource_type: &'static str,
        /// The conflicting key.
        id: String,
    },

    /// The caller's expected state is stale.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the mismatch.
        message: String,
    },

    /// The record cannot be removed by this caller.
    #[error("cannot be removed: {message}")]
    CannotBeRemoved {
        /// Description of why removal was refused.
        message: String,
    },

    /// The request is malformed or violates a lifecycle rule.
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of the invalid request.
        message: String,
    },

    /// The backend aborted the transaction to break a deadlock.
    #[error("deadlock: {message}")]
    Deadlock {
        /// Description of the aborted operation.
        message: String,
    },

    /// The backend is in a state that retrying cannot fix.
    #[error("unrecoverable: {message}")]
    Unrecoverable {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored record could not be decoded.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Description of the decoding failure.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// This instance no longer holds the leadership lock.
    #[error("leadership lost: {message}")]
    LeadershipLost {
        /// Description of how leadership was lost.
        message: String,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Any other failure.
    #[error("unknown error: {message}")]
    Unknown {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Stable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::ResourceNotFound`].
    ResourceNotFound,
    /// See [`Error::ResourceExists`].
    ResourceExists,
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::CannotBeRemoved`].
    CannotBeRemoved,
    /// See [`Error::BadRequest`].
    BadRequest,
    /// See [`Error::Deadlock`].
    Deadlock,
    /// See [`Error::Unrecoverable`].
    Unrecoverable,
    /// See [`Error::InvalidRecord`].
    InvalidRecord,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::LeadershipLost`].
    LeadershipLost,
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::Unknown`].
    Unknown,
}

impl ErrorKind {
    /// Returns the stable string code for this kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ResourceNotFound => "ResourceNotFound",
            Self::ResourceExists => "ResourceExists",
            Self::Conflict => "ResourceConflict",
            Self::CannotBeRemoved => "ActualLRPCannotBeRemoved",
            Self::BadRequest => "BadRequest",
            Self::Deadlock => "Deadlock",
            Self::Unrecoverable => "Unrecoverable",
            Self::InvalidRecord => "InvalidRecord",
            Self::Timeout => "Timeout",
            Self::LeadershipLost => "LeadershipLost",
            Self::Configuration => "Configuration",
            Self::Unknown => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            Self::ResourceExists { .. } => ErrorKind::ResourceExists,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::CannotBeRemoved { .. } => ErrorKind::CannotBeRemoved,
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::Deadlock { .. } => ErrorKind::Deadlock,
            Self::Unrecoverable { .. } => ErrorKind::Unrecoverable,
            Self::InvalidRecord { .. } => ErrorKind::InvalidRecord,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::LeadershipLost { .. } => ErrorKind::LeadershipLost,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Returns true if the error should stop the current process role.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unrecoverable { .. } | Self::LeadershipLost { .. }
        )
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new resource exists error.
    #[must_use]
    pub fn exists(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceExists {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new cannot-be-removed error.
    #[must_use]
    pub fn cannot_be_removed(message: impl Into<String>) -> Self {
        Self::CannotBeRemoved {
            message: message.into(),
        }
    }

    /// Creates a new bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a new deadlock error.
    #[must_use]
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::Deadlock {
            message: message.into(),
        }
    }

    /// Creates a new unrecoverable error.
    #[must_use]
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new unrecoverable error with a source cause.
    #[must_use]
    pub fn unrecoverable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invalid record error.
    #[must_use]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new leadership lost error.
    #[must_use]
    pub fn leadership_lost(message: impl Into<String>) -> Self {
        Self::LeadershipLost {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new unknown error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new unknown error with a source cause.
    #[must_use]
    pub fn unknown_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unknown {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_record(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("desired_lrp", "web-1");
        assert_eq!(err.to_string(), "resource not found: desired_lrp web-1");
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::Conflict.code(), "ResourceConflict");
        assert_eq!(
            ErrorKind::CannotBeRemoved.to_string(),
            "ActualLRPCannotBeRemoved"
        );
    }

    #[test]
    fn only_unrecoverable_and_leadership_are_fatal() {
        assert!(Error::unrecoverable("missing table").is_fatal());
        assert!(Error::leadership_lost("renewal failed").is_fatal());
        assert!(!Error::conflict("stale tag").is_fatal());
        assert!(!Error::deadlock("retry").is_fatal());
    }

    #[test]
    fn unrecoverable_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::unrecoverable_with_source("schema missing", io);
        assert!(err.source().is_some());
    }

    #[test]
    fn json_errors_become_invalid_records() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InvalidRecord);
    }
}
