//! Leadership for the state server.
//!
//! Exactly one state server may serve mutations and run convergence. The
//! [`LeaderElector`] trait is the lease primitive; the
//! [`LeadershipCoordinator`] drives it: it acquires before serving, renews on
//! its own task and publishes the loss of the lease so the server can stop.
//!
//! ## Design Principles
//!
//! - **Leases, not locks**: A holder that stops renewing loses the lease when
//!   its TTL passes
//! - **Token-checked renewal**: Renew and release name the token issued at
//!   acquisition, so a stale holder cannot extend someone else's lease
//! - **Loss is fatal**: The coordinator never re-acquires after a loss; the
//!   serving role ends and a fresh process competes again
//!
//! ## Backends
//!
//! - [`memory::InMemoryLeaderElector`]: single-process, for tests
//! - [`sql::SqlLeaderElector`]: a `locks` table with row-locked
//!   compare-and-set
//! - [`kv::KvLeaderElector`]: versioned precondition writes on one key

pub mod coordinator;
pub mod kv;
pub mod memory;
pub mod sql;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use coordinator::{LeadershipConfig, LeadershipCoordinator, LeadershipState};

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Lease token that must be used for renewal.
        lease_token: String,
        /// Duration until the lease expires.
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader {
        /// Identifier of the current leader, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    /// Returns the lease token if leadership was acquired.
    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// Successfully renewed the lease.
    Renewed {
        /// New lease duration.
        lease_duration: Duration,
    },
    /// Lease has expired or was taken by another leader.
    Lost,
    /// The provided lease token is invalid.
    InvalidToken,
}

impl RenewalResult {
    /// Returns true if the lease was successfully renewed.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// A lease as persisted by the SQL and key-value electors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Lease {
    pub owner: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Lease-based leader election.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from async tasks.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Attempts to acquire leadership for a lock key.
    ///
    /// An instance that already holds a live lease gets a new token.
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult>;

    /// Extends a live lease without rotating its token.
    ///
    /// # Returns
    ///
    /// - `RenewalResult::Renewed` if successful
    /// - `RenewalResult::Lost` if the lease expired or was taken
    /// - `RenewalResult::InvalidToken` if the token does not match
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult>;

    /// Voluntarily releases leadership.
    ///
    /// Returns false if the lease was already gone or held under another
    /// token.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool>;

    /// Returns the instance holding a live lease, if any.
    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_result_is_leader() {
        let acquired = LeadershipResult::Acquired {
            lease_token: "token".to_string(),
            lease_duration: Duration::from_secs(15),
        };
        assert!(acquired.is_leader());
        assert_eq!(acquired.lease_token(), Some("token"));

        let not_leader = LeadershipResult::NotLeader {
            current_leader: Some("other".to_string()),
        };
        assert!(!not_leader.is_leader());
        assert_eq!(not_leader.lease_token(), None);
    }

    #[test]
    fn renewal_result_is_renewed() {
        let renewed = RenewalResult::Renewed {
            lease_duration: Duration::from_secs(15),
        };
        assert!(renewed.is_renewed());

        assert!(!RenewalResult::Lost.is_renewed());
        assert!(!RenewalResult::InvalidToken.is_renewed());
    }

    #[test]
    fn lease_liveness_is_strict() {
        let now = Utc::now();
        let lease = Lease {
            owner: "a".to_string(),
            token: "t".to_string(),
            expires_at: now,
        };
        assert!(!lease.is_live(now));
        assert!(lease.is_live(now - chrono::Duration::seconds(1)));
    }
}
