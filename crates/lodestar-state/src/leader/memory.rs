//! In-memory leader elector.
//!
//! ## Limitations
//!
//! - **Single-process only**: Leadership is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use lodestar_core::clock::after;
use lodestar_core::{Clock, Error, SystemClock};

use super::{LeaderElector, Lease, LeadershipResult, RenewalResult};
use crate::Result;

/// In-memory leader elector for tests and single-node use.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
///
/// use lodestar_state::leader::memory::InMemoryLeaderElector;
///
/// let elector = InMemoryLeaderElector::new(Duration::from_secs(15));
/// ```
#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::unrecoverable("leader lease table lock poisoned")
}

impl InMemoryLeaderElector {
    /// Creates an elector on the wall clock.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self::with_clock(lease_duration, Arc::new(SystemClock))
    }

    /// Creates an elector that reads time from `clock`.
    #[must_use]
    pub fn with_clock(lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
            clock,
        }
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        let now = self.clock.now();
        let mut leases = self.leases.write().map_err(poison_err)?;

        if let Some(lease) = leases.get(lock_key) {
            if lease.is_live(now) && lease.owner != instance_id {
                let current_leader = lease.owner.clone();
                drop(leases);
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(current_leader),
                });
            }
        }

        let token = Ulid::new().to_string();
        leases.insert(
            lock_key.to_string(),
            Lease {
                owner: instance_id.to_string(),
                token: token.clone(),
                expires_at: after(now, self.lease_duration),
            },
        );
        drop(leases);

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let now = self.clock.now();
        let mut leases = self.leases.write().map_err(poison_err)?;

        let Some(lease) = leases.get_mut(lock_key) else {
            drop(leases);
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            drop(leases);
            return Ok(RenewalResult::InvalidToken);
        }
        if !lease.is_live(now) {
            drop(leases);
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = after(now, self.lease_duration);
        drop(leases);

        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;

        let owned = leases
            .get(lock_key)
            .is_some_and(|lease| lease.token == lease_token);
        if owned {
            leases.remove(lock_key);
        }
        drop(leases);

        Ok(owned)
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let leases = self.leases.read().map_err(poison_err)?;

        let result = leases
            .get(lock_key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner.clone());
        drop(leases);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::ManualClock;

    #[tokio::test]
    async fn cannot_acquire_when_another_holds_lease() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(15));

        assert!(elector.try_acquire("lodestar", "server-1").await?.is_leader());

        match elector.try_acquire("lodestar", "server-2").await? {
            LeadershipResult::NotLeader { current_leader } => {
                assert_eq!(current_leader.as_deref(), Some("server-1"));
            }
            LeadershipResult::Acquired { .. } => panic!("expected NotLeader"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn same_instance_reacquires_with_a_new_token() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(15));

        let first = elector.try_acquire("lodestar", "server-1").await?;
        let second = elector.try_acquire("lodestar", "server-1").await?;

        assert!(second.is_leader());
        assert_ne!(first.lease_token(), second.lease_token());
        Ok(())
    }

    #[tokio::test]
    async fn renewal_keeps_the_token() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(15));
        let token = elector
            .try_acquire("lodestar", "server-1")
            .await?
            .lease_token()
            .map(str::to_string)
            .expect("token");

        assert!(elector.renew("lodestar", &token).await?.is_renewed());
        assert!(elector.renew("lodestar", &token).await?.is_renewed());
        assert_eq!(
            elector.renew("lodestar", "wrong").await?,
            RenewalResult::InvalidToken
        );
        assert!(elector.release("lodestar", &token).await?);
        assert_eq!(elector.renew("lodestar", &token).await?, RenewalResult::Lost);
        Ok(())
    }

    #[tokio::test]
    async fn release_with_wrong_token_keeps_the_leader() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(15));
        elector.try_acquire("lodestar", "server-1").await?;

        assert!(!elector.release("lodestar", "wrong").await?);
        assert_eq!(
            elector.current_leader("lodestar").await?.as_deref(),
            Some("server-1")
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() -> Result<()> {
        let clock = ManualClock::default();
        let elector =
            InMemoryLeaderElector::with_clock(Duration::from_secs(15), Arc::new(clock.clone()));
        let token = elector
            .try_acquire("lodestar", "server-1")
            .await?
            .lease_token()
            .map(str::to_string)
            .expect("token");

        clock.advance(Duration::from_secs(16));

        assert_eq!(elector.current_leader("lodestar").await?, None);
        assert_eq!(elector.renew("lodestar", &token).await?, RenewalResult::Lost);
        assert!(elector.try_acquire("lodestar", "server-2").await?.is_leader());
        Ok(())
    }
}
