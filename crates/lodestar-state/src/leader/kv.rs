//! Leader election over a versioned key-value backend.
//!
//! The lease is one JSON value under `/v1/locks/<lock_key>`. Every write is
//! conditioned on the version that was read, so a contender that lost the
//! race sees a precondition failure instead of overwriting the winner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Ulid;

use lodestar_core::clock::after;
use lodestar_core::{Clock, Error};

use super::{LeaderElector, Lease, LeadershipResult, RenewalResult};
use crate::Result;
use crate::store::kv::{KeyValueBackend, WritePrecondition, WriteResult};

const LOCKS: &str = "/v1/locks/";

/// [`LeaderElector`] over a [`KeyValueBackend`].
#[derive(Debug, Clone)]
pub struct KvLeaderElector<B> {
    backend: B,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl<B: KeyValueBackend> KvLeaderElector<B> {
    /// Creates an elector over `backend`.
    #[must_use]
    pub fn new(backend: B, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            lease_duration,
            clock,
        }
    }

    fn key(lock_key: &str) -> String {
        format!("{LOCKS}{lock_key}")
    }

    async fn read(&self, lock_key: &str) -> Result<Option<(Lease, u64)>> {
        let Some(entry) = self.backend.get(&Self::key(lock_key)).await? else {
            return Ok(None);
        };
        let lease: Lease = serde_json::from_slice(&entry.value)
            .map_err(|e| Error::invalid_record(format!("lease {lock_key}: {e}")))?;
        Ok(Some((lease, entry.version)))
    }

    async fn write(
        &self,
        lock_key: &str,
        lease: &Lease,
        precondition: WritePrecondition,
    ) -> Result<bool> {
        let value = Bytes::from(serde_json::to_vec(lease)?);
        let result = self
            .backend
            .put(&Self::key(lock_key), value, precondition)
            .await?;
        Ok(result.is_success())
    }
}

#[async_trait]
impl<B: KeyValueBackend> LeaderElector for KvLeaderElector<B> {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        let now = self.clock.now();
        let current = self.read(lock_key).await?;

        let precondition = match &current {
            Some((lease, _)) if lease.is_live(now) && lease.owner != instance_id => {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.owner.clone()),
                });
            }
            Some((_, version)) => WritePrecondition::MatchesVersion(*version),
            None => WritePrecondition::DoesNotExist,
        };

        let lease = Lease {
            owner: instance_id.to_string(),
            token: Ulid::new().to_string(),
            expires_at: after(now, self.lease_duration),
        };
        if !self.write(lock_key, &lease, precondition).await? {
            return Ok(LeadershipResult::NotLeader {
                current_leader: None,
            });
        }

        Ok(LeadershipResult::Acquired {
            lease_token: lease.token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let now = self.clock.now();
        let Some((mut lease, version)) = self.read(lock_key).await? else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if !lease.is_live(now) {
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = after(now, self.lease_duration);
        if !self
            .write(lock_key, &lease, WritePrecondition::MatchesVersion(version))
            .await?
        {
            return Ok(RenewalResult::Lost);
        }
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let Some((lease, version)) = self.read(lock_key).await? else {
            return Ok(false);
        };
        if lease.token != lease_token {
            return Ok(false);
        }
        let result = self
            .backend
            .delete(&Self::key(lock_key), WritePrecondition::MatchesVersion(version))
            .await?;
        Ok(matches!(result, WriteResult::Success { .. }))
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .read(lock_key)
            .await?
            .filter(|(lease, _)| lease.is_live(now))
            .map(|(lease, _)| lease.owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::ManualClock;

    use crate::store::kv::MemoryKeyValue;

    fn elector(clock: &ManualClock) -> KvLeaderElector<MemoryKeyValue> {
        KvLeaderElector::new(
            MemoryKeyValue::new(),
            Duration::from_secs(15),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn only_one_contender_wins() -> Result<()> {
        let clock = ManualClock::default();
        let backend = MemoryKeyValue::new();
        let lease = Duration::from_secs(15);
        let first = KvLeaderElector::new(backend.clone(), lease, Arc::new(clock.clone()));
        let second = KvLeaderElector::new(backend, lease, Arc::new(clock));

        assert!(first.try_acquire("lodestar", "server-1").await?.is_leader());
        let lost = second.try_acquire("lodestar", "server-2").await?;

        assert_eq!(
            lost,
            LeadershipResult::NotLeader {
                current_leader: Some("server-1".to_string())
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn renewal_extends_and_expiry_hands_over() -> Result<()> {
        let clock = ManualClock::default();
        let elector = elector(&clock);
        let token = elector
            .try_acquire("lodestar", "server-1")
            .await?
            .lease_token()
            .map(str::to_string)
            .expect("token");

        clock.advance(Duration::from_secs(10));
        assert!(elector.renew("lodestar", &token).await?.is_renewed());
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            elector.current_leader("lodestar").await?.as_deref(),
            Some("server-1")
        );

        clock.advance(Duration::from_secs(10));
        assert_eq!(elector.renew("lodestar", &token).await?, RenewalResult::Lost);
        assert!(elector.try_acquire("lodestar", "server-2").await?.is_leader());
        assert_eq!(
            elector.renew("lodestar", &token).await?,
            RenewalResult::InvalidToken
        );
        Ok(())
    }

    #[tokio::test]
    async fn release_requires_the_token() -> Result<()> {
        let clock = ManualClock::default();
        let elector = elector(&clock);
        let token = elector
            .try_acquire("lodestar", "server-1")
            .await?
            .lease_token()
            .map(str::to_string)
            .expect("token");

        assert!(!elector.release("lodestar", "wrong").await?);
        assert!(elector.release("lodestar", &token).await?);
        assert_eq!(elector.current_leader("lodestar").await?, None);
        Ok(())
    }
}
