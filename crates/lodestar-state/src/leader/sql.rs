//! Leader election over the `locks` table.
//!
//! Each lock key is one row. Acquire and renew read the row with a locking
//! read and rewrite it in the same transaction, so two contenders serialize
//! on the row and exactly one sees a free or expired lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyConnection, AnyPool};
use ulid::Ulid;

use lodestar_core::clock::after;
use lodestar_core::{Clock, Error};

use super::{LeaderElector, Lease, LeadershipResult, RenewalResult};
use crate::Result;
use crate::store::RetryPolicy;
use crate::store::sql::{Dialect, SqlStore, rows};

/// [`LeaderElector`] backed by the relational store's `locks` table.
///
/// The table is created by [`SqlStore::ensure_schema`].
#[derive(Debug, Clone)]
pub struct SqlLeaderElector {
    pool: AnyPool,
    dialect: Dialect,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl SqlLeaderElector {
    /// Creates an elector over an existing pool.
    #[must_use]
    pub fn new(
        pool: AnyPool,
        dialect: Dialect,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            dialect,
            lease_duration,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Creates an elector sharing `store`'s pool.
    #[must_use]
    pub fn for_store(store: &SqlStore, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::new(store.pool().clone(), store.dialect(), lease_duration, clock)
    }

    /// Replaces the deadlock retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn err(&self, err: sqlx::Error) -> Error {
        self.dialect.classify(err)
    }

    async fn read_lease(
        &self,
        conn: &mut AnyConnection,
        lock_key: &str,
        locked: bool,
    ) -> Result<Option<Lease>> {
        let lock = if locked { self.dialect.for_update() } else { "" };
        let statement = self.dialect.rebind(&format!(
            "SELECT owner, token, expires_at FROM locks WHERE lock_key = ?{lock}"
        ));
        let row = sqlx::query(&statement)
            .bind(lock_key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        row.map(|row| {
            Ok(Lease {
                owner: rows::text(&row, "owner")?,
                token: rows::text(&row, "token")?,
                expires_at: rows::from_nanos(rows::int(&row, "expires_at")?),
            })
        })
        .transpose()
    }

    async fn write_lease(
        &self,
        conn: &mut AnyConnection,
        lock_key: &str,
        lease: &Lease,
        exists: bool,
    ) -> Result<()> {
        let statement = if exists {
            "UPDATE locks SET owner = ?, token = ?, expires_at = ? WHERE lock_key = ?"
        } else {
            "INSERT INTO locks (owner, token, expires_at, lock_key) VALUES (?, ?, ?, ?)"
        };
        sqlx::query(&self.dialect.rebind(statement))
            .bind(lease.owner.as_str())
            .bind(lease.token.as_str())
            .bind(rows::to_nanos(lease.expires_at))
            .bind(lock_key)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.lease_duration)
    }

    async fn try_acquire_tx(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(|e| self.err(e))?;

        let current = self.read_lease(&mut tx, lock_key, true).await?;
        if let Some(lease) = current.as_ref().filter(|l| l.is_live(now)) {
            if lease.owner != instance_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.owner.clone()),
                });
            }
        }

        let lease = Lease {
            owner: instance_id.to_string(),
            token: Ulid::new().to_string(),
            expires_at: self.expiry(now),
        };
        match self
            .write_lease(&mut tx, lock_key, &lease, current.is_some())
            .await
        {
            Ok(()) => {}
            // Another contender inserted the row first.
            Err(Error::ResourceExists { .. }) => {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: None,
                });
            }
            Err(e) => return Err(e),
        }
        tx.commit().await.map_err(|e| self.err(e))?;

        Ok(LeadershipResult::Acquired {
            lease_token: lease.token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew_tx(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(|e| self.err(e))?;

        let Some(mut lease) = self.read_lease(&mut tx, lock_key, true).await? else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if !lease.is_live(now) {
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = self.expiry(now);
        self.write_lease(&mut tx, lock_key, &lease, true).await?;
        tx.commit().await.map_err(|e| self.err(e))?;

        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }
}

#[async_trait]
impl LeaderElector for SqlLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        self.retry
            .run("lock_acquire", move || self.try_acquire_tx(lock_key, instance_id))
            .await
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        self.retry
            .run("lock_renew", move || self.renew_tx(lock_key, lease_token))
            .await
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let statement = self
            .dialect
            .rebind("DELETE FROM locks WHERE lock_key = ? AND token = ?");
        let result = sqlx::query(&statement)
            .bind(lock_key)
            .bind(lease_token)
            .execute(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut conn = self.pool.acquire().await.map_err(|e| self.err(e))?;
        let lease = self.read_lease(&mut conn, lock_key, false).await?;
        Ok(lease.filter(|l| l.is_live(now)).map(|l| l.owner))
    }
}
