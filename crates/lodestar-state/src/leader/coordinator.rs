//! Acquire-then-renew driver around a [`LeaderElector`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use lodestar_core::Error;

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::Result;

/// Default pause between acquisition attempts and between renewals.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lock identity and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipConfig {
    /// Name of the contended lock.
    pub lock_key: String,
    /// This process's identity as recorded in the lock.
    pub instance_id: String,
    /// Pause between acquisition attempts and between renewals.
    pub retry_interval: Duration,
}

impl LeadershipConfig {
    /// Creates a config with the default interval.
    #[must_use]
    pub fn new(lock_key: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key.into(),
            instance_id: instance_id.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Overrides the retry interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// Where this process stands with respect to the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// Not held, either never acquired or released.
    Unlocked,
    /// Held and being renewed.
    Held,
    /// Was held and could not be renewed.
    Lost,
}

struct Held {
    token: String,
    renewal: JoinHandle<()>,
}

/// Drives one process's claim on the leadership lock.
///
/// [`acquire`](Self::acquire) retries until the lock is held, then spawns a
/// renewal task. If renewal fails the state moves to
/// [`LeadershipState::Lost`] for good; everything gated on
/// [`ensure_leader`](Self::ensure_leader) starts failing with
/// [`Error::LeadershipLost`].
pub struct LeadershipCoordinator {
    elector: Arc<dyn LeaderElector>,
    config: LeadershipConfig,
    state: Arc<watch::Sender<LeadershipState>>,
    held: Mutex<Option<Held>>,
}

impl std::fmt::Debug for LeadershipCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipCoordinator")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LeadershipCoordinator {
    /// Creates an unlocked coordinator.
    #[must_use]
    pub fn new(elector: Arc<dyn LeaderElector>, config: LeadershipConfig) -> Self {
        let (state, _) = watch::channel(LeadershipState::Unlocked);
        Self {
            elector,
            config,
            state: Arc::new(state),
            held: Mutex::new(None),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Returns true while the lock is held.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state() == LeadershipState::Held
    }

    /// Fails unless the lock is held.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeadershipLost`] when not the leader.
    pub fn ensure_leader(&self) -> Result<()> {
        match self.state() {
            LeadershipState::Held => Ok(()),
            LeadershipState::Lost => Err(Error::leadership_lost(format!(
                "lock {} could not be renewed",
                self.config.lock_key
            ))),
            LeadershipState::Unlocked => Err(Error::leadership_lost(format!(
                "lock {} is not held",
                self.config.lock_key
            ))),
        }
    }

    /// Returns a receiver that observes state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Resolves once the lock has been lost.
    pub async fn wait_lost(&self) {
        let mut receiver = self.subscribe();
        // The sender lives as long as `self`, so this only ends on a loss.
        let _ = receiver
            .wait_for(|state| *state == LeadershipState::Lost)
            .await;
    }

    /// Blocks until the lock is held, retrying at the configured interval.
    ///
    /// Cancel by dropping the future.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeadershipLost`] if this coordinator already lost the
    /// lock once; a new process must compete instead.
    pub async fn acquire(&self) -> Result<()> {
        match self.state() {
            LeadershipState::Held => return Ok(()),
            LeadershipState::Lost => return self.ensure_leader(),
            LeadershipState::Unlocked => {}
        }

        let (token, lease_duration) = loop {
            match self
                .elector
                .try_acquire(&self.config.lock_key, &self.config.instance_id)
                .await
            {
                Ok(LeadershipResult::Acquired {
                    lease_token,
                    lease_duration,
                }) => break (lease_token, lease_duration),
                Ok(LeadershipResult::NotLeader { current_leader }) => {
                    tracing::debug!(
                        lock_key = %self.config.lock_key,
                        current_leader = current_leader.as_deref().unwrap_or("unknown"),
                        "lock held elsewhere, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(lock_key = %self.config.lock_key, error = %e, "lock acquisition failed");
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        };

        tracing::info!(
            lock_key = %self.config.lock_key,
            instance_id = %self.config.instance_id,
            "acquired leadership lock"
        );
        self.state.send_replace(LeadershipState::Held);

        let renewal = tokio::spawn(renew_until_lost(
            Arc::clone(&self.elector),
            self.config.clone(),
            token.clone(),
            lease_duration,
            Arc::clone(&self.state),
        ));
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = Some(Held { token, renewal });
        Ok(())
    }

    /// Stops renewing and gives the lock up.
    ///
    /// # Errors
    ///
    /// Returns the elector's error if the release call fails; the local state
    /// is unlocked either way.
    pub async fn release(&self) -> Result<()> {
        let held = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(held) = held else {
            return Ok(());
        };
        held.renewal.abort();
        if self.state() == LeadershipState::Held {
            self.state.send_replace(LeadershipState::Unlocked);
        }

        let released = self
            .elector
            .release(&self.config.lock_key, &held.token)
            .await?;
        tracing::info!(lock_key = %self.config.lock_key, released, "released leadership lock");
        Ok(())
    }
}

impl Drop for LeadershipCoordinator {
    fn drop(&mut self) {
        if let Some(held) = self
            .held
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            held.renewal.abort();
        }
    }
}

async fn renew_until_lost(
    elector: Arc<dyn LeaderElector>,
    config: LeadershipConfig,
    token: String,
    lease_duration: Duration,
    state: Arc<watch::Sender<LeadershipState>>,
) {
    let mut last_renewed = Instant::now();
    loop {
        tokio::time::sleep(config.retry_interval).await;

        let reason = match elector.renew(&config.lock_key, &token).await {
            Ok(RenewalResult::Renewed { .. }) => {
                last_renewed = Instant::now();
                continue;
            }
            Ok(RenewalResult::Lost) => "lease expired or taken".to_string(),
            Ok(RenewalResult::InvalidToken) => "lease token rejected".to_string(),
            // A failed call is survivable until the lease would have run out.
            Err(e) if last_renewed.elapsed() < lease_duration => {
                tracing::warn!(lock_key = %config.lock_key, error = %e, "lock renewal failed, retrying");
                continue;
            }
            Err(e) => e.to_string(),
        };

        tracing::error!(lock_key = %config.lock_key, reason = %reason, "lost leadership lock");
        state.send_replace(LeadershipState::Lost);
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::memory::InMemoryLeaderElector;

    fn config(instance: &str) -> LeadershipConfig {
        LeadershipConfig::new("lodestar", instance).with_retry_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn acquire_then_release() {
        let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(5)));
        let coordinator = LeadershipCoordinator::new(elector.clone(), config("server-1"));

        assert!(coordinator.ensure_leader().is_err());
        coordinator.acquire().await.expect("acquire");
        assert!(coordinator.is_leader());
        assert_eq!(
            elector.current_leader("lodestar").await.expect("leader").as_deref(),
            Some("server-1")
        );

        coordinator.release().await.expect("release");
        assert_eq!(coordinator.state(), LeadershipState::Unlocked);
        assert_eq!(elector.current_leader("lodestar").await.expect("leader"), None);
    }

    #[tokio::test]
    async fn second_contender_waits_for_release() {
        let elector: Arc<dyn LeaderElector> =
            Arc::new(InMemoryLeaderElector::new(Duration::from_secs(5)));
        let first = LeadershipCoordinator::new(Arc::clone(&elector), config("server-1"));
        let second = Arc::new(LeadershipCoordinator::new(elector, config("server-2")));
        first.acquire().await.expect("acquire");

        let waiting = {
            let second = Arc::clone(&second);
            tokio::spawn(async move { second.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_leader());

        first.release().await.expect("release");
        waiting.await.expect("join").expect("acquire");
        assert!(second.is_leader());
    }

    #[tokio::test]
    async fn stolen_lease_is_reported_as_lost() {
        let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(5)));
        let coordinator = LeadershipCoordinator::new(elector.clone(), config("server-1"));
        coordinator.acquire().await.expect("acquire");

        // Another holder replacing the token makes the next renewal fail.
        elector
            .try_acquire("lodestar", "server-1")
            .await
            .expect("steal");

        tokio::time::timeout(Duration::from_secs(2), coordinator.wait_lost())
            .await
            .expect("loss observed");
        assert!(matches!(
            coordinator.ensure_leader(),
            Err(Error::LeadershipLost { .. })
        ));
        assert!(coordinator.acquire().await.is_err());
    }
}
