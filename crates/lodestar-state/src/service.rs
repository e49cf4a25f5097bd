//! Leader-gated mutation front end.
//!
//! [`StateService`] is what a request handler talks to. Every mutation checks
//! that this instance still holds the leadership lock, goes through the
//! [`Store`], and on success publishes the change to the matching hub.
//! Reads go straight to the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo,
    ActualLrpUpdate, DesiredLrp, DesiredLrpChange, DesiredLrpFilter, DesiredLrpUpdate,
    ModificationTag, Task, TaskDefinition, TaskFilter,
};

use crate::Result;
use crate::convergence::CallbackDispatch;
use crate::hub::{ActualLrpEvent, DesiredLrpEvent, StateHubs, Subscription, TaskEvent};
use crate::leader::LeadershipCoordinator;
use crate::store::{ActualLrpChange, EvacuationOutcome, Store};

/// Store, hubs and leadership gate for client-driven changes.
pub struct StateService {
    store: Arc<dyn Store>,
    leadership: Arc<LeadershipCoordinator>,
    hubs: Arc<StateHubs>,
    callbacks: Option<CallbackDispatch>,
}

impl std::fmt::Debug for StateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateService")
            .field("backend", &self.store.backend())
            .field("leadership", &self.leadership)
            .field("hubs", &self.hubs)
            .finish_non_exhaustive()
    }
}

impl StateService {
    /// Creates a service whose hubs queue `hub_buffer` events per
    /// subscriber.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        leadership: Arc<LeadershipCoordinator>,
        hub_buffer: usize,
    ) -> Self {
        Self {
            store,
            leadership,
            hubs: Arc::new(StateHubs::new(hub_buffer)),
            callbacks: None,
        }
    }

    /// Hands completed tasks with a callback URL to `callbacks` as soon as
    /// they complete.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CallbackDispatch) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Returns the underlying store for reads.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Returns the leadership gate every mutation goes through.
    #[must_use]
    pub fn leadership(&self) -> &Arc<LeadershipCoordinator> {
        &self.leadership
    }

    /// Returns the hubs mutations are published to.
    #[must_use]
    pub fn hubs(&self) -> &Arc<StateHubs> {
        &self.hubs
    }

    /// Subscribes to desired LRP changes.
    ///
    /// # Errors
    ///
    /// Returns `Unrecoverable` once the service is closed.
    pub fn subscribe_desired(
        &self,
        filter: DesiredLrpFilter,
    ) -> Result<Subscription<DesiredLrpEvent>> {
        self.hubs.desired().subscribe(filter)
    }

    /// Subscribes to actual LRP changes.
    ///
    /// # Errors
    ///
    /// Returns `Unrecoverable` once the service is closed.
    pub fn subscribe_actual(&self, filter: ActualLrpFilter) -> Result<Subscription<ActualLrpEvent>> {
        self.hubs.actual().subscribe(filter)
    }

    /// Subscribes to task changes.
    ///
    /// # Errors
    ///
    /// Returns `Unrecoverable` once the service is closed.
    pub fn subscribe_tasks(&self, filter: TaskFilter) -> Result<Subscription<TaskEvent>> {
        self.hubs.tasks().subscribe(filter)
    }

    /// Disconnects every subscriber.
    pub fn close(&self) {
        self.hubs.close();
    }

    // ========================================================================
    // Desired LRPs
    // ========================================================================

    /// Creates a desired LRP.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::desire_lrp`].
    pub async fn desire_lrp(&self, lrp: &DesiredLrp) -> Result<DesiredLrp> {
        self.leadership.ensure_leader()?;
        let created = self.store.desire_lrp(lrp).await?;
        self.hubs
            .desired()
            .publish(&DesiredLrpEvent::Created(created.clone()));
        Ok(created)
    }

    /// Updates a desired LRP.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::update_desired_lrp`].
    pub async fn update_desired_lrp(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange> {
        self.leadership.ensure_leader()?;
        let change = self
            .store
            .update_desired_lrp(process_guid, expected, update)
            .await?;
        self.hubs.desired().publish(&DesiredLrpEvent::Changed {
            before: change.before.clone(),
            after: change.after.clone(),
        });
        Ok(change)
    }

    /// Removes a desired LRP. Its instances become extras for convergence.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::remove_desired_lrp`].
    pub async fn remove_desired_lrp(&self, process_guid: &str) -> Result<DesiredLrp> {
        self.leadership.ensure_leader()?;
        let removed = self.store.remove_desired_lrp(process_guid).await?;
        self.hubs
            .desired()
            .publish(&DesiredLrpEvent::Removed(removed.clone()));
        Ok(removed)
    }

    // ========================================================================
    // Actual LRPs
    // ========================================================================

    /// Creates an unclaimed instance.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::create_unclaimed_actual_lrp`].
    pub async fn create_unclaimed_actual_lrp(&self, key: &ActualLrpKey) -> Result<ActualLrp> {
        self.leadership.ensure_leader()?;
        let created = self.store.create_unclaimed_actual_lrp(key).await?;
        self.hubs
            .actual()
            .publish(&ActualLrpEvent::Created(created.clone()));
        Ok(created)
    }

    /// Applies a lifecycle update. Unchanged records publish nothing.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::update_actual_lrp`].
    pub async fn update_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
        expected: Option<&ModificationTag>,
        update: &ActualLrpUpdate,
    ) -> Result<ActualLrpChange> {
        self.leadership.ensure_leader()?;
        let change = self
            .store
            .update_actual_lrp(process_guid, index, evacuating, expected, update)
            .await?;
        if change.changed() {
            self.hubs.actual().publish(&ActualLrpEvent::Changed {
                before: change.before.clone(),
                after: change.after.clone(),
            });
        }
        Ok(change)
    }

    /// Claims an instance for a cell.
    ///
    /// # Errors
    ///
    /// As [`update_actual_lrp`](Self::update_actual_lrp).
    pub async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<ActualLrpChange> {
        let update = ActualLrpUpdate::Claim {
            instance_key: instance_key.clone(),
        };
        self.update_actual_lrp(&key.process_guid, key.index, false, None, &update)
            .await
    }

    /// Marks an instance running.
    ///
    /// # Errors
    ///
    /// As [`update_actual_lrp`](Self::update_actual_lrp).
    pub async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<ActualLrpChange> {
        let update = ActualLrpUpdate::Start {
            instance_key: instance_key.clone(),
            net_info: net_info.clone(),
        };
        self.update_actual_lrp(&key.process_guid, key.index, false, None, &update)
            .await
    }

    /// Records a crash.
    ///
    /// # Errors
    ///
    /// As [`update_actual_lrp`](Self::update_actual_lrp).
    pub async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<ActualLrpChange> {
        let update = ActualLrpUpdate::Crash {
            instance_key: instance_key.clone(),
            reason: reason.to_string(),
        };
        self.update_actual_lrp(&key.process_guid, key.index, false, None, &update)
            .await
    }

    /// Records a placement failure.
    ///
    /// # Errors
    ///
    /// As [`update_actual_lrp`](Self::update_actual_lrp).
    pub async fn fail_actual_lrp(&self, key: &ActualLrpKey, error: &str) -> Result<ActualLrpChange> {
        let update = ActualLrpUpdate::FailPlacement {
            error: error.to_string(),
        };
        self.update_actual_lrp(&key.process_guid, key.index, false, None, &update)
            .await
    }

    /// Removes an instance.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::remove_actual_lrp`].
    pub async fn remove_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrp> {
        self.leadership.ensure_leader()?;
        let removed = self
            .store
            .remove_actual_lrp(process_guid, index, instance_key, None)
            .await?;
        self.hubs
            .actual()
            .publish(&ActualLrpEvent::Removed(removed.clone()));
        Ok(removed)
    }

    /// Moves an instance to its evacuating slot and frees the primary slot
    /// for a replacement.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::evacuate_actual_lrp`].
    pub async fn evacuate_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<ActualLrp> {
        self.leadership.ensure_leader()?;
        let outcome = self
            .store
            .evacuate_actual_lrp(key, instance_key, net_info, ttl)
            .await?;
        match &outcome {
            EvacuationOutcome::Created(lrp) => {
                self.hubs.actual().publish(&ActualLrpEvent::Created(lrp.clone()));
            }
            EvacuationOutcome::Updated { before, after } => {
                self.hubs.actual().publish(&ActualLrpEvent::Changed {
                    before: before.clone(),
                    after: after.clone(),
                });
            }
            EvacuationOutcome::Unchanged(_) => {}
        }

        // The primary slot goes back to the pool so a replacement can be
        // placed while the evacuee keeps serving. A primary already taken
        // over by another incarnation is left alone.
        let group = self.store.actual_lrp_group(&key.process_guid, key.index).await?;
        if let Some(primary) = group.instance.filter(|p| &p.instance_key == instance_key) {
            let change = self
                .store
                .update_actual_lrp(
                    &key.process_guid,
                    key.index,
                    false,
                    Some(&primary.modification_tag),
                    &ActualLrpUpdate::Unclaim,
                )
                .await;
            match change {
                Ok(change) if change.changed() => {
                    self.hubs.actual().publish(&ActualLrpEvent::Changed {
                        before: change.before,
                        after: change.after,
                    });
                }
                Ok(_)
                | Err(lodestar_core::Error::ResourceNotFound { .. } | lodestar_core::Error::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(outcome.record().clone())
    }

    /// Removes an evacuating instance once its replacement runs.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::remove_evacuating_actual_lrp`].
    pub async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<Option<ActualLrp>> {
        self.leadership.ensure_leader()?;
        let removed = self
            .store
            .remove_evacuating_actual_lrp(key, instance_key)
            .await?;
        if let Some(lrp) = &removed {
            self.hubs.actual().publish(&ActualLrpEvent::Removed(lrp.clone()));
        }
        Ok(removed)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Creates a pending task.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::desire_task`].
    pub async fn desire_task(
        &self,
        guid: &str,
        domain: &str,
        definition: &TaskDefinition,
    ) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let task = self.store.desire_task(guid, domain, definition).await?;
        self.hubs.tasks().publish(&TaskEvent::Created(task.clone()));
        Ok(task)
    }

    /// Starts a pending task on a cell.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::start_task`].
    pub async fn start_task(&self, guid: &str, cell_id: &str) -> Result<bool> {
        self.leadership.ensure_leader()?;
        let before = self.store.task_by_guid(guid).await?;
        let started = self.store.start_task(guid, cell_id).await?;
        if started {
            let after = self.store.task_by_guid(guid).await?;
            self.publish_task_change(before, &after);
        }
        Ok(started)
    }

    /// Cancels a task.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::cancel_task`].
    pub async fn cancel_task(&self, guid: &str) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let before = self.store.task_by_guid(guid).await?;
        let task = self.store.cancel_task(guid).await?;
        self.publish_task_change(before, &task);
        self.dispatch_callback(task).await
    }

    /// Fails a task.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::fail_task`].
    pub async fn fail_task(&self, guid: &str, reason: &str) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let before = self.store.task_by_guid(guid).await?;
        let task = self.store.fail_task(guid, reason).await?;
        self.publish_task_change(before, &task);
        self.dispatch_callback(task).await
    }

    /// Records a task completion and, when it has a callback URL, hands it
    /// to the callback pool.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::complete_task`].
    pub async fn complete_task(
        &self,
        guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let before = self.store.task_by_guid(guid).await?;
        let task = self
            .store
            .complete_task(guid, cell_id, failed, failure_reason, result)
            .await?;
        self.publish_task_change(before, &task);
        self.dispatch_callback(task).await
    }

    /// Claims a completed task for deletion by its owner.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::resolving_task`].
    pub async fn resolving_task(&self, guid: &str) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let before = self.store.task_by_guid(guid).await?;
        let task = self.store.resolving_task(guid).await?;
        self.publish_task_change(before, &task);
        Ok(task)
    }

    /// Deletes a resolving task.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as [`Store::delete_task`].
    pub async fn delete_task(&self, guid: &str) -> Result<Task> {
        self.leadership.ensure_leader()?;
        let task = self.store.delete_task(guid).await?;
        self.hubs.tasks().publish(&TaskEvent::Removed(task.clone()));
        Ok(task)
    }

    /// Marks a domain fresh.
    ///
    /// # Errors
    ///
    /// `LeadershipLost` when not leader, otherwise as
    /// [`Store::upsert_domain`].
    pub async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<()> {
        self.leadership.ensure_leader()?;
        self.store.upsert_domain(domain, ttl).await
    }

    /// Reads tasks updated before `cutoff`; used by operators to spot stuck
    /// work.
    ///
    /// # Errors
    ///
    /// As [`Store::tasks`].
    pub async fn tasks_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.store.tasks(&TaskFilter::default()).await?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.updated_at < cutoff)
            .collect())
    }

    /// Moves a just-completed task with a callback URL to resolving and
    /// queues the callback. Convergence retries anything missed here.
    async fn dispatch_callback(&self, task: Task) -> Result<Task> {
        let Some(callbacks) = &self.callbacks else {
            return Ok(task);
        };
        if !task.has_callback() {
            return Ok(task);
        }

        let resolving = match self.store.resolving_task(&task.guid).await {
            Ok(resolving) => {
                self.publish_task_change(task.clone(), &resolving);
                resolving
            }
            Err(e) => {
                tracing::debug!(task_guid = %task.guid, error = %e, "task already resolving");
                return Ok(task);
            }
        };
        if let Err(e) = callbacks.submit(resolving.clone()).await {
            tracing::warn!(task_guid = %task.guid, error = %e, "failed to queue task callback");
        }
        Ok(resolving)
    }

    fn publish_task_change(&self, before: Task, after: &Task) {
        if before != *after {
            self.hubs.tasks().publish(&TaskEvent::Changed {
                before,
                after: after.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::encryption::{Cryptor, Key, KeyManager};
    use lodestar_core::format::Encoder;
    use lodestar_core::{Error, ManualClock};

    use crate::leader::memory::InMemoryLeaderElector;
    use crate::leader::LeadershipConfig;
    use crate::store::kv::{KvStore, MemoryKeyValue};

    fn service() -> StateService {
        let clock = ManualClock::default();
        let key = Key::new("test", "service tests").expect("key");
        let encoder = Encoder::new(Cryptor::new(KeyManager::new(key, []).expect("keys")));
        let store: Arc<dyn Store> = Arc::new(KvStore::new(
            MemoryKeyValue::new(),
            encoder,
            Arc::new(clock),
        ));
        let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(15)));
        let leadership = Arc::new(LeadershipCoordinator::new(
            elector,
            LeadershipConfig::new("lodestar", "server-1"),
        ));
        StateService::new(store, leadership, 16)
    }

    #[tokio::test]
    async fn mutations_require_leadership() {
        let service = service();
        let err = service
            .desire_lrp(&DesiredLrp::builder("web", "apps").build())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeadershipLost { .. }));
        assert!(service.store().desired_lrps(&DesiredLrpFilter::default()).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn accepted_mutations_are_published() {
        let service = service();
        service.leadership.acquire().await.expect("acquire");
        let mut desired = service
            .subscribe_desired(DesiredLrpFilter::domain("apps"))
            .expect("subscribe");
        let mut actual = service
            .subscribe_actual(ActualLrpFilter::cell("cell-1"))
            .expect("subscribe");

        let lrp = service
            .desire_lrp(&DesiredLrp::builder("web", "apps").instances(1).build())
            .await
            .expect("desire");
        assert_eq!(desired.try_recv(), Some(DesiredLrpEvent::Created(lrp)));

        let key = ActualLrpKey::new("web", 0, "apps");
        service.create_unclaimed_actual_lrp(&key).await.expect("create");
        // Unclaimed instances have no cell yet.
        assert_eq!(actual.try_recv(), None);

        let change = service
            .claim_actual_lrp(&key, &ActualLrpInstanceKey::new("ig-1", "cell-1"))
            .await
            .expect("claim");
        assert!(matches!(
            actual.try_recv(),
            Some(ActualLrpEvent::Changed { after, .. }) if after == change.after
        ));

        // Claiming again is a no-op and publishes nothing.
        service
            .claim_actual_lrp(&key, &ActualLrpInstanceKey::new("ig-1", "cell-1"))
            .await
            .expect("claim");
        assert_eq!(actual.try_recv(), None);
    }

    #[tokio::test]
    async fn task_lifecycle_is_published() {
        let service = service();
        service.leadership.acquire().await.expect("acquire");
        let mut tasks = service.subscribe_tasks(TaskFilter::default()).expect("subscribe");

        let definition = TaskDefinition::default();
        let created = service
            .desire_task("t-1", "tasks", &definition)
            .await
            .expect("desire");
        assert_eq!(tasks.try_recv(), Some(TaskEvent::Created(created)));

        assert!(service.start_task("t-1", "cell-1").await.expect("start"));
        assert!(matches!(
            tasks.try_recv(),
            Some(TaskEvent::Changed { before, after })
                if before.cell_id.is_empty() && after.cell_id == "cell-1"
        ));

        service
            .complete_task("t-1", "cell-1", false, "", "done")
            .await
            .expect("complete");
        assert!(matches!(tasks.try_recv(), Some(TaskEvent::Changed { .. })));
        service.resolving_task("t-1").await.expect("resolving");
        assert!(matches!(tasks.try_recv(), Some(TaskEvent::Changed { .. })));
        let deleted = service.delete_task("t-1").await.expect("delete");
        assert_eq!(tasks.try_recv(), Some(TaskEvent::Removed(deleted)));
        assert_eq!(tasks.try_recv(), None);
    }

    #[tokio::test]
    async fn closed_service_rejects_subscribers() {
        let service = service();
        service.close();
        assert!(service.subscribe_desired(DesiredLrpFilter::default()).is_err());
    }
}
