//! The record store.
//!
//! [`Store`] is the single interface to persisted cluster state. Two
//! implementations exist and exactly one is selected at startup:
//!
//! - [`sql::SqlStore`]: relational backend over SQLite, Postgres or MySQL,
//!   with per-dialect SQL generation and error classification
//! - [`kv::KvStore`]: legacy key-value backend using per-key version
//!   preconditions
//!
//! ## Design Principles
//!
//! - **Tag-checked writes**: Every mutation of a desired or actual LRP checks
//!   the caller's expected [`ModificationTag`] and advances the stored one
//! - **Shared lifecycle rules**: State transitions live on the model types so
//!   both backends accept and reject exactly the same updates
//! - **Local deadlock recovery**: Backend deadlocks are retried inside the
//!   store; callers only ever see the final outcome
//! - **Bounded operations**: Every call runs under a deadline and a timed-out
//!   transaction is rolled back

pub mod kv;
pub mod retry;
pub mod sql;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpNetInfo, ActualLrpState, ActualLrpUpdate, DesiredLrp, DesiredLrpChange,
    DesiredLrpFilter, DesiredLrpSchedulingInfo, DesiredLrpUpdate, ModificationTag, Task,
    TaskDefinition, TaskFilter, TaskState,
};

use crate::Result;

pub use retry::RetryPolicy;

/// Result of an accepted actual LRP update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualLrpChange {
    /// The record before the update.
    pub before: ActualLrp,
    /// The record after the update.
    pub after: ActualLrp,
}

impl ActualLrpChange {
    /// Returns true if the update changed the stored record.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Outcome of writing an evacuating slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvacuationOutcome {
    /// A new evacuating record was created.
    Created(ActualLrp),
    /// An existing evacuating record was replaced.
    Updated {
        /// The record before the update.
        before: ActualLrp,
        /// The record after the update.
        after: ActualLrp,
    },
    /// The stored record already matched.
    Unchanged(ActualLrp),
}

impl EvacuationOutcome {
    /// Returns the evacuating record as stored after the call.
    #[must_use]
    pub fn record(&self) -> &ActualLrp {
        match self {
            Self::Created(lrp) | Self::Unchanged(lrp) | Self::Updated { after: lrp, .. } => lrp,
        }
    }
}

/// Counts from a re-encryption pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptionReport {
    /// Rows rewritten under the active key.
    pub rewritten: usize,
    /// Rows left untouched because they could not be decoded or vanished.
    pub skipped: usize,
}

/// A desired LRP with instance indices that have no actual record.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingInstances {
    /// What should be running.
    pub scheduling_info: DesiredLrpSchedulingInfo,
    /// Indices in `0..instances` with no primary actual LRP.
    pub missing_indices: Vec<u32>,
}

/// An actual LRP joined with the desired LRP it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledActual {
    /// The actual instance.
    pub actual: ActualLrp,
    /// Its desired LRP.
    pub scheduling_info: DesiredLrpSchedulingInfo,
}

/// Per-state gauges for actual LRPs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LrpCounts {
    /// Total desired instances.
    pub desired_instances: u64,
    /// Unclaimed primary instances.
    pub unclaimed: u64,
    /// Claimed primary instances.
    pub claimed: u64,
    /// Running primary instances.
    pub running: u64,
    /// Crashed primary instances.
    pub crashed: u64,
}

impl LrpCounts {
    /// Adds one instance in `state`.
    pub fn record(&mut self, state: ActualLrpState) {
        match state {
            ActualLrpState::Unclaimed => self.unclaimed += 1,
            ActualLrpState::Claimed => self.claimed += 1,
            ActualLrpState::Running => self.running += 1,
            ActualLrpState::Crashed => self.crashed += 1,
        }
    }
}

/// Everything the LRP convergence pass needs, read consistently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LrpConvergenceSnapshot {
    /// Desired LRPs with fewer primary instances than requested.
    pub missing: Vec<MissingInstances>,
    /// Primary instances with no desired LRP, or with an index beyond the
    /// desired count, in fresh domains.
    pub extra: Vec<ActualLrp>,
    /// Primary instances assigned to cells that are not present.
    pub on_missing_cells: Vec<ScheduledActual>,
    /// Crashed primary instances.
    pub crashed: Vec<ScheduledActual>,
    /// Unclaimed primary instances older than the staleness cutoff.
    pub stale_unclaimed: Vec<ScheduledActual>,
    /// Evacuating instances past their deadline.
    pub expired_evacuating: Vec<ActualLrp>,
    /// Per-state gauges.
    pub counts: LrpCounts,
}

/// Everything the task convergence pass needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskConvergenceSnapshot {
    /// All tasks.
    pub tasks: Vec<Task>,
    /// Task counts by state.
    pub counts: BTreeMap<&'static str, u64>,
}

impl TaskConvergenceSnapshot {
    /// Builds a snapshot and its counts from a task list.
    #[must_use]
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut counts = BTreeMap::new();
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Resolving,
        ] {
            counts.insert(state.as_label(), 0);
        }
        for task in &tasks {
            *counts.entry(task.state.as_label()).or_insert(0) += 1;
        }
        Self { tasks, counts }
    }
}

/// Both halves of a convergence cycle's input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceSnapshot {
    /// LRP inputs.
    pub lrps: LrpConvergenceSnapshot,
    /// Task inputs.
    pub tasks: TaskConvergenceSnapshot,
}

/// Computes which of `0..instances` are absent from `existing`.
#[must_use]
pub fn missing_indices(instances: u32, existing: &HashSet<u32>) -> Vec<u32> {
    (0..instances).filter(|i| !existing.contains(i)).collect()
}

/// Durable, transactional storage for cluster state.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from request
/// handlers and the convergence loop.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    // ========================================================================
    // Desired LRPs
    // ========================================================================

    /// Creates a desired LRP with a fresh modification tag.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExists` if the process guid is taken.
    async fn desire_lrp(&self, lrp: &DesiredLrp) -> Result<DesiredLrp>;

    /// Reads one desired LRP.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if absent.
    async fn desired_lrp_by_process_guid(&self, process_guid: &str) -> Result<DesiredLrp>;

    /// Reads desired LRPs matching `filter`.
    async fn desired_lrps(&self, filter: &DesiredLrpFilter) -> Result<Vec<DesiredLrp>>;

    /// Reads the scheduling half of desired LRPs matching `filter`.
    async fn desired_lrp_scheduling_infos(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>>;

    /// Applies `update` if `expected` matches the stored tag.
    ///
    /// # Errors
    ///
    /// - `ResourceNotFound` if absent
    /// - `Conflict` if `expected` is stale
    async fn update_desired_lrp(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange>;

    /// Deletes a desired LRP and returns it.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if absent.
    async fn remove_desired_lrp(&self, process_guid: &str) -> Result<DesiredLrp>;

    // ========================================================================
    // Actual LRPs
    // ========================================================================

    /// Reads actual LRPs matching `filter`.
    async fn actual_lrps(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrp>>;

    /// Reads both slots of one instance.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if both slots are empty.
    async fn actual_lrp_group(&self, process_guid: &str, index: u32) -> Result<ActualLrpGroup>;

    /// Creates an unclaimed primary instance.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExists` if the primary slot is occupied.
    async fn create_unclaimed_actual_lrp(&self, key: &ActualLrpKey) -> Result<ActualLrp>;

    /// Applies a lifecycle update to one slot.
    ///
    /// A no-op update returns an unchanged pair and writes nothing.
    ///
    /// # Errors
    ///
    /// - `ResourceNotFound` if the slot is empty
    /// - `Conflict` if `expected` is stale or the incarnation differs
    /// - `BadRequest` if the state does not allow the update
    async fn update_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
        expected: Option<&ModificationTag>,
        update: &ActualLrpUpdate,
    ) -> Result<ActualLrpChange>;

    /// Removes the primary slot of one instance.
    ///
    /// # Errors
    ///
    /// - `ResourceNotFound` if the slot is empty
    /// - `CannotBeRemoved` if `instance_key` names a different incarnation
    /// - `Conflict` if `expected` is stale
    async fn remove_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
        expected: Option<&ModificationTag>,
    ) -> Result<ActualLrp>;

    // ========================================================================
    // Evacuation
    // ========================================================================

    /// Writes the evacuating slot for an instance leaving its cell.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if `net_info` is empty.
    async fn evacuate_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<EvacuationOutcome>;

    /// Removes the evacuating slot.
    ///
    /// Returns the removed record, or `None` if the slot was already empty.
    ///
    /// # Errors
    ///
    /// Returns `CannotBeRemoved` if a live record belongs to a different
    /// incarnation.
    async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<Option<ActualLrp>>;

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Creates a pending task.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExists` if the guid is taken.
    async fn desire_task(&self, guid: &str, domain: &str, definition: &TaskDefinition)
        -> Result<Task>;

    /// Reads one task.
    async fn task_by_guid(&self, guid: &str) -> Result<Task>;

    /// Reads tasks matching `filter`.
    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Moves a pending task onto a cell. Returns false if it already runs there.
    async fn start_task(&self, guid: &str, cell_id: &str) -> Result<bool>;

    /// Cancels a pending or running task.
    async fn cancel_task(&self, guid: &str) -> Result<Task>;

    /// Fails a pending or running task.
    async fn fail_task(&self, guid: &str, reason: &str) -> Result<Task>;

    /// Records a cell-reported completion.
    async fn complete_task(
        &self,
        guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> Result<Task>;

    /// Marks a completed task as having its callback in flight.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if another caller already moved it.
    async fn resolving_task(&self, guid: &str) -> Result<Task>;

    /// Returns a resolving task to completed.
    async fn demote_to_completed(&self, guid: &str) -> Result<Task>;

    /// Deletes a resolving task.
    async fn delete_task(&self, guid: &str) -> Result<Task>;

    /// Refreshes `updated_at` of a task unchanged since `seen_updated_at`.
    ///
    /// Returns false if the task moved on in the meantime.
    async fn kick_task(&self, guid: &str, seen_updated_at: DateTime<Utc>) -> Result<bool>;

    // ========================================================================
    // Domains
    // ========================================================================

    /// Marks a domain fresh for `ttl`.
    async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<()>;

    /// Lists domains that are currently fresh.
    async fn fresh_domains(&self) -> Result<Vec<String>>;

    // ========================================================================
    // Encryption & configuration
    // ========================================================================

    /// Returns the label of the key the stored blobs were last rotated to.
    async fn encryption_key_label(&self) -> Result<Option<String>>;

    /// Records the label of the key the stored blobs were rotated to.
    async fn set_encryption_key_label(&self, label: &str) -> Result<()>;

    /// Re-encrypts every blob column under the active key.
    async fn perform_encryption(&self) -> Result<EncryptionReport>;

    /// Returns the stored schema version, or 0 if unset.
    async fn schema_version(&self) -> Result<u32>;

    // ========================================================================
    // Convergence scans
    // ========================================================================

    /// Reads the LRP convergence inputs.
    ///
    /// `live_cells` is the set of present cell ids; `stale_before` is the
    /// cutoff for stale unclaimed instances.
    async fn lrp_convergence_snapshot(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<LrpConvergenceSnapshot>;

    /// Reads the task convergence inputs.
    async fn task_convergence_snapshot(&self) -> Result<TaskConvergenceSnapshot>;

    /// Reads everything one convergence cycle plans from.
    ///
    /// The default reads the two halves one after the other, so a record
    /// written in between may be seen by one half only. Backends that can
    /// read both under one transaction override it.
    async fn convergence_snapshot(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<ConvergenceSnapshot> {
        let lrps = self.lrp_convergence_snapshot(live_cells, stale_before).await?;
        let tasks = self.task_convergence_snapshot().await?;
        Ok(ConvergenceSnapshot { lrps, tasks })
    }
}
