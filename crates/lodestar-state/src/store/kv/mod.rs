//! Key-value backend.
//!
//! One serialized record per key under `/v1/`. Creates use a
//! `DoesNotExist` precondition and read-modify-write cycles use
//! `MatchesVersion`; losing a race to another writer is retried through the
//! same [`RetryPolicy`] the SQL backend uses for deadlocks.
//!
//! ## Key Layout
//!
//! ```text
//! /v1/desired_lrp/<process_guid>
//! /v1/actual_lrp/<process_guid>/<index>/{instance,evacuating}
//! /v1/task/<guid>
//! /v1/domain/<name>
//! /v1/configuration/<id>
//! ```

pub mod backend;
mod convergence;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use lodestar_core::clock::after;
use lodestar_core::format::{Encoder, Format};
use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpNetInfo, ActualLrpUpdate, CANCELLED_REASON, DesiredLrp, DesiredLrpChange,
    DesiredLrpFilter, DesiredLrpSchedulingInfo, DesiredLrpUpdate, Domain, ModificationTag, Task,
    TaskDefinition, TaskFilter, TaskState,
};
use lodestar_core::{Clock, Error};

use super::{
    ActualLrpChange, EncryptionReport, EvacuationOutcome, LrpConvergenceSnapshot, RetryPolicy,
    Store, TaskConvergenceSnapshot,
};
use crate::Result;

pub use backend::{Entry, KeyValueBackend, MemoryKeyValue, WritePrecondition, WriteResult};

/// Schema version recorded by [`KvStore::ensure_schema`].
pub const SCHEMA_VERSION: u32 = 1;

mod keys {
    pub const DESIRED_LRPS: &str = "/v1/desired_lrp/";
    pub const ACTUAL_LRPS: &str = "/v1/actual_lrp/";
    pub const TASKS: &str = "/v1/task/";
    pub const DOMAINS: &str = "/v1/domain/";

    pub const ENCRYPTION_KEY_LABEL: &str = "/v1/configuration/encryption_key_label";
    pub const SCHEMA_VERSION: &str = "/v1/configuration/schema_version";

    pub fn desired_lrp(process_guid: &str) -> String {
        format!("{DESIRED_LRPS}{process_guid}")
    }

    pub fn actual_lrps_of(process_guid: &str) -> String {
        format!("{ACTUAL_LRPS}{process_guid}/")
    }

    pub fn actual_lrp(process_guid: &str, index: u32, evacuating: bool) -> String {
        let slot = if evacuating { "evacuating" } else { "instance" };
        format!("{ACTUAL_LRPS}{process_guid}/{index}/{slot}")
    }

    pub fn task(guid: &str) -> String {
        format!("{TASKS}{guid}")
    }

    pub fn domain(name: &str) -> String {
        format!("{DOMAINS}{name}")
    }
}

fn raced(key: &str) -> Error {
    Error::deadlock(format!("concurrent write to {key}"))
}

/// Key-value-backed [`Store`].
#[derive(Debug)]
pub struct KvStore<B> {
    backend: B,
    encoder: Encoder,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<B: KeyValueBackend> KvStore<B> {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: B, encoder: Encoder, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            encoder,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the race retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the underlying backend.
    #[must_use]
    pub const fn kv(&self) -> &B {
        &self.backend
    }

    /// Records the schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let value = self
            .encoder
            .encode_json(Format::Unencoded, &SCHEMA_VERSION.to_string())?;
        self.backend
            .put(keys::SCHEMA_VERSION, Bytes::from(value), WritePrecondition::None)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Record helpers
    // ========================================================================

    fn decode<T: DeserializeOwned>(&self, entry: &Entry) -> Result<T> {
        let envelope = std::str::from_utf8(&entry.value).map_err(|e| {
            Error::invalid_record(format!("{} is not valid utf-8: {e}", entry.key))
        })?;
        self.encoder.decode_json(envelope)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.backend.get(key).await? {
            Some(entry) => Ok(Some((self.decode(&entry)?, entry.version))),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        format: Format,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let envelope = self.encoder.encode_json(format, value)?;
        self.backend
            .put(key, Bytes::from(envelope), precondition)
            .await
    }

    async fn create<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        resource_type: &'static str,
        id: &str,
    ) -> Result<()> {
        match self
            .write(key, value, Format::Base64Encrypted, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::exists(resource_type, id)),
        }
    }

    async fn swap<T: Serialize + Sync>(&self, key: &str, value: &T, version: u64) -> Result<()> {
        match self
            .write(
                key,
                value,
                Format::Base64Encrypted,
                WritePrecondition::MatchesVersion(version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(raced(key)),
        }
    }

    async fn remove(&self, key: &str, version: u64) -> Result<()> {
        match self
            .backend
            .delete(key, WritePrecondition::MatchesVersion(version))
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(raced(key)),
        }
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(T, u64)>> {
        let entries = self.backend.list(prefix).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| match self.decode(entry) {
                Ok(value) => Some((value, entry.version)),
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    async fn actual_slot(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
    ) -> Result<Option<(ActualLrp, u64)>> {
        self.read(&keys::actual_lrp(process_guid, index, evacuating))
            .await
    }

    // ========================================================================
    // Single attempts
    // ========================================================================

    async fn update_desired_once(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange> {
        let key = keys::desired_lrp(process_guid);
        let (before, version) = self
            .read::<DesiredLrp>(&key)
            .await?
            .ok_or_else(|| Error::not_found("desired_lrp", process_guid))?;
        before.modification_tag.check(expected)?;
        let mut after = before.clone();
        after.apply(update);
        after.modification_tag = before.modification_tag.incremented();
        self.swap(&key, &after, version).await?;
        Ok(DesiredLrpChange { before, after })
    }

    async fn remove_desired_once(&self, process_guid: &str) -> Result<DesiredLrp> {
        let key = keys::desired_lrp(process_guid);
        let (lrp, version) = self
            .read::<DesiredLrp>(&key)
            .await?
            .ok_or_else(|| Error::not_found("desired_lrp", process_guid))?;
        self.remove(&key, version).await?;
        Ok(lrp)
    }

    async fn update_actual_once(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
        expected: Option<&ModificationTag>,
        update: &ActualLrpUpdate,
    ) -> Result<ActualLrpChange> {
        let (before, version) = self
            .actual_slot(process_guid, index, evacuating)
            .await?
            .ok_or_else(|| Error::not_found("actual_lrp", format!("{process_guid}/{index}")))?;
        before.modification_tag.check(expected)?;
        let mut after = before.clone();
        if after.apply(update, self.clock.now())? {
            after.modification_tag.increment();
            self.swap(&keys::actual_lrp(process_guid, index, evacuating), &after, version)
                .await?;
        }
        Ok(ActualLrpChange { before, after })
    }

    async fn remove_actual_once(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
        expected: Option<&ModificationTag>,
    ) -> Result<ActualLrp> {
        let (existing, version) = self
            .actual_slot(process_guid, index, false)
            .await?
            .ok_or_else(|| Error::not_found("actual_lrp", format!("{process_guid}/{index}")))?;
        if instance_key.is_some_and(|ik| *ik != existing.instance_key) {
            return Err(Error::cannot_be_removed(format!(
                "{} is held by instance {}",
                existing.key, existing.instance_key.instance_guid
            )));
        }
        existing.modification_tag.check(expected)?;
        self.remove(&keys::actual_lrp(process_guid, index, false), version)
            .await?;
        Ok(existing)
    }

    async fn evacuate_once(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<EvacuationOutcome> {
        if net_info.is_empty() {
            return Err(Error::bad_request(format!(
                "cannot evacuate {key} without net info"
            )));
        }
        let now = self.clock.now();
        let expires_at = after(now, ttl);
        let slot = keys::actual_lrp(&key.process_guid, key.index, true);

        match self.read::<ActualLrp>(&slot).await? {
            Some((existing, _))
                if !existing.is_expired(now)
                    && existing.key == *key
                    && existing.instance_key == *instance_key
                    && existing.net_info == *net_info =>
            {
                Ok(EvacuationOutcome::Unchanged(existing))
            }
            Some((existing, version)) if !existing.is_expired(now) => {
                let mut replaced = existing.clone();
                replaced.key = key.clone();
                replaced.instance_key = instance_key.clone();
                replaced.net_info = net_info.clone();
                replaced.since = now;
                replaced.expires_at = Some(expires_at);
                replaced.modification_tag.increment();
                self.swap(&slot, &replaced, version).await?;
                Ok(EvacuationOutcome::Updated {
                    before: existing,
                    after: replaced,
                })
            }
            expired => {
                let created = ActualLrp::evacuating(
                    key.clone(),
                    instance_key.clone(),
                    net_info.clone(),
                    now,
                    expires_at,
                );
                match expired {
                    Some((_, version)) => self.swap(&slot, &created, version).await?,
                    None => self.create(&slot, &created, "actual_lrp", &slot).await?,
                }
                Ok(EvacuationOutcome::Created(created))
            }
        }
    }

    async fn remove_evacuating_once(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<Option<ActualLrp>> {
        let slot = keys::actual_lrp(&key.process_guid, key.index, true);
        let Some((existing, version)) = self.read::<ActualLrp>(&slot).await? else {
            return Ok(None);
        };
        if !existing.is_expired(self.clock.now()) && existing.instance_key != *instance_key {
            return Err(Error::cannot_be_removed(format!(
                "evacuating {} is held by instance {}",
                existing.key, existing.instance_key.instance_guid
            )));
        }
        self.remove(&slot, version).await?;
        Ok(Some(existing))
    }

    async fn mutate_task<R, F>(&self, guid: &str, change: F) -> Result<R>
    where
        F: FnOnce(&mut Task, DateTime<Utc>) -> Result<R> + Send,
        R: Send,
    {
        let key = keys::task(guid);
        let (mut task, version) = self
            .read::<Task>(&key)
            .await?
            .ok_or_else(|| Error::not_found("task", guid))?;
        let outcome = change(&mut task, self.clock.now())?;
        self.swap(&key, &task, version).await?;
        Ok(outcome)
    }

    async fn delete_task_once(&self, guid: &str) -> Result<Task> {
        let key = keys::task(guid);
        let (task, version) = self
            .read::<Task>(&key)
            .await?
            .ok_or_else(|| Error::not_found("task", guid))?;
        if task.state != TaskState::Resolving {
            return Err(Error::bad_request(format!(
                "task {guid} is {}, only resolving tasks can be deleted",
                task.state
            )));
        }
        self.remove(&key, version).await?;
        Ok(task)
    }

    async fn kick_task_once(&self, guid: &str, seen_updated_at: DateTime<Utc>) -> Result<bool> {
        let key = keys::task(guid);
        let (mut task, version) = self
            .read::<Task>(&key)
            .await?
            .ok_or_else(|| Error::not_found("task", guid))?;
        if task.updated_at != seen_updated_at {
            return Ok(false);
        }
        task.updated_at = self.clock.now();
        self.swap(&key, &task, version).await?;
        Ok(true)
    }

    async fn upsert_domain_once(&self, name: &str, ttl: Duration) -> Result<()> {
        let key = keys::domain(name);
        let domain = Domain {
            name: name.to_string(),
            expires_at: after(self.clock.now(), ttl),
        };
        let precondition = match self.backend.get(&key).await? {
            Some(entry) => WritePrecondition::MatchesVersion(entry.version),
            None => WritePrecondition::DoesNotExist,
        };
        match self
            .write(&key, &domain, Format::Unencoded, precondition)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(raced(&key)),
        }
    }

    async fn fresh_domain_names(&self) -> Result<HashSet<String>> {
        let now = self.clock.now();
        Ok(self
            .list::<Domain>(keys::DOMAINS)
            .await?
            .into_iter()
            .filter(|(domain, _)| domain.is_fresh(now))
            .map(|(domain, _)| domain.name)
            .collect())
    }

    async fn configuration(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read::<String>(key).await?.map(|(value, _)| value))
    }

    async fn actual_lrp_group_once(&self, process_guid: &str, index: u32) -> Result<ActualLrpGroup> {
        let group = ActualLrpGroup {
            instance: self
                .actual_slot(process_guid, index, false)
                .await?
                .map(|(lrp, _)| lrp),
            evacuating: self
                .actual_slot(process_guid, index, true)
                .await?
                .map(|(lrp, _)| lrp),
        };
        if group.is_empty() {
            return Err(Error::not_found(
                "actual_lrp",
                format!("{process_guid}/{index}"),
            ));
        }
        Ok(group)
    }

    /// Re-encrypts one entry; returns false if it could not be decoded.
    async fn reencrypt_once(&self, key: &str) -> Result<bool> {
        let Some(entry) = self.backend.get(key).await? else {
            return Ok(false);
        };
        let payload = match std::str::from_utf8(&entry.value)
            .map_err(|e| Error::invalid_record(e.to_string()))
            .and_then(|envelope| self.encoder.decode(envelope))
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key, error = %e, "leaving undecodable record in place");
                return Ok(false);
            }
        };
        let sealed = self.encoder.encode(Format::Base64Encrypted, &payload)?;
        match self
            .backend
            .put(
                key,
                Bytes::from(sealed),
                WritePrecondition::MatchesVersion(entry.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(true),
            WriteResult::PreconditionFailed { .. } => Err(raced(key)),
        }
    }
}

#[async_trait]
impl<B: KeyValueBackend> Store for KvStore<B> {
    fn backend(&self) -> &'static str {
        "kv"
    }

    async fn desire_lrp(&self, lrp: &DesiredLrp) -> Result<DesiredLrp> {
        if lrp.process_guid.is_empty() {
            return Err(Error::bad_request("process guid is required"));
        }
        self.retry
            .run("desire_lrp", move || async move {
                let mut stored = lrp.clone();
                stored.modification_tag = ModificationTag::fresh();
                self.create(
                    &keys::desired_lrp(&stored.process_guid),
                    &stored,
                    "desired_lrp",
                    &stored.process_guid,
                )
                .await?;
                tracing::debug!(process_guid = %stored.process_guid, "desired lrp created");
                Ok(stored)
            })
            .await
    }

    async fn desired_lrp_by_process_guid(&self, process_guid: &str) -> Result<DesiredLrp> {
        self.retry
            .run("desired_lrp_by_process_guid", move || async move {
                self.read::<DesiredLrp>(&keys::desired_lrp(process_guid))
                    .await?
                    .map(|(lrp, _)| lrp)
                    .ok_or_else(|| Error::not_found("desired_lrp", process_guid))
            })
            .await
    }

    async fn desired_lrps(&self, filter: &DesiredLrpFilter) -> Result<Vec<DesiredLrp>> {
        self.retry
            .run("desired_lrps", move || async move {
                Ok(self
                    .list::<DesiredLrp>(keys::DESIRED_LRPS)
                    .await?
                    .into_iter()
                    .map(|(lrp, _)| lrp)
                    .filter(|lrp| filter.matches(&lrp.process_guid, &lrp.domain))
                    .collect())
            })
            .await
    }

    async fn desired_lrp_scheduling_infos(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>> {
        Ok(self
            .desired_lrps(filter)
            .await?
            .iter()
            .map(DesiredLrp::scheduling_info)
            .collect())
    }

    async fn update_desired_lrp(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange> {
        self.retry
            .run("update_desired_lrp", move || {
                self.update_desired_once(process_guid, expected, update)
            })
            .await
    }

    async fn remove_desired_lrp(&self, process_guid: &str) -> Result<DesiredLrp> {
        self.retry
            .run("remove_desired_lrp", move || {
                self.remove_desired_once(process_guid)
            })
            .await
    }

    async fn actual_lrps(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrp>> {
        let prefix = filter
            .process_guid
            .as_deref()
            .map_or_else(|| keys::ACTUAL_LRPS.to_string(), keys::actual_lrps_of);
        let prefix = prefix.as_str();
        self.retry
            .run("actual_lrps", move || async move {
                let mut lrps: Vec<ActualLrp> = self
                    .list::<ActualLrp>(prefix)
                    .await?
                    .into_iter()
                    .map(|(lrp, _)| lrp)
                    .filter(|lrp| filter.matches(lrp))
                    .collect();
                lrps.sort_by(|a, b| (&a.key, a.evacuating).cmp(&(&b.key, b.evacuating)));
                Ok(lrps)
            })
            .await
    }

    async fn actual_lrp_group(&self, process_guid: &str, index: u32) -> Result<ActualLrpGroup> {
        self.retry
            .run("actual_lrp_group", move || self.actual_lrp_group_once(process_guid, index))
            .await
    }

    async fn create_unclaimed_actual_lrp(&self, key: &ActualLrpKey) -> Result<ActualLrp> {
        self.retry
            .run("create_unclaimed_actual_lrp", move || async move {
                let lrp = ActualLrp::unclaimed(key.clone(), self.clock.now());
                self.create(
                    &keys::actual_lrp(&key.process_guid, key.index, false),
                    &lrp,
                    "actual_lrp",
                    &key.to_string(),
                )
                .await?;
                tracing::debug!(lrp = %key, "unclaimed actual lrp created");
                Ok(lrp)
            })
            .await
    }

    async fn update_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
        expected: Option<&ModificationTag>,
        update: &ActualLrpUpdate,
    ) -> Result<ActualLrpChange> {
        self.retry
            .run("update_actual_lrp", move || {
                self.update_actual_once(process_guid, index, evacuating, expected, update)
            })
            .await
    }

    async fn remove_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
        expected: Option<&ModificationTag>,
    ) -> Result<ActualLrp> {
        self.retry
            .run("remove_actual_lrp", move || {
                self.remove_actual_once(process_guid, index, instance_key, expected)
            })
            .await
    }

    async fn evacuate_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<EvacuationOutcome> {
        self.retry
            .run("evacuate_actual_lrp", move || {
                self.evacuate_once(key, instance_key, net_info, ttl)
            })
            .await
    }

    async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<Option<ActualLrp>> {
        self.retry
            .run("remove_evacuating_actual_lrp", move || {
                self.remove_evacuating_once(key, instance_key)
            })
            .await
    }

    async fn desire_task(
        &self,
        guid: &str,
        domain: &str,
        definition: &TaskDefinition,
    ) -> Result<Task> {
        if guid.is_empty() || domain.is_empty() {
            return Err(Error::bad_request("task guid and domain are required"));
        }
        self.retry
            .run("desire_task", move || async move {
                let task = Task::new(guid, domain, definition.clone(), self.clock.now());
                self.create(&keys::task(guid), &task, "task", guid).await?;
                tracing::debug!(task_guid = guid, domain, "task desired");
                Ok(task)
            })
            .await
    }

    async fn task_by_guid(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("task_by_guid", move || async move {
                self.read::<Task>(&keys::task(guid))
                    .await?
                    .map(|(task, _)| task)
                    .ok_or_else(|| Error::not_found("task", guid))
            })
            .await
    }

    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.retry
            .run("tasks", move || async move {
                Ok(self
                    .list::<Task>(keys::TASKS)
                    .await?
                    .into_iter()
                    .map(|(task, _)| task)
                    .filter(|task| filter.matches(task))
                    .collect())
            })
            .await
    }

    async fn start_task(&self, guid: &str, cell_id: &str) -> Result<bool> {
        self.retry
            .run("start_task", move || {
                self.mutate_task(guid, move |task, now| task.start(cell_id, now))
            })
            .await
    }

    async fn cancel_task(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("cancel_task", move || {
                self.mutate_task(guid, |task, now| {
                    task.fail(CANCELLED_REASON, now)?;
                    Ok(task.clone())
                })
            })
            .await
    }

    async fn fail_task(&self, guid: &str, reason: &str) -> Result<Task> {
        self.retry
            .run("fail_task", move || {
                self.mutate_task(guid, move |task, now| {
                    task.fail(reason, now)?;
                    Ok(task.clone())
                })
            })
            .await
    }

    async fn complete_task(
        &self,
        guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> Result<Task> {
        self.retry
            .run("complete_task", move || {
                self.mutate_task(guid, move |task, now| {
                    task.complete(cell_id, failed, failure_reason, result, now)?;
                    Ok(task.clone())
                })
            })
            .await
    }

    async fn resolving_task(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("resolving_task", move || {
                self.mutate_task(guid, |task, now| {
                    task.resolve(now)?;
                    Ok(task.clone())
                })
            })
            .await
    }

    async fn demote_to_completed(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("demote_to_completed", move || {
                self.mutate_task(guid, |task, now| {
                    task.demote(now)?;
                    Ok(task.clone())
                })
            })
            .await
    }

    async fn delete_task(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("delete_task", move || self.delete_task_once(guid))
            .await
    }

    async fn kick_task(&self, guid: &str, seen_updated_at: DateTime<Utc>) -> Result<bool> {
        self.retry
            .run("kick_task", move || self.kick_task_once(guid, seen_updated_at))
            .await
    }

    async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<()> {
        self.retry
            .run("upsert_domain", move || self.upsert_domain_once(domain, ttl))
            .await
    }

    async fn fresh_domains(&self) -> Result<Vec<String>> {
        self.retry
            .run("fresh_domains", move || async move {
                let mut names: Vec<String> =
                    self.fresh_domain_names().await?.into_iter().collect();
                names.sort();
                Ok(names)
            })
            .await
    }

    async fn encryption_key_label(&self) -> Result<Option<String>> {
        self.retry
            .run("encryption_key_label", move || {
                self.configuration(keys::ENCRYPTION_KEY_LABEL)
            })
            .await
    }

    async fn set_encryption_key_label(&self, label: &str) -> Result<()> {
        self.retry
            .run("set_encryption_key_label", move || async move {
                self.write(
                    keys::ENCRYPTION_KEY_LABEL,
                    &label,
                    Format::Unencoded,
                    WritePrecondition::None,
                )
                .await?;
                Ok(())
            })
            .await
    }

    async fn perform_encryption(&self) -> Result<EncryptionReport> {
        let mut report = EncryptionReport::default();
        for prefix in [keys::DESIRED_LRPS, keys::ACTUAL_LRPS, keys::TASKS] {
            let entries = self
                .retry
                .run("perform_encryption", move || self.backend.list(prefix))
                .await?;
            for entry in entries {
                let key = entry.key.as_str();
                let rewritten = self
                    .retry
                    .run("perform_encryption", move || self.reencrypt_once(key))
                    .await?;
                if rewritten {
                    report.rewritten += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }
        tracing::info!(
            key_label = self.encoder.active_label(),
            rewritten = report.rewritten,
            skipped = report.skipped,
            "re-encryption finished"
        );
        Ok(report)
    }

    async fn schema_version(&self) -> Result<u32> {
        let stored = self
            .retry
            .run("schema_version", move || self.configuration(keys::SCHEMA_VERSION))
            .await?;
        match stored {
            Some(value) => value
                .parse()
                .map_err(|_| Error::invalid_record(format!("invalid schema version {value:?}"))),
            None => Ok(0),
        }
    }

    async fn lrp_convergence_snapshot(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<LrpConvergenceSnapshot> {
        self.retry
            .run("lrp_convergence_snapshot", move || async move {
                let desired: Vec<DesiredLrp> = self
                    .list::<DesiredLrp>(keys::DESIRED_LRPS)
                    .await?
                    .into_iter()
                    .map(|(lrp, _)| lrp)
                    .collect();
                let actuals: Vec<ActualLrp> = self
                    .list::<ActualLrp>(keys::ACTUAL_LRPS)
                    .await?
                    .into_iter()
                    .map(|(lrp, _)| lrp)
                    .collect();
                let fresh = self.fresh_domain_names().await?;
                Ok(convergence::lrp_snapshot(
                    &desired,
                    actuals,
                    &fresh,
                    live_cells,
                    stale_before,
                    self.clock.now(),
                ))
            })
            .await
    }

    async fn task_convergence_snapshot(&self) -> Result<TaskConvergenceSnapshot> {
        // `tasks` already runs under the retry policy.
        let tasks = self.tasks(&TaskFilter::default()).await?;
        Ok(TaskConvergenceSnapshot::from_tasks(tasks))
    }
}
