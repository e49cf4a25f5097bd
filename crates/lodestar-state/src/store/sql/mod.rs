//! Relational backend over SQLite, Postgres and `MySQL`.
//!
//! ## Design Principles
//!
//! - **One transaction per operation**: Every [`Store`] call opens a
//!   transaction, takes row locks with a locking read, and commits; a failed
//!   or abandoned attempt rolls back when its transaction is dropped
//! - **Dialect at the edge**: Queries are written once and rewritten by
//!   [`Dialect`]; driver errors are classified there too
//! - **Sealed blobs**: Structured columns are JSON in the versioned envelope,
//!   encrypted under the active key

mod actual;
mod convergence;
mod desired;
mod dialect;
mod encryption;
mod evacuation;
pub mod rows;
pub mod schema;
mod tasks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::{AnyConnection, AnyPool};
use sqlx::{Any, Row, Transaction};

use lodestar_core::format::Encoder;
use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpNetInfo, ActualLrpUpdate, DesiredLrp, DesiredLrpChange, DesiredLrpFilter,
    DesiredLrpSchedulingInfo, DesiredLrpUpdate, ModificationTag, Task, TaskDefinition,
    TaskFilter,
};
use lodestar_core::{Clock, Error};

use super::{
    ActualLrpChange, ConvergenceSnapshot, EncryptionReport, EvacuationOutcome,
    LrpConvergenceSnapshot, RetryPolicy, Store, TaskConvergenceSnapshot,
};
use crate::Result;

pub use dialect::{Dialect, UpsertStrategy};

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

/// A value bound into a dynamically built statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlValue {
    Text(String),
    Int(i64),
}

impl SqlValue {
    fn bind<'q>(&'q self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        match self {
            Self::Text(value) => query.bind(value.as_str()),
            Self::Int(value) => query.bind(*value),
        }
    }
}

/// SQL-backed [`Store`].
#[derive(Debug)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    encoder: Encoder,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl SqlStore {
    /// Opens a connection pool for `url`.
    ///
    /// The dialect is taken from the URL scheme. An in-memory SQLite database
    /// exists per connection, so use `max_connections = 1` with
    /// `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unsupported scheme, or the
    /// classified driver error if the pool cannot connect.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        encoder: Encoder,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dialect = Dialect::from_url(url)?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| dialect.classify(e))?;
        tracing::info!(dialect = %dialect, max_connections, "connected to database");
        Ok(Self::new(pool, dialect, encoder, clock))
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: AnyPool, dialect: Dialect, encoder: Encoder, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            dialect,
            encoder,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the deadlock retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Returns the connected dialect.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Creates tables and indexes if missing and records the schema version.
    ///
    /// Safe to run on every startup.
    ///
    /// # Errors
    ///
    /// Returns the classified driver error if a statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&self.dialect.ddl(schema::CREATE_CONFIGURATIONS))
            .execute(&self.pool)
            .await
            .map_err(|e| self.err(e))?;

        for statement in schema::CREATE_TABLES {
            sqlx::query(&self.dialect.ddl(statement))
                .execute(&self.pool)
                .await
                .map_err(|e| self.err(e))?;
        }

        for (name, table, columns) in schema::INDEXES {
            let statement = match self.dialect {
                Dialect::MySql => format!("CREATE INDEX {name} ON {table} ({columns})"),
                Dialect::Sqlite | Dialect::Postgres => {
                    format!("CREATE INDEX IF NOT EXISTS {name} ON {table} ({columns})")
                }
            };
            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => {}
                Err(e) if self.dialect.is_duplicate_index(&e) => {}
                Err(e) => return Err(self.err(e)),
            }
        }

        let mut tx = self.begin().await?;
        self.upsert(
            &mut tx,
            "configurations",
            &[("id", SqlValue::Text(schema::SCHEMA_VERSION_ID.to_string()))],
            &[("value", SqlValue::Text(schema::SCHEMA_VERSION.to_string()))],
        )
        .await?;
        self.commit(tx).await?;

        tracing::info!(
            dialect = %self.dialect,
            version = schema::SCHEMA_VERSION,
            "database schema ready"
        );
        Ok(())
    }

    // ========================================================================
    // Helpers shared by the operation modules
    // ========================================================================

    fn err(&self, err: sqlx::Error) -> Error {
        self.dialect.classify(err)
    }

    fn sql(&self, query: &str) -> String {
        self.dialect.rebind(query)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn begin(&self) -> Result<Transaction<'static, Any>> {
        self.pool.begin().await.map_err(|e| self.err(e))
    }

    async fn commit(&self, tx: Transaction<'static, Any>) -> Result<()> {
        tx.commit().await.map_err(|e| self.err(e))
    }

    /// Inserts or updates one row by its natural key.
    async fn upsert(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        keys: &[(&str, SqlValue)],
        values: &[(&str, SqlValue)],
    ) -> Result<()> {
        let key_names: Vec<&str> = keys.iter().map(|(column, _)| *column).collect();
        let value_names: Vec<&str> = values.iter().map(|(column, _)| *column).collect();
        let all_names = [key_names.as_slice(), value_names.as_slice()].concat();
        let key_values = keys.iter().map(|(_, value)| value);
        let set_values = values.iter().map(|(_, value)| value);

        let (statement, binds): (String, Vec<&SqlValue>) = match self.dialect.upsert_strategy() {
            UpsertStrategy::OnConflict => (
                format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                    all_names.join(", "),
                    rows::placeholders(all_names.len()),
                    key_names.join(", "),
                    value_names
                        .iter()
                        .map(|c| format!("{c} = excluded.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                key_values.chain(set_values).collect(),
            ),
            UpsertStrategy::OnDuplicateKey => (
                format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                    all_names.join(", "),
                    rows::placeholders(all_names.len()),
                    value_names
                        .iter()
                        .map(|c| format!("{c} = VALUES({c})"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                key_values.chain(set_values).collect(),
            ),
            UpsertStrategy::LockAndMerge => {
                sqlx::query(&format!("LOCK TABLE {table} IN SHARE ROW EXCLUSIVE MODE"))
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| self.err(e))?;
                let assignments = value_names
                    .iter()
                    .map(|c| format!("{c} = ?"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let conditions = key_names
                    .iter()
                    .map(|c| format!("{c} = ?"))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                (
                    format!(
                        "WITH upsert AS (UPDATE {table} SET {assignments} WHERE {conditions} RETURNING *) \
                         INSERT INTO {table} ({}) SELECT {} WHERE NOT EXISTS (SELECT * FROM upsert)",
                        all_names.join(", "),
                        rows::placeholders(all_names.len()),
                    ),
                    set_values
                        .clone()
                        .chain(key_values.clone())
                        .chain(key_values)
                        .chain(set_values)
                        .collect(),
                )
            }
        };

        let statement = self.sql(&statement);
        let mut query = sqlx::query(&statement);
        for value in binds {
            query = value.bind(query);
        }
        query.execute(&mut *conn).await.map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn configuration_value(&self, conn: &mut AnyConnection, id: &str) -> Result<Option<String>> {
        let statement = self.sql("SELECT value FROM configurations WHERE id = ?");
        let row = sqlx::query(&statement)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        row.map(|row| rows::text(&row, "value")).transpose()
    }

    async fn set_configuration_value(&self, id: &str, value: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        self.upsert(
            &mut tx,
            "configurations",
            &[("id", SqlValue::Text(id.to_string()))],
            &[("value", SqlValue::Text(value.to_string()))],
        )
        .await?;
        self.commit(tx).await
    }

    async fn upsert_domain_tx(&self, domain: &str, ttl: Duration) -> Result<()> {
        let expires_at = lodestar_core::clock::after(self.now(), ttl);
        let mut tx = self.begin().await?;
        self.upsert(
            &mut tx,
            "domains",
            &[("domain", SqlValue::Text(domain.to_string()))],
            &[("expire_time", SqlValue::Int(rows::to_nanos(expires_at)))],
        )
        .await?;
        self.commit(tx).await
    }

    async fn fresh_domains_tx(&self) -> Result<Vec<String>> {
        let statement =
            self.sql("SELECT domain FROM domains WHERE expire_time > ? ORDER BY domain");
        let found = sqlx::query(&statement)
            .bind(rows::to_nanos(self.now()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        found.iter().map(|row| rows::text(row, "domain")).collect()
    }

    async fn schema_version_tx(&self) -> Result<u32> {
        let mut conn = self.pool.acquire().await.map_err(|e| self.err(e))?;
        let value = self.configuration_value(&mut conn, schema::SCHEMA_VERSION_ID).await?;
        value.map_or(Ok(0), |v| {
            v.parse()
                .map_err(|_| Error::invalid_record(format!("invalid schema version {v:?}")))
        })
    }

    async fn encryption_key_label_tx(&self) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(|e| self.err(e))?;
        self.configuration_value(&mut conn, schema::ENCRYPTION_KEY_LABEL_ID)
            .await
    }
}

/// Renames a generic unique-key violation after the record being created.
fn exists_as(err: Error, resource_type: &'static str, id: impl std::fmt::Display) -> Error {
    match err {
        Error::ResourceExists { .. } => Error::exists(resource_type, id),
        other => other,
    }
}

/// Reads the first column of a single-row count.
fn count(row: &sqlx::any::AnyRow, column: &str) -> Result<u64> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| Error::invalid_record(format!("column {column}: {e}")))?;
    u64::try_from(value)
        .map_err(|_| Error::unrecoverable(format!("column {column}: negative count {value}")))
}

#[async_trait]
impl Store for SqlStore {
    fn backend(&self) -> &'static str {
        self.dialect.name()
    }

    async fn desire_lrp(&self, lrp: &DesiredLrp) -> Result<DesiredLrp> {
        self.retry
            .run("desire_lrp", move || self.desire_lrp_tx(lrp))
            .await
    }

    async fn desired_lrp_by_process_guid(&self, process_guid: &str) -> Result<DesiredLrp> {
        self.retry
            .run("desired_lrp_by_process_guid", move || {
                self.desired_lrp_by_process_guid_tx(process_guid)
            })
            .await
    }

    async fn desired_lrps(&self, filter: &DesiredLrpFilter) -> Result<Vec<DesiredLrp>> {
        self.retry
            .run("desired_lrps", move || self.desired_lrps_tx(filter))
            .await
    }

    async fn desired_lrp_scheduling_infos(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>> {
        self.retry
            .run("desired_lrp_scheduling_infos", move || {
                self.scheduling_infos_tx(filter)
            })
            .await
    }

    async fn update_desired_lrp(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange> {
        self.retry
            .run("update_desired_lrp", move || {
                self.update_desired_lrp_tx(process_guid, expected, update)
            })
            .await
    }

    async fn remove_desired_lrp(&self, process_guid: &str) -> Result<DesiredLrp> {
        self.retry
            .run("remove_desired_lrp", move || {
                self.remove_desired_lrp_tx(process_guid)
            })
            .await
    }

    async fn actual_lrps(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrp>> {
        self.retry
            .run("actual_lrps", move || self.actual_lrps_tx(filter))
            .await
    }

    async fn actual_lrp_group(&self, process_guid: &str, index: u32) -> Result<ActualLrpGroup> {
        self.retry
            .run("actual_lrp_group", move || {
                self.actual_lrp_group_tx(process_guid, index)
            })
            .await
    }

    async fn create_unclaimed_actual_lrp(&self, key: &ActualLrpKey) -> Result<ActualLrp> {
        self.retry
            .run("create_unclaimed_actual_lrp", move || {
                self.create_unclaimed_actual_lrp_tx(key)
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
                self.update_actual_lrp_tx(process_guid, index, evacuating, expected, update)
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
                self.remove_actual_lrp_tx(process_guid, index, instance_key, expected)
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
                self.evacuate_actual_lrp_tx(key, instance_key, net_info, ttl)
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
                self.remove_evacuating_actual_lrp_tx(key, instance_key)
            })
            .await
    }

    async fn desire_task(
        &self,
        guid: &str,
        domain: &str,
        definition: &TaskDefinition,
    ) -> Result<Task> {
        self.retry
            .run("desire_task", move || {
                self.desire_task_tx(guid, domain, definition)
            })
            .await
    }

    async fn task_by_guid(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("task_by_guid", move || self.task_by_guid_tx(guid))
            .await
    }

    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.retry.run("tasks", move || self.tasks_tx(filter)).await
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
            .run("cancel_task", move || self.cancel_task_tx(guid))
            .await
    }

    async fn fail_task(&self, guid: &str, reason: &str) -> Result<Task> {
        self.retry
            .run("fail_task", move || self.fail_task_tx(guid, reason))
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
                self.complete_task_tx(guid, cell_id, failed, failure_reason, result)
            })
            .await
    }

    async fn resolving_task(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("resolving_task", move || self.resolving_task_tx(guid))
            .await
    }

    async fn demote_to_completed(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("demote_to_completed", move || self.demote_to_completed_tx(guid))
            .await
    }

    async fn delete_task(&self, guid: &str) -> Result<Task> {
        self.retry
            .run("delete_task", move || self.delete_task_tx(guid))
            .await
    }

    async fn kick_task(&self, guid: &str, seen_updated_at: DateTime<Utc>) -> Result<bool> {
        self.retry
            .run("kick_task", move || self.kick_task_tx(guid, seen_updated_at))
            .await
    }

    async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<()> {
        self.retry
            .run("upsert_domain", move || self.upsert_domain_tx(domain, ttl))
            .await
    }

    async fn fresh_domains(&self) -> Result<Vec<String>> {
        self.retry
            .run("fresh_domains", move || self.fresh_domains_tx())
            .await
    }

    async fn encryption_key_label(&self) -> Result<Option<String>> {
        self.retry
            .run("encryption_key_label", move || self.encryption_key_label_tx())
            .await
    }

    async fn set_encryption_key_label(&self, label: &str) -> Result<()> {
        self.retry
            .run("set_encryption_key_label", move || {
                self.set_configuration_value(schema::ENCRYPTION_KEY_LABEL_ID, label)
            })
            .await
    }

    async fn perform_encryption(&self) -> Result<EncryptionReport> {
        self.perform_encryption_all().await
    }

    async fn schema_version(&self) -> Result<u32> {
        self.retry
            .run("schema_version", move || self.schema_version_tx())
            .await
    }

    async fn lrp_convergence_snapshot(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<LrpConvergenceSnapshot> {
        self.retry
            .run("lrp_convergence_snapshot", move || {
                self.lrp_convergence_snapshot_tx(live_cells, stale_before)
            })
            .await
    }

    async fn task_convergence_snapshot(&self) -> Result<TaskConvergenceSnapshot> {
        self.retry
            .run("task_convergence_snapshot", move || {
                self.task_convergence_snapshot_tx()
            })
            .await
    }

    async fn convergence_snapshot(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<ConvergenceSnapshot> {
        self.retry
            .run("convergence_snapshot", move || {
                self.convergence_snapshot_tx(live_cells, stale_before)
            })
            .await
    }
}
