//! Task operations.

use chrono::{DateTime, Utc};
use sqlx::AnyConnection;

use lodestar_core::Error;
use lodestar_core::models::{CANCELLED_REASON, Task, TaskDefinition, TaskFilter, TaskState};

use super::rows::{self, column_list, flag, placeholders, seal, to_nanos};
use super::{SqlStore, exists_as};
use crate::Result;

impl SqlStore {
    async fn locked_task(&self, conn: &mut AnyConnection, guid: &str) -> Result<Task> {
        let statement = self.sql(&format!(
            "SELECT {} FROM tasks WHERE guid = ?{}",
            column_list(rows::TASK_COLUMNS, None),
            self.dialect.for_update()
        ));
        let row = sqlx::query(&statement)
            .bind(guid)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.err(e))?
            .ok_or_else(|| Error::not_found("task", guid))?;
        rows::task(&row, &self.encoder)
    }

    async fn write_task(&self, conn: &mut AnyConnection, task: &Task) -> Result<()> {
        let statement = self.sql(
            "UPDATE tasks SET state = ?, cell_id = ?, result = ?, failed = ?, failure_reason = ?, \
             updated_at = ?, first_completed_at = ? WHERE guid = ?",
        );
        sqlx::query(&statement)
            .bind(task.state.as_label())
            .bind(task.cell_id.as_str())
            .bind(task.result.as_str())
            .bind(flag(task.failed))
            .bind(task.failure_reason.as_str())
            .bind(to_nanos(task.updated_at))
            .bind(task.first_completed_at.map_or(0, to_nanos))
            .bind(task.guid.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    /// Locks a task, applies `change`, and writes the result.
    pub(super) async fn mutate_task<R, F>(&self, guid: &str, change: F) -> Result<R>
    where
        F: FnOnce(&mut Task, DateTime<Utc>) -> Result<R> + Send,
        R: Send,
    {
        let mut tx = self.begin().await?;
        let mut task = self.locked_task(&mut tx, guid).await?;
        let from = task.state;
        let outcome = change(&mut task, self.now())?;
        self.write_task(&mut tx, &task).await?;
        self.commit(tx).await?;
        tracing::debug!(task_guid = guid, %from, to = %task.state, "task updated");
        Ok(outcome)
    }

    pub(super) async fn desire_task_tx(
        &self,
        guid: &str,
        domain: &str,
        definition: &TaskDefinition,
    ) -> Result<Task> {
        if guid.is_empty() || domain.is_empty() {
            return Err(Error::bad_request("task guid and domain are required"));
        }
        let task = Task::new(guid, domain, definition.clone(), self.now());
        let sealed = seal(&self.encoder, &task.definition)?;

        let statement = self.sql(&format!(
            "INSERT INTO tasks ({}) VALUES ({})",
            column_list(rows::TASK_COLUMNS, None),
            placeholders(rows::TASK_COLUMNS.len())
        ));
        let mut tx = self.begin().await?;
        sqlx::query(&statement)
            .bind(task.guid.as_str())
            .bind(task.domain.as_str())
            .bind(to_nanos(task.updated_at))
            .bind(to_nanos(task.created_at))
            .bind(0_i64)
            .bind(task.state.as_label())
            .bind("")
            .bind("")
            .bind(flag(false))
            .bind("")
            .bind(sealed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| exists_as(self.err(e), "task", guid))?;
        self.commit(tx).await?;

        tracing::debug!(task_guid = guid, domain, "task desired");
        Ok(task)
    }

    pub(super) async fn task_by_guid_tx(&self, guid: &str) -> Result<Task> {
        let statement = self.sql(&format!(
            "SELECT {} FROM tasks WHERE guid = ?",
            column_list(rows::TASK_COLUMNS, None)
        ));
        let row = sqlx::query(&statement)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.err(e))?
            .ok_or_else(|| Error::not_found("task", guid))?;
        rows::task(&row, &self.encoder)
    }

    pub(super) async fn tasks_tx(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        if let Some(domain) = &filter.domain {
            conditions.push("domain = ?");
            binds.push(domain.as_str());
        }
        if let Some(cell_id) = &filter.cell_id {
            conditions.push("cell_id = ?");
            binds.push(cell_id.as_str());
        }
        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let statement = self.sql(&format!(
            "SELECT {} FROM tasks{clause} ORDER BY guid",
            column_list(rows::TASK_COLUMNS, None)
        ));
        let mut query = sqlx::query(&statement);
        for value in binds {
            query = query.bind(value);
        }
        let found = query.fetch_all(&self.pool).await.map_err(|e| self.err(e))?;

        Ok(found
            .iter()
            .filter_map(|row| match rows::task(row, &self.encoder) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable task");
                    None
                }
            })
            .collect())
    }

    pub(super) async fn cancel_task_tx(&self, guid: &str) -> Result<Task> {
        self.mutate_task(guid, |task, now| {
            task.fail(CANCELLED_REASON, now)?;
            Ok(task.clone())
        })
        .await
    }

    pub(super) async fn fail_task_tx(&self, guid: &str, reason: &str) -> Result<Task> {
        self.mutate_task(guid, |task, now| {
            task.fail(reason, now)?;
            Ok(task.clone())
        })
        .await
    }

    pub(super) async fn complete_task_tx(
        &self,
        guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> Result<Task> {
        self.mutate_task(guid, |task, now| {
            task.complete(cell_id, failed, failure_reason, result, now)?;
            Ok(task.clone())
        })
        .await
    }

    pub(super) async fn resolving_task_tx(&self, guid: &str) -> Result<Task> {
        self.mutate_task(guid, |task, now| {
            task.resolve(now)?;
            Ok(task.clone())
        })
        .await
    }

    pub(super) async fn demote_to_completed_tx(&self, guid: &str) -> Result<Task> {
        self.mutate_task(guid, |task, now| {
            task.demote(now)?;
            Ok(task.clone())
        })
        .await
    }

    pub(super) async fn delete_task_tx(&self, guid: &str) -> Result<Task> {
        let mut tx = self.begin().await?;
        let task = self.locked_task(&mut tx, guid).await?;
        if task.state != TaskState::Resolving {
            return Err(Error::bad_request(format!(
                "task {guid} is {}, only resolving tasks can be deleted",
                task.state
            )));
        }
        let statement = self.sql("DELETE FROM tasks WHERE guid = ?");
        sqlx::query(&statement)
            .bind(guid)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        self.commit(tx).await?;
        tracing::debug!(task_guid = guid, "task deleted");
        Ok(task)
    }

    pub(super) async fn kick_task_tx(&self, guid: &str, seen_updated_at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.begin().await?;
        let mut task = self.locked_task(&mut tx, guid).await?;
        if task.updated_at != seen_updated_at {
            return Ok(false);
        }
        task.updated_at = self.now();
        self.write_task(&mut tx, &task).await?;
        self.commit(tx).await?;
        Ok(true)
    }
}
