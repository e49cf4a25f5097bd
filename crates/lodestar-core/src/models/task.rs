//! One-off tasks.
//!
//! ## State Machine
//!
//! ```text
//! PENDING ──start──> RUNNING ──complete/fail──> COMPLETED ──resolve──> RESOLVING ──delete──> (gone)
//!    │                                             ^   ^                    │
//!    └───────────────fail/cancel───────────────────┘   └─────demote─────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Failure reason recorded for cancelled tasks.
pub const CANCELLED_REASON: &str = "task was cancelled";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Waiting for placement.
    Pending,
    /// Executing on a cell.
    Running,
    /// Finished; result available.
    Completed,
    /// Completion callback in flight.
    Resolving,
}

impl TaskState {
    /// Returns true if `target` is a legal next state.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Running | Self::Completed)
                | (Self::Running, Self::Completed)
                | (Self::Completed, Self::Resolving)
                | (Self::Resolving, Self::Completed)
        )
    }

    /// Returns the persisted label for this state.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Resolving => "RESOLVING",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "RESOLVING" => Ok(Self::Resolving),
            other => Err(Error::invalid_record(format!("unknown task state: {other}"))),
        }
    }
}

/// What a task runs and where to report completion.
///
/// Persisted as an encrypted blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Action tree executed by the cell.
    #[serde(default)]
    pub action: serde_json::Value,
    /// Memory limit in megabytes.
    #[serde(default)]
    pub memory_mb: i32,
    /// Disk limit in megabytes.
    #[serde(default)]
    pub disk_mb: i32,
    /// Root filesystem URI.
    #[serde(default)]
    pub rootfs: String,
    /// File whose contents become the task result.
    #[serde(default)]
    pub result_file: String,
    /// URL that receives the completed task.
    #[serde(default)]
    pub completion_callback_url: Option<String>,
    /// Required cell placement tags.
    #[serde(default)]
    pub placement_tags: Vec<String>,
    /// Free-form annotation.
    #[serde(default)]
    pub annotation: String,
}

/// A task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub guid: String,
    /// Freshness domain.
    pub domain: String,
    /// Lifecycle state.
    pub state: TaskState,
    /// Cell the task runs on; empty while pending.
    pub cell_id: String,
    /// Output captured on completion.
    pub result: String,
    /// Whether the task failed.
    pub failed: bool,
    /// Why the task failed.
    pub failure_reason: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change or kick.
    pub updated_at: DateTime<Utc>,
    /// When the task first reached `Completed`.
    pub first_completed_at: Option<DateTime<Utc>>,
    /// Execution spec.
    pub definition: TaskDefinition,
}

impl Task {
    /// Creates a pending task.
    #[must_use]
    pub fn new(
        guid: impl Into<String>,
        domain: impl Into<String>,
        definition: TaskDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guid: guid.into(),
            domain: domain.into(),
            state: TaskState::Pending,
            cell_id: String::new(),
            result: String::new(),
            failed: false,
            failure_reason: String::new(),
            created_at: now,
            updated_at: now,
            first_completed_at: None,
            definition,
        }
    }

    /// Returns true if completion must be reported to a callback URL.
    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.definition
            .completion_callback_url
            .as_deref()
            .is_some_and(|url| !url.is_empty())
    }

    /// Moves a pending task onto a cell.
    ///
    /// Returns `Ok(false)` if it is already running on that cell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] from any other state.
    pub fn start(&mut self, cell_id: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.state == TaskState::Running && self.cell_id == cell_id {
            return Ok(false);
        }
        self.transition(TaskState::Running)?;
        self.cell_id = cell_id.to_string();
        self.updated_at = now;
        Ok(true)
    }

    /// Records a cell-reported completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] unless the task is running on `cell_id`.
    pub fn complete(
        &mut self,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.state == TaskState::Running && self.cell_id != cell_id {
            return Err(Error::bad_request(format!(
                "task {} is running on {}, not {cell_id}",
                self.guid, self.cell_id
            )));
        }
        if self.state != TaskState::Running {
            return Err(self.invalid_transition(TaskState::Completed));
        }
        self.finish(failed, failure_reason, result, now);
        Ok(())
    }

    /// Fails a pending or running task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] if the task has already completed.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskState::Completed)?;
        self.finish(true, reason, "", now);
        Ok(())
    }

    /// Marks a completed task as having its callback in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] unless the task is completed.
    pub fn resolve(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskState::Resolving)?;
        self.updated_at = now;
        Ok(())
    }

    /// Returns a resolving task to completed so its callback is retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] unless the task is resolving.
    pub fn demote(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != TaskState::Resolving {
            return Err(self.invalid_transition(TaskState::Completed));
        }
        self.state = TaskState::Completed;
        self.updated_at = now;
        Ok(())
    }

    fn finish(&mut self, failed: bool, failure_reason: &str, result: &str, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.failed = failed;
        self.failure_reason = failure_reason.to_string();
        self.result = result.to_string();
        self.updated_at = now;
        self.first_completed_at.get_or_insert(now);
    }

    fn transition(&mut self, target: TaskState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(self.invalid_transition(target));
        }
        self.state = target;
        Ok(())
    }

    fn invalid_transition(&self, target: TaskState) -> Error {
        Error::bad_request(format!(
            "invalid task state transition for {}: {} -> {target}",
            self.guid, self.state
        ))
    }
}

/// Selection criteria for task reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks in this domain.
    pub domain: Option<String>,
    /// Only tasks on this cell.
    pub cell_id: Option<String>,
}

impl TaskFilter {
    /// Returns true if the task matches.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.domain.as_deref().map_or(true, |d| d == task.domain)
            && self.cell_id.as_deref().map_or(true, |c| c == task.cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn pending() -> Task {
        Task::new("t-1", "tasks", TaskDefinition::default(), Utc::now())
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Pending.can_transition_to(TaskState::Completed));
        assert!(TaskState::Completed.can_transition_to(TaskState::Resolving));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Running));
        assert!(!TaskState::Running.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn start_is_idempotent_on_same_cell() {
        let mut task = pending();
        assert!(task.start("cell-1", Utc::now()).unwrap());
        assert!(!task.start("cell-1", Utc::now()).unwrap());
        let err = task.start("cell-2", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn complete_requires_owning_cell() {
        let mut task = pending();
        task.start("cell-1", Utc::now()).unwrap();
        assert!(task.complete("cell-2", false, "", "ok", Utc::now()).is_err());

        task.complete("cell-1", false, "", "ok", Utc::now()).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, "ok");
        assert!(task.first_completed_at.is_some());
    }

    #[test]
    fn resolve_and_demote() {
        let mut task = pending();
        task.fail("no capacity", Utc::now()).unwrap();
        assert!(task.failed);

        task.resolve(Utc::now()).unwrap();
        assert_eq!(task.state, TaskState::Resolving);
        assert!(task.resolve(Utc::now()).is_err());

        task.demote(Utc::now()).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn callback_requires_non_empty_url() {
        let mut task = pending();
        assert!(!task.has_callback());
        task.definition.completion_callback_url = Some(String::new());
        assert!(!task.has_callback());
        task.definition.completion_callback_url = Some("http://cc/tasks".into());
        assert!(task.has_callback());
    }
}
