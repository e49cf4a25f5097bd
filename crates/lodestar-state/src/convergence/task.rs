//! Task half of a convergence cycle.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use lodestar_core::clock::before;
use lodestar_core::Error;
use lodestar_core::models::{Task, TaskState};

use super::{ConvergenceConfig, ConvergenceReport, CycleContext, Skipped};
use crate::Result;
use crate::hub::TaskEvent;
use crate::store::TaskConvergenceSnapshot;

/// Failure reason for a pending task nobody placed in time.
pub const EXPIRED_PENDING_REASON: &str = "not started within time limit";

/// Failure reason for a running task whose cell disappeared.
pub const MISSING_CELL_REASON: &str = "cell disappeared before completion";

/// Dispatch and callback work gathered from one cycle.
#[derive(Debug, Default)]
pub(super) struct TaskWork {
    pub dispatch: Vec<Task>,
    pub callbacks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    FailExpiredPending(Task),
    Redispatch(Task),
    FailOnMissingCell(Task),
    DeleteCompleted(Task),
    Resolve(Task),
    DeleteResolving(Task),
    Demote(Task),
}

enum Applied {
    Dispatched(Task),
    Failed,
    Deleted,
    Resolving(Task),
    Demoted,
    Unchanged,
    Skipped(Skipped),
}

/// Cutoffs for one cycle, all measured back from the same instant.
struct Cutoffs {
    kick: DateTime<Utc>,
    expire_pending: DateTime<Utc>,
    expire_completed: DateTime<Utc>,
}

impl Cutoffs {
    fn new(config: &ConvergenceConfig, now: DateTime<Utc>) -> Self {
        Self {
            kick: before(now, config.kick_task_duration),
            expire_pending: before(now, config.expire_pending_task_duration),
            expire_completed: before(now, config.expire_completed_task_duration),
        }
    }
}

pub(super) async fn converge(
    ctx: &CycleContext<'_>,
    snapshot: TaskConvergenceSnapshot,
    live_cells: &HashSet<String>,
    now: DateTime<Utc>,
    callbacks_enabled: bool,
    report: &mut ConvergenceReport,
) -> Result<TaskWork> {
    report.task_counts = snapshot.counts;

    let cutoffs = Cutoffs::new(ctx.config, now);
    let actions: Vec<Action> = snapshot
        .tasks
        .into_iter()
        .filter_map(|task| plan(task, &cutoffs, live_cells, callbacks_enabled))
        .collect();
    tracing::debug!(actions = actions.len(), "planned task convergence");

    let mut work = TaskWork::default();
    let mut applied = futures::stream::iter(actions)
        .map(|action| apply(ctx, action))
        .buffer_unordered(ctx.config.workers.max(1));
    while let Some(outcome) = applied.next().await {
        match outcome? {
            Applied::Dispatched(task) => {
                report.tasks_dispatched += 1;
                work.dispatch.push(task);
            }
            Applied::Failed => report.tasks_failed += 1,
            Applied::Deleted => report.tasks_deleted += 1,
            Applied::Resolving(task) => {
                report.tasks_resolving += 1;
                work.callbacks.push(task);
            }
            Applied::Demoted => report.tasks_demoted += 1,
            Applied::Unchanged => {}
            Applied::Skipped(skipped) => report.record_skip(&skipped),
        }
    }

    work.dispatch.sort_by(|a, b| a.guid.cmp(&b.guid));
    Ok(work)
}

/// Decides what, if anything, to do with one task.
///
/// Pending expiry is measured from creation and completed expiry from the
/// first completion, because re-dispatch and demotion both touch
/// `updated_at`.
fn plan(
    task: Task,
    cutoffs: &Cutoffs,
    live_cells: &HashSet<String>,
    callbacks_enabled: bool,
) -> Option<Action> {
    match task.state {
        TaskState::Pending => {
            if task.created_at <= cutoffs.expire_pending {
                Some(Action::FailExpiredPending(task))
            } else if task.updated_at <= cutoffs.kick {
                Some(Action::Redispatch(task))
            } else {
                None
            }
        }
        TaskState::Running => {
            (!live_cells.contains(&task.cell_id)).then_some(Action::FailOnMissingCell(task))
        }
        TaskState::Completed => {
            let completed_at = task.first_completed_at.unwrap_or(task.updated_at);
            if completed_at <= cutoffs.expire_completed {
                Some(Action::DeleteCompleted(task))
            } else if callbacks_enabled && task.has_callback() && task.updated_at <= cutoffs.kick {
                Some(Action::Resolve(task))
            } else {
                None
            }
        }
        TaskState::Resolving => {
            let completed_at = task.first_completed_at.unwrap_or(task.updated_at);
            if completed_at <= cutoffs.expire_completed {
                Some(Action::DeleteResolving(task))
            } else if task.updated_at <= cutoffs.kick {
                Some(Action::Demote(task))
            } else {
                None
            }
        }
    }
}

async fn apply(ctx: &CycleContext<'_>, action: Action) -> Result<Applied> {
    ctx.ensure_leader()?;
    let store = ctx.store;
    let (operation, guid, result) = match action {
        Action::FailExpiredPending(task) => {
            tracing::info!(task_guid = %task.guid, "failing expired pending task");
            let result = store
                .fail_task(&task.guid, EXPIRED_PENDING_REASON)
                .await
                .map(|failed| {
                    publish_change(ctx, &task, failed);
                    Applied::Failed
                });
            ("fail_expired_pending", task.guid, result)
        }
        Action::Redispatch(task) => {
            let result = match store.kick_task(&task.guid, task.updated_at).await {
                Ok(true) => {
                    // The kick only touches the timestamp; subscribers still
                    // see the record move.
                    match store.task_by_guid(&task.guid).await {
                        Ok(kicked) => publish_change(ctx, &task, kicked),
                        Err(e) => {
                            tracing::debug!(task_guid = %task.guid, error = %e, "kicked task vanished");
                        }
                    }
                    Ok(Applied::Dispatched(task.clone()))
                }
                Ok(false) => Ok(Applied::Unchanged),
                Err(e) => Err(e),
            };
            ("redispatch", task.guid, result)
        }
        Action::FailOnMissingCell(task) => {
            tracing::info!(
                task_guid = %task.guid,
                cell_id = %task.cell_id,
                "failing task on missing cell"
            );
            let result = store
                .fail_task(&task.guid, MISSING_CELL_REASON)
                .await
                .map(|failed| {
                    publish_change(ctx, &task, failed);
                    Applied::Failed
                });
            ("fail_on_missing_cell", task.guid, result)
        }
        Action::DeleteCompleted(task) => {
            // Only resolving tasks can be deleted.
            let result = match store.resolving_task(&task.guid).await {
                Ok(resolving) => {
                    publish_change(ctx, &task, resolving);
                    ctx.ensure_leader()?;
                    store.delete_task(&task.guid).await.map(|deleted| {
                        ctx.hubs.tasks().publish(&TaskEvent::Removed(deleted));
                        Applied::Deleted
                    })
                }
                Err(e) => Err(e),
            };
            ("delete_completed", task.guid, result)
        }
        Action::Resolve(task) => {
            let result = store.resolving_task(&task.guid).await.map(|resolving| {
                publish_change(ctx, &task, resolving.clone());
                Applied::Resolving(resolving)
            });
            ("resolve", task.guid, result)
        }
        Action::DeleteResolving(task) => {
            let result = store.delete_task(&task.guid).await.map(|deleted| {
                ctx.hubs.tasks().publish(&TaskEvent::Removed(deleted));
                Applied::Deleted
            });
            ("delete_resolving", task.guid, result)
        }
        Action::Demote(task) => {
            let result = store.demote_to_completed(&task.guid).await.map(|demoted| {
                publish_change(ctx, &task, demoted);
                Applied::Demoted
            });
            ("demote", task.guid, result)
        }
    };

    match result {
        Ok(applied) => Ok(applied),
        // A task that changed state since the snapshot was moved by someone
        // else; the next cycle sees its new state.
        Err(Error::BadRequest { message }) => {
            tracing::debug!(operation, task_guid = %guid, error = %message, "task moved on, skipping");
            Ok(Applied::Skipped(Skipped::Conflict))
        }
        Err(e) => ctx.skip(operation, &guid, e).map(Applied::Skipped),
    }
}

fn publish_change(ctx: &CycleContext<'_>, before: &Task, after: Task) {
    ctx.hubs.tasks().publish(&TaskEvent::Changed {
        before: before.clone(),
        after,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use lodestar_core::models::TaskDefinition;

    fn cutoffs(now: DateTime<Utc>) -> Cutoffs {
        Cutoffs::new(&ConvergenceConfig::default(), now)
    }

    fn task(state: TaskState, created_at: DateTime<Utc>) -> Task {
        let mut task = Task::new("t-1", "tasks", TaskDefinition::default(), created_at);
        task.state = state;
        task
    }

    fn cells() -> HashSet<String> {
        ["cell-1".to_string()].into_iter().collect()
    }

    #[test]
    fn fresh_pending_task_is_left_alone() {
        let now = Utc::now();
        assert_eq!(
            plan(task(TaskState::Pending, now), &cutoffs(now), &cells(), true),
            None
        );
    }

    #[test]
    fn pending_task_is_kicked_then_expired() {
        let now = Utc::now();
        let kicked = task(TaskState::Pending, now - chrono::Duration::seconds(31));
        assert!(matches!(
            plan(kicked, &cutoffs(now), &cells(), true),
            Some(Action::Redispatch(_))
        ));

        let mut expired = task(TaskState::Pending, now - chrono::Duration::minutes(31));
        expired.updated_at = now;
        assert!(matches!(
            plan(expired, &cutoffs(now), &cells(), true),
            Some(Action::FailExpiredPending(_))
        ));
    }

    #[test]
    fn running_task_fails_only_on_a_missing_cell() {
        let now = Utc::now();
        let mut running = task(TaskState::Running, now);
        running.cell_id = "cell-1".to_string();
        assert_eq!(plan(running.clone(), &cutoffs(now), &cells(), true), None);

        running.cell_id = "cell-gone".to_string();
        assert!(matches!(
            plan(running, &cutoffs(now), &cells(), true),
            Some(Action::FailOnMissingCell(_))
        ));
    }

    #[test]
    fn completed_task_with_callback_is_resolved_after_kick() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(45);
        let mut completed = task(TaskState::Completed, earlier);
        completed.first_completed_at = Some(earlier);
        completed.definition.completion_callback_url = Some("http://cb".to_string());

        assert!(matches!(
            plan(completed.clone(), &cutoffs(now), &cells(), true),
            Some(Action::Resolve(_))
        ));
        assert_eq!(plan(completed, &cutoffs(now), &cells(), false), None);
    }

    #[test]
    fn completion_age_drives_deletion() {
        let now = Utc::now();
        let long_ago = now - chrono::Duration::seconds(180);
        let mut resolving = task(TaskState::Resolving, long_ago);
        resolving.first_completed_at = Some(long_ago);
        resolving.updated_at = now;
        assert!(matches!(
            plan(resolving.clone(), &cutoffs(now), &cells(), true),
            Some(Action::DeleteResolving(_))
        ));

        resolving.first_completed_at = Some(now - chrono::Duration::seconds(40));
        resolving.updated_at = now - chrono::Duration::seconds(40);
        assert!(matches!(
            plan(resolving, &cutoffs(now), &cells(), true),
            Some(Action::Demote(_))
        ));
    }
}
