//! LRP half of a convergence cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use lodestar_core::models::{ActualLrp, ActualLrpKey, ActualLrpUpdate, DesiredLrpSchedulingInfo};

use super::{ConvergenceReport, CrashDecision, CrashRestartPolicy, CycleContext, Skipped};
use crate::Result;
use crate::auction::{LrpStartRequest, LrpStop};
use crate::hub::ActualLrpEvent;
use crate::store::{LrpConvergenceSnapshot, ScheduledActual};

/// Start and stop work gathered from one cycle.
#[derive(Debug, Default)]
pub(super) struct LrpWork {
    pub starts: Vec<LrpStartRequest>,
    pub stops: Vec<LrpStop>,
}

/// One corrective step planned from the snapshot.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    CreateMissing {
        info: DesiredLrpSchedulingInfo,
        index: u32,
    },
    StopExtra(ActualLrp),
    ReplaceOnMissingCell(ScheduledActual),
    RestartCrashed(ScheduledActual),
    RefreshStale(ScheduledActual),
    RemoveEvacuating(ActualLrp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Created,
    Stopped,
    Restarted,
    Refreshed,
    EvacuatingRemoved,
}

#[derive(Default)]
struct Applied {
    tally: Option<Tally>,
    start: Option<(DesiredLrpSchedulingInfo, u32)>,
    stop: Option<LrpStop>,
    skipped: Option<Skipped>,
}

impl Applied {
    fn skipped(skipped: Skipped) -> Self {
        Self {
            skipped: Some(skipped),
            ..Self::default()
        }
    }
}

pub(super) async fn converge(
    ctx: &CycleContext<'_>,
    snapshot: LrpConvergenceSnapshot,
    now: DateTime<Utc>,
    report: &mut ConvergenceReport,
) -> Result<LrpWork> {
    report.lrp_counts = snapshot.counts;

    let actions = plan(snapshot, &ctx.config.crash_policy, now, report);
    tracing::debug!(actions = actions.len(), "planned lrp convergence");

    let mut starts: BTreeMap<String, LrpStartRequest> = BTreeMap::new();
    let mut stops = Vec::new();

    let mut applied = futures::stream::iter(actions)
        .map(|action| apply(ctx, action))
        .buffer_unordered(ctx.config.workers.max(1));
    while let Some(outcome) = applied.next().await {
        let outcome = outcome?;
        if let Some(skipped) = &outcome.skipped {
            report.record_skip(skipped);
        }
        match outcome.tally {
            Some(Tally::Created) | None => {}
            Some(Tally::Stopped) => report.lrp_stops += 1,
            Some(Tally::Restarted) => report.crashed_restarted += 1,
            Some(Tally::Refreshed) => report.stale_refreshed += 1,
            Some(Tally::EvacuatingRemoved) => report.evacuating_removed += 1,
        }
        if let Some(stop) = outcome.stop {
            stops.push(stop);
        }
        if let Some((info, index)) = outcome.start {
            report.lrp_starts += 1;
            starts
                .entry(info.key.process_guid.clone())
                .or_insert_with(|| LrpStartRequest::new(info, Vec::new()))
                .indices
                .push(index);
        }
    }

    let mut starts: Vec<LrpStartRequest> = starts.into_values().collect();
    for request in &mut starts {
        request.indices.sort_unstable();
    }
    Ok(LrpWork { starts, stops })
}

/// Turns a snapshot into corrective actions.
///
/// Crashed instances that must wait or have run out of restarts produce no
/// action; exhausted ones are counted on `report`.
fn plan(
    snapshot: LrpConvergenceSnapshot,
    policy: &CrashRestartPolicy,
    now: DateTime<Utc>,
    report: &mut ConvergenceReport,
) -> Vec<Action> {
    let mut actions = Vec::new();

    for missing in snapshot.missing {
        for index in missing.missing_indices {
            actions.push(Action::CreateMissing {
                info: missing.scheduling_info.clone(),
                index,
            });
        }
    }

    actions.extend(snapshot.extra.into_iter().map(Action::StopExtra));
    actions.extend(
        snapshot
            .on_missing_cells
            .into_iter()
            .map(Action::ReplaceOnMissingCell),
    );

    for crashed in snapshot.crashed {
        let actual = &crashed.actual;
        match policy.decide(actual.crash_count, actual.since, now) {
            CrashDecision::Restart => actions.push(Action::RestartCrashed(crashed)),
            CrashDecision::WaitUntil(at) => {
                tracing::trace!(lrp = %actual.key, restart_at = %at, "crashed instance backing off");
            }
            CrashDecision::GiveUp => {
                report.crashed_exhausted += 1;
                tracing::debug!(
                    lrp = %actual.key,
                    crash_count = actual.crash_count,
                    "crashed instance exhausted its restarts"
                );
            }
        }
    }

    actions.extend(snapshot.stale_unclaimed.into_iter().map(Action::RefreshStale));
    actions.extend(
        snapshot
            .expired_evacuating
            .into_iter()
            .map(Action::RemoveEvacuating),
    );
    actions
}

async fn apply(ctx: &CycleContext<'_>, action: Action) -> Result<Applied> {
    ctx.ensure_leader()?;
    let store = ctx.store;
    let actual_hub = ctx.hubs.actual();
    match action {
        Action::CreateMissing { info, index } => {
            let key = ActualLrpKey::new(&info.key.process_guid, index, &info.key.domain);
            match store.create_unclaimed_actual_lrp(&key).await {
                Ok(created) => {
                    actual_hub.publish(&ActualLrpEvent::Created(created));
                    Ok(Applied {
                        tally: Some(Tally::Created),
                        start: Some((info, index)),
                        ..Applied::default()
                    })
                }
                Err(e) => ctx
                    .skip("create_missing", &key.to_string(), e)
                    .map(Applied::skipped),
            }
        }

        Action::StopExtra(actual) => {
            let instance_key =
                (!actual.instance_key.is_empty()).then_some(&actual.instance_key);
            match store
                .remove_actual_lrp(
                    &actual.key.process_guid,
                    actual.key.index,
                    instance_key,
                    Some(&actual.modification_tag),
                )
                .await
            {
                Ok(removed) => {
                    tracing::info!(lrp = %removed.key, "removed extra actual lrp");
                    let stop = stop_for(&removed);
                    actual_hub.publish(&ActualLrpEvent::Removed(removed));
                    Ok(Applied {
                        tally: Some(Tally::Stopped),
                        stop,
                        ..Applied::default()
                    })
                }
                Err(e) => ctx
                    .skip("stop_extra", &actual.key.to_string(), e)
                    .map(Applied::skipped),
            }
        }

        Action::ReplaceOnMissingCell(ScheduledActual {
            actual,
            scheduling_info,
        }) => {
            let removed = match store
                .remove_actual_lrp(
                    &actual.key.process_guid,
                    actual.key.index,
                    Some(&actual.instance_key),
                    Some(&actual.modification_tag),
                )
                .await
            {
                Ok(removed) => removed,
                Err(e) => {
                    return ctx
                        .skip("replace_on_missing_cell", &actual.key.to_string(), e)
                        .map(Applied::skipped);
                }
            };
            tracing::info!(
                lrp = %removed.key,
                cell_id = %removed.instance_key.cell_id,
                "removed actual lrp from missing cell"
            );
            actual_hub.publish(&ActualLrpEvent::Removed(removed.clone()));

            let mut applied = Applied {
                tally: Some(Tally::Stopped),
                stop: stop_for(&removed),
                ..Applied::default()
            };
            ctx.ensure_leader()?;
            match store.create_unclaimed_actual_lrp(&removed.key).await {
                Ok(created) => {
                    actual_hub.publish(&ActualLrpEvent::Created(created));
                    applied.start = Some((scheduling_info, removed.key.index));
                }
                Err(e) => {
                    applied.skipped =
                        Some(ctx.skip("replace_on_missing_cell", &removed.key.to_string(), e)?);
                }
            }
            Ok(applied)
        }

        Action::RestartCrashed(scheduled) => {
            update_then_start(ctx, scheduled, ActualLrpUpdate::RestartCrashed, Tally::Restarted)
                .await
        }

        Action::RefreshStale(scheduled) => {
            update_then_start(ctx, scheduled, ActualLrpUpdate::Refresh, Tally::Refreshed).await
        }

        Action::RemoveEvacuating(actual) => {
            match store
                .remove_evacuating_actual_lrp(&actual.key, &actual.instance_key)
                .await
            {
                Ok(Some(removed)) => {
                    tracing::info!(lrp = %removed.key, "removed expired evacuating actual lrp");
                    actual_hub.publish(&ActualLrpEvent::Removed(removed));
                    Ok(Applied {
                        tally: Some(Tally::EvacuatingRemoved),
                        ..Applied::default()
                    })
                }
                Ok(None) => Ok(Applied::default()),
                Err(e) => ctx
                    .skip("remove_evacuating", &actual.key.to_string(), e)
                    .map(Applied::skipped),
            }
        }
    }
}

async fn update_then_start(
    ctx: &CycleContext<'_>,
    scheduled: ScheduledActual,
    update: ActualLrpUpdate,
    tally: Tally,
) -> Result<Applied> {
    let ScheduledActual {
        actual,
        scheduling_info,
    } = scheduled;
    match ctx
        .store
        .update_actual_lrp(
            &actual.key.process_guid,
            actual.key.index,
            false,
            Some(&actual.modification_tag),
            &update,
        )
        .await
    {
        Ok(change) => {
            if change.changed() {
                ctx.hubs.actual().publish(&ActualLrpEvent::Changed {
                    before: change.before,
                    after: change.after,
                });
            }
            Ok(Applied {
                tally: Some(tally),
                start: Some((scheduling_info, actual.key.index)),
                ..Applied::default()
            })
        }
        Err(e) => {
            let operation = match tally {
                Tally::Restarted => "restart_crashed",
                _ => "refresh_stale",
            };
            ctx.skip(operation, &actual.key.to_string(), e)
                .map(Applied::skipped)
        }
    }
}

fn stop_for(removed: &ActualLrp) -> Option<LrpStop> {
    (!removed.instance_key.is_empty()).then(|| LrpStop {
        key: removed.key.clone(),
        instance_key: removed.instance_key.clone(),
    })
}
