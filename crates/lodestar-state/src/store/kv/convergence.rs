//! Convergence scans computed over listed records.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use lodestar_core::models::{ActualLrp, ActualLrpState, DesiredLrp, DesiredLrpSchedulingInfo};

use crate::store::{
    LrpConvergenceSnapshot, LrpCounts, MissingInstances, ScheduledActual, missing_indices,
};

/// Classifies every record the way the SQL scans do.
pub(super) fn lrp_snapshot(
    desired: &[DesiredLrp],
    actuals: Vec<ActualLrp>,
    fresh_domains: &HashSet<String>,
    live_cells: &HashSet<String>,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> LrpConvergenceSnapshot {
    let infos: BTreeMap<&str, DesiredLrpSchedulingInfo> = desired
        .iter()
        .map(|lrp| (lrp.process_guid.as_str(), lrp.scheduling_info()))
        .collect();

    let mut snapshot = LrpConvergenceSnapshot {
        counts: LrpCounts {
            desired_instances: desired.iter().map(|lrp| u64::from(lrp.instances)).sum(),
            ..LrpCounts::default()
        },
        ..LrpConvergenceSnapshot::default()
    };
    let mut existing: HashMap<String, HashSet<u32>> = HashMap::new();

    for actual in actuals {
        if actual.evacuating {
            if actual.is_expired(now) {
                snapshot.expired_evacuating.push(actual);
            }
            continue;
        }
        snapshot.counts.record(actual.state);

        let Some(info) = infos
            .get(actual.key.process_guid.as_str())
            .filter(|info| actual.key.index < info.instances)
        else {
            if fresh_domains.contains(&actual.key.domain) {
                snapshot.extra.push(actual);
            }
            continue;
        };

        existing
            .entry(actual.key.process_guid.clone())
            .or_default()
            .insert(actual.key.index);

        let cell_id = &actual.instance_key.cell_id;
        let on_missing_cell = !cell_id.is_empty() && !live_cells.contains(cell_id);
        let crashed = actual.state == ActualLrpState::Crashed;
        let stale =
            actual.state == ActualLrpState::Unclaimed && actual.since < stale_before;
        if !(on_missing_cell || crashed || stale) {
            continue;
        }
        let scheduled = ScheduledActual {
            actual,
            scheduling_info: info.clone(),
        };
        if on_missing_cell {
            snapshot.on_missing_cells.push(scheduled);
        } else if crashed {
            snapshot.crashed.push(scheduled);
        } else {
            snapshot.stale_unclaimed.push(scheduled);
        }
    }

    let empty = HashSet::new();
    for (process_guid, info) in infos {
        let indices = missing_indices(
            info.instances,
            existing.get(process_guid).unwrap_or(&empty),
        );
        if !indices.is_empty() {
            snapshot.missing.push(MissingInstances {
                scheduling_info: info,
                missing_indices: indices,
            });
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::models::{ActualLrpInstanceKey, ActualLrpKey};

    fn running(guid: &str, index: u32, cell: &str, now: DateTime<Utc>) -> ActualLrp {
        let mut lrp = ActualLrp::unclaimed(ActualLrpKey::new(guid, index, "apps"), now);
        lrp.state = ActualLrpState::Running;
        lrp.instance_key = ActualLrpInstanceKey::new(format!("ig-{index}"), cell);
        lrp
    }

    #[test]
    fn classifies_missing_extra_and_lost_cells() {
        let now = Utc::now();
        let desired = vec![DesiredLrp::builder("web", "apps").instances(3).build()];
        let actuals = vec![
            running("web", 0, "cell-1", now),
            running("web", 1, "cell-9", now),
            running("web", 5, "cell-1", now),
            running("gone", 0, "cell-1", now),
        ];
        let fresh: HashSet<String> = ["apps".to_string()].into_iter().collect();
        let cells: HashSet<String> = ["cell-1".to_string()].into_iter().collect();

        let snapshot = lrp_snapshot(&desired, actuals, &fresh, &cells, now, now);

        assert_eq!(snapshot.missing.len(), 1);
        assert_eq!(snapshot.missing[0].missing_indices, vec![2]);
        assert_eq!(snapshot.extra.len(), 2);
        assert_eq!(snapshot.on_missing_cells.len(), 1);
        assert_eq!(snapshot.on_missing_cells[0].actual.key.index, 1);
        assert_eq!(snapshot.counts.running, 4);
        assert_eq!(snapshot.counts.desired_instances, 3);
    }

    #[test]
    fn orphans_in_stale_domains_are_left_alone() {
        let now = Utc::now();
        let actuals = vec![running("gone", 0, "cell-1", now)];
        let cells: HashSet<String> = ["cell-1".to_string()].into_iter().collect();

        let snapshot = lrp_snapshot(&[], actuals, &HashSet::new(), &cells, now, now);

        assert!(snapshot.extra.is_empty());
    }
}
