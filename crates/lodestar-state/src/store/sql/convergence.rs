//! Convergence scans.
//!
//! Every scan of one pass runs in a single transaction so the pass works
//! from a consistent view.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::AnyConnection;

use lodestar_core::models::{ActualLrp, ActualLrpState, DesiredLrpSchedulingInfo};

use super::rows::{self, column_list, placeholders, to_nanos};
use super::{SqlStore, count};
use crate::Result;
use crate::store::{
    ConvergenceSnapshot, LrpConvergenceSnapshot, LrpCounts, MissingInstances, ScheduledActual,
    TaskConvergenceSnapshot, missing_indices,
};

/// Desired LRPs short of instances, with the indices they already have.
struct Shortfall {
    process_guid: String,
    instances: u32,
    existing: Vec<u32>,
}

impl SqlStore {
    fn decode_actuals(&self, found: &[AnyRow], scan: &'static str) -> Vec<ActualLrp> {
        found
            .iter()
            .filter_map(|row| match rows::actual_lrp(row, &self.encoder) {
                Ok(lrp) => Some(lrp),
                Err(e) => {
                    tracing::warn!(scan, error = %e, "skipping undecodable actual lrp");
                    None
                }
            })
            .collect()
    }

    async fn shortfalls(&self, conn: &mut AnyConnection) -> Result<Vec<Shortfall>> {
        let statement = self.sql(&format!(
            "SELECT d.process_guid AS process_guid, d.instances AS instances, {} AS existing_indices \
             FROM desired_lrps d \
             LEFT JOIN actual_lrps a ON a.process_guid = d.process_guid \
             AND a.evacuating = 0 AND a.instance_index < d.instances \
             GROUP BY d.process_guid, d.instances \
             HAVING COUNT(a.instance_index) < d.instances",
            self.dialect.aggregate_indices("a.instance_index")
        ));
        let found = sqlx::query(&statement)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;

        found
            .iter()
            .map(|row| {
                let existing: Option<String> = sqlx::Row::try_get(row, "existing_indices")
                    .map_err(|e| lodestar_core::Error::invalid_record(e.to_string()))?;
                Ok(Shortfall {
                    process_guid: rows::text(row, "process_guid")?,
                    instances: rows::u32_col(row, "instances")?,
                    existing: rows::parse_indices(existing.as_deref())?,
                })
            })
            .collect()
    }

    async fn scheduling_infos_for(
        &self,
        conn: &mut AnyConnection,
        process_guids: &HashSet<String>,
    ) -> Result<HashMap<String, DesiredLrpSchedulingInfo>> {
        if process_guids.is_empty() {
            return Ok(HashMap::new());
        }
        let statement = self.sql(&format!(
            "SELECT {} FROM desired_lrps WHERE process_guid IN ({})",
            column_list(rows::SCHEDULING_INFO_COLUMNS, None),
            placeholders(process_guids.len())
        ));
        let mut query = sqlx::query(&statement);
        for guid in process_guids {
            query = query.bind(guid.as_str());
        }
        let found = query.fetch_all(&mut *conn).await.map_err(|e| self.err(e))?;

        let mut infos = HashMap::with_capacity(found.len());
        for row in &found {
            match rows::scheduling_info(row, &self.encoder) {
                Ok(info) => {
                    infos.insert(info.key.process_guid.clone(), info);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable scheduling info");
                }
            }
        }
        Ok(infos)
    }

    /// Primary instances with an in-range index of some desired LRP that
    /// also satisfy `condition`.
    async fn scheduled_actuals(
        &self,
        conn: &mut AnyConnection,
        condition: &str,
        texts: &[&str],
        ints: &[i64],
        scan: &'static str,
    ) -> Result<Vec<ActualLrp>> {
        let statement = self.sql(&format!(
            "SELECT {} FROM actual_lrps a \
             JOIN desired_lrps d ON a.process_guid = d.process_guid \
             WHERE a.evacuating = 0 AND a.instance_index < d.instances AND {condition}",
            column_list(rows::ACTUAL_LRP_COLUMNS, Some("a"))
        ));
        let mut query = sqlx::query(&statement);
        for value in texts {
            query = query.bind(*value);
        }
        for value in ints {
            query = query.bind(*value);
        }
        let found = query.fetch_all(&mut *conn).await.map_err(|e| self.err(e))?;
        Ok(self.decode_actuals(&found, scan))
    }

    async fn extra_actuals(&self, conn: &mut AnyConnection, now: DateTime<Utc>) -> Result<Vec<ActualLrp>> {
        let statement = self.sql(&format!(
            "SELECT {} FROM actual_lrps a \
             JOIN domains dm ON a.domain = dm.domain \
             LEFT JOIN desired_lrps d ON a.process_guid = d.process_guid \
             WHERE a.evacuating = 0 AND dm.expire_time > ? \
             AND (d.process_guid IS NULL OR a.instance_index >= d.instances)",
            column_list(rows::ACTUAL_LRP_COLUMNS, Some("a"))
        ));
        let found = sqlx::query(&statement)
            .bind(to_nanos(now))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(self.decode_actuals(&found, "extra"))
    }

    async fn expired_evacuating(&self, conn: &mut AnyConnection, now: DateTime<Utc>) -> Result<Vec<ActualLrp>> {
        let statement = self.sql(&format!(
            "SELECT {} FROM actual_lrps WHERE evacuating = 1 AND expire_time > 0 AND expire_time <= ?",
            column_list(rows::ACTUAL_LRP_COLUMNS, None)
        ));
        let found = sqlx::query(&statement)
            .bind(to_nanos(now))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(self.decode_actuals(&found, "expired_evacuating"))
    }

    async fn lrp_counts(&self, conn: &mut AnyConnection) -> Result<LrpCounts> {
        let states = [
            ActualLrpState::Unclaimed,
            ActualLrpState::Claimed,
            ActualLrpState::Running,
            ActualLrpState::Crashed,
        ];
        let selects = states
            .iter()
            .map(|state| {
                format!(
                    "{} AS {}",
                    self.dialect
                        .count_where(&format!("state = '{}'", state.as_label())),
                    state.as_label().to_lowercase()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!("SELECT {selects} FROM actual_lrps WHERE evacuating = 0");
        let row = sqlx::query(&statement)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;

        let mut counts = LrpCounts {
            unclaimed: count(&row, "unclaimed")?,
            claimed: count(&row, "claimed")?,
            running: count(&row, "running")?,
            crashed: count(&row, "crashed")?,
            ..LrpCounts::default()
        };

        let desired = sqlx::query("SELECT instances FROM desired_lrps")
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        for row in &desired {
            counts.desired_instances += u64::from(rows::u32_col(row, "instances")?);
        }
        Ok(counts)
    }

    pub(super) async fn lrp_convergence_snapshot_tx(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<LrpConvergenceSnapshot> {
        let mut tx = self.begin().await?;
        let snapshot = self.lrp_scan(&mut tx, live_cells, stale_before).await?;
        self.commit(tx).await?;
        Ok(snapshot)
    }

    pub(super) async fn task_convergence_snapshot_tx(&self) -> Result<TaskConvergenceSnapshot> {
        let mut tx = self.begin().await?;
        let snapshot = self.task_scan(&mut tx).await?;
        self.commit(tx).await?;
        Ok(snapshot)
    }

    /// Reads both halves in one transaction, so no task or LRP write lands
    /// between them.
    pub(super) async fn convergence_snapshot_tx(
        &self,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<ConvergenceSnapshot> {
        let mut tx = self.begin().await?;
        let lrps = self.lrp_scan(&mut tx, live_cells, stale_before).await?;
        let tasks = self.task_scan(&mut tx).await?;
        self.commit(tx).await?;
        Ok(ConvergenceSnapshot { lrps, tasks })
    }

    async fn lrp_scan(
        &self,
        conn: &mut AnyConnection,
        live_cells: &HashSet<String>,
        stale_before: DateTime<Utc>,
    ) -> Result<LrpConvergenceSnapshot> {
        let now = self.now();
        let shortfalls = self.shortfalls(conn).await?;
        let extra = self.extra_actuals(conn, now).await?;

        let cells: Vec<&str> = live_cells.iter().map(String::as_str).collect();
        let cell_condition = if cells.is_empty() {
            "a.cell_id <> ''".to_string()
        } else {
            format!(
                "a.cell_id <> '' AND a.cell_id NOT IN ({})",
                placeholders(cells.len())
            )
        };
        let on_missing_cells = self
            .scheduled_actuals(conn, &cell_condition, &cells, &[], "missing_cells")
            .await?;
        let crashed = self
            .scheduled_actuals(
                conn,
                "a.state = ?",
                &[ActualLrpState::Crashed.as_label()],
                &[],
                "crashed",
            )
            .await?;
        let stale_unclaimed = self
            .scheduled_actuals(
                conn,
                "a.state = ? AND a.since < ?",
                &[ActualLrpState::Unclaimed.as_label()],
                &[to_nanos(stale_before)],
                "stale_unclaimed",
            )
            .await?;
        let expired_evacuating = self.expired_evacuating(conn, now).await?;
        let counts = self.lrp_counts(conn).await?;

        let needed: HashSet<String> = shortfalls
            .iter()
            .map(|s| s.process_guid.clone())
            .chain(
                on_missing_cells
                    .iter()
                    .chain(&crashed)
                    .chain(&stale_unclaimed)
                    .map(|lrp| lrp.key.process_guid.clone()),
            )
            .collect();
        let infos = self.scheduling_infos_for(conn, &needed).await?;

        let missing = shortfalls
            .into_iter()
            .filter_map(|shortfall| {
                let existing: HashSet<u32> = shortfall.existing.into_iter().collect();
                let indices = missing_indices(shortfall.instances, &existing);
                infos.get(&shortfall.process_guid).map(|info| MissingInstances {
                    scheduling_info: info.clone(),
                    missing_indices: indices,
                })
            })
            .filter(|m| !m.missing_indices.is_empty())
            .collect();

        let attach = |lrps: Vec<ActualLrp>| -> Vec<ScheduledActual> {
            lrps.into_iter()
                .filter_map(|actual| {
                    infos
                        .get(&actual.key.process_guid)
                        .map(|info| ScheduledActual {
                            scheduling_info: info.clone(),
                            actual,
                        })
                })
                .collect()
        };

        Ok(LrpConvergenceSnapshot {
            missing,
            extra,
            on_missing_cells: attach(on_missing_cells),
            crashed: attach(crashed),
            stale_unclaimed: attach(stale_unclaimed),
            expired_evacuating,
            counts,
        })
    }

    async fn task_scan(&self, conn: &mut AnyConnection) -> Result<TaskConvergenceSnapshot> {
        let statement = format!(
            "SELECT {} FROM tasks ORDER BY guid",
            column_list(rows::TASK_COLUMNS, None)
        );
        let found = sqlx::query(&statement)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        let tasks = found
            .iter()
            .filter_map(|row| match rows::task(row, &self.encoder) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable task");
                    None
                }
            })
            .collect();
        Ok(TaskConvergenceSnapshot::from_tasks(tasks))
    }
}
