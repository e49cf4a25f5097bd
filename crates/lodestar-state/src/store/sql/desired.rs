//! Desired LRP operations.

use sqlx::AnyConnection;

use lodestar_core::Error;
use lodestar_core::models::{
    DesiredLrp, DesiredLrpChange, DesiredLrpFilter, DesiredLrpSchedulingInfo, DesiredLrpUpdate,
    ModificationTag,
};

use super::rows::{self, column_list, placeholders, seal};
use super::{SqlStore, exists_as};
use crate::Result;

const INSERT_COLUMNS: &[&str] = &[
    "process_guid",
    "domain",
    "log_guid",
    "annotation",
    "instances",
    "memory_mb",
    "disk_mb",
    "max_pids",
    "rootfs",
    "routes",
    "volume_placement",
    "placement_tags",
    "modification_tag_epoch",
    "modification_tag_index",
    "run_info",
];

/// Builds a `WHERE` clause and its binds for a desired LRP filter.
fn filter_clause(filter: &DesiredLrpFilter) -> (String, Vec<&str>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    if let Some(domain) = &filter.domain {
        conditions.push("domain = ?".to_string());
        binds.push(domain.as_str());
    }
    if !filter.process_guids.is_empty() {
        conditions.push(format!(
            "process_guid IN ({})",
            placeholders(filter.process_guids.len())
        ));
        binds.extend(filter.process_guids.iter().map(String::as_str));
    }
    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), binds)
    }
}

impl SqlStore {
    pub(super) async fn desire_lrp_tx(&self, lrp: &DesiredLrp) -> Result<DesiredLrp> {
        if lrp.process_guid.is_empty() {
            return Err(Error::bad_request("process guid is required"));
        }
        let mut stored = lrp.clone();
        stored.modification_tag = ModificationTag::fresh();

        let routes = seal(&self.encoder, &stored.routes)?;
        let volume_placement = seal(&self.encoder, &stored.volume_placement)?;
        let run_info = seal(&self.encoder, &stored.run_info)?;
        let placement_tags = serde_json::to_string(&stored.placement_tags)?;

        let statement = self.sql(&format!(
            "INSERT INTO desired_lrps ({}) VALUES ({})",
            INSERT_COLUMNS.join(", "),
            placeholders(INSERT_COLUMNS.len())
        ));

        let mut tx = self.begin().await?;
        sqlx::query(&statement)
            .bind(stored.process_guid.as_str())
            .bind(stored.domain.as_str())
            .bind(stored.log_guid.as_str())
            .bind(stored.annotation.as_str())
            .bind(i64::from(stored.instances))
            .bind(i64::from(stored.resources.memory_mb))
            .bind(i64::from(stored.resources.disk_mb))
            .bind(i64::from(stored.resources.max_pids))
            .bind(stored.resources.rootfs.as_str())
            .bind(routes.as_str())
            .bind(volume_placement.as_str())
            .bind(placement_tags.as_str())
            .bind(stored.modification_tag.epoch.as_str())
            .bind(i64::from(stored.modification_tag.index))
            .bind(run_info.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| exists_as(self.err(e), "desired_lrp", &stored.process_guid))?;
        self.commit(tx).await?;

        tracing::debug!(process_guid = %stored.process_guid, instances = stored.instances, "desired lrp created");
        Ok(stored)
    }

    async fn locked_desired_lrp(
        &self,
        conn: &mut AnyConnection,
        process_guid: &str,
    ) -> Result<DesiredLrp> {
        let statement = self.sql(&format!(
            "SELECT {}, run_info FROM desired_lrps WHERE process_guid = ?{}",
            column_list(rows::SCHEDULING_INFO_COLUMNS, None),
            self.dialect.for_update()
        ));
        let row = sqlx::query(&statement)
            .bind(process_guid)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.err(e))?
            .ok_or_else(|| Error::not_found("desired_lrp", process_guid))?;
        rows::desired_lrp(&row, &self.encoder)
    }

    pub(super) async fn desired_lrp_by_process_guid_tx(
        &self,
        process_guid: &str,
    ) -> Result<DesiredLrp> {
        let statement = self.sql(&format!(
            "SELECT {}, run_info FROM desired_lrps WHERE process_guid = ?",
            column_list(rows::SCHEDULING_INFO_COLUMNS, None)
        ));
        let row = sqlx::query(&statement)
            .bind(process_guid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.err(e))?
            .ok_or_else(|| Error::not_found("desired_lrp", process_guid))?;
        rows::desired_lrp(&row, &self.encoder)
    }

    pub(super) async fn desired_lrps_tx(&self, filter: &DesiredLrpFilter) -> Result<Vec<DesiredLrp>> {
        let (clause, binds) = filter_clause(filter);
        let statement = self.sql(&format!(
            "SELECT {}, run_info FROM desired_lrps{clause} ORDER BY process_guid",
            column_list(rows::SCHEDULING_INFO_COLUMNS, None)
        ));
        let mut query = sqlx::query(&statement);
        for value in binds {
            query = query.bind(value);
        }
        let found = query.fetch_all(&self.pool).await.map_err(|e| self.err(e))?;

        Ok(found
            .iter()
            .filter_map(|row| match rows::desired_lrp(row, &self.encoder) {
                Ok(lrp) => Some(lrp),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable desired lrp");
                    None
                }
            })
            .collect())
    }

    pub(super) async fn scheduling_infos_tx(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>> {
        let (clause, binds) = filter_clause(filter);
        let statement = self.sql(&format!(
            "SELECT {} FROM desired_lrps{clause} ORDER BY process_guid",
            column_list(rows::SCHEDULING_INFO_COLUMNS, None)
        ));
        let mut query = sqlx::query(&statement);
        for value in binds {
            query = query.bind(value);
        }
        let found = query.fetch_all(&self.pool).await.map_err(|e| self.err(e))?;

        Ok(found
            .iter()
            .filter_map(|row| match rows::scheduling_info(row, &self.encoder) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable scheduling info");
                    None
                }
            })
            .collect())
    }

    pub(super) async fn update_desired_lrp_tx(
        &self,
        process_guid: &str,
        expected: Option<&ModificationTag>,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpChange> {
        let mut tx = self.begin().await?;
        let before = self.locked_desired_lrp(&mut tx, process_guid).await?;
        before.modification_tag.check(expected)?;

        let mut after = before.clone();
        after.apply(update);
        after.modification_tag = before.modification_tag.incremented();

        let routes = seal(&self.encoder, &after.routes)?;
        let statement = self.sql(
            "UPDATE desired_lrps SET instances = ?, routes = ?, annotation = ?, \
             modification_tag_index = ? WHERE process_guid = ?",
        );
        sqlx::query(&statement)
            .bind(i64::from(after.instances))
            .bind(routes.as_str())
            .bind(after.annotation.as_str())
            .bind(i64::from(after.modification_tag.index))
            .bind(process_guid)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        self.commit(tx).await?;

        tracing::debug!(
            process_guid,
            instances = after.instances,
            tag = %after.modification_tag,
            "desired lrp updated"
        );
        Ok(DesiredLrpChange { before, after })
    }

    pub(super) async fn remove_desired_lrp_tx(&self, process_guid: &str) -> Result<DesiredLrp> {
        let mut tx = self.begin().await?;
        let removed = self.locked_desired_lrp(&mut tx, process_guid).await?;
        let statement = self.sql("DELETE FROM desired_lrps WHERE process_guid = ?");
        sqlx::query(&statement)
            .bind(process_guid)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        self.commit(tx).await?;
        tracing::debug!(process_guid, "desired lrp removed");
        Ok(removed)
    }
}
