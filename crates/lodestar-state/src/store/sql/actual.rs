//! Actual LRP operations.

use sqlx::AnyConnection;

use lodestar_core::Error;
use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpUpdate, ModificationTag,
};

use super::rows::{self, column_list, flag, placeholders, seal, to_nanos};
use super::{SqlStore, exists_as};
use crate::Result;
use crate::store::ActualLrpChange;

impl SqlStore {
    /// Seals net info, keeping an empty value as an empty column.
    fn seal_net_info(&self, lrp: &ActualLrp) -> Result<String> {
        if lrp.net_info.is_empty() {
            Ok(String::new())
        } else {
            seal(&self.encoder, &lrp.net_info)
        }
    }

    pub(super) async fn insert_actual(&self, conn: &mut AnyConnection, lrp: &ActualLrp) -> Result<()> {
        let net_info = self.seal_net_info(lrp)?;
        let statement = self.sql(&format!(
            "INSERT INTO actual_lrps ({}) VALUES ({})",
            column_list(rows::ACTUAL_LRP_COLUMNS, None),
            placeholders(rows::ACTUAL_LRP_COLUMNS.len())
        ));
        sqlx::query(&statement)
            .bind(lrp.key.process_guid.as_str())
            .bind(i64::from(lrp.key.index))
            .bind(flag(lrp.evacuating))
            .bind(lrp.key.domain.as_str())
            .bind(lrp.state.as_label())
            .bind(lrp.instance_key.instance_guid.as_str())
            .bind(lrp.instance_key.cell_id.as_str())
            .bind(lrp.placement_error.as_str())
            .bind(to_nanos(lrp.since))
            .bind(net_info.as_str())
            .bind(lrp.modification_tag.epoch.as_str())
            .bind(i64::from(lrp.modification_tag.index))
            .bind(i64::from(lrp.crash_count))
            .bind(lrp.crash_reason.as_str())
            .bind(lrp.expires_at.map_or(0, to_nanos))
            .execute(&mut *conn)
            .await
            .map_err(|e| exists_as(self.err(e), "actual_lrp", &lrp.key))?;
        Ok(())
    }

    /// Rewrites every mutable column of an existing slot.
    pub(super) async fn write_actual(&self, conn: &mut AnyConnection, lrp: &ActualLrp) -> Result<()> {
        let net_info = self.seal_net_info(lrp)?;
        let statement = self.sql(
            "UPDATE actual_lrps SET domain = ?, state = ?, instance_guid = ?, cell_id = ?, \
             placement_error = ?, since = ?, net_info = ?, modification_tag_epoch = ?, \
             modification_tag_index = ?, crash_count = ?, crash_reason = ?, expire_time = ? \
             WHERE process_guid = ? AND instance_index = ? AND evacuating = ?",
        );
        sqlx::query(&statement)
            .bind(lrp.key.domain.as_str())
            .bind(lrp.state.as_label())
            .bind(lrp.instance_key.instance_guid.as_str())
            .bind(lrp.instance_key.cell_id.as_str())
            .bind(lrp.placement_error.as_str())
            .bind(to_nanos(lrp.since))
            .bind(net_info.as_str())
            .bind(lrp.modification_tag.epoch.as_str())
            .bind(i64::from(lrp.modification_tag.index))
            .bind(i64::from(lrp.crash_count))
            .bind(lrp.crash_reason.as_str())
            .bind(lrp.expires_at.map_or(0, to_nanos))
            .bind(lrp.key.process_guid.as_str())
            .bind(i64::from(lrp.key.index))
            .bind(flag(lrp.evacuating))
            .execute(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub(super) async fn delete_actual(&self, conn: &mut AnyConnection, lrp: &ActualLrp) -> Result<()> {
        let statement = self.sql(
            "DELETE FROM actual_lrps WHERE process_guid = ? AND instance_index = ? AND evacuating = ?",
        );
        sqlx::query(&statement)
            .bind(lrp.key.process_guid.as_str())
            .bind(i64::from(lrp.key.index))
            .bind(flag(lrp.evacuating))
            .execute(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    /// Reads and locks one slot.
    pub(super) async fn locked_actual(
        &self,
        conn: &mut AnyConnection,
        process_guid: &str,
        index: u32,
        evacuating: bool,
    ) -> Result<Option<ActualLrp>> {
        let statement = self.sql(&format!(
            "SELECT {} FROM actual_lrps WHERE process_guid = ? AND instance_index = ? AND evacuating = ?{}",
            column_list(rows::ACTUAL_LRP_COLUMNS, None),
            self.dialect.for_update()
        ));
        let row = sqlx::query(&statement)
            .bind(process_guid)
            .bind(i64::from(index))
            .bind(flag(evacuating))
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.err(e))?;
        row.map(|row| rows::actual_lrp(&row, &self.encoder)).transpose()
    }

    pub(super) async fn actual_lrps_tx(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrp>> {
        let mut conditions = Vec::new();
        let mut texts = Vec::new();
        if let Some(domain) = &filter.domain {
            conditions.push("domain = ?");
            texts.push(domain.as_str());
        }
        if let Some(cell_id) = &filter.cell_id {
            conditions.push("cell_id = ?");
            texts.push(cell_id.as_str());
        }
        if let Some(process_guid) = &filter.process_guid {
            conditions.push("process_guid = ?");
            texts.push(process_guid.as_str());
        }
        let mut ints = Vec::new();
        if let Some(index) = filter.index {
            conditions.push("instance_index = ?");
            ints.push(i64::from(index));
        }
        if let Some(evacuating) = filter.evacuating {
            conditions.push("evacuating = ?");
            ints.push(flag(evacuating));
        }
        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let statement = self.sql(&format!(
            "SELECT {} FROM actual_lrps{clause} ORDER BY process_guid, instance_index, evacuating",
            column_list(rows::ACTUAL_LRP_COLUMNS, None)
        ));
        // Text conditions precede integer conditions in the clause.
        let mut query = sqlx::query(&statement);
        for value in texts {
            query = query.bind(value);
        }
        for value in ints {
            query = query.bind(value);
        }
        let found = query.fetch_all(&self.pool).await.map_err(|e| self.err(e))?;

        Ok(found
            .iter()
            .filter_map(|row| match rows::actual_lrp(row, &self.encoder) {
                Ok(lrp) => Some(lrp),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable actual lrp");
                    None
                }
            })
            .collect())
    }

    pub(super) async fn actual_lrp_group_tx(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<ActualLrpGroup> {
        let filter = ActualLrpFilter {
            process_guid: Some(process_guid.to_string()),
            index: Some(index),
            ..ActualLrpFilter::default()
        };
        let mut group = ActualLrpGroup::default();
        for lrp in self.actual_lrps_tx(&filter).await? {
            if lrp.evacuating {
                group.evacuating = Some(lrp);
            } else {
                group.instance = Some(lrp);
            }
        }
        if group.is_empty() {
            return Err(Error::not_found(
                "actual_lrp",
                format!("{process_guid}/{index}"),
            ));
        }
        Ok(group)
    }

    pub(super) async fn create_unclaimed_actual_lrp_tx(&self, key: &ActualLrpKey) -> Result<ActualLrp> {
        let lrp = ActualLrp::unclaimed(key.clone(), self.now());
        let mut tx = self.begin().await?;
        self.insert_actual(&mut tx, &lrp).await?;
        self.commit(tx).await?;
        tracing::debug!(lrp = %key, "unclaimed actual lrp created");
        Ok(lrp)
    }

    pub(super) async fn update_actual_lrp_tx(
        &self,
        process_guid: &str,
        index: u32,
        evacuating: bool,
        expected: Option<&ModificationTag>,
        update: &ActualLrpUpdate,
    ) -> Result<ActualLrpChange> {
        let mut tx = self.begin().await?;
        let before = self
            .locked_actual(&mut tx, process_guid, index, evacuating)
            .await?
            .ok_or_else(|| Error::not_found("actual_lrp", format!("{process_guid}/{index}")))?;
        before.modification_tag.check(expected)?;

        let mut after = before.clone();
        if !after.apply(update, self.now())? {
            return Ok(ActualLrpChange {
                before,
                after,
            });
        }
        after.modification_tag.increment();
        self.write_actual(&mut tx, &after).await?;
        self.commit(tx).await?;

        tracing::debug!(
            lrp = %after.key,
            from = %before.state,
            to = %after.state,
            tag = %after.modification_tag,
            "actual lrp updated"
        );
        Ok(ActualLrpChange { before, after })
    }

    pub(super) async fn remove_actual_lrp_tx(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
        expected: Option<&ModificationTag>,
    ) -> Result<ActualLrp> {
        let mut tx = self.begin().await?;
        let existing = self
            .locked_actual(&mut tx, process_guid, index, false)
            .await?
            .ok_or_else(|| Error::not_found("actual_lrp", format!("{process_guid}/{index}")))?;
        if let Some(instance_key) = instance_key {
            if *instance_key != existing.instance_key {
                return Err(Error::cannot_be_removed(format!(
                    "{} is held by instance {}",
                    existing.key, existing.instance_key.instance_guid
                )));
            }
        }
        existing.modification_tag.check(expected)?;
        self.delete_actual(&mut tx, &existing).await?;
        self.commit(tx).await?;
        tracing::debug!(lrp = %existing.key, "actual lrp removed");
        Ok(existing)
    }
}
