//! Evacuating slot operations.

use std::time::Duration;

use lodestar_core::Error;
use lodestar_core::clock::after;
use lodestar_core::models::{ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo};

use super::SqlStore;
use crate::Result;
use crate::store::EvacuationOutcome;

impl SqlStore {
    pub(super) async fn evacuate_actual_lrp_tx(
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
        let now = self.now();
        let expires_at = after(now, ttl);

        let mut tx = self.begin().await?;
        let existing = self
            .locked_actual(&mut tx, &key.process_guid, key.index, true)
            .await?;

        let outcome = match existing {
            Some(existing)
                if !existing.is_expired(now)
                    && existing.key == *key
                    && existing.instance_key == *instance_key
                    && existing.net_info == *net_info =>
            {
                return Ok(EvacuationOutcome::Unchanged(existing));
            }
            Some(existing) if !existing.is_expired(now) => {
                let mut replaced = existing.clone();
                replaced.key = key.clone();
                replaced.instance_key = instance_key.clone();
                replaced.net_info = net_info.clone();
                replaced.since = now;
                replaced.expires_at = Some(expires_at);
                replaced.modification_tag.increment();
                self.write_actual(&mut tx, &replaced).await?;
                EvacuationOutcome::Updated {
                    before: existing,
                    after: replaced,
                }
            }
            expired => {
                if let Some(expired) = &expired {
                    self.delete_actual(&mut tx, expired).await?;
                }
                let created = ActualLrp::evacuating(
                    key.clone(),
                    instance_key.clone(),
                    net_info.clone(),
                    now,
                    expires_at,
                );
                self.insert_actual(&mut tx, &created).await?;
                EvacuationOutcome::Created(created)
            }
        };
        self.commit(tx).await?;

        tracing::info!(
            lrp = %key,
            instance_guid = %instance_key.instance_guid,
            expires_at = %expires_at,
            "evacuating slot written"
        );
        Ok(outcome)
    }

    pub(super) async fn remove_evacuating_actual_lrp_tx(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<Option<ActualLrp>> {
        let now = self.now();
        let mut tx = self.begin().await?;
        let Some(existing) = self
            .locked_actual(&mut tx, &key.process_guid, key.index, true)
            .await?
        else {
            return Ok(None);
        };
        if !existing.is_expired(now) && existing.instance_key != *instance_key {
            return Err(Error::cannot_be_removed(format!(
                "evacuating {} is held by instance {}",
                existing.key, existing.instance_key.instance_guid
            )));
        }
        self.delete_actual(&mut tx, &existing).await?;
        self.commit(tx).await?;
        tracing::debug!(lrp = %existing.key, "evacuating slot removed");
        Ok(Some(existing))
    }
}
