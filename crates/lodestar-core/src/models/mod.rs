//! Data model shared by the store, the convergence engine and the hubs.

mod actual_lrp;
mod desired_lrp;
mod modification_tag;
mod task;

pub use actual_lrp::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpNetInfo, ActualLrpState, ActualLrpUpdate, PortMapping,
};
pub use desired_lrp::{
    DesiredLrp, DesiredLrpBuilder, DesiredLrpChange, DesiredLrpFilter, DesiredLrpKey,
    DesiredLrpRunInfo, DesiredLrpSchedulingInfo, DesiredLrpUpdate, EnvVar, Resources, Routes,
    VolumePlacement,
};
pub use modification_tag::ModificationTag;
pub use task::{Task, TaskDefinition, TaskFilter, TaskState, CANCELLED_REASON};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A freshness marker for a domain.
///
/// While fresh, convergence trusts that the domain's owner is keeping its
/// desired state current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    /// Domain name.
    pub name: String,
    /// When freshness lapses.
    pub expires_at: DateTime<Utc>,
}

impl Domain {
    /// Returns true if the marker has not lapsed.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A live cell as reported by the presence collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellPresence {
    /// Unique cell identifier.
    pub cell_id: String,
    /// Address of the cell agent.
    pub rep_address: String,
    /// Availability zone.
    pub zone: String,
    /// Total capacity advertised by the cell.
    pub capacity: CellCapacity,
    /// Root filesystems the cell can run.
    pub rootfs_providers: Vec<String>,
    /// Volume drivers the cell offers.
    pub volume_drivers: Vec<String>,
}

impl CellPresence {
    /// Creates a presence record with only an id and address.
    #[must_use]
    pub fn new(cell_id: impl Into<String>, rep_address: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            rep_address: rep_address.into(),
            ..Self::default()
        }
    }
}

/// Resource capacity of a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellCapacity {
    /// Memory in megabytes.
    pub memory_mb: i32,
    /// Disk in megabytes.
    pub disk_mb: i32,
    /// Maximum containers.
    pub containers: i32,
}
