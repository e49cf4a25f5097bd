//! Actual LRP instances as reported by cells.
//!
//! Each `(process_guid, index)` pair has up to two slots: the primary
//! instance and an evacuating instance that keeps serving while a cell
//! drains. The lifecycle rules below are shared by every store backend so
//! both enforce identical transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModificationTag;
use crate::error::{Error, Result};

/// Identity of one instance slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualLrpKey {
    /// Owning desired LRP.
    pub process_guid: String,
    /// Instance index, `0..instances`.
    pub index: u32,
    /// Freshness domain.
    pub domain: String,
}

impl ActualLrpKey {
    /// Creates a key.
    #[must_use]
    pub fn new(process_guid: impl Into<String>, index: u32, domain: impl Into<String>) -> Self {
        Self {
            process_guid: process_guid.into(),
            index,
            domain: domain.into(),
        }
    }
}

impl fmt::Display for ActualLrpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process_guid, self.index)
    }
}

/// The running incarnation of an instance, as placed on a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualLrpInstanceKey {
    /// Identifier of this incarnation.
    pub instance_guid: String,
    /// Cell hosting the incarnation.
    pub cell_id: String,
}

impl ActualLrpInstanceKey {
    /// Creates an instance key.
    #[must_use]
    pub fn new(instance_guid: impl Into<String>, cell_id: impl Into<String>) -> Self {
        Self {
            instance_guid: instance_guid.into(),
            cell_id: cell_id.into(),
        }
    }

    /// Returns true if no incarnation is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instance_guid.is_empty() && self.cell_id.is_empty()
    }
}

/// A container-to-host port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port inside the container.
    pub container_port: u32,
    /// Port on the host.
    pub host_port: u32,
}

/// Network location of a running instance.
///
/// Persisted as an encrypted blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualLrpNetInfo {
    /// Host address.
    pub address: String,
    /// Container address.
    #[serde(default)]
    pub instance_address: String,
    /// Port mappings.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    /// Creates net info with an address and port mappings.
    #[must_use]
    pub fn new(address: impl Into<String>, ports: Vec<PortMapping>) -> Self {
        Self {
            address: address.into(),
            instance_address: String::new(),
            ports,
        }
    }

    /// Returns true if nothing is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.instance_address.is_empty() && self.ports.is_empty()
    }
}

/// Lifecycle state of an actual LRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActualLrpState {
    /// Waiting for placement.
    Unclaimed,
    /// Placed on a cell, not yet running.
    Claimed,
    /// Running on a cell.
    Running,
    /// Exited unexpectedly.
    Crashed,
}

impl ActualLrpState {
    /// Returns the persisted label for this state.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for ActualLrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for ActualLrpState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNCLAIMED" => Ok(Self::Unclaimed),
            "CLAIMED" => Ok(Self::Claimed),
            "RUNNING" => Ok(Self::Running),
            "CRASHED" => Ok(Self::Crashed),
            other => Err(Error::invalid_record(format!(
                "unknown actual lrp state: {other}"
            ))),
        }
    }
}

/// One actual LRP slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualLrp {
    /// Slot identity.
    pub key: ActualLrpKey,
    /// Current incarnation; empty while unclaimed or crashed.
    pub instance_key: ActualLrpInstanceKey,
    /// Network location; empty unless running.
    pub net_info: ActualLrpNetInfo,
    /// Lifecycle state.
    pub state: ActualLrpState,
    /// Last placement failure, if any.
    pub placement_error: String,
    /// Time of the last state change.
    pub since: DateTime<Utc>,
    /// Number of crashes since the LRP was desired.
    pub crash_count: u32,
    /// Reason for the last crash.
    pub crash_reason: String,
    /// Concurrency tag.
    pub modification_tag: ModificationTag,
    /// Whether this is the evacuating slot.
    pub evacuating: bool,
    /// Deadline after which an evacuating slot is ignored.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ActualLrp {
    /// Creates an unclaimed primary instance.
    #[must_use]
    pub fn unclaimed(key: ActualLrpKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            instance_key: ActualLrpInstanceKey::default(),
            net_info: ActualLrpNetInfo::default(),
            state: ActualLrpState::Unclaimed,
            placement_error: String::new(),
            since: now,
            crash_count: 0,
            crash_reason: String::new(),
            modification_tag: ModificationTag::fresh(),
            evacuating: false,
            expires_at: None,
        }
    }

    /// Creates a running evacuating instance that expires at `expires_at`.
    #[must_use]
    pub fn evacuating(
        key: ActualLrpKey,
        instance_key: ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            instance_key,
            net_info,
            state: ActualLrpState::Running,
            placement_error: String::new(),
            since: now,
            crash_count: 0,
            crash_reason: String::new(),
            modification_tag: ModificationTag::fresh(),
            evacuating: true,
            expires_at: Some(expires_at),
        }
    }

    /// Returns true if this evacuating slot is past its deadline.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Applies a lifecycle update in place.
    ///
    /// Returns `Ok(false)` when the update is already reflected and nothing
    /// needs to be written. The modification tag is left to the caller.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] when the update names a different incarnation
    /// - [`Error::BadRequest`] when the state does not allow the transition
    pub fn apply(&mut self, update: &ActualLrpUpdate, now: DateTime<Utc>) -> Result<bool> {
        match update {
            ActualLrpUpdate::Claim { instance_key } => self.claim(instance_key, now),
            ActualLrpUpdate::Start {
                instance_key,
                net_info,
            } => self.start(instance_key, net_info, now),
            ActualLrpUpdate::Crash {
                instance_key,
                reason,
            } => self.crash(instance_key, reason, now),
            ActualLrpUpdate::FailPlacement { error } => self.fail_placement(error, now),
            ActualLrpUpdate::Unclaim => Ok(self.unclaim(now)),
            ActualLrpUpdate::RestartCrashed => self.restart_crashed(now),
            ActualLrpUpdate::Refresh => {
                self.since = now;
                Ok(true)
            }
        }
    }

    fn claim(&mut self, instance_key: &ActualLrpInstanceKey, now: DateTime<Utc>) -> Result<bool> {
        match self.state {
            ActualLrpState::Unclaimed => {}
            ActualLrpState::Claimed if &self.instance_key == instance_key => return Ok(false),
            ActualLrpState::Claimed | ActualLrpState::Running => {
                if &self.instance_key != instance_key {
                    return Err(self.incarnation_conflict(instance_key));
                }
            }
            ActualLrpState::Crashed => return Err(self.invalid_transition("claim")),
        }
        self.state = ActualLrpState::Claimed;
        self.instance_key = instance_key.clone();
        self.net_info = ActualLrpNetInfo::default();
        self.placement_error.clear();
        self.since = now;
        Ok(true)
    }

    fn start(
        &mut self,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.state {
            ActualLrpState::Unclaimed | ActualLrpState::Claimed => {}
            ActualLrpState::Running => {
                if &self.instance_key != instance_key {
                    return Err(self.incarnation_conflict(instance_key));
                }
                if &self.net_info == net_info {
                    return Ok(false);
                }
            }
            ActualLrpState::Crashed => return Err(self.invalid_transition("start")),
        }
        self.state = ActualLrpState::Running;
        self.instance_key = instance_key.clone();
        self.net_info = net_info.clone();
        self.placement_error.clear();
        self.since = now;
        Ok(true)
    }

    fn crash(
        &mut self,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.state {
            ActualLrpState::Claimed | ActualLrpState::Running => {
                if &self.instance_key != instance_key {
                    return Err(self.incarnation_conflict(instance_key));
                }
            }
            ActualLrpState::Unclaimed | ActualLrpState::Crashed => {
                return Err(self.invalid_transition("crash"));
            }
        }
        self.state = ActualLrpState::Crashed;
        self.instance_key = ActualLrpInstanceKey::default();
        self.net_info = ActualLrpNetInfo::default();
        self.crash_count = self.crash_count.saturating_add(1);
        self.crash_reason = reason.to_string();
        self.since = now;
        Ok(true)
    }

    fn fail_placement(&mut self, error: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.state != ActualLrpState::Unclaimed {
            return Err(self.invalid_transition("fail placement"));
        }
        if self.placement_error == error {
            return Ok(false);
        }
        self.placement_error = error.to_string();
        self.since = now;
        Ok(true)
    }

    fn unclaim(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == ActualLrpState::Unclaimed && self.instance_key.is_empty() {
            return false;
        }
        self.state = ActualLrpState::Unclaimed;
        self.instance_key = ActualLrpInstanceKey::default();
        self.net_info = ActualLrpNetInfo::default();
        self.since = now;
        true
    }

    fn restart_crashed(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.state != ActualLrpState::Crashed {
            return Err(self.invalid_transition("restart"));
        }
        self.state = ActualLrpState::Unclaimed;
        self.since = now;
        Ok(true)
    }

    fn incarnation_conflict(&self, presented: &ActualLrpInstanceKey) -> Error {
        Error::conflict(format!(
            "actual lrp {} is held by instance {} on cell {}, not {} on {}",
            self.key,
            self.instance_key.instance_guid,
            self.instance_key.cell_id,
            presented.instance_guid,
            presented.cell_id,
        ))
    }

    fn invalid_transition(&self, action: &str) -> Error {
        Error::bad_request(format!(
            "cannot {action} actual lrp {} in state {}",
            self.key, self.state
        ))
    }
}

/// A lifecycle update applied to one actual LRP slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActualLrpUpdate {
    /// A cell has accepted the instance.
    Claim {
        /// The incarnation claiming the slot.
        instance_key: ActualLrpInstanceKey,
    },
    /// The instance is running.
    Start {
        /// The running incarnation.
        instance_key: ActualLrpInstanceKey,
        /// Where it can be reached.
        net_info: ActualLrpNetInfo,
    },
    /// The instance exited.
    Crash {
        /// The incarnation that crashed.
        instance_key: ActualLrpInstanceKey,
        /// Why it crashed.
        reason: String,
    },
    /// Placement failed.
    FailPlacement {
        /// The placement error.
        error: String,
    },
    /// Return the slot to the unclaimed pool.
    Unclaim,
    /// Reset a crashed instance so it can be placed again.
    RestartCrashed,
    /// Touch `since` without changing state.
    Refresh,
}

/// Both slots for one `(process_guid, index)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualLrpGroup {
    /// The primary slot.
    pub instance: Option<ActualLrp>,
    /// The evacuating slot.
    pub evacuating: Option<ActualLrp>,
}

impl ActualLrpGroup {
    /// Returns true if both slots are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instance.is_none() && self.evacuating.is_none()
    }
}

/// Selection criteria for actual LRP reads and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualLrpFilter {
    /// Only instances in this domain.
    pub domain: Option<String>,
    /// Only instances on this cell.
    pub cell_id: Option<String>,
    /// Only instances of this process.
    pub process_guid: Option<String>,
    /// Only this index.
    pub index: Option<u32>,
    /// Only evacuating (`true`) or primary (`false`) slots.
    pub evacuating: Option<bool>,
}

impl ActualLrpFilter {
    /// Filter by cell.
    #[must_use]
    pub fn cell(cell_id: impl Into<String>) -> Self {
        Self {
            cell_id: Some(cell_id.into()),
            ..Self::default()
        }
    }

    /// Filter by process guid.
    #[must_use]
    pub fn process(process_guid: impl Into<String>) -> Self {
        Self {
            process_guid: Some(process_guid.into()),
            ..Self::default()
        }
    }

    /// Returns true if the record matches.
    #[must_use]
    pub fn matches(&self, lrp: &ActualLrp) -> bool {
        self.domain.as_deref().map_or(true, |d| d == lrp.key.domain)
            && self
                .cell_id
                .as_deref()
                .map_or(true, |c| c == lrp.instance_key.cell_id)
            && self
                .process_guid
                .as_deref()
                .map_or(true, |p| p == lrp.key.process_guid)
            && self.index.map_or(true, |i| i == lrp.key.index)
            && self.evacuating.map_or(true, |e| e == lrp.evacuating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn unclaimed() -> ActualLrp {
        ActualLrp::unclaimed(ActualLrpKey::new("web", 0, "apps"), Utc::now())
    }

    fn instance(cell: &str) -> ActualLrpInstanceKey {
        ActualLrpInstanceKey::new(format!("ig-{cell}"), cell)
    }

    fn net() -> ActualLrpNetInfo {
        ActualLrpNetInfo::new(
            "10.0.0.4",
            vec![PortMapping {
                container_port: 8080,
                host_port: 61000,
            }],
        )
    }

    #[test]
    fn claim_then_start_then_crash() {
        let mut lrp = unclaimed();
        let now = Utc::now();
        let ik = instance("cell-1");

        assert!(lrp
            .apply(&ActualLrpUpdate::Claim { instance_key: ik.clone() }, now)
            .unwrap());
        assert_eq!(lrp.state, ActualLrpState::Claimed);

        assert!(lrp
            .apply(
                &ActualLrpUpdate::Start {
                    instance_key: ik.clone(),
                    net_info: net(),
                },
                now,
            )
            .unwrap());
        assert_eq!(lrp.state, ActualLrpState::Running);

        assert!(lrp
            .apply(
                &ActualLrpUpdate::Crash {
                    instance_key: ik,
                    reason: "oom".into(),
                },
                now,
            )
            .unwrap());
        assert_eq!(lrp.state, ActualLrpState::Crashed);
        assert_eq!(lrp.crash_count, 1);
        assert!(lrp.instance_key.is_empty());
        assert!(lrp.net_info.is_empty());
    }

    #[test]
    fn repeated_claim_is_a_noop() {
        let mut lrp = unclaimed();
        let now = Utc::now();
        let claim = ActualLrpUpdate::Claim {
            instance_key: instance("cell-1"),
        };
        assert!(lrp.apply(&claim, now).unwrap());
        assert!(!lrp.apply(&claim, now).unwrap());
    }

    #[test]
    fn start_by_other_incarnation_conflicts() {
        let mut lrp = unclaimed();
        let now = Utc::now();
        lrp.apply(
            &ActualLrpUpdate::Start {
                instance_key: instance("cell-1"),
                net_info: net(),
            },
            now,
        )
        .unwrap();

        let err = lrp
            .apply(
                &ActualLrpUpdate::Start {
                    instance_key: instance("cell-2"),
                    net_info: net(),
                },
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn restart_requires_crashed() {
        let mut lrp = unclaimed();
        let err = lrp
            .apply(&ActualLrpUpdate::RestartCrashed, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn state_labels_round_trip() {
        for state in [
            ActualLrpState::Unclaimed,
            ActualLrpState::Claimed,
            ActualLrpState::Running,
            ActualLrpState::Crashed,
        ] {
            assert_eq!(state.as_label().parse::<ActualLrpState>().unwrap(), state);
        }
        assert!("EXPLODED".parse::<ActualLrpState>().is_err());
    }

    #[test]
    fn filter_by_cell_and_slot() {
        let mut lrp = unclaimed();
        lrp.instance_key = instance("cell-1");
        assert!(ActualLrpFilter::cell("cell-1").matches(&lrp));
        assert!(!ActualLrpFilter::cell("cell-2").matches(&lrp));

        let evacuating_only = ActualLrpFilter {
            evacuating: Some(true),
            ..ActualLrpFilter::default()
        };
        assert!(!evacuating_only.matches(&lrp));
    }
}
