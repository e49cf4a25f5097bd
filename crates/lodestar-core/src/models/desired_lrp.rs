//! Desired long-running processes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModificationTag;

/// Opaque routing table keyed by router name.
pub type Routes = BTreeMap<String, serde_json::Value>;

/// Identity of a desired LRP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLrpKey {
    /// Unique, immutable process identifier.
    pub process_guid: String,
    /// Freshness domain the process belongs to.
    pub domain: String,
    /// Log stream identifier.
    pub log_guid: String,
}

/// Resource envelope requested per instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Memory limit in megabytes.
    pub memory_mb: i32,
    /// Disk limit in megabytes.
    pub disk_mb: i32,
    /// Process count limit; zero means unlimited.
    pub max_pids: i32,
    /// Root filesystem URI.
    pub rootfs: String,
}

/// Volume driver constraints used during placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePlacement {
    /// Drivers a cell must offer.
    pub driver_names: Vec<String>,
}

/// An environment variable passed to the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Immutable execution spec of a desired LRP.
///
/// Persisted as an encrypted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLrpRunInfo {
    /// When the LRP was first desired.
    pub created_at: DateTime<Utc>,
    /// Action tree executed by the cell.
    #[serde(default)]
    pub action: serde_json::Value,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Container ports to expose.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// How long the cell waits for the first healthy check.
    #[serde(default)]
    pub start_timeout_ms: u64,
    /// Whether the container runs privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Network egress rules.
    #[serde(default)]
    pub egress_rules: Vec<serde_json::Value>,
    /// Volume mounts.
    #[serde(default)]
    pub volume_mounts: Vec<serde_json::Value>,
    /// Metrics correlation id.
    #[serde(default)]
    pub metrics_guid: String,
}

impl DesiredLrpRunInfo {
    /// Creates an empty run info stamped with `created_at`.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            action: serde_json::Value::Null,
            env: Vec::new(),
            ports: Vec::new(),
            start_timeout_ms: 0,
            privileged: false,
            egress_rules: Vec::new(),
            volume_mounts: Vec::new(),
            metrics_guid: String::new(),
        }
    }
}

/// The placement-relevant half of a desired LRP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLrpSchedulingInfo {
    /// Identity.
    pub key: DesiredLrpKey,
    /// Number of instances that should run.
    pub instances: u32,
    /// Free-form annotation.
    pub annotation: String,
    /// Per-instance resources.
    pub resources: Resources,
    /// Opaque route table.
    pub routes: Routes,
    /// Required cell placement tags.
    pub placement_tags: Vec<String>,
    /// Required volume drivers.
    pub volume_placement: VolumePlacement,
    /// Concurrency tag.
    pub modification_tag: ModificationTag,
}

/// A full desired LRP: scheduling info plus run info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLrp {
    /// Unique, immutable process identifier.
    pub process_guid: String,
    /// Freshness domain.
    pub domain: String,
    /// Log stream identifier.
    pub log_guid: String,
    /// Number of instances that should run.
    pub instances: u32,
    /// Free-form annotation.
    pub annotation: String,
    /// Per-instance resources.
    pub resources: Resources,
    /// Opaque route table.
    pub routes: Routes,
    /// Required cell placement tags.
    pub placement_tags: Vec<String>,
    /// Required volume drivers.
    pub volume_placement: VolumePlacement,
    /// Concurrency tag.
    pub modification_tag: ModificationTag,
    /// Immutable execution spec.
    pub run_info: DesiredLrpRunInfo,
}

impl DesiredLrp {
    /// Starts building a desired LRP.
    #[must_use]
    pub fn builder(process_guid: impl Into<String>, domain: impl Into<String>) -> DesiredLrpBuilder {
        DesiredLrpBuilder::new(process_guid, domain)
    }

    /// Returns the identity of this LRP.
    #[must_use]
    pub fn key(&self) -> DesiredLrpKey {
        DesiredLrpKey {
            process_guid: self.process_guid.clone(),
            domain: self.domain.clone(),
            log_guid: self.log_guid.clone(),
        }
    }

    /// Returns the scheduling half of this LRP.
    #[must_use]
    pub fn scheduling_info(&self) -> DesiredLrpSchedulingInfo {
        DesiredLrpSchedulingInfo {
            key: self.key(),
            instances: self.instances,
            annotation: self.annotation.clone(),
            resources: self.resources.clone(),
            routes: self.routes.clone(),
            placement_tags: self.placement_tags.clone(),
            volume_placement: self.volume_placement.clone(),
            modification_tag: self.modification_tag.clone(),
        }
    }

    /// Reassembles a desired LRP from its two halves.
    #[must_use]
    pub fn from_parts(info: DesiredLrpSchedulingInfo, run_info: DesiredLrpRunInfo) -> Self {
        Self {
            process_guid: info.key.process_guid,
            domain: info.key.domain,
            log_guid: info.key.log_guid,
            instances: info.instances,
            annotation: info.annotation,
            resources: info.resources,
            routes: info.routes,
            placement_tags: info.placement_tags,
            volume_placement: info.volume_placement,
            modification_tag: info.modification_tag,
            run_info,
        }
    }

    /// Applies an update in place.
    ///
    /// Returns true if any field changed. The modification tag is left to the
    /// caller.
    pub fn apply(&mut self, update: &DesiredLrpUpdate) -> bool {
        let mut changed = false;
        if let Some(instances) = update.instances {
            changed |= self.instances != instances;
            self.instances = instances;
        }
        if let Some(routes) = &update.routes {
            changed |= &self.routes != routes;
            self.routes.clone_from(routes);
        }
        if let Some(annotation) = &update.annotation {
            changed |= &self.annotation != annotation;
            self.annotation.clone_from(annotation);
        }
        changed
    }
}

/// Builder for [`DesiredLrp`].
#[derive(Debug, Clone)]
pub struct DesiredLrpBuilder {
    lrp: DesiredLrp,
}

impl DesiredLrpBuilder {
    fn new(process_guid: impl Into<String>, domain: impl Into<String>) -> Self {
        let process_guid = process_guid.into();
        Self {
            lrp: DesiredLrp {
                log_guid: process_guid.clone(),
                process_guid,
                domain: domain.into(),
                instances: 1,
                annotation: String::new(),
                resources: Resources::default(),
                routes: Routes::new(),
                placement_tags: Vec::new(),
                volume_placement: VolumePlacement::default(),
                modification_tag: ModificationTag::fresh(),
                run_info: DesiredLrpRunInfo::new(Utc::now()),
            },
        }
    }

    /// Sets the instance count.
    #[must_use]
    pub fn instances(mut self, instances: u32) -> Self {
        self.lrp.instances = instances;
        self
    }

    /// Sets the log guid.
    #[must_use]
    pub fn log_guid(mut self, log_guid: impl Into<String>) -> Self {
        self.lrp.log_guid = log_guid.into();
        self
    }

    /// Sets the annotation.
    #[must_use]
    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.lrp.annotation = annotation.into();
        self
    }

    /// Sets the resources.
    #[must_use]
    pub fn resources(mut self, resources: Resources) -> Self {
        self.lrp.resources = resources;
        self
    }

    /// Adds a route entry.
    #[must_use]
    pub fn route(mut self, router: impl Into<String>, value: serde_json::Value) -> Self {
        self.lrp.routes.insert(router.into(), value);
        self
    }

    /// Sets placement tags.
    #[must_use]
    pub fn placement_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.lrp.placement_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the run info.
    #[must_use]
    pub fn run_info(mut self, run_info: DesiredLrpRunInfo) -> Self {
        self.lrp.run_info = run_info;
        self
    }

    /// Finishes building.
    #[must_use]
    pub fn build(self) -> DesiredLrp {
        self.lrp
    }
}

/// Mutable fields of a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLrpUpdate {
    /// New instance count.
    pub instances: Option<u32>,
    /// New route table.
    pub routes: Option<Routes>,
    /// New annotation.
    pub annotation: Option<String>,
}

/// Result of an accepted desired LRP update.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredLrpChange {
    /// The record before the update.
    pub before: DesiredLrp,
    /// The record after the update.
    pub after: DesiredLrp,
}

/// Selection criteria for desired LRP reads and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredLrpFilter {
    /// Only LRPs in this domain.
    pub domain: Option<String>,
    /// Only LRPs with one of these guids; empty means all.
    pub process_guids: BTreeSet<String>,
}

impl DesiredLrpFilter {
    /// Filter by domain.
    #[must_use]
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// Filter by a set of process guids.
    #[must_use]
    pub fn process_guids(guids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            process_guids: guids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Returns true if the record matches.
    #[must_use]
    pub fn matches(&self, process_guid: &str, domain: &str) -> bool {
        self.domain.as_deref().map_or(true, |d| d == domain)
            && (self.process_guids.is_empty() || self.process_guids.contains(process_guid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_reports_changes_only() {
        let mut lrp = DesiredLrp::builder("web", "apps").instances(2).build();

        let noop = DesiredLrpUpdate {
            instances: Some(2),
            ..DesiredLrpUpdate::default()
        };
        assert!(!lrp.apply(&noop));

        let scale = DesiredLrpUpdate {
            instances: Some(5),
            annotation: Some("scaled".into()),
            ..DesiredLrpUpdate::default()
        };
        assert!(lrp.apply(&scale));
        assert_eq!(lrp.instances, 5);
        assert_eq!(lrp.annotation, "scaled");
    }

    #[test]
    fn parts_round_trip() {
        let lrp = DesiredLrp::builder("web", "apps")
            .instances(3)
            .route("http", serde_json::json!([{"hostnames": ["web.example.com"]}]))
            .build();
        let rebuilt = DesiredLrp::from_parts(lrp.scheduling_info(), lrp.run_info.clone());
        assert_eq!(rebuilt, lrp);
    }

    #[test]
    fn filter_matches_domain_and_guids() {
        let filter = DesiredLrpFilter {
            domain: Some("apps".into()),
            process_guids: ["a".to_string()].into_iter().collect(),
        };
        assert!(filter.matches("a", "apps"));
        assert!(!filter.matches("b", "apps"));
        assert!(!filter.matches("a", "other"));
        assert!(DesiredLrpFilter::default().matches("x", "y"));
    }
}
