//! Data model shared between the `cluster-synchro` core and its external
//! collaborators (storage factory, status updater). Pure data: no I/O, no
//! locking.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Group/Version/Resource triple identifying an API resource.
///
/// Two logical GVRs appear throughout the system: the *sync* GVR (read
/// upstream) and the *storage* GVR (written to storage). A conversion rule
/// may collapse several sync GVRs onto one storage GVR.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn group_resource(&self) -> GroupResource {
        GroupResource {
            group: self.group.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// The (group, resource) pair, ignoring version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}/{}", self.group, self.resource)
        }
    }
}

/// An opaque per-object version watermark used for incremental sync.
/// Equality-only; implementations must not assume ordering between
/// watermarks from different backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark(pub String);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per storage GVR, two maps keyed by object UID. Persisted by the storage
/// factory and handed back on warm restart via `GetResourceVersions`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterResourceVersions {
    pub resources: BTreeMap<String, Watermark>,
    pub events: BTreeMap<String, Watermark>,
}

impl ClusterResourceVersions {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A single (group, resource, version) entry resolved by discovery, with
/// enough information for the negotiator to decide support and for
/// version resolution to prefer the discovery-reported storage version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    /// True if discovery reported this version as the group's preferred
    /// (storage) version.
    pub preferred: bool,
}

impl DiscoveredResource {
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(self.group.clone(), self.version.clone(), self.resource.clone())
    }

    pub fn supports_list_and_watch(&self) -> bool {
        self.verbs.iter().any(|v| v == "list") && self.verbs.iter().any(|v| v == "watch")
    }
}

/// A snapshot of the upstream API surface, as published by the discovery
/// component. Immutable once constructed; a new snapshot replaces the old
/// one wholesale.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoverySnapshot {
    pub resources: Vec<DiscoveredResource>,
}

impl DiscoverySnapshot {
    pub fn find(&self, gr: &GroupResource, version: Option<&str>) -> Option<&DiscoveredResource> {
        self.resources
            .iter()
            .filter(|r| r.group == gr.group && r.resource == gr.resource)
            .filter(|r| version.is_none_or(|v| r.version == v))
            .max_by(|a, b| match (a.preferred, b.preferred) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => Ordering::Equal,
            })
    }

    pub fn all_custom_resources<'a>(&'a self, builtin_groups: &[&str]) -> Vec<&'a DiscoveredResource> {
        self.resources
            .iter()
            .filter(|r| !builtin_groups.contains(&r.group.as_str()))
            .collect()
    }
}

/// An optional conversion applied between the sync GVR and the storage GVR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertorRef {
    pub name: String,
}

/// One entry of a `SyncPlan`: what to read upstream, and how to persist it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceSyncConfig {
    pub sync_resource: GroupVersionResource,
    pub kind: String,
    pub convertor: Option<ConvertorRef>,
    /// Opaque, backend-specific storage configuration handed to the
    /// storage factory. Not interpreted by the core.
    pub storage_config: serde_json::Value,
    pub sync_events: bool,
}

/// Output of negotiation (§4.2): the desired reconciler set keyed by
/// storage GVR, plus a reverse index for fan-out when multiple sync GVRs
/// collapse onto one storage GVR.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncPlan {
    pub resources: BTreeMap<GroupVersionResource, ResourceSyncConfig>,
    pub storage_gvr_to_sync_gvrs: BTreeMap<GroupVersionResource, Vec<GroupVersionResource>>,
}

impl SyncPlan {
    pub fn storage_gvrs(&self) -> impl Iterator<Item = &GroupVersionResource> {
        self.resources.keys()
    }
}

/// The sync status of a single (group, resource, version) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Unknown,
    Syncing,
    Stop,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "Pending",
            SyncStatus::Unknown => "Unknown",
            SyncStatus::Syncing => "Syncing",
            SyncStatus::Stop => "Stop",
        };
        write!(f, "{s}")
    }
}

/// The initial bulk-enumeration phase a reconciler performs before
/// entering steady-state watching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialListPhase {
    Unknown,
    NotStarted,
    InProgress,
    Completed,
}

/// A single condition tracked per (group, resource, version) triple.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncCondition {
    pub sync_resource: GroupVersionResource,
    pub storage_gvr: GroupVersionResource,
    pub sync_version: String,
    pub status: SyncStatus,
    pub reason: String,
    pub message: String,
    pub initial_list_phase: InitialListPhase,
    pub last_transition_time: DateTime<Utc>,
}

impl SyncCondition {
    pub fn pending(sync_resource: GroupVersionResource, storage_gvr: GroupVersionResource, now: DateTime<Utc>) -> Self {
        let sync_version = sync_resource.version.clone();
        Self {
            sync_resource,
            storage_gvr,
            sync_version,
            status: SyncStatus::Pending,
            reason: "SynchroPending".to_string(),
            message: String::new(),
            initial_list_phase: InitialListPhase::Unknown,
            last_transition_time: now,
        }
    }

    /// Identity used to decide whether two conditions refer to the same
    /// triple across a `Merge` (timestamps aside).
    pub fn key(&self) -> (GroupResource, String) {
        (self.sync_resource.group_resource(), self.sync_version.clone())
    }
}

/// One API resource's worth of sync conditions (one per negotiated
/// version).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
    pub versions: Vec<SyncCondition>,
}

/// One API group's worth of resources.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group: String,
    pub resources: Vec<ResourceStatus>,
}

/// An ordered list of groups, each with resources, each with per-version
/// sync conditions (§3). Invariant: for any storage GVR present in the
/// live reconciler set, at least one sync condition references it
/// (enforced by the C7 coordinator, not by this type).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupResourceStatus {
    pub groups: Vec<GroupStatus>,
}

impl GroupResourceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterates all sync conditions in stable (group, resource, version)
    /// order.
    pub fn conditions(&self) -> impl Iterator<Item = &SyncCondition> {
        self.groups
            .iter()
            .flat_map(|g| g.resources.iter())
            .flat_map(|r| r.versions.iter())
    }

    pub fn conditions_mut(&mut self) -> impl Iterator<Item = &mut SyncCondition> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.resources.iter_mut())
            .flat_map(|r| r.versions.iter_mut())
    }

    pub fn find_condition_mut(&mut self, storage_gvr: &GroupVersionResource) -> Option<&mut SyncCondition> {
        self.conditions_mut().find(|c| &c.storage_gvr == storage_gvr)
    }

    pub fn storage_gvrs(&self) -> std::collections::BTreeSet<GroupVersionResource> {
        self.conditions().map(|c| c.storage_gvr.clone()).collect()
    }
}

/// A generic boolean condition with a reason/message, used for the
/// top-level `Running`/`Healthy` conditions on `ClusterStatus`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(status: bool, reason: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Version string + two top-level conditions + embedded group/resource
/// status snapshot. Published by C7 on the single status channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub version: String,
    pub running: Condition,
    pub healthy: Condition,
    pub group_resource_status: GroupResourceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvr_display_handles_core_group() {
        let gvr = GroupVersionResource::new("", "v1", "pods");
        assert_eq!(gvr.to_string(), "v1/pods");
        let gvr = GroupVersionResource::new("apps", "v1", "deployments");
        assert_eq!(gvr.to_string(), "apps/v1/deployments");
    }

    #[test]
    fn discovery_snapshot_prefers_preferred_version() {
        let snapshot = DiscoverySnapshot {
            resources: vec![
                DiscoveredResource {
                    group: "batch".into(),
                    version: "v1beta1".into(),
                    resource: "cronjobs".into(),
                    kind: "CronJob".into(),
                    namespaced: true,
                    verbs: vec!["list".into(), "watch".into()],
                    preferred: false,
                },
                DiscoveredResource {
                    group: "batch".into(),
                    version: "v1".into(),
                    resource: "cronjobs".into(),
                    kind: "CronJob".into(),
                    namespaced: true,
                    verbs: vec!["list".into(), "watch".into()],
                    preferred: true,
                },
            ],
        };
        let gr = GroupResource {
            group: "batch".into(),
            resource: "cronjobs".into(),
        };
        let found = snapshot.find(&gr, None).unwrap();
        assert_eq!(found.version, "v1");
    }

    #[test]
    fn supports_list_and_watch_requires_both_verbs() {
        let r = DiscoveredResource {
            group: "".into(),
            version: "v1".into(),
            resource: "pods".into(),
            kind: "Pod".into(),
            namespaced: true,
            verbs: vec!["list".into()],
            preferred: true,
        };
        assert!(!r.supports_list_and_watch());
    }
}
