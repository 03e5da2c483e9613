//! Resource Negotiator: intersects desired resources with the discovered
//! surface and a storage-config factory, producing a [`SyncPlan`] plus the
//! matching [`GroupResourceStatus`] snapshot.

use std::collections::BTreeMap;

use chrono::Utc;
use synchro_types::{
    ConvertorRef, GroupResource, GroupResourceStatus, GroupStatus, GroupVersionResource, ResourceStatus,
    ResourceSyncConfig, SyncCondition, SyncPlan,
};

use crate::discovery::BUILTIN_GROUPS;

/// One entry of the user's desired-resource set. `"*"` in `group` or
/// `resource` behaves as a wildcard; an empty `versions` list means "every
/// version discovery reports", in which case version resolution prefers
/// the discovery-reported preferred version.
#[derive(Clone, Debug)]
pub struct DesiredResource {
    pub group: String,
    pub resource: String,
    pub versions: Vec<String>,
}

/// Negotiation input.
#[derive(Clone, Debug, Default)]
pub struct NegotiationRequest {
    pub desired: Vec<DesiredResource>,
    pub sync_all_custom_resources: bool,
    /// Resources excluded even when `sync_all_custom_resources` is set.
    pub excluded_resources: Vec<GroupResource>,
}

/// Per-(group, resource, version) storage configuration, resolved by
/// consulting a backend-supplied factory. A factory may remap the sync
/// GVR onto a different storage GVR and collapse several sync GVRs onto
/// one.
#[derive(Clone, Debug)]
pub struct ResolvedStorageConfig {
    pub storage_gvr: GroupVersionResource,
    pub convertor: Option<ConvertorRef>,
    pub storage_config: serde_json::Value,
    pub sync_events: bool,
}

/// Consulted once per negotiated (group, resource, version). Implemented
/// by the hosting service; the core never assumes a 1:1 sync→storage
/// mapping.
pub trait ResourceConfigFactory: Send + Sync {
    fn resolve(&self, sync: &GroupVersionResource, kind: &str) -> Option<ResolvedStorageConfig>;
}

/// A factory that stores each sync resource under its own, unconverted
/// storage GVR. Used when the hosting service has no remapping needs.
pub struct IdentityResourceConfigFactory;

impl ResourceConfigFactory for IdentityResourceConfigFactory {
    fn resolve(&self, sync: &GroupVersionResource, _kind: &str) -> Option<ResolvedStorageConfig> {
        Some(ResolvedStorageConfig {
            storage_gvr: sync.clone(),
            convertor: None,
            storage_config: serde_json::Value::Null,
            sync_events: false,
        })
    }
}

pub struct Negotiator<'a> {
    factory: &'a dyn ResourceConfigFactory,
}

impl<'a> Negotiator<'a> {
    pub fn new(factory: &'a dyn ResourceConfigFactory) -> Self {
        Self { factory }
    }

    /// Deterministic given identical `(request, snapshot, factory state)`:
    /// ordering is by (group, resource, version) throughout.
    pub fn negotiate(
        &self,
        request: &NegotiationRequest,
        snapshot: &synchro_types::DiscoverySnapshot,
    ) -> (GroupResourceStatus, SyncPlan) {
        let candidates = self.resolve_candidates(request, snapshot);

        let mut plan = SyncPlan::default();
        let mut unsupported: Vec<(GroupVersionResource, String)> = Vec::new();
        let mut by_group: BTreeMap<String, BTreeMap<String, Vec<SyncCondition>>> = BTreeMap::new();
        let now = Utc::now();

        for resource in &candidates {
            if !resource.supports_list_and_watch() {
                unsupported.push((resource.gvr(), resource.kind.clone()));
                continue;
            }

            let sync_gvr = resource.gvr();
            let Some(resolved) = self.factory.resolve(&sync_gvr, &resource.kind) else {
                continue;
            };

            plan.storage_gvr_to_sync_gvrs
                .entry(resolved.storage_gvr.clone())
                .or_default()
                .push(sync_gvr.clone());

            plan.resources.entry(resolved.storage_gvr.clone()).or_insert_with(|| ResourceSyncConfig {
                sync_resource: sync_gvr.clone(),
                kind: resource.kind.clone(),
                convertor: resolved.convertor.clone(),
                storage_config: resolved.storage_config.clone(),
                sync_events: resolved.sync_events,
            });

            let condition = SyncCondition::pending(sync_gvr, resolved.storage_gvr, now);
            by_group
                .entry(resource.group.clone())
                .or_default()
                .entry(resource.resource.clone())
                .or_default()
                .push(condition);
        }

        for (gvr, kind) in unsupported {
            let condition = SyncCondition {
                sync_resource: gvr.clone(),
                storage_gvr: gvr.clone(),
                sync_version: gvr.version.clone(),
                status: synchro_types::SyncStatus::Stop,
                reason: "Unsupported".to_string(),
                message: format!("{kind} does not support list and watch"),
                initial_list_phase: synchro_types::InitialListPhase::Unknown,
                last_transition_time: now,
            };
            by_group
                .entry(gvr.group.clone())
                .or_default()
                .entry(gvr.resource.clone())
                .or_default()
                .push(condition);
        }

        let mut groups = Vec::new();
        for (group, resources) in by_group {
            let mut resource_statuses = Vec::new();
            for (resource_name, mut versions) in resources {
                versions.sort_by(|a, b| a.sync_version.cmp(&b.sync_version));
                let matching = candidates.iter().find(|r| r.group == group && r.resource == resource_name);
                let namespaced = matching.map(|r| r.namespaced).unwrap_or(false);
                let kind = matching.map(|r| r.kind.clone()).unwrap_or_default();
                resource_statuses.push(ResourceStatus {
                    resource: resource_name,
                    kind,
                    namespaced,
                    versions,
                });
            }
            groups.push(GroupStatus {
                group,
                resources: resource_statuses,
            });
        }

        (GroupResourceStatus { groups }, plan)
    }

    /// Resolves wildcards and "all custom resources" against the
    /// discovery snapshot into a concrete set of `DiscoveredResource`s to
    /// negotiate over.
    fn resolve_candidates<'s>(
        &self,
        request: &NegotiationRequest,
        snapshot: &'s synchro_types::DiscoverySnapshot,
    ) -> Vec<&'s synchro_types::DiscoveredResource> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();

        for desired in &request.desired {
            if desired.versions.is_empty() {
                if let Some(r) = snapshot.find(
                    &GroupResource {
                        group: desired.group.clone(),
                        resource: desired.resource.clone(),
                    },
                    None,
                ) && seen.insert(r.gvr())
                {
                    out.push(r);
                }
                continue;
            }
            for version in &desired.versions {
                if let Some(r) = snapshot.find(
                    &GroupResource {
                        group: desired.group.clone(),
                        resource: desired.resource.clone(),
                    },
                    Some(version),
                ) && seen.insert(r.gvr())
                {
                    out.push(r);
                }
            }
        }

        if request.sync_all_custom_resources {
            for r in snapshot.all_custom_resources(BUILTIN_GROUPS) {
                let gr = r.gvr().group_resource();
                if request.excluded_resources.contains(&gr) {
                    continue;
                }
                if seen.insert(r.gvr()) {
                    out.push(r);
                }
            }
        }

        out.sort_by(|a, b| (&a.group, &a.resource, &a.version).cmp(&(&b.group, &b.resource, &b.version)));
        out
    }
}

#[cfg(test)]
mod tests {
    use synchro_types::DiscoveredResource;

    use super::*;

    fn snapshot() -> synchro_types::DiscoverySnapshot {
        synchro_types::DiscoverySnapshot {
            resources: vec![
                DiscoveredResource {
                    group: "apps".into(),
                    version: "v1".into(),
                    resource: "deployments".into(),
                    kind: "Deployment".into(),
                    namespaced: true,
                    verbs: vec!["list".into(), "watch".into()],
                    preferred: true,
                },
                DiscoveredResource {
                    group: "".into(),
                    version: "v1".into(),
                    resource: "pods".into(),
                    kind: "Pod".into(),
                    namespaced: true,
                    verbs: vec!["list".into(), "watch".into()],
                    preferred: true,
                },
                DiscoveredResource {
                    group: "example.io".into(),
                    version: "v1".into(),
                    resource: "widgets".into(),
                    kind: "Widget".into(),
                    namespaced: true,
                    verbs: vec!["get".into()],
                    preferred: true,
                },
            ],
        }
    }

    #[test]
    fn cold_start_produces_two_reconcilers_for_two_desired_resources() {
        let factory = IdentityResourceConfigFactory;
        let negotiator = Negotiator::new(&factory);
        let request = NegotiationRequest {
            desired: vec![
                DesiredResource { group: "apps".into(), resource: "deployments".into(), versions: vec![] },
                DesiredResource { group: "".into(), resource: "pods".into(), versions: vec![] },
            ],
            sync_all_custom_resources: false,
            excluded_resources: vec![],
        };
        let (status, plan) = negotiator.negotiate(&request, &snapshot());
        assert_eq!(plan.resources.len(), 2);
        assert_eq!(status.conditions().count(), 2);
        assert!(status.conditions().all(|c| c.status == synchro_types::SyncStatus::Pending));
    }

    #[test]
    fn unsupported_resource_gets_stop_condition_not_a_reconciler() {
        let factory = IdentityResourceConfigFactory;
        let negotiator = Negotiator::new(&factory);
        let request = NegotiationRequest {
            desired: vec![DesiredResource { group: "example.io".into(), resource: "widgets".into(), versions: vec![] }],
            sync_all_custom_resources: false,
            excluded_resources: vec![],
        };
        let (status, plan) = negotiator.negotiate(&request, &snapshot());
        assert_eq!(plan.resources.len(), 0);
        let cond = status.conditions().next().expect("one condition");
        assert_eq!(cond.reason, "Unsupported");
    }

    #[test]
    fn multi_sync_collapsing_onto_one_storage_gvr_yields_one_reconciler() {
        struct CollapsingFactory;
        impl ResourceConfigFactory for CollapsingFactory {
            fn resolve(&self, sync: &GroupVersionResource, _kind: &str) -> Option<ResolvedStorageConfig> {
                Some(ResolvedStorageConfig {
                    storage_gvr: GroupVersionResource::new(&sync.group, "v1", &sync.resource),
                    convertor: None,
                    storage_config: serde_json::Value::Null,
                    sync_events: false,
                })
            }
        }
        let snap = synchro_types::DiscoverySnapshot {
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
        let factory = CollapsingFactory;
        let negotiator = Negotiator::new(&factory);
        let request = NegotiationRequest {
            desired: vec![DesiredResource {
                group: "batch".into(),
                resource: "cronjobs".into(),
                versions: vec!["v1beta1".into(), "v1".into()],
            }],
            sync_all_custom_resources: false,
            excluded_resources: vec![],
        };
        let (status, plan) = negotiator.negotiate(&request, &snap);
        assert_eq!(plan.resources.len(), 1);
        let storage_gvr = GroupVersionResource::new("batch", "v1", "cronjobs");
        assert_eq!(plan.storage_gvr_to_sync_gvrs.get(&storage_gvr).map(|v| v.len()), Some(2));
        assert_eq!(status.conditions().filter(|c| c.storage_gvr == storage_gvr).count(), 2);
    }

    #[test]
    fn excluded_resources_are_skipped_even_with_sync_all_custom_resources() {
        let factory = IdentityResourceConfigFactory;
        let negotiator = Negotiator::new(&factory);
        let request = NegotiationRequest {
            desired: vec![],
            sync_all_custom_resources: true,
            excluded_resources: vec![GroupResource { group: "example.io".into(), resource: "widgets".into() }],
        };
        let snap = synchro_types::DiscoverySnapshot {
            resources: vec![DiscoveredResource {
                group: "example.io".into(),
                version: "v1".into(),
                resource: "widgets".into(),
                kind: "Widget".into(),
                namespaced: true,
                verbs: vec!["list".into(), "watch".into()],
                preferred: true,
            }],
        };
        let (status, plan) = negotiator.negotiate(&request, &snap);
        assert!(plan.resources.is_empty());
        assert!(status.conditions().count() == 0);
    }
}
