//! Group/Resource Status: merges successive negotiated plans and tracks
//! per-(group, resource, version) sync conditions.
//!
//! Access is always safe to call concurrently (backed by a `tokio::sync::
//! RwLock`); `enable_concurrent`/`disable_concurrent` are kept only as a
//! documented, explicit toggle — there is no unsynchronized fast path to
//! opt out of in this implementation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use synchro_types::{GroupResourceStatus, GroupVersionResource, SyncCondition, SyncStatus};
use tokio::sync::RwLock;

pub struct StatusTracker {
    inner: RwLock<GroupResourceStatus>,
    concurrent: AtomicBool,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GroupResourceStatus::new()),
            concurrent: AtomicBool::new(true),
        }
    }

    pub fn enable_concurrent(&self) {
        self.concurrent.store(true, Ordering::SeqCst);
    }

    pub fn disable_concurrent(&self) {
        self.concurrent.store(false, Ordering::SeqCst);
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent.load(Ordering::SeqCst)
    }

    /// Replaces the tracked status with a freshly negotiated one, carrying
    /// forward `last_transition_time` for any (group, resource, version)
    /// triple whose status/reason/message is unchanged. Returns the
    /// storage GVRs present before the merge but absent after it.
    pub async fn merge(&self, mut new_status: GroupResourceStatus) -> BTreeSet<GroupVersionResource> {
        let mut guard = self.inner.write().await;

        let previous_gvrs = guard.storage_gvrs();
        let new_gvrs = new_status.storage_gvrs();
        let deleted: BTreeSet<_> = previous_gvrs.difference(&new_gvrs).cloned().collect();

        let previous_by_key: std::collections::HashMap<_, _> =
            guard.conditions().map(|c| (c.key(), c.clone())).collect();

        for condition in new_status.conditions_mut() {
            if let Some(prev) = previous_by_key.get(&condition.key())
                && prev.status == condition.status
                && prev.reason == condition.reason
                && prev.message == condition.message
                && prev.storage_gvr == condition.storage_gvr
            {
                condition.last_transition_time = prev.last_transition_time;
                condition.initial_list_phase = prev.initial_list_phase;
            }
        }

        *guard = new_status;
        deleted
    }

    /// Transitions the single condition matching `storage_gvr`, stamping a
    /// fresh transition time whenever status/reason/message actually
    /// change. A storage GVR may be fed by several sync resources (the
    /// multi-sync-to-one-storage case), so every condition sharing the
    /// storage GVR is updated together.
    pub async fn update_sync_condition(
        &self,
        storage_gvr: &GroupVersionResource,
        status: SyncStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let reason = reason.into();
        let message = message.into();
        let now = chrono::Utc::now();
        let mut guard = self.inner.write().await;
        for condition in guard.conditions_mut().filter(|c| &c.storage_gvr == storage_gvr) {
            if condition.status != status || condition.reason != reason || condition.message != message {
                condition.last_transition_time = now;
            }
            condition.status = status;
            condition.reason = reason.clone();
            condition.message = message.clone();
        }
    }

    pub async fn set_initial_list_phase(&self, storage_gvr: &GroupVersionResource, phase: synchro_types::InitialListPhase) {
        let mut guard = self.inner.write().await;
        for condition in guard.conditions_mut().filter(|c| &c.storage_gvr == storage_gvr) {
            condition.initial_list_phase = phase;
        }
    }

    /// Removes every condition referencing `storage_gvr` entirely. When a
    /// clean-resource attempt does not succeed, the triple should instead
    /// remain visible with a `Stop/CleanResourceFailed` reason — callers
    /// use [`Self::update_sync_condition`] for that case; this method is
    /// for the happy-path removal where the plan truly no longer
    /// references the resource.
    pub async fn delete_version(&self, storage_gvr: &GroupVersionResource) {
        let mut guard = self.inner.write().await;
        for group in guard.groups.iter_mut() {
            for resource in group.resources.iter_mut() {
                resource.versions.retain(|c| &c.storage_gvr != storage_gvr);
            }
            group.resources.retain(|r| !r.versions.is_empty());
        }
        guard.groups.retain(|g| !g.resources.is_empty());
    }

    /// A deep-copied snapshot safe to read or mutate without affecting the
    /// tracker.
    pub async fn snapshot(&self) -> GroupResourceStatus {
        self.inner.read().await.clone()
    }

    pub async fn conditions_for(&self, storage_gvr: &GroupVersionResource) -> Vec<SyncCondition> {
        self.inner
            .read()
            .await
            .conditions()
            .filter(|c| &c.storage_gvr == storage_gvr)
            .cloned()
            .collect()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use synchro_types::{GroupStatus, ResourceStatus};

    use super::*;

    fn plan_with(storage_gvrs: &[&str]) -> GroupResourceStatus {
        let now = chrono::Utc::now();
        let versions = storage_gvrs
            .iter()
            .map(|name| {
                let gvr = GroupVersionResource::new("apps", "v1", *name);
                SyncCondition::pending(gvr.clone(), gvr, now)
            })
            .collect();
        GroupResourceStatus {
            groups: vec![GroupStatus {
                group: "apps".into(),
                resources: vec![ResourceStatus {
                    resource: "multi".into(),
                    kind: "Multi".into(),
                    namespaced: true,
                    versions,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn merge_reports_deleted_storage_gvrs() {
        let tracker = StatusTracker::new();
        tracker.merge(plan_with(&["pods", "deployments"])).await;
        let deleted = tracker.merge(plan_with(&["pods"])).await;
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted.iter().next().unwrap().resource, "deployments");
    }

    #[tokio::test]
    async fn merge_preserves_timestamp_when_condition_unchanged() {
        let tracker = StatusTracker::new();
        tracker.merge(plan_with(&["pods"])).await;
        let gvr = GroupVersionResource::new("apps", "v1", "pods");
        tracker.update_sync_condition(&gvr, SyncStatus::Syncing, "Synced", "ok").await;
        let before = tracker.snapshot().await;
        let before_ts = before.conditions().next().unwrap().last_transition_time;

        tracker.merge(plan_with(&["pods"])).await;
        tracker.update_sync_condition(&gvr, SyncStatus::Syncing, "Synced", "ok").await;
        let after = tracker.snapshot().await;
        let after_ts = after.conditions().next().unwrap().last_transition_time;
        assert_eq!(before_ts, after_ts);
    }

    #[tokio::test]
    async fn update_sync_condition_fans_out_to_every_condition_sharing_storage_gvr() {
        let tracker = StatusTracker::new();
        let now = chrono::Utc::now();
        let storage_gvr = GroupVersionResource::new("batch", "v1", "cronjobs");
        let status = GroupResourceStatus {
            groups: vec![GroupStatus {
                group: "batch".into(),
                resources: vec![ResourceStatus {
                    resource: "cronjobs".into(),
                    kind: "CronJob".into(),
                    namespaced: true,
                    versions: vec![
                        SyncCondition::pending(GroupVersionResource::new("batch", "v1beta1", "cronjobs"), storage_gvr.clone(), now),
                        SyncCondition::pending(GroupVersionResource::new("batch", "v1", "cronjobs"), storage_gvr.clone(), now),
                    ],
                }],
            }],
        };
        tracker.merge(status).await;
        tracker.update_sync_condition(&storage_gvr, SyncStatus::Syncing, "Synced", "ok").await;
        let snap = tracker.snapshot().await;
        assert!(snap.conditions().all(|c| c.status == SyncStatus::Syncing));
        assert_eq!(snap.conditions().count(), 2);
    }

    #[tokio::test]
    async fn delete_version_removes_empty_groups() {
        let tracker = StatusTracker::new();
        tracker.merge(plan_with(&["pods"])).await;
        let gvr = GroupVersionResource::new("apps", "v1", "pods");
        tracker.delete_version(&gvr).await;
        let snap = tracker.snapshot().await;
        assert!(snap.groups.is_empty());
    }
}
