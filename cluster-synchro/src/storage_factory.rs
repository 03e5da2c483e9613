//! Contracts with the pluggable storage backend. The backend
//! implementation itself is out of scope; this module only defines the
//! trait boundary the core dispatches through. Kept as explicit trait
//! objects rather than generics: downstream backends are plugged in at
//! runtime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::WatchEvent;
use synchro_common::Result;
use synchro_types::{ClusterResourceVersions, GroupVersionResource, ResourceSyncConfig, Watermark};

/// An object as seen by a reconciler: opaque to the core beyond its
/// identity and watermark. The storage backend is free to interpret
/// `raw` however its conversion layer requires.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub uid: String,
    pub watermark: Watermark,
    pub raw: serde_json::Value,
}

/// A single upstream event to be recorded, when event syncing is enabled
/// for a resource.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub uid: String,
    pub watermark: Watermark,
    pub raw: WatchEvent,
}

/// Per-resource storage handle returned by [`StorageFactory::new_resource_storage`].
/// Implements the steady-state persistence operations a reconciler drives.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    async fn get(&self, uid: &str) -> Result<Option<StoredObject>>;
    async fn list(&self) -> Result<Vec<StoredObject>>;
    async fn create(&self, object: StoredObject) -> Result<()>;
    async fn update(&self, object: StoredObject) -> Result<()>;
    async fn delete(&self, uid: &str) -> Result<()>;

    /// Converts a tombstone (a deleted object whose full body is no
    /// longer available from the watch stream) into the storage-level
    /// representation the backend needs to apply a delete.
    fn convert_deleted_object(&self, uid: &str, last_known: Option<&StoredObject>) -> StoredObject {
        StoredObject {
            uid: uid.to_string(),
            watermark: last_known
                .map(|o| o.watermark.clone())
                .unwrap_or_else(|| Watermark(String::new())),
            raw: serde_json::Value::Null,
        }
    }

    async fn record_event(&self, event: StoredEvent) -> Result<()>;
}

/// Read-only aggregator over several resources, answering cross-resource
/// "collection" views.
#[async_trait]
pub trait CollectionResourceStorage: Send + Sync {
    async fn list(&self) -> Result<Vec<StoredObject>>;
}

/// The storage backend's factory contract. A backend implements this once
/// per process; the core never constructs storage handles directly.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    /// Static set of verbs this backend understands (used by the
    /// negotiator to decide whether a discovered resource is usable).
    fn supported_request_verbs(&self) -> &[&'static str];

    /// Idempotent per-cluster bootstrap of persistent state.
    async fn prepare_cluster(&self, cluster: &str) -> Result<()>;

    /// Warm-restart watermarks: every storage GVR this cluster has
    /// persisted state for, with its resource/event watermark maps.
    async fn get_resource_versions(
        &self,
        cluster: &str,
    ) -> Result<BTreeMap<GroupVersionResource, ClusterResourceVersions>>;

    async fn get_collection_resources(&self) -> Result<Vec<GroupVersionResource>>;

    async fn new_resource_storage(
        &self,
        cluster: &str,
        storage_gvr: &GroupVersionResource,
        config: &ResourceSyncConfig,
    ) -> Result<Box<dyn ResourceStorage>>;

    async fn new_collection_resource_storage(
        &self,
        collection: &GroupVersionResource,
    ) -> Result<Box<dyn CollectionResourceStorage>>;

    /// Durable deletion of all of a cluster's persisted state. May be
    /// partial: callers must not assume a returned error means nothing
    /// was removed.
    async fn clean_cluster(&self, cluster: &str) -> Result<()>;

    /// Durable deletion of one storage GVR's persisted state for a
    /// cluster. Same partial-failure caveat as [`Self::clean_cluster`].
    async fn clean_cluster_resource(&self, cluster: &str, storage_gvr: &GroupVersionResource) -> Result<()>;

    async fn shutdown(&self);
}

/// Optional capability: a backend that also knows how to build reconcilers
/// directly, bypassing the default factory used otherwise.
pub trait SynchroFactory: StorageFactory {}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// Hand-written fake backend used throughout the core's own test suite
    /// (no mocking framework in this codebase's dependency graph).
    #[derive(Default)]
    pub struct FakeStorageFactory {
        pub resource_versions: Mutex<BTreeMap<GroupVersionResource, ClusterResourceVersions>>,
        pub clean_resource_calls: Mutex<Vec<GroupVersionResource>>,
        pub clean_resource_should_fail: Mutex<bool>,
    }

    #[derive(Default)]
    pub struct FakeResourceStorage {
        pub objects: Mutex<BTreeMap<String, StoredObject>>,
    }

    #[async_trait]
    impl ResourceStorage for FakeResourceStorage {
        async fn get(&self, uid: &str) -> Result<Option<StoredObject>> {
            Ok(self.objects.lock().unwrap().get(uid).cloned())
        }

        async fn list(&self) -> Result<Vec<StoredObject>> {
            Ok(self.objects.lock().unwrap().values().cloned().collect())
        }

        async fn create(&self, object: StoredObject) -> Result<()> {
            self.objects.lock().unwrap().insert(object.uid.clone(), object);
            Ok(())
        }

        async fn update(&self, object: StoredObject) -> Result<()> {
            self.objects.lock().unwrap().insert(object.uid.clone(), object);
            Ok(())
        }

        async fn delete(&self, uid: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(uid);
            Ok(())
        }

        async fn record_event(&self, _event: StoredEvent) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl StorageFactory for FakeStorageFactory {
        fn supported_request_verbs(&self) -> &[&'static str] {
            &["list", "watch", "get", "create", "update", "delete"]
        }

        async fn prepare_cluster(&self, _cluster: &str) -> Result<()> {
            Ok(())
        }

        async fn get_resource_versions(
            &self,
            _cluster: &str,
        ) -> Result<BTreeMap<GroupVersionResource, ClusterResourceVersions>> {
            Ok(self.resource_versions.lock().unwrap().clone())
        }

        async fn get_collection_resources(&self) -> Result<Vec<GroupVersionResource>> {
            Ok(Vec::new())
        }

        async fn new_resource_storage(
            &self,
            _cluster: &str,
            _storage_gvr: &GroupVersionResource,
            _config: &ResourceSyncConfig,
        ) -> Result<Box<dyn ResourceStorage>> {
            Ok(Box::new(FakeResourceStorage::default()))
        }

        async fn new_collection_resource_storage(
            &self,
            _collection: &GroupVersionResource,
        ) -> Result<Box<dyn CollectionResourceStorage>> {
            struct Empty;
            #[async_trait]
            impl CollectionResourceStorage for Empty {
                async fn list(&self) -> Result<Vec<StoredObject>> {
                    Ok(Vec::new())
                }
            }
            Ok(Box::new(Empty))
        }

        async fn clean_cluster(&self, _cluster: &str) -> Result<()> {
            Ok(())
        }

        async fn clean_cluster_resource(&self, _cluster: &str, storage_gvr: &GroupVersionResource) -> Result<()> {
            self.clean_resource_calls.lock().unwrap().push(storage_gvr.clone());
            if *self.clean_resource_should_fail.lock().unwrap() {
                return Err(synchro_common::Error::Storage("cleanup refused".into()));
            }
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    impl SynchroFactory for FakeStorageFactory {}
}
