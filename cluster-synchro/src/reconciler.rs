//! Resource Reconciler: one long-running worker per storage GVR. Lists and
//! watches its sync resource upstream, converts and persists into storage,
//! and tracks its own pull-only status snapshot — it never holds a
//! back-pointer to the synchro that owns it.

use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::WatchEvent;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::runtime::watcher;
use synchro_common::wait::backoff_sleep_capped;
use synchro_types::{
    ClusterResourceVersions, GroupVersionResource, InitialListPhase, ResourceSyncConfig, SyncStatus, Watermark,
};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::metrics::ReconcilerMetrics;
use crate::storage_factory::{ResourceStorage, StoredEvent, StoredObject};

/// Pull-only snapshot a reconciler exposes to its owner; the owner merges
/// this into the shared `GroupResourceStatus` on its own schedule.
#[derive(Clone, Debug)]
pub struct ReconcilerStatus {
    pub stage: SyncStatus,
    pub reason: String,
    pub message: String,
    pub initial_list_phase: InitialListPhase,
}

impl ReconcilerStatus {
    fn pending(reason: &str) -> Self {
        Self {
            stage: SyncStatus::Pending,
            reason: reason.to_string(),
            message: String::new(),
            initial_list_phase: InitialListPhase::Unknown,
        }
    }
}

pub struct Reconciler {
    cluster: String,
    storage_gvr: GroupVersionResource,
    config: ResourceSyncConfig,
    client: Client,
    storage: Arc<dyn ResourceStorage>,
    watermarks: Arc<tokio::sync::Mutex<ClusterResourceVersions>>,
    metrics: ReconcilerMetrics,
    backoff_cap: std::time::Duration,
    page_size: i64,

    own_lifetime: CancellationToken,
    status: StdMutex<ReconcilerStatus>,
    start_tx: watch::Sender<Option<CancellationToken>>,
    start_rx: tokio::sync::Mutex<watch::Receiver<Option<CancellationToken>>>,
    done: Arc<Notify>,
}

impl Reconciler {
    pub fn new(
        cluster: String,
        storage_gvr: GroupVersionResource,
        config: ResourceSyncConfig,
        client: Client,
        storage: Arc<dyn ResourceStorage>,
        watermarks: Arc<tokio::sync::Mutex<ClusterResourceVersions>>,
        backoff_cap: std::time::Duration,
        page_size: i64,
        parent_lifetime: &CancellationToken,
    ) -> Self {
        let metrics = ReconcilerMetrics::new(&cluster, &storage_gvr);
        let (start_tx, start_rx) = watch::channel(None);
        Self {
            cluster,
            storage_gvr,
            config,
            client,
            storage,
            watermarks,
            metrics,
            backoff_cap,
            page_size,
            own_lifetime: parent_lifetime.child_token(),
            status: StdMutex::new(ReconcilerStatus::pending("SynchroPending")),
            start_tx,
            start_rx: tokio::sync::Mutex::new(start_rx),
            done: Arc::new(Notify::new()),
        }
    }

    pub fn group_version_resource(&self) -> &GroupVersionResource {
        &self.storage_gvr
    }

    pub fn status(&self) -> ReconcilerStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn stage(&self) -> SyncStatus {
        self.status.lock().unwrap().stage
    }

    /// Begins consuming upstream under `handler_stop`, the barrier the
    /// runner (C6) closes on every reconciler simultaneously. Safe to call
    /// repeatedly; each call supersedes the previous `handler_stop`.
    pub fn start(&self, handler_stop: CancellationToken) {
        let _ = self.start_tx.send(Some(handler_stop));
    }

    /// Cancels this reconciler's own lifetime and waits for `run` to
    /// return. Idempotent: a reconciler already stopped resolves
    /// immediately.
    pub async fn close(&self) {
        self.own_lifetime.cancel();
        self.done.notified().await;
    }

    /// Long-running worker body. Waits for `start` to supply a
    /// `handler_stop`, consumes upstream until that token (or this
    /// reconciler's own lifetime) is cancelled, then waits for the next
    /// `start` call. Returns once `close` cancels the own lifetime.
    pub async fn run(&self) {
        loop {
            let handler_stop = {
                let mut rx = self.start_rx.lock().await;
                tokio::select! {
                    _ = self.own_lifetime.cancelled() => {
                        self.done.notify_waiters();
                        return;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            self.done.notify_waiters();
                            return;
                        }
                        rx.borrow_and_update().clone()
                    }
                }
            };
            let Some(handler_stop) = handler_stop else { continue };
            self.consume_until(&handler_stop).await;
        }
    }

    fn watcher_config(&self) -> watcher::Config {
        let cfg = watcher::Config::default();
        match u32::try_from(self.page_size) {
            Ok(page_size) if page_size > 0 => cfg.page_size(page_size),
            _ => cfg,
        }
    }

    async fn consume_until(&self, handler_stop: &CancellationToken) {
        self.set_status(SyncStatus::Unknown, "SynchroStarting", "");
        self.set_initial_list_phase(InitialListPhase::NotStarted);

        let gvk = GroupVersionKind::gvk(
            self.config.sync_resource.group.clone(),
            self.config.sync_resource.version.clone(),
            self.config.kind.clone(),
        );
        let api_resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &api_resource);

        let stream = watcher::watcher(api, self.watcher_config());
        futures::pin_mut!(stream);

        let events_gvk = GroupVersionKind::gvk("", "v1", "Event");
        let events_resource = ApiResource::from_gvk(&events_gvk);
        let events_api: Api<DynamicObject> = Api::all_with(self.client.clone(), &events_resource);
        let events_stream = watcher::watcher(events_api, self.watcher_config());
        futures::pin_mut!(events_stream);

        self.set_initial_list_phase(InitialListPhase::InProgress);

        let mut attempt = 0u32;
        let mut event_attempt = 0u32;
        loop {
            tokio::select! {
                _ = self.own_lifetime.cancelled() => return,
                _ = handler_stop.cancelled() => return,
                next = stream.next() => {
                    match next {
                        None => return,
                        Some(Ok(event)) => {
                            attempt = 0;
                            if !self.handle_event(event, handler_stop).await {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            attempt = attempt.saturating_add(1);
                            self.set_status(SyncStatus::Syncing, "WatchError", err.to_string());
                            if !backoff_sleep_capped(handler_stop, attempt, self.backoff_cap).await {
                                return;
                            }
                        }
                    }
                }
                next = events_stream.next(), if self.config.sync_events => {
                    match next {
                        None => { /* events stream ended; primary resource sync continues */ }
                        Some(Ok(event)) => {
                            event_attempt = 0;
                            self.record_event(event, handler_stop).await;
                        }
                        Some(Err(err)) => {
                            event_attempt = event_attempt.saturating_add(1);
                            if !backoff_sleep_capped(handler_stop, event_attempt, self.backoff_cap).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Applies one watcher event. Returns `false` if an unrecoverable
    /// storage error was hit and consumption must stop until the next
    /// `start` call.
    async fn handle_event(&self, event: watcher::Event<DynamicObject>, handler_stop: &CancellationToken) -> bool {
        match event {
            watcher::Event::Init => true,
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => self.persist_upsert(obj, handler_stop).await,
            watcher::Event::InitDone => {
                self.set_initial_list_phase(InitialListPhase::Completed);
                self.set_status(SyncStatus::Syncing, "Synced", "");
                true
            }
            watcher::Event::Delete(obj) => self.persist_delete(obj, handler_stop).await,
        }
    }

    /// Persists one upstream event through [`ResourceStorage::record_event`]
    /// and advances the events watermark. Failures are logged and do not
    /// stop the primary resource stream; the next event retries on its own
    /// watermark rather than blocking object sync.
    async fn record_event(&self, event: watcher::Event<DynamicObject>, handler_stop: &CancellationToken) {
        let (kind, obj) = match event {
            watcher::Event::Init | watcher::Event::InitDone => return,
            watcher::Event::InitApply(obj) => ("ADDED", obj),
            watcher::Event::Apply(obj) => ("MODIFIED", obj),
            watcher::Event::Delete(obj) => ("DELETED", obj),
        };
        let Some(uid) = obj.metadata.uid.clone() else { return };
        let watermark = Watermark(obj.metadata.resource_version.clone().unwrap_or_default());
        let raw = WatchEvent {
            type_: kind.to_string(),
            object: RawExtension(serde_json::to_value(&obj).unwrap_or(serde_json::Value::Null)),
        };
        let stored = StoredEvent { uid: uid.clone(), watermark: watermark.clone(), raw };

        let mut attempt = 0u32;
        loop {
            match self.storage.record_event(stored.clone()).await {
                Ok(()) => {
                    self.watermarks.lock().await.events.insert(uid, watermark);
                    return;
                }
                Err(err) if err.is_recoverable() => {
                    attempt = attempt.saturating_add(1);
                    if !backoff_sleep_capped(handler_stop, attempt, self.backoff_cap).await {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(cluster = %self.cluster, gvr = %self.storage_gvr, error = %err.display_message(), "event persistence failed");
                    return;
                }
            }
        }
    }

    async fn persist_upsert(&self, obj: DynamicObject, handler_stop: &CancellationToken) -> bool {
        let Some(uid) = obj.metadata.uid.clone() else { return true };
        let watermark = Watermark(obj.metadata.resource_version.clone().unwrap_or_default());
        let raw = serde_json::to_value(&obj).unwrap_or(serde_json::Value::Null);
        let stored = StoredObject { uid: uid.clone(), watermark: watermark.clone(), raw };

        let existed = {
            let wm = self.watermarks.lock().await;
            wm.resources.contains_key(&uid)
        };

        let mut attempt = 0u32;
        loop {
            let result = if existed {
                self.storage.update(stored.clone()).await
            } else {
                self.storage.create(stored.clone()).await
            };
            match result {
                Ok(()) => {
                    self.watermarks.lock().await.resources.insert(uid, watermark);
                    self.metrics.object_persisted();
                    return true;
                }
                Err(err) if err.is_recoverable() => {
                    attempt = attempt.saturating_add(1);
                    self.metrics.persistence_error(true);
                    self.set_status(SyncStatus::Syncing, "StorageRetrying", err.display_message());
                    if !backoff_sleep_capped(handler_stop, attempt, self.backoff_cap).await {
                        return false;
                    }
                }
                Err(err) => {
                    self.metrics.persistence_error(false);
                    self.set_status(SyncStatus::Pending, "StorageError", err.display_message());
                    return false;
                }
            }
        }
    }

    async fn persist_delete(&self, obj: DynamicObject, handler_stop: &CancellationToken) -> bool {
        let Some(uid) = obj.metadata.uid.clone() else { return true };
        let last_known = {
            let wm = self.watermarks.lock().await;
            wm.resources.get(&uid).map(|w| StoredObject {
                uid: uid.clone(),
                watermark: w.clone(),
                raw: serde_json::Value::Null,
            })
        };
        let tombstone = self.storage.convert_deleted_object(&uid, last_known.as_ref());

        let mut attempt = 0u32;
        loop {
            match self.storage.delete(&tombstone.uid).await {
                Ok(()) => {
                    self.watermarks.lock().await.resources.remove(&uid);
                    self.metrics.object_deleted();
                    return true;
                }
                Err(err) if err.is_recoverable() => {
                    attempt = attempt.saturating_add(1);
                    self.metrics.persistence_error(true);
                    if !backoff_sleep_capped(handler_stop, attempt, self.backoff_cap).await {
                        return false;
                    }
                }
                Err(err) => {
                    self.metrics.persistence_error(false);
                    self.set_status(SyncStatus::Pending, "StorageError", err.display_message());
                    return false;
                }
            }
        }
    }

    fn set_status(&self, stage: SyncStatus, reason: &str, message: impl Into<String>) {
        let mut guard = self.status.lock().unwrap();
        guard.stage = stage;
        guard.reason = reason.to_string();
        guard.message = message.into();
    }

    fn set_initial_list_phase(&self, phase: InitialListPhase) {
        self.status.lock().unwrap().initial_list_phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use synchro_types::ConvertorRef;

    use super::*;
    use crate::storage_factory::fakes::FakeResourceStorage;

    fn config() -> ResourceSyncConfig {
        ResourceSyncConfig {
            sync_resource: GroupVersionResource::new("apps", "v1", "deployments"),
            kind: "Deployment".to_string(),
            convertor: None::<ConvertorRef>,
            storage_config: serde_json::Value::Null,
            sync_events: false,
        }
    }

    #[test]
    fn new_reconciler_starts_pending() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage: Arc<dyn ResourceStorage> = Arc::new(FakeResourceStorage::default());
            let client = kube::Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap()))
                .expect("client from static config never touches the network at construction");
            let reconciler = Reconciler::new(
                "c1".into(),
                GroupVersionResource::new("apps", "v1", "deployments"),
                config(),
                client,
                storage,
                Arc::new(tokio::sync::Mutex::new(ClusterResourceVersions::new())),
                std::time::Duration::from_secs(1),
                500,
                &CancellationToken::new(),
            );
            assert_eq!(reconciler.stage(), SyncStatus::Pending);
            assert_eq!(reconciler.status().reason, "SynchroPending");
        });
    }
}
