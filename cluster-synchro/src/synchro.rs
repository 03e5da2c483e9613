//! Cluster Synchro: the top-level coordinator. Owns the plan-refresh loop,
//! the reconciler registry, the watermark map, and the status publication
//! channel, and wires discovery/negotiator/runner/health together.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::Client;
use synchro_common::Result;
use synchro_common::shutdown::LifetimeSignal;
use synchro_types::{
    ClusterResourceVersions, ClusterStatus, Condition, GroupResourceStatus, GroupVersionResource, SyncStatus,
};
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::SynchroConfig;
use crate::discovery::DiscoveryComponent;
use crate::health::{HealthChecker, HealthState};
use crate::negotiator::{NegotiationRequest, Negotiator, ResourceConfigFactory};
use crate::reconciler::Reconciler;
use crate::runner::{Runner, RunnerCallbacks};
use crate::status::StatusTracker;
use crate::storage_factory::StorageFactory;

/// Consumes published `ClusterStatus` documents. Errors are logged, never
/// fatal.
#[async_trait]
pub trait ClusterStatusUpdater: Send + Sync {
    async fn update_cluster_status(&self, cluster: &str, status: ClusterStatus) -> anyhow::Result<()>;
}

struct Registry {
    reconcilers: BTreeMap<GroupVersionResource, Arc<Reconciler>>,
    watermarks: BTreeMap<GroupVersionResource, Arc<Mutex<ClusterResourceVersions>>>,
}

pub struct ClusterSynchro {
    cluster: String,
    client: Client,
    storage_factory: Arc<dyn StorageFactory>,
    status_updater: Arc<dyn ClusterStatusUpdater>,
    resource_config_factory: Arc<dyn ResourceConfigFactory>,
    config: SynchroConfig,
    request: Mutex<NegotiationRequest>,

    discovery: Arc<DiscoveryComponent>,
    status_tracker: Arc<StatusTracker>,
    runner: Arc<Runner>,
    registry: RwLock<Registry>,

    refresh_wakeup: Arc<Notify>,
    status_tx: watch::Sender<ClusterStatus>,
    health_rx: watch::Receiver<HealthState>,

    lifetime: LifetimeSignal,
    tasks: Mutex<JoinSet<()>>,
    shutdown_started: std::sync::atomic::AtomicBool,
}

impl ClusterSynchro {
    /// Retryable construction: the caller should reschedule on error
    /// rather than treat it as fatal.
    pub async fn new(
        cluster: String,
        client: Client,
        storage_factory: Arc<dyn StorageFactory>,
        status_updater: Arc<dyn ClusterStatusUpdater>,
        resource_config_factory: Arc<dyn ResourceConfigFactory>,
        config: SynchroConfig,
        health_target: std::net::SocketAddr,
        request: NegotiationRequest,
    ) -> Result<Arc<Self>> {
        synchro_common::metrics::install_recorder_once();

        storage_factory
            .prepare_cluster(&cluster)
            .await
            .map_err(|e| e.retryable())?;

        let persisted = storage_factory
            .get_resource_versions(&cluster)
            .await
            .map_err(|e| e.retryable())?;
        let watermarks = persisted
            .into_iter()
            .map(|(gvr, versions)| (gvr, Arc::new(Mutex::new(versions))))
            .collect();

        let discovery = Arc::new(DiscoveryComponent::new(client.clone(), config.discovery_poll_interval));
        discovery.prepare().await.map_err(|e| e.retryable())?;

        let (health_checker, health_rx) = HealthChecker::new(
            health_target,
            config.health_check_interval,
            config.tcp_probe_timeout(),
            config.tcp_probe_keepalive(),
            config.health_checker_standalone_tcp,
        );

        let initial_status = ClusterStatus {
            version: discovery.server_version().await.unwrap_or_default(),
            running: Condition::new(false, "Starting", "", Utc::now()),
            healthy: Condition::new(false, "Unknown", "", Utc::now()),
            group_resource_status: GroupResourceStatus::new(),
        };
        let (status_tx, _status_rx) = watch::channel(initial_status);

        let synchro = Arc::new(Self {
            cluster,
            client,
            storage_factory,
            status_updater,
            resource_config_factory,
            config,
            request: Mutex::new(request),
            discovery,
            status_tracker: Arc::new(StatusTracker::new()),
            runner: Arc::new(Runner::new()),
            registry: RwLock::new(Registry { reconcilers: BTreeMap::new(), watermarks }),
            refresh_wakeup: Arc::new(Notify::new()),
            status_tx,
            health_rx,
            lifetime: LifetimeSignal::new(),
            tasks: Mutex::new(JoinSet::new()),
            shutdown_started: std::sync::atomic::AtomicBool::new(false),
        });

        synchro.spawn_background_tasks(health_checker).await;
        synchro.refresh_wakeup.notify_one();
        Ok(synchro)
    }

    async fn spawn_background_tasks(self: &Arc<Self>, health_checker: HealthChecker) {
        let mut tasks = self.tasks.lock().await;

        {
            let this = self.clone();
            tasks.spawn(async move {
                let wakeup = this.refresh_wakeup.clone();
                this.discovery
                    .start(this.lifetime.child().token(), Arc::new(move || wakeup.notify_one()))
                    .await;
            });
        }

        {
            let lifetime = self.lifetime.child().token();
            tasks.spawn(async move { health_checker.run(lifetime).await });
        }

        {
            let this = self.clone();
            tasks.spawn(async move { this.health_drive_loop().await });
        }

        {
            let this = self.clone();
            tasks.spawn(async move { this.refresh_loop().await });
        }

        {
            let this = self.clone();
            tasks.spawn(async move { this.status_publish_loop().await });
        }
    }

    async fn health_drive_loop(self: Arc<Self>) {
        let mut health_rx = self.health_rx.clone();
        loop {
            let healthy = health_rx.borrow_and_update().is_healthy();
            self.runner.on_health_change(healthy, self.as_ref()).await;
            self.publish_status().await;
            tokio::select! {
                _ = self.lifetime.cancelled() => return,
                changed = health_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Coalesces plan-refresh wakeups: a burst of discovery mutations
    /// during one refresh collapses into exactly one follow-up refresh.
    async fn refresh_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => return,
                _ = self.refresh_wakeup.notified() => {}
            }
            tokio::select! {
                _ = self.lifetime.cancelled() => return,
                _ = tokio::time::sleep(self.config.plan_refresh_debounce) => {}
            }
            self.refresh().await;
            self.publish_status().await;
        }
    }

    async fn status_publish_loop(self: Arc<Self>) {
        // the watch channel itself is the single-slot, latest-wins
        // publication primitive; this loop is only the dedicated consumer
        // that forwards to the external updater.
        let mut rx = self.status_tx.subscribe();
        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let status = rx.borrow_and_update().clone();
                    if let Err(err) = self.status_updater.update_cluster_status(&self.cluster, status).await {
                        tracing::warn!(cluster = %self.cluster, error = %err, "status update failed");
                    }
                }
            }
        }
    }

    /// Pulls every live reconciler's pull-only status snapshot and feeds it
    /// into the shared tracker. The reconciler never pushes; this is the
    /// one place that reads `status()`/`stage()` outside its own tests.
    async fn sync_reconciler_status(&self) {
        let reconcilers: Vec<_> = {
            let registry = self.registry.read().await;
            registry
                .reconcilers
                .iter()
                .map(|(gvr, reconciler)| (gvr.clone(), reconciler.clone()))
                .collect()
        };
        for (storage_gvr, reconciler) in reconcilers {
            let status = reconciler.status();
            self.status_tracker
                .update_sync_condition(&storage_gvr, status.stage, status.reason, status.message)
                .await;
            self.status_tracker
                .set_initial_list_phase(&storage_gvr, status.initial_list_phase)
                .await;
        }
    }

    async fn publish_status(&self) {
        self.sync_reconciler_status().await;
        let group_resource_status = self.status_tracker.snapshot().await;
        let running = self.runner.state().await == crate::runner::RunnerState::Running;
        let healthy = self.health_rx.borrow().is_healthy();
        let now = Utc::now();
        let status = ClusterStatus {
            version: self.status_tx.borrow().version.clone(),
            running: Condition::new(running, if running { "Running" } else { "NotRunning" }, "", now),
            healthy: Condition::new(healthy, if healthy { "Healthy" } else { "Unhealthy" }, "", now),
            group_resource_status,
        };
        let _ = self.status_tx.send(status);
    }

    /// One negotiation + registry reconciliation pass.
    async fn refresh(&self) {
        let snapshot = self.discovery.snapshot().await;
        let request = self.request.lock().await.clone();
        let negotiator = Negotiator::new(self.resource_config_factory.as_ref());
        let (new_status, plan) = negotiator.negotiate(&request, &snapshot);

        self.status_tracker.merge(new_status).await;

        let plan_gvrs: std::collections::BTreeSet<_> = plan.storage_gvrs().cloned().collect();
        let running = self.runner.state().await == crate::runner::RunnerState::Running;

        let to_create: Vec<_> = {
            let registry = self.registry.read().await;
            plan_gvrs
                .iter()
                .filter(|gvr| !registry.reconcilers.contains_key(*gvr))
                .cloned()
                .collect()
        };
        let to_remove: Vec<_> = {
            let registry = self.registry.read().await;
            registry
                .reconcilers
                .keys()
                .filter(|gvr| !plan_gvrs.contains(*gvr))
                .cloned()
                .collect()
        };

        for storage_gvr in to_create {
            let Some(cfg) = plan.resources.get(&storage_gvr).cloned() else { continue };
            match self
                .storage_factory
                .new_resource_storage(&self.cluster, &storage_gvr, &cfg)
                .await
            {
                Ok(storage) => {
                    let watermarks = {
                        let mut registry = self.registry.write().await;
                        registry
                            .watermarks
                            .entry(storage_gvr.clone())
                            .or_insert_with(|| Arc::new(Mutex::new(ClusterResourceVersions::new())))
                            .clone()
                    };
                    let reconciler_lifetime = self.lifetime.token();
                    let reconciler = Arc::new(Reconciler::new(
                        self.cluster.clone(),
                        storage_gvr.clone(),
                        cfg,
                        self.client.clone(),
                        Arc::from(storage),
                        watermarks,
                        self.config.resource_backoff_cap,
                        self.config.page_size_for_resource_sync,
                        &reconciler_lifetime,
                    ));

                    {
                        let reconciler = reconciler.clone();
                        let mut tasks = self.tasks.lock().await;
                        tasks.spawn(async move { reconciler.run().await });
                    }

                    if running && let Some(handler_stop) = self.runner.current_handler_stop().await {
                        reconciler.start(handler_stop);
                    }

                    self.registry.write().await.reconcilers.insert(storage_gvr, reconciler);
                }
                Err(err) => {
                    tracing::warn!(cluster = %self.cluster, gvr = %storage_gvr, error = %err, "failed to create resource storage");
                    self.status_tracker
                        .update_sync_condition(&storage_gvr, SyncStatus::Pending, "SynchroCreateFailed", err.display_message())
                        .await;
                }
            }
        }

        for storage_gvr in to_remove {
            let reconciler = { self.registry.write().await.reconcilers.remove(&storage_gvr) };
            if let Some(reconciler) = reconciler {
                reconciler.close().await;
            }
            self.status_tracker
                .update_sync_condition(&storage_gvr, SyncStatus::Stop, "SynchroRemoved", "")
                .await;

            let tracked = { self.registry.read().await.watermarks.contains_key(&storage_gvr) };
            if tracked {
                match self.storage_factory.clean_cluster_resource(&self.cluster, &storage_gvr).await {
                    Ok(()) => {
                        self.registry.write().await.watermarks.remove(&storage_gvr);
                        self.status_tracker.delete_version(&storage_gvr).await;
                    }
                    Err(err) => {
                        self.status_tracker
                            .update_sync_condition(&storage_gvr, SyncStatus::Stop, "CleanResourceFailed", err.display_message())
                            .await;
                    }
                }
            }
        }
    }

    /// Idempotent shutdown. A watchdog logs reconcilers still not stopped
    /// every 15s while shutdown is in progress.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        self.runner.shutdown(self).await;
        self.lifetime.cancel();

        let watchdog_registry_gvrs = { self.registry.read().await.reconcilers.keys().cloned().collect::<Vec<_>>() };
        let watchdog = tokio::spawn({
            let remaining = watchdog_registry_gvrs;
            async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(15));
                loop {
                    ticker.tick().await;
                    tracing::warn!(pending = remaining.len(), "reconcilers still shutting down");
                }
            }
        });

        {
            let mut tasks = self.tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        }
        watchdog.abort();

        let now = Utc::now();
        let mut status = self.status_tx.borrow().clone();
        status.running = Condition::new(false, "Shutdown", "", now);
        let _ = self.status_tx.send(status.clone());
        if let Err(err) = self.status_updater.update_cluster_status(&self.cluster, status).await {
            tracing::warn!(cluster = %self.cluster, error = %err, "final status publish failed");
        }
    }

    pub async fn status_snapshot(&self) -> ClusterStatus {
        self.status_tx.borrow().clone()
    }

    /// Conditions for a single storage GVR, without pulling the whole
    /// `ClusterStatus` document.
    pub async fn conditions_for(&self, storage_gvr: &GroupVersionResource) -> Vec<synchro_types::SyncCondition> {
        self.sync_reconciler_status().await;
        self.status_tracker.conditions_for(storage_gvr).await
    }
}

#[async_trait]
impl RunnerCallbacks for ClusterSynchro {
    async fn start(&self, handler_stop: CancellationToken) {
        self.discovery.prepare().await.ok();
        let reconcilers: Vec<_> = self.registry.read().await.reconcilers.values().cloned().collect();
        for reconciler in reconcilers {
            reconciler.start(handler_stop.clone());
        }
    }

    async fn stop(&self) {
        // reconcilers observe handler_stop cancellation themselves; the
        // runner already cancelled it before invoking this callback.
    }
}
