//! Dynamic Discovery: tracks the upstream API surface and publishes a
//! versioned snapshot, waking the negotiator on mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Client;
use kube::discovery::Discovery as KubeDiscovery;
use synchro_common::wait::backoff_sleep;
use synchro_common::{Error, Result};
use synchro_types::{DiscoveredResource, DiscoverySnapshot};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Builtin API groups excluded from "all custom resources" (used by the
/// `all_custom_resources` helper on `DiscoverySnapshot`).
pub const BUILTIN_GROUPS: &[&str] = &[
    "", "apps", "batch", "autoscaling", "networking.k8s.io", "policy", "rbac.authorization.k8s.io",
    "storage.k8s.io", "coordination.k8s.io", "events.k8s.io", "apiextensions.k8s.io", "admissionregistration.k8s.io",
    "scheduling.k8s.io", "node.k8s.io", "discovery.k8s.io", "certificates.k8s.io", "authentication.k8s.io",
    "authorization.k8s.io",
];

/// Callback fired whenever the discovered resource set changes. Must be
/// cheap: it only wakes the plan refresher, it does not compute the plan
/// itself.
pub type OnMutation = Arc<dyn Fn() + Send + Sync>;

pub struct DiscoveryComponent {
    client: Client,
    poll_interval: Duration,
    snapshot: RwLock<DiscoverySnapshot>,
    prepared: AtomicBool,
}

impl DiscoveryComponent {
    pub fn new(client: Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            snapshot: RwLock::new(DiscoverySnapshot::default()),
            prepared: AtomicBool::new(false),
        }
    }

    /// Idempotent: only the first call performs the initial discovery run.
    /// Subsequent calls are a no-op.
    pub async fn prepare(&self) -> Result<()> {
        if self.prepared.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let snap = run_discovery(&self.client).await?;
        *self.snapshot.write().await = snap;
        Ok(())
    }

    pub async fn snapshot(&self) -> DiscoverySnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await.map_err(Error::from)?;
        Ok(info.git_version)
    }

    /// Runs the poll loop until `lifetime` is cancelled. Each tick re-runs
    /// discovery; on success the snapshot is diffed by (GVR, kind) identity
    /// and, if changed, published and `on_mutation` is invoked. Transient
    /// upstream failures keep the last snapshot and are only logged.
    pub async fn start(&self, lifetime: CancellationToken, on_mutation: OnMutation) {
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match run_discovery(&self.client).await {
                Ok(new_snapshot) => {
                    attempt = 0;
                    let changed = {
                        let current = self.snapshot.read().await;
                        !same_resource_identities(&current, &new_snapshot)
                    };
                    if changed {
                        *self.snapshot.write().await = new_snapshot;
                        tracing::info!("discovered API surface changed; waking plan refresher");
                        on_mutation();
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "discovery poll failed; retaining last snapshot");
                    attempt = attempt.saturating_add(1);
                    if !backoff_sleep(&lifetime, attempt).await {
                        return;
                    }
                }
            }
        }
    }
}

fn same_resource_identities(a: &DiscoverySnapshot, b: &DiscoverySnapshot) -> bool {
    let mut a_ids: Vec<_> = a.resources.iter().map(|r| (r.gvr(), r.kind.clone())).collect();
    let mut b_ids: Vec<_> = b.resources.iter().map(|r| (r.gvr(), r.kind.clone())).collect();
    a_ids.sort();
    b_ids.sort();
    a_ids == b_ids
}

async fn run_discovery(client: &Client) -> Result<DiscoverySnapshot> {
    let discovery = KubeDiscovery::new(client.clone())
        .run()
        .await
        .map_err(Error::from)?;

    let mut resources = Vec::new();
    for group in discovery.groups() {
        let preferred_version = group.preferred_version_or_guess().to_string();
        for version in group.versions() {
            for (api_resource, caps) in group.versioned_resources(version) {
                let verbs: Vec<String> = ["list", "watch", "get", "create", "update", "delete"]
                    .iter()
                    .filter(|op| caps.supports_operation(op))
                    .map(|op| op.to_string())
                    .collect();
                resources.push(DiscoveredResource {
                    group: api_resource.group.clone(),
                    version: api_resource.version.clone(),
                    resource: api_resource.plural.clone(),
                    kind: api_resource.kind.clone(),
                    namespaced: caps.scope == kube::discovery::Scope::Namespaced,
                    verbs,
                    preferred: version == preferred_version,
                });
            }
        }
    }

    Ok(DiscoverySnapshot { resources })
}
