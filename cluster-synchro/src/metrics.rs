//! Per-reconciler metrics, registered against the process-wide recorder
//! installed by `synchro_common::metrics::install_recorder_once`.

use metrics::{counter, gauge, histogram};
use synchro_types::GroupVersionResource;

/// Thin label-carrying handle; cheap to construct per reconciler since the
/// underlying recorder interns label sets.
#[derive(Clone, Debug)]
pub struct ReconcilerMetrics {
    cluster: String,
    gvr: String,
}

impl ReconcilerMetrics {
    pub fn new(cluster: &str, storage_gvr: &GroupVersionResource) -> Self {
        Self {
            cluster: cluster.to_string(),
            gvr: storage_gvr.to_string(),
        }
    }

    pub fn object_persisted(&self) {
        counter!("synchro_objects_persisted_total", "cluster" => self.cluster.clone(), "gvr" => self.gvr.clone())
            .increment(1);
    }

    pub fn object_deleted(&self) {
        counter!("synchro_objects_deleted_total", "cluster" => self.cluster.clone(), "gvr" => self.gvr.clone())
            .increment(1);
    }

    pub fn persistence_error(&self, recoverable: bool) {
        counter!(
            "synchro_persistence_errors_total",
            "cluster" => self.cluster.clone(),
            "gvr" => self.gvr.clone(),
            "recoverable" => recoverable.to_string(),
        )
        .increment(1);
    }

    pub fn watermarks_tracked(&self, count: usize) {
        gauge!("synchro_watermarks_tracked", "cluster" => self.cluster.clone(), "gvr" => self.gvr.clone())
            .set(count as f64);
    }

    pub fn list_duration(&self, seconds: f64) {
        histogram!("synchro_initial_list_duration_seconds", "cluster" => self.cluster.clone(), "gvr" => self.gvr.clone())
            .record(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_does_not_require_a_recorder() {
        let metrics = ReconcilerMetrics::new("c1", &GroupVersionResource::new("apps", "v1", "deployments"));
        assert_eq!(metrics.cluster, "c1");
        assert_eq!(metrics.gvr, "apps/v1/deployments");
    }
}
