use std::sync::OnceLock;

use metrics_exporter_prometheus::PrometheusHandle;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder exactly once per process,
/// regardless of how many times it is called or from how many cluster
/// synchros.
pub fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Renders the current metrics snapshot in Prometheus text exposition
/// format. The hosting service owns the HTTP endpoint that serves this.
pub fn render() -> String {
    install_recorder_once().render()
}
