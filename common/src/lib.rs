//! Ambient stack shared by the `cluster-synchro` core: error handling,
//! shutdown/cancellation, backoff-with-jitter waiting, and metrics
//! registration. No business logic lives here.

pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod wait;

pub use error::{Error, ErrorClass, Result};

/// Installs the process-wide tracing subscriber. Idempotent: safe to call
/// from multiple entry points (tests, examples, the hosting binary).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
