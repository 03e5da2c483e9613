//! Tunables for a `ClusterSynchro`, exposed as a [`clap::Args`] struct so a
//! hosting binary can flatten it into its own CLI the way
//! `eosin_common::args::{RateLimiterArgs, PostgresArgs}` compose into
//! larger arg structs.

use std::time::Duration;

const DEFAULT_TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TCP_PROBE_KEEPALIVE: Duration = Duration::from_secs(30);

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}

#[derive(Clone, Debug, clap::Args)]
pub struct SynchroConfig {
    /// Page size hint for the initial list phase of every reconciler.
    #[arg(long, env = "PAGE_SIZE_FOR_RESOURCE_SYNC", default_value_t = 500)]
    pub page_size_for_resource_sync: i64,

    /// Use a dedicated TCP dialer (30s timeout, 30s keep-alive) for the
    /// health checker instead of reusing the discovery client's transport.
    #[arg(long, env = "HEALTH_CHECKER_STANDALONE_TCP")]
    pub health_checker_standalone_tcp: bool,

    /// How often the discovery component polls the upstream API surface.
    #[arg(long, env = "DISCOVERY_POLL_INTERVAL", value_parser = parse_duration_secs, default_value = "30")]
    pub discovery_poll_interval: Duration,

    /// How often the health checker probes cluster reachability.
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", value_parser = parse_duration_secs, default_value = "15")]
    pub health_check_interval: Duration,

    /// Minimum spacing between consecutive plan refreshes, so a burst of
    /// discovery mutations coalesces into one refresh.
    #[arg(long, env = "PLAN_REFRESH_DEBOUNCE", value_parser = parse_duration_secs, default_value = "2")]
    pub plan_refresh_debounce: Duration,

    /// Upper bound for a reconciler's persistence-retry backoff.
    #[arg(long, env = "RESOURCE_BACKOFF_CAP", value_parser = parse_duration_secs, default_value = "30")]
    pub resource_backoff_cap: Duration,
}

impl SynchroConfig {
    pub fn tcp_probe_timeout(&self) -> Duration {
        DEFAULT_TCP_PROBE_TIMEOUT
    }

    pub fn tcp_probe_keepalive(&self) -> Duration {
        DEFAULT_TCP_PROBE_KEEPALIVE
    }
}

impl Default for SynchroConfig {
    fn default() -> Self {
        Self {
            page_size_for_resource_sync: 500,
            health_checker_standalone_tcp: false,
            discovery_poll_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(15),
            plan_refresh_debounce: Duration::from_secs(2),
            resource_backoff_cap: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tcp_probe_constants() {
        let cfg = SynchroConfig::default();
        assert_eq!(cfg.tcp_probe_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.tcp_probe_keepalive(), Duration::from_secs(30));
    }
}
