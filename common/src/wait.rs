use std::time::Duration;

use tokio_util::sync::CancellationToken;

const DEFAULT_CAP: Duration = Duration::from_secs(30);
const DEFAULT_BASE: Duration = Duration::from_millis(250);

/// Exponential backoff w/ "full jitter": a random duration in
/// `[0, min(cap, base * 2^attempt)]`. Behaves well under contention and
/// avoids lockstep retries across many reconcilers backing off at once.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 { u64::MAX } else { 1u64 << attempt };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Sleeps for one backoff attempt, honoring the default base/cap used by
/// the reconciler's persistence retry loop and the health checker's probe
/// loop. Returns `false` if the lifetime signal was cancelled first, so
/// callers can break out of their retry loop immediately.
pub async fn backoff_sleep(cancel: &CancellationToken, attempt: u32) -> bool {
    backoff_sleep_capped(cancel, attempt, DEFAULT_CAP).await
}

pub async fn backoff_sleep_capped(cancel: &CancellationToken, attempt: u32, cap: Duration) -> bool {
    let delay = backoff_full_jitter(DEFAULT_BASE, cap, attempt);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
