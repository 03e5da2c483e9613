//! Runner/Monitor: the state machine gating discovery and reconciler
//! start/stop on cluster health. Sole owner of the "currently running"
//! flag and of the handler-stop token, the barrier that stops discovery
//! and every reconciler together.

use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Invoked by the runner on the `Running` edge and on the stop edge.
/// `start` receives the fresh handler-stop token; every reconciler's
/// `start` must be invoked with this exact token.
#[async_trait::async_trait]
pub trait RunnerCallbacks: Send + Sync {
    async fn start(&self, handler_stop: CancellationToken);
    async fn stop(&self);
}

struct Inner {
    state: RunnerState,
    handler_stop: Option<CancellationToken>,
}

/// `start_runner`/`stop_runner` each take the inner lock for their full
/// duration, including the callback. This trades concurrency for a simple
/// guarantee against interleaving: at most one transition is ever in
/// flight, so a rapid health flap is simply serialized rather than raced.
pub struct Runner {
    inner: tokio::sync::Mutex<Inner>,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner { state: RunnerState::Idle, handler_stop: None }),
        }
    }

    pub async fn state(&self) -> RunnerState {
        self.inner.lock().await.state
    }

    /// The handler-stop token currently in effect, if `Running`. Lets a
    /// caller that creates a reconciler mid-run hand it the live token
    /// directly so the new reconciler starts immediately.
    pub async fn current_handler_stop(&self) -> Option<CancellationToken> {
        self.inner.lock().await.handler_stop.clone()
    }

    /// Edge-triggered: a no-op unless the transition actually changes
    /// state, so the caller can invoke this on every health poll without
    /// double-starting.
    pub async fn on_health_change(&self, healthy: bool, callbacks: &dyn RunnerCallbacks) {
        if healthy {
            self.start_runner(callbacks).await;
        } else {
            self.stop_runner(callbacks).await;
        }
    }

    async fn start_runner(&self, callbacks: &dyn RunnerCallbacks) {
        let mut guard = self.inner.lock().await;
        if matches!(guard.state, RunnerState::Running | RunnerState::Starting) {
            return;
        }
        guard.state = RunnerState::Starting;
        let handler_stop = CancellationToken::new();
        guard.handler_stop = Some(handler_stop.clone());
        drop(guard);

        callbacks.start(handler_stop).await;

        let mut guard = self.inner.lock().await;
        guard.state = RunnerState::Running;
    }

    async fn stop_runner(&self, callbacks: &dyn RunnerCallbacks) {
        let mut guard = self.inner.lock().await;
        if matches!(guard.state, RunnerState::Idle | RunnerState::Stopping) {
            return;
        }
        guard.state = RunnerState::Stopping;
        if let Some(token) = guard.handler_stop.take() {
            token.cancel();
        }
        drop(guard);

        callbacks.stop().await;

        let mut guard = self.inner.lock().await;
        guard.state = RunnerState::Idle;
    }

    /// Terminal transition to `Idle`, regardless of current state.
    /// Idempotent: a second call observes `Idle` and is a no-op.
    pub async fn shutdown(&self, callbacks: &dyn RunnerCallbacks) {
        let mut guard = self.inner.lock().await;
        if guard.state == RunnerState::Idle {
            return;
        }
        guard.state = RunnerState::Stopping;
        if let Some(token) = guard.handler_stop.take() {
            token.cancel();
        }
        drop(guard);

        callbacks.stop().await;

        let mut guard = self.inner.lock().await;
        guard.state = RunnerState::Idle;
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingCallbacks {
        starts: AtomicUsize,
        stops: AtomicUsize,
        last_handler_stop: tokio::sync::Mutex<Option<CancellationToken>>,
    }

    #[async_trait::async_trait]
    impl RunnerCallbacks for CountingCallbacks {
        async fn start(&self, handler_stop: CancellationToken) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.last_handler_stop.lock().await = Some(handler_stop);
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn callbacks() -> Arc<CountingCallbacks> {
        Arc::new(CountingCallbacks {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            last_handler_stop: tokio::sync::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn healthy_then_unhealthy_starts_and_stops_exactly_once() {
        let runner = Runner::new();
        let cb = callbacks();
        runner.on_health_change(true, cb.as_ref()).await;
        assert_eq!(runner.state().await, RunnerState::Running);
        runner.on_health_change(false, cb.as_ref()).await;
        assert_eq!(runner.state().await, RunnerState::Idle);
        assert_eq!(cb.starts.load(Ordering::SeqCst), 1);
        assert_eq!(cb.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_healthy_signals_do_not_restart() {
        let runner = Runner::new();
        let cb = callbacks();
        runner.on_health_change(true, cb.as_ref()).await;
        runner.on_health_change(true, cb.as_ref()).await;
        runner.on_health_change(true, cb.as_ref()).await;
        assert_eq!(cb.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rapid_flap_leaves_exactly_one_handler_stop_live() {
        let runner = Runner::new();
        let cb = callbacks();
        runner.on_health_change(true, cb.as_ref()).await;
        let first_token = cb.last_handler_stop.lock().await.clone().unwrap();
        runner.on_health_change(false, cb.as_ref()).await;
        assert!(first_token.is_cancelled());
        runner.on_health_change(true, cb.as_ref()).await;
        let second_token = cb.last_handler_stop.lock().await.clone().unwrap();
        assert!(!second_token.is_cancelled());
        assert_eq!(cb.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let runner = Runner::new();
        let cb = callbacks();
        runner.on_health_change(true, cb.as_ref()).await;
        runner.shutdown(cb.as_ref()).await;
        runner.shutdown(cb.as_ref()).await;
        assert_eq!(cb.stops.load(Ordering::SeqCst), 1);
    }
}
