use tokio_util::sync::CancellationToken;

/// Resolves when SIGINT or SIGTERM is received (Ctrl+C locally, pod
/// termination under Kubernetes).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => tracing::warn!("received SIGINT"),
            _ = sigterm.recv() => tracing::warn!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        tracing::warn!("received Ctrl+C");
    }
}

/// A one-shot broadcast closed when its owner begins shutting down. Every
/// long-running worker holds a clone and exits only by observing it
/// cancelled.
///
/// This is a thin, documented wrapper over [`CancellationToken`] rather
/// than a bespoke primitive, matching how `storage-operator` wires its own
/// shutdown plumbing in `clusters::reconcile::run`.
#[derive(Clone, Debug)]
pub struct LifetimeSignal(CancellationToken);

impl LifetimeSignal {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A signal tied to this one's lifetime: cancelling the parent
    /// cancels every child, but a child can be cancelled independently
    /// (used to give each reconciler its own stop signal under the
    /// runner's umbrella signal).
    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// The underlying token, for handing to APIs (kube-runtime watchers,
    /// `tokio::select!` arms) that expect a bare `CancellationToken`.
    pub fn token(&self) -> CancellationToken {
        self.0.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

impl Default for LifetimeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_signal_observes_parent_cancellation() {
        let parent = LifetimeSignal::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancellation_does_not_propagate_upward() {
        let parent = LifetimeSignal::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
