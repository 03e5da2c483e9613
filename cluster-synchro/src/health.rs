//! Health Checker: periodically probes cluster reachability over TCP and
//! publishes a condition atomically, with a subscribe channel that emits
//! on every transition.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

pub struct HealthChecker {
    target: SocketAddr,
    interval: Duration,
    timeout: Duration,
    keepalive: Duration,
    standalone_tcp: bool,
    tx: watch::Sender<HealthState>,
}

impl HealthChecker {
    pub fn new(
        target: SocketAddr,
        interval: Duration,
        timeout: Duration,
        keepalive: Duration,
        standalone_tcp: bool,
    ) -> (Self, watch::Receiver<HealthState>) {
        let (tx, rx) = watch::channel(HealthState::Unhealthy { reason: "not yet probed".into() });
        (
            Self { target, interval, timeout, keepalive, standalone_tcp, tx },
            rx,
        )
    }

    /// Probe loop; exits when `lifetime` is cancelled. Every transition is
    /// published on the watch channel — a steady healthy/unhealthy run
    /// does not re-publish.
    pub async fn run(&self, lifetime: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let observed = self.probe().await;
            let changed = *self.tx.borrow() != observed;
            if changed {
                tracing::info!(healthy = observed.is_healthy(), "cluster health transition");
                let _ = self.tx.send(observed);
            }
        }
    }

    async fn probe(&self) -> HealthState {
        type ConnectFuture<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<TcpStream>> + Send + 'a>>;

        let connect: ConnectFuture<'_> = if self.standalone_tcp {
            self.connect_with_keepalive()
        } else {
            let target = self.target;
            Box::pin(async move { TcpStream::connect(target).await })
        };

        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => HealthState::Healthy,
            Ok(Err(err)) => HealthState::Unhealthy { reason: err.to_string() },
            Err(_) => HealthState::Unhealthy { reason: "probe timed out".to_string() },
        }
    }

    fn connect_with_keepalive(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<TcpStream>> + Send + '_>> {
        Box::pin(async move {
            let domain = if self.target.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
            let socket = Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
            socket.set_nonblocking(true)?;
            socket.set_keepalive(true)?;
            let ka = TcpKeepalive::new().with_time(self.keepalive);
            socket.set_tcp_keepalive(&ka)?;
            match socket.connect(&self.target.into()) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc_einprogress()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            TcpStream::from_std(socket.into())
        })
    }
}

#[cfg(unix)]
fn libc_einprogress() -> i32 {
    // EINPROGRESS, stable across the unix targets this crate supports.
    115
}

#[cfg(not(unix))]
fn libc_einprogress() -> i32 {
    i32::MIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probing_an_unbound_port_reports_unhealthy() {
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (checker, rx) = HealthChecker::new(target, Duration::from_millis(10), Duration::from_millis(200), Duration::from_secs(30), false);
        let state = checker.probe().await;
        assert!(!state.is_healthy());
        drop(rx);
    }

    #[tokio::test]
    async fn probing_a_listening_port_reports_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });
        let (checker, rx) = HealthChecker::new(addr, Duration::from_millis(10), Duration::from_millis(500), Duration::from_secs(30), false);
        let state = checker.probe().await;
        assert!(state.is_healthy());
        drop(rx);
    }

    #[tokio::test]
    async fn watch_channel_only_publishes_on_transition() {
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (checker, mut rx) = HealthChecker::new(target, Duration::from_millis(5), Duration::from_millis(20), Duration::from_secs(30), false);
        let lifetime = CancellationToken::new();
        let lifetime_for_run = lifetime.clone();
        let handle = tokio::spawn(async move { checker.run(lifetime_for_run).await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        lifetime.cancel();
        handle.await.unwrap();
        assert!(!rx.borrow_and_update().is_healthy());
    }
}
